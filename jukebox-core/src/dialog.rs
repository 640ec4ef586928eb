//! Dialog collaborator
//!
//! The host UI supplies the save/load prompts; the core awaits their
//! result and proceeds only when the user confirmed.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DialogError {
    #[error("Dialog unavailable: {0}")]
    Unavailable(String),
}

/// What the user answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogResult {
    pub confirmed: bool,
    pub queue_name: String,
}

impl DialogResult {
    pub fn confirmed(queue_name: impl Into<String>) -> Self {
        Self {
            confirmed: true,
            queue_name: queue_name.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            confirmed: false,
            queue_name: String::new(),
        }
    }
}

/// Prompt for the name to save the current queue under
#[async_trait]
pub trait QueueNamePrompt: Send + Sync {
    /// `suggested` pre-fills the input
    async fn prompt_queue_name(&self, suggested: &str) -> Result<DialogResult, DialogError>;
}

/// Prompt that always answers with a fixed result
pub struct FixedPrompt(pub DialogResult);

#[async_trait]
impl QueueNamePrompt for FixedPrompt {
    async fn prompt_queue_name(&self, _suggested: &str) -> Result<DialogResult, DialogError> {
        Ok(self.0.clone())
    }
}
