//! Local Player
//!
//! The embedded video player each peer drives. The core treats it as a
//! black box behind [`PlayerDriver`] and learns about its transitions from
//! [`PlayerEvent`]s.

mod http;
mod monitor;
mod types;

pub use http::{HttpPlayer, DEFAULT_PORT};
pub use monitor::PlayerMonitor;
pub use types::*;

use async_trait::async_trait;
use thiserror::Error;

use crate::state::PlaybackStatus;

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Player is not running or not reachable")]
    NotReachable,

    #[error("Player is not ready")]
    NotReady,

    #[error("Player error: {0}")]
    Api(String),
}

/// Point-in-time view of the local player
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlayerStatus {
    pub is_ready: bool,
    pub state: PlaybackStatus,
    pub video_id: Option<String>,
    /// Seconds
    pub current_time: f64,
    /// Seconds
    pub duration: f64,
}

/// Transitions reported by the local player
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    Ready,
    StateChanged(PlaybackStatus),
    Ended,
}

/// Transport operations on the local player
#[async_trait]
pub trait PlayerDriver: Send + Sync {
    async fn load(&self, video_id: &str, start_seconds: Option<f64>) -> Result<(), PlayerError>;

    async fn play(&self) -> Result<(), PlayerError>;

    async fn pause(&self) -> Result<(), PlayerError>;

    async fn seek(&self, seconds: f64) -> Result<(), PlayerError>;

    async fn status(&self) -> Result<PlayerStatus, PlayerError>;

    /// Playback position in seconds
    async fn current_time(&self) -> Result<f64, PlayerError> {
        Ok(self.status().await?.current_time)
    }

    /// Length of the loaded video in seconds
    async fn duration(&self) -> Result<f64, PlayerError> {
        Ok(self.status().await?.duration)
    }
}
