//! Named queue library
//!
//! Saved queues live in memory and, when a directory is configured, in a
//! single JSON file inside it that is rewritten after every change. A change
//! only takes effect in memory once it is on disk.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::QueueError;
use crate::state::{current_time_ms, index_or_none, QueueItem, QueueState};

const LIBRARY_FILE: &str = "saved_queues.json";

/// A queue stored under a name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedQueue {
    pub name: String,
    pub items: Vec<QueueItem>,
    /// `-1` when nothing was selected, as in the live queue
    #[serde(default, with = "index_or_none")]
    pub current_index: Option<usize>,
    /// ms since epoch
    pub saved_at: u64,
}

impl SavedQueue {
    pub fn to_queue(&self) -> QueueState {
        QueueState {
            items: self.items.clone(),
            current_index: self.current_index.filter(|&i| i < self.items.len()),
        }
    }
}

pub struct QueueLibrary {
    file: Option<PathBuf>,
    queues: RwLock<BTreeMap<String, SavedQueue>>,
}

impl QueueLibrary {
    /// Library that forgets everything when dropped
    pub fn in_memory() -> Self {
        Self {
            file: None,
            queues: RwLock::new(BTreeMap::new()),
        }
    }

    /// Open (or start) the library stored in `dir`
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, QueueError> {
        let file = dir.as_ref().join(LIBRARY_FILE);
        let queues = if file.exists() {
            let raw = fs::read(&file)?;
            let list: Vec<SavedQueue> = serde_json::from_slice(&raw)?;
            list.into_iter().map(|q| (q.name.clone(), q)).collect()
        } else {
            BTreeMap::new()
        };

        info!("Opened queue library at {} ({} queues)", file.display(), queues.len());
        Ok(Self {
            file: Some(file),
            queues: RwLock::new(queues),
        })
    }

    /// Store `queue` under `name`. Names are trimmed, must be non-empty and
    /// must not already be taken.
    pub fn save(&self, name: &str, queue: &QueueState) -> Result<SavedQueue, QueueError> {
        let name = validate_name(name)?;
        let mut queues = self.queues.write();
        if queues.contains_key(&name) {
            return Err(QueueError::NameTaken(name));
        }

        let saved = SavedQueue {
            name: name.clone(),
            items: queue.items.clone(),
            current_index: queue.current_index,
            saved_at: current_time_ms(),
        };
        let mut next = queues.clone();
        next.insert(name, saved.clone());
        self.persist(&next)?;
        *queues = next;
        debug!("Saved queue '{}' with {} items", saved.name, saved.items.len());
        Ok(saved)
    }

    pub fn get(&self, name: &str) -> Result<SavedQueue, QueueError> {
        let name = validate_name(name)?;
        self.queues
            .read()
            .get(&name)
            .cloned()
            .ok_or(QueueError::UnknownQueue(name))
    }

    /// Saved names in alphabetical order
    pub fn names(&self) -> Vec<String> {
        self.queues.read().keys().cloned().collect()
    }

    pub fn delete(&self, name: &str) -> Result<(), QueueError> {
        let name = validate_name(name)?;
        let mut queues = self.queues.write();
        let mut next = queues.clone();
        if next.remove(&name).is_none() {
            return Err(QueueError::UnknownQueue(name));
        }
        self.persist(&next)?;
        *queues = next;
        Ok(())
    }

    fn persist(&self, queues: &BTreeMap<String, SavedQueue>) -> Result<(), QueueError> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        if let Some(dir) = file.parent() {
            fs::create_dir_all(dir)?;
        }
        let list: Vec<&SavedQueue> = queues.values().collect();
        fs::write(file, serde_json::to_vec_pretty(&list)?)?;
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<String, QueueError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(QueueError::EmptyName);
    }
    Ok(name.to_string())
}
