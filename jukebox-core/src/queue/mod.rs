//! Queue Manager
//!
//! The shared playlist. Only the DJ mutates it; every mutation is published
//! as the full resulting queue, which followers apply as a wholesale
//! replacement. Followers may propose additions, which the DJ applies.

mod library;
mod list;

pub use library::{QueueLibrary, SavedQueue};

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bus::{
    Delivery, HandlerResult, MemberHeartbeat, Outbox, QueueNext, QueueProposal, QueueUpdated,
};
use crate::dialog::{DialogError, QueueNamePrompt};
use crate::peer::PeerContext;
use crate::state::{current_time_ms, QueueItem, QueueState, SessionState};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Item {0} is already in the queue")]
    DuplicateItem(String),

    #[error("Item {0} is not in the queue")]
    UnknownItem(String),

    #[error("Position {0} is out of range")]
    InvalidPosition(usize),

    #[error("Only the DJ can change the queue")]
    NotDj,

    #[error("There is no DJ to propose to")]
    NoDj,

    #[error("Queue name cannot be empty")]
    EmptyName,

    #[error("A queue named '{0}' already exists")]
    NameTaken(String),

    #[error("No saved queue named '{0}'")]
    UnknownQueue(String),

    #[error("Library storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Library format error: {0}")]
    Format(#[from] serde_json::Error),

    #[error(transparent)]
    Dialog(#[from] DialogError),
}

/// How an add was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Appended by the DJ and published
    Added,
    /// Sent to the DJ as a proposal
    Proposed,
}

pub struct QueueManager {
    ctx: PeerContext,
    library: RwLock<Arc<QueueLibrary>>,
}

impl QueueManager {
    pub fn new(ctx: PeerContext, library: Arc<QueueLibrary>) -> Arc<Self> {
        let manager = Arc::new(Self {
            ctx,
            library: RwLock::new(library),
        });

        let bus = &manager.ctx.bus;
        bus.subscribe_with(&manager, Self::on_queue_updated);
        bus.subscribe_with(&manager, Self::on_queue_proposal);
        bus.subscribe_with(&manager, Self::on_member_heartbeat);
        manager
    }

    /// Swap the saved-queue library
    pub fn set_library(&self, library: Arc<QueueLibrary>) {
        *self.library.write() = library;
    }

    pub fn snapshot(&self) -> QueueState {
        self.ctx.store.read(|s| s.queue.clone())
    }

    /// Add an item. The DJ appends it; anyone else proposes it to the DJ.
    pub fn add(&self, item: QueueItem) -> Result<AddOutcome, QueueError> {
        let me = self.ctx.user_id();
        self.ctx.store.transact(|state, outbox| {
            if state.session.is_dj(me) {
                state.queue.add(item)?;
                announce(&state.queue, outbox);
                return Ok(AddOutcome::Added);
            }

            if state.session.dj_user_id.is_none() {
                return Err(QueueError::NoDj);
            }
            if state.queue.contains(&item.id) {
                return Err(QueueError::DuplicateItem(item.id));
            }
            outbox.publish(QueueProposal {
                item,
                proposed_by: me.to_string(),
            });
            Ok(AddOutcome::Proposed)
        })
    }

    pub fn remove(&self, id: &str) -> Result<QueueItem, QueueError> {
        self.as_dj(|state, outbox| {
            let removed = state.queue.remove(id)?;
            announce(&state.queue, outbox);
            Ok(removed)
        })
    }

    pub fn reorder(&self, id: &str, new_position: usize) -> Result<(), QueueError> {
        self.as_dj(|state, outbox| {
            state.queue.reorder(id, new_position)?;
            announce(&state.queue, outbox);
            Ok(())
        })
    }

    /// Move to the next item and announce it for loading. Returns `None`
    /// once the queue is exhausted.
    pub fn advance(&self) -> Result<Option<QueueItem>, QueueError> {
        self.as_dj(|state, outbox| {
            let next = state.queue.advance().cloned();
            announce(&state.queue, outbox);
            if let (Some(item), Some(index)) = (&next, state.queue.current_index) {
                announce_next(index, item, outbox);
            }
            Ok(next)
        })
    }

    /// Jump to `index` and announce it for loading
    pub fn select(&self, index: usize) -> Result<QueueItem, QueueError> {
        self.as_dj(|state, outbox| {
            let item = state.queue.select(index)?.clone();
            announce(&state.queue, outbox);
            announce_next(index, &item, outbox);
            Ok(item)
        })
    }

    pub fn clear(&self) -> Result<(), QueueError> {
        self.as_dj(|state, outbox| {
            state.queue.clear();
            announce(&state.queue, outbox);
            Ok(())
        })
    }

    /// Ask the user for a name and save the current queue under it.
    /// Returns `None` if the user cancelled.
    pub async fn save(&self, prompt: &dyn QueueNamePrompt) -> Result<Option<SavedQueue>, QueueError> {
        let suggested = format!("Queue {}", self.library.read().names().len() + 1);
        let answer = prompt.prompt_queue_name(&suggested).await?;
        if !answer.confirmed {
            debug!("Save queue cancelled");
            return Ok(None);
        }
        self.save_as(&answer.queue_name).map(Some)
    }

    pub fn save_as(&self, name: &str) -> Result<SavedQueue, QueueError> {
        let queue = self.snapshot();
        let library = Arc::clone(&self.library.read());
        let saved = library.save(name, &queue)?;
        info!("Saved queue '{}'", saved.name);
        Ok(saved)
    }

    /// Replace the shared queue with a saved one
    pub fn load(&self, name: &str) -> Result<QueueState, QueueError> {
        let library = Arc::clone(&self.library.read());
        let saved = library.get(name)?;

        self.as_dj(|state, outbox| {
            state.queue = dedup(saved.to_queue());
            announce(&state.queue, outbox);
            info!("Loaded queue '{}' ({} items)", saved.name, state.queue.items.len());
            Ok(state.queue.clone())
        })
    }

    pub fn list_saved(&self) -> Vec<String> {
        self.library.read().names()
    }

    pub fn delete_saved(&self, name: &str) -> Result<(), QueueError> {
        let library = Arc::clone(&self.library.read());
        library.delete(name)
    }

    fn as_dj<R>(
        &self,
        f: impl FnOnce(&mut SessionState, &mut Outbox) -> Result<R, QueueError>,
    ) -> Result<R, QueueError> {
        let me = self.ctx.user_id();
        self.ctx.store.transact(|state, outbox| {
            if !state.session.is_dj(me) {
                return Err(QueueError::NotDj);
            }
            f(state, outbox)
        })
    }

    fn on_queue_updated(&self, delivery: &Delivery<QueueUpdated>) -> HandlerResult {
        if delivery.local {
            return Ok(());
        }
        if !self.adopt(&delivery.from, &delivery.payload.queue) {
            warn!("Ignoring queue update from non-DJ {}", delivery.from);
        }
        Ok(())
    }

    /// The DJ's heartbeat carries its queue; a follower that missed an
    /// update catches up here
    fn on_member_heartbeat(&self, delivery: &Delivery<MemberHeartbeat>) -> HandlerResult {
        let Some(queue) = &delivery.payload.queue else {
            return Ok(());
        };
        if delivery.local {
            return Ok(());
        }

        let differs = self.ctx.store.read(|state| state.queue != dedup(queue.clone()));
        if differs && self.adopt(&delivery.from, queue) {
            debug!("Queue resynced from {}'s heartbeat", delivery.from);
        }
        Ok(())
    }

    /// Replace our queue with the one `from` published, if `from` is the
    /// DJ and we are not. Returns false when `from` is not the DJ.
    fn adopt(&self, from: &str, queue: &QueueState) -> bool {
        let me = self.ctx.user_id();
        self.ctx.store.update(|state| {
            if !state.session.is_dj(from) {
                return false;
            }
            if !state.session.is_dj(me) {
                state.queue = dedup(queue.clone());
            }
            true
        })
    }

    fn on_queue_proposal(&self, delivery: &Delivery<QueueProposal>) -> HandlerResult {
        if delivery.local || !self.ctx.is_dj() {
            return Ok(());
        }

        debug!(
            "Applying proposal of {} from {}",
            delivery.payload.item.id, delivery.payload.proposed_by
        );
        self.add(delivery.payload.item.clone())?;
        Ok(())
    }
}

fn announce(queue: &QueueState, outbox: &mut Outbox) {
    outbox.publish(QueueUpdated {
        queue: queue.clone(),
    });
}

fn announce_next(index: usize, item: &QueueItem, outbox: &mut Outbox) {
    outbox.publish(QueueNext {
        next_index: index,
        video_item: item.clone(),
        timestamp: current_time_ms(),
    });
}

/// Drop repeated ids (first one wins) and keep the cursor on its item
fn dedup(mut queue: QueueState) -> QueueState {
    let current_id = queue.current().map(|item| item.id.clone());
    let mut seen = HashSet::new();
    let before = queue.items.len();
    queue.items.retain(|item| seen.insert(item.id.clone()));
    if queue.items.len() != before {
        warn!("Dropped {} duplicate queue items", before - queue.items.len());
    }
    queue.current_index = current_id.and_then(|id| queue.position(&id));
    queue
}
