//! Session State Store
//!
//! Single owner of a peer's [`SessionState`]. Every mutation, local or
//! remote, funnels through [`StateStore::transact`], which applies it
//! atomically and emits one `stateChanged` notification listing the
//! top-level sections that actually changed.

use std::convert::Infallible;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::model::{PlayerState, QueueState, SessionSection, SessionState};
use crate::bus::{MessageBus, Outbox, StateChanged};

/// Top-level section names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Section {
    Session,
    Queue,
    Player,
}

/// A partial state: any subset of the top-level sections.
///
/// Used both as the input patch of [`StateStore::apply`] and as the payload
/// of change notifications (the changed sections with their new values).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player: Option<PlayerState>,
}

/// Changed sections carried by `stateChanged`
pub type StateChanges = StatePatch;

impl StatePatch {
    /// Sections present in `after` that differ from `before`
    pub fn between(before: &SessionState, after: &SessionState) -> Self {
        Self {
            session: (before.session != after.session).then(|| after.session.clone()),
            queue: (before.queue != after.queue).then(|| after.queue.clone()),
            player: (before.player != after.player).then(|| after.player.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.session.is_none() && self.queue.is_none() && self.player.is_none()
    }

    /// Names of the sections present
    pub fn sections(&self) -> Vec<Section> {
        let mut sections = Vec::with_capacity(3);
        if self.session.is_some() {
            sections.push(Section::Session);
        }
        if self.queue.is_some() {
            sections.push(Section::Queue);
        }
        if self.player.is_some() {
            sections.push(Section::Player);
        }
        sections
    }

    fn apply_to(self, state: &mut SessionState) {
        if let Some(session) = self.session {
            state.session = session;
        }
        if let Some(queue) = self.queue {
            state.queue = queue;
        }
        if let Some(player) = self.player {
            state.player = player;
        }
    }
}

/// Mutex-guarded session state with change notification
pub struct StateStore {
    state: Mutex<SessionState>,
    bus: Arc<MessageBus>,
}

impl StateStore {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self {
            state: Mutex::new(SessionState::default()),
            bus,
        }
    }

    /// Get a copy of the current state
    pub fn snapshot(&self) -> SessionState {
        self.state.lock().clone()
    }

    /// Read from the current state without copying it
    pub fn read<R>(&self, f: impl FnOnce(&SessionState) -> R) -> R {
        f(&self.state.lock())
    }

    /// Apply a mutation atomically.
    ///
    /// `f` works on a draft; nothing is committed (and nothing in the outbox
    /// is published) if it returns an error. On success the draft replaces
    /// the state, a `stateChanged` is queued when any section differs, the
    /// outbox is queued behind it, and the bus is drained once the lock is
    /// released.
    pub fn transact<R, E>(
        &self,
        f: impl FnOnce(&mut SessionState, &mut Outbox) -> Result<R, E>,
    ) -> Result<R, E> {
        let value = {
            let mut state = self.state.lock();
            let mut draft = state.clone();
            let mut outbox = Outbox::default();

            let value = f(&mut draft, &mut outbox)?;

            let changes = StatePatch::between(&state, &draft);
            *state = draft;

            if !changes.is_empty() {
                debug!("State changed: {:?}", changes.sections());
                self.bus.enqueue(StateChanged { changes });
            }
            self.bus.enqueue_outbox(outbox);
            value
        };

        self.bus.drain();
        Ok(value)
    }

    /// Apply an infallible mutation
    pub fn update<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        match self.transact::<R, Infallible>(|state, _| Ok(f(state))) {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Apply an infallible mutation that also publishes
    pub fn update_with<R>(&self, f: impl FnOnce(&mut SessionState, &mut Outbox) -> R) -> R {
        match self.transact::<R, Infallible>(|state, outbox| Ok(f(state, outbox))) {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Replace whole sections. Returns the sections that changed.
    pub fn apply(&self, patch: StatePatch) -> StateChanges {
        self.update(|state| {
            let before = state.clone();
            patch.apply_to(state);
            StatePatch::between(&before, state)
        })
    }

    /// Return every section to its default
    pub fn reset(&self) -> StateChanges {
        self.apply(StatePatch {
            session: Some(SessionSection::default()),
            queue: Some(QueueState::default()),
            player: Some(PlayerState::default()),
        })
    }
}
