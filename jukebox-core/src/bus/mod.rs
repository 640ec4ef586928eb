//! Message Bus
//!
//! Typed publish/subscribe between the components of one peer, and the
//! relay that carries session-wide topics to every other peer.
//!
//! Each topic is a payload type implementing [`Topic`]; its name and scope
//! are fixed at compile time. Deliveries are queued and dispatched FIFO by
//! whichever caller drains the queue, so handlers never run re-entrantly
//! and a publisher never waits for them.

mod hub;
mod topics;

pub use hub::LocalHub;
pub use topics::*;

use std::any::{Any, TypeId};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised while relaying to other peers
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Relay unavailable: {0}")]
    Relay(String),

    #[error("Failed to encode or decode envelope: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Where a topic is delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Only the publishing peer's own subscribers
    Local,
    /// The publishing peer and every connected peer
    Relayed,
}

/// A topic: the payload type, its event name and its scope
pub trait Topic: Clone + Send + Sync + 'static {
    const NAME: &'static str;
    const SCOPE: Scope;

    /// Wire form for relayed topics, `None` for local ones
    fn into_wire(self) -> Option<WireEvent>;
}

/// One delivery of a topic payload to a handler
#[derive(Debug, Clone)]
pub struct Delivery<T> {
    /// User id of the publishing peer
    pub from: String,
    /// Whether the publisher is this peer
    pub local: bool,
    pub payload: T,
}

/// A relayed event with its sender, as it travels between peers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub from: String,
    pub event: WireEvent,
}

/// Outbound side of the transport connecting peers
pub trait Relay: Send + Sync {
    fn relay(&self, envelope: Envelope) -> Result<(), BusError>;
}

pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

type Handler<T> = Arc<dyn Fn(&Delivery<T>) -> HandlerResult + Send + Sync>;
type Job = Box<dyn FnOnce(&MessageBus) + Send>;

#[derive(Default)]
struct DispatchQueue {
    pending: VecDeque<Job>,
    draining: bool,
}

/// Publications collected inside a state transaction and queued only if
/// it commits
#[derive(Default)]
pub struct Outbox {
    jobs: Vec<Job>,
}

impl Outbox {
    pub fn publish<T: Topic>(&mut self, payload: T) {
        self.jobs.push(MessageBus::publish_job(payload));
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Per-peer bus
pub struct MessageBus {
    local_user: String,
    handlers: RwLock<HashMap<TypeId, Vec<Arc<dyn Any + Send + Sync>>>>,
    dispatch: Mutex<DispatchQueue>,
    relay: RwLock<Option<Arc<dyn Relay>>>,
}

impl MessageBus {
    pub fn new(local_user: impl Into<String>) -> Self {
        Self {
            local_user: local_user.into(),
            handlers: RwLock::new(HashMap::new()),
            dispatch: Mutex::new(DispatchQueue::default()),
            relay: RwLock::new(None),
        }
    }

    /// User id stamped on everything this bus publishes
    pub fn local_user(&self) -> &str {
        &self.local_user
    }

    /// Attach the transport used for relayed topics
    pub fn set_relay(&self, relay: Arc<dyn Relay>) {
        *self.relay.write() = Some(relay);
    }

    /// Detach the transport; relayed topics become local until reattached
    pub fn clear_relay(&self) {
        *self.relay.write() = None;
    }

    /// Register a handler. Handlers of one topic run in registration order.
    pub fn subscribe<T, F>(&self, handler: F)
    where
        T: Topic,
        F: Fn(&Delivery<T>) -> HandlerResult + Send + Sync + 'static,
    {
        let handler: Handler<T> = Arc::new(handler);
        self.handlers
            .write()
            .entry(TypeId::of::<T>())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Register a handler that borrows `owner` for as long as it is alive.
    ///
    /// The bus holds only a weak reference, so components that own the bus
    /// through their context do not keep themselves alive.
    pub fn subscribe_with<T, S, F>(&self, owner: &Arc<S>, handler: F)
    where
        T: Topic,
        S: Send + Sync + 'static,
        F: Fn(&S, &Delivery<T>) -> HandlerResult + Send + Sync + 'static,
    {
        let owner = Arc::downgrade(owner);
        self.subscribe::<T, _>(move |delivery| match owner.upgrade() {
            Some(owner) => handler(&owner, delivery),
            None => Ok(()),
        });
    }

    /// Publish a payload: relayed topics go to every peer, and local
    /// subscribers always receive it. Returns without waiting for handlers.
    pub fn publish<T: Topic>(&self, payload: T) {
        self.enqueue(payload);
        self.drain();
    }

    /// Accept an envelope from another peer
    pub fn receive(&self, envelope: Envelope) {
        if envelope.from == self.local_user {
            return;
        }
        debug!("Received {} from {}", envelope.event.name(), envelope.from);
        envelope.event.deliver(self, envelope.from);
        self.drain();
    }

    /// Queue a publication without dispatching it
    pub(crate) fn enqueue<T: Topic>(&self, payload: T) {
        self.dispatch.lock().pending.push_back(Self::publish_job(payload));
    }

    pub(crate) fn enqueue_outbox(&self, outbox: Outbox) {
        if outbox.jobs.is_empty() {
            return;
        }
        self.dispatch.lock().pending.extend(outbox.jobs);
    }

    /// Queue an inbound payload for local subscribers only
    pub(crate) fn enqueue_remote<T: Topic>(&self, from: String, payload: T) {
        let job: Job = Box::new(move |bus: &MessageBus| {
            bus.invoke(&Delivery {
                from,
                local: false,
                payload,
            })
        });
        self.dispatch.lock().pending.push_back(job);
    }

    /// Run queued jobs until the queue is empty. If another caller is
    /// already draining, it will pick up whatever was queued.
    pub(crate) fn drain(&self) {
        {
            let mut queue = self.dispatch.lock();
            if queue.draining {
                return;
            }
            queue.draining = true;
        }

        let mut guard = DrainGuard {
            queue: &self.dispatch,
            armed: true,
        };

        loop {
            let job = {
                let mut queue = self.dispatch.lock();
                match queue.pending.pop_front() {
                    Some(job) => job,
                    None => {
                        queue.draining = false;
                        guard.armed = false;
                        return;
                    }
                }
            };
            job(self);
        }
    }

    fn publish_job<T: Topic>(payload: T) -> Job {
        Box::new(move |bus: &MessageBus| {
            if T::SCOPE == Scope::Relayed {
                bus.relay_out(payload.clone());
            }
            bus.invoke(&Delivery {
                from: bus.local_user.clone(),
                local: true,
                payload,
            });
        })
    }

    fn relay_out<T: Topic>(&self, payload: T) {
        let relay = self.relay.read().clone();
        let (Some(relay), Some(event)) = (relay, payload.into_wire()) else {
            return;
        };
        let envelope = Envelope {
            from: self.local_user.clone(),
            event,
        };
        // Dropped messages are recovered by the next heartbeat or reconciliation
        if let Err(e) = relay.relay(envelope) {
            warn!("Failed to relay {}: {}", T::NAME, e);
        }
    }

    fn invoke<T: Topic>(&self, delivery: &Delivery<T>) {
        let handlers: Vec<Handler<T>> = self
            .handlers
            .read()
            .get(&TypeId::of::<T>())
            .map(|list| {
                list.iter()
                    .filter_map(|h| h.downcast_ref::<Handler<T>>().cloned())
                    .collect()
            })
            .unwrap_or_default();

        for (index, handler) in handlers.iter().enumerate() {
            if let Err(e) = handler(delivery) {
                warn!(
                    topic = T::NAME,
                    handler = index,
                    from = %delivery.from,
                    "Handler failed: {}",
                    e
                );
            }
        }
    }
}

/// Clears the draining flag if a handler unwinds
struct DrainGuard<'a> {
    queue: &'a Mutex<DispatchQueue>,
    armed: bool,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.queue.lock().draining = false;
        }
    }
}
