//! In-process relay connecting several buses, used to run many peers in one
//! process (tests, local demos). Envelopes go through their JSON form so the
//! wire contract is exercised exactly as over the network.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use super::{BusError, Envelope, MessageBus, Relay};

#[derive(Default)]
struct HubInner {
    peers: Vec<Weak<MessageBus>>,
    offline: HashSet<String>,
}

/// Shared relay; clone it freely
#[derive(Clone, Default)]
pub struct LocalHub {
    inner: Arc<Mutex<HubInner>>,
}

struct HubLink {
    hub: LocalHub,
    user_id: String,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a bus so it both sends to and receives from the hub
    pub fn connect(&self, bus: &Arc<MessageBus>) {
        self.inner.lock().peers.push(Arc::downgrade(bus));
        bus.set_relay(Arc::new(HubLink {
            hub: self.clone(),
            user_id: bus.local_user().to_string(),
        }));
    }

    /// Drop everything sent by or addressed to `user_id` while offline
    pub fn set_offline(&self, user_id: &str, offline: bool) {
        let mut inner = self.inner.lock();
        if offline {
            inner.offline.insert(user_id.to_string());
        } else {
            inner.offline.remove(user_id);
        }
    }

    fn broadcast(&self, sender: &str, envelope: Envelope) -> Result<(), BusError> {
        let encoded = serde_json::to_vec(&envelope)?;

        let targets: Vec<Arc<MessageBus>> = {
            let mut inner = self.inner.lock();
            inner.peers.retain(|p| p.strong_count() > 0);
            if inner.offline.contains(sender) {
                debug!("Hub dropping {} from offline {}", envelope.event.name(), sender);
                return Ok(());
            }
            inner
                .peers
                .iter()
                .filter_map(Weak::upgrade)
                .filter(|bus| bus.local_user() != sender && !inner.offline.contains(bus.local_user()))
                .collect()
        };

        for bus in targets {
            let envelope: Envelope = serde_json::from_slice(&encoded)?;
            bus.receive(envelope);
        }
        Ok(())
    }
}

impl Relay for HubLink {
    fn relay(&self, envelope: Envelope) -> Result<(), BusError> {
        self.hub.broadcast(&self.user_id, envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Delivery, DjDenied, LocalPlayerCommandEvent, PlayerCommand};

    fn counter<T: crate::bus::Topic>(bus: &MessageBus) -> Arc<Mutex<usize>> {
        let count = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&count);
        bus.subscribe(move |_: &Delivery<T>| {
            *sink.lock() += 1;
            Ok(())
        });
        count
    }

    #[test]
    fn test_relayed_topic_reaches_every_peer_once() {
        let hub = LocalHub::new();
        let a = Arc::new(MessageBus::new("a"));
        let b = Arc::new(MessageBus::new("b"));
        hub.connect(&a);
        hub.connect(&b);

        let on_a = counter::<DjDenied>(&a);
        let on_b = counter::<DjDenied>(&b);

        a.publish(DjDenied { user_id: "x".into() });

        assert_eq!(*on_a.lock(), 1);
        assert_eq!(*on_b.lock(), 1);
    }

    #[test]
    fn test_local_topic_stays_home() {
        let hub = LocalHub::new();
        let a = Arc::new(MessageBus::new("a"));
        let b = Arc::new(MessageBus::new("b"));
        hub.connect(&a);
        hub.connect(&b);

        let on_a = counter::<LocalPlayerCommandEvent>(&a);
        let on_b = counter::<LocalPlayerCommandEvent>(&b);

        a.publish(LocalPlayerCommandEvent(PlayerCommand::Play));

        assert_eq!(*on_a.lock(), 1);
        assert_eq!(*on_b.lock(), 0);
    }

    #[test]
    fn test_offline_peer_misses_messages() {
        let hub = LocalHub::new();
        let a = Arc::new(MessageBus::new("a"));
        let b = Arc::new(MessageBus::new("b"));
        hub.connect(&a);
        hub.connect(&b);
        let on_b = counter::<DjDenied>(&b);

        hub.set_offline("b", true);
        a.publish(DjDenied { user_id: "x".into() });
        hub.set_offline("b", false);
        a.publish(DjDenied { user_id: "y".into() });

        assert_eq!(*on_b.lock(), 1);
    }
}
