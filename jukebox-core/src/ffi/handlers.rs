//! Network event handling

use std::collections::HashSet;
use std::sync::Weak;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::network::NetworkEvent;

use super::session::Shared;

/// Feed network events into the session until the network or the
/// session goes away
pub(super) async fn run_event_pump(mut events: mpsc::UnboundedReceiver<NetworkEvent>, shared: Weak<Shared>) {
    let mut session_peers = HashSet::new();
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        handle_network_event(event, &shared, &mut session_peers);
    }
    debug!("Network event pump ended");
}

/// Handle a network event
fn handle_network_event(event: NetworkEvent, shared: &Shared, session_peers: &mut HashSet<String>) {
    match event {
        NetworkEvent::Ready { peer_id } => {
            info!("Network ready with peer ID: {}", peer_id);
        }

        NetworkEvent::Listening { address } => {
            shared.add_listen_address(address);
        }

        NetworkEvent::Message { from, envelope } => match shared.peer() {
            Some(peer) => peer.bus().receive(envelope),
            None => debug!("Dropping {} from {}: not in a session", envelope.event.name(), from),
        },

        NetworkEvent::PeerSubscribed { peer_id } => {
            let first = session_peers.is_empty();
            if !session_peers.insert(peer_id) {
                return;
            }
            if first {
                if let Some(cb) = shared.callback() {
                    cb.on_connected();
                }
            }
            // Our join may have gone out before anyone could hear it
            if let Some(peer) = shared.peer() {
                peer.membership.reannounce();
            }
        }

        NetworkEvent::PeerUnsubscribed { peer_id } => {
            if session_peers.remove(&peer_id) && session_peers.is_empty() {
                info!("No peers left on the session topic");
                if let Some(cb) = shared.callback() {
                    cb.on_disconnected();
                }
            }
        }

        NetworkEvent::Error(e) => {
            warn!("Network error: {}", e);
            shared.report_error(e);
        }
    }
}
