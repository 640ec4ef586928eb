//! libp2p Network Behaviour
//!
//! Carries bus envelopes between the peers of a session:
//! - TCP + QUIC transports, noise encryption, yamux multiplexing
//! - mDNS for local network discovery (optional)
//! - explicit dialing for everything else
//! - gossipsub on the session topic for the envelopes themselves

use std::collections::HashSet;
use std::time::Duration;

use futures::StreamExt;
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::{
    gossipsub, identify, identity, mdns, noise, ping, swarm::NetworkBehaviour, swarm::SwarmEvent,
    tcp, yamux, Multiaddr, PeerId, Swarm,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::SessionCode;
use crate::bus::{BusError, Envelope, Relay};

/// Network configuration
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Discover peers on the local network via mDNS
    pub enable_mdns: bool,
    /// Multiaddrs dialed as soon as the swarm is up
    pub peers: Vec<String>,
    /// How long an idle connection is kept open
    pub idle_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            enable_mdns: true,
            peers: Vec::new(),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Network-related errors
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Failed to create transport: {0}")]
    Transport(String),

    #[error("Invalid session code: {0}")]
    InvalidCode(String),

    #[error("Invalid address {0}: {1}")]
    InvalidAddress(String, String),

    #[error("Already in a session")]
    AlreadyInSession,

    #[error("Not in a session")]
    NotInSession,

    #[error("Failed to encode envelope: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("libp2p error: {0}")]
    Libp2p(String),

    #[error("Network task closed")]
    Closed,
}

#[derive(NetworkBehaviour)]
pub struct JukeboxBehaviour {
    /// Keeps connections alive
    ping: ping::Behaviour,
    mdns: Toggle<mdns::tokio::Behaviour>,
    identify: identify::Behaviour,
    /// Session envelopes
    gossipsub: gossipsub::Behaviour,
}

/// Events emitted by the network task
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// Swarm is up
    Ready { peer_id: String },
    /// New address others can dial
    Listening { address: String },
    /// Envelope published by another peer of the session
    Message { from: String, envelope: Envelope },
    /// A peer subscribed to the session topic
    PeerSubscribed { peer_id: String },
    /// A peer unsubscribed from the session topic
    PeerUnsubscribed { peer_id: String },
    Error(String),
}

#[derive(Debug)]
enum NetworkCommand {
    JoinSession { code: SessionCode },
    LeaveSession,
    Broadcast { envelope: Envelope },
    DialPeer { address: Multiaddr },
    Shutdown,
}

/// Handle to the running network task
#[derive(Clone)]
pub struct NetworkHandle {
    command_tx: mpsc::UnboundedSender<NetworkCommand>,
    pub local_peer_id: String,
}

impl NetworkHandle {
    fn send(&self, command: NetworkCommand) -> Result<(), NetworkError> {
        self.command_tx.send(command).map_err(|_| NetworkError::Closed)
    }

    pub fn join_session(&self, code: &SessionCode) -> Result<(), NetworkError> {
        self.send(NetworkCommand::JoinSession { code: code.clone() })
    }

    pub fn leave_session(&self) -> Result<(), NetworkError> {
        self.send(NetworkCommand::LeaveSession)
    }

    pub fn broadcast(&self, envelope: Envelope) -> Result<(), NetworkError> {
        self.send(NetworkCommand::Broadcast { envelope })
    }

    pub fn dial_peer(&self, address: &str) -> Result<(), NetworkError> {
        let address = address
            .parse::<Multiaddr>()
            .map_err(|e| NetworkError::InvalidAddress(address.to_string(), e.to_string()))?;
        self.send(NetworkCommand::DialPeer { address })
    }

    pub fn shutdown(&self) {
        let _ = self.command_tx.send(NetworkCommand::Shutdown);
    }
}

impl Relay for NetworkHandle {
    fn relay(&self, envelope: Envelope) -> Result<(), BusError> {
        self.broadcast(envelope).map_err(|e| BusError::Relay(e.to_string()))
    }
}

/// Owns the swarm; runs in a background task once started
pub struct NetworkManager {
    local_peer_id: PeerId,
    keypair: identity::Keypair,
    config: NetworkConfig,
    session_topic: Option<gossipsub::IdentTopic>,
    /// Peers subscribed to the session topic
    session_peers: HashSet<PeerId>,
}

impl NetworkManager {
    pub fn new(config: NetworkConfig) -> Self {
        let keypair = identity::Keypair::generate_ed25519();
        let local_peer_id = PeerId::from(keypair.public());
        info!("Local peer ID: {}", local_peer_id);

        Self {
            local_peer_id,
            keypair,
            config,
            session_topic: None,
            session_peers: HashSet::new(),
        }
    }

    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }

    /// Spawn the network task. Must be called within a tokio runtime.
    pub fn start(self) -> Result<(NetworkHandle, mpsc::UnboundedReceiver<NetworkEvent>), NetworkError> {
        let swarm = self.create_swarm()?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let handle = NetworkHandle {
            command_tx,
            local_peer_id: self.local_peer_id.to_string(),
        };

        tokio::spawn(async move {
            self.run(swarm, event_tx, command_rx).await;
        });

        Ok((handle, event_rx))
    }

    fn create_swarm(&self) -> Result<Swarm<JukeboxBehaviour>, NetworkError> {
        let enable_mdns = self.config.enable_mdns;

        let swarm = libp2p::SwarmBuilder::with_existing_identity(self.keypair.clone())
            .with_tokio()
            .with_tcp(
                tcp::Config::default().nodelay(true),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| NetworkError::Transport(e.to_string()))?
            .with_quic()
            .with_behaviour(|keypair| {
                let ping = ping::Behaviour::new(
                    ping::Config::new()
                        .with_interval(Duration::from_secs(15))
                        .with_timeout(Duration::from_secs(20)),
                );

                let mdns = if enable_mdns {
                    Some(
                        mdns::tokio::Behaviour::new(
                            mdns::Config::default(),
                            keypair.public().to_peer_id(),
                        )
                        .map_err(|e| e.to_string())?,
                    )
                } else {
                    None
                };

                // Sessions are a handful of peers.
                // Must satisfy: mesh_outbound_min <= mesh_n_low <= mesh_n <= mesh_n_high
                let gossipsub_config = gossipsub::ConfigBuilder::default()
                    .heartbeat_interval(Duration::from_secs(1))
                    .validation_mode(gossipsub::ValidationMode::Strict)
                    .mesh_outbound_min(0)
                    .mesh_n_low(1)
                    .mesh_n(3)
                    .mesh_n_high(6)
                    .gossip_lazy(3)
                    .build()
                    .map_err(|e| e.to_string())?;

                let gossipsub = gossipsub::Behaviour::new(
                    gossipsub::MessageAuthenticity::Signed(keypair.clone()),
                    gossipsub_config,
                )
                .map_err(|e| e.to_string())?;

                let identify = identify::Behaviour::new(identify::Config::new(
                    "/tabletop-jukebox/1.0.0".into(),
                    keypair.public(),
                ));

                Ok(JukeboxBehaviour {
                    ping,
                    mdns: Toggle::from(mdns),
                    identify,
                    gossipsub,
                })
            })
            .map_err(|e| NetworkError::Transport(e.to_string()))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(self.config.idle_timeout))
            .build();

        Ok(swarm)
    }

    async fn run(
        mut self,
        mut swarm: Swarm<JukeboxBehaviour>,
        event_tx: mpsc::UnboundedSender<NetworkEvent>,
        mut command_rx: mpsc::UnboundedReceiver<NetworkCommand>,
    ) {
        for address in ["/ip4/0.0.0.0/tcp/0", "/ip4/0.0.0.0/udp/0/quic-v1"] {
            let listen = address
                .parse::<Multiaddr>()
                .map_err(|e| e.to_string())
                .and_then(|addr| swarm.listen_on(addr).map_err(|e| e.to_string()));
            match listen {
                Ok(id) => info!("Listener started on {}: {:?}", address, id),
                Err(e) => warn!("Failed to listen on {}: {}", address, e),
            }
        }

        for peer in &self.config.peers {
            match peer.parse::<Multiaddr>() {
                Ok(addr) => {
                    if let Err(e) = swarm.dial(addr) {
                        warn!("Failed to dial configured peer {}: {}", peer, e);
                    }
                }
                Err(e) => warn!("Invalid configured peer {}: {}", peer, e),
            }
        }

        let _ = event_tx.send(NetworkEvent::Ready {
            peer_id: self.local_peer_id.to_string(),
        });

        loop {
            tokio::select! {
                event = swarm.select_next_some() => {
                    self.handle_swarm_event(&mut swarm, event, &event_tx);
                }
                command = command_rx.recv() => {
                    let Some(command) = command else {
                        info!("All network handles dropped, shutting down");
                        break;
                    };
                    match command {
                        NetworkCommand::JoinSession { code } => {
                            if let Err(e) = self.join_session(&mut swarm, &code) {
                                let _ = event_tx.send(NetworkEvent::Error(e.to_string()));
                            }
                        }
                        NetworkCommand::LeaveSession => self.leave_session(&mut swarm),
                        NetworkCommand::Broadcast { envelope } => {
                            // Publishing with no subscribed peers is expected while alone
                            if let Err(e) = self.broadcast(&mut swarm, &envelope) {
                                debug!("Broadcast of {} not sent: {}", envelope.event.name(), e);
                            }
                        }
                        NetworkCommand::DialPeer { address } => {
                            info!("Dialing peer at {}", address);
                            if let Err(e) = swarm.dial(address) {
                                warn!("Failed to dial peer: {}", e);
                                let _ = event_tx.send(NetworkEvent::Error(e.to_string()));
                            }
                        }
                        NetworkCommand::Shutdown => {
                            info!("Network shutting down");
                            break;
                        }
                    }
                }
            }
        }
    }

    fn handle_swarm_event(
        &mut self,
        swarm: &mut Swarm<JukeboxBehaviour>,
        event: SwarmEvent<JukeboxBehaviourEvent>,
        event_tx: &mpsc::UnboundedSender<NetworkEvent>,
    ) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                let full = format!("{}/p2p/{}", address, self.local_peer_id);
                info!("Listening on {}", full);
                let _ = event_tx.send(NetworkEvent::Listening { address: full });
            }

            SwarmEvent::Behaviour(JukeboxBehaviourEvent::Mdns(mdns::Event::Discovered(peers))) => {
                for (peer_id, addr) in peers {
                    if peer_id == self.local_peer_id {
                        continue;
                    }
                    info!("mDNS discovered peer {} at {}", peer_id, addr);
                    swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer_id);
                    if let Err(e) = swarm.dial(addr) {
                        debug!("Failed to dial discovered peer {}: {}", peer_id, e);
                    }
                }
            }

            SwarmEvent::Behaviour(JukeboxBehaviourEvent::Mdns(mdns::Event::Expired(peers))) => {
                for (peer_id, _) in peers {
                    debug!("mDNS peer expired: {}", peer_id);
                }
            }

            SwarmEvent::Behaviour(JukeboxBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            })) => match serde_json::from_slice::<Envelope>(&message.data) {
                Ok(envelope) => {
                    debug!(
                        "Received {} from {} via {}",
                        envelope.event.name(),
                        envelope.from,
                        propagation_source
                    );
                    let _ = event_tx.send(NetworkEvent::Message {
                        from: propagation_source.to_string(),
                        envelope,
                    });
                }
                Err(e) => warn!("Dropping undecodable message from {}: {}", propagation_source, e),
            },

            SwarmEvent::Behaviour(JukeboxBehaviourEvent::Gossipsub(
                gossipsub::Event::Subscribed { peer_id, topic },
            )) => {
                if self.session_topic.as_ref().is_some_and(|t| t.hash() == topic) {
                    info!("Peer {} subscribed to session", peer_id);
                    self.session_peers.insert(peer_id);
                    let _ = event_tx.send(NetworkEvent::PeerSubscribed {
                        peer_id: peer_id.to_string(),
                    });
                }
            }

            SwarmEvent::Behaviour(JukeboxBehaviourEvent::Gossipsub(
                gossipsub::Event::Unsubscribed { peer_id, topic },
            )) => {
                if self.session_topic.as_ref().is_some_and(|t| t.hash() == topic) {
                    info!("Peer {} unsubscribed from session", peer_id);
                    self.session_peers.remove(&peer_id);
                    let _ = event_tx.send(NetworkEvent::PeerUnsubscribed {
                        peer_id: peer_id.to_string(),
                    });
                }
            }

            SwarmEvent::Behaviour(JukeboxBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                debug!("Identified peer {} running {}", peer_id, info.protocol_version);
            }

            SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                info!("Connection established with {} via {:?}", peer_id, endpoint);
                swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer_id);
            }

            SwarmEvent::ConnectionClosed { peer_id, num_established, .. } => {
                debug!("Connection closed with {}", peer_id);
                if num_established == 0 && self.session_peers.remove(&peer_id) {
                    let _ = event_tx.send(NetworkEvent::PeerUnsubscribed {
                        peer_id: peer_id.to_string(),
                    });
                }
            }

            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => match peer_id {
                Some(peer) => warn!("Failed to connect to {}: {}", peer, error),
                None => warn!("Outgoing connection error: {}", error),
            },

            SwarmEvent::ListenerError { listener_id, error } => {
                warn!("Listener {:?} error: {}", listener_id, error);
            }

            _ => {}
        }
    }

    fn join_session(
        &mut self,
        swarm: &mut Swarm<JukeboxBehaviour>,
        code: &SessionCode,
    ) -> Result<(), NetworkError> {
        if self.session_topic.is_some() {
            return Err(NetworkError::AlreadyInSession);
        }

        let topic = gossipsub::IdentTopic::new(code.topic());
        swarm
            .behaviour_mut()
            .gossipsub
            .subscribe(&topic)
            .map_err(|e| NetworkError::Libp2p(e.to_string()))?;

        info!("Subscribed to session {}", code);
        self.session_topic = Some(topic);
        self.session_peers.clear();
        Ok(())
    }

    fn leave_session(&mut self, swarm: &mut Swarm<JukeboxBehaviour>) {
        if let Some(topic) = self.session_topic.take() {
            let _ = swarm.behaviour_mut().gossipsub.unsubscribe(&topic);
            info!("Left session topic {}", topic.hash());
        }
        self.session_peers.clear();
    }

    fn broadcast(
        &self,
        swarm: &mut Swarm<JukeboxBehaviour>,
        envelope: &Envelope,
    ) -> Result<(), NetworkError> {
        let topic = self.session_topic.as_ref().ok_or(NetworkError::NotInSession)?;
        let data = serde_json::to_vec(envelope)?;

        swarm
            .behaviour_mut()
            .gossipsub
            .publish(topic.clone(), data)
            .map_err(|e| NetworkError::Libp2p(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached_handle() -> (NetworkHandle, mpsc::UnboundedReceiver<NetworkCommand>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let handle = NetworkHandle {
            command_tx,
            local_peer_id: "local".to_string(),
        };
        (handle, command_rx)
    }

    #[test]
    fn test_dial_rejects_bad_address() {
        let (handle, mut rx) = detached_handle();
        assert!(matches!(
            handle.dial_peer("not an address"),
            Err(NetworkError::InvalidAddress(..))
        ));
        assert!(rx.try_recv().is_err());

        handle.dial_peer("/ip4/127.0.0.1/tcp/4001").unwrap();
        assert!(matches!(rx.try_recv(), Ok(NetworkCommand::DialPeer { .. })));
    }

    #[test]
    fn test_relay_fails_once_task_is_gone() {
        let (handle, rx) = detached_handle();
        drop(rx);
        let envelope = Envelope {
            from: "local".to_string(),
            event: crate::bus::WireEvent::MemberLeft(crate::bus::MemberLeft {
                user_id: "local".to_string(),
            }),
        };
        assert!(matches!(handle.relay(envelope), Err(BusError::Relay(_))));
    }
}
