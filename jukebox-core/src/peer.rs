//! Peer
//!
//! One participant's wiring: the shared context (identity, config, bus,
//! store) handed to every component, the components themselves, and the
//! periodic loops that run while joined.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::bus::MessageBus;
use crate::config::SyncConfig;
use crate::membership::{MembershipError, MembershipManager};
use crate::playback::PlaybackCoordinator;
use crate::player::{PlayerDriver, PlayerMonitor};
use crate::queue::{QueueLibrary, QueueManager};
use crate::state::{current_time_ms, StateStore};

/// Who this peer is
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalUser {
    pub user_id: String,
    pub name: String,
}

impl LocalUser {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            name: name.into(),
        }
    }
}

/// Everything a component needs to take part in the session
#[derive(Clone)]
pub struct PeerContext {
    pub user: LocalUser,
    pub config: Arc<SyncConfig>,
    pub bus: Arc<MessageBus>,
    pub store: Arc<StateStore>,
}

impl PeerContext {
    pub fn new(user: LocalUser, config: SyncConfig) -> Self {
        let bus = Arc::new(MessageBus::new(user.user_id.clone()));
        let store = Arc::new(StateStore::new(Arc::clone(&bus)));
        Self {
            user,
            config: Arc::new(config),
            bus,
            store,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user.user_id
    }

    /// Check if this peer currently holds the DJ role
    pub fn is_dj(&self) -> bool {
        self.store.read(|s| s.session.is_dj(&self.user.user_id))
    }
}

pub struct Peer {
    ctx: PeerContext,
    pub membership: Arc<MembershipManager>,
    pub queue: Arc<QueueManager>,
    pub playback: Arc<PlaybackCoordinator>,
    player: Arc<dyn PlayerDriver>,
    loops: Mutex<Vec<oneshot::Sender<()>>>,
}

impl Peer {
    /// Wire up a peer. Must be called within a tokio runtime.
    pub fn new(
        user: LocalUser,
        config: SyncConfig,
        player: Arc<dyn PlayerDriver>,
        library: Arc<QueueLibrary>,
    ) -> Arc<Self> {
        let ctx = PeerContext::new(user, config);
        let membership = MembershipManager::new(ctx.clone());
        let queue = QueueManager::new(ctx.clone(), library);
        let playback = PlaybackCoordinator::new(ctx.clone(), Arc::clone(&queue), Arc::clone(&player));

        Arc::new(Self {
            ctx,
            membership,
            queue,
            playback,
            player,
            loops: Mutex::new(Vec::new()),
        })
    }

    pub fn context(&self) -> &PeerContext {
        &self.ctx
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.ctx.bus
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.ctx.store
    }

    /// Join the session and start the heartbeat, reconciliation and player
    /// polling loops
    pub fn join(&self) -> Result<(), MembershipError> {
        self.membership.join()?;
        self.start_loops();
        Ok(())
    }

    /// Stop the loops, announce departure and reset all state
    pub fn leave(&self) -> Result<(), MembershipError> {
        self.stop_loops();
        self.playback.reset();
        self.membership.leave()
    }

    fn start_loops(&self) {
        self.stop_loops();
        let config = Arc::clone(&self.ctx.config);

        let membership = Arc::clone(&self.membership);
        self.spawn_loop("heartbeat", config.heartbeat_interval, move || {
            membership.heartbeat(current_time_ms());
            async {}
        });

        let playback = Arc::clone(&self.playback);
        self.spawn_loop("reconcile", config.reconcile_interval, move || {
            playback.request_time_sync();
            async {}
        });

        let playback = Arc::clone(&self.playback);
        let player = Arc::clone(&self.player);
        let monitor = Arc::new(tokio::sync::Mutex::new(PlayerMonitor::new()));
        self.spawn_loop("player monitor", config.player_poll_interval, move || {
            let playback = Arc::clone(&playback);
            let player = Arc::clone(&player);
            let monitor = Arc::clone(&monitor);
            async move {
                let polled = monitor.lock().await.poll(player.as_ref()).await;
                match polled {
                    Ok((status, events)) => {
                        playback.record_status(&status);
                        for event in events {
                            playback.on_player_event(event);
                        }
                    }
                    Err(e) => debug!("Player poll failed: {}", e),
                }
            }
        });
    }

    fn spawn_loop<F, Fut>(&self, name: &'static str, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        self.loops.lock().push(cancel_tx);

        tokio::spawn(async move {
            debug!("{} loop started", name);
            // Join already announced everything; first tick one period in
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut cancel_rx => break,
                    _ = interval.tick() => tick().await,
                }
            }
            debug!("{} loop ended", name);
        });
    }

    fn stop_loops(&self) {
        let loops: Vec<_> = self.loops.lock().drain(..).collect();
        if !loops.is_empty() {
            info!("Stopping {} session loops", loops.len());
        }
        for cancel in loops {
            if cancel.send(()).is_err() {
                warn!("Session loop already ended");
            }
        }
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.stop_loops();
    }
}
