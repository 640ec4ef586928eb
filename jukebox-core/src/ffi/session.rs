//! Session implementation for FFI

use std::sync::{Arc, Once};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use crate::bus::{Delivery, PlayerFailed, StateChanged};
use crate::config::SyncConfig;
use crate::dialog::{DialogError, DialogResult, QueueNamePrompt};
use crate::network::{NetworkConfig, NetworkHandle, NetworkManager, SessionCode};
use crate::peer::{LocalUser, Peer};
use crate::player::{HttpPlayer, PlayerDriver};
use crate::queue::{AddOutcome, QueueLibrary};
use crate::state::{QueueItem, StateStore};

use super::handlers::run_event_pump;
use super::types::*;

static TRACING_INIT: Once = Once::new();

/// The session currently joined
pub(super) struct ActiveSession {
    pub code: SessionCode,
    pub peer: Arc<Peer>,
}

/// State shared with the network event pump
#[derive(Default)]
pub(super) struct Shared {
    callback: RwLock<Option<Arc<dyn SessionCallback>>>,
    active: RwLock<Option<ActiveSession>>,
    listen_addresses: RwLock<Vec<String>>,
}

impl Shared {
    pub fn callback(&self) -> Option<Arc<dyn SessionCallback>> {
        self.callback.read().clone()
    }

    pub fn peer(&self) -> Option<Arc<Peer>> {
        self.active.read().as_ref().map(|a| Arc::clone(&a.peer))
    }

    pub fn add_listen_address(&self, address: String) {
        self.listen_addresses.write().push(address);
    }

    pub fn report_error(&self, message: String) {
        if let Some(cb) = self.callback() {
            cb.on_error(message);
        }
    }
}

/// Asks the host UI for a queue name through the callback
struct CallbackPrompt(Option<Arc<dyn SessionCallback>>);

#[async_trait]
impl QueueNamePrompt for CallbackPrompt {
    async fn prompt_queue_name(&self, suggested: &str) -> Result<DialogResult, DialogError> {
        let cb = self
            .0
            .as_ref()
            .ok_or_else(|| DialogError::Unavailable("no callback registered".to_string()))?;
        Ok(match cb.prompt_queue_name(suggested.to_string()) {
            Some(name) => DialogResult::confirmed(name),
            None => DialogResult::cancelled(),
        })
    }
}

/// Main session interface
#[derive(uniffi::Object)]
pub struct Session {
    runtime: Runtime,
    config: SyncConfig,
    network_config: RwLock<NetworkConfig>,
    player: RwLock<Arc<HttpPlayer>>,
    library: RwLock<Arc<QueueLibrary>>,
    network: RwLock<Option<NetworkHandle>>,
    shared: Arc<Shared>,
}

#[uniffi::export]
impl Session {
    /// Create a new session
    #[uniffi::constructor]
    pub fn new() -> Result<Arc<Self>, CoreError> {
        TRACING_INIT.call_once(|| {
            let filter = tracing_subscriber::EnvFilter::from_default_env();
            let filter = [
                "jukebox_core=debug",
                "libp2p_mdns=info",
                "libp2p_gossipsub=info",
                "hyper_util=off",
                "reqwest=off",
                "hyper=off",
            ]
            .iter()
            .filter_map(|d| d.parse().ok())
            .fold(filter, |f, d| f.add_directive(d));

            // Another subscriber may already be installed by the host
            let _ = tracing_subscriber::fmt()
                .with_ansi(false)
                .with_target(false)
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init();
        });

        info!("Initializing jukebox-core session");

        let runtime = Runtime::new().map_err(|e| CoreError::Runtime(e.to_string()))?;

        Ok(Arc::new(Self {
            runtime,
            config: SyncConfig::default(),
            network_config: RwLock::new(NetworkConfig::default()),
            player: RwLock::new(Arc::new(HttpPlayer::new())),
            library: RwLock::new(Arc::new(QueueLibrary::in_memory())),
            network: RwLock::new(None),
            shared: Arc::new(Shared::default()),
        }))
    }

    /// Set the event callback
    pub fn set_callback(&self, callback: Box<dyn SessionCallback>) {
        *self.shared.callback.write() = Some(Arc::from(callback));
    }

    /// Point at the player bridge. Takes effect at the next join.
    pub fn set_player_port(&self, port: u16, token: Option<String>) {
        let player = HttpPlayer::with_port(port);
        let player = match token {
            Some(token) => player.with_token(token),
            None => player,
        };
        info!("Player bridge set to {}", player.base_url());
        *self.player.write() = Arc::new(player);
    }

    /// Keep saved queues in `dir`, or only in memory when `None`
    pub fn set_library_path(&self, dir: Option<String>) -> Result<(), CoreError> {
        let library = Arc::new(match dir {
            Some(dir) => QueueLibrary::open(&dir)?,
            None => QueueLibrary::in_memory(),
        });
        if let Some(peer) = self.shared.peer() {
            peer.queue.set_library(Arc::clone(&library));
        }
        *self.library.write() = library;
        Ok(())
    }

    /// Local network discovery. Takes effect when the network first starts.
    pub fn set_mdns_enabled(&self, enabled: bool) {
        self.network_config.write().enable_mdns = enabled;
    }

    /// Start a new session and return its code
    pub fn join_session(&self, display_name: String) -> Result<String, CoreError> {
        let code = SessionCode::random();
        self.start_session(code.clone(), display_name)?;
        Ok(code.to_string())
    }

    /// Join the session another peer shared the code of
    pub fn join_existing(&self, code: String, display_name: String) -> Result<(), CoreError> {
        let code: SessionCode = code.parse()?;
        self.start_session(code, display_name)
    }

    pub fn leave_session(&self) -> Result<(), CoreError> {
        let active = self.shared.active.write().take().ok_or(CoreError::NotInSession)?;

        let result = active.peer.leave();
        active.peer.bus().clear_relay();
        if let Some(network) = self.network.read().as_ref() {
            if let Err(e) = network.leave_session() {
                warn!("Failed to leave session topic: {}", e);
            }
        }

        info!("Left session {}", active.code);
        if let Some(cb) = self.shared.callback() {
            cb.on_state_changed(SessionView::idle());
        }
        result.map_err(CoreError::from)
    }

    pub fn request_dj(&self) -> Result<(), CoreError> {
        Ok(self.peer()?.membership.request_dj()?)
    }

    pub fn approve_dj(&self, user_id: String) -> Result<(), CoreError> {
        Ok(self.peer()?.membership.approve(&user_id)?)
    }

    pub fn deny_dj(&self, user_id: String) -> Result<(), CoreError> {
        Ok(self.peer()?.membership.deny(&user_id)?)
    }

    pub fn relinquish_dj(&self) -> Result<(), CoreError> {
        Ok(self.peer()?.membership.relinquish()?)
    }

    /// Add a video. Returns `true` if it was queued, `false` if it was
    /// proposed to the DJ.
    pub fn add_to_queue(&self, item: VideoItem) -> Result<bool, CoreError> {
        let peer = self.peer()?;
        let mut item = QueueItem::from(item);
        item.added_by = peer.context().user_id().to_string();
        let outcome = peer.queue.add(item)?;
        Ok(outcome == AddOutcome::Added)
    }

    pub fn remove_from_queue(&self, id: String) -> Result<(), CoreError> {
        self.peer()?.queue.remove(&id)?;
        Ok(())
    }

    pub fn reorder_queue(&self, id: String, position: u32) -> Result<(), CoreError> {
        Ok(self.peer()?.queue.reorder(&id, position as usize)?)
    }

    pub fn clear_queue(&self) -> Result<(), CoreError> {
        Ok(self.peer()?.queue.clear()?)
    }

    /// Save the current queue, asking the host for a name. Returns `false`
    /// if the user cancelled.
    pub fn save_queue(&self) -> Result<bool, CoreError> {
        let peer = self.peer()?;
        let prompt = CallbackPrompt(self.shared.callback());
        let saved = self.runtime.block_on(peer.queue.save(&prompt))?;
        Ok(saved.is_some())
    }

    pub fn save_queue_as(&self, name: String) -> Result<(), CoreError> {
        self.peer()?.queue.save_as(&name)?;
        Ok(())
    }

    pub fn load_queue(&self, name: String) -> Result<(), CoreError> {
        self.peer()?.queue.load(&name)?;
        Ok(())
    }

    pub fn saved_queues(&self) -> Vec<String> {
        self.library.read().names()
    }

    pub fn delete_saved_queue(&self, name: String) -> Result<(), CoreError> {
        let library = Arc::clone(&self.library.read());
        Ok(library.delete(&name)?)
    }

    pub fn play(&self) -> Result<(), CoreError> {
        Ok(self.peer()?.playback.play()?)
    }

    pub fn pause(&self) -> Result<(), CoreError> {
        Ok(self.peer()?.playback.pause()?)
    }

    pub fn seek(&self, seconds: f64) -> Result<(), CoreError> {
        Ok(self.peer()?.playback.seek(seconds)?)
    }

    /// Advance to the next queue item
    pub fn skip(&self) -> Result<(), CoreError> {
        self.peer()?.playback.skip()?;
        Ok(())
    }

    pub fn play_index(&self, index: u32) -> Result<(), CoreError> {
        self.peer()?.playback.play_index(index as usize)?;
        Ok(())
    }

    pub fn load_video(&self, video_id: String, start_seconds: Option<f64>) -> Result<(), CoreError> {
        Ok(self.peer()?.playback.load(&video_id, start_seconds)?)
    }

    /// Get current session state
    pub fn get_state(&self) -> SessionView {
        match self.shared.active.read().as_ref() {
            Some(active) => SessionView::new(
                Some(active.code.to_string()),
                Some(active.peer.context().user_id().to_string()),
                &active.peer.store().snapshot(),
            ),
            None => SessionView::idle(),
        }
    }

    /// Check if we hold the DJ role
    pub fn is_dj(&self) -> bool {
        self.shared.peer().is_some_and(|p| p.context().is_dj())
    }

    /// Dial a peer directly by multiaddr
    pub fn dial_peer(&self, address: String) -> Result<(), CoreError> {
        let network = self.ensure_network_running()?;
        Ok(network.dial_peer(&address)?)
    }

    /// Addresses other peers can dial to reach us
    pub fn listening_addresses(&self) -> Vec<String> {
        self.shared.listen_addresses.read().clone()
    }

    /// Current calibrated seek lead, for debug display
    pub fn seek_lead_ms(&self) -> u64 {
        self.shared.peer().map_or(0, |p| p.playback.seek_lead_ms())
    }
}

impl Session {
    fn peer(&self) -> Result<Arc<Peer>, CoreError> {
        self.shared.peer().ok_or(CoreError::NotInSession)
    }

    fn start_session(&self, code: SessionCode, display_name: String) -> Result<(), CoreError> {
        if self.shared.active.read().is_some() {
            return Err(CoreError::AlreadyInSession);
        }

        let network = self.ensure_network_running()?;
        network.join_session(&code)?;

        let user = LocalUser::new(network.local_peer_id.clone(), display_name);
        let player: Arc<dyn PlayerDriver> = self.player.read().clone();
        let library = Arc::clone(&self.library.read());

        // Peer components spawn their workers on our runtime
        let _guard = self.runtime.enter();
        let peer = Peer::new(user, self.config.clone(), player, library);
        peer.bus().set_relay(Arc::new(network.clone()));
        self.watch_state(&peer, &code);

        *self.shared.active.write() = Some(ActiveSession {
            code: code.clone(),
            peer: Arc::clone(&peer),
        });

        if let Err(e) = peer.join() {
            self.shared.active.write().take();
            let _ = network.leave_session();
            return Err(e.into());
        }

        info!("Joined session {}", code);
        Ok(())
    }

    /// Forward every state change to the callback
    fn watch_state(&self, peer: &Arc<Peer>, code: &SessionCode) {
        let shared = Arc::downgrade(&self.shared);
        let code = code.to_string();
        let user_id = peer.context().user_id().to_string();

        peer.bus().subscribe_with(
            peer.store(),
            move |store: &StateStore, delivery: &Delivery<StateChanged>| {
                debug!("State changed: {:?}", delivery.payload.changes.sections());
                if let Some(cb) = shared.upgrade().and_then(|s| s.callback()) {
                    let view = SessionView::new(Some(code.clone()), Some(user_id.clone()), &store.snapshot());
                    cb.on_state_changed(view);
                }
                Ok(())
            },
        );

        let shared = Arc::downgrade(&self.shared);
        peer.bus().subscribe(move |delivery: &Delivery<PlayerFailed>| {
            if let Some(shared) = shared.upgrade() {
                let failure = &delivery.payload;
                shared.report_error(format!("Player could not {}: {}", failure.command.verb(), failure.message));
            }
            Ok(())
        });
    }

    fn ensure_network_running(&self) -> Result<NetworkHandle, CoreError> {
        let mut network = self.network.write();
        if let Some(handle) = network.as_ref() {
            return Ok(handle.clone());
        }

        info!("Starting network...");
        let manager = NetworkManager::new(self.network_config.read().clone());
        let (handle, events) = {
            let _guard = self.runtime.enter();
            manager.start()?
        };
        self.runtime.spawn(run_event_pump(events, Arc::downgrade(&self.shared)));

        *network = Some(handle.clone());
        Ok(handle)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let active = self.shared.active.write().take();
        if let Some(active) = active {
            if let Err(e) = active.peer.leave() {
                debug!("Leave on drop: {}", e);
            }
        }
        if let Some(network) = self.network.write().take() {
            network.shutdown();
        }
    }
}
