//! Shared fixtures for multi-peer tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use jukebox_core::player::{PlayerDriver, PlayerError, PlayerStatus};
use jukebox_core::queue::QueueLibrary;
use jukebox_core::state::{current_time_ms, PlaybackStatus, QueueItem};
use jukebox_core::{LocalHub, LocalUser, Peer, SyncConfig};

/// Player that records every call and reports a settable position
#[derive(Default)]
pub struct RecordingPlayer {
    calls: Mutex<Vec<String>>,
    position: Mutex<f64>,
}

impl RecordingPlayer {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn set_position(&self, seconds: f64) {
        *self.position.lock() = seconds;
    }
}

#[async_trait]
impl PlayerDriver for RecordingPlayer {
    async fn load(&self, video_id: &str, start_seconds: Option<f64>) -> Result<(), PlayerError> {
        self.calls.lock().push(format!("load {} {:?}", video_id, start_seconds));
        Ok(())
    }

    async fn play(&self) -> Result<(), PlayerError> {
        self.calls.lock().push("play".to_string());
        Ok(())
    }

    async fn pause(&self) -> Result<(), PlayerError> {
        self.calls.lock().push("pause".to_string());
        Ok(())
    }

    async fn seek(&self, seconds: f64) -> Result<(), PlayerError> {
        self.calls.lock().push(format!("seek {:.1}", seconds));
        Ok(())
    }

    async fn status(&self) -> Result<PlayerStatus, PlayerError> {
        Ok(PlayerStatus {
            is_ready: true,
            state: PlaybackStatus::Playing,
            video_id: None,
            current_time: *self.position.lock(),
            duration: 300.0,
        })
    }
}

pub struct TestPeer {
    pub peer: Arc<Peer>,
    pub player: Arc<RecordingPlayer>,
}

impl TestPeer {
    pub fn user_id(&self) -> &str {
        self.peer.context().user_id()
    }

    pub async fn flush(&self) {
        self.peer.playback.flush().await;
    }
}

/// Timers far enough out that they never fire during a test
pub fn quiet_config() -> SyncConfig {
    let hour = Duration::from_secs(3600);
    SyncConfig {
        heartbeat_interval: hour,
        reconcile_interval: hour,
        player_poll_interval: hour,
        calibrate_seek_lead: false,
        ..SyncConfig::default()
    }
}

/// Create a peer attached to `hub`, without joining
pub fn peer_on(hub: &LocalHub, user_id: &str, config: SyncConfig) -> TestPeer {
    let player = Arc::new(RecordingPlayer::default());
    let peer = Peer::new(
        LocalUser::new(user_id, capitalize(user_id)),
        config,
        player.clone(),
        Arc::new(QueueLibrary::in_memory()),
    );
    hub.connect(peer.bus());
    TestPeer { peer, player }
}

/// Create and join a peer
pub fn joined(hub: &LocalHub, user_id: &str) -> TestPeer {
    let peer = peer_on(hub, user_id, quiet_config());
    peer.peer.join().unwrap();
    peer
}

/// Join `user_id` and make them DJ through request and self-approval
pub fn joined_dj(hub: &LocalHub, user_id: &str) -> TestPeer {
    let peer = joined(hub, user_id);
    peer.peer.membership.request_dj().unwrap();
    peer.peer.membership.approve(user_id).unwrap();
    peer
}

/// One heartbeat from every peer, in order
pub fn heartbeat_round(peers: &[&TestPeer]) {
    for peer in peers {
        peer.peer.membership.heartbeat(current_time_ms());
    }
}

pub fn video(id: &str) -> QueueItem {
    QueueItem {
        id: id.to_string(),
        title: capitalize(id),
        duration: 180.0,
        thumbnail: None,
        added_by: String::new(),
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
