//! FFI types exposed via uniffi

use crate::membership::MembershipError;
use crate::network::NetworkError;
use crate::playback::PlaybackError;
use crate::player::PlayerError;
use crate::queue::QueueError;
use crate::state::{self, PlaybackStatus, SessionState};

/// Error types exposed via FFI
#[derive(Debug, thiserror::Error, uniffi::Error)]
pub enum CoreError {
    #[error("Not in a session")]
    NotInSession,

    #[error("Already in a session")]
    AlreadyInSession,

    #[error("Invalid session code: {0}")]
    InvalidSessionCode(String),

    #[error("Only the DJ can do that")]
    NotDj,

    #[error("Membership error: {0}")]
    Membership(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Player error: {0}")]
    Player(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl From<MembershipError> for CoreError {
    fn from(e: MembershipError) -> Self {
        match e {
            MembershipError::NotJoined => CoreError::NotInSession,
            MembershipError::AlreadyJoined => CoreError::AlreadyInSession,
            MembershipError::NotDj => CoreError::NotDj,
            other => CoreError::Membership(other.to_string()),
        }
    }
}

impl From<QueueError> for CoreError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::NotDj => CoreError::NotDj,
            other => CoreError::Queue(other.to_string()),
        }
    }
}

impl From<PlaybackError> for CoreError {
    fn from(e: PlaybackError) -> Self {
        match e {
            PlaybackError::NotDj => CoreError::NotDj,
            PlaybackError::Queue(e) => e.into(),
        }
    }
}

impl From<NetworkError> for CoreError {
    fn from(e: NetworkError) -> Self {
        match e {
            NetworkError::InvalidCode(code) => CoreError::InvalidSessionCode(code),
            other => CoreError::Network(other.to_string()),
        }
    }
}

impl From<PlayerError> for CoreError {
    fn from(e: PlayerError) -> Self {
        CoreError::Player(e.to_string())
    }
}

/// Player state as seen by the host UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum PlaybackState {
    Unstarted,
    Playing,
    Paused,
    Buffering,
    Ended,
}

impl From<PlaybackStatus> for PlaybackState {
    fn from(s: PlaybackStatus) -> Self {
        match s {
            PlaybackStatus::Unstarted => PlaybackState::Unstarted,
            PlaybackStatus::Playing => PlaybackState::Playing,
            PlaybackStatus::Paused => PlaybackState::Paused,
            PlaybackStatus::Buffering => PlaybackState::Buffering,
            PlaybackStatus::Ended => PlaybackState::Ended,
        }
    }
}

/// Session member exposed via FFI
#[derive(Debug, Clone, uniffi::Record)]
pub struct Member {
    pub user_id: String,
    pub name: String,
    pub is_dj: bool,
    pub is_active: bool,
    pub last_activity_ms: u64,
}

impl From<&state::SessionMember> for Member {
    fn from(m: &state::SessionMember) -> Self {
        Self {
            user_id: m.user_id.clone(),
            name: m.name.clone(),
            is_dj: m.is_dj,
            is_active: m.is_active,
            last_activity_ms: m.last_activity,
        }
    }
}

/// Pending request for the DJ role
#[derive(Debug, Clone, uniffi::Record)]
pub struct DjRequest {
    pub user_id: String,
    pub user_name: String,
    pub timestamp_ms: u64,
}

impl From<&state::DjRequest> for DjRequest {
    fn from(r: &state::DjRequest) -> Self {
        Self {
            user_id: r.user_id.clone(),
            user_name: r.user_name.clone(),
            timestamp_ms: r.timestamp,
        }
    }
}

/// Queue entry exposed via FFI
#[derive(Debug, Clone, uniffi::Record)]
pub struct VideoItem {
    pub id: String,
    pub title: String,
    pub duration_secs: f64,
    pub thumbnail: Option<String>,
    pub added_by: String,
}

impl From<&state::QueueItem> for VideoItem {
    fn from(v: &state::QueueItem) -> Self {
        Self {
            id: v.id.clone(),
            title: v.title.clone(),
            duration_secs: v.duration,
            thumbnail: v.thumbnail.clone(),
            added_by: v.added_by.clone(),
        }
    }
}

impl From<VideoItem> for state::QueueItem {
    fn from(v: VideoItem) -> Self {
        Self {
            id: v.id,
            title: v.title,
            duration: v.duration_secs,
            thumbnail: v.thumbnail,
            added_by: v.added_by,
        }
    }
}

#[derive(Debug, Clone, uniffi::Record)]
pub struct QueueView {
    pub items: Vec<VideoItem>,
    /// -1 when nothing is selected
    pub current_index: i32,
}

#[derive(Debug, Clone, uniffi::Record)]
pub struct PlayerView {
    pub is_ready: bool,
    pub current_video: Option<VideoItem>,
    pub playback_state: PlaybackState,
    pub current_time_secs: f64,
    pub duration_secs: f64,
}

/// Everything the host UI renders
#[derive(Debug, Clone, uniffi::Record)]
pub struct SessionView {
    pub session_code: Option<String>,
    pub local_user_id: Option<String>,
    pub has_joined: bool,
    pub dj_user_id: Option<String>,
    pub members: Vec<Member>,
    pub dj_requests: Vec<DjRequest>,
    pub queue: QueueView,
    pub player: PlayerView,
}

impl SessionView {
    pub fn new(code: Option<String>, local_user_id: Option<String>, state: &SessionState) -> Self {
        let session = &state.session;
        let queue = &state.queue;
        let player = &state.player;

        Self {
            session_code: code,
            local_user_id,
            has_joined: session.has_joined_session,
            dj_user_id: session.dj_user_id.clone(),
            members: session.member_list().into_iter().map(Member::from).collect(),
            dj_requests: session.active_requests.iter().map(DjRequest::from).collect(),
            queue: QueueView {
                items: queue.items.iter().map(VideoItem::from).collect(),
                current_index: queue.current_index.map_or(-1, |i| i as i32),
            },
            player: PlayerView {
                is_ready: player.is_ready,
                current_video: player.current_video.as_ref().map(VideoItem::from),
                playback_state: player.playback_state.into(),
                current_time_secs: player.current_time,
                duration_secs: player.duration,
            },
        }
    }

    /// View of a peer that is not in any session
    pub fn idle() -> Self {
        Self::new(None, None, &SessionState::default())
    }
}

/// Callback interface for session events
#[uniffi::export(callback_interface)]
pub trait SessionCallback: Send + Sync {
    fn on_state_changed(&self, state: SessionView);
    fn on_error(&self, message: String);
    /// First other peer reachable on the session topic
    fn on_connected(&self);
    /// Last other peer gone from the session topic
    fn on_disconnected(&self);
    /// Ask the user for a queue name. `None` cancels the save.
    fn prompt_queue_name(&self, suggested: String) -> Option<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_reflects_state() {
        let mut state = SessionState::default();
        state.session.has_joined_session = true;
        state.session.upsert_member("a", "Ann", 10);
        state.session.grant_dj("a");
        state.queue.items.push(state::QueueItem {
            id: "v1".to_string(),
            title: "One".to_string(),
            duration: 60.0,
            thumbnail: None,
            added_by: "a".to_string(),
        });
        state.queue.current_index = Some(0);
        state.player.playback_state = PlaybackStatus::Playing;

        let view = SessionView::new(Some("ABCD-EFGH".to_string()), Some("a".to_string()), &state);
        assert!(view.has_joined);
        assert_eq!(view.dj_user_id.as_deref(), Some("a"));
        assert_eq!(view.members.len(), 1);
        assert!(view.members[0].is_dj);
        assert_eq!(view.queue.current_index, 0);
        assert_eq!(view.player.playback_state, PlaybackState::Playing);

        assert_eq!(SessionView::idle().queue.current_index, -1);
    }

    #[test]
    fn test_error_mapping() {
        assert!(matches!(CoreError::from(QueueError::NotDj), CoreError::NotDj));
        assert!(matches!(
            CoreError::from(PlaybackError::Queue(QueueError::EmptyName)),
            CoreError::Queue(_)
        ));
        assert!(matches!(
            CoreError::from(MembershipError::NotJoined),
            CoreError::NotInSession
        ));
        assert!(matches!(
            CoreError::from(NetworkError::InvalidCode("x".to_string())),
            CoreError::InvalidSessionCode(_)
        ));
    }
}
