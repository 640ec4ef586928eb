//! Topic catalog
//!
//! Every payload that travels on the bus, and the wire enum used for the
//! relayed ones.

use serde::{Deserialize, Serialize};

use super::{MessageBus, Scope, Topic};
use crate::state::{PlaybackStatus, QueueItem, QueueState, SessionSection, StateChanges};

/// Transport command applied to a local player
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "args", rename_all = "camelCase")]
pub enum PlayerCommand {
    Play,
    Pause,
    Seek {
        seconds: f64,
    },
    Stop,
    #[serde(rename_all = "camelCase")]
    Load {
        video_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_seconds: Option<f64>,
    },
}

impl PlayerCommand {
    /// What the command asks of the player, for messages
    pub fn verb(&self) -> &'static str {
        match self {
            PlayerCommand::Play => "play",
            PlayerCommand::Pause => "pause",
            PlayerCommand::Seek { .. } => "seek",
            PlayerCommand::Stop => "stop",
            PlayerCommand::Load { .. } => "load the video",
        }
    }
}

/// Fired after every store mutation that changed something
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChanged {
    pub changes: StateChanges,
}

/// DJ transport command, mirrored by every peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerCommandEvent(pub PlayerCommand);

/// Command for this peer's own player only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalPlayerCommandEvent(pub PlayerCommand);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetCurrentTimeRequest {
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentTimeResponse {
    pub request_id: String,
    pub current_time: f64,
    pub duration: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueNext {
    pub next_index: usize,
    pub video_item: QueueItem,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadVideo {
    pub video_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_seconds: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberJoined {
    pub user_id: String,
    pub name: String,
    pub timestamp: u64,
}

/// Periodic liveness beacon. It also restates the sender's hold on the DJ
/// seat and, from the DJ, the whole queue, so a peer that missed an
/// approval or a queue update converges on the next beat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberHeartbeat {
    pub user_id: String,
    pub name: String,
    pub timestamp: u64,
    #[serde(default, rename = "isDJ")]
    pub is_dj: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberLeft {
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DjRequested {
    pub user_id: String,
    pub user_name: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DjApproved {
    pub user_id: String,
    pub approved_by: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DjDenied {
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DjRelinquished {
    pub user_id: String,
}

/// Full queue section after a DJ mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueUpdated {
    pub queue: QueueState,
}

/// Addition suggested by a follower
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueProposal {
    pub item: QueueItem,
    pub proposed_by: String,
}

/// Session view sent to a late joiner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session: SessionSection,
    pub queue: QueueState,
    pub current_video: Option<QueueItem>,
    pub playback_state: PlaybackStatus,
    pub current_time: f64,
}

/// A command the local player failed to carry out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerFailed {
    pub command: PlayerCommand,
    pub message: String,
}

/// Relayed events as they appear between peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "camelCase")]
pub enum WireEvent {
    PlayerCommand(PlayerCommandEvent),
    GetCurrentTimeRequest(GetCurrentTimeRequest),
    CurrentTimeResponse(CurrentTimeResponse),
    QueueNext(QueueNext),
    LoadVideo(LoadVideo),
    MemberJoined(MemberJoined),
    MemberHeartbeat(MemberHeartbeat),
    MemberLeft(MemberLeft),
    DjRequested(DjRequested),
    DjApproved(DjApproved),
    DjDenied(DjDenied),
    DjRelinquished(DjRelinquished),
    QueueUpdated(QueueUpdated),
    QueueProposal(QueueProposal),
    SessionSnapshot(SessionSnapshot),
}

impl Topic for StateChanged {
    const NAME: &'static str = "stateChanged";
    const SCOPE: Scope = Scope::Local;

    fn into_wire(self) -> Option<WireEvent> {
        None
    }
}

impl Topic for PlayerFailed {
    const NAME: &'static str = "playerFailed";
    const SCOPE: Scope = Scope::Local;

    fn into_wire(self) -> Option<WireEvent> {
        None
    }
}

impl Topic for LocalPlayerCommandEvent {
    const NAME: &'static str = "localPlayerCommand";
    const SCOPE: Scope = Scope::Local;

    fn into_wire(self) -> Option<WireEvent> {
        None
    }
}

macro_rules! relayed_topics {
    ($($variant:ident($ty:ident) => $name:literal),+ $(,)?) => {
        $(
            impl Topic for $ty {
                const NAME: &'static str = $name;
                const SCOPE: Scope = Scope::Relayed;

                fn into_wire(self) -> Option<WireEvent> {
                    Some(WireEvent::$variant(self))
                }
            }
        )+

        impl WireEvent {
            /// Event name on the wire
            pub fn name(&self) -> &'static str {
                match self {
                    $(WireEvent::$variant(_) => $name,)+
                }
            }

            /// Queue the payload for the local subscribers of its topic
            pub(crate) fn deliver(self, bus: &MessageBus, from: String) {
                match self {
                    $(WireEvent::$variant(payload) => bus.enqueue_remote(from, payload),)+
                }
            }
        }
    };
}

relayed_topics! {
    PlayerCommand(PlayerCommandEvent) => "playerCommand",
    GetCurrentTimeRequest(GetCurrentTimeRequest) => "getCurrentTimeRequest",
    CurrentTimeResponse(CurrentTimeResponse) => "currentTimeResponse",
    QueueNext(QueueNext) => "queueNext",
    LoadVideo(LoadVideo) => "loadVideo",
    MemberJoined(MemberJoined) => "memberJoined",
    MemberHeartbeat(MemberHeartbeat) => "memberHeartbeat",
    MemberLeft(MemberLeft) => "memberLeft",
    DjRequested(DjRequested) => "djRequested",
    DjApproved(DjApproved) => "djApproved",
    DjDenied(DjDenied) => "djDenied",
    DjRelinquished(DjRelinquished) => "djRelinquished",
    QueueUpdated(QueueUpdated) => "queueUpdated",
    QueueProposal(QueueProposal) => "queueProposal",
    SessionSnapshot(SessionSnapshot) => "sessionSnapshot",
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_player_command_wire_shape() {
        let event = WireEvent::PlayerCommand(PlayerCommandEvent(PlayerCommand::Seek { seconds: 42.5 }));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            json!({"event": "playerCommand", "payload": {"command": "seek", "args": {"seconds": 42.5}}})
        );

        let load = serde_json::to_value(PlayerCommand::Load {
            video_id: "abc".into(),
            start_seconds: None,
        })
        .unwrap();
        assert_eq!(load, json!({"command": "load", "args": {"videoId": "abc"}}));
    }

    #[test]
    fn test_time_response_field_names() {
        let parsed: WireEvent = serde_json::from_value(json!({
            "event": "currentTimeResponse",
            "payload": {"requestId": "r1", "currentTime": 10.0, "duration": 200.0}
        }))
        .unwrap();
        assert_eq!(parsed.name(), "currentTimeResponse");
        assert_eq!(
            parsed,
            WireEvent::CurrentTimeResponse(CurrentTimeResponse {
                request_id: "r1".into(),
                current_time: 10.0,
                duration: 200.0,
            })
        );
    }

    #[test]
    fn test_queue_next_wire_shape() {
        let event = WireEvent::QueueNext(QueueNext {
            next_index: 2,
            video_item: QueueItem {
                id: "v".into(),
                title: "Tavern".into(),
                duration: 61.0,
                thumbnail: None,
                added_by: "u1".into(),
            },
            timestamp: 7,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "queueNext");
        assert_eq!(json["payload"]["nextIndex"], 2);
        assert_eq!(json["payload"]["videoItem"]["addedBy"], "u1");
    }

    #[test]
    fn test_names_match_topics() {
        let event = WireEvent::DjApproved(DjApproved {
            user_id: "a".into(),
            approved_by: "b".into(),
        });
        assert_eq!(event.name(), DjApproved::NAME);
        assert_eq!(LocalPlayerCommandEvent::SCOPE, Scope::Local);
    }

    #[test]
    fn test_heartbeat_wire_shape() {
        let beat = MemberHeartbeat {
            user_id: "u1".into(),
            name: "Ann".into(),
            timestamp: 7,
            is_dj: true,
            queue: Some(QueueState::default()),
        };
        let json = serde_json::to_value(&beat).unwrap();
        assert_eq!(
            json,
            json!({"userId": "u1", "name": "Ann", "timestamp": 7, "isDJ": true, "queue": {"items": [], "currentIndex": -1}})
        );

        // Beats without the seat fields read as a non-DJ without a queue
        let plain: MemberHeartbeat =
            serde_json::from_value(json!({"userId": "u2", "name": "Bo", "timestamp": 8})).unwrap();
        assert!(!plain.is_dj);
        assert!(plain.queue.is_none());
    }
}
