//! Types for the player bridge API

use serde::{Deserialize, Serialize};

use super::PlayerStatus;
use crate::state::PlaybackStatus;

/// Response wrapper used by every bridge endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse<T> {
    pub status: String,
    #[serde(flatten)]
    pub data: T,
}

/// Body of `GET /status`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub state: PlaybackStatus,
    #[serde(default)]
    pub video_id: Option<String>,
    #[serde(default)]
    pub current_time: f64,
    #[serde(default)]
    pub duration: f64,
}

impl From<StatusResponse> for PlayerStatus {
    fn from(resp: StatusResponse) -> Self {
        Self {
            is_ready: resp.ready,
            state: resp.state,
            video_id: resp.video_id,
            current_time: resp.current_time,
            duration: resp.duration,
        }
    }
}

/// Body of `POST /load`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadRequest<'a> {
    pub video_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_seconds: Option<f64>,
}

/// Body of `POST /seek`
#[derive(Debug, Clone, Serialize)]
pub struct SeekRequest {
    pub seconds: f64,
}

/// Error body returned with a non-success status
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorResponse {
    #[serde(default)]
    pub error: String,
}
