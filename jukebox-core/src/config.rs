//! Sync timing configuration

use std::time::Duration;

/// Timing knobs for membership, reconciliation and player polling
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How often each peer announces itself
    pub heartbeat_interval: Duration,
    /// Members not heard from for longer are inactive
    pub stale_after: Duration,
    /// Remove members inactive for longer than this. `None` keeps them
    /// in the roster until they leave.
    pub prune_after: Option<Duration>,
    /// Pending DJ requests older than this are dropped
    pub dj_request_expiry: Duration,
    /// How often followers ask the DJ for its playback position
    pub reconcile_interval: Duration,
    /// Unanswered time requests are abandoned after this
    pub time_request_timeout: Duration,
    /// Drift beyond this triggers a corrective seek, in seconds
    pub drift_tolerance_secs: f64,
    /// How often the local player status is polled
    pub player_poll_interval: Duration,
    /// Learn how far ahead to seek to absorb player seek latency
    pub calibrate_seek_lead: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            stale_after: Duration::from_secs(15),
            prune_after: None,
            dj_request_expiry: Duration::from_secs(60),
            reconcile_interval: Duration::from_secs(5),
            time_request_timeout: Duration::from_secs(3),
            drift_tolerance_secs: 1.0,
            player_poll_interval: Duration::from_secs(1),
            calibrate_seek_lead: true,
        }
    }
}

impl SyncConfig {
    pub(crate) fn stale_after_ms(&self) -> u64 {
        self.stale_after.as_millis() as u64
    }
}
