//! Turns polled player status into transition events

use super::{PlayerDriver, PlayerError, PlayerEvent, PlayerStatus};
use crate::state::PlaybackStatus;

#[derive(Debug, Default)]
pub struct PlayerMonitor {
    last: Option<PlayerStatus>,
}

impl PlayerMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare `status` against the previous one and report what changed
    pub fn observe(&mut self, status: &PlayerStatus) -> Vec<PlayerEvent> {
        let mut events = Vec::new();
        let (was_ready, last_state, last_video) = match &self.last {
            Some(last) => (last.is_ready, last.state, last.video_id.as_deref()),
            None => (false, PlaybackStatus::Unstarted, None),
        };

        if status.is_ready && !was_ready {
            events.push(PlayerEvent::Ready);
        }

        // A new video restarts the state sequence even if the state matches
        let video_changed = status.video_id.as_deref() != last_video;
        if status.state != last_state || (video_changed && status.state != PlaybackStatus::Unstarted) {
            events.push(PlayerEvent::StateChanged(status.state));
            if status.state == PlaybackStatus::Ended {
                events.push(PlayerEvent::Ended);
            }
        }

        self.last = Some(status.clone());
        events
    }

    /// Read the driver once and observe the result
    pub async fn poll(
        &mut self,
        driver: &dyn PlayerDriver,
    ) -> Result<(PlayerStatus, Vec<PlayerEvent>), PlayerError> {
        let status = driver.status().await?;
        let events = self.observe(&status);
        Ok((status, events))
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}
