//! Session data model

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A member of the session roster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMember {
    /// Stable user identifier
    pub user_id: String,
    /// Display name
    pub name: String,
    /// Whether this member currently holds the DJ role
    #[serde(rename = "isDJ")]
    pub is_dj: bool,
    /// Whether the member has been heard from within the staleness threshold
    pub is_active: bool,
    /// Sender timestamp of the last join/heartbeat, capped at the
    /// receiver's clock, ms since epoch. Peer clocks are assumed to agree
    /// to within the staleness threshold; a sender whose clock lags ours by
    /// more than that reads as inactive.
    pub last_activity: u64,
}

/// A pending claim to become DJ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DjRequest {
    pub user_id: String,
    pub user_name: String,
    pub timestamp: u64,
}

/// A video in the shared queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    /// Provider video id, unique within a queue
    pub id: String,
    pub title: String,
    /// Duration in seconds
    pub duration: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    pub added_by: String,
}

/// Ordered playlist plus the cursor of the item being played
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueState {
    pub items: Vec<QueueItem>,
    /// `None` is "nothing selected" and travels as `-1`
    #[serde(with = "index_or_none")]
    pub current_index: Option<usize>,
}

/// Playback state reported by a local player
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PlaybackStatus {
    #[default]
    Unstarted,
    Playing,
    Paused,
    Buffering,
    Ended,
}

/// Mirror of this peer's local embedded player
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerState {
    pub is_ready: bool,
    pub current_video: Option<QueueItem>,
    pub playback_state: PlaybackStatus,
    /// Seconds
    pub current_time: f64,
    /// Seconds
    pub duration: f64,
}

/// Membership and DJ arbitration section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSection {
    pub has_joined_session: bool,
    #[serde(rename = "djUserId")]
    pub dj_user_id: Option<String>,
    /// Roster keyed by user id
    pub members: BTreeMap<String, SessionMember>,
    /// Pending DJ requests, earliest first
    pub active_requests: Vec<DjRequest>,
}

/// The whole per-peer state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session: SessionSection,
    pub queue: QueueState,
    pub player: PlayerState,
}

impl SessionSection {
    /// Check if the given user holds the DJ role
    pub fn is_dj(&self, user_id: &str) -> bool {
        self.dj_user_id.as_deref() == Some(user_id)
    }

    /// Get the current DJ's member entry, if any
    pub fn dj(&self) -> Option<&SessionMember> {
        self.dj_user_id.as_ref().and_then(|id| self.members.get(id))
    }

    /// Get list of members (DJ first, then others sorted by name)
    pub fn member_list(&self) -> Vec<&SessionMember> {
        let mut list: Vec<&SessionMember> = self.members.values().collect();
        list.sort_by(|a, b| match (a.is_dj, b.is_dj) {
            (true, false) => std::cmp::Ordering::Less,
            (false, true) => std::cmp::Ordering::Greater,
            _ => a
                .name
                .to_lowercase()
                .cmp(&b.name.to_lowercase())
                .then_with(|| a.user_id.cmp(&b.user_id)),
        });
        list
    }

    /// Add a member or refresh an existing entry.
    ///
    /// `last_activity` never moves backwards, so replaying an older
    /// announcement leaves the entry as it is.
    pub fn upsert_member(&mut self, user_id: &str, name: &str, timestamp: u64) {
        let is_dj = self.is_dj(user_id);
        let member = self
            .members
            .entry(user_id.to_string())
            .or_insert_with(|| SessionMember {
                user_id: user_id.to_string(),
                name: name.to_string(),
                is_dj,
                is_active: true,
                last_activity: timestamp,
            });

        if timestamp >= member.last_activity {
            member.name = name.to_string();
            member.last_activity = timestamp;
            member.is_active = true;
        }
        member.is_dj = is_dj;
    }

    /// Remove a member together with any request they had pending.
    /// Vacates the DJ seat if they held it.
    pub fn remove_member(&mut self, user_id: &str) -> Option<SessionMember> {
        self.remove_request(user_id);
        if self.is_dj(user_id) {
            self.vacate_dj();
        }
        self.members.remove(user_id)
    }

    /// Hand the DJ role to `user_id`; every other member loses it and all
    /// pending requests are cleared.
    pub fn grant_dj(&mut self, user_id: &str) {
        for member in self.members.values_mut() {
            member.is_dj = member.user_id == user_id;
        }
        self.dj_user_id = Some(user_id.to_string());
        self.active_requests.clear();
    }

    /// Leave the DJ seat empty
    pub fn vacate_dj(&mut self) {
        for member in self.members.values_mut() {
            member.is_dj = false;
        }
        self.dj_user_id = None;
    }

    /// Record a DJ request, replacing any earlier one from the same user
    pub fn upsert_request(&mut self, request: DjRequest) {
        self.active_requests.retain(|r| r.user_id != request.user_id);
        let position = self
            .active_requests
            .iter()
            .position(|r| (r.timestamp, &r.user_id) > (request.timestamp, &request.user_id))
            .unwrap_or(self.active_requests.len());
        self.active_requests.insert(position, request);
    }

    /// Drop the pending request from `user_id`
    pub fn remove_request(&mut self, user_id: &str) -> Option<DjRequest> {
        let index = self
            .active_requests
            .iter()
            .position(|r| r.user_id == user_id)?;
        Some(self.active_requests.remove(index))
    }

    /// Recompute `is_active` against `now_ms`
    pub fn refresh_activity(&mut self, now_ms: u64, stale_after_ms: u64) {
        for member in self.members.values_mut() {
            member.is_active = now_ms.saturating_sub(member.last_activity) <= stale_after_ms;
        }
    }

    /// Check the DJ singleton invariant
    pub fn dj_is_consistent(&self) -> bool {
        let holders: Vec<&SessionMember> = self.members.values().filter(|m| m.is_dj).collect();
        match (holders.as_slice(), &self.dj_user_id) {
            ([], _) => true,
            ([only], Some(dj)) => &only.user_id == dj,
            _ => false,
        }
    }
}

/// Serialize `Option<usize>` as an integer where `-1` means `None`.
/// `null` is read as `None` too.
pub(crate) mod index_or_none {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(index: &Option<usize>, serializer: S) -> Result<S::Ok, S::Error> {
        match index {
            Some(i) => serializer.serialize_i64(*i as i64),
            None => serializer.serialize_i64(-1),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<usize>, D::Error> {
        let raw = Option::<i64>::deserialize(deserializer)?;
        Ok(raw.and_then(|i| usize::try_from(i).ok()))
    }
}
