//! Membership Manager
//!
//! Roster upkeep and DJ arbitration. Operations validate against the
//! local view and then publish; every peer, the publisher included, applies
//! the resulting event through the same handler, so a replayed event lands
//! on the same state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bus::{
    Delivery, DjApproved, DjDenied, DjRelinquished, DjRequested, HandlerResult,
    LocalPlayerCommandEvent, MemberHeartbeat, MemberJoined, MemberLeft, PlayerCommand,
    SessionSnapshot,
};
use crate::peer::PeerContext;
use crate::state::{current_time_ms, DjRequest, PlaybackStatus, SessionSection, SessionState};

#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("Not in a session")]
    NotJoined,

    #[error("Already in a session")]
    AlreadyJoined,

    #[error("Only the DJ can do that")]
    NotDj,

    #[error("Already the DJ")]
    AlreadyDj,

    #[error("{0} has no pending DJ request")]
    NoPendingRequest(String),

    #[error("{0} is not an active member")]
    InactiveMember(String),
}

pub struct MembershipManager {
    ctx: PeerContext,
    /// Between our own join and the first snapshot we accept
    awaiting_snapshot: AtomicBool,
    /// Members seen leaving, with our clock at the time. Heartbeats still
    /// in flight from them must not bring them back.
    departed: Mutex<HashMap<String, u64>>,
}

impl MembershipManager {
    pub fn new(ctx: PeerContext) -> Arc<Self> {
        let manager = Arc::new(Self {
            ctx,
            awaiting_snapshot: AtomicBool::new(false),
            departed: Mutex::new(HashMap::new()),
        });

        let bus = &manager.ctx.bus;
        bus.subscribe_with(&manager, Self::on_member_joined);
        bus.subscribe_with(&manager, Self::on_member_heartbeat);
        bus.subscribe_with(&manager, Self::on_member_left);
        bus.subscribe_with(&manager, Self::on_dj_requested);
        bus.subscribe_with(&manager, Self::on_dj_approved);
        bus.subscribe_with(&manager, Self::on_dj_denied);
        bus.subscribe_with(&manager, Self::on_dj_relinquished);
        bus.subscribe_with(&manager, Self::on_session_snapshot);
        manager
    }

    pub fn is_awaiting_snapshot(&self) -> bool {
        self.awaiting_snapshot.load(Ordering::SeqCst)
    }

    /// Announce ourselves to the session
    pub fn join(&self) -> Result<(), MembershipError> {
        let user = &self.ctx.user;
        let timestamp = current_time_ms();

        self.ctx.store.transact(|state, outbox| {
            if state.session.has_joined_session {
                return Err(MembershipError::AlreadyJoined);
            }
            state.session.has_joined_session = true;
            state.session.upsert_member(&user.user_id, &user.name, timestamp);
            self.awaiting_snapshot.store(true, Ordering::SeqCst);
            outbox.publish(MemberJoined {
                user_id: user.user_id.clone(),
                name: user.name.clone(),
                timestamp,
            });
            Ok(())
        })?;

        info!("Joined session as {} ({})", user.name, user.user_id);
        Ok(())
    }

    /// Repeat our join announcement while no snapshot has arrived, for
    /// peers that connected after the first one went out
    pub fn reannounce(&self) {
        if !self.is_awaiting_snapshot() {
            return;
        }
        let user = &self.ctx.user;
        let joined = self.ctx.store.update_with(|state, outbox| {
            if !state.session.has_joined_session {
                return false;
            }
            outbox.publish(MemberJoined {
                user_id: user.user_id.clone(),
                name: user.name.clone(),
                timestamp: current_time_ms(),
            });
            true
        });
        if joined {
            debug!("Repeated join announcement");
        }
    }

    /// Announce our departure and drop all session state
    pub fn leave(&self) -> Result<(), MembershipError> {
        self.require_joined()?;
        self.ctx.bus.publish(MemberLeft {
            user_id: self.ctx.user.user_id.clone(),
        });
        self.awaiting_snapshot.store(false, Ordering::SeqCst);
        self.departed.lock().clear();
        self.ctx.store.reset();
        info!("Left session");
        Ok(())
    }

    /// Announce liveness and sweep the roster. The DJ also restates its
    /// seat and the queue.
    pub fn heartbeat(&self, now_ms: u64) {
        let user = &self.ctx.user;
        let beat = self.ctx.store.read(|state| {
            if !state.session.has_joined_session {
                return None;
            }
            let is_dj = state.session.is_dj(&user.user_id);
            Some(MemberHeartbeat {
                user_id: user.user_id.clone(),
                name: user.name.clone(),
                timestamp: now_ms,
                is_dj,
                queue: is_dj.then(|| state.queue.clone()),
            })
        });
        let Some(beat) = beat else {
            return;
        };
        self.ctx.bus.publish(beat);
        self.sweep(now_ms);
    }

    /// Recompute activity, expire old DJ requests and, if configured,
    /// remove long-inactive members
    pub fn sweep(&self, now_ms: u64) {
        let config = &self.ctx.config;
        let me = self.ctx.user_id();
        let expiry_ms = config.dj_request_expiry.as_millis() as u64;
        let prune_ms = config.prune_after.map(|d| d.as_millis() as u64);

        let stale_ms = config.stale_after_ms();
        self.departed
            .lock()
            .retain(|_, left_at| now_ms.saturating_sub(*left_at) <= stale_ms);

        self.ctx.store.update(|state| {
            let session = &mut state.session;
            session.refresh_activity(now_ms, config.stale_after_ms());

            session.active_requests.retain(|r| {
                let keep = now_ms.saturating_sub(r.timestamp) <= expiry_ms;
                if !keep {
                    debug!("DJ request from {} expired", r.user_id);
                }
                keep
            });

            if let Some(prune_ms) = prune_ms {
                let stale: Vec<String> = session
                    .members
                    .values()
                    .filter(|m| m.user_id != me && now_ms.saturating_sub(m.last_activity) > prune_ms)
                    .map(|m| m.user_id.clone())
                    .collect();
                for user_id in stale {
                    info!("Pruning inactive member {}", user_id);
                    session.remove_member(&user_id);
                }
            }
        });
    }

    /// Ask to become DJ
    pub fn request_dj(&self) -> Result<(), MembershipError> {
        let user = &self.ctx.user;
        self.ctx.store.transact(|state, outbox| {
            require_joined(state)?;
            if state.session.is_dj(&user.user_id) {
                return Err(MembershipError::AlreadyDj);
            }
            outbox.publish(DjRequested {
                user_id: user.user_id.clone(),
                user_name: user.name.clone(),
                timestamp: current_time_ms(),
            });
            Ok(())
        })
    }

    /// Grant the DJ role to a pending requester. Allowed for the DJ, or
    /// for anyone while the seat is vacant.
    pub fn approve(&self, user_id: &str) -> Result<(), MembershipError> {
        let me = self.ctx.user_id();
        self.ctx.store.transact(|state, outbox| {
            self.require_arbiter(state)?;
            if !state.session.active_requests.iter().any(|r| r.user_id == user_id) {
                return Err(MembershipError::NoPendingRequest(user_id.to_string()));
            }
            if !state.session.members.get(user_id).is_some_and(|m| m.is_active) {
                return Err(MembershipError::InactiveMember(user_id.to_string()));
            }
            outbox.publish(DjApproved {
                user_id: user_id.to_string(),
                approved_by: me.to_string(),
            });
            Ok(())
        })
    }

    pub fn deny(&self, user_id: &str) -> Result<(), MembershipError> {
        self.ctx.store.transact(|state, outbox| {
            self.require_arbiter(state)?;
            if !state.session.active_requests.iter().any(|r| r.user_id == user_id) {
                return Err(MembershipError::NoPendingRequest(user_id.to_string()));
            }
            outbox.publish(DjDenied {
                user_id: user_id.to_string(),
            });
            Ok(())
        })
    }

    /// Step down, leaving the seat vacant
    pub fn relinquish(&self) -> Result<(), MembershipError> {
        let me = self.ctx.user_id();
        self.ctx.store.transact(|state, outbox| {
            require_joined(state)?;
            if !state.session.is_dj(me) {
                return Err(MembershipError::NotDj);
            }
            outbox.publish(DjRelinquished {
                user_id: me.to_string(),
            });
            Ok(())
        })
    }

    fn require_joined(&self) -> Result<(), MembershipError> {
        self.ctx.store.read(require_joined)
    }

    fn require_arbiter(&self, state: &SessionState) -> Result<(), MembershipError> {
        require_joined(state)?;
        match &state.session.dj_user_id {
            Some(dj) if dj != self.ctx.user_id() => Err(MembershipError::NotDj),
            _ => Ok(()),
        }
    }

    /// Whether we are the one peer that answers `joiner` with a snapshot:
    /// the DJ, or with the seat vacant the active member with the smallest id
    fn answers_joiner(&self, session: &SessionSection, joiner: &str) -> bool {
        let me = self.ctx.user_id();
        match &session.dj_user_id {
            Some(dj) if dj != joiner => dj == me,
            _ => {
                session
                    .members
                    .values()
                    .filter(|m| m.is_active && m.user_id != joiner)
                    .map(|m| m.user_id.as_str())
                    .min()
                    == Some(me)
            }
        }
    }

    fn on_member_joined(&self, delivery: &Delivery<MemberJoined>) -> HandlerResult {
        let joined = &delivery.payload;
        if !delivery.local && joined.user_id == self.ctx.user_id() {
            warn!("Ignoring join announcement carrying our own user id");
            return Ok(());
        }

        self.departed.lock().remove(&joined.user_id);
        let timestamp = joined.timestamp.min(current_time_ms());
        let answered = self.ctx.store.update_with(|state, outbox| {
            state.session.upsert_member(&joined.user_id, &joined.name, timestamp);

            if delivery.local
                || !state.session.has_joined_session
                || !self.answers_joiner(&state.session, &joined.user_id)
            {
                return false;
            }
            outbox.publish(SessionSnapshot {
                session: state.session.clone(),
                queue: state.queue.clone(),
                current_video: state.player.current_video.clone(),
                playback_state: state.player.playback_state,
                current_time: state.player.current_time,
            });
            true
        });

        if answered {
            // Having answered, our own view is the authoritative one
            self.awaiting_snapshot.store(false, Ordering::SeqCst);
            debug!("Sent session snapshot to {}", joined.user_id);
        }
        if !delivery.local {
            info!("{} joined the session", joined.name);
        }
        Ok(())
    }

    fn on_member_heartbeat(&self, delivery: &Delivery<MemberHeartbeat>) -> HandlerResult {
        let beat = &delivery.payload;
        let now = current_time_ms();
        if self.recently_departed(&beat.user_id, now) {
            debug!("Ignoring heartbeat from departed member {}", beat.user_id);
            return Ok(());
        }

        // A clock running ahead of ours must not keep a silent member active
        let timestamp = beat.timestamp.min(now);
        let seat = self.ctx.store.update(|state| {
            let session = &mut state.session;
            if !session.has_joined_session {
                return None;
            }
            session.upsert_member(&beat.user_id, &beat.name, timestamp);
            if delivery.local {
                return None;
            }
            match (beat.is_dj, session.is_dj(&beat.user_id)) {
                (true, false) => {
                    session.grant_dj(&beat.user_id);
                    Some(true)
                }
                (false, true) => {
                    session.vacate_dj();
                    Some(false)
                }
                _ => None,
            }
        });

        match seat {
            Some(true) => info!("{} is the DJ (learned from heartbeat)", beat.user_id),
            Some(false) => info!("{} no longer holds the DJ seat (learned from heartbeat)", beat.user_id),
            None => {}
        }
        Ok(())
    }

    fn recently_departed(&self, user_id: &str, now_ms: u64) -> bool {
        let stale_ms = self.ctx.config.stale_after_ms();
        self.departed
            .lock()
            .get(user_id)
            .is_some_and(|left_at| now_ms.saturating_sub(*left_at) <= stale_ms)
    }

    fn on_member_left(&self, delivery: &Delivery<MemberLeft>) -> HandlerResult {
        if delivery.local {
            return Ok(());
        }
        let user_id = &delivery.payload.user_id;
        self.departed.lock().insert(user_id.clone(), current_time_ms());
        let removed = self.ctx.store.update(|state| state.session.remove_member(user_id));
        if let Some(member) = removed {
            info!("{} left the session", member.name);
        }
        Ok(())
    }

    fn on_dj_requested(&self, delivery: &Delivery<DjRequested>) -> HandlerResult {
        let request = &delivery.payload;
        self.ctx.store.update(|state| {
            if state.session.is_dj(&request.user_id) {
                return;
            }
            state.session.upsert_request(DjRequest {
                user_id: request.user_id.clone(),
                user_name: request.user_name.clone(),
                timestamp: request.timestamp,
            });
        });
        debug!("{} requested the DJ role", request.user_name);
        Ok(())
    }

    fn on_dj_approved(&self, delivery: &Delivery<DjApproved>) -> HandlerResult {
        let approval = &delivery.payload;
        self.ctx
            .store
            .update(|state| state.session.grant_dj(&approval.user_id));

        if approval.user_id == self.ctx.user_id() {
            self.awaiting_snapshot.store(false, Ordering::SeqCst);
        }
        info!("{} is now the DJ (approved by {})", approval.user_id, approval.approved_by);
        Ok(())
    }

    fn on_dj_denied(&self, delivery: &Delivery<DjDenied>) -> HandlerResult {
        self.ctx.store.update(|state| {
            state.session.remove_request(&delivery.payload.user_id);
        });
        Ok(())
    }

    fn on_dj_relinquished(&self, delivery: &Delivery<DjRelinquished>) -> HandlerResult {
        let user_id = &delivery.payload.user_id;
        let vacated = self.ctx.store.update(|state| {
            if !state.session.is_dj(user_id) {
                return false;
            }
            state.session.vacate_dj();
            true
        });
        if vacated {
            info!("{} stepped down as DJ", user_id);
        }
        Ok(())
    }

    fn on_session_snapshot(&self, delivery: &Delivery<SessionSnapshot>) -> HandlerResult {
        if delivery.local || !self.awaiting_snapshot.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let snapshot = &delivery.payload;
        let me = self.ctx.user_id();
        self.ctx.store.update_with(|state, outbox| {
            let mut session = snapshot.session.clone();
            session.has_joined_session = true;
            if let Some(mut own) = state.session.members.get(me).cloned() {
                own.is_dj = session.is_dj(me);
                session.members.insert(me.to_string(), own);
            }
            state.session = session;
            state.queue = snapshot.queue.clone();

            // The player section follows once our player has loaded it

            if let Some(video) = &snapshot.current_video {
                outbox.publish(LocalPlayerCommandEvent(PlayerCommand::Load {
                    video_id: video.id.clone(),
                    start_seconds: Some(snapshot.current_time),
                }));
                match snapshot.playback_state {
                    PlaybackStatus::Playing => outbox.publish(LocalPlayerCommandEvent(PlayerCommand::Play)),
                    PlaybackStatus::Paused => outbox.publish(LocalPlayerCommandEvent(PlayerCommand::Pause)),
                    _ => {}
                }
            }
        });

        info!(
            "Applied session snapshot from {} ({} members, {} queued)",
            delivery.from,
            snapshot.session.members.len(),
            snapshot.queue.items.len()
        );
        Ok(())
    }
}

fn require_joined(state: &SessionState) -> Result<(), MembershipError> {
    if state.session.has_joined_session {
        Ok(())
    } else {
        Err(MembershipError::NotJoined)
    }
}
