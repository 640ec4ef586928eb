//! Playback Coordinator
//!
//! The DJ issues transport commands, which every peer (the DJ included)
//! mirrors on its own player. Followers also poll the DJ's position and
//! correct drift with local-only seeks.
//!
//! Player calls run one at a time on a worker task so that commands reach
//! the player in the order they were published. The player section of the
//! store only changes once the player has accepted a command.

mod calibrator;
mod reconcile;

pub use calibrator::{new_shared_calibrator, SeekLeadCalibrator, SharedCalibrator};
pub use reconcile::Reconciler;

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::bus::{
    CurrentTimeResponse, Delivery, GetCurrentTimeRequest, HandlerResult, LoadVideo,
    LocalPlayerCommandEvent, Outbox, PlayerCommand, PlayerCommandEvent, PlayerFailed, QueueNext,
};
use crate::peer::PeerContext;
use crate::player::{PlayerDriver, PlayerError, PlayerEvent, PlayerStatus};
use crate::queue::{QueueError, QueueManager};
use crate::state::{PlaybackStatus, QueueItem, SessionState};

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("Only the DJ can control playback")]
    NotDj,

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Work for the player worker
enum PlayerOp {
    Command {
        command: PlayerCommand,
        /// Queue entry to show for a load, instead of looking it up
        item: Option<QueueItem>,
        /// Publish `PlayerFailed` if the player refuses
        report: bool,
    },
    /// Answer a follower's time request
    ReportTime { request_id: String },
    /// Compare against the DJ's position and seek if too far off
    Correct { dj_time: f64 },
    Barrier(oneshot::Sender<()>),
}

pub struct PlaybackCoordinator {
    ctx: PeerContext,
    queue: Arc<QueueManager>,
    ops: mpsc::UnboundedSender<PlayerOp>,
    reconciler: Mutex<Reconciler>,
    calibrator: SharedCalibrator,
}

impl PlaybackCoordinator {
    /// Must be called within a tokio runtime; spawns the player worker
    pub fn new(ctx: PeerContext, queue: Arc<QueueManager>, player: Arc<dyn PlayerDriver>) -> Arc<Self> {
        let (ops, rx) = mpsc::unbounded_channel();
        let calibrator = new_shared_calibrator();

        tokio::spawn(run_player_worker(ctx.clone(), player, Arc::clone(&calibrator), rx));

        let coordinator = Arc::new(Self {
            ctx,
            queue,
            ops,
            reconciler: Mutex::new(Reconciler::new()),
            calibrator,
        });

        let bus = &coordinator.ctx.bus;
        bus.subscribe_with(&coordinator, Self::on_player_command);
        bus.subscribe_with(&coordinator, Self::on_local_player_command);
        bus.subscribe_with(&coordinator, Self::on_load_video);
        bus.subscribe_with(&coordinator, Self::on_queue_next);
        bus.subscribe_with(&coordinator, Self::on_time_request);
        bus.subscribe_with(&coordinator, Self::on_time_response);
        coordinator
    }

    pub fn play(&self) -> Result<(), PlaybackError> {
        self.command(PlayerCommand::Play)
    }

    pub fn pause(&self) -> Result<(), PlaybackError> {
        self.command(PlayerCommand::Pause)
    }

    pub fn seek(&self, seconds: f64) -> Result<(), PlaybackError> {
        self.command(PlayerCommand::Seek {
            seconds: seconds.max(0.0),
        })
    }

    /// Load a video on every peer
    pub fn load(&self, video_id: &str, start_seconds: Option<f64>) -> Result<(), PlaybackError> {
        self.as_dj(|_, outbox| {
            outbox.publish(LoadVideo {
                video_id: video_id.to_string(),
                start_seconds,
            });
        })
    }

    /// Advance the queue. Stops playback everywhere once it is exhausted.
    pub fn skip(&self) -> Result<Option<QueueItem>, PlaybackError> {
        let next = self.queue.advance()?;
        match &next {
            Some(item) => info!("Advanced to {}", item.title),
            None => {
                info!("Queue exhausted, stopping playback");
                self.command(PlayerCommand::Stop)?;
            }
        }
        Ok(next)
    }

    /// Jump to a queue position
    pub fn play_index(&self, index: usize) -> Result<QueueItem, PlaybackError> {
        Ok(self.queue.select(index)?)
    }

    /// Mirror a polled status into the store
    pub fn record_status(&self, status: &PlayerStatus) {
        self.ctx.store.update(|state| {
            state.player.is_ready = status.is_ready;
            state.player.current_time = status.current_time;
            state.player.duration = status.duration;
        });
    }

    /// React to a local player transition
    pub fn on_player_event(&self, event: PlayerEvent) {
        debug!("Player event: {:?}", event);
        match event {
            PlayerEvent::Ready => self.ctx.store.update(|state| state.player.is_ready = true),
            PlayerEvent::StateChanged(status) => {
                self.ctx.store.update(|state| state.player.playback_state = status)
            }
            PlayerEvent::Ended => {
                self.ctx
                    .store
                    .update(|state| state.player.playback_state = PlaybackStatus::Ended);
                if self.ctx.is_dj() {
                    if let Err(e) = self.skip() {
                        warn!("Failed to advance after video ended: {}", e);
                    }
                }
            }
        }
    }

    /// Ask the DJ for its position. Only followers with a DJ to ask send
    /// anything; returns the request id if one was sent.
    pub fn request_time_sync(&self) -> Option<String> {
        let me = self.ctx.user_id();
        let should_ask = self.ctx.store.read(|state| {
            state.session.has_joined_session
                && state.session.dj_user_id.is_some()
                && !state.session.is_dj(me)
        });
        if !should_ask {
            return None;
        }

        let request_id = {
            let mut reconciler = self.reconciler.lock();
            let now = Instant::now();
            let expired = reconciler.expire(now, self.ctx.config.time_request_timeout);
            if expired > 0 {
                debug!("Abandoned {} unanswered time requests", expired);
            }
            reconciler.begin_request_at(now)
        };

        self.ctx.bus.publish(GetCurrentTimeRequest {
            request_id: request_id.clone(),
        });
        Some(request_id)
    }

    /// Wait until every player call queued so far has run
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.send(PlayerOp::Barrier(tx));
        let _ = rx.await;
    }

    /// Current seek lead in milliseconds
    pub fn seek_lead_ms(&self) -> u64 {
        self.calibrator.read().lead_ms()
    }

    /// Forget reconciliation history (on leave)
    pub fn reset(&self) {
        self.reconciler.lock().clear();
        self.calibrator.write().reset();
    }

    fn command(&self, command: PlayerCommand) -> Result<(), PlaybackError> {
        self.as_dj(|_, outbox| outbox.publish(PlayerCommandEvent(command)))
    }

    fn as_dj(&self, f: impl FnOnce(&SessionState, &mut Outbox)) -> Result<(), PlaybackError> {
        let me = self.ctx.user_id();
        self.ctx.store.transact(|state, outbox| {
            if !state.session.is_dj(me) {
                return Err(PlaybackError::NotDj);
            }
            f(state, outbox);
            Ok(())
        })
    }

    fn send(&self, op: PlayerOp) {
        if self.ops.send(op).is_err() {
            warn!("Player worker has stopped");
        }
    }

    /// Hand a command to the player. Failures of our own DJ commands are
    /// reported back to the host.
    fn mirror(&self, command: PlayerCommand, item: Option<QueueItem>, report: bool) {
        self.send(PlayerOp::Command { command, item, report });
    }

    fn from_dj(&self, from: &str) -> bool {
        self.ctx.store.read(|state| state.session.is_dj(from))
    }

    fn on_player_command(&self, delivery: &Delivery<PlayerCommandEvent>) -> HandlerResult {
        if !self.from_dj(&delivery.from) {
            warn!("Ignoring player command from non-DJ {}", delivery.from);
            return Ok(());
        }
        debug!("Mirroring {:?} from {}", delivery.payload.0, delivery.from);
        self.mirror(delivery.payload.0.clone(), None, delivery.local);
        Ok(())
    }

    fn on_local_player_command(&self, delivery: &Delivery<LocalPlayerCommandEvent>) -> HandlerResult {
        self.mirror(delivery.payload.0.clone(), None, false);
        Ok(())
    }

    fn on_load_video(&self, delivery: &Delivery<LoadVideo>) -> HandlerResult {
        if !self.from_dj(&delivery.from) {
            warn!("Ignoring load from non-DJ {}", delivery.from);
            return Ok(());
        }
        self.mirror(
            PlayerCommand::Load {
                video_id: delivery.payload.video_id.clone(),
                start_seconds: delivery.payload.start_seconds,
            },
            None,
            delivery.local,
        );
        Ok(())
    }

    fn on_queue_next(&self, delivery: &Delivery<QueueNext>) -> HandlerResult {
        if !self.from_dj(&delivery.from) {
            warn!("Ignoring queue advance from non-DJ {}", delivery.from);
            return Ok(());
        }

        let item = delivery.payload.video_item.clone();
        let command = PlayerCommand::Load {
            video_id: item.id.clone(),
            start_seconds: None,
        };
        self.mirror(command, Some(item), delivery.local);
        Ok(())
    }

    fn on_time_request(&self, delivery: &Delivery<GetCurrentTimeRequest>) -> HandlerResult {
        if delivery.local || !self.ctx.is_dj() {
            return Ok(());
        }
        self.send(PlayerOp::ReportTime {
            request_id: delivery.payload.request_id.clone(),
        });
        Ok(())
    }

    fn on_time_response(&self, delivery: &Delivery<CurrentTimeResponse>) -> HandlerResult {
        if delivery.local {
            return Ok(());
        }

        let response = &delivery.payload;
        let latency_ms = {
            let mut reconciler = self.reconciler.lock();
            if reconciler.resolve(&response.request_id).is_none() {
                debug!("Discarding unmatched time response {}", response.request_id);
                return Ok(());
            }
            reconciler.one_way_latency_ms()
        };

        if !self.from_dj(&delivery.from) {
            debug!("Discarding time response from non-DJ {}", delivery.from);
            return Ok(());
        }

        // The DJ kept playing while the response was in flight
        let playing = self
            .ctx
            .store
            .read(|state| state.player.playback_state == PlaybackStatus::Playing);
        let dj_time = if playing {
            response.current_time + latency_ms as f64 / 1000.0
        } else {
            response.current_time
        };

        self.send(PlayerOp::Correct { dj_time });
        Ok(())
    }
}

/// Reflect a command in the player section. `item` overrides the lookup of
/// a loaded video in the queue.
fn apply_to_player(state: &mut SessionState, command: &PlayerCommand, item: Option<QueueItem>) {
    let player = &mut state.player;
    match command {
        PlayerCommand::Play => player.playback_state = PlaybackStatus::Playing,
        PlayerCommand::Pause => player.playback_state = PlaybackStatus::Paused,
        PlayerCommand::Seek { seconds } => player.current_time = *seconds,
        PlayerCommand::Stop => {
            player.current_video = None;
            player.playback_state = PlaybackStatus::Paused;
            player.current_time = 0.0;
        }
        PlayerCommand::Load {
            video_id,
            start_seconds,
        } => {
            let item = item
                .or_else(|| state.queue.items.iter().find(|i| &i.id == video_id).cloned())
                .unwrap_or_else(|| QueueItem {
                    id: video_id.clone(),
                    title: video_id.clone(),
                    duration: 0.0,
                    thumbnail: None,
                    added_by: String::new(),
                });
            player.current_video = Some(item);
            player.current_time = start_seconds.unwrap_or(0.0);
            player.playback_state = PlaybackStatus::Buffering;
        }
    }
}

async fn apply_command(player: &dyn PlayerDriver, command: &PlayerCommand) -> Result<(), PlayerError> {
    match command {
        PlayerCommand::Play => player.play().await,
        PlayerCommand::Pause | PlayerCommand::Stop => player.pause().await,
        PlayerCommand::Seek { seconds } => player.seek(*seconds).await,
        PlayerCommand::Load {
            video_id,
            start_seconds,
        } => player.load(video_id, *start_seconds).await,
    }
}

async fn run_player_worker(
    ctx: PeerContext,
    player: Arc<dyn PlayerDriver>,
    calibrator: SharedCalibrator,
    mut rx: mpsc::UnboundedReceiver<PlayerOp>,
) {
    debug!("Player worker started");

    while let Some(op) = rx.recv().await {
        match op {
            PlayerOp::Command { command, item, report } => {
                let result = apply_command(player.as_ref(), &command).await;
                match result {
                    Ok(()) => ctx.store.update(|state| apply_to_player(state, &command, item)),
                    Err(e) => {
                        warn!("Player rejected {:?}: {}", command, e);
                        if report {
                            ctx.bus.publish(PlayerFailed {
                                command,
                                message: e.to_string(),
                            });
                        }
                    }
                }
            }
            PlayerOp::ReportTime { request_id } => match player.status().await {
                Ok(status) => ctx.bus.publish(CurrentTimeResponse {
                    request_id,
                    current_time: status.current_time,
                    duration: status.duration,
                }),
                Err(e) => warn!("Could not read position for time request: {}", e),
            },
            PlayerOp::Correct { dj_time } => {
                if let Err(e) = correct_drift(&ctx, player.as_ref(), &calibrator, dj_time).await {
                    warn!("Drift correction failed: {}", e);
                }
            }
            PlayerOp::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }

    debug!("Player worker ended");
}

async fn correct_drift(
    ctx: &PeerContext,
    player: &dyn PlayerDriver,
    calibrator: &SharedCalibrator,
    dj_time: f64,
) -> Result<(), PlayerError> {
    let local_time = player.current_time().await?;
    let drift = local_time - dj_time;
    let calibrate = ctx.config.calibrate_seek_lead;

    if calibrate {
        calibrator.write().measure(drift * 1000.0);
    }

    if drift.abs() <= ctx.config.drift_tolerance_secs {
        return Ok(());
    }

    let lead = if calibrate { calibrator.read().lead_secs() } else { 0.0 };
    let target = dj_time + lead;
    info!("Drift {:+.2}s exceeds tolerance, seeking to {:.2}s", drift, target);

    player.seek(target).await?;
    if calibrate {
        calibrator.write().mark_seek();
    }
    ctx.store.update(|state| state.player.current_time = target);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Envelope, WireEvent};
    use crate::config::SyncConfig;
    use crate::peer::LocalUser;
    use crate::queue::QueueLibrary;
    use assert_matches::assert_matches;
    use async_trait::async_trait;

    /// Records every call; reports a fixed position
    #[derive(Default)]
    struct FakePlayer {
        calls: Mutex<Vec<String>>,
        position: Mutex<f64>,
    }

    #[async_trait]
    impl PlayerDriver for FakePlayer {
        async fn load(&self, video_id: &str, start: Option<f64>) -> Result<(), PlayerError> {
            self.calls.lock().push(format!("load {} {:?}", video_id, start));
            Ok(())
        }
        async fn play(&self) -> Result<(), PlayerError> {
            self.calls.lock().push("play".into());
            Ok(())
        }
        async fn pause(&self) -> Result<(), PlayerError> {
            self.calls.lock().push("pause".into());
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
                duration: 200.0,
            })
        }
    }

    /// Refuses everything
    struct BrokenPlayer;

    #[async_trait]
    impl PlayerDriver for BrokenPlayer {
        async fn load(&self, _: &str, _: Option<f64>) -> Result<(), PlayerError> {
            Err(PlayerError::NotReachable)
        }
        async fn play(&self) -> Result<(), PlayerError> {
            Err(PlayerError::NotReachable)
        }
        async fn pause(&self) -> Result<(), PlayerError> {
            Err(PlayerError::NotReachable)
        }
        async fn seek(&self, _: f64) -> Result<(), PlayerError> {
            Err(PlayerError::NotReachable)
        }
        async fn status(&self) -> Result<PlayerStatus, PlayerError> {
            Err(PlayerError::NotReachable)
        }
    }

    fn setup(me: &str, dj: &str) -> (Arc<PlaybackCoordinator>, PeerContext, Arc<FakePlayer>) {
        let player = Arc::new(FakePlayer::default());
        let (coordinator, ctx) = setup_with(me, dj, player.clone());
        (coordinator, ctx, player)
    }

    fn setup_with(me: &str, dj: &str, player: Arc<dyn PlayerDriver>) -> (Arc<PlaybackCoordinator>, PeerContext) {
        let config = SyncConfig {
            calibrate_seek_lead: false,
            ..SyncConfig::default()
        };
        let ctx = PeerContext::new(LocalUser::new(me, me), config);
        ctx.store.update(|s| {
            s.session.has_joined_session = true;
            s.session.upsert_member(me, me, 1);
            s.session.upsert_member(dj, dj, 1);
            s.session.grant_dj(dj);
        });
        let queue = QueueManager::new(ctx.clone(), Arc::new(QueueLibrary::in_memory()));
        let coordinator = PlaybackCoordinator::new(ctx.clone(), queue, player);
        (coordinator, ctx)
    }

    fn record_failures(ctx: &PeerContext) -> Arc<Mutex<Vec<PlayerFailed>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        ctx.bus.subscribe(move |d: &Delivery<PlayerFailed>| {
            sink.lock().push(d.payload.clone());
            Ok(())
        });
        seen
    }

    fn remote(ctx: &PeerContext, from: &str, event: WireEvent) {
        ctx.bus.receive(Envelope {
            from: from.to_string(),
            event,
        });
    }

    #[tokio::test]
    async fn test_dj_command_drives_own_player() {
        let (playback, ctx, player) = setup("dj", "dj");
        playback.load("vid", Some(5.0)).unwrap();
        playback.play().unwrap();
        playback.flush().await;

        assert_eq!(*player.calls.lock(), vec!["load vid Some(5.0)", "play"]);
        let state = ctx.store.snapshot().player;
        assert_eq!(state.playback_state, PlaybackStatus::Playing);
        assert_eq!(state.current_video.map(|v| v.id), Some("vid".to_string()));
    }

    #[tokio::test]
    async fn test_follower_cannot_command() {
        let (playback, _, player) = setup("me", "dj");
        assert_matches!(playback.play(), Err(PlaybackError::NotDj));
        playback.flush().await;
        assert!(player.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_commands_from_non_dj_ignored() {
        let (playback, ctx, player) = setup("me", "dj");
        remote(&ctx, "rogue", WireEvent::PlayerCommand(PlayerCommandEvent(PlayerCommand::Pause)));
        remote(&ctx, "dj", WireEvent::PlayerCommand(PlayerCommandEvent(PlayerCommand::Play)));
        playback.flush().await;
        assert_eq!(*player.calls.lock(), vec!["play"]);
    }

    #[tokio::test]
    async fn test_unmatched_response_never_seeks() {
        let (playback, ctx, player) = setup("me", "dj");
        *player.position.lock() = 10.0;

        remote(
            &ctx,
            "dj",
            WireEvent::CurrentTimeResponse(CurrentTimeResponse {
                request_id: "someone-else".into(),
                current_time: 100.0,
                duration: 200.0,
            }),
        );
        playback.flush().await;
        assert!(player.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_matched_response_corrects_drift() {
        let (playback, ctx, player) = setup("me", "dj");
        *player.position.lock() = 10.0;

        let request_id = playback.request_time_sync().unwrap();
        remote(
            &ctx,
            "dj",
            WireEvent::CurrentTimeResponse(CurrentTimeResponse {
                request_id: request_id.clone(),
                current_time: 40.0,
                duration: 200.0,
            }),
        );
        playback.flush().await;
        assert_eq!(*player.calls.lock(), vec!["seek 40.0"]);

        // Same id again is stale
        remote(
            &ctx,
            "dj",
            WireEvent::CurrentTimeResponse(CurrentTimeResponse {
                request_id,
                current_time: 80.0,
                duration: 200.0,
            }),
        );
        playback.flush().await;
        assert_eq!(player.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_small_drift_tolerated() {
        let (playback, ctx, player) = setup("me", "dj");
        *player.position.lock() = 40.5;

        let request_id = playback.request_time_sync().unwrap();
        remote(
            &ctx,
            "dj",
            WireEvent::CurrentTimeResponse(CurrentTimeResponse {
                request_id,
                current_time: 40.0,
                duration: 200.0,
            }),
        );
        playback.flush().await;
        assert!(player.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_dj_does_not_request_time() {
        let (playback, _, _) = setup("dj", "dj");
        assert!(playback.request_time_sync().is_none());
    }

    #[tokio::test]
    async fn test_skip_past_end_stops() {
        let (playback, ctx, player) = setup("dj", "dj");
        playback
            .queue
            .add(QueueItem {
                id: "only".into(),
                title: "Only".into(),
                duration: 10.0,
                thumbnail: None,
                added_by: "dj".into(),
            })
            .unwrap();

        playback.play_index(0).unwrap();
        playback.on_player_event(PlayerEvent::Ended);
        playback.flush().await;

        assert_eq!(*player.calls.lock(), vec!["load only None", "pause"]);
        let state = ctx.store.snapshot();
        assert_eq!(state.queue.current_index, None);
        assert!(state.player.current_video.is_none());
    }

    #[tokio::test]
    async fn test_refused_dj_command_leaves_state_and_reports() {
        let (playback, ctx) = setup_with("dj", "dj", Arc::new(BrokenPlayer));
        let failures = record_failures(&ctx);

        playback.load("vid", None).unwrap();
        playback.play().unwrap();
        playback.flush().await;

        let state = ctx.store.snapshot().player;
        assert!(state.current_video.is_none());
        assert_eq!(state.playback_state, PlaybackStatus::Unstarted);

        let failures = failures.lock();
        assert_eq!(failures.len(), 2);
        assert_matches!(&failures[0].command, PlayerCommand::Load { video_id, .. } if video_id == "vid");
        assert_eq!(failures[1].command, PlayerCommand::Play);
    }

    #[tokio::test]
    async fn test_refused_mirror_is_not_reported() {
        let (playback, ctx) = setup_with("me", "dj", Arc::new(BrokenPlayer));
        let failures = record_failures(&ctx);

        remote(&ctx, "dj", WireEvent::PlayerCommand(PlayerCommandEvent(PlayerCommand::Play)));
        playback.flush().await;

        assert_eq!(ctx.store.snapshot().player.playback_state, PlaybackStatus::Unstarted);
        assert!(failures.lock().is_empty());
    }
}
