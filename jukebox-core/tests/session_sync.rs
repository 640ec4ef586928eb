//! Multi-peer scenarios over the in-process hub

mod common;

use std::time::Duration;

use assert_matches::assert_matches;

use common::*;
use jukebox_core::bus::{DjApproved, Envelope, MemberHeartbeat, WireEvent};
use jukebox_core::membership::MembershipError;
use jukebox_core::playback::PlaybackError;
use jukebox_core::queue::{AddOutcome, QueueError};
use jukebox_core::state::{current_time_ms, PlaybackStatus};
use jukebox_core::LocalHub;

#[tokio::test]
async fn test_first_peer_becomes_dj_by_self_approval() {
    let hub = LocalHub::new();
    let alice = joined_dj(&hub, "alice");

    let session = alice.peer.store().snapshot().session;
    assert!(session.has_joined_session);
    assert_eq!(session.dj_user_id.as_deref(), Some("alice"));
    assert!(session.members["alice"].is_dj);
    assert!(session.active_requests.is_empty());
    assert!(alice.peer.context().is_dj());
}

#[tokio::test]
async fn test_late_joiner_receives_snapshot() {
    let hub = LocalHub::new();
    let alice = joined_dj(&hub, "alice");
    alice.peer.queue.add(video("a")).unwrap();
    alice.peer.queue.add(video("b")).unwrap();
    alice.peer.playback.play_index(0).unwrap();
    alice.peer.playback.play().unwrap();
    alice.flush().await;

    let bob = joined(&hub, "bob");
    bob.flush().await;

    let state = bob.peer.store().snapshot();
    assert_eq!(state.session.dj_user_id.as_deref(), Some("alice"));
    assert_eq!(state.session.members.len(), 2);
    assert!(!state.session.members["bob"].is_dj);
    assert_eq!(state.queue.items.len(), 2);
    assert_eq!(state.queue.current_index, Some(0));
    assert_eq!(state.player.current_video.map(|v| v.id), Some("a".to_string()));
    assert_eq!(bob.player.calls(), vec!["load a Some(0.0)", "play"]);
    assert!(!bob.peer.membership.is_awaiting_snapshot());

    // The DJ learned about the joiner as well
    assert!(alice.peer.store().snapshot().session.members.contains_key("bob"));
}

#[tokio::test]
async fn test_only_dj_answers_joiner() {
    let hub = LocalHub::new();
    let alice = joined_dj(&hub, "alice");
    let bob = joined(&hub, "bob");
    alice.peer.queue.add(video("a")).unwrap();

    // Bob already has his snapshot; carol's comes from the DJ alone
    let carol = joined(&hub, "carol");
    let state = carol.peer.store().snapshot();
    assert_eq!(state.session.members.len(), 3);
    assert_eq!(state.queue.items.len(), 1);
    assert_eq!(bob.peer.store().snapshot().session.members.len(), 3);
}

#[tokio::test]
async fn test_dj_role_is_a_singleton() {
    let hub = LocalHub::new();
    let alice = joined_dj(&hub, "alice");
    let bob = joined(&hub, "bob");

    bob.peer.membership.request_dj().unwrap();
    assert_eq!(alice.peer.store().snapshot().session.active_requests.len(), 1);

    // Only the sitting DJ arbitrates
    assert_matches!(bob.peer.membership.approve("bob"), Err(MembershipError::NotDj));
    alice.peer.membership.approve("bob").unwrap();

    for peer in [&alice, &bob] {
        let session = peer.peer.store().snapshot().session;
        assert_eq!(session.dj_user_id.as_deref(), Some("bob"));
        assert!(session.members["bob"].is_dj);
        assert!(!session.members["alice"].is_dj);
        assert!(session.dj_is_consistent());
        assert!(session.active_requests.is_empty());
    }
    assert_matches!(alice.peer.playback.play(), Err(PlaybackError::NotDj));
}

#[tokio::test]
async fn test_relinquish_leaves_seat_vacant() {
    let hub = LocalHub::new();
    let alice = joined_dj(&hub, "alice");
    let bob = joined(&hub, "bob");

    alice.peer.membership.relinquish().unwrap();
    assert_eq!(bob.peer.store().snapshot().session.dj_user_id, None);

    // With the seat vacant anyone may approve a request
    bob.peer.membership.request_dj().unwrap();
    bob.peer.membership.approve("bob").unwrap();
    assert_eq!(alice.peer.store().snapshot().session.dj_user_id.as_deref(), Some("bob"));
}

#[tokio::test]
async fn test_replayed_events_are_idempotent() {
    let hub = LocalHub::new();
    let _alice = joined_dj(&hub, "alice");
    let bob = joined(&hub, "bob");

    let now = current_time_ms();
    let beat = Envelope {
        from: "alice".to_string(),
        event: WireEvent::MemberHeartbeat(MemberHeartbeat {
            user_id: "alice".to_string(),
            name: "Alice".to_string(),
            timestamp: now,
            is_dj: true,
            queue: Some(Default::default()),
        }),
    };
    let approval = Envelope {
        from: "alice".to_string(),
        event: WireEvent::DjApproved(DjApproved {
            user_id: "alice".to_string(),
            approved_by: "alice".to_string(),
        }),
    };

    bob.peer.bus().receive(beat.clone());
    bob.peer.bus().receive(approval.clone());
    let once = bob.peer.store().snapshot();

    bob.peer.bus().receive(beat);
    bob.peer.bus().receive(approval);
    assert_eq!(bob.peer.store().snapshot(), once);
    assert_eq!(once.session.members["alice"].last_activity, now);
}

#[tokio::test]
async fn test_queue_changes_reach_followers() {
    let hub = LocalHub::new();
    let alice = joined_dj(&hub, "alice");
    let bob = joined(&hub, "bob");

    alice.peer.queue.add(video("a")).unwrap();
    alice.peer.queue.add(video("b")).unwrap();
    alice.peer.queue.add(video("c")).unwrap();
    alice.peer.queue.reorder("c", 0).unwrap();
    alice.peer.queue.remove("b").unwrap();

    let ids: Vec<String> = bob
        .peer
        .store()
        .snapshot()
        .queue
        .items
        .into_iter()
        .map(|i| i.id)
        .collect();
    assert_eq!(ids, vec!["c", "a"]);
    assert_eq!(bob.peer.store().snapshot().queue, alice.peer.store().snapshot().queue);

    // Followers cannot edit the queue directly
    assert_matches!(bob.peer.queue.remove("a"), Err(QueueError::NotDj));
}

#[tokio::test]
async fn test_follower_add_becomes_proposal() {
    let hub = LocalHub::new();
    let alice = joined_dj(&hub, "alice");
    let bob = joined(&hub, "bob");

    assert_eq!(bob.peer.queue.add(video("x")).unwrap(), AddOutcome::Proposed);

    let queue = alice.peer.store().snapshot().queue;
    assert_eq!(queue.items.len(), 1);
    assert_eq!(queue.items[0].id, "x");
    assert_eq!(bob.peer.store().snapshot().queue, queue);

    // A duplicate is rejected locally before it is proposed
    assert_matches!(bob.peer.queue.add(video("x")), Err(QueueError::DuplicateItem(_)));
}

#[tokio::test]
async fn test_dj_commands_mirror_on_every_player() {
    let hub = LocalHub::new();
    let alice = joined_dj(&hub, "alice");
    let bob = joined(&hub, "bob");

    alice.peer.playback.load("v1", Some(12.0)).unwrap();
    alice.peer.playback.play().unwrap();
    alice.peer.playback.seek(30.0).unwrap();
    alice.peer.playback.pause().unwrap();
    alice.flush().await;
    bob.flush().await;

    let expected = vec!["load v1 Some(12.0)", "play", "seek 30.0", "pause"];
    assert_eq!(alice.player.calls(), expected);
    assert_eq!(bob.player.calls(), expected);
    assert_eq!(
        bob.peer.store().snapshot().player.playback_state,
        PlaybackStatus::Paused
    );

    assert_matches!(bob.peer.playback.play(), Err(PlaybackError::NotDj));
}

#[tokio::test]
async fn test_video_end_advances_every_peer() {
    let hub = LocalHub::new();
    let alice = joined_dj(&hub, "alice");
    let bob = joined(&hub, "bob");
    alice.peer.queue.add(video("a")).unwrap();
    alice.peer.queue.add(video("b")).unwrap();
    alice.peer.playback.play_index(0).unwrap();

    // A follower's player ending changes nothing for the session
    bob.peer.playback.on_player_event(jukebox_core::player::PlayerEvent::Ended);
    assert_eq!(alice.peer.store().snapshot().queue.current_index, Some(0));

    alice.peer.playback.on_player_event(jukebox_core::player::PlayerEvent::Ended);
    alice.flush().await;
    bob.flush().await;

    for peer in [&alice, &bob] {
        let state = peer.peer.store().snapshot();
        assert_eq!(state.queue.current_index, Some(1));
        assert_eq!(state.player.current_video.map(|v| v.id), Some("b".to_string()));
        assert_eq!(peer.player.calls(), vec!["load a None", "load b None"]);
    }
}

#[tokio::test]
async fn test_follower_corrects_drift_from_dj_time() {
    let hub = LocalHub::new();
    let alice = joined_dj(&hub, "alice");
    let bob = joined(&hub, "bob");
    alice.player.set_position(50.0);
    bob.player.set_position(10.0);

    assert!(bob.peer.playback.request_time_sync().is_some());
    // DJ answers from its player worker, follower corrects on its own
    alice.flush().await;
    bob.flush().await;

    assert_eq!(bob.player.calls(), vec!["seek 50.0"]);
    assert!(alice.player.calls().is_empty());
    assert!(alice.peer.playback.request_time_sync().is_none());
}

#[tokio::test]
async fn test_leave_removes_member_everywhere() {
    let hub = LocalHub::new();
    let alice = joined_dj(&hub, "alice");
    let bob = joined(&hub, "bob");

    alice.peer.leave().unwrap();

    let session = bob.peer.store().snapshot().session;
    assert!(!session.members.contains_key("alice"));
    assert_eq!(session.dj_user_id, None);
    assert_eq!(alice.peer.store().snapshot(), Default::default());
}

#[tokio::test]
async fn test_missed_queue_updates_heal_on_next_change() {
    let hub = LocalHub::new();
    let alice = joined_dj(&hub, "alice");
    let bob = joined(&hub, "bob");

    hub.set_offline("bob", true);
    alice.peer.queue.add(video("a")).unwrap();
    assert!(bob.peer.store().snapshot().queue.items.is_empty());

    hub.set_offline("bob", false);
    alice.peer.queue.add(video("b")).unwrap();
    assert_eq!(bob.peer.store().snapshot().queue, alice.peer.store().snapshot().queue);
}

#[tokio::test]
async fn test_heartbeat_loop_restores_activity_after_outage() {
    let hub = LocalHub::new();
    let config = jukebox_core::SyncConfig {
        heartbeat_interval: Duration::from_millis(40),
        stale_after: Duration::from_millis(200),
        ..quiet_config()
    };
    let alice = peer_on(&hub, "alice", config.clone());
    alice.peer.join().unwrap();
    let bob = peer_on(&hub, "bob", config);
    bob.peer.join().unwrap();

    let bob_active = |alice: &TestPeer| {
        alice
            .peer
            .store()
            .read(|s| s.session.members.get("bob").map(|m| m.is_active))
    };
    assert_eq!(bob_active(&alice), Some(true));

    hub.set_offline("bob", true);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(bob_active(&alice), Some(false));

    hub.set_offline("bob", false);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(bob_active(&alice), Some(true));

    alice.peer.leave().unwrap();
    bob.peer.leave().unwrap();
}

#[tokio::test]
async fn test_heartbeats_repair_missed_dj_approval() {
    let hub = LocalHub::new();
    let alice = joined_dj(&hub, "alice");
    let bob = joined(&hub, "bob");
    let carol = joined(&hub, "carol");

    bob.peer.membership.request_dj().unwrap();
    hub.set_offline("carol", true);
    alice.peer.membership.approve("bob").unwrap();
    hub.set_offline("carol", false);
    assert_eq!(carol.peer.store().snapshot().session.dj_user_id.as_deref(), Some("alice"));

    heartbeat_round(&[&alice, &bob, &carol]);

    let session = carol.peer.store().snapshot().session;
    assert_eq!(session.dj_user_id.as_deref(), Some("bob"));
    assert!(session.dj_is_consistent());

    bob.peer.playback.play().unwrap();
    for peer in [&alice, &bob, &carol] {
        peer.flush().await;
    }
    assert_eq!(carol.player.calls(), vec!["play"]);
    assert_eq!(bob.player.calls(), vec!["play"]);
}

#[tokio::test]
async fn test_heartbeats_repair_missed_queue_update() {
    let hub = LocalHub::new();
    let alice = joined_dj(&hub, "alice");
    let bob = joined(&hub, "bob");

    hub.set_offline("bob", true);
    alice.peer.queue.add(video("a")).unwrap();
    hub.set_offline("bob", false);
    assert!(bob.peer.store().snapshot().queue.items.is_empty());

    // No further queue change; the DJ's heartbeat alone brings bob back
    heartbeat_round(&[&alice, &bob]);
    assert_eq!(bob.peer.store().snapshot().queue, alice.peer.store().snapshot().queue);
}
