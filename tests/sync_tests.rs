#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Integration tests for the session sync engine.
//!
//! Uses the shared pipe channel from `tests/common` to play the realtime
//! service: acknowledging subscriptions, pushing broadcasts, change
//! records, and presence rosters, and inspecting every frame the engine
//! sends.

mod common;

use std::sync::Arc;
use std::time::Duration;

use thirty_sync::{
    BroadcastEvent, ChangeKind, ClientFrame, ConnectionStatus, GamePhase, GameState, JoinGame,
    MemoryStore, NewPlayer, NewSession, Participant, PlayerRole, SegmentSettings, ServerFrame,
    SessionStore, SessionSync, SharedStore, StartSession, SyncConfig, SyncError,
};

use common::{
    broadcast_frame, code, pid, pipe, player_change, player_row, presence_sync, seeded_store,
    seg, session_change, wait_for, MockChannel, ServiceEnd,
};

// ════════════════════════════════════════════════════════════════════
// Helper: connect an engine over a pipe and complete the handshake
// ════════════════════════════════════════════════════════════════════

/// Connects an engine over a pipe channel, asserts the first frame is the
/// Subscribe for `raw`, and acknowledges it.
async fn connect_subscribed(
    store: SharedStore,
    raw: &str,
) -> (
    SessionSync,
    tokio::sync::watch::Receiver<GameState>,
    ServiceEnd,
) {
    let (channel, mut service) = pipe();
    let (sync, mut state) =
        SessionSync::connect(channel, store, SyncConfig::new(code(raw))).await;

    let first = service.next_frame().await;
    assert_eq!(
        first,
        ClientFrame::Subscribe {
            session_code: code(raw)
        },
        "the engine must subscribe before anything else"
    );
    service.ack_subscribe(&code(raw));
    wait_for(&mut state, |s| s.connection == ConnectionStatus::Subscribed).await;

    (sync, state, service)
}

// ════════════════════════════════════════════════════════════════════
// Subscription lifecycle
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn handshake_subscribes_then_acknowledges() {
    let store = seeded_store("AB12").await;
    let (mut sync, state, _service) = connect_subscribed(store, "AB12").await;

    assert!(sync.is_subscribed());
    assert_eq!(state.borrow().connection, ConnectionStatus::Subscribed);

    sync.disconnect().await;
    assert_eq!(sync.connection(), ConnectionStatus::LocalOnly);
}

#[tokio::test]
async fn service_drop_marks_connection_lost() {
    let store = seeded_store("AB12").await;
    let (sync, mut state, service) = connect_subscribed(store, "AB12").await;

    drop(service);
    wait_for(&mut state, |s| s.connection == ConnectionStatus::Lost).await;

    // The engine keeps working locally after the loss.
    sync.advance_phase(GamePhase::Lobby).await.expect("local write");
    assert_eq!(
        sync.snapshot().session.expect("session").phase,
        GamePhase::Lobby
    );
}

#[tokio::test]
async fn disconnect_sends_unsubscribe_and_closes_the_channel() {
    let store = seeded_store("AB12").await;
    let (mut sync, _state, mut service) = connect_subscribed(store, "AB12").await;

    sync.disconnect().await;

    let frame = service
        .next_frame_matching(|f| matches!(f, ClientFrame::Unsubscribe))
        .await;
    assert_eq!(frame, ClientFrame::Unsubscribe);
}

#[tokio::test]
async fn disconnect_delivers_queued_frames_every_time() {
    // The shutdown signal races the queued final frames inside the channel
    // loop; the Unsubscribe must reach the service every round regardless
    // of which select branch wakes first.
    let store = seeded_store("AB12").await;

    for round in 0..25 {
        let (mut sync, _state, mut service) =
            connect_subscribed(Arc::clone(&store), "AB12").await;
        sync.disconnect().await;

        let frames = service.drain().await;
        assert!(
            frames.contains(&ClientFrame::Unsubscribe),
            "round {round}: the unsubscribe never reached the service: {frames:?}"
        );
    }
}

// ════════════════════════════════════════════════════════════════════
// Reconnection (same seat, new engine)
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn adopting_a_seat_after_reconnect_keeps_the_row() {
    let store = seeded_store("AB12").await;

    // First life: join, score, disconnect.
    {
        let (mut sync, _state, _service) =
            connect_subscribed(Arc::clone(&store), "AB12").await;
        sync.join_game(JoinGame::new(pid("seat-a"), "Nadia", PlayerRole::PlayerA))
            .await
            .expect("join");
        let score = sync.score_player(&pid("seat-a"), 7).await.expect("score");
        assert_eq!(score, 7);
        sync.disconnect().await;
    }

    let row = store.get_player(&pid("seat-a")).await.expect("row survives");
    assert!(!row.connected, "disconnect marks the row disconnected");
    assert_eq!(row.score, 7);

    // Second life: adopt the same seat instead of re-joining.
    let (sync, _state, _service) = connect_subscribed(Arc::clone(&store), "AB12").await;
    let adopted = sync.adopt_player(&pid("seat-a")).await.expect("adopt");
    assert!(adopted.connected);
    assert_eq!(adopted.score, 7, "adoption never resets the row");

    // Adoption is idempotent and never duplicates the roster.
    sync.adopt_player(&pid("seat-a")).await.expect("re-adopt");
    let roster = store.session_players(&code("AB12")).await.expect("roster");
    assert_eq!(roster.len(), 1);
    assert_eq!(sync.active_heartbeats(), vec![pid("seat-a")]);
}

#[tokio::test]
async fn adopting_a_seat_from_another_session_leaves_its_row_untouched() {
    let store = seeded_store("AB12").await;
    store
        .create_session(NewSession::new(code("ZZ99"), "Z0ST", "Rim"))
        .await
        .expect("second session");
    store
        .add_player(NewPlayer::new(
            pid("seat-a"),
            code("ZZ99"),
            "Nadia",
            PlayerRole::PlayerA,
        ))
        .await
        .expect("foreign seat");
    store
        .update_player_connection(&pid("seat-a"), &code("ZZ99"), false, None)
        .await
        .expect("foreign seat offline");

    let (sync, _state) =
        SessionSync::local_only(Arc::clone(&store), SyncConfig::new(code("AB12")));
    sync.load().await.expect("load");

    let err = sync
        .adopt_player(&pid("seat-a"))
        .await
        .expect_err("a seat in another session is not adoptable");
    assert!(matches!(err, SyncError::UnknownPlayer(_)));

    // The failed adoption wrote nothing: still offline, still in ZZ99.
    let row = store.get_player(&pid("seat-a")).await.expect("row");
    assert_eq!(row.session_code, code("ZZ99"));
    assert!(!row.connected, "the error path must not mutate the row");
    assert!(sync.active_heartbeats().is_empty());
}

#[tokio::test]
async fn rejoining_resets_the_row() {
    let store = seeded_store("AB12").await;
    let (sync, _state, _service) = connect_subscribed(Arc::clone(&store), "AB12").await;

    sync.join_game(JoinGame::new(pid("seat-a"), "Nadia", PlayerRole::PlayerA))
        .await
        .expect("join");
    sync.score_player(&pid("seat-a"), 7).await.expect("score");

    sync.join_game(JoinGame::new(pid("seat-a"), "Nadia", PlayerRole::PlayerA))
        .await
        .expect("re-join");

    let row = store.get_player(&pid("seat-a")).await.expect("row");
    assert_eq!(row.score, 0, "a fresh join starts from zero");
}

// ════════════════════════════════════════════════════════════════════
// Mutations: optimistic apply, durable write, broadcast
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn phase_change_applies_locally_writes_durably_and_broadcasts() {
    let store = seeded_store("AB12").await;
    let (sync, _state, mut service) = connect_subscribed(Arc::clone(&store), "AB12").await;

    sync.advance_phase(GamePhase::Lobby).await.expect("advance");

    // Local state is already updated.
    assert_eq!(
        sync.snapshot().session.expect("session").phase,
        GamePhase::Lobby
    );
    // The store row is updated.
    let durable = store.get_session(&code("AB12")).await.expect("session");
    assert_eq!(durable.phase, GamePhase::Lobby);
    // The broadcast carries exactly the patch.
    let frame = service
        .next_frame_matching(|f| matches!(f, ClientFrame::Broadcast { .. }))
        .await;
    match frame {
        ClientFrame::Broadcast {
            event: BroadcastEvent::GameStateUpdate(patch),
        } => {
            assert_eq!(patch.phase, Some(GamePhase::Lobby));
            assert!(patch.timer_seconds.is_none(), "patch carries only changes");
        }
        other => panic!("expected a game state broadcast, got {other:?}"),
    }
}

#[tokio::test]
async fn scoring_broadcasts_the_absolute_value() {
    let store = seeded_store("AB12").await;
    let (sync, _state, mut service) = connect_subscribed(Arc::clone(&store), "AB12").await;

    sync.join_game(JoinGame::new(pid("seat-a"), "Nadia", PlayerRole::PlayerA))
        .await
        .expect("join");
    sync.score_player(&pid("seat-a"), 3).await.expect("score");
    sync.score_player(&pid("seat-a"), 2).await.expect("score");

    let frame = service
        .next_frame_matching(|f| {
            matches!(
                f,
                ClientFrame::Broadcast {
                    event: BroadcastEvent::PlayerUpdate { patch, .. }
                } if patch.score == Some(5)
            )
        })
        .await;
    match frame {
        ClientFrame::Broadcast {
            event: BroadcastEvent::PlayerUpdate { id, patch },
        } => {
            assert_eq!(id, pid("seat-a"));
            assert_eq!(patch.score, Some(5), "scores travel as absolutes");
        }
        other => panic!("expected a player broadcast, got {other:?}"),
    }
}

#[tokio::test]
async fn scoring_an_unknown_player_fails() {
    let store = seeded_store("AB12").await;
    let (sync, _state) = SessionSync::local_only(store, SyncConfig::new(code("AB12")));
    sync.load().await.expect("load");

    let err = sync.score_player(&pid("ghost"), 1).await.expect_err("must fail");
    assert!(matches!(err, SyncError::UnknownPlayer(_)));
}

// ════════════════════════════════════════════════════════════════════
// Incoming broadcasts and change records
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn remote_join_broadcast_lands_in_the_roster() {
    let store = seeded_store("AB12").await;
    let (_sync, mut state, service) = connect_subscribed(store, "AB12").await;

    let remote = player_row("seat-b", "AB12", PlayerRole::PlayerB);
    service.push(&broadcast_frame(BroadcastEvent::PlayerJoin {
        player: Box::new(remote),
    }));

    wait_for(&mut state, |s| s.players.contains_key(&pid("seat-b"))).await;
    let snap = state.borrow().clone();
    assert_eq!(
        snap.players.get(&pid("seat-b")).expect("row").role,
        PlayerRole::PlayerB
    );
}

#[tokio::test]
async fn stale_row_image_wins_but_keeps_the_live_timer() {
    let store = seeded_store("AB12").await;
    let (sync, mut state, service) = connect_subscribed(Arc::clone(&store), "AB12").await;

    // A newer broadcast arrives first, then the older row image: the image
    // overwrites what it carries (convergence is eventual, not ordered),
    // except the timer, which the store never owns.
    sync.advance_phase(GamePhase::Lobby).await.expect("advance");
    sync.set_timer(42, true);

    let mut stale = store.get_session(&code("AB12")).await.expect("row");
    stale.phase = GamePhase::Config;
    service.push(&session_change(ChangeKind::Update, stale));

    wait_for(&mut state, |s| {
        s.session.as_ref().map(|ses| ses.phase) == Some(GamePhase::Config)
    })
    .await;
    let session = state.borrow().session.clone().expect("session");
    assert_eq!(session.timer_seconds, 42);
    assert!(session.timer_running);
}

#[tokio::test]
async fn row_image_for_a_seat_that_hopped_sessions_leaves_the_roster() {
    let store = seeded_store("AB12").await;
    let (sync, mut state, service) = connect_subscribed(Arc::clone(&store), "AB12").await;

    sync.join_game(JoinGame::new(pid("seat-a"), "Nadia", PlayerRole::PlayerA))
        .await
        .expect("join");

    // The same device joined another game; the feed echoes the moved row.
    let moved = player_row("seat-a", "ZZ99", PlayerRole::PlayerA);
    service.push(&player_change(ChangeKind::Update, moved));

    wait_for(&mut state, |s| !s.players.contains_key(&pid("seat-a"))).await;
}

#[tokio::test]
async fn player_delete_removes_the_row() {
    let store = seeded_store("AB12").await;
    let (sync, mut state, service) = connect_subscribed(Arc::clone(&store), "AB12").await;

    sync.join_game(JoinGame::new(pid("seat-a"), "Nadia", PlayerRole::PlayerA))
        .await
        .expect("join");

    let row = player_row("seat-a", "AB12", PlayerRole::PlayerA);
    service.push(&player_change(ChangeKind::Delete, row));

    wait_for(&mut state, |s| !s.players.contains_key(&pid("seat-a"))).await;
}

// ════════════════════════════════════════════════════════════════════
// Presence reconciliation
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn presence_roster_is_the_source_of_truth_for_connected_flags() {
    let store = seeded_store("AB12").await;
    store
        .add_player(NewPlayer::new(
            pid("seat-a"),
            code("AB12"),
            "Nadia",
            PlayerRole::PlayerA,
        ))
        .await
        .expect("seed a");
    store
        .add_player(NewPlayer::new(
            pid("seat-b"),
            code("AB12"),
            "Omar",
            PlayerRole::PlayerB,
        ))
        .await
        .expect("seed b");

    let (_sync, mut state, service) = connect_subscribed(Arc::clone(&store), "AB12").await;

    // Only seat-a and the host are live.
    service.push(&presence_sync(vec![
        Participant::host("Layla"),
        Participant::player(pid("seat-a"), "Nadia"),
    ]));

    wait_for(&mut state, |s| {
        s.players.get(&pid("seat-b")).map(|p| p.connected) == Some(false)
            && s.session.as_ref().map(|ses| ses.host_connected) == Some(true)
    })
    .await;
    let snap = state.borrow().clone();
    assert!(snap.players.get(&pid("seat-a")).expect("a").connected);
    assert_eq!(snap.participants.len(), 2);

    // The store is repaired to match, eventually.
    for _ in 0..100 {
        let row = store.get_player(&pid("seat-b")).await.expect("row");
        if !row.connected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let row = store.get_player(&pid("seat-b")).await.expect("row");
    assert!(!row.connected, "presence drives the durable flag");

    // The host tab closes.
    service.push(&presence_sync(vec![Participant::player(
        pid("seat-a"),
        "Nadia",
    )]));
    wait_for(&mut state, |s| {
        s.session.as_ref().map(|ses| ses.host_connected) == Some(false)
    })
    .await;
}

#[tokio::test]
async fn presence_join_and_leave_adjust_the_roster_incrementally() {
    let store = seeded_store("AB12").await;
    store
        .add_player(NewPlayer::new(
            pid("seat-a"),
            code("AB12"),
            "Nadia",
            PlayerRole::PlayerA,
        ))
        .await
        .expect("seed");

    let (_sync, mut state, service) = connect_subscribed(Arc::clone(&store), "AB12").await;

    let entry = Participant::player(pid("seat-a"), "Nadia");
    service.push(&ServerFrame::PresenceJoin {
        participant: entry.clone(),
    });
    wait_for(&mut state, |s| s.participants.len() == 1).await;

    service.push(&ServerFrame::PresenceLeave { participant: entry });
    wait_for(&mut state, |s| {
        s.participants.is_empty()
            && s.players.get(&pid("seat-a")).map(|p| p.connected) == Some(false)
    })
    .await;
}

// ════════════════════════════════════════════════════════════════════
// Leaving
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn leaving_broadcasts_untracks_and_marks_the_row() {
    let store = seeded_store("AB12").await;
    let (sync, _state, mut service) = connect_subscribed(Arc::clone(&store), "AB12").await;

    sync.join_game(JoinGame::new(pid("seat-a"), "Nadia", PlayerRole::PlayerA))
        .await
        .expect("join");
    sync.leave_game(&pid("seat-a")).await.expect("leave");

    // The seat's presence entry is withdrawn, then the leave is broadcast.
    service
        .next_frame_matching(|f| matches!(f, ClientFrame::Untrack { .. }))
        .await;
    let frame = service
        .next_frame_matching(|f| {
            matches!(
                f,
                ClientFrame::Broadcast {
                    event: BroadcastEvent::PlayerLeave { .. }
                }
            )
        })
        .await;
    assert!(matches!(
        frame,
        ClientFrame::Broadcast {
            event: BroadcastEvent::PlayerLeave { id }
        } if id == pid("seat-a")
    ));

    let row = store.get_player(&pid("seat-a")).await.expect("row");
    assert!(!row.connected);
    assert!(sync.active_heartbeats().is_empty());
    assert!(!sync.snapshot().players.contains_key(&pid("seat-a")));
}

// ════════════════════════════════════════════════════════════════════
// Local-only parity
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn a_full_round_works_without_a_channel() {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let (sync, _state) = SessionSync::local_only(store, SyncConfig::new(code("AB12")));

    sync.start_session(StartSession::new("H0ST", "Layla"))
        .await
        .expect("start");
    sync.join_game(JoinGame::new(pid("seat-a"), "Nadia", PlayerRole::PlayerA))
        .await
        .expect("join a");
    sync.join_game(JoinGame::new(pid("seat-b"), "Omar", PlayerRole::PlayerB))
        .await
        .expect("join b");

    let mut settings = SegmentSettings::new();
    settings.insert(seg("WSHA"), 10);
    sync.configure_segments(settings).await.expect("configure");

    sync.advance_phase(GamePhase::Lobby).await.expect("lobby");
    sync.advance_phase(GamePhase::Playing).await.expect("playing");
    sync.set_segment(seg("WSHA"), 0).await.expect("segment");
    assert_eq!(sync.next_question().await.expect("next"), 1);

    sync.score_player(&pid("seat-a"), 4).await.expect("score");
    sync.add_strike(&pid("seat-b")).await.expect("strike");
    sync.set_special_button(&pid("seat-a"), "pit_buzzer", false)
        .await
        .expect("button");

    sync.advance_phase(GamePhase::Results).await.expect("results");
    sync.advance_phase(GamePhase::Ended).await.expect("ended");

    let snap = sync.snapshot();
    let session = snap.session.expect("session");
    assert_eq!(session.phase, GamePhase::Ended);
    assert_eq!(session.current_question_index, 1);
    assert_eq!(snap.players.get(&pid("seat-a")).expect("a").score, 4);
    assert_eq!(snap.players.get(&pid("seat-b")).expect("b").strikes, 1);
    assert_eq!(
        snap.players
            .get(&pid("seat-a"))
            .expect("a")
            .special_buttons
            .get("pit_buzzer"),
        Some(&false)
    );
}

// ════════════════════════════════════════════════════════════════════
// Loop resilience
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn garbage_frames_are_skipped() {
    let store = seeded_store("AB12").await;
    let (channel, _sent, _closed) = MockChannel::new(vec![
        Some(Ok("not json at all".into())),
        Some(Ok(serde_json::to_string(&ServerFrame::Subscribed {
            session_code: code("AB12"),
        })
        .expect("frame"))),
    ]);

    let (mut sync, mut state) =
        SessionSync::connect(channel, store, SyncConfig::new(code("AB12"))).await;

    wait_for(&mut state, |s| s.connection == ConnectionStatus::Subscribed).await;
    sync.disconnect().await;
}
