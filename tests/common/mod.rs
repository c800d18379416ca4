#![allow(
    dead_code,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Shared test utilities for Thirty Sync integration tests.
//!
//! Provides a scripted [`MockChannel`], a push-at-will [`pipe`] channel with
//! a [`ServiceEnd`] the test drives like a realtime service, a
//! [`CountingStore`] wrapper that records liveness writes, and helpers for
//! building common frame JSON.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use thirty_sync::{
    BroadcastEvent, ChangeKind, ChangeRecord, ChangeRow, ClientFrame, GameState, NewPlayer,
    NewSession, Participant, Player, PlayerId, PlayerPatch, PlayerRole, RealtimeChannel,
    SegmentCode, ServerFrame, Session, SessionCode, SessionPatch, SessionStore, SharedStore,
    StoreResult, SyncError, VideoRoomClaim,
};

// ── Model fixtures ──────────────────────────────────────────────────

/// Parses a session code, panicking on invalid input.
pub fn code(raw: &str) -> SessionCode {
    SessionCode::new(raw).expect("valid session code")
}

/// Parses a player id, panicking on invalid input.
pub fn pid(raw: &str) -> PlayerId {
    PlayerId::new(raw).expect("valid player id")
}

/// Parses a segment code, panicking on invalid input.
pub fn seg(raw: &str) -> SegmentCode {
    SegmentCode::new(raw).expect("valid segment code")
}

/// Creates a memory store seeded with one session under `raw`.
///
/// Returned as [`SharedStore`] so `Arc::clone(&store)` unifies with every
/// position that expects the trait object.
pub async fn seeded_store(raw: &str) -> SharedStore {
    let store = thirty_sync::MemoryStore::new();
    store
        .create_session(NewSession::new(code(raw), "H0ST", "Layla"))
        .await
        .expect("seed session");
    Arc::new(store)
}

// ── MockChannel ─────────────────────────────────────────────────────

/// A scripted mock channel for integration testing.
///
/// Scripted service frames are consumed in order by `recv()`.
/// All frames sent by the engine are recorded in `sent`.
pub struct MockChannel {
    /// Scripted service frames (consumed in order by `recv`).
    incoming: VecDeque<Option<Result<String, SyncError>>>,
    /// Recorded outgoing frames from the engine.
    pub sent: Arc<StdMutex<Vec<String>>>,
    /// Whether `close()` has been called.
    pub closed: Arc<AtomicBool>,
}

impl MockChannel {
    /// Create a new mock channel with the given scripted incoming frames.
    ///
    /// Returns the channel plus shared handles for inspecting sent frames
    /// and whether close was called.
    pub fn new(
        incoming: Vec<Option<Result<String, SyncError>>>,
    ) -> (Self, Arc<StdMutex<Vec<String>>>, Arc<AtomicBool>) {
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let channel = Self {
            incoming: VecDeque::from(incoming),
            sent: Arc::clone(&sent),
            closed: Arc::clone(&closed),
        };
        (channel, sent, closed)
    }
}

#[async_trait]
impl RealtimeChannel for MockChannel {
    async fn send(&mut self, frame: String) -> Result<(), SyncError> {
        self.sent.lock().unwrap().push(frame);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, SyncError>> {
        if let Some(item) = self.incoming.pop_front() {
            item
        } else {
            // No more scripted frames — hang forever so the channel loop
            // stays alive until disconnect is called.
            std::future::pending().await
        }
    }

    async fn close(&mut self) -> Result<(), SyncError> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

// ── Pipe channel ────────────────────────────────────────────────────

/// Client half of an in-process channel pair. The test holds the
/// [`ServiceEnd`] and plays the realtime service: pushing frames whenever
/// it wants and inspecting what the engine sends.
pub struct PipeChannel {
    incoming: mpsc::UnboundedReceiver<Result<String, SyncError>>,
    outgoing: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicBool>,
}

/// Service half of an in-process channel pair.
pub struct ServiceEnd {
    to_client: mpsc::UnboundedSender<Result<String, SyncError>>,
    from_client: mpsc::UnboundedReceiver<String>,
    /// Whether the engine closed its half.
    pub closed: Arc<AtomicBool>,
}

/// Creates a connected channel pair.
pub fn pipe() -> (PipeChannel, ServiceEnd) {
    let (to_client, incoming) = mpsc::unbounded_channel();
    let (outgoing, from_client) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));
    let channel = PipeChannel {
        incoming,
        outgoing,
        closed: Arc::clone(&closed),
    };
    let service = ServiceEnd {
        to_client,
        from_client,
        closed,
    };
    (channel, service)
}

#[async_trait]
impl RealtimeChannel for PipeChannel {
    async fn send(&mut self, frame: String) -> Result<(), SyncError> {
        self.outgoing
            .send(frame)
            .map_err(|_| SyncError::ChannelSend("service end dropped".into()))
    }

    async fn recv(&mut self) -> Option<Result<String, SyncError>> {
        self.incoming.recv().await
    }

    async fn close(&mut self) -> Result<(), SyncError> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

impl ServiceEnd {
    /// Delivers a frame to the engine.
    pub fn push(&self, frame: &ServerFrame) {
        let json = serde_json::to_string(frame).expect("frame serialization");
        self.to_client.send(Ok(json)).expect("engine still running");
    }

    /// Delivers a receive error to the engine.
    pub fn push_error(&self, error: SyncError) {
        self.to_client.send(Err(error)).expect("engine still running");
    }

    /// Acknowledges the subscription for `session_code`.
    pub fn ack_subscribe(&self, session_code: &SessionCode) {
        self.push(&ServerFrame::Subscribed {
            session_code: session_code.clone(),
        });
    }

    /// Waits for the next frame from the engine, decoded.
    pub async fn next_frame(&mut self) -> ClientFrame {
        let raw = tokio::time::timeout(Duration::from_secs(2), self.from_client.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("engine channel closed");
        serde_json::from_str(&raw).expect("client frame decodes")
    }

    /// Collects every remaining frame until the engine hangs up.
    pub async fn drain(&mut self) -> Vec<ClientFrame> {
        let mut frames = Vec::new();
        let outcome = tokio::time::timeout(Duration::from_secs(2), async {
            while let Some(raw) = self.from_client.recv().await {
                frames.push(serde_json::from_str(&raw).expect("client frame decodes"));
            }
        })
        .await;
        outcome.expect("engine never hung up");
        frames
    }

    /// Waits for the next frame matching `pred`, skipping others.
    pub async fn next_frame_matching<F>(&mut self, mut pred: F) -> ClientFrame
    where
        F: FnMut(&ClientFrame) -> bool,
    {
        loop {
            let frame = self.next_frame().await;
            if pred(&frame) {
                return frame;
            }
        }
    }
}

// ── CountingStore ───────────────────────────────────────────────────

/// Wraps a store and records every liveness write, so tests can assert on
/// heartbeat cadence without reaching into the backend.
pub struct CountingStore {
    inner: SharedStore,
    /// `(player id, connected)` per `update_player_connection` call, in order.
    pub connection_writes: Arc<StdMutex<Vec<(PlayerId, bool)>>>,
}

impl CountingStore {
    pub fn new(inner: SharedStore) -> Self {
        Self {
            inner,
            connection_writes: Arc::new(StdMutex::new(Vec::new())),
        }
    }

    /// Number of liveness writes recorded for `id` with `connected == true`.
    pub fn beats_for(&self, id: &PlayerId) -> usize {
        self.connection_writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, connected)| p == id && *connected)
            .count()
    }
}

#[async_trait]
impl SessionStore for CountingStore {
    async fn create_session(&self, new: NewSession) -> StoreResult<Session> {
        self.inner.create_session(new).await
    }

    async fn get_session(&self, code: &SessionCode) -> StoreResult<Session> {
        self.inner.get_session(code).await
    }

    async fn update_session(
        &self,
        code: &SessionCode,
        patch: SessionPatch,
    ) -> StoreResult<Session> {
        self.inner.update_session(code, patch).await
    }

    async fn add_player(&self, new: NewPlayer) -> StoreResult<Player> {
        self.inner.add_player(new).await
    }

    async fn get_player(&self, id: &PlayerId) -> StoreResult<Player> {
        self.inner.get_player(id).await
    }

    async fn session_players(&self, code: &SessionCode) -> StoreResult<Vec<Player>> {
        self.inner.session_players(code).await
    }

    async fn update_player(&self, id: &PlayerId, patch: PlayerPatch) -> StoreResult<Player> {
        self.inner.update_player(id, patch).await
    }

    async fn update_player_connection(
        &self,
        id: &PlayerId,
        code: &SessionCode,
        connected: bool,
        attrs: Option<NewPlayer>,
    ) -> StoreResult<Player> {
        self.connection_writes
            .lock()
            .unwrap()
            .push((id.clone(), connected));
        self.inner
            .update_player_connection(id, code, connected, attrs)
            .await
    }

    async fn claim_video_room(&self, code: &SessionCode) -> StoreResult<VideoRoomClaim> {
        self.inner.claim_video_room(code).await
    }

    async fn complete_video_room(&self, code: &SessionCode, url: &str) -> StoreResult<Session> {
        self.inner.complete_video_room(code, url).await
    }

    async fn release_video_room(&self, code: &SessionCode, reason: &str) -> StoreResult<Session> {
        self.inner.release_video_room(code, reason).await
    }

    async fn record_event(
        &self,
        code: &SessionCode,
        kind: &str,
        payload: serde_json::Value,
    ) -> StoreResult<()> {
        self.inner.record_event(code, kind, payload).await
    }
}

// ── Frame helpers ───────────────────────────────────────────────────

/// A `Broadcast` server frame wrapping the given event.
pub fn broadcast_frame(event: BroadcastEvent) -> ServerFrame {
    ServerFrame::Broadcast { event }
}

/// A `Change` server frame carrying a session row image.
pub fn session_change(kind: ChangeKind, session: Session) -> ServerFrame {
    ServerFrame::Change(ChangeRecord {
        kind,
        change: ChangeRow::Sessions(Box::new(session)),
    })
}

/// A `Change` server frame carrying a player row image.
pub fn player_change(kind: ChangeKind, player: Player) -> ServerFrame {
    ServerFrame::Change(ChangeRecord {
        kind,
        change: ChangeRow::Players(Box::new(player)),
    })
}

/// A `PresenceSync` server frame with the given roster.
pub fn presence_sync(participants: Vec<Participant>) -> ServerFrame {
    ServerFrame::PresenceSync { participants }
}

/// A player row fixture belonging to `session`.
pub fn player_row(id: &str, session: &str, role: PlayerRole) -> Player {
    NewPlayer::new(pid(id), code(session), id, role)
        .into_player(time::OffsetDateTime::UNIX_EPOCH)
}

// ── State helpers ───────────────────────────────────────────────────

/// Waits until the watched state satisfies `pred`, or panics after two
/// seconds.
pub async fn wait_for<F>(rx: &mut watch::Receiver<GameState>, mut pred: F)
where
    F: FnMut(&GameState) -> bool,
{
    let outcome = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if pred(&rx.borrow_and_update()) {
                return;
            }
            if rx.changed().await.is_err() {
                panic!("state channel closed before the predicate held");
            }
        }
    })
    .await;
    outcome.expect("state never satisfied the predicate");
}
