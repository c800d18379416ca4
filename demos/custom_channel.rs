//! # Custom Channel Example
//!
//! Shows how to implement the [`RealtimeChannel`] trait with a simple
//! in-process loopback channel. This is useful for:
//!
//! - **Testing** — drive the engine without a real realtime service
//! - **Custom backends** — adapt any I/O layer (TCP, QUIC, WebRTC data channels)
//!
//! ## Running
//!
//! ```sh
//! cargo run --example custom_channel
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use thirty_sync::{
    ConnectionStatus, JoinGame, MemoryStore, PlayerId, PlayerRole, RealtimeChannel, ServerFrame,
    SessionCode, SessionSync, StartSession, SyncConfig, SyncError,
};
use tokio::sync::mpsc;

// ─────────────────────────────────────────────────────────────────────
// Step 1: Define a channel-based "loopback" channel
// ─────────────────────────────────────────────────────────────────────

/// A loopback channel that shuttles frames through in-process channels.
///
/// Two halves:
/// - The **client half** (`LoopbackChannel`) implements [`RealtimeChannel`]
///   and is handed to `SessionSync::connect`.
/// - The **service half** (`LoopbackService`) lets you inject server frames
///   and read what the engine sent — perfect for testing.
pub struct LoopbackChannel {
    /// Frames the engine sends go here (service reads the other end).
    tx: mpsc::UnboundedSender<String>,
    /// Frames the service sends arrive here (engine reads them).
    rx: mpsc::UnboundedReceiver<String>,
}

/// The "service side" of the loopback — use this to drive the conversation.
pub struct LoopbackService {
    /// Read what the engine sent.
    pub rx: mpsc::UnboundedReceiver<String>,
    /// Send frames to the engine (as if they came from the service).
    pub tx: mpsc::UnboundedSender<String>,
}

/// Create a connected `(channel, service)` pair.
fn loopback_pair() -> (LoopbackChannel, LoopbackService) {
    // Engine → Service channel
    let (engine_tx, service_rx) = mpsc::unbounded_channel();
    // Service → Engine channel
    let (service_tx, engine_rx) = mpsc::unbounded_channel();

    let channel = LoopbackChannel {
        tx: engine_tx,
        rx: engine_rx,
    };
    let service = LoopbackService {
        rx: service_rx,
        tx: service_tx,
    };

    (channel, service)
}

// ─────────────────────────────────────────────────────────────────────
// Step 2: Implement the RealtimeChannel trait
// ─────────────────────────────────────────────────────────────────────

#[async_trait]
impl RealtimeChannel for LoopbackChannel {
    /// Send a JSON frame to the "service" side of the loopback.
    async fn send(&mut self, frame: String) -> Result<(), SyncError> {
        self.tx
            .send(frame)
            .map_err(|e| SyncError::ChannelSend(e.to_string()))
    }

    /// Receive the next frame from the "service" side.
    ///
    /// Returns `None` when the service channel is closed — this is how the
    /// engine discovers that the connection has ended.
    ///
    /// This method is **cancel-safe** because `mpsc::UnboundedReceiver::recv`
    /// is cancel-safe.
    async fn recv(&mut self) -> Option<Result<String, SyncError>> {
        self.rx.recv().await.map(Ok)
    }

    /// Close is a no-op for channels — dropping is sufficient.
    async fn close(&mut self) -> Result<(), SyncError> {
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 3: Wire together the engine and the fake service
// ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing for readable output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Create the loopback pair and a store shared with "other clients".
    let (channel, mut service) = loopback_pair();
    let store = Arc::new(MemoryStore::new());

    let code = SessionCode::new("DEMO42")?;
    let (mut sync, mut state) =
        SessionSync::connect(channel, store, SyncConfig::new(code.clone())).await;

    // ── Fake service: acknowledge the subscription ──────────────────
    // The engine auto-sends Subscribe on connect.
    let Some(subscribe) = service.rx.recv().await else {
        return Err("engine closed before Subscribe was received".into());
    };
    tracing::info!("Service received: {subscribe}");

    // Respond with the Subscribed acknowledgment (adjacently-tagged JSON:
    // {"type": "Variant", "data": {…}}).
    let ack = serde_json::to_string(&ServerFrame::Subscribed {
        session_code: code.clone(),
    })?;
    service.tx.send(ack)?;

    // Wait until the engine observes the acknowledgment.
    while state.borrow_and_update().connection != ConnectionStatus::Subscribed {
        state.changed().await?;
    }
    tracing::info!("Engine subscribed to session {code}");

    // ── Local actions flow out as broadcasts ────────────────────────
    sync.start_session(StartSession::new("DEMO42-HOST", "Layla"))
        .await?;
    sync.join_game(JoinGame::new(
        PlayerId::new("seat-a")?,
        "Nadia",
        PlayerRole::PlayerA,
    ))
    .await?;
    sync.score_player(&PlayerId::new("seat-a")?, 5).await?;

    // The service sees the engine's frames: the join broadcast, the
    // presence track, and the score broadcast.
    let mut frames_seen = 0;
    while frames_seen < 3 {
        let Some(frame) = service.rx.recv().await else {
            break;
        };
        tracing::info!("Service received: {frame}");
        frames_seen += 1;
    }

    // ── Clean shutdown ──────────────────────────────────────────────
    sync.disconnect().await;
    tracing::info!("Done — saw {frames_seen} frame(s). Custom channel works!");
    Ok(())
}
