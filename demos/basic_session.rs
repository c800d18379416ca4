//! # Basic Session Example
//!
//! Demonstrates a complete host-side session lifecycle:
//!
//! 1. Connect to the realtime service via WebSocket
//! 2. Create a session and announce the host
//! 3. Configure segments and open the lobby
//! 4. Watch the state converge as players join and score
//! 5. Shut down gracefully on Ctrl+C or connection loss
//!
//! ## Running
//!
//! ```sh
//! # Start a realtime service on localhost:4000, then:
//! cargo run --example basic_session
//!
//! # Override the service URL:
//! THIRTY_SYNC_URL=ws://my-host:4000/realtime cargo run --example basic_session
//! ```

use std::sync::Arc;

use thirty_sync::{
    ConnectionStatus, MemoryStore, SegmentCode, SessionCode, SessionSync, StartSession,
    SyncConfig, WebSocketChannel,
};

/// Default service URL when `THIRTY_SYNC_URL` is not set.
const DEFAULT_URL: &str = "ws://localhost:4000/realtime";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    // Initialize tracing. Set `RUST_LOG=debug` for verbose output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Configuration ───────────────────────────────────────────────
    let url = std::env::var("THIRTY_SYNC_URL").unwrap_or_else(|_| DEFAULT_URL.to_string());
    let code = match std::env::var("THIRTY_SYNC_SESSION") {
        Ok(raw) => SessionCode::new(raw)?,
        Err(_) => SessionCode::generate(),
    };
    tracing::info!("Connecting to {url} for session {code}");

    // ── Connect ─────────────────────────────────────────────────────
    // The store would be `RestStore` in a deployment; the in-memory store
    // keeps this demo self-contained.
    let store = Arc::new(MemoryStore::new());
    let channel = WebSocketChannel::connect(&url).await?;

    let (mut sync, mut state) =
        SessionSync::connect(channel, store, SyncConfig::new(code.clone())).await;

    // ── Host actions ────────────────────────────────────────────────
    // Create the session row, claim the host seat, configure one segment,
    // and open the lobby.
    let session = sync
        .start_session(StartSession::new(format!("{code}-HOST"), "Layla"))
        .await?;
    tracing::info!("Session {} created in phase {:?}", session.code, session.phase);

    sync.announce_host().await?;

    let mut settings = thirty_sync::SegmentSettings::new();
    settings.insert(SegmentCode::new("BELL")?, 10);
    settings.insert(SegmentCode::new("WSHA")?, 8);
    sync.configure_segments(settings).await?;

    sync.advance_phase(thirty_sync::GamePhase::Lobby).await?;
    tracing::info!("Lobby open — share the code: {code}");

    // ── Watch loop ──────────────────────────────────────────────────
    // Render every state change until Ctrl+C or the connection dies.
    loop {
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    tracing::info!("State channel closed, exiting");
                    break;
                }
                let snapshot = state.borrow_and_update().clone();
                tracing::info!(
                    "phase={:?} players={} live_connections={} status={:?}",
                    snapshot.session.as_ref().map(|s| s.phase),
                    snapshot.players.len(),
                    snapshot.participants.len(),
                    snapshot.connection,
                );
                if snapshot.connection == ConnectionStatus::Lost {
                    tracing::warn!("Realtime connection lost, exiting");
                    break;
                }
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl+C received, shutting down…");
                break;
            }
        }
    }

    // ── Cleanup ─────────────────────────────────────────────────────
    sync.disconnect().await;
    tracing::info!("Session sync shut down. Goodbye!");
    Ok(())
}
