//! # Thirty Sync
//!
//! Channel-agnostic Rust engine for synchronizing Thirty Challenge game
//! sessions across devices.
//!
//! The engine keeps one observable [`GameState`] per session and converges
//! it through three paths: fire-and-forget broadcasts between clients, the
//! durable store's change feed, and live presence tracking. Durable rows
//! travel through the [`SessionStore`] seam; realtime frames travel through
//! the [`RealtimeChannel`] seam.
//!
//! ## Features
//!
//! - **Channel-agnostic** — implement the [`RealtimeChannel`] trait for any backend
//! - **Store-agnostic** — implement [`SessionStore`], or use the built-in
//!   [`MemoryStore`] (tests, local play) and `RestStore` (`store-rest` feature)
//! - **WebSocket built-in** — default `transport-websocket` feature provides
//!   `WebSocketChannel`
//! - **Observable** — watch a [`GameState`] snapshot that updates on every
//!   broadcast, change record, and presence event
//! - **Presence-driven liveness** — per-seat heartbeats plus membership
//!   reconciliation keep `connected` flags honest
//! - **Arbitrated provisioning** — the session's video room is created by
//!   exactly one client, no matter how many race for it
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use thirty_sync::{
//!     JoinGame, MemoryStore, PlayerId, PlayerRole, SessionCode, SessionSync,
//!     StartSession, SyncConfig, WebSocketChannel,
//! };
//!
//! #[tokio::main]
//! async fn main() -> thirty_sync::Result<()> {
//!     let store = Arc::new(MemoryStore::new());
//!     let code = SessionCode::generate();
//!
//!     let channel = WebSocketChannel::connect("ws://localhost:4000/realtime").await?;
//!     let (sync, mut state) =
//!         SessionSync::connect(channel, store, SyncConfig::new(code)).await;
//!
//!     sync.start_session(StartSession::new("H0ST", "Layla")).await?;
//!     sync.announce_host().await?;
//!
//!     while state.changed().await.is_ok() {
//!         println!("{:?}", state.borrow().connection);
//!     }
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod channels;
pub mod error;
pub mod heartbeat;
pub mod model;
pub mod protocol;
pub mod state;
pub mod store;
pub mod stores;
pub mod sync;
pub mod video;

// Re-export primary types for ergonomic imports.
pub use channel::RealtimeChannel;
#[cfg(feature = "transport-websocket")]
pub use channels::WebSocketChannel;
pub use error::{Result, SyncError};
pub use heartbeat::{HeartbeatRegistry, DEFAULT_HEARTBEAT_INTERVAL};
pub use model::{
    GamePhase, Participant, ParticipantKind, Player, PlayerId, PlayerRole, SegmentCode,
    SegmentSettings, Session, SessionCode, SpecialButtons, VideoRoomState,
};
pub use protocol::{
    BroadcastEvent, ChangeKind, ChangeRecord, ChangeRow, ClientFrame, PlayerPatch, ServerFrame,
    SessionPatch,
};
pub use state::{ConnectionStatus, GameState, StateStore, StateUpdate};
pub use store::{
    NewPlayer, NewSession, SessionStore, SharedStore, StoreError, StoreResult, VideoRoomClaim,
};
#[cfg(feature = "store-rest")]
pub use stores::rest::{RestStore, RestStoreConfig};
pub use stores::MemoryStore;
pub use sync::{JoinGame, SessionSync, StartSession, SyncConfig};
pub use video::{ProviderError, ProvisionOutcome, ProvisionedRoom, VideoRoomProvider};
