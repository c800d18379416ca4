//! Channel implementations for the realtime service.
//!
//! This module provides concrete [`RealtimeChannel`](crate::RealtimeChannel)
//! implementations behind feature gates. Enable the corresponding Cargo
//! feature to pull in a channel:
//!
//! | Feature                | Channel              |
//! |------------------------|----------------------|
//! | `transport-websocket`  | [`WebSocketChannel`] |
//!
//! # Example
//!
//! ```rust,ignore
//! # async fn example() -> Result<(), thirty_sync::SyncError> {
//! use thirty_sync::{WebSocketChannel, RealtimeChannel};
//!
//! let mut ws = WebSocketChannel::connect("ws://localhost:4000/realtime").await?;
//! ws.send(r#"{"type":"Unsubscribe"}"#.to_string()).await?;
//!
//! if let Some(Ok(frame)) = ws.recv().await {
//!     println!("service said: {frame}");
//! }
//!
//! ws.close().await?;
//! # Ok(())
//! # }
//! ```

#[cfg(feature = "transport-websocket")]
pub mod websocket;

#[cfg(feature = "transport-websocket")]
pub use websocket::WebSocketChannel;
