//! The seam between the sync engine and whatever carries its frames.
//!
//! [`RealtimeChannel`] is a stream of JSON text frames: the engine
//! serializes `ClientFrame`s going out and parses `ServerFrame`s coming in,
//! so an implementation only moves strings. How those strings travel —
//! WebSocket messages, a length-prefixed socket, an in-process pair of
//! `mpsc` queues — is the implementation's business, as is connecting:
//! `SessionSync::connect` takes an already-connected channel, because dial
//! parameters differ too much across backends to abstract.
//!
//! A minimal in-process implementation:
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use thirty_sync::{RealtimeChannel, SyncError};
//! use tokio::sync::mpsc;
//!
//! struct Loopback {
//!     tx: mpsc::UnboundedSender<String>,
//!     rx: mpsc::UnboundedReceiver<String>,
//! }
//!
//! #[async_trait]
//! impl RealtimeChannel for Loopback {
//!     async fn send(&mut self, frame: String) -> Result<(), SyncError> {
//!         self.tx
//!             .send(frame)
//!             .map_err(|e| SyncError::ChannelSend(e.to_string()))
//!     }
//!
//!     async fn recv(&mut self) -> Option<Result<String, SyncError>> {
//!         self.rx.recv().await.map(Ok)
//!     }
//!
//!     async fn close(&mut self) -> Result<(), SyncError> {
//!         Ok(())
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::SyncError;

/// A bidirectional stream of JSON text frames to the realtime service.
///
/// One call, one complete frame, in both directions. The engine never
/// splits or concatenates frames across calls.
///
/// # Cancel safety
///
/// The channel loop polls [`recv`](Self::recv) inside `tokio::select!`, so
/// `recv` must be cancel-safe: a dropped in-flight call may not consume or
/// reorder frames. Queue-backed implementations get this for free;
/// stream-backed ones must buffer partial reads internally.
///
/// The trait is object-safe; `Box<dyn RealtimeChannel>` works where dynamic
/// dispatch is wanted, though `SessionSync::connect` monomorphizes over
/// `impl RealtimeChannel`.
#[async_trait]
pub trait RealtimeChannel: Send + 'static {
    /// Transmit one frame.
    ///
    /// # Errors
    ///
    /// [`SyncError::ChannelSend`] when the frame cannot be written (peer
    /// gone, broken pipe).
    async fn send(&mut self, frame: String) -> Result<(), SyncError>;

    /// Wait for the next frame.
    ///
    /// `Some(Ok(text))` is a frame, `Some(Err(_))` a channel fault, and
    /// `None` the service ending the connection cleanly. After `None` the
    /// engine treats the connection as over and never polls again.
    ///
    /// Must be cancel-safe (see the trait docs).
    async fn recv(&mut self) -> Option<Result<String, SyncError>>;

    /// Shut the connection down deliberately.
    ///
    /// Called once by the channel loop during graceful disconnect. Must be
    /// idempotent and should release resources even when the goodbye
    /// handshake fails.
    ///
    /// # Errors
    ///
    /// Implementation-defined; the engine logs and otherwise ignores them.
    async fn close(&mut self) -> Result<(), SyncError>;
}
