//! Error types for the session sync engine.

use thiserror::Error;

use crate::model::GamePhase;
use crate::store::StoreError;
use crate::video::ProviderError;

/// Errors that can occur when driving a game session.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Failed to send a frame through the realtime channel.
    #[error("channel send error: {0}")]
    ChannelSend(String),

    /// Failed to receive a frame from the realtime channel.
    #[error("channel receive error: {0}")]
    ChannelReceive(String),

    /// The realtime channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// Failed to serialize or deserialize a protocol frame.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Attempted an operation that requires a loaded session, but the local
    /// state holds none.
    #[error("no active session")]
    NoActiveSession,

    /// Attempted a player operation for an id the local state does not know.
    #[error("unknown player: {0}")]
    UnknownPlayer(String),

    /// Game phases only move forward; the requested transition goes backwards
    /// or sideways.
    #[error("invalid phase transition: {from:?} -> {to:?}")]
    PhaseRegression {
        /// Phase the session is currently in.
        from: GamePhase,
        /// Phase the caller asked for.
        to: GamePhase,
    },

    /// Segment settings can only be edited before play begins.
    #[error("segment settings are locked in phase {phase:?}")]
    SegmentsLocked {
        /// Phase the session is currently in.
        phase: GamePhase,
    },

    /// The persistence backend rejected or failed an operation.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The external video-room provider failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized [`Result`] type for session sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
