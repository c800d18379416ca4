//! Video-room provisioning with store-arbitrated exclusivity.
//!
//! Creating a room at the video provider costs real quota, so at most one
//! client may call the provider per session. Arbitration happens in the
//! durable store: [`SessionStore::claim_video_room`] is a compare-and-set
//! that flips the room state to `Claimed` only from a claimable state, and
//! whoever wins makes the provider call. Losers back off and wait for the
//! winner's URL to arrive through sync.
//!
//! Failure handling is structural: a failed provider call releases the claim
//! by writing `Failed {reason}`, which is claimable again, so the next
//! attempt retries cleanly. Two narrow hazards remain and are accepted: if
//! the winner crashes between claiming and completing, or the release write
//! itself fails, the claim stays taken until an operator clears it.

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::model::SessionCode;
use crate::store::{SessionStore, StoreResult};

/// The external video provider failed to create or delete a room.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("video provider error: {0}")]
pub struct ProviderError(pub String);

/// A room created by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedRoom {
    /// Join URL handed to clients.
    pub url: String,
}

/// External service that hosts video rooms.
///
/// Implementations wrap a vendor API (room create/delete). Room names are
/// chosen by the caller and must be stable per session so retries land on
/// the same room.
#[async_trait]
pub trait VideoRoomProvider: Send + Sync {
    /// Creates (or returns) the room with the given name.
    async fn create_room(&self, name: &str) -> Result<ProvisionedRoom, ProviderError>;

    /// Deletes the room with the given name. Deleting a room that does not
    /// exist is not an error.
    async fn delete_room(&self, name: &str) -> Result<(), ProviderError>;
}

/// What a provisioning attempt produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// This caller won the claim and the room is up.
    Provisioned {
        /// Join URL, also written to the session row.
        url: String,
    },
    /// Another caller holds the claim or the room already exists; the URL
    /// will arrive via sync.
    AlreadyInFlight,
    /// This caller won the claim but the provider call failed. The claim
    /// has been released for the next attempt.
    Failed {
        /// What the provider reported.
        reason: String,
    },
}

/// Provider-side room name for a session. Deterministic, so a retried
/// provision reuses the room instead of leaking one per attempt.
pub fn room_name(code: &SessionCode) -> String {
    format!("tc-{}", code.as_str().to_ascii_lowercase())
}

/// Runs one arbitrated provisioning attempt.
///
/// Store errors propagate; provider errors are folded into the outcome
/// after the claim has been released.
pub(crate) async fn provision(
    store: &dyn SessionStore,
    code: &SessionCode,
    provider: &dyn VideoRoomProvider,
) -> StoreResult<ProvisionOutcome> {
    if !store.claim_video_room(code).await?.won() {
        return Ok(ProvisionOutcome::AlreadyInFlight);
    }

    let name = room_name(code);
    match provider.create_room(&name).await {
        Ok(room) => {
            store.complete_video_room(code, &room.url).await?;
            info!(session = %code, url = %room.url, "video room provisioned");
            Ok(ProvisionOutcome::Provisioned { url: room.url })
        }
        Err(e) => {
            warn!(session = %code, error = %e, "video room provisioning failed");
            store.release_video_room(code, &e.to_string()).await?;
            Ok(ProvisionOutcome::Failed {
                reason: e.to_string(),
            })
        }
    }
}
