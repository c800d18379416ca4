//! Persistence seam for session and player rows.
//!
//! [`SessionStore`] is the only interface the sync engine uses to reach
//! durable storage, so backends are swappable: the in-memory store for
//! tests and local play, the REST row store for deployments. Implementors
//! translate their native failures into the [`StoreError`] taxonomy; callers
//! branch on the variant, never on backend-specific strings.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::model::{
    Player, PlayerId, PlayerRole, SegmentSettings, Session, SessionCode,
};
use crate::protocol::{PlayerPatch, SessionPatch};

/// Shared handle to a store backend.
pub type SharedStore = Arc<dyn SessionStore>;

/// A specialized [`Result`] type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Failures common to every store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The row does not exist.
    #[error("{entity} not found: {key}")]
    NotFound {
        /// Table or entity name.
        entity: &'static str,
        /// Key that was looked up.
        key: String,
    },

    /// An insert collided with an existing key.
    #[error("duplicate {entity}: {key}")]
    DuplicateKey {
        /// Table or entity name.
        entity: &'static str,
        /// Key that collided.
        key: String,
    },

    /// A row referenced a parent that does not exist.
    #[error("foreign key violation: {detail}")]
    ForeignKeyViolation {
        /// What referenced what.
        detail: String,
    },

    /// The backend could not be reached or failed internally.
    #[error("store unavailable: {message}")]
    Unavailable {
        /// What the backend reported.
        message: String,
        /// Underlying error, if one exists.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl StoreError {
    /// A [`StoreError::NotFound`] for `entity` with the given key.
    pub fn not_found(entity: &'static str, key: impl fmt::Display) -> Self {
        Self::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    /// A [`StoreError::DuplicateKey`] for `entity` with the given key.
    pub fn duplicate(entity: &'static str, key: impl fmt::Display) -> Self {
        Self::DuplicateKey {
            entity,
            key: key.to_string(),
        }
    }

    /// A [`StoreError::ForeignKeyViolation`] with the given detail.
    pub fn foreign_key(detail: impl Into<String>) -> Self {
        Self::ForeignKeyViolation {
            detail: detail.into(),
        }
    }

    /// A [`StoreError::Unavailable`] without an underlying cause.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
            source: None,
        }
    }

    /// A [`StoreError::Unavailable`] wrapping an underlying error.
    pub fn unavailable_from(
        message: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Unavailable {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Whether this is a [`StoreError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Outcome of a video-room claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoRoomClaim {
    /// The compare-and-set succeeded; this caller must now provision.
    Won,
    /// Another caller holds the claim, or the room is already provisioned.
    Lost,
}

impl VideoRoomClaim {
    /// Whether this caller won the claim.
    pub fn won(self) -> bool {
        matches!(self, VideoRoomClaim::Won)
    }
}

/// Parameters for creating a session row.
#[derive(Debug, Clone, Serialize)]
pub struct NewSession {
    /// Public join code.
    pub code: SessionCode,
    /// Private host rejoin code.
    pub host_code: String,
    /// Display name of the host.
    pub host_name: String,
    /// Initial per-segment question counts.
    pub segment_settings: SegmentSettings,
}

impl NewSession {
    /// Session parameters with empty segment settings.
    pub fn new(
        code: SessionCode,
        host_code: impl Into<String>,
        host_name: impl Into<String>,
    ) -> Self {
        Self {
            code,
            host_code: host_code.into(),
            host_name: host_name.into(),
            segment_settings: SegmentSettings::new(),
        }
    }

    /// Sets the initial segment settings.
    pub fn with_segment_settings(mut self, settings: SegmentSettings) -> Self {
        self.segment_settings = settings;
        self
    }
}

/// Parameters for creating a player row.
#[derive(Debug, Clone, Serialize)]
pub struct NewPlayer {
    /// Stable player id.
    pub id: PlayerId,
    /// Session the player joins.
    pub session_code: SessionCode,
    /// Display name.
    pub name: String,
    /// Seat to occupy.
    pub role: PlayerRole,
    /// Country flag, if picked.
    pub flag: Option<String>,
    /// Club badge, if picked.
    pub club: Option<String>,
    /// Initial special button availability.
    pub special_buttons: BTreeMap<String, bool>,
    /// External account id, if signed in.
    pub user_id: Option<String>,
}

impl NewPlayer {
    /// Player parameters with no cosmetics and no special buttons.
    pub fn new(
        id: PlayerId,
        session_code: SessionCode,
        name: impl Into<String>,
        role: PlayerRole,
    ) -> Self {
        Self {
            id,
            session_code,
            name: name.into(),
            role,
            flag: None,
            club: None,
            special_buttons: BTreeMap::new(),
            user_id: None,
        }
    }

    /// Sets the country flag.
    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.flag = Some(flag.into());
        self
    }

    /// Sets the club badge.
    pub fn with_club(mut self, club: impl Into<String>) -> Self {
        self.club = Some(club.into());
        self
    }

    /// Sets the initial special button availability.
    pub fn with_special_buttons(mut self, buttons: BTreeMap<String, bool>) -> Self {
        self.special_buttons = buttons;
        self
    }

    /// Sets the external account id.
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Materializes a connected player row from these parameters.
    pub fn into_player(self, now: time::OffsetDateTime) -> Player {
        let mut player = Player::new(self.id, self.session_code, self.name, self.role, now);
        player.flag = self.flag;
        player.club = self.club;
        player.special_buttons = self.special_buttons;
        player.user_id = self.user_id;
        player
    }
}

/// Durable storage for sessions, players, and the session event log.
///
/// All methods take `&self`; implementors handle their own locking. Patch
/// updates are last-writer-wins per field and must bump the row's
/// `updated_at` (sessions) or leave `last_active` alone unless the patch
/// carries it (players).
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Inserts a session row in [`crate::model::GamePhase::Config`].
    ///
    /// Fails with [`StoreError::DuplicateKey`] if the code is taken.
    async fn create_session(&self, new: NewSession) -> StoreResult<Session>;

    /// Fetches a session row.
    async fn get_session(&self, code: &SessionCode) -> StoreResult<Session>;

    /// Applies a patch to a session row and returns the updated row.
    async fn update_session(
        &self,
        code: &SessionCode,
        patch: SessionPatch,
    ) -> StoreResult<Session>;

    /// Inserts a player row, connected, with zeroed score and strikes.
    ///
    /// A player id is globally unique: inserting an id that already exists
    /// replaces the old row even if it belonged to another session, so a
    /// device that hops games never appears in two rosters.
    ///
    /// Fails with [`StoreError::ForeignKeyViolation`] if the session does
    /// not exist.
    async fn add_player(&self, new: NewPlayer) -> StoreResult<Player>;

    /// Fetches a player row.
    async fn get_player(&self, id: &PlayerId) -> StoreResult<Player>;

    /// All player rows of a session, ordered by id.
    async fn session_players(&self, code: &SessionCode) -> StoreResult<Vec<Player>>;

    /// Applies a patch to a player row and returns the updated row.
    async fn update_player(&self, id: &PlayerId, patch: PlayerPatch) -> StoreResult<Player>;

    /// Sets a player's connected flag and bumps `last_active`.
    ///
    /// If the row is missing and `attrs` is given, the row is created first
    /// with those attributes. This keeps heartbeats that race ahead of the
    /// join write from failing. Without `attrs` a missing row is
    /// [`StoreError::NotFound`].
    async fn update_player_connection(
        &self,
        id: &PlayerId,
        code: &SessionCode,
        connected: bool,
        attrs: Option<NewPlayer>,
    ) -> StoreResult<Player>;

    /// Atomically claims the session's video room for provisioning.
    ///
    /// The compare-and-set takes the claim only when the current state
    /// [`crate::model::VideoRoomState::is_claimable`]. Exactly one of any
    /// number of concurrent callers observes [`VideoRoomClaim::Won`].
    async fn claim_video_room(&self, code: &SessionCode) -> StoreResult<VideoRoomClaim>;

    /// Records a successful provision, storing the join URL.
    ///
    /// Only meaningful after winning the claim; implementors may overwrite
    /// unconditionally.
    async fn complete_video_room(&self, code: &SessionCode, url: &str) -> StoreResult<Session>;

    /// Releases a won claim after a failed provision, reopening it.
    async fn release_video_room(&self, code: &SessionCode, reason: &str)
        -> StoreResult<Session>;

    /// Appends an entry to the session event log. Kind is a free-form tag
    /// (`"session_created"`, `"player_joined"`). Callers treat this as
    /// fire-and-forget; failures are logged, not propagated.
    async fn record_event(
        &self,
        code: &SessionCode,
        kind: &str,
        payload: serde_json::Value,
    ) -> StoreResult<()>;
}
