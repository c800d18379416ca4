//! Row and identifier types for the shared game-session data model.
//!
//! Every type here serializes to the same JSON shape the durable store and
//! the realtime channel exchange. Conventions:
//!
//! - Timestamps are RFC 3339 strings (`time::serde::rfc3339`)
//! - Codes are validated, uppercased newtypes rather than bare strings
//! - The video room is a tagged state machine, not a pair of nullable columns

use std::collections::BTreeMap;
use std::fmt;

use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

/// Per-segment question counts, keyed by segment code.
pub type SegmentSettings = BTreeMap<SegmentCode, u32>;

/// Availability of one-shot special buttons, keyed by button id.
pub type SpecialButtons = BTreeMap<String, bool>;

// ── Identifiers ─────────────────────────────────────────────────────

/// A code or id failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {kind}: {value:?}")]
pub struct InvalidCode {
    kind: &'static str,
    value: String,
}

impl InvalidCode {
    fn new(kind: &'static str, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

/// Public join code identifying a session. Uppercase ASCII alphanumeric,
/// 4 to 12 characters. Input is uppercased before validation so codes typed
/// by players compare equal regardless of case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionCode(String);

/// Characters used for generated codes. 0/O and 1/I are omitted because
/// players read these codes off a shared screen.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const GENERATED_CODE_LEN: usize = 6;

impl SessionCode {
    /// Validates and normalizes a session code.
    pub fn new(raw: impl AsRef<str>) -> Result<Self, InvalidCode> {
        let code = raw.as_ref().trim().to_ascii_uppercase();
        let len_ok = (4..=12).contains(&code.len());
        if len_ok && code.bytes().all(|b| b.is_ascii_alphanumeric()) {
            Ok(Self(code))
        } else {
            Err(InvalidCode::new("session code", raw.as_ref()))
        }
    }

    /// Generates a random six-character code from an unambiguous alphabet.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let code = (0..GENERATED_CODE_LEN)
            .filter_map(|_| CODE_ALPHABET.choose(&mut rng))
            .map(|b| *b as char)
            .collect();
        Self(code)
    }

    /// The normalized code as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SessionCode {
    type Error = InvalidCode;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl std::str::FromStr for SessionCode {
    type Err = InvalidCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl From<SessionCode> for String {
    fn from(code: SessionCode) -> Self {
        code.0
    }
}

/// Stable identifier for a player row. Chosen by the caller (seat name,
/// device id, or account id) and reused across reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PlayerId(String);

impl PlayerId {
    /// Validates a player id. Must be non-empty after trimming.
    pub fn new(raw: impl AsRef<str>) -> Result<Self, InvalidCode> {
        let id = raw.as_ref().trim();
        if id.is_empty() {
            Err(InvalidCode::new("player id", raw.as_ref()))
        } else {
            Ok(Self(id.to_owned()))
        }
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PlayerId {
    type Error = InvalidCode;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl std::str::FromStr for PlayerId {
    type Err = InvalidCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl From<PlayerId> for String {
    fn from(id: PlayerId) -> Self {
        id.0
    }
}

/// Short code naming a game segment (e.g. `WSHA`, `BELL`). Uppercase ASCII
/// alphanumeric, 2 to 8 characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SegmentCode(String);

impl SegmentCode {
    /// Validates and normalizes a segment code.
    pub fn new(raw: impl AsRef<str>) -> Result<Self, InvalidCode> {
        let code = raw.as_ref().trim().to_ascii_uppercase();
        let len_ok = (2..=8).contains(&code.len());
        if len_ok && code.bytes().all(|b| b.is_ascii_alphanumeric()) {
            Ok(Self(code))
        } else {
            Err(InvalidCode::new("segment code", raw.as_ref()))
        }
    }

    /// The normalized code as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SegmentCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SegmentCode {
    type Error = InvalidCode;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl std::str::FromStr for SegmentCode {
    type Err = InvalidCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl From<SegmentCode> for String {
    fn from(code: SegmentCode) -> Self {
        code.0
    }
}

// ── Enums ───────────────────────────────────────────────────────────

/// Lifecycle phase of a game session. Phases only move forward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GamePhase {
    /// Host is picking segments and question counts.
    #[default]
    Config,
    /// Players are joining and taking seats.
    Lobby,
    /// Questions are live.
    Playing,
    /// Final scores are on screen.
    Results,
    /// Session is over; rows are kept for history only.
    Ended,
}

impl GamePhase {
    fn rank(self) -> u8 {
        match self {
            GamePhase::Config => 0,
            GamePhase::Lobby => 1,
            GamePhase::Playing => 2,
            GamePhase::Results => 3,
            GamePhase::Ended => 4,
        }
    }

    /// Whether moving from `from` to `self` goes strictly forward in the
    /// lifecycle. Every phase may jump straight to [`GamePhase::Ended`].
    pub fn is_forward_of(self, from: GamePhase) -> bool {
        self.rank() > from.rank()
    }
}

/// Seat a player occupies within a session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PlayerRole {
    /// Session owner; drives phase transitions and scoring.
    Host,
    /// Secondary device acting for the host (e.g. a stage controller).
    Controller,
    /// First contestant seat.
    PlayerA,
    /// Second contestant seat.
    PlayerB,
}

/// Provisioning state of a session's shared video room.
///
/// `Claimed` is the in-flight marker written by the compare-and-set claim;
/// only `Unclaimed` and `Failed` can be claimed, so concurrent provisioners
/// collapse to a single winner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum VideoRoomState {
    /// No provisioning attempt has been made.
    #[default]
    Unclaimed,
    /// Some client won the claim and is calling the provider now.
    Claimed,
    /// The room exists and is joinable at `url`.
    Provisioned {
        /// Join URL returned by the video provider.
        url: String,
    },
    /// The last attempt failed; the claim is open again.
    Failed {
        /// Human-readable cause of the failure.
        reason: String,
    },
}

impl VideoRoomState {
    /// Whether a provisioning claim may be taken from this state.
    pub fn is_claimable(&self) -> bool {
        matches!(self, VideoRoomState::Unclaimed | VideoRoomState::Failed { .. })
    }

    /// Join URL, if the room has been provisioned.
    pub fn url(&self) -> Option<&str> {
        match self {
            VideoRoomState::Provisioned { url } => Some(url),
            _ => None,
        }
    }
}

/// Role of a presence participant. Distinct from [`PlayerRole`]: presence
/// tracks connections, not seats, and observers never own a player row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantKind {
    /// The session host's connection.
    Host,
    /// A connection owning a player row.
    Player,
    /// A read-only viewer (lobby screen, spectators).
    Observer,
}

// ── Rows ────────────────────────────────────────────────────────────

/// Durable session row. One per game, keyed by [`SessionCode`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    /// Public join code.
    pub code: SessionCode,
    /// Private host rejoin code. Never broadcast to players.
    pub host_code: String,
    /// Display name of the host.
    pub host_name: String,
    /// Whether a host connection is currently present.
    pub host_connected: bool,
    /// Current lifecycle phase.
    pub phase: GamePhase,
    /// Segment currently being played, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_segment: Option<SegmentCode>,
    /// Zero-based index of the current question within the segment.
    pub current_question_index: u32,
    /// Questions configured per segment.
    #[serde(default)]
    pub segment_settings: SegmentSettings,
    /// Video room provisioning state.
    #[serde(default)]
    pub video_room: VideoRoomState,
    /// Countdown seconds remaining. Ephemeral; synced by broadcast only.
    pub timer_seconds: u32,
    /// Whether the countdown is running. Ephemeral like `timer_seconds`.
    pub timer_running: bool,
    /// Row creation time.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Last durable write time.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Session {
    /// Builds a fresh session row in [`GamePhase::Config`].
    pub fn new(
        code: SessionCode,
        host_code: impl Into<String>,
        host_name: impl Into<String>,
        segment_settings: SegmentSettings,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            code,
            host_code: host_code.into(),
            host_name: host_name.into(),
            host_connected: false,
            phase: GamePhase::Config,
            current_segment: None,
            current_question_index: 0,
            segment_settings,
            video_room: VideoRoomState::Unclaimed,
            timer_seconds: 0,
            timer_running: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Durable player row. Keyed by [`PlayerId`]; a player belongs to exactly
/// one session at a time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Player {
    /// Stable player id.
    pub id: PlayerId,
    /// Session this player currently belongs to.
    pub session_code: SessionCode,
    /// Display name.
    pub name: String,
    /// Country flag emoji or code, if the player picked one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flag: Option<String>,
    /// Favorite club badge, if the player picked one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub club: Option<String>,
    /// Seat occupied in the session.
    pub role: PlayerRole,
    /// Accumulated score.
    pub score: i64,
    /// Strikes accumulated in elimination segments.
    pub strikes: u32,
    /// One-shot special button availability.
    #[serde(default)]
    pub special_buttons: SpecialButtons,
    /// Whether a connection for this player is currently live.
    pub connected: bool,
    /// Last time a connection update or heartbeat touched this row.
    #[serde(with = "time::serde::rfc3339")]
    pub last_active: OffsetDateTime,
    /// External account id, if the player is signed in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl Player {
    /// Builds a fresh connected player row with zeroed score and strikes.
    pub fn new(
        id: PlayerId,
        session_code: SessionCode,
        name: impl Into<String>,
        role: PlayerRole,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            id,
            session_code,
            name: name.into(),
            flag: None,
            club: None,
            role,
            score: 0,
            strikes: 0,
            special_buttons: SpecialButtons::new(),
            connected: true,
            last_active: now,
            user_id: None,
        }
    }
}

/// Ephemeral presence entry. One per live connection; disappears when the
/// connection drops. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    /// Unique key for this connection. Fresh per connect, so the same person
    /// on two tabs shows up twice.
    pub key: Uuid,
    /// What kind of connection this is.
    pub kind: ParticipantKind,
    /// Player row this connection owns, if `kind` is `Player`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player_id: Option<PlayerId>,
    /// Display name, for lobby rosters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Participant {
    /// Presence entry for a host connection.
    pub fn host(name: impl Into<String>) -> Self {
        Self {
            key: Uuid::new_v4(),
            kind: ParticipantKind::Host,
            player_id: None,
            name: Some(name.into()),
        }
    }

    /// Presence entry for a connection owning `player_id`.
    pub fn player(player_id: PlayerId, name: impl Into<String>) -> Self {
        Self {
            key: Uuid::new_v4(),
            kind: ParticipantKind::Player,
            player_id: Some(player_id),
            name: Some(name.into()),
        }
    }

    /// Presence entry for a read-only observer.
    pub fn observer(name: Option<String>) -> Self {
        Self {
            key: Uuid::new_v4(),
            kind: ParticipantKind::Observer,
            player_id: None,
            name,
        }
    }
}
