//! Frame types exchanged over the realtime channel.
//!
//! Three layers share one text channel, mirrored after the realtime
//! service's topic model:
//!
//! - **Frames** ([`ClientFrame`], [`ServerFrame`]) are the outer envelope,
//!   adjacently tagged as `{"type": ..., "data": ...}`.
//! - **Broadcast events** ([`BroadcastEvent`]) are client-originated fan-out
//!   payloads carried inside `Broadcast` frames.
//! - **Change records** ([`ChangeRecord`]) are server-originated row images
//!   from the store's change feed.
//!
//! Patches ([`SessionPatch`], [`PlayerPatch`]) are all-`Option` structs:
//! present fields overwrite, absent fields leave the row alone. Merge order
//! is last-writer-wins per field, with no ordering guarantee across the
//! broadcast and change-feed paths.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::model::{
    GamePhase, Participant, Player, PlayerId, PlayerRole, SegmentCode, SegmentSettings, Session,
    SessionCode, SpecialButtons, VideoRoomState,
};

// ── Patches ─────────────────────────────────────────────────────────

/// Partial update for a [`Session`] row. Absent fields are untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_connected: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<GamePhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_segment: Option<SegmentCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_question_index: Option<u32>,
    /// Whole-map replacement; per-segment edits send the full map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_settings: Option<SegmentSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_room: Option<VideoRoomState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timer_seconds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timer_running: Option<bool>,
}

impl SessionPatch {
    /// Whether every field is absent.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Overwrites the fields of `session` that this patch carries.
    pub fn apply_to(&self, session: &mut Session) {
        if let Some(host_name) = &self.host_name {
            session.host_name = host_name.clone();
        }
        if let Some(host_connected) = self.host_connected {
            session.host_connected = host_connected;
        }
        if let Some(phase) = self.phase {
            session.phase = phase;
        }
        if let Some(segment) = &self.current_segment {
            session.current_segment = Some(segment.clone());
        }
        if let Some(index) = self.current_question_index {
            session.current_question_index = index;
        }
        if let Some(settings) = &self.segment_settings {
            session.segment_settings = settings.clone();
        }
        if let Some(video_room) = &self.video_room {
            session.video_room = video_room.clone();
        }
        if let Some(seconds) = self.timer_seconds {
            session.timer_seconds = seconds;
        }
        if let Some(running) = self.timer_running {
            session.timer_running = running;
        }
    }
}

/// Partial update for a [`Player`] row. Absent fields are untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlayerPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub club: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<PlayerRole>,
    /// Absolute value, not a delta. Callers compute deltas against their
    /// local snapshot before patching.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strikes: Option<u32>,
    /// Whole-map replacement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub special_buttons: Option<SpecialButtons>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected: Option<bool>,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_active: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl PlayerPatch {
    /// Whether every field is absent.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Overwrites the fields of `player` that this patch carries.
    pub fn apply_to(&self, player: &mut Player) {
        if let Some(name) = &self.name {
            player.name = name.clone();
        }
        if let Some(flag) = &self.flag {
            player.flag = Some(flag.clone());
        }
        if let Some(club) = &self.club {
            player.club = Some(club.clone());
        }
        if let Some(role) = self.role {
            player.role = role;
        }
        if let Some(score) = self.score {
            player.score = score;
        }
        if let Some(strikes) = self.strikes {
            player.strikes = strikes;
        }
        if let Some(buttons) = &self.special_buttons {
            player.special_buttons = buttons.clone();
        }
        if let Some(connected) = self.connected {
            player.connected = connected;
        }
        if let Some(last_active) = self.last_active {
            player.last_active = last_active;
        }
        if let Some(user_id) = &self.user_id {
            player.user_id = Some(user_id.clone());
        }
    }
}

// ── Broadcast events ────────────────────────────────────────────────

/// Client-originated events fanned out to every subscriber of a session.
///
/// Broadcasts are advisory: the durable store remains the source of truth,
/// and the change feed will eventually deliver the same data as row images.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum BroadcastEvent {
    /// Session fields changed.
    GameStateUpdate(SessionPatch),
    /// One player's fields changed.
    PlayerUpdate {
        id: PlayerId,
        patch: PlayerPatch,
    },
    /// A player joined (boxed to reduce enum size).
    PlayerJoin { player: Box<Player> },
    /// A player left voluntarily.
    PlayerLeave { id: PlayerId },
}

// ── Change feed ─────────────────────────────────────────────────────

/// What happened to the row in the store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Which table changed, carrying the full row image after the change.
/// For deletes the image holds the row's last known values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "table", content = "row", rename_all = "snake_case")]
pub enum ChangeRow {
    Sessions(Box<Session>),
    Players(Box<Player>),
}

/// One record from the store's change feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeRecord {
    /// Kind of change.
    pub kind: ChangeKind,
    /// Table and row image.
    pub change: ChangeRow,
}

// ── Frames ──────────────────────────────────────────────────────────

/// Frames sent from client to the realtime service.
///
/// ```text
/// {"type":"Subscribe","data":{"session_code":"AB12"}}
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum ClientFrame {
    /// Join the topic for one session (MUST be the first frame).
    Subscribe {
        session_code: SessionCode,
    },
    /// Fan an event out to every other subscriber of the session.
    Broadcast {
        event: BroadcastEvent,
    },
    /// Announce a presence entry for this connection.
    Track {
        participant: Participant,
    },
    /// Withdraw a previously tracked presence entry.
    Untrack {
        key: Uuid,
    },
    /// Leave the session topic. The service drops tracked presence entries
    /// for this connection on unsubscribe or disconnect.
    Unsubscribe,
}

/// Frames sent from the realtime service to the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum ServerFrame {
    /// Subscription acknowledged; broadcasts and presence flow from now on.
    Subscribed {
        session_code: SessionCode,
    },
    /// A broadcast event from another subscriber.
    Broadcast {
        event: BroadcastEvent,
    },
    /// A row changed in the durable store.
    Change(ChangeRecord),
    /// Full snapshot of presence entries, sent after subscribe and
    /// whenever the service re-syncs.
    PresenceSync {
        participants: Vec<Participant>,
    },
    /// A presence entry appeared.
    PresenceJoin {
        participant: Participant,
    },
    /// A presence entry disappeared (untrack, unsubscribe, or dropped
    /// connection).
    PresenceLeave {
        participant: Participant,
    },
    /// The service rejected a frame or hit an internal error.
    Error {
        message: String,
    },
}
