//! In-memory store backend.
//!
//! Backs tests, demos, and fully local play. One async mutex guards all
//! tables, which makes every operation atomic, including the video-room
//! compare-and-set. Nothing here survives a restart.

use std::collections::BTreeMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::model::{Player, PlayerId, Session, SessionCode, VideoRoomState};
use crate::protocol::{PlayerPatch, SessionPatch};
use crate::store::{
    NewPlayer, NewSession, SessionStore, StoreError, StoreResult, VideoRoomClaim,
};

/// One entry in the in-memory session event log.
#[derive(Debug, Clone)]
pub struct EventRecord {
    /// Session the event belongs to.
    pub session_code: SessionCode,
    /// Free-form event tag.
    pub kind: String,
    /// Structured event payload.
    pub payload: serde_json::Value,
    /// When the event was recorded.
    pub at: OffsetDateTime,
}

#[derive(Default)]
struct Tables {
    sessions: BTreeMap<SessionCode, Session>,
    players: BTreeMap<PlayerId, Player>,
    events: Vec<EventRecord>,
}

/// [`SessionStore`] backed by process memory.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the event log for one session, oldest first.
    pub async fn events(&self, code: &SessionCode) -> Vec<EventRecord> {
        let tables = self.tables.lock().await;
        tables
            .events
            .iter()
            .filter(|e| &e.session_code == code)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_session(&self, new: NewSession) -> StoreResult<Session> {
        let mut tables = self.tables.lock().await;
        if tables.sessions.contains_key(&new.code) {
            return Err(StoreError::duplicate("session", &new.code));
        }
        let session = Session::new(
            new.code.clone(),
            new.host_code,
            new.host_name,
            new.segment_settings,
            OffsetDateTime::now_utc(),
        );
        tables.sessions.insert(new.code, session.clone());
        Ok(session)
    }

    async fn get_session(&self, code: &SessionCode) -> StoreResult<Session> {
        let tables = self.tables.lock().await;
        tables
            .sessions
            .get(code)
            .cloned()
            .ok_or_else(|| StoreError::not_found("session", code))
    }

    async fn update_session(
        &self,
        code: &SessionCode,
        patch: SessionPatch,
    ) -> StoreResult<Session> {
        let mut tables = self.tables.lock().await;
        let session = tables
            .sessions
            .get_mut(code)
            .ok_or_else(|| StoreError::not_found("session", code))?;
        patch.apply_to(session);
        session.updated_at = OffsetDateTime::now_utc();
        Ok(session.clone())
    }

    async fn add_player(&self, new: NewPlayer) -> StoreResult<Player> {
        let mut tables = self.tables.lock().await;
        if !tables.sessions.contains_key(&new.session_code) {
            return Err(StoreError::foreign_key(format!(
                "player {} references missing session {}",
                new.id, new.session_code
            )));
        }
        // Same id in another session: the insert replaces that row, so a
        // device hopping games never shows up in two rosters.
        let player = new.into_player(OffsetDateTime::now_utc());
        tables.players.insert(player.id.clone(), player.clone());
        Ok(player)
    }

    async fn get_player(&self, id: &PlayerId) -> StoreResult<Player> {
        let tables = self.tables.lock().await;
        tables
            .players
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("player", id))
    }

    async fn session_players(&self, code: &SessionCode) -> StoreResult<Vec<Player>> {
        let tables = self.tables.lock().await;
        if !tables.sessions.contains_key(code) {
            return Err(StoreError::not_found("session", code));
        }
        Ok(tables
            .players
            .values()
            .filter(|p| &p.session_code == code)
            .cloned()
            .collect())
    }

    async fn update_player(&self, id: &PlayerId, patch: PlayerPatch) -> StoreResult<Player> {
        let mut tables = self.tables.lock().await;
        let player = tables
            .players
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("player", id))?;
        patch.apply_to(player);
        Ok(player.clone())
    }

    async fn update_player_connection(
        &self,
        id: &PlayerId,
        code: &SessionCode,
        connected: bool,
        attrs: Option<NewPlayer>,
    ) -> StoreResult<Player> {
        let now = OffsetDateTime::now_utc();
        let mut tables = self.tables.lock().await;
        if let Some(player) = tables.players.get_mut(id) {
            player.connected = connected;
            player.last_active = now;
            return Ok(player.clone());
        }
        match attrs {
            Some(attrs) => {
                if !tables.sessions.contains_key(code) {
                    return Err(StoreError::foreign_key(format!(
                        "player {id} references missing session {code}"
                    )));
                }
                let mut player = attrs.into_player(now);
                player.connected = connected;
                tables.players.insert(player.id.clone(), player.clone());
                Ok(player)
            }
            None => Err(StoreError::not_found("player", id)),
        }
    }

    async fn claim_video_room(&self, code: &SessionCode) -> StoreResult<VideoRoomClaim> {
        let mut tables = self.tables.lock().await;
        let session = tables
            .sessions
            .get_mut(code)
            .ok_or_else(|| StoreError::not_found("session", code))?;
        if session.video_room.is_claimable() {
            session.video_room = VideoRoomState::Claimed;
            session.updated_at = OffsetDateTime::now_utc();
            Ok(VideoRoomClaim::Won)
        } else {
            Ok(VideoRoomClaim::Lost)
        }
    }

    async fn complete_video_room(&self, code: &SessionCode, url: &str) -> StoreResult<Session> {
        let mut tables = self.tables.lock().await;
        let session = tables
            .sessions
            .get_mut(code)
            .ok_or_else(|| StoreError::not_found("session", code))?;
        session.video_room = VideoRoomState::Provisioned { url: url.into() };
        session.updated_at = OffsetDateTime::now_utc();
        Ok(session.clone())
    }

    async fn release_video_room(
        &self,
        code: &SessionCode,
        reason: &str,
    ) -> StoreResult<Session> {
        let mut tables = self.tables.lock().await;
        let session = tables
            .sessions
            .get_mut(code)
            .ok_or_else(|| StoreError::not_found("session", code))?;
        session.video_room = VideoRoomState::Failed {
            reason: reason.into(),
        };
        session.updated_at = OffsetDateTime::now_utc();
        Ok(session.clone())
    }

    async fn record_event(
        &self,
        code: &SessionCode,
        kind: &str,
        payload: serde_json::Value,
    ) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        tables.events.push(EventRecord {
            session_code: code.clone(),
            kind: kind.into(),
            payload,
            at: OffsetDateTime::now_utc(),
        });
        Ok(())
    }
}
