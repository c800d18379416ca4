//! Observable local game state.
//!
//! [`StateStore`] wraps a [`tokio::sync::watch`] channel: writers apply
//! validated [`StateUpdate`]s, readers either take a [`StateStore::snapshot`]
//! or hold a [`watch::Receiver`] and `.changed().await` on it. Every update
//! goes through one merge function, so there is no way to put the state into
//! a shape the model types don't allow.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use crate::model::{Participant, ParticipantKind, Player, PlayerId, Session};
use crate::protocol::{PlayerPatch, SessionPatch};

/// Relationship between local state and the realtime service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// No realtime channel; local and durable writes only.
    #[default]
    LocalOnly,
    /// Channel is up but the subscription has not been acknowledged yet.
    Connecting,
    /// Subscribed; broadcasts, change records, and presence flow.
    Subscribed,
    /// The channel died. Local state stays usable but no longer converges.
    Lost,
}

impl ConnectionStatus {
    /// Whether realtime traffic is currently flowing.
    pub fn is_realtime(self) -> bool {
        matches!(self, ConnectionStatus::Subscribed)
    }
}

/// Snapshot of everything a client knows about one session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GameState {
    /// The session row, once loaded or created.
    pub session: Option<Session>,
    /// Player rows keyed by id, every role included.
    pub players: BTreeMap<PlayerId, Player>,
    /// Live presence entries, replaced wholesale on every presence sync.
    pub participants: Vec<Participant>,
    /// Realtime connection status.
    pub connection: ConnectionStatus,
}

impl GameState {
    /// Looks up a player row.
    pub fn player(&self, id: &PlayerId) -> Option<&Player> {
        self.players.get(id)
    }

    /// Whether any live connection is a host connection.
    pub fn host_present(&self) -> bool {
        self.participants
            .iter()
            .any(|p| p.kind == ParticipantKind::Host)
    }
}

/// A validated state mutation. The only way to change a [`StateStore`].
#[derive(Debug, Clone)]
pub enum StateUpdate {
    /// Merge a partial session update. Dropped if no session is loaded.
    Session(SessionPatch),
    /// Replace the session row with a change-feed row image. The local
    /// timer fields are kept: they are broadcast-only, so the store's copy
    /// is always stale zeros.
    ReplaceSession(Box<Session>),
    /// Merge a partial player update. Dropped if the player is unknown.
    Player {
        id: PlayerId,
        patch: PlayerPatch,
    },
    /// Insert or replace a player row.
    UpsertPlayer(Box<Player>),
    /// Remove a player row.
    RemovePlayer(PlayerId),
    /// Replace the presence roster.
    Participants(Vec<Participant>),
    /// Set the connection status.
    Connection(ConnectionStatus),
}

/// Shared, observable holder for [`GameState`].
///
/// Cloning is cheap; every clone writes to the same underlying channel.
#[derive(Debug, Clone)]
pub struct StateStore {
    tx: watch::Sender<GameState>,
}

impl StateStore {
    /// Creates a store holding an empty, local-only state.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(GameState::default());
        Self { tx }
    }

    /// Clones the current state.
    pub fn snapshot(&self) -> GameState {
        self.tx.borrow().clone()
    }

    /// A receiver that observes every applied update.
    pub fn subscribe(&self) -> watch::Receiver<GameState> {
        self.tx.subscribe()
    }

    /// Replaces the session row and the full player roster in one update.
    /// Presence and connection status are kept; they belong to the live
    /// channel, not the durable snapshot being loaded.
    pub fn initialize(&self, session: Session, players: Vec<Player>) {
        self.tx.send_modify(|state| {
            state.session = Some(session);
            state.players = players.into_iter().map(|p| (p.id.clone(), p)).collect();
        });
    }

    /// Applies one update and notifies observers.
    pub fn apply(&self, update: StateUpdate) {
        self.tx.send_modify(|state| merge(state, update));
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

fn merge(state: &mut GameState, update: StateUpdate) {
    match update {
        StateUpdate::Session(patch) => match &mut state.session {
            Some(session) => patch.apply_to(session),
            None => debug!(?patch, "session patch dropped, no session loaded"),
        },
        StateUpdate::ReplaceSession(session) => {
            let mut incoming = *session;
            if let Some(current) = &state.session {
                incoming.timer_seconds = current.timer_seconds;
                incoming.timer_running = current.timer_running;
            }
            state.session = Some(incoming);
        }
        StateUpdate::Player { id, patch } => match state.players.get_mut(&id) {
            Some(player) => patch.apply_to(player),
            None => debug!(player = %id, "player patch dropped, row not loaded"),
        },
        StateUpdate::UpsertPlayer(player) => {
            state.players.insert(player.id.clone(), *player);
        }
        StateUpdate::RemovePlayer(id) => {
            state.players.remove(&id);
        }
        StateUpdate::Participants(participants) => {
            state.participants = participants;
        }
        StateUpdate::Connection(status) => {
            state.connection = status;
        }
    }
}
