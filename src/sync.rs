//! The session sync engine.
//!
//! [`SessionSync`] is a thin handle that talks to a background channel loop
//! over an unbounded MPSC channel. State flows the other way through a
//! [`StateStore`]: the loop applies incoming broadcasts, change records, and
//! presence updates, and every observer sees them through the watch channel
//! returned from [`SessionSync::connect`].
//!
//! Mutations follow one data flow: validate against the local snapshot,
//! apply locally (optimistic), write durably, then broadcast. Broadcasts are
//! fire-and-forget; if the channel is down the store's change feed converges
//! remote peers eventually.
//!
//! # Example
//!
//! ```rust,ignore
//! let channel = WebSocketChannel::connect(url).await?;
//! let config = SyncConfig::new(SessionCode::new("AB12")?);
//! let (sync, mut state) = SessionSync::connect(channel, store, config).await;
//!
//! sync.join_game(JoinGame::new(player_id, "Nadia", PlayerRole::PlayerA)).await?;
//!
//! while state.changed().await.is_ok() {
//!     let snapshot = state.borrow().clone();
//!     render(&snapshot);
//! }
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::channel::RealtimeChannel;
use crate::error::{Result, SyncError};
use crate::heartbeat::{HeartbeatRegistry, DEFAULT_HEARTBEAT_INTERVAL};
use crate::model::{
    GamePhase, Participant, ParticipantKind, Player, PlayerId, PlayerRole, SegmentCode,
    SegmentSettings, Session, SessionCode, SpecialButtons, VideoRoomState,
};
use crate::protocol::{
    BroadcastEvent, ChangeKind, ChangeRecord, ChangeRow, ClientFrame, PlayerPatch, ServerFrame,
    SessionPatch,
};
use crate::state::{ConnectionStatus, GameState, StateStore, StateUpdate};
use crate::store::{NewPlayer, NewSession, SharedStore};
use crate::video::{self, ProvisionOutcome, VideoRoomProvider};

/// Default timeout for the graceful shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`SessionSync`] engine.
///
/// The only required field is the session code; all others have sensible
/// defaults.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use thirty_sync::model::SessionCode;
/// use thirty_sync::sync::SyncConfig;
///
/// let code = SessionCode::new("AB12").unwrap();
/// let config = SyncConfig::new(code)
///     .with_heartbeat_interval(Duration::from_secs(30));
/// assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
/// ```
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Code of the session this engine synchronizes.
    pub session_code: SessionCode,
    /// Interval between liveness writes for locally-registered players.
    ///
    /// Defaults to **60 seconds**. Values below 10ms are clamped by the
    /// heartbeat registry.
    pub heartbeat_interval: Duration,
    /// Timeout for the graceful shutdown.
    ///
    /// When [`SessionSync::disconnect`] is called, the background channel
    /// loop is given this much time to close the channel. If the timeout
    /// expires the task is aborted.
    ///
    /// Defaults to **1 second**.
    pub shutdown_timeout: Duration,
}

impl SyncConfig {
    /// Create a new configuration for the given session code.
    pub fn new(session_code: SessionCode) -> Self {
        Self {
            session_code,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Set the interval between liveness writes.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the timeout for the graceful shutdown.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

// ── Action parameters ───────────────────────────────────────────────

/// Parameters for creating a session as the host.
///
/// # Example
///
/// ```
/// use thirty_sync::sync::StartSession;
///
/// let params = StartSession::new("H0STC0DE", "Layla");
/// assert_eq!(params.host_name, "Layla");
/// ```
#[derive(Debug, Clone)]
pub struct StartSession {
    /// Private host rejoin code.
    pub host_code: String,
    /// Display name of the host.
    pub host_name: String,
    /// Initial per-segment question counts.
    pub segment_settings: SegmentSettings,
}

impl StartSession {
    /// Create session parameters with empty segment settings.
    pub fn new(host_code: impl Into<String>, host_name: impl Into<String>) -> Self {
        Self {
            host_code: host_code.into(),
            host_name: host_name.into(),
            segment_settings: SegmentSettings::new(),
        }
    }

    /// Set the initial segment settings.
    #[must_use]
    pub fn with_segment_settings(mut self, settings: SegmentSettings) -> Self {
        self.segment_settings = settings;
        self
    }
}

/// Parameters for joining a session as a player.
///
/// # Example
///
/// ```
/// use thirty_sync::model::{PlayerId, PlayerRole};
/// use thirty_sync::sync::JoinGame;
///
/// let id = PlayerId::new("seat-a").unwrap();
/// let params = JoinGame::new(id, "Nadia", PlayerRole::PlayerA)
///     .with_flag("🇹🇳")
///     .with_club("EST");
/// assert_eq!(params.club.as_deref(), Some("EST"));
/// ```
#[derive(Debug, Clone)]
pub struct JoinGame {
    /// Stable player id.
    pub player_id: PlayerId,
    /// Display name.
    pub name: String,
    /// Seat to occupy.
    pub role: PlayerRole,
    /// Country flag, if picked.
    pub flag: Option<String>,
    /// Club badge, if picked.
    pub club: Option<String>,
    /// Initial special button availability.
    pub special_buttons: SpecialButtons,
    /// External account id, if signed in.
    pub user_id: Option<String>,
}

impl JoinGame {
    /// Create join parameters with the required fields.
    pub fn new(player_id: PlayerId, name: impl Into<String>, role: PlayerRole) -> Self {
        Self {
            player_id,
            name: name.into(),
            role,
            flag: None,
            club: None,
            special_buttons: SpecialButtons::new(),
            user_id: None,
        }
    }

    /// Set the country flag.
    #[must_use]
    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.flag = Some(flag.into());
        self
    }

    /// Set the club badge.
    #[must_use]
    pub fn with_club(mut self, club: impl Into<String>) -> Self {
        self.club = Some(club.into());
        self
    }

    /// Set the initial special button availability.
    #[must_use]
    pub fn with_special_buttons(mut self, buttons: SpecialButtons) -> Self {
        self.special_buttons = buttons;
        self
    }

    /// Set the external account id.
    #[must_use]
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    fn into_new_player(self, session_code: SessionCode) -> NewPlayer {
        NewPlayer {
            id: self.player_id,
            session_code,
            name: self.name,
            role: self.role,
            flag: self.flag,
            club: self.club,
            special_buttons: self.special_buttons,
            user_id: self.user_id,
        }
    }
}

// ── Local presence bookkeeping ──────────────────────────────────────

/// Presence entries owned by this engine: player seats and the host entry.
/// Shared between the handle (which registers them) and the channel loop
/// (which aligns heartbeats with presence for owned seats).
#[derive(Default)]
struct LocalPresence {
    seats: StdMutex<HashMap<PlayerId, Uuid>>,
    host_key: StdMutex<Option<Uuid>>,
}

impl LocalPresence {
    fn insert_seat(&self, id: PlayerId, key: Uuid) {
        self.lock_seats().insert(id, key);
    }

    fn remove_seat(&self, id: &PlayerId) -> Option<Uuid> {
        self.lock_seats().remove(id)
    }

    fn owns_seat(&self, id: &PlayerId) -> bool {
        self.lock_seats().contains_key(id)
    }

    fn drain_keys(&self) -> Vec<Uuid> {
        let mut keys: Vec<Uuid> = self.lock_seats().drain().map(|(_, key)| key).collect();
        if let Some(host) = self.take_host() {
            keys.push(host);
        }
        keys
    }

    fn set_host(&self, key: Uuid) {
        *self
            .host_key
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(key);
    }

    fn take_host(&self) -> Option<Uuid> {
        self.host_key
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn is_host(&self) -> bool {
        self.host_key
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn lock_seats(&self) -> std::sync::MutexGuard<'_, HashMap<PlayerId, Uuid>> {
        self.seats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Engine handle ───────────────────────────────────────────────────

/// Handle for one synchronized game session.
///
/// Created via [`SessionSync::connect`] (realtime) or
/// [`SessionSync::local_only`] (no channel). All mutating methods validate
/// against the local snapshot, apply optimistically, write through the
/// store, and broadcast. Broadcast delivery is best-effort by design.
pub struct SessionSync {
    config: SyncConfig,
    store: SharedStore,
    state: StateStore,
    heartbeats: Arc<HeartbeatRegistry>,
    presence: Arc<LocalPresence>,
    /// Sender half of the frame channel to the channel loop. `None` in
    /// local-only mode or after disconnect.
    frame_tx: Option<mpsc::UnboundedSender<ClientFrame>>,
    /// Handle to the background channel loop task.
    task: Option<tokio::task::JoinHandle<()>>,
    /// Oneshot sender to signal the channel loop to shut down gracefully.
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl SessionSync {
    /// Start a realtime engine over a connected channel.
    ///
    /// Loads the current session snapshot from the store (if any), then
    /// spawns the channel loop, which immediately sends a
    /// [`Subscribe`](ClientFrame::Subscribe) frame for the configured
    /// session. Store unavailability is tolerated: the engine starts with
    /// an empty snapshot and converges once frames arrive.
    ///
    /// Returns the handle plus a state receiver that observes every update.
    pub async fn connect(
        channel: impl RealtimeChannel,
        store: SharedStore,
        config: SyncConfig,
    ) -> (Self, watch::Receiver<GameState>) {
        let state = StateStore::new();
        state.apply(StateUpdate::Connection(ConnectionStatus::Connecting));

        load_snapshot(&store, &config.session_code, &state).await;

        let (frame_tx, frame_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let heartbeats = Arc::new(HeartbeatRegistry::new(
            Arc::clone(&store),
            config.heartbeat_interval,
        ));
        let presence = Arc::new(LocalPresence::default());

        // Queue the Subscribe frame so the channel loop picks it up as the
        // very first outgoing frame. This cannot fail because we just
        // created the channel.
        let _ = frame_tx.send(ClientFrame::Subscribe {
            session_code: config.session_code.clone(),
        });

        let ctx = LoopCtx {
            session_code: config.session_code.clone(),
            state: state.clone(),
            store: Arc::clone(&store),
            heartbeats: Arc::clone(&heartbeats),
            presence: Arc::clone(&presence),
        };
        let task = tokio::spawn(channel_loop(channel, frame_rx, shutdown_rx, ctx));

        let receiver = state.subscribe();
        let sync = Self {
            config,
            store,
            state,
            heartbeats,
            presence,
            frame_tx: Some(frame_tx),
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
        };

        (sync, receiver)
    }

    /// Start an engine with no realtime channel.
    ///
    /// Durable writes and heartbeats still work; broadcasts and presence
    /// frames are dropped with a debug log. The state starts empty — use
    /// [`start_session`](Self::start_session) or
    /// [`load`](Self::load) to populate it.
    pub fn local_only(store: SharedStore, config: SyncConfig) -> (Self, watch::Receiver<GameState>) {
        let state = StateStore::new();
        let heartbeats = Arc::new(HeartbeatRegistry::new(
            Arc::clone(&store),
            config.heartbeat_interval,
        ));

        let receiver = state.subscribe();
        let sync = Self {
            config,
            store,
            state,
            heartbeats,
            presence: Arc::new(LocalPresence::default()),
            frame_tx: None,
            task: None,
            shutdown_tx: None,
        };

        (sync, receiver)
    }

    // ── Accessors ───────────────────────────────────────────────────

    /// The observable state store.
    pub fn state(&self) -> &StateStore {
        &self.state
    }

    /// A fresh receiver observing every state update.
    pub fn subscribe(&self) -> watch::Receiver<GameState> {
        self.state.subscribe()
    }

    /// Clones the current state.
    pub fn snapshot(&self) -> GameState {
        self.state.snapshot()
    }

    /// Code of the session this engine synchronizes.
    pub fn session_code(&self) -> &SessionCode {
        &self.config.session_code
    }

    /// Current connection status.
    pub fn connection(&self) -> ConnectionStatus {
        self.state.snapshot().connection
    }

    /// Whether the subscription has been acknowledged by the service.
    pub fn is_subscribed(&self) -> bool {
        self.connection().is_realtime()
    }

    /// Ids of locally-registered players with a running heartbeat.
    pub fn active_heartbeats(&self) -> Vec<PlayerId> {
        self.heartbeats.active_players()
    }

    // ── Session actions ─────────────────────────────────────────────

    /// Create the session row and load it as the local snapshot.
    ///
    /// # Errors
    ///
    /// [`StoreError::DuplicateKey`](crate::StoreError::DuplicateKey) if the
    /// code is already taken.
    pub async fn start_session(&self, params: StartSession) -> Result<Session> {
        let session = self
            .store
            .create_session(
                NewSession::new(
                    self.config.session_code.clone(),
                    params.host_code,
                    params.host_name,
                )
                .with_segment_settings(params.segment_settings),
            )
            .await?;

        self.state.initialize(session.clone(), vec![]);
        self.audit("session_created", json!({ "host_name": session.host_name }));
        Ok(session)
    }

    /// Load (or reload) the session snapshot from the store.
    ///
    /// Useful in local-only mode or to force a re-sync after a long
    /// connection loss.
    pub async fn load(&self) -> Result<Session> {
        let session = self.store.get_session(&self.config.session_code).await?;
        let players = self
            .store
            .session_players(&self.config.session_code)
            .await?;
        self.state.initialize(session.clone(), players);
        Ok(session)
    }

    /// Move the session to the next phase.
    ///
    /// Phases only move forward; [`GamePhase::Ended`] is reachable from
    /// every phase.
    ///
    /// # Errors
    ///
    /// [`SyncError::PhaseRegression`] if `next` does not move forward,
    /// [`SyncError::NoActiveSession`] if no session is loaded.
    pub async fn advance_phase(&self, next: GamePhase) -> Result<()> {
        let session = self.current_session()?;
        if !next.is_forward_of(session.phase) {
            return Err(SyncError::PhaseRegression {
                from: session.phase,
                to: next,
            });
        }
        self.commit_session_patch(SessionPatch {
            phase: Some(next),
            ..SessionPatch::default()
        })
        .await
    }

    /// Switch to a segment and position within it.
    pub async fn set_segment(&self, segment: SegmentCode, question_index: u32) -> Result<()> {
        self.current_session()?;
        self.commit_session_patch(SessionPatch {
            current_segment: Some(segment),
            current_question_index: Some(question_index),
            ..SessionPatch::default()
        })
        .await
    }

    /// Advance to the next question in the current segment.
    ///
    /// Returns the new question index.
    pub async fn next_question(&self) -> Result<u32> {
        let session = self.current_session()?;
        let next = session.current_question_index.saturating_add(1);
        self.commit_session_patch(SessionPatch {
            current_question_index: Some(next),
            ..SessionPatch::default()
        })
        .await?;
        Ok(next)
    }

    /// Replace the per-segment question counts.
    ///
    /// # Errors
    ///
    /// [`SyncError::SegmentsLocked`] once play has begun.
    pub async fn configure_segments(&self, settings: SegmentSettings) -> Result<()> {
        let session = self.current_session()?;
        if matches!(
            session.phase,
            GamePhase::Playing | GamePhase::Results | GamePhase::Ended
        ) {
            return Err(SyncError::SegmentsLocked {
                phase: session.phase,
            });
        }
        self.commit_session_patch(SessionPatch {
            segment_settings: Some(settings),
            ..SessionPatch::default()
        })
        .await
    }

    /// Set the countdown timer. Ephemeral: applied locally and broadcast,
    /// never written to the store.
    pub fn set_timer(&self, seconds: u32, running: bool) {
        let patch = SessionPatch {
            timer_seconds: Some(seconds),
            timer_running: Some(running),
            ..SessionPatch::default()
        };
        self.state.apply(StateUpdate::Session(patch.clone()));
        self.broadcast(BroadcastEvent::GameStateUpdate(patch));
    }

    // ── Player actions ──────────────────────────────────────────────

    /// Join the session as a player and register the seat locally.
    ///
    /// Creates the row, broadcasts the join, tracks a presence entry, and
    /// starts the seat's heartbeat. Joining with an id that already exists
    /// resets that row (fresh score and strikes) — use
    /// [`adopt_player`](Self::adopt_player) to reattach without resetting.
    pub async fn join_game(&self, params: JoinGame) -> Result<Player> {
        let attrs = params.into_new_player(self.config.session_code.clone());
        let player = self.store.add_player(attrs.clone()).await?;

        self.state
            .apply(StateUpdate::UpsertPlayer(Box::new(player.clone())));
        self.broadcast(BroadcastEvent::PlayerJoin {
            player: Box::new(player.clone()),
        });

        let participant = Participant::player(player.id.clone(), player.name.clone());
        self.presence.insert_seat(player.id.clone(), participant.key);
        self.send_frame(ClientFrame::Track { participant });

        self.heartbeats.start(
            player.id.clone(),
            self.config.session_code.clone(),
            Some(attrs),
        );

        self.audit(
            "player_joined",
            json!({ "id": player.id.as_str(), "role": player.role }),
        );
        Ok(player)
    }

    /// Reattach to an existing player row after a reconnect, keeping its
    /// score and strikes.
    ///
    /// # Errors
    ///
    /// [`SyncError::UnknownPlayer`] if the row belongs to another session,
    /// [`StoreError::NotFound`](crate::StoreError::NotFound) if it does not
    /// exist.
    pub async fn adopt_player(&self, id: &PlayerId) -> Result<Player> {
        // Validate ownership before touching the row: the connection write
        // must never land on a seat that has hopped to another session.
        let existing = self.store.get_player(id).await?;
        if existing.session_code != self.config.session_code {
            return Err(SyncError::UnknownPlayer(id.to_string()));
        }
        let player = self
            .store
            .update_player_connection(id, &self.config.session_code, true, None)
            .await?;

        self.state
            .apply(StateUpdate::UpsertPlayer(Box::new(player.clone())));
        self.broadcast(BroadcastEvent::PlayerUpdate {
            id: player.id.clone(),
            patch: PlayerPatch {
                connected: Some(true),
                ..PlayerPatch::default()
            },
        });

        let participant = Participant::player(player.id.clone(), player.name.clone());
        self.presence.insert_seat(player.id.clone(), participant.key);
        self.send_frame(ClientFrame::Track { participant });

        self.heartbeats
            .start(player.id.clone(), self.config.session_code.clone(), None);

        Ok(player)
    }

    /// Leave the session voluntarily.
    ///
    /// Stops the seat's heartbeat, withdraws its presence entry, broadcasts
    /// the leave, and durably marks the row disconnected. The row itself is
    /// kept for history.
    pub async fn leave_game(&self, id: &PlayerId) -> Result<()> {
        self.heartbeats.stop(id);
        if let Some(key) = self.presence.remove_seat(id) {
            self.send_frame(ClientFrame::Untrack { key });
        }

        self.state.apply(StateUpdate::RemovePlayer(id.clone()));
        self.broadcast(BroadcastEvent::PlayerLeave { id: id.clone() });

        self.heartbeats
            .mark_disconnected(id, &self.config.session_code)
            .await?;

        self.audit("player_left", json!({ "id": id.as_str() }));
        Ok(())
    }

    /// Add `delta` to a player's score. Returns the new absolute score.
    pub async fn score_player(&self, id: &PlayerId, delta: i64) -> Result<i64> {
        let player = self.current_player(id)?;
        let score = player.score.saturating_add(delta);
        self.commit_player_patch(
            id,
            PlayerPatch {
                score: Some(score),
                ..PlayerPatch::default()
            },
        )
        .await?;
        Ok(score)
    }

    /// Add one strike to a player. Returns the new strike count.
    pub async fn add_strike(&self, id: &PlayerId) -> Result<u32> {
        let player = self.current_player(id)?;
        let strikes = player.strikes.saturating_add(1);
        self.commit_player_patch(
            id,
            PlayerPatch {
                strikes: Some(strikes),
                ..PlayerPatch::default()
            },
        )
        .await?;
        Ok(strikes)
    }

    /// Set the availability of one special button for a player.
    pub async fn set_special_button(
        &self,
        id: &PlayerId,
        button: &str,
        available: bool,
    ) -> Result<()> {
        let player = self.current_player(id)?;
        let mut buttons = player.special_buttons.clone();
        buttons.insert(button.to_owned(), available);
        self.commit_player_patch(
            id,
            PlayerPatch {
                special_buttons: Some(buttons),
                ..PlayerPatch::default()
            },
        )
        .await
    }

    /// Apply an arbitrary patch to a player (profile edits and the like).
    pub async fn patch_player(&self, id: &PlayerId, patch: PlayerPatch) -> Result<()> {
        self.current_player(id)?;
        self.commit_player_patch(id, patch).await
    }

    // ── Presence actions ────────────────────────────────────────────

    /// Announce this connection as the session host.
    ///
    /// Tracks a host presence entry and durably flips `host_connected`.
    pub async fn announce_host(&self) -> Result<()> {
        let session = self.current_session()?;
        let participant = Participant::host(session.host_name.clone());
        self.presence.set_host(participant.key);
        self.send_frame(ClientFrame::Track { participant });

        self.commit_session_patch(SessionPatch {
            host_connected: Some(true),
            ..SessionPatch::default()
        })
        .await
    }

    /// Announce this connection as a read-only observer. Returns the
    /// presence key for [`withdraw_observer`](Self::withdraw_observer).
    pub fn announce_observer(&self, name: Option<String>) -> Uuid {
        let participant = Participant::observer(name);
        let key = participant.key;
        self.send_frame(ClientFrame::Track { participant });
        key
    }

    /// Withdraw an observer presence entry.
    pub fn withdraw_observer(&self, key: Uuid) {
        self.send_frame(ClientFrame::Untrack { key });
    }

    // ── Video room ──────────────────────────────────────────────────

    /// Provision the session's shared video room, arbitrated through the
    /// store so at most one concurrent caller reaches the provider.
    ///
    /// On a win the URL is written durably and broadcast. Losing the claim
    /// is not an error: the winner's URL arrives via sync.
    pub async fn create_video_room(
        &self,
        provider: &dyn VideoRoomProvider,
    ) -> Result<ProvisionOutcome> {
        let outcome =
            video::provision(self.store.as_ref(), &self.config.session_code, provider).await?;

        if let ProvisionOutcome::Provisioned { url } = &outcome {
            let patch = SessionPatch {
                video_room: Some(VideoRoomState::Provisioned { url: url.clone() }),
                ..SessionPatch::default()
            };
            self.state.apply(StateUpdate::Session(patch.clone()));
            self.broadcast(BroadcastEvent::GameStateUpdate(patch));
            self.audit("video_room_provisioned", json!({ "url": url }));
        }

        Ok(outcome)
    }

    /// Delete the session's video room at the provider and reopen the
    /// claim. Idempotent: a session without a provisioned room is a no-op.
    pub async fn delete_video_room(&self, provider: &dyn VideoRoomProvider) -> Result<()> {
        let session = self.store.get_session(&self.config.session_code).await?;
        if session.video_room.url().is_none() {
            return Ok(());
        }

        provider
            .delete_room(&video::room_name(&self.config.session_code))
            .await?;

        self.commit_session_patch(SessionPatch {
            video_room: Some(VideoRoomState::Unclaimed),
            ..SessionPatch::default()
        })
        .await?;
        self.audit("video_room_deleted", json!({}));
        Ok(())
    }

    // ── Shutdown ────────────────────────────────────────────────────

    /// Disconnect gracefully. Idempotent.
    ///
    /// Stops every heartbeat and awaits their disconnect writes, withdraws
    /// locally-owned presence entries, durably clears `host_connected` if
    /// this engine announced the host, unsubscribes, and stops the channel
    /// loop. The handle stays usable in local-only mode afterwards.
    pub async fn disconnect(&mut self) {
        debug!(session = %self.config.session_code, "disconnect requested");

        self.heartbeats.stop_all().await;

        let was_host = self.presence.is_host();
        for key in self.presence.drain_keys() {
            self.send_frame(ClientFrame::Untrack { key });
        }
        if was_host {
            let patch = SessionPatch {
                host_connected: Some(false),
                ..SessionPatch::default()
            };
            self.state.apply(StateUpdate::Session(patch.clone()));
            if let Err(e) = self
                .store
                .update_session(&self.config.session_code, patch)
                .await
            {
                warn!(error = %e, "failed to clear host flag during disconnect");
            }
        }

        self.send_frame(ClientFrame::Unsubscribe);

        // Signal the channel loop to shut down gracefully.
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        // Await the channel loop with a timeout. If it doesn't exit in
        // time, abort it so the task cannot detach and run indefinitely.
        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.config.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("channel loop terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("channel loop did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("channel loop aborted: {join_err}");
                    }
                }
            }
        }

        self.frame_tx = None;
        self.state
            .apply(StateUpdate::Connection(ConnectionStatus::LocalOnly));
    }

    // ── Internal helpers ────────────────────────────────────────────

    /// Queue a frame to the channel loop. Best-effort: in local-only mode
    /// or after the loop has exited the frame is dropped with a debug log.
    fn send_frame(&self, frame: ClientFrame) {
        let Some(tx) = &self.frame_tx else {
            debug!("no realtime channel, frame dropped");
            return;
        };
        if tx.send(frame).is_err() {
            debug!("channel loop gone, frame dropped");
        }
    }

    fn broadcast(&self, event: BroadcastEvent) {
        self.send_frame(ClientFrame::Broadcast { event });
    }

    fn current_session(&self) -> Result<Session> {
        self.state
            .snapshot()
            .session
            .ok_or(SyncError::NoActiveSession)
    }

    fn current_player(&self, id: &PlayerId) -> Result<Player> {
        self.state
            .snapshot()
            .players
            .get(id)
            .cloned()
            .ok_or_else(|| SyncError::UnknownPlayer(id.to_string()))
    }

    /// Optimistic local apply, durable write, then broadcast. The local
    /// patch is not rolled back if the durable write fails; the change
    /// feed restores convergence on the next row image.
    async fn commit_session_patch(&self, patch: SessionPatch) -> Result<()> {
        self.state.apply(StateUpdate::Session(patch.clone()));
        self.store
            .update_session(&self.config.session_code, patch.clone())
            .await?;
        self.broadcast(BroadcastEvent::GameStateUpdate(patch));
        Ok(())
    }

    async fn commit_player_patch(&self, id: &PlayerId, patch: PlayerPatch) -> Result<()> {
        self.state.apply(StateUpdate::Player {
            id: id.clone(),
            patch: patch.clone(),
        });
        self.store.update_player(id, patch.clone()).await?;
        self.broadcast(BroadcastEvent::PlayerUpdate {
            id: id.clone(),
            patch,
        });
        Ok(())
    }

    /// Append to the session event log on a detached task. Audit is
    /// fire-and-forget by contract.
    fn audit(&self, kind: &'static str, payload: serde_json::Value) {
        let store = Arc::clone(&self.store);
        let code = self.config.session_code.clone();
        tokio::spawn(async move {
            if let Err(e) = store.record_event(&code, kind, payload).await {
                debug!(kind, error = %e, "audit event dropped");
            }
        });
    }
}

impl fmt::Debug for SessionSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSync")
            .field("session", &self.config.session_code)
            .field("connection", &self.connection())
            .field("has_task", &self.task.is_some())
            .finish()
    }
}

impl Drop for SessionSync {
    fn drop(&mut self) {
        // `Drop` is synchronous so we cannot await a graceful disconnect.
        // The only safe action is to abort the spawned task, which causes
        // the channel loop future to be dropped immediately. The
        // `shutdown_tx` oneshot is intentionally *not* sent here: sending
        // it would trigger a graceful path that calls async `channel.close()`,
        // but there is no executor context to drive it inside `Drop`.
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ── Snapshot load ───────────────────────────────────────────────────

/// Load the durable snapshot into local state. A missing session is normal
/// (the host has not created it yet); other failures are logged and the
/// engine starts empty.
async fn load_snapshot(store: &SharedStore, code: &SessionCode, state: &StateStore) {
    match store.get_session(code).await {
        Ok(session) => match store.session_players(code).await {
            Ok(players) => state.initialize(session, players),
            Err(e) => warn!(error = %e, "failed to load player roster"),
        },
        Err(e) if e.is_not_found() => {
            debug!(session = %code, "no session row yet");
        }
        Err(e) => warn!(error = %e, "failed to load session snapshot"),
    }
}

// ── Channel loop ────────────────────────────────────────────────────

/// Everything the channel loop needs to apply incoming frames.
struct LoopCtx {
    session_code: SessionCode,
    state: StateStore,
    store: SharedStore,
    heartbeats: Arc<HeartbeatRegistry>,
    presence: Arc<LocalPresence>,
}

/// Background loop that multiplexes send/receive via `tokio::select!`.
///
/// Exits when:
/// - The frame channel closes (handle dropped or disconnected)
/// - The channel returns `None` (service closed the connection)
/// - A channel error occurs
async fn channel_loop(
    mut channel: impl RealtimeChannel,
    mut frame_rx: mpsc::UnboundedReceiver<ClientFrame>,
    mut shutdown_rx: oneshot::Receiver<()>,
    ctx: LoopCtx,
) {
    debug!("channel loop started");

    loop {
        tokio::select! {
            // Branch 1: outgoing frame from the handle
            frame = frame_rx.recv() => {
                match frame {
                    Some(frame) => {
                        debug!("sending frame: {:?}", std::mem::discriminant(&frame));
                        match serde_json::to_string(&frame) {
                            Ok(json) => {
                                if let Err(e) = channel.send(json).await {
                                    error!("channel send error: {e}");
                                    ctx.state.apply(StateUpdate::Connection(ConnectionStatus::Lost));
                                    break;
                                }
                            }
                            Err(e) => {
                                error!("failed to serialize frame: {e}");
                                // Serialization errors are programming bugs; don't kill the loop.
                            }
                        }
                    }
                    // Frame channel closed — handle dropped.
                    None => {
                        debug!("frame channel closed, shutting down channel loop");
                        let _ = channel.close().await;
                        ctx.state.apply(StateUpdate::Connection(ConnectionStatus::LocalOnly));
                        break;
                    }
                }
            }

            // Branch 2: shutdown signal
            _ = &mut shutdown_rx => {
                debug!("shutdown signal received");
                // Frames queued before the signal (final Untrack, the
                // Unsubscribe) must still reach the service: the select
                // is unbiased, so the shutdown branch can win while the
                // outbound queue is non-empty.
                while let Ok(frame) = frame_rx.try_recv() {
                    match serde_json::to_string(&frame) {
                        Ok(json) => {
                            if let Err(e) = channel.send(json).await {
                                warn!("channel send error during shutdown: {e}");
                                break;
                            }
                        }
                        Err(e) => error!("failed to serialize frame: {e}"),
                    }
                }
                let _ = channel.close().await;
                ctx.state.apply(StateUpdate::Connection(ConnectionStatus::LocalOnly));
                break;
            }

            // Branch 3: incoming frame from the service
            incoming = channel.recv() => {
                match incoming {
                    Some(Ok(text)) => {
                        match serde_json::from_str::<ServerFrame>(&text) {
                            Ok(frame) => handle_frame(&ctx, frame).await,
                            Err(e) => {
                                warn!("failed to deserialize server frame: {e}; raw: {text}");
                            }
                        }
                    }
                    Some(Err(e)) => {
                        error!("channel receive error: {e}");
                        ctx.state.apply(StateUpdate::Connection(ConnectionStatus::Lost));
                        break;
                    }
                    // Channel closed by the service.
                    None => {
                        debug!("channel closed by service");
                        ctx.state.apply(StateUpdate::Connection(ConnectionStatus::Lost));
                        break;
                    }
                }
            }
        }
    }

    debug!("channel loop exited");
}

/// Apply one incoming server frame to local state.
async fn handle_frame(ctx: &LoopCtx, frame: ServerFrame) {
    match frame {
        ServerFrame::Subscribed { session_code } => {
            if session_code != ctx.session_code {
                warn!(got = %session_code, want = %ctx.session_code,
                    "subscription ack for wrong session, ignoring");
                return;
            }
            debug!(session = %session_code, "subscription acknowledged");
            ctx.state
                .apply(StateUpdate::Connection(ConnectionStatus::Subscribed));
        }
        ServerFrame::Broadcast { event } => apply_broadcast(ctx, event),
        ServerFrame::Change(record) => apply_change(ctx, record),
        ServerFrame::PresenceSync { participants } => {
            reconcile_presence(ctx, participants).await;
        }
        ServerFrame::PresenceJoin { participant } => {
            // Membership is recomputed from the full roster, never patched
            // incrementally, so joins and leaves can arrive in any order.
            let mut roster = ctx.state.snapshot().participants;
            roster.retain(|p| p.key != participant.key);
            roster.push(participant);
            reconcile_presence(ctx, roster).await;
        }
        ServerFrame::PresenceLeave { participant } => {
            let mut roster = ctx.state.snapshot().participants;
            roster.retain(|p| p.key != participant.key);
            reconcile_presence(ctx, roster).await;
        }
        ServerFrame::Error { message } => {
            warn!(message = %message, "service error frame");
        }
    }
}

fn apply_broadcast(ctx: &LoopCtx, event: BroadcastEvent) {
    match event {
        BroadcastEvent::GameStateUpdate(patch) => {
            ctx.state.apply(StateUpdate::Session(patch));
        }
        BroadcastEvent::PlayerUpdate { id, patch } => {
            ctx.state.apply(StateUpdate::Player { id, patch });
        }
        BroadcastEvent::PlayerJoin { player } => {
            ctx.state.apply(StateUpdate::UpsertPlayer(player));
        }
        BroadcastEvent::PlayerLeave { id } => {
            ctx.state.apply(StateUpdate::RemovePlayer(id));
        }
    }
}

fn apply_change(ctx: &LoopCtx, record: ChangeRecord) {
    match (record.kind, record.change) {
        (ChangeKind::Delete, ChangeRow::Players(player)) => {
            ctx.state.apply(StateUpdate::RemovePlayer(player.id));
        }
        (ChangeKind::Delete, ChangeRow::Sessions(session)) => {
            // Sessions are never hard-deleted in normal operation; keep the
            // local copy and let the operator-driven cleanup show as Ended.
            warn!(session = %session.code, "session row deleted upstream");
        }
        (_, ChangeRow::Sessions(session)) => {
            if session.code == ctx.session_code {
                ctx.state.apply(StateUpdate::ReplaceSession(session));
            } else {
                debug!(session = %session.code, "ignoring change for another session");
            }
        }
        (_, ChangeRow::Players(player)) => {
            if player.session_code == ctx.session_code {
                ctx.state.apply(StateUpdate::UpsertPlayer(player));
            } else {
                // The row moved to another session (same id re-used there),
                // so it leaves this roster.
                ctx.state.apply(StateUpdate::RemovePlayer(player.id));
            }
        }
    }
}

/// Recompute connection flags from the full presence roster.
///
/// Membership is the single source of truth: every known player row's
/// `connected` flag follows whether some participant carries its id, and
/// `host_connected` follows whether any host participant is live. Changed
/// flags are repaired in the store on detached tasks (idempotent,
/// last-writer-wins), and heartbeats for locally-owned seats are aligned.
async fn reconcile_presence(ctx: &LoopCtx, roster: Vec<Participant>) {
    let snapshot = ctx.state.snapshot();

    let live_ids: HashSet<&PlayerId> = roster.iter().filter_map(|p| p.player_id.as_ref()).collect();
    let host_present = roster.iter().any(|p| p.kind == ParticipantKind::Host);

    for (id, player) in &snapshot.players {
        let present = live_ids.contains(id);
        if player.connected != present {
            ctx.state.apply(StateUpdate::Player {
                id: id.clone(),
                patch: PlayerPatch {
                    connected: Some(present),
                    ..PlayerPatch::default()
                },
            });
            spawn_flag_repair(ctx, id.clone(), present);
        }

        if ctx.presence.owns_seat(id) {
            if present && !ctx.heartbeats.is_running(id) {
                ctx.heartbeats
                    .start(id.clone(), ctx.session_code.clone(), None);
            } else if !present && ctx.heartbeats.is_running(id) {
                ctx.heartbeats.stop(id);
            }
        }
    }

    if let Some(session) = &snapshot.session {
        if session.host_connected != host_present {
            let patch = SessionPatch {
                host_connected: Some(host_present),
                ..SessionPatch::default()
            };
            ctx.state.apply(StateUpdate::Session(patch.clone()));

            let store = Arc::clone(&ctx.store);
            let code = ctx.session_code.clone();
            tokio::spawn(async move {
                if let Err(e) = store.update_session(&code, patch).await {
                    debug!(error = %e, "host flag repair failed");
                }
            });
        }
    }

    ctx.state.apply(StateUpdate::Participants(roster));
}

/// Durable `connected` repair for one player, detached so reconciliation
/// never blocks on the store.
fn spawn_flag_repair(ctx: &LoopCtx, id: PlayerId, present: bool) {
    let store = Arc::clone(&ctx.store);
    let code = ctx.session_code.clone();
    tokio::spawn(async move {
        if let Err(e) = store
            .update_player_connection(&id, &code, present, None)
            .await
        {
            debug!(player = %id, error = %e, "presence flag repair failed");
        }
    });
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::store::SessionStore;
    use crate::stores::MemoryStore;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};

    // ── Mock channel ────────────────────────────────────────────────

    /// A mock channel that records sent frames and replays scripted
    /// responses.
    struct MockChannel {
        /// Frames that `recv()` will yield in order.
        incoming: VecDeque<Option<std::result::Result<String, SyncError>>>,
        /// Recorded outgoing frames.
        sent: Arc<StdMutex<Vec<String>>>,
        /// Whether `close()` was called.
        closed: Arc<AtomicBool>,
    }

    impl MockChannel {
        fn new(
            incoming: Vec<Option<std::result::Result<String, SyncError>>>,
        ) -> (Self, Arc<StdMutex<Vec<String>>>, Arc<AtomicBool>) {
            let sent = Arc::new(StdMutex::new(Vec::new()));
            let closed = Arc::new(AtomicBool::new(false));
            let channel = Self {
                incoming: VecDeque::from(incoming),
                sent: Arc::clone(&sent),
                closed: Arc::clone(&closed),
            };
            (channel, sent, closed)
        }
    }

    #[async_trait]
    impl RealtimeChannel for MockChannel {
        async fn send(&mut self, frame: String) -> std::result::Result<(), SyncError> {
            self.sent.lock().unwrap().push(frame);
            Ok(())
        }

        async fn recv(&mut self) -> Option<std::result::Result<String, SyncError>> {
            if let Some(item) = self.incoming.pop_front() {
                // An explicit `None` entry signals a clean close;
                // `Some(result)` delivers the scripted frame or error.
                item
            } else {
                // All scripted frames delivered — hang forever so the
                // channel loop stays alive until shutdown.
                std::future::pending().await
            }
        }

        async fn close(&mut self) -> std::result::Result<(), SyncError> {
            self.closed.store(true, Ordering::Relaxed);
            Ok(())
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────

    fn code(raw: &str) -> SessionCode {
        SessionCode::new(raw).unwrap()
    }

    fn pid(raw: &str) -> PlayerId {
        PlayerId::new(raw).unwrap()
    }

    fn subscribed_json(raw: &str) -> String {
        serde_json::to_string(&ServerFrame::Subscribed {
            session_code: code(raw),
        })
        .unwrap()
    }

    async fn seeded_store(raw: &str) -> SharedStore {
        let store = MemoryStore::new();
        store
            .create_session(crate::store::NewSession::new(code(raw), "H1", "Layla"))
            .await
            .unwrap();
        Arc::new(store)
    }

    async fn wait_until<F>(sync: &SessionSync, mut pred: F)
    where
        F: FnMut(&GameState) -> bool,
    {
        for _ in 0..200 {
            if pred(&sync.snapshot()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("state never satisfied the predicate");
    }

    // ── Tests ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn connect_sends_subscribe_first() {
        let store = seeded_store("AB12").await;
        let (channel, sent, _closed) = MockChannel::new(vec![Some(Ok(subscribed_json("AB12")))]);

        let (mut sync, _state) =
            SessionSync::connect(channel, store, SyncConfig::new(code("AB12"))).await;

        wait_until(&sync, |s| s.connection == ConnectionStatus::Subscribed).await;

        {
            let frames = sent.lock().unwrap();
            assert!(!frames.is_empty());
            let first: ClientFrame = serde_json::from_str(&frames[0]).unwrap();
            assert_eq!(
                first,
                ClientFrame::Subscribe {
                    session_code: code("AB12")
                }
            );
        }

        sync.disconnect().await;
    }

    #[tokio::test]
    async fn connect_loads_the_durable_snapshot() {
        let store = seeded_store("AB12").await;
        store
            .add_player(NewPlayer::new(
                pid("p1"),
                code("AB12"),
                "Nadia",
                PlayerRole::PlayerA,
            ))
            .await
            .unwrap();

        let (channel, _sent, _closed) = MockChannel::new(vec![]);
        let (mut sync, _state) =
            SessionSync::connect(channel, store, SyncConfig::new(code("AB12"))).await;

        let snap = sync.snapshot();
        assert_eq!(snap.session.unwrap().host_name, "Layla");
        assert!(snap.players.contains_key(&pid("p1")));

        sync.disconnect().await;
    }

    #[tokio::test]
    async fn subscribed_ack_for_wrong_session_is_ignored() {
        let store = seeded_store("AB12").await;
        let (channel, _sent, _closed) = MockChannel::new(vec![Some(Ok(subscribed_json("ZZ99")))]);

        let (mut sync, _state) =
            SessionSync::connect(channel, store, SyncConfig::new(code("AB12"))).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sync.connection(), ConnectionStatus::Connecting);

        sync.disconnect().await;
    }

    #[tokio::test]
    async fn local_only_actions_work_without_a_channel() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let (sync, _state) = SessionSync::local_only(store, SyncConfig::new(code("AB12")));

        sync.start_session(StartSession::new("H1", "Layla"))
            .await
            .unwrap();
        sync.join_game(JoinGame::new(pid("p1"), "Nadia", PlayerRole::PlayerA))
            .await
            .unwrap();
        let score = sync.score_player(&pid("p1"), 5).await.unwrap();
        assert_eq!(score, 5);

        let snap = sync.snapshot();
        assert_eq!(snap.connection, ConnectionStatus::LocalOnly);
        assert_eq!(snap.players.get(&pid("p1")).unwrap().score, 5);
    }

    #[tokio::test]
    async fn phase_regression_is_rejected() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let (sync, _state) = SessionSync::local_only(store, SyncConfig::new(code("AB12")));
        sync.start_session(StartSession::new("H1", "Layla"))
            .await
            .unwrap();

        sync.advance_phase(GamePhase::Playing).await.unwrap();
        let err = sync.advance_phase(GamePhase::Lobby).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::PhaseRegression {
                from: GamePhase::Playing,
                to: GamePhase::Lobby
            }
        ));
    }

    #[tokio::test]
    async fn segments_lock_once_playing() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let (sync, _state) = SessionSync::local_only(store, SyncConfig::new(code("AB12")));
        sync.start_session(StartSession::new("H1", "Layla"))
            .await
            .unwrap();

        let mut settings = SegmentSettings::new();
        settings.insert(SegmentCode::new("WSHA").unwrap(), 10);
        sync.configure_segments(settings.clone()).await.unwrap();

        sync.advance_phase(GamePhase::Playing).await.unwrap();
        let err = sync.configure_segments(settings).await.unwrap_err();
        assert!(matches!(err, SyncError::SegmentsLocked { .. }));
    }

    #[tokio::test]
    async fn timer_stays_out_of_the_store() {
        let store = seeded_store("AB12").await;
        let (sync, _state) =
            SessionSync::local_only(Arc::clone(&store), SyncConfig::new(code("AB12")));
        sync.load().await.unwrap();

        sync.set_timer(30, true);

        assert_eq!(sync.snapshot().session.unwrap().timer_seconds, 30);
        let durable = store.get_session(&code("AB12")).await.unwrap();
        assert_eq!(durable.timer_seconds, 0);
        assert!(!durable.timer_running);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_stops_heartbeats() {
        let store = seeded_store("AB12").await;
        let (channel, _sent, closed) = MockChannel::new(vec![Some(Ok(subscribed_json("AB12")))]);

        let (mut sync, _state) =
            SessionSync::connect(channel, Arc::clone(&store), SyncConfig::new(code("AB12"))).await;
        sync.join_game(JoinGame::new(pid("p1"), "Nadia", PlayerRole::PlayerA))
            .await
            .unwrap();
        assert_eq!(sync.active_heartbeats(), vec![pid("p1")]);

        sync.disconnect().await;
        sync.disconnect().await;

        assert!(sync.active_heartbeats().is_empty());
        assert!(closed.load(Ordering::Relaxed));
        assert_eq!(sync.connection(), ConnectionStatus::LocalOnly);

        let row = store.get_player(&pid("p1")).await.unwrap();
        assert!(!row.connected);
    }

    #[tokio::test]
    async fn incoming_broadcast_updates_state() {
        let store = seeded_store("AB12").await;
        let frame = serde_json::to_string(&ServerFrame::Broadcast {
            event: BroadcastEvent::GameStateUpdate(SessionPatch {
                phase: Some(GamePhase::Lobby),
                ..SessionPatch::default()
            }),
        })
        .unwrap();
        let (channel, _sent, _closed) =
            MockChannel::new(vec![Some(Ok(subscribed_json("AB12"))), Some(Ok(frame))]);

        let (mut sync, _state) =
            SessionSync::connect(channel, store, SyncConfig::new(code("AB12"))).await;

        wait_until(&sync, |s| {
            s.session.as_ref().map(|ses| ses.phase) == Some(GamePhase::Lobby)
        })
        .await;

        sync.disconnect().await;
    }

    #[tokio::test]
    async fn undecodable_frame_does_not_kill_the_loop() {
        let store = seeded_store("AB12").await;
        let (channel, _sent, _closed) = MockChannel::new(vec![
            Some(Ok("{not json".to_string())),
            Some(Ok(subscribed_json("AB12"))),
        ]);

        let (mut sync, _state) =
            SessionSync::connect(channel, store, SyncConfig::new(code("AB12"))).await;

        wait_until(&sync, |s| s.connection == ConnectionStatus::Subscribed).await;
        sync.disconnect().await;
    }

    #[tokio::test]
    async fn channel_error_marks_the_connection_lost() {
        let store = seeded_store("AB12").await;
        let (channel, _sent, _closed) = MockChannel::new(vec![
            Some(Ok(subscribed_json("AB12"))),
            Some(Err(SyncError::ChannelReceive("reset by peer".into()))),
        ]);

        let (sync, _state) =
            SessionSync::connect(channel, store, SyncConfig::new(code("AB12"))).await;

        wait_until(&sync, |s| s.connection == ConnectionStatus::Lost).await;

        // Local writes still work after the channel dies.
        sync.advance_phase(GamePhase::Lobby).await.unwrap();
        assert_eq!(
            sync.snapshot().session.unwrap().phase,
            GamePhase::Lobby
        );
    }
}
