//! Periodic liveness writes for locally-registered players.
//!
//! Each player registered on this client gets its own heartbeat task that
//! stamps the player's row (`connected = true`, fresh `last_active`) on a
//! fixed interval. Ticks are fire-and-forget: a slow store write never
//! delays the next tick, there are no retries and no backoff. A dead store
//! makes every tick fail independently and the row's `last_active` goes
//! stale, which is exactly the signal remote peers read.
//!
//! The registry never *reads* liveness; presence reconciliation in the sync
//! engine owns the `connected` flag for remote players. Heartbeats exist so
//! that peers without a presence subscription (and dashboards reading the
//! store directly) can still tell who is alive.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::model::{PlayerId, SessionCode};
use crate::store::{NewPlayer, SharedStore, StoreError};

/// Default interval between liveness writes.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Callback invoked from heartbeat tasks when a liveness write fails.
pub type HeartbeatErrorHook = Arc<dyn Fn(&PlayerId, &StoreError) + Send + Sync>;

struct RunningBeat {
    session_code: SessionCode,
    task: JoinHandle<()>,
}

/// Owns one liveness task per locally-registered player.
///
/// `start` and `stop` are synchronous bookkeeping; the writes happen on
/// spawned tasks. [`stop_all`](HeartbeatRegistry::stop_all) is the one async
/// teardown path: it awaits a final `connected = false` write per player so
/// a graceful disconnect leaves no row claiming to be live.
pub struct HeartbeatRegistry {
    store: SharedStore,
    interval: Duration,
    error_hook: Option<HeartbeatErrorHook>,
    beats: Mutex<HashMap<PlayerId, RunningBeat>>,
}

impl HeartbeatRegistry {
    /// Creates a registry writing through `store` every `interval`.
    ///
    /// Intervals below 10ms are clamped to 10ms.
    pub fn new(store: SharedStore, interval: Duration) -> Self {
        Self {
            store,
            interval: interval.max(Duration::from_millis(10)),
            error_hook: None,
            beats: Mutex::new(HashMap::new()),
        }
    }

    /// Installs a callback invoked whenever a liveness write fails.
    #[must_use]
    pub fn with_error_hook(mut self, hook: HeartbeatErrorHook) -> Self {
        self.error_hook = Some(hook);
        self
    }

    /// Starts (or restarts) the heartbeat for one player.
    ///
    /// The first liveness write fires immediately, then once per interval.
    /// If a heartbeat for this player is already running it is replaced, so
    /// a player never has two competing tasks. `attrs` are passed through to
    /// the store's connection upsert, covering the window where a heartbeat
    /// tick races ahead of the join write.
    pub fn start(&self, player: PlayerId, session: SessionCode, attrs: Option<NewPlayer>) {
        let task = tokio::spawn(beat_loop(
            Arc::clone(&self.store),
            player.clone(),
            session.clone(),
            attrs,
            self.interval,
            self.error_hook.clone(),
        ));

        let mut beats = self.lock_beats();
        if let Some(prev) = beats.insert(
            player.clone(),
            RunningBeat {
                session_code: session,
                task,
            },
        ) {
            debug!(player = %player, "replacing running heartbeat");
            prev.task.abort();
        }
    }

    /// Stops the heartbeat for one player without touching the row.
    ///
    /// Used when presence shows the player gone but someone else may still
    /// own the row. Pair with [`mark_disconnected`](Self::mark_disconnected)
    /// for a voluntary leave.
    pub fn stop(&self, player: &PlayerId) {
        if let Some(beat) = self.lock_beats().remove(player) {
            beat.task.abort();
            debug!(player = %player, "heartbeat stopped");
        }
    }

    /// One-shot durable write setting `connected = false` for a player.
    pub async fn mark_disconnected(
        &self,
        player: &PlayerId,
        session: &SessionCode,
    ) -> Result<(), StoreError> {
        self.store
            .update_player_connection(player, session, false, None)
            .await
            .map(|_| ())
    }

    /// Stops every heartbeat and awaits a disconnect write per player.
    ///
    /// Write failures are logged and skipped; teardown always completes.
    pub async fn stop_all(&self) {
        let drained: Vec<(PlayerId, SessionCode)> = {
            let mut beats = self.lock_beats();
            beats
                .drain()
                .map(|(player, beat)| {
                    beat.task.abort();
                    (player, beat.session_code)
                })
                .collect()
        };

        for (player, session) in drained {
            if let Err(e) = self.mark_disconnected(&player, &session).await {
                warn!(player = %player, error = %e, "disconnect write failed during teardown");
            }
        }
    }

    /// Whether a heartbeat is running for `player`.
    pub fn is_running(&self, player: &PlayerId) -> bool {
        self.lock_beats().contains_key(player)
    }

    /// Ids of all players with a running heartbeat, sorted.
    pub fn active_players(&self) -> Vec<PlayerId> {
        let mut players: Vec<PlayerId> = self.lock_beats().keys().cloned().collect();
        players.sort();
        players
    }

    fn lock_beats(&self) -> std::sync::MutexGuard<'_, HashMap<PlayerId, RunningBeat>> {
        self.beats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for HeartbeatRegistry {
    fn drop(&mut self) {
        // `Drop` is synchronous, so no disconnect writes here; just make
        // sure no detached task keeps stamping rows forever.
        let mut beats = self.lock_beats();
        for (_, beat) in beats.drain() {
            beat.task.abort();
        }
    }
}

async fn beat_loop(
    store: SharedStore,
    player: PlayerId,
    session: SessionCode,
    attrs: Option<NewPlayer>,
    period: Duration,
    hook: Option<HeartbeatErrorHook>,
) {
    let mut ticker = tokio::time::interval(period);
    // After a stall, resume the cadence instead of bursting catch-up writes.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        tokio::spawn(beat(
            Arc::clone(&store),
            player.clone(),
            session.clone(),
            attrs.clone(),
            hook.clone(),
        ));
    }
}

async fn beat(
    store: SharedStore,
    player: PlayerId,
    session: SessionCode,
    attrs: Option<NewPlayer>,
    hook: Option<HeartbeatErrorHook>,
) {
    match store
        .update_player_connection(&player, &session, true, attrs)
        .await
    {
        Ok(_) => {}
        Err(e) => {
            warn!(player = %player, error = %e, "heartbeat write failed");
            if let Some(hook) = &hook {
                hook(&player, &e);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::model::PlayerRole;
    use crate::stores::MemoryStore;
    use crate::store::{NewSession, SessionStore};

    fn code(raw: &str) -> SessionCode {
        SessionCode::new(raw).unwrap()
    }

    fn pid(raw: &str) -> PlayerId {
        PlayerId::new(raw).unwrap()
    }

    async fn store_with_session() -> SharedStore {
        let store = MemoryStore::new();
        store
            .create_session(NewSession::new(code("AB12"), "H1", "Layla"))
            .await
            .unwrap();
        Arc::new(store)
    }

    #[tokio::test(start_paused = true)]
    async fn first_beat_upserts_the_row_immediately() {
        let store = store_with_session().await;
        let registry = HeartbeatRegistry::new(Arc::clone(&store), Duration::from_secs(60));

        let attrs = NewPlayer::new(pid("p1"), code("AB12"), "Nadia", PlayerRole::PlayerA);
        registry.start(pid("p1"), code("AB12"), Some(attrs));

        // Paused clock auto-advances once every task is idle, so this sleep
        // is enough to let the first tick and its spawned write complete.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let player = store.get_player(&pid("p1")).await.unwrap();
        assert!(player.connected);
        assert!(registry.is_running(&pid("p1")));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_replaces_the_previous_task() {
        let store = store_with_session().await;
        let registry = HeartbeatRegistry::new(Arc::clone(&store), Duration::from_secs(60));

        let attrs = NewPlayer::new(pid("p1"), code("AB12"), "Nadia", PlayerRole::PlayerA);
        registry.start(pid("p1"), code("AB12"), Some(attrs.clone()));
        registry.start(pid("p1"), code("AB12"), Some(attrs));

        assert_eq!(registry.active_players(), vec![pid("p1")]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_without_flipping_the_row() {
        let store = store_with_session().await;
        let registry = HeartbeatRegistry::new(Arc::clone(&store), Duration::from_secs(60));

        let attrs = NewPlayer::new(pid("p1"), code("AB12"), "Nadia", PlayerRole::PlayerA);
        registry.start(pid("p1"), code("AB12"), Some(attrs));
        tokio::time::sleep(Duration::from_millis(50)).await;

        registry.stop(&pid("p1"));
        assert!(!registry.is_running(&pid("p1")));

        // The row still says connected; stop never writes.
        let player = store.get_player(&pid("p1")).await.unwrap();
        assert!(player.connected);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_marks_every_row_disconnected() {
        let store = store_with_session().await;
        let registry = HeartbeatRegistry::new(Arc::clone(&store), Duration::from_secs(60));

        for id in ["p1", "p2"] {
            let attrs = NewPlayer::new(pid(id), code("AB12"), id, PlayerRole::PlayerA);
            registry.start(pid(id), code("AB12"), Some(attrs));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        registry.stop_all().await;

        assert!(registry.active_players().is_empty());
        for id in ["p1", "p2"] {
            let player = store.get_player(&pid(id)).await.unwrap();
            assert!(!player.connected, "{id} should be marked disconnected");
        }
    }
}
