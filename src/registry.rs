//! Session registry: the process-wide map from game id to live session.
//!
//! At most one live [`SessionHandle`] exists per game. Loads and evictions of
//! the same id are serialized by a per-id lifecycle lock; the live map is
//! only written once a load has fully succeeded, so a cancelled or timed-out
//! store call never leaves a partial entry behind.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::codec::HistoryCodec;
use crate::config::{EngineConfig, RegistryConfig};
use crate::error::{RegistryError, SessionError, StoreError};
use crate::pgn;
use crate::position::{Move, Position};
use crate::session::{
    now_millis, GameId, GameSession, GameStatus, MoveOutcome, PlayerId, SessionHandle, SessionSlot,
    TerminationReason,
};
use crate::storage::{SessionStore, StoredBlob};

type LifecycleLocks = DashMap<GameId, Arc<Mutex<()>>>;

/// Outcome of [`SessionRegistry::drain`].
#[derive(Debug, Default)]
pub struct DrainReport {
    pub evicted: usize,
    pub failed: Vec<(GameId, RegistryError)>,
}

pub struct SessionRegistry {
    live: DashMap<GameId, SessionHandle>,
    lifecycle_locks: LifecycleLocks,
    store: Arc<dyn SessionStore>,
    codec: HistoryCodec,
    config: RegistryConfig,
    shutting_down: AtomicBool,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn SessionStore>, codec: HistoryCodec, config: RegistryConfig) -> Self {
        SessionRegistry {
            live: DashMap::new(),
            lifecycle_locks: DashMap::new(),
            store,
            codec,
            config,
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn from_config(store: Arc<dyn SessionStore>, config: &EngineConfig) -> Self {
        Self::new(
            store,
            HistoryCodec::new(config.codec.compression_level),
            config.registry.clone(),
        )
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn is_live(&self, game_id: GameId) -> bool {
        self.live.contains_key(&game_id)
    }

    /// The live handle for `game_id`, without touching the store.
    pub fn get(&self, game_id: GameId) -> Option<SessionHandle> {
        self.live.get(&game_id).map(|entry| entry.value().clone())
    }

    /// Start a new game from the standard position and reserve its id in
    /// the store.
    pub async fn start_game(&self, white: PlayerId, black: PlayerId) -> Result<SessionHandle, RegistryError> {
        self.register(GameSession::new(GameId::new(), white, black)).await
    }

    pub async fn start_game_from_fen(
        &self,
        white: PlayerId,
        black: PlayerId,
        fen: &str,
    ) -> Result<SessionHandle, RegistryError> {
        let initial = Position::from_fen(fen)?;
        let session = GameSession::with_position(GameId::new(), white, black, initial, chrono::Utc::now());
        self.register(session).await
    }

    /// Import a PGN game as a new session.
    pub async fn import_pgn(&self, text: &str) -> Result<SessionHandle, RegistryError> {
        let session = pgn::import(text)?;
        self.register(session).await
    }

    async fn register(&self, session: GameSession) -> Result<SessionHandle, RegistryError> {
        self.ensure_running()?;
        let game_id = session.id();
        let revision = session.revision();
        let bytes = self.codec.encode(&session)?;
        self.with_deadline(game_id, self.store.save(game_id, StoredBlob::new(revision, bytes), None))
            .await?;

        tracing::info!(
            %game_id,
            white = %session.white(),
            black = %session.black(),
            status = %session.status(),
            "game started"
        );
        let handle = SessionHandle::new(session, Some(revision));
        self.live.insert(game_id, handle.clone());
        Ok(handle)
    }

    /// Return the live session, loading it from the store if needed.
    ///
    /// Concurrent callers for the same id share one load and receive the
    /// same instance.
    pub async fn get_or_load(&self, game_id: GameId) -> Result<SessionHandle, RegistryError> {
        self.ensure_running()?;

        // Fast path: already live
        if let Some(handle) = self.get(game_id) {
            return Ok(handle);
        }

        let lock = self.lifecycle_lock(game_id);
        let _guard = lock.lock().await;
        self.get_or_load_locked(game_id, &lock).await
    }

    /// Load path; the caller holds `lock`, the lifecycle lock for `game_id`.
    async fn get_or_load_locked(
        &self,
        game_id: GameId,
        lock: &Arc<Mutex<()>>,
    ) -> Result<SessionHandle, RegistryError> {
        // Re-check: another task may have loaded it while we waited
        if let Some(handle) = self.get(game_id) {
            return Ok(handle);
        }

        let session = match self.load(game_id).await {
            Ok(session) => session,
            Err(err) => {
                self.release_lifecycle_lock(game_id, lock);
                return Err(err);
            }
        };

        let revision = session.revision();
        let handle = self
            .live
            .entry(game_id)
            .or_insert_with(|| SessionHandle::new(session, Some(revision)))
            .value()
            .clone();
        tracing::debug!(%game_id, revision, "session loaded");
        Ok(handle)
    }

    async fn load(&self, game_id: GameId) -> Result<GameSession, RegistryError> {
        let blob = self.with_deadline(game_id, self.store.load(game_id)).await?;
        let session = self.codec.decode(&blob.bytes).inspect_err(|err| {
            if err.is_integrity_failure() {
                tracing::error!(%game_id, error = %err, "stored session failed integrity check");
            }
        })?;

        if session.id() != game_id || session.revision() != blob.revision {
            let err = crate::error::CodecError::ReplayMismatch {
                reason: format!(
                    "record for {game_id} at revision {} holds game {} at revision {}",
                    blob.revision,
                    session.id(),
                    session.revision()
                ),
            };
            tracing::error!(%game_id, error = %err, "stored session failed integrity check");
            return Err(err.into());
        }
        Ok(session)
    }

    /// Submit a move to the game, loading it if necessary.
    pub async fn submit_move(
        &self,
        game_id: GameId,
        mv: &Move,
        player: &PlayerId,
    ) -> Result<MoveOutcome, RegistryError> {
        self.mutate(game_id, |session| {
            let outcome = session.submit_move(mv, player)?;
            Ok((outcome.status, outcome))
        })
        .await
    }

    /// End the game from outside the move flow.
    pub async fn terminate(&self, game_id: GameId, reason: TerminationReason) -> Result<GameStatus, RegistryError> {
        self.mutate(game_id, |session| {
            let status = session.terminate(reason)?;
            Ok((status, status))
        })
        .await
    }

    /// Run `f` inside the session's critical section.
    async fn mutate<R>(
        &self,
        game_id: GameId,
        f: impl FnOnce(&mut GameSession) -> Result<(GameStatus, R), SessionError>,
    ) -> Result<R, RegistryError> {
        let handle = self.get_or_load(game_id).await?;
        match handle.lock_live().await {
            Ok(mut slot) => return self.apply(game_id, &mut slot, f).await,
            Err(SessionError::Evicted { .. }) => {}
            Err(err) => return Err(err.into()),
        }

        // Evicted between lookup and lock: reload under the lifecycle lock,
        // which keeps further evictions out until the mutation is done.
        let lock = self.lifecycle_lock(game_id);
        let _guard = lock.lock().await;
        let handle = self.get_or_load_locked(game_id, &lock).await?;
        let mut slot = handle.lock_live().await?;
        self.apply(game_id, &mut slot, f).await
    }

    async fn apply<R>(
        &self,
        game_id: GameId,
        slot: &mut SessionSlot,
        f: impl FnOnce(&mut GameSession) -> Result<(GameStatus, R), SessionError>,
    ) -> Result<R, RegistryError> {
        let (status, result) = f(&mut slot.session)?;
        if status.is_terminal() {
            tracing::info!(%game_id, %status, revision = slot.session.revision(), "game over");
            if self.config.persist_on_terminal {
                // The result stands even if this write fails; the next
                // checkpoint or eviction writes it again.
                if let Err(err) = self.persist(slot).await {
                    tracing::warn!(%game_id, error = %err, "failed to persist finished game");
                }
            }
        }
        Ok(result)
    }

    /// Persist the live session without evicting it. Returns false if the
    /// session is not live or already persisted at its current revision.
    pub async fn checkpoint(&self, game_id: GameId) -> Result<bool, RegistryError> {
        let Some(handle) = self.get(game_id) else {
            return Ok(false);
        };
        let mut slot = handle.lock_live().await?;
        self.persist(&mut slot).await
    }

    /// Persist and remove the live session. Waits for any in-flight move on
    /// the session; outstanding handles fail with `Evicted` afterwards.
    /// Returns false if the session was not live.
    pub async fn evict(&self, game_id: GameId) -> Result<bool, RegistryError> {
        self.evict_inner(game_id, None).await
    }

    async fn evict_inner(&self, game_id: GameId, idle_cutoff_ms: Option<i64>) -> Result<bool, RegistryError> {
        let lock = self.lifecycle_lock(game_id);
        let _guard = lock.lock().await;

        let Some(handle) = self.get(game_id) else {
            self.release_lifecycle_lock(game_id, &lock);
            return Ok(false);
        };
        let mut slot = handle.lock().await;
        if slot.evicted {
            return Ok(false);
        }
        if idle_cutoff_ms.is_some_and(|cutoff| handle.last_active_ms() > cutoff) {
            return Ok(false);
        }

        self.persist(&mut slot).await?;
        slot.evicted = true;
        let revision = slot.session.revision();
        drop(slot);

        self.live.remove(&game_id);
        self.release_lifecycle_lock(game_id, &lock);
        tracing::info!(%game_id, revision, "session evicted");
        Ok(true)
    }

    /// Evict every session idle for at least the configured idle timeout.
    /// Failures are logged and the session stays live.
    pub async fn evict_idle(&self) -> usize {
        let cutoff = now_millis() - self.config.idle_timeout().as_millis() as i64;
        let candidates: Vec<GameId> = self
            .live
            .iter()
            .filter(|entry| entry.value().last_active_ms() <= cutoff)
            .map(|entry| *entry.key())
            .collect();

        let mut evicted = 0;
        for game_id in candidates {
            match self.evict_inner(game_id, Some(cutoff)).await {
                Ok(true) => evicted += 1,
                Ok(false) => {}
                Err(err) => tracing::warn!(%game_id, error = %err, "idle eviction failed"),
            }
        }
        if evicted > 0 {
            tracing::info!(evicted, live = self.live.len(), "idle sessions evicted");
        }
        evicted
    }

    /// Refuse new work and evict every live session.
    pub async fn drain(&self) -> DrainReport {
        self.shutting_down.store(true, Ordering::Release);
        let ids: Vec<GameId> = self.live.iter().map(|entry| *entry.key()).collect();

        let mut report = DrainReport::default();
        for game_id in ids {
            match self.evict(game_id).await {
                Ok(true) => report.evicted += 1,
                Ok(false) => {}
                Err(err) => {
                    tracing::error!(%game_id, error = %err, "failed to persist session during drain");
                    report.failed.push((game_id, err));
                }
            }
        }
        tracing::info!(evicted = report.evicted, failed = report.failed.len(), "registry drained");
        report
    }

    /// Write the session if its revision moved past the persisted one.
    async fn persist(&self, slot: &mut SessionSlot) -> Result<bool, RegistryError> {
        let revision = slot.session.revision();
        if slot.persisted_revision == Some(revision) {
            return Ok(false);
        }
        let game_id = slot.session.id();
        let bytes = self.codec.encode(&slot.session)?;
        let save = self
            .store
            .save(game_id, StoredBlob::new(revision, bytes.clone()), slot.persisted_revision);
        if let Err(err) = self.with_deadline(game_id, save).await {
            if !self.already_stored(game_id, revision, &bytes, &err).await {
                return Err(err);
            }
            tracing::warn!(%game_id, revision, "earlier save had landed after its deadline");
        }

        tracing::debug!(%game_id, revision, previous = ?slot.persisted_revision, "session persisted");
        slot.persisted_revision = Some(revision);
        Ok(true)
    }

    /// True if `err` is a conflict caused by an earlier write of these
    /// exact bytes, e.g. a save that committed after its deadline fired.
    async fn already_stored(&self, game_id: GameId, revision: u64, bytes: &[u8], err: &RegistryError) -> bool {
        let landed_at = match err {
            RegistryError::Store(StoreError::Conflict { actual, .. }) => *actual,
            _ => None,
        };
        if landed_at != Some(revision) {
            return false;
        }
        match self.with_deadline(game_id, self.store.load(game_id)).await {
            Ok(stored) => stored.revision == revision && stored.bytes == bytes,
            Err(load_err) => {
                tracing::warn!(%game_id, error = %load_err, "could not inspect conflicting record");
                false
            }
        }
    }

    async fn with_deadline<T>(
        &self,
        game_id: GameId,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, RegistryError> {
        let Some(limit) = self.config.load_timeout() else {
            return Ok(call.await?);
        };
        match tokio::time::timeout(limit, call).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                tracing::warn!(%game_id, timeout_ms = limit.as_millis() as u64, "session store call timed out");
                Err(RegistryError::Timeout { game_id })
            }
        }
    }

    fn lifecycle_lock(&self, game_id: GameId) -> Arc<Mutex<()>> {
        self.lifecycle_locks
            .entry(game_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the lock entry unless another task still holds a clone; a
    /// waiter must keep serializing against whoever calls `lifecycle_lock`
    /// next. Call with the guard held, after the last state change.
    fn release_lifecycle_lock(&self, game_id: GameId, lock: &Arc<Mutex<()>>) {
        self.lifecycle_locks
            .remove_if(&game_id, |_, held| Arc::ptr_eq(held, lock) && Arc::strong_count(held) <= 2);
    }

    fn ensure_running(&self) -> Result<(), RegistryError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(RegistryError::ShuttingDown);
        }
        Ok(())
    }
}
