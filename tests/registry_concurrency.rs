use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chess_session::config::RegistryConfig;
use chess_session::error::{RegistryError, SessionError, StoreError};
use chess_session::storage::{MemorySessionStore, SessionStore, StoredBlob};
use chess_session::{GameId, GameStatus, HistoryCodec, Move, PlayerId, SessionRegistry};

/// Memory store with an adjustable load delay and a load counter.
#[derive(Default)]
struct SlowStore {
    inner: MemorySessionStore,
    delay_ms: AtomicU64,
    loads: AtomicUsize,
}

impl SlowStore {
    fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl SessionStore for SlowStore {
    async fn load(&self, game_id: GameId) -> Result<StoredBlob, StoreError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.inner.load(game_id).await
    }

    async fn save(&self, game_id: GameId, blob: StoredBlob, expected: Option<u64>) -> Result<(), StoreError> {
        self.inner.save(game_id, blob, expected).await
    }
}

/// Memory store whose loads read the record first, then wait and
/// optionally fail, one scripted step per call.
#[derive(Default)]
struct ScriptedStore {
    inner: MemorySessionStore,
    steps: parking_lot::Mutex<VecDeque<(Duration, bool)>>,
}

impl ScriptedStore {
    fn script(&self, steps: impl IntoIterator<Item = (Duration, bool)>) {
        self.steps.lock().extend(steps);
    }
}

#[async_trait]
impl SessionStore for ScriptedStore {
    async fn load(&self, game_id: GameId) -> Result<StoredBlob, StoreError> {
        let record = self.inner.load(game_id).await;
        let step = self.steps.lock().pop_front();
        if let Some((delay, fail)) = step {
            tokio::time::sleep(delay).await;
            if fail {
                return Err(StoreError::Backend {
                    reason: "scripted failure".to_string(),
                    source: None,
                });
            }
        }
        record
    }

    async fn save(&self, game_id: GameId, blob: StoredBlob, expected: Option<u64>) -> Result<(), StoreError> {
        self.inner.save(game_id, blob, expected).await
    }
}

/// Memory store whose saves commit immediately but answer late.
#[derive(Default)]
struct LateAckStore {
    inner: MemorySessionStore,
    ack_delay_ms: AtomicU64,
}

#[async_trait]
impl SessionStore for LateAckStore {
    async fn load(&self, game_id: GameId) -> Result<StoredBlob, StoreError> {
        self.inner.load(game_id).await
    }

    async fn save(&self, game_id: GameId, blob: StoredBlob, expected: Option<u64>) -> Result<(), StoreError> {
        let result = self.inner.save(game_id, blob, expected).await;
        let delay = self.ack_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        result
    }
}

fn uci(text: &str) -> Move {
    Move::from_uci(text).unwrap()
}

fn registry_over(store: Arc<dyn SessionStore>, load_timeout_ms: u64) -> Arc<SessionRegistry> {
    let config = RegistryConfig {
        load_timeout_ms,
        ..RegistryConfig::default()
    };
    Arc::new(SessionRegistry::new(store, HistoryCodec::default(), config))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_loads_share_one_instance() {
    let store = Arc::new(SlowStore::default());
    let registry = registry_over(store.clone(), 0);
    let id = registry.start_game("w".into(), "b".into()).await.unwrap().id();
    registry.evict(id).await.unwrap();
    store.set_delay(Duration::from_millis(20));

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.get_or_load(id).await })
        })
        .collect();

    let mut handles = Vec::new();
    for task in tasks {
        handles.push(task.await.unwrap().unwrap());
    }
    assert!(handles.iter().all(|h| h.ptr_eq(&handles[0])));
    assert_eq!(store.loads.load(Ordering::SeqCst), 1);
    assert_eq!(registry.live_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn conflicting_moves_apply_exactly_once() {
    let store = Arc::new(MemorySessionStore::new());
    let registry = registry_over(store, 0);
    let white = PlayerId::new("w");
    let id = registry.start_game(white.clone(), "b".into()).await.unwrap().id();

    let tasks: Vec<_> = ["e2e4", "d2d4", "g1f3", "c2c4"]
        .into_iter()
        .map(|m| {
            let registry = Arc::clone(&registry);
            let white = white.clone();
            tokio::spawn(async move { registry.submit_move(id, &uci(m), &white).await })
        })
        .collect();

    let mut applied = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(outcome) => {
                applied += 1;
                assert_eq!(outcome.revision, 1);
            }
            Err(RegistryError::Session(SessionError::WrongTurn { .. })) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(applied, 1);
    let session = registry.get_or_load(id).await.unwrap().snapshot().await.unwrap();
    assert_eq!(session.revision(), 1);
    assert_eq!(session.history().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn games_proceed_in_parallel() {
    let store = Arc::new(MemorySessionStore::new());
    let registry = registry_over(store.clone(), 0);

    let tasks: Vec<_> = (0..12)
        .map(|i| {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                let white = PlayerId::new(format!("white-{i}"));
                let black = PlayerId::new(format!("black-{i}"));
                let id = registry.start_game(white.clone(), black.clone()).await.unwrap().id();
                for (ply, m) in ["f2f3", "e7e5", "g2g4", "d8h4"].iter().enumerate() {
                    let player = if ply % 2 == 0 { &white } else { &black };
                    registry.submit_move(id, &uci(m), player).await.unwrap();
                }
                id
            })
        })
        .collect();

    for task in tasks {
        let id = task.await.unwrap();
        let session = registry.get_or_load(id).await.unwrap().snapshot().await.unwrap();
        assert_eq!(session.status(), GameStatus::CheckmateBlackWins);
        // Finished games are written as soon as they end
        assert_eq!(store.revision(id), Some(4));
    }
}

#[tokio::test(start_paused = true)]
async fn load_timeout_leaves_nothing_live() {
    let store = Arc::new(SlowStore::default());
    let registry = registry_over(store.clone(), 100);
    let id = registry.start_game("w".into(), "b".into()).await.unwrap().id();
    registry.evict(id).await.unwrap();

    store.set_delay(Duration::from_secs(10));
    let err = registry.get_or_load(id).await.unwrap_err();
    assert!(matches!(err, RegistryError::Timeout { game_id } if game_id == id));
    assert!(!registry.is_live(id));

    // A later load with a responsive store succeeds
    store.set_delay(Duration::ZERO);
    registry.get_or_load(id).await.unwrap();
    assert!(registry.is_live(id));
}

#[tokio::test(start_paused = true)]
async fn cancelled_load_leaves_nothing_live() {
    let store = Arc::new(SlowStore::default());
    let registry = registry_over(store.clone(), 0);
    let id = registry.start_game("w".into(), "b".into()).await.unwrap().id();
    registry.evict(id).await.unwrap();
    store.set_delay(Duration::from_secs(60));

    let loading = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move { registry.get_or_load(id).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    loading.abort();
    assert!(loading.await.unwrap_err().is_cancelled());
    assert!(!registry.is_live(id));

    store.set_delay(Duration::ZERO);
    assert!(registry.get_or_load(id).await.is_ok());
}

#[tokio::test]
async fn lost_update_is_detected() {
    // Two registries over one store stand in for two processes
    let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
    let first = registry_over(Arc::clone(&store), 0);
    let second = registry_over(Arc::clone(&store), 0);
    let white = PlayerId::new("w");

    let id = first.start_game(white.clone(), "b".into()).await.unwrap().id();
    first.evict(id).await.unwrap();

    first.submit_move(id, &uci("e2e4"), &white).await.unwrap();
    second.submit_move(id, &uci("d2d4"), &white).await.unwrap();

    assert!(first.evict(id).await.unwrap());
    let err = second.evict(id).await.unwrap_err();
    assert!(matches!(
        err,
        RegistryError::Store(StoreError::Conflict { expected: Some(0), actual: Some(1), .. })
    ));
    // The losing session stays live rather than being dropped
    assert!(second.is_live(id));

    let stored = store.load(id).await.unwrap();
    let session = HistoryCodec::default().decode(&stored.bytes).unwrap();
    assert_eq!(session.history()[0].mv.to_uci(), "e2e4");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn evict_during_moves_never_loses_a_move() {
    let store = Arc::new(MemorySessionStore::new());
    let registry = registry_over(store.clone(), 0);
    let white = PlayerId::new("w");
    let black = PlayerId::new("b");
    let id = registry.start_game(white.clone(), black.clone()).await.unwrap().id();

    let shuffle = ["g1f3", "g8f6", "f3g1", "f6g8", "b1c3", "b8c6", "c3b1", "c6b8"];
    let mover = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            for (ply, m) in shuffle.iter().enumerate() {
                let player = if ply % 2 == 0 { &white } else { &black };
                registry.submit_move(id, &uci(m), player).await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };
    let evictor = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            for _ in 0..20 {
                registry.evict(id).await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };
    mover.await.unwrap();
    evictor.await.unwrap();

    registry.evict(id).await.unwrap();
    let session = registry.get_or_load(id).await.unwrap().snapshot().await.unwrap();
    assert_eq!(session.revision(), shuffle.len() as u64);
    assert_eq!(store.revision(id), Some(shuffle.len() as u64));
}

#[tokio::test(start_paused = true)]
async fn failed_load_keeps_waiters_serialized() {
    let store = Arc::new(ScriptedStore::default());
    let registry = registry_over(store.clone(), 0);
    let white = PlayerId::new("w");
    let id = registry.start_game(white.clone(), "b".into()).await.unwrap().id();
    registry.evict(id).await.unwrap();

    // First load fails after 10ms; the task queued behind it reads
    // revision 0 and takes a second to return it.
    store.script([(Duration::from_millis(10), true), (Duration::from_secs(1), false)]);
    let failing = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move { registry.get_or_load(id).await })
    };
    let queued = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move { registry.get_or_load(id).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Must wait for the queued load instead of racing it
    registry.submit_move(id, &uci("e2e4"), &white).await.unwrap();
    assert!(registry.evict(id).await.unwrap());

    assert!(failing.await.unwrap().is_err());
    let stale = queued.await.unwrap().unwrap();
    assert!(!registry.is_live(id));
    assert!(matches!(
        stale.submit_move(&uci("d2d4"), &white).await,
        Err(SessionError::Evicted { .. })
    ));
    assert_eq!(store.inner.revision(id), Some(1));

    let session = registry.get_or_load(id).await.unwrap().snapshot().await.unwrap();
    assert_eq!(session.revision(), 1);
    assert_eq!(session.history()[0].mv.to_uci(), "e2e4");
}

#[tokio::test(start_paused = true)]
async fn save_that_landed_after_timeout_is_adopted() {
    let store = Arc::new(LateAckStore::default());
    let registry = registry_over(store.clone(), 100);
    let white = PlayerId::new("w");
    let id = registry.start_game(white.clone(), "b".into()).await.unwrap().id();
    registry.submit_move(id, &uci("e2e4"), &white).await.unwrap();

    store.ack_delay_ms.store(500, Ordering::SeqCst);
    let err = registry.checkpoint(id).await.unwrap_err();
    assert!(matches!(err, RegistryError::Timeout { .. }));
    assert_eq!(store.inner.revision(id), Some(1));

    store.ack_delay_ms.store(0, Ordering::SeqCst);
    assert!(registry.evict(id).await.unwrap());
    assert!(!registry.is_live(id));

    let session = registry.get_or_load(id).await.unwrap().snapshot().await.unwrap();
    assert_eq!(session.revision(), 1);
}
