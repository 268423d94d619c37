use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{SessionStore, StoredBlob};
use crate::error::StoreError;
use crate::session::GameId;

/// In-memory session store for tests and the console's default backend.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    blobs: Mutex<HashMap<GameId, StoredBlob>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }

    /// Stored revision for `game_id`, if any.
    pub fn revision(&self, game_id: GameId) -> Option<u64> {
        self.blobs.lock().get(&game_id).map(|b| b.revision)
    }

    /// Overwrite the raw bytes of a record, bypassing revision checks.
    pub fn corrupt(&self, game_id: GameId, bytes: Vec<u8>) {
        if let Some(blob) = self.blobs.lock().get_mut(&game_id) {
            blob.bytes = bytes;
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, game_id: GameId) -> Result<StoredBlob, StoreError> {
        self.blobs
            .lock()
            .get(&game_id)
            .cloned()
            .ok_or(StoreError::NotFound { game_id })
    }

    async fn save(&self, game_id: GameId, blob: StoredBlob, expected: Option<u64>) -> Result<(), StoreError> {
        let mut blobs = self.blobs.lock();
        let actual = blobs.get(&game_id).map(|b| b.revision);
        if actual != expected {
            tracing::warn!(%game_id, ?expected, ?actual, "session save conflict");
            return Err(StoreError::Conflict {
                game_id,
                expected,
                actual,
            });
        }
        tracing::debug!(%game_id, revision = blob.revision, bytes = blob.bytes.len(), "session saved");
        blobs.insert(game_id, blob);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_missing_is_not_found() {
        let store = MemorySessionStore::new();
        let err = store.load(GameId::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn save_is_compare_and_set() {
        let store = MemorySessionStore::new();
        let id = GameId::new();

        store.save(id, StoredBlob::new(0, vec![1]), None).await.unwrap();
        // A second create loses
        let err = store.save(id, StoredBlob::new(0, vec![2]), None).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict { expected: None, actual: Some(0), .. }
        ));

        store.save(id, StoredBlob::new(3, vec![3]), Some(0)).await.unwrap();
        let err = store.save(id, StoredBlob::new(4, vec![4]), Some(0)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { actual: Some(3), .. }));

        assert_eq!(store.load(id).await.unwrap(), StoredBlob::new(3, vec![3]));
        assert_eq!(store.len(), 1);
    }
}
