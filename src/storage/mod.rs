//! Session Store boundary: durable blobs with optimistic concurrency.
//!
//! `save` is a compare-and-set on the stored revision. It succeeds only when
//! the record's current revision equals `expected` (`None` meaning the record
//! must not exist yet), then replaces it with the blob's own revision.

mod memory;
mod sqlite;

pub use memory::MemorySessionStore;
pub use sqlite::SqliteSessionStore;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::session::GameId;

/// An encoded session together with the revision it was encoded at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub revision: u64,
    pub bytes: Vec<u8>,
}

impl StoredBlob {
    pub fn new(revision: u64, bytes: Vec<u8>) -> Self {
        StoredBlob { revision, bytes }
    }
}

/// Persistence for encoded sessions.
///
/// Implementations must be safe to call concurrently. Retry policy belongs
/// to the implementation, never to the caller.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Fetch the blob for `game_id`, or [`StoreError::NotFound`].
    async fn load(&self, game_id: GameId) -> Result<StoredBlob, StoreError>;

    /// Write `blob` if the stored revision still equals `expected`,
    /// otherwise fail with [`StoreError::Conflict`].
    async fn save(&self, game_id: GameId, blob: StoredBlob, expected: Option<u64>) -> Result<(), StoreError>;
}
