use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use super::{SessionStore, StoredBlob};
use crate::error::StoreError;
use crate::session::GameId;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    game_id    TEXT PRIMARY KEY,
    revision   INTEGER NOT NULL,
    blob       BLOB NOT NULL,
    updated_at TEXT NOT NULL
);
";

/// SQLite-backed session store. One row per game; `save` compares and sets
/// the revision inside a transaction.
#[derive(Clone)]
pub struct SqliteSessionStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteSessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSessionStore").finish_non_exhaustive()
    }
}

impl SqliteSessionStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open(path.as_ref())?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteSessionStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` on the blocking pool with the connection locked.
    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || f(&mut conn.lock()))
            .await
            .map_err(|e| StoreError::Backend {
                reason: format!("store task failed: {e}"),
                source: Some(Box::new(e)),
            })?
    }
}

fn to_sql_revision(revision: u64) -> Result<i64, StoreError> {
    i64::try_from(revision).map_err(|_| StoreError::Backend {
        reason: format!("revision {revision} out of range"),
        source: None,
    })
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn load(&self, game_id: GameId) -> Result<StoredBlob, StoreError> {
        let row = self
            .blocking(move |conn| {
                conn.query_row(
                    "SELECT revision, blob FROM sessions WHERE game_id = ?1",
                    params![game_id.to_string()],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?)),
                )
                .optional()
                .map_err(StoreError::from)
            })
            .await?;

        let (revision, bytes) = row.ok_or(StoreError::NotFound { game_id })?;
        tracing::debug!(%game_id, revision, bytes = bytes.len(), "session loaded");
        Ok(StoredBlob {
            revision: revision as u64,
            bytes,
        })
    }

    async fn save(&self, game_id: GameId, blob: StoredBlob, expected: Option<u64>) -> Result<(), StoreError> {
        let revision = to_sql_revision(blob.revision)?;
        let size = blob.bytes.len();

        self.blocking(move |conn| {
            let key = game_id.to_string();
            let tx = conn.transaction()?;
            let actual: Option<u64> = tx
                .query_row(
                    "SELECT revision FROM sessions WHERE game_id = ?1",
                    params![key],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?
                .map(|r| r as u64);

            if actual != expected {
                return Err(StoreError::Conflict {
                    game_id,
                    expected,
                    actual,
                });
            }

            let now = chrono::Utc::now().to_rfc3339();
            if actual.is_some() {
                tx.execute(
                    "UPDATE sessions SET revision = ?2, blob = ?3, updated_at = ?4 WHERE game_id = ?1",
                    params![key, revision, blob.bytes, now],
                )?;
            } else {
                tx.execute(
                    "INSERT INTO sessions (game_id, revision, blob, updated_at) VALUES (?1, ?2, ?3, ?4)",
                    params![key, revision, blob.bytes, now],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
        .inspect_err(|err| {
            if matches!(err, StoreError::Conflict { .. }) {
                tracing::warn!(%game_id, ?expected, "session save conflict");
            }
        })?;

        tracing::debug!(%game_id, revision, bytes = size, "session saved");
        Ok(())
    }
}
