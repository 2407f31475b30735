//! SQLite key-value backend.
//!
//! One table, `kv(key BLOB PRIMARY KEY, value BLOB)`. Each [`IndexStore::batch`]
//! runs in a single transaction, so a block's index writes and its tip move
//! land together or not at all. BLOB keys compare bytewise, which gives
//! range scans the same order as the in-memory store.
//!
//! # Usage
//! ```rust,no_run
//! use blockindex_storage::sqlite::SqliteStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStore::open("./index.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStore::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use blockindex_core::error::IndexerError;
use blockindex_core::store::{IndexStore, Operation};

fn storage_err(e: sqlx::Error) -> IndexerError {
    IndexerError::Storage(e.to_string())
}

/// SQLite-backed [`IndexStore`].
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./index.db"`) or a full
    /// SQLite URL (`"sqlite:./index.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, IndexerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(storage_err)?;
        let store = Self { pool };
        store.init_schema().await?;
        debug!(path, "sqlite store opened");
        Ok(store)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Every connection to `:memory:` is its own database, so the pool is
    /// pinned to one connection that never expires. All data is lost when
    /// the store is dropped.
    pub async fn in_memory() -> Result<Self, IndexerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), IndexerError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kv (
                key   BLOB PRIMARY KEY NOT NULL,
                value BLOB NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    /// Number of stored keys.
    pub async fn count(&self) -> Result<u64, IndexerError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM kv")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        let n: i64 = row.try_get("n").map_err(storage_err)?;
        Ok(n as u64)
    }
}

#[async_trait]
impl IndexStore for SqliteStore {
    async fn batch(&self, operations: Vec<Operation>) -> Result<(), IndexerError> {
        let count = operations.len();
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        for op in operations {
            match op {
                Operation::Put { key, value } => {
                    sqlx::query("INSERT OR REPLACE INTO kv (key, value) VALUES (?, ?)")
                        .bind(key)
                        .bind(value)
                        .execute(&mut *tx)
                        .await
                        .map_err(storage_err)?;
                }
                Operation::Delete { key } => {
                    sqlx::query("DELETE FROM kv WHERE key = ?")
                        .bind(key)
                        .execute(&mut *tx)
                        .await
                        .map_err(storage_err)?;
                }
            }
        }

        // Dropping an uncommitted transaction rolls it back.
        tx.commit().await.map_err(storage_err)?;
        debug!(operations = count, "sqlite batch committed");
        Ok(())
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, IndexerError> {
        let row = sqlx::query("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;

        match row {
            Some(r) => Ok(Some(r.try_get("value").map_err(storage_err)?)),
            None => Ok(None),
        }
    }

    async fn scan_range(&self, start: &[u8], end: Option<&[u8]>) -> Result<Vec<(Vec<u8>, Vec<u8>)>, IndexerError> {
        let rows = match end {
            Some(end) => {
                sqlx::query("SELECT key, value FROM kv WHERE key >= ? AND key < ? ORDER BY key")
                    .bind(start)
                    .bind(end)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query("SELECT key, value FROM kv WHERE key >= ? ORDER BY key")
                    .bind(start)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(storage_err)?;

        rows.into_iter()
            .map(|r| {
                let key: Vec<u8> = r.try_get("key").map_err(storage_err)?;
                let value: Vec<u8> = r.try_get("value").map_err(storage_err)?;
                Ok((key, value))
            })
            .collect()
    }
}
