//! SQLite checkpoint backend.
//!
//! Persists one row per stream to a single SQLite file. Uses `sqlx` with WAL
//! mode so a `status` query can read while an engine writes.
//!
//! # Usage
//! ```rust,no_run
//! use chainstream_storage::sqlite::SqliteCheckpointStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteCheckpointStore::open("./checkpoints.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteCheckpointStore::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use chainstream_core::checkpoint::{parse_position, CheckpointStore};
use chainstream_core::error::StreamError;

/// SQLite-backed checkpoint store.
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
}

fn store_err(e: sqlx::Error) -> StreamError {
    StreamError::Checkpoint(e.to_string())
}

impl SqliteCheckpointStore {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./checkpoints.db"`) or a full
    /// SQLite URL (`"sqlite:./checkpoints.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, StreamError> {
        if path.contains(":memory:") {
            return Self::in_memory().await;
        }
        let url = match path.strip_prefix("sqlite:") {
            Some(_) if path.contains("mode=") => path.to_string(),
            Some(_) if path.contains('?') => format!("{path}&mode=rwc"),
            Some(_) => format!("{path}?mode=rwc"),
            None => format!("sqlite:{path}?mode=rwc"),
        };

        let pool = SqlitePool::connect(&url).await.map_err(store_err)?;
        let store = Self { pool };
        store.init_schema(true).await?;
        Ok(store)
    }

    /// Open an in-memory SQLite database.
    ///
    /// All data is lost when the store is dropped.
    pub async fn in_memory() -> Result<Self, StreamError> {
        // one connection, otherwise every pooled connection gets its own database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(store_err)?;
        let store = Self { pool };
        store.init_schema(false).await?;
        Ok(store)
    }

    async fn init_schema(&self, wal: bool) -> Result<(), StreamError> {
        if wal {
            sqlx::query("PRAGMA journal_mode=WAL;")
                .execute(&self.pool)
                .await
                .map_err(store_err)?;
        }

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                stream_id  TEXT    PRIMARY KEY,
                position   TEXT    NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(())
    }

    /// Unix timestamp (seconds) of the last write for `stream_id`.
    pub async fn updated_at(&self, stream_id: &str) -> Result<Option<i64>, StreamError> {
        let row = sqlx::query("SELECT updated_at FROM checkpoints WHERE stream_id = ?")
            .bind(stream_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(row.map(|r| r.get::<i64, _>("updated_at")))
    }

    /// Every stored `(stream_id, position)` pair, ordered by stream id.
    pub async fn list(&self) -> Result<Vec<(String, u64)>, StreamError> {
        let rows = sqlx::query("SELECT stream_id, position FROM checkpoints ORDER BY stream_id")
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;

        rows.iter()
            .map(|r| {
                let id: String = r.get("stream_id");
                let raw: String = r.get("position");
                let position = parse_position(&id, &raw)?;
                Ok((id, position))
            })
            .collect()
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn get(&self, stream_id: &str) -> Result<Option<u64>, StreamError> {
        let row = sqlx::query("SELECT position FROM checkpoints WHERE stream_id = ?")
            .bind(stream_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;

        row.map(|r| parse_position(stream_id, &r.get::<String, _>("position")))
            .transpose()
    }

    async fn set(&self, stream_id: &str, position: u64) -> Result<(), StreamError> {
        sqlx::query(
            "INSERT INTO checkpoints (stream_id, position, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(stream_id) DO UPDATE SET
                position   = excluded.position,
                updated_at = excluded.updated_at",
        )
        .bind(stream_id)
        .bind(position.to_string())
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        debug!(stream = stream_id, position, "checkpoint saved");
        Ok(())
    }

    async fn delete(&self, stream_id: &str) -> Result<(), StreamError> {
        sqlx::query("DELETE FROM checkpoints WHERE stream_id = ?")
            .bind(stream_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn close(&self) -> Result<(), StreamError> {
        self.pool.close().await;
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
