//! Checkpoint manager: persists the engine's position for crash recovery.
//!
//! A checkpoint stores the last fully processed block height of one stream.
//! On restart, the engine resumes from the block after it instead of
//! back-filling from scratch.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StreamError;

/// A persisted checkpoint for one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Logical stream identifier (one monitored event source).
    pub stream_id: String,
    /// Last fully processed block height.
    pub last_processed_position: u64,
}

/// Durable stream-id → position mapping.
///
/// Implementations must make a `set` visible to the next `get` from the same
/// process. Positions are persisted as decimal strings.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the stored position, if any.
    async fn get(&self, stream_id: &str) -> Result<Option<u64>, StreamError>;

    /// Store (upsert) the position.
    async fn set(&self, stream_id: &str, position: u64) -> Result<(), StreamError>;

    /// Delete the record (explicit reset only).
    async fn delete(&self, stream_id: &str) -> Result<(), StreamError>;

    /// Release any connection held by the store.
    async fn close(&self) -> Result<(), StreamError> {
        Ok(())
    }
}

/// Parse a persisted position value.
pub fn parse_position(stream_id: &str, raw: &str) -> Result<u64, StreamError> {
    raw.trim().parse::<u64>().map_err(|e| {
        StreamError::Checkpoint(format!(
            "checkpoint for '{stream_id}' holds '{raw}', not a block height: {e}"
        ))
    })
}

/// Reads and writes the checkpoint of a single stream.
///
/// The manager never moves the stored position backwards, and remembers a
/// failed write so the next successful one can report recovery.
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    stream_id: String,
    /// Highest position successfully persisted this run.
    saved: Option<u64>,
    /// Position whose write failed and has not been superseded yet.
    pending: Option<u64>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>, stream_id: impl Into<String>) -> Self {
        Self {
            store,
            stream_id: stream_id.into(),
            saved: None,
            pending: None,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Load the saved checkpoint (returns `None` if none exists).
    pub async fn load(&mut self) -> Result<Option<Checkpoint>, StreamError> {
        let position = self.store.get(&self.stream_id).await?;
        self.saved = position;
        Ok(position.map(|p| Checkpoint {
            stream_id: self.stream_id.clone(),
            last_processed_position: p,
        }))
    }

    /// Persist `position` unless a higher one is already stored.
    pub async fn advance(&mut self, position: u64) -> Result<(), StreamError> {
        if self.saved.is_some_and(|saved| saved >= position) {
            return Ok(());
        }
        match self.store.set(&self.stream_id, position).await {
            Ok(()) => {
                if let Some(stale) = self.pending.take() {
                    tracing::info!(
                        stream = %self.stream_id,
                        stale,
                        position,
                        "checkpoint writes recovered"
                    );
                }
                self.saved = Some(position);
                Ok(())
            }
            Err(e) => {
                self.pending = Some(position);
                Err(e)
            }
        }
    }

    /// Highest position persisted during this run (or loaded at startup).
    pub fn saved(&self) -> Option<u64> {
        self.saved
    }

    /// Position whose write is still outstanding after a failure.
    pub fn pending(&self) -> Option<u64> {
        self.pending
    }

    /// Release the underlying store.
    pub async fn close(&self) -> Result<(), StreamError> {
        self.store.close().await
    }
}

// ─── In-memory store (for testing) ────────────────────────────────────────────

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// In-memory checkpoint store for tests and ephemeral runs.
///
/// Values are kept as strings, matching the durable backends' layout.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    data: Mutex<HashMap<String, String>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with one checkpoint.
    pub fn with_position(stream_id: &str, position: u64) -> Self {
        let store = Self::default();
        store.lock().insert(stream_id.to_string(), position.to_string());
        store
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, stream_id: &str) -> Result<Option<u64>, StreamError> {
        self.lock()
            .get(stream_id)
            .map(|raw| parse_position(stream_id, raw))
            .transpose()
    }

    async fn set(&self, stream_id: &str, position: u64) -> Result<(), StreamError> {
        self.lock().insert(stream_id.to_string(), position.to_string());
        Ok(())
    }

    async fn delete(&self, stream_id: &str) -> Result<(), StreamError> {
        self.lock().remove(stream_id);
        Ok(())
    }
}
