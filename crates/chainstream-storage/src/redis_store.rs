//! Redis checkpoint backend.
//!
//! One string key per stream: `{prefix}:{stream_id}` holding the decimal
//! position. An empty prefix stores the bare stream id, which is the layout
//! older deployments used (`lastProcessedBlock`).

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::debug;

use chainstream_core::checkpoint::{parse_position, CheckpointStore};
use chainstream_core::error::StreamError;

/// Default key namespace.
pub const DEFAULT_KEY_PREFIX: &str = crate::DEFAULT_REDIS_KEY_PREFIX;

/// Redis-backed checkpoint store. Reconnects transparently through
/// [`ConnectionManager`].
#[derive(Clone)]
pub struct RedisCheckpointStore {
    connection_manager: ConnectionManager,
    prefix: String,
}

fn store_err(e: redis::RedisError) -> StreamError {
    StreamError::Checkpoint(e.to_string())
}

impl RedisCheckpointStore {
    /// Connect with the default key prefix.
    pub async fn open(redis_url: &str) -> Result<Self, StreamError> {
        Self::open_with_prefix(redis_url, DEFAULT_KEY_PREFIX).await
    }

    pub async fn open_with_prefix(redis_url: &str, prefix: &str) -> Result<Self, StreamError> {
        let client = Client::open(redis_url)
            .map_err(|e| StreamError::Checkpoint(format!("invalid Redis URL: {e}")))?;
        let connection_manager = ConnectionManager::new(client)
            .await
            .map_err(|e| StreamError::Checkpoint(format!("failed to connect to Redis: {e}")))?;

        Ok(Self {
            connection_manager,
            prefix: prefix.to_string(),
        })
    }

    /// Storage key for `stream_id`.
    pub fn key(&self, stream_id: &str) -> String {
        key_for(&self.prefix, stream_id)
    }
}

fn key_for(prefix: &str, stream_id: &str) -> String {
    if prefix.is_empty() {
        stream_id.to_string()
    } else {
        format!("{prefix}:{stream_id}")
    }
}

#[async_trait]
impl CheckpointStore for RedisCheckpointStore {
    async fn get(&self, stream_id: &str) -> Result<Option<u64>, StreamError> {
        let mut conn = self.connection_manager.clone();
        let raw: Option<String> = conn.get(self.key(stream_id)).await.map_err(store_err)?;
        raw.map(|r| parse_position(stream_id, &r)).transpose()
    }

    async fn set(&self, stream_id: &str, position: u64) -> Result<(), StreamError> {
        let mut conn = self.connection_manager.clone();
        let key = self.key(stream_id);
        conn.set::<_, _, ()>(&key, position.to_string())
            .await
            .map_err(store_err)?;
        debug!(%key, position, "checkpoint saved");
        Ok(())
    }

    async fn delete(&self, stream_id: &str) -> Result<(), StreamError> {
        let mut conn = self.connection_manager.clone();
        conn.del::<_, ()>(self.key(stream_id)).await.map_err(store_err)?;
        Ok(())
    }
}
