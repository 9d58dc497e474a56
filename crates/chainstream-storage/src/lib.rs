//! chainstream-storage — durable checkpoint backends for ChainStream.
//!
//! Backends:
//! - memory — [`MemoryCheckpointStore`] from core (no persistence)
//! - [`sqlite`] — SQLite via `sqlx` (embedded, single-file persistence)
//! - `redis_store` — Redis via `redis` (shared, `redis` feature)
//!
//! [`open_store`] picks one from a URL.

use std::sync::Arc;

use chainstream_core::checkpoint::CheckpointStore;
use chainstream_core::error::StreamError;

pub use chainstream_core::checkpoint::MemoryCheckpointStore;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "redis")]
pub mod redis_store;

/// Backend selected by a checkpoint URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreUrl {
    Memory,
    Sqlite(String),
    Redis(String),
}

impl StoreUrl {
    /// Classify a URL: `memory://`, `sqlite:<path>` / `*.db`, or
    /// `redis://` / `rediss://`.
    pub fn parse(url: &str) -> Result<Self, StreamError> {
        let url = url.trim();
        if url == "memory" || url.starts_with("memory:") {
            Ok(Self::Memory)
        } else if url.starts_with("sqlite:") || url.ends_with(".db") || url.ends_with(".sqlite") {
            Ok(Self::Sqlite(url.to_string()))
        } else if url.starts_with("redis://") || url.starts_with("rediss://") {
            Ok(Self::Redis(url.to_string()))
        } else {
            Err(StreamError::Checkpoint(format!(
                "unsupported checkpoint URL '{url}' (expected memory://, sqlite:<path> or redis://)"
            )))
        }
    }
}

/// Default Redis key namespace (`{prefix}:{stream_id}`).
pub const DEFAULT_REDIS_KEY_PREFIX: &str = "chainstream:checkpoint";

/// Backend settings that do not fit in the URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOptions {
    /// Redis key prefix. Empty means the bare stream id is the key.
    pub redis_key_prefix: String,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            redis_key_prefix: DEFAULT_REDIS_KEY_PREFIX.to_string(),
        }
    }
}

/// Open the checkpoint store a URL points at, with default options.
pub async fn open_store(url: &str) -> Result<Arc<dyn CheckpointStore>, StreamError> {
    open_store_with(url, &StoreOptions::default()).await
}

/// Open the checkpoint store a URL points at.
pub async fn open_store_with(
    url: &str,
    options: &StoreOptions,
) -> Result<Arc<dyn CheckpointStore>, StreamError> {
    let store: Arc<dyn CheckpointStore> = match StoreUrl::parse(url)? {
        StoreUrl::Memory => Arc::new(MemoryCheckpointStore::new()),
        StoreUrl::Sqlite(path) => open_sqlite(&path).await?,
        StoreUrl::Redis(redis_url) => open_redis(&redis_url, &options.redis_key_prefix).await?,
    };
    tracing::info!(backend = backend_name(url), "checkpoint store opened");
    Ok(store)
}

fn backend_name(url: &str) -> &'static str {
    match StoreUrl::parse(url) {
        Ok(StoreUrl::Memory) => "memory",
        Ok(StoreUrl::Sqlite(_)) => "sqlite",
        Ok(StoreUrl::Redis(_)) => "redis",
        Err(_) => "unknown",
    }
}

#[cfg(feature = "sqlite")]
async fn open_sqlite(path: &str) -> Result<Arc<dyn CheckpointStore>, StreamError> {
    Ok(Arc::new(sqlite::SqliteCheckpointStore::open(path).await?))
}

#[cfg(not(feature = "sqlite"))]
async fn open_sqlite(_path: &str) -> Result<Arc<dyn CheckpointStore>, StreamError> {
    Err(StreamError::Checkpoint("built without the `sqlite` feature".into()))
}

#[cfg(feature = "redis")]
async fn open_redis(url: &str, prefix: &str) -> Result<Arc<dyn CheckpointStore>, StreamError> {
    tracing::debug!(prefix, "redis checkpoint key prefix");
    Ok(Arc::new(
        redis_store::RedisCheckpointStore::open_with_prefix(url, prefix).await?,
    ))
}

#[cfg(not(feature = "redis"))]
async fn open_redis(_url: &str, _prefix: &str) -> Result<Arc<dyn CheckpointStore>, StreamError> {
    Err(StreamError::Checkpoint("built without the `redis` feature".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_classification() {
        assert_eq!(StoreUrl::parse("memory://").unwrap(), StoreUrl::Memory);
        assert_eq!(
            StoreUrl::parse("sqlite:./cp.db").unwrap(),
            StoreUrl::Sqlite("sqlite:./cp.db".into())
        );
        assert_eq!(
            StoreUrl::parse("./cp.db").unwrap(),
            StoreUrl::Sqlite("./cp.db".into())
        );
        assert_eq!(
            StoreUrl::parse("redis://localhost:6379").unwrap(),
            StoreUrl::Redis("redis://localhost:6379".into())
        );
        assert!(StoreUrl::parse("ftp://nope").unwrap_err().is_checkpoint());
    }

    #[tokio::test]
    async fn memory_url_opens_empty_store() {
        let store = open_store("memory://").await.unwrap();
        assert_eq!(store.get("any").await.unwrap(), None);
        store.set("any", 3).await.unwrap();
        assert_eq!(store.get("any").await.unwrap(), Some(3));
    }

    #[test]
    fn default_options_use_namespaced_redis_keys() {
        assert_eq!(StoreOptions::default().redis_key_prefix, DEFAULT_REDIS_KEY_PREFIX);
    }

    #[cfg(feature = "redis")]
    #[tokio::test]
    async fn redis_options_reach_the_backend() {
        let options = StoreOptions {
            redis_key_prefix: String::new(),
        };
        let err = open_store_with("redis://127.0.0.1:1/", &options).await.err().unwrap();
        assert!(err.is_checkpoint());
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn sqlite_memory_url_opens() {
        let store = open_store("sqlite::memory:").await.unwrap();
        store.set("s", 9).await.unwrap();
        assert_eq!(store.get("s").await.unwrap(), Some(9));
    }
}
