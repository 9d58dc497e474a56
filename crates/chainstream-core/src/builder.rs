//! Fluent builder API for creating ingestion engines.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use chainstream_core::{EngineBuilder, MemoryCheckpointStore};
//!
//! let engine = EngineBuilder::new()
//!     .stream_id("usdc-mainnet")
//!     .batch_size(500)
//!     .reconnect_delay_ms(5_000)
//!     .connector(connector)
//!     .checkpoint_store(Arc::new(MemoryCheckpointStore::new()))
//!     .build()?;
//! let handle = engine.spawn();
//! ```

use std::sync::Arc;

use crate::checkpoint::{CheckpointStore, MemoryCheckpointStore};
use crate::client::ChainConnector;
use crate::config::EngineConfig;
use crate::engine::IngestionEngine;
use crate::error::StreamError;
use crate::router::MessageRouter;

/// Fluent builder for [`IngestionEngine`].
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    connector: Option<Arc<dyn ChainConnector>>,
    store: Option<Arc<dyn CheckpointStore>>,
    router: Option<MessageRouter>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration.
    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Set the stream ID (used as the checkpoint key).
    pub fn stream_id(mut self, id: impl Into<String>) -> Self {
        self.config.stream_id = id.into();
        self
    }

    /// Set the number of blocks per historical range query.
    pub fn batch_size(mut self, size: u64) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Set the live-mode heartbeat interval in milliseconds.
    pub fn heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.config.heartbeat_interval_ms = ms;
        self
    }

    /// Set the fixed reconnect retry delay in milliseconds.
    pub fn reconnect_delay_ms(mut self, ms: u64) -> Self {
        self.config.reconnect_delay_ms = ms;
        self
    }

    /// Set the deadline for remote calls in milliseconds.
    pub fn request_timeout_ms(mut self, ms: u64) -> Self {
        self.config.request_timeout_ms = ms;
        self
    }

    pub fn backfill_on_reconnect(mut self, enabled: bool) -> Self {
        self.config.backfill_on_reconnect = enabled;
        self
    }

    /// Per-subscriber queue depth. Ignored if a router is supplied.
    pub fn subscriber_capacity(mut self, capacity: usize) -> Self {
        self.config.subscriber_capacity = capacity;
        self
    }

    pub fn connector(mut self, connector: Arc<dyn ChainConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Publish into an existing router instead of a fresh one.
    pub fn router(mut self, router: MessageRouter) -> Self {
        self.router = Some(router);
        self
    }

    /// Build the `EngineConfig` alone.
    pub fn build_config(self) -> EngineConfig {
        self.config
    }

    /// Build the engine.
    ///
    /// A connector is required. Without a checkpoint store the engine keeps
    /// its position in memory only.
    pub fn build(self) -> Result<IngestionEngine, StreamError> {
        let connector = self
            .connector
            .ok_or_else(|| StreamError::Other("engine builder: no chain connector set".into()))?;
        if self.config.batch_size == 0 {
            return Err(StreamError::Other("engine builder: batch_size must be at least 1".into()));
        }
        if self.config.stream_id.is_empty() {
            return Err(StreamError::Other("engine builder: stream_id must not be empty".into()));
        }
        if self.config.heartbeat_interval_ms == 0 {
            return Err(StreamError::Other(
                "engine builder: heartbeat_interval_ms must be at least 1".into(),
            ));
        }
        if self.config.request_timeout_ms == 0 {
            return Err(StreamError::Other(
                "engine builder: request_timeout_ms must be at least 1".into(),
            ));
        }

        let store = self.store.unwrap_or_else(|| {
            tracing::warn!("no checkpoint store configured, progress will not survive restarts");
            Arc::new(MemoryCheckpointStore::new())
        });
        let router = self
            .router
            .unwrap_or_else(|| MessageRouter::new(self.config.subscriber_capacity));

        Ok(IngestionEngine::new(self.config, connector, store, router))
    }
}
