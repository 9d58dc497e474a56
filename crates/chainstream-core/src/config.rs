//! Engine configuration and state types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::router::DEFAULT_SUBSCRIBER_CAPACITY;

/// Configuration for an ingestion engine instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Stream identifier (checkpoint key).
    pub stream_id: String,
    /// Blocks per historical range query.
    pub batch_size: u64,
    /// Interval between liveness probes in live mode (milliseconds).
    pub heartbeat_interval_ms: u64,
    /// Fixed delay between failed reconnect attempts (milliseconds).
    pub reconnect_delay_ms: u64,
    /// Deadline applied to every remote call (milliseconds).
    pub request_timeout_ms: u64,
    /// Re-scan from the cursor to the new head after each reconnect.
    pub backfill_on_reconnect: bool,
    /// Per-subscriber queue depth used when the builder creates the router.
    pub subscriber_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stream_id: "lastProcessedBlock".into(),
            batch_size: 100,
            heartbeat_interval_ms: 30_000,
            reconnect_delay_ms: 3_000,
            request_timeout_ms: 15_000,
            backfill_on_reconnect: true,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
        }
    }
}

impl EngineConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Runtime state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    /// Loading the checkpoint and acquiring the first connection.
    Bootstrapping,
    /// Replaying the range between the cursor and the head.
    Backfilling,
    /// Following live listener callbacks.
    Live,
    /// Replacing a failed connection.
    Reconnecting,
    /// Releasing listeners, connection, and store.
    ShuttingDown,
    /// Terminated.
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bootstrapping => write!(f, "bootstrapping"),
            Self::Backfilling => write!(f, "backfilling"),
            Self::Live => write!(f, "live"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::ShuttingDown => write!(f, "shutting-down"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}
