//! chainstream-core — resumable token event ingestion with topic fan-out.
//!
//! # Architecture
//!
//! ```text
//! EngineBuilder → IngestionEngine
//!                      ├── ChainConnector / ChainClient (range queries, live listeners, probe)
//!                      ├── normalize        (raw log → NormalizedEvent)
//!                      ├── CheckpointManager (crash recovery, never regresses)
//!                      └── MessageRouter    (topic fan-out, bounded per subscriber)
//!                               └── SubscriptionDispatcher → Session (one per client)
//! ```

pub mod builder;
pub mod checkpoint;
pub mod client;
pub mod config;
pub mod cursor;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod normalize;
pub mod router;
pub mod topic;
pub mod types;

pub use builder::EngineBuilder;
pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointStore, MemoryCheckpointStore};
pub use client::{ChainClient, ChainConnector, ListenerId, LiveSubscription, RawEventStream};
pub use config::{EngineConfig, EngineState};
pub use cursor::Cursor;
pub use dispatcher::{KindFilter, Session, SessionEnd, SubscriptionDispatcher};
pub use engine::{EngineHandle, EngineMetrics, IngestionEngine};
pub use error::StreamError;
pub use normalize::normalize;
pub use router::{MessageRouter, Subscription, SubscriptionId};
pub use topic::TopicPattern;
pub use types::{EventFields, EventKind, NormalizedEvent, RawEvent};
