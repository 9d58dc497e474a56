//! Chain client capability consumed by the ingestion engine.
//!
//! A [`ChainClient`] is one connection to the remote ledger. It can die
//! silently, so the engine never repairs a client in place: it asks a
//! [`ChainConnector`] for a fresh one.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

use crate::error::StreamError;
use crate::types::{EventKind, RawEvent};

/// A stream of raw events from one live listener.
///
/// The stream ending means the listener is gone (connection lost).
pub type RawEventStream = Pin<Box<dyn Stream<Item = RawEvent> + Send>>;

/// Identifier of a live listener registration on a client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerId(pub String);

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A registered live listener and the events it produces.
pub struct LiveSubscription {
    pub id: ListenerId,
    pub kind: EventKind,
    pub events: RawEventStream,
}

impl std::fmt::Debug for LiveSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveSubscription")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// One connection to the remote event source.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Current head block height.
    async fn current_head(&self) -> Result<u64, StreamError>;

    /// Events of `kind` in the inclusive block range `[from, to]`.
    async fn query_range(
        &self,
        kind: EventKind,
        from: u64,
        to: u64,
    ) -> Result<Vec<RawEvent>, StreamError>;

    /// Register a live listener for `kind`.
    async fn subscribe_live(&self, kind: EventKind) -> Result<LiveSubscription, StreamError>;

    /// Remove a live listener.
    async fn unsubscribe(&self, id: &ListenerId) -> Result<(), StreamError>;

    /// Lightweight liveness check.
    async fn probe(&self) -> Result<(), StreamError>;

    /// Release the connection. Called once when the client is discarded.
    async fn close(&self) {}
}

/// Source of fresh [`ChainClient`] handles.
#[async_trait]
pub trait ChainConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn ChainClient>, StreamError>;
}
