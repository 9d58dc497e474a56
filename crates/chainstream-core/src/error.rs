//! Error types for the chainstream pipeline.

use thiserror::Error;

use crate::types::EventKind;

/// Errors that can occur while ingesting, routing, or delivering events.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The remote source failed a query, a subscription, or a liveness probe.
    #[error("Source error: {0}")]
    Source(String),

    /// A remote call exceeded its deadline.
    #[error("Source call '{operation}' timed out after {ms}ms")]
    Timeout { operation: &'static str, ms: u64 },

    #[error("Checkpoint store error: {0}")]
    Checkpoint(String),

    #[error("Malformed {kind} event at position {position}: {reason}")]
    Malformed {
        kind: EventKind,
        position: u64,
        reason: String,
    },

    #[error("Subscriber {id} exceeded its buffer of {capacity} events")]
    SubscriberOverflow { id: u64, capacity: usize },

    /// Missing or unknown event type in a consume request.
    #[error("{0}")]
    InvalidFilter(String),

    #[error("Engine aborted: {reason}")]
    Aborted { reason: String },

    #[error("{0}")]
    Other(String),
}

impl StreamError {
    /// Returns `true` for failures of the shared remote connection.
    ///
    /// These never abort the engine; they send it through the reconnect
    /// transition instead.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Source(_) | Self::Timeout { .. })
    }

    /// Returns `true` if the checkpoint store could not be read or written.
    pub fn is_checkpoint(&self) -> bool {
        matches!(self, Self::Checkpoint(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(StreamError::Source("ws closed".into()).is_transient());
        assert!(StreamError::Timeout { operation: "probe", ms: 10 }.is_transient());
        assert!(!StreamError::Checkpoint("down".into()).is_transient());
        assert!(!StreamError::InvalidFilter("Swap".into()).is_transient());
    }

    #[test]
    fn malformed_message_names_kind() {
        let err = StreamError::Malformed {
            kind: EventKind::Approval,
            position: 42,
            reason: "missing field 'spender'".into(),
        };
        assert_eq!(
            err.to_string(),
            "Malformed Approval event at position 42: missing field 'spender'"
        );
    }
}
