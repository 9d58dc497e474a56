//! Shared types for the ingestion pipeline.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

// ─── EventKind ────────────────────────────────────────────────────────────────

/// The closed set of token events the pipeline carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Transfer,
    Approval,
}

impl EventKind {
    /// Every kind, in the order listeners are registered.
    pub const ALL: [EventKind; 2] = [EventKind::Transfer, EventKind::Approval];

    /// The event name as emitted by the token contract.
    pub fn name(self) -> &'static str {
        match self {
            Self::Transfer => "Transfer",
            Self::Approval => "Approval",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ─── RawEvent ─────────────────────────────────────────────────────────────────

/// An event as handed over by a chain client, before normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Event name reported by the source (e.g. `"Transfer"`).
    pub event_name: String,
    /// Block the event was mined in.
    pub block_number: u64,
    /// Transaction hash (`0x…`).
    pub tx_hash: String,
    /// Log index within the block.
    pub log_index: u32,
    /// Decoded event arguments, keyed by parameter name.
    pub args: serde_json::Value,
}

// ─── NormalizedEvent ──────────────────────────────────────────────────────────

/// Kind-specific payload of a [`NormalizedEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventFields {
    Transfer {
        from: String,
        to: String,
        amount: String,
    },
    Approval {
        owner: String,
        spender: String,
        amount: String,
    },
}

impl EventFields {
    /// The kind this payload belongs to.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Transfer { .. } => EventKind::Transfer,
            Self::Approval { .. } => EventKind::Approval,
        }
    }

    /// Token amount as a uint256 decimal string.
    pub fn amount(&self) -> &str {
        match self {
            Self::Transfer { amount, .. } | Self::Approval { amount, .. } => amount,
        }
    }
}

/// The canonical unit flowing from the engine to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedEvent {
    pub kind: EventKind,
    /// Block height.
    pub position: u64,
    /// Stable identifier within a position; de-duplication key together
    /// with `position`.
    pub sequence_hint: String,
    pub fields: EventFields,
}

impl NormalizedEvent {
    /// Key consumers use to collapse redelivered events.
    pub fn dedup_key(&self) -> (u64, &str) {
        (self.position, &self.sequence_hint)
    }

    /// Delivery order: position first, then sequence hint.
    pub fn delivery_order(&self, other: &Self) -> Ordering {
        self.dedup_key().cmp(&other.dedup_key())
    }
}

/// Builds the sequence hint for a log.
///
/// The log index is zero-padded so lexicographic order matches numeric order
/// within a transaction.
pub fn sequence_hint(tx_hash: &str, log_index: u32) -> String {
    format!("{}:{:010}", tx_hash.to_ascii_lowercase(), log_index)
}

// ─── Tests ────────────────────────────────────────────────────────────────────
