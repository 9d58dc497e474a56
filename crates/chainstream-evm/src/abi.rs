//! ERC-20 `Transfer` / `Approval` log decoding.
//!
//! Both events share one layout: two indexed addresses in `topics[1..3]` and
//! a `uint256` in `data`. Addresses come out EIP-55 checksummed, amounts as
//! decimal strings.

use alloy_primitives::{Address, U256};
use serde_json::json;

use chainstream_core::types::{EventKind, RawEvent};

use crate::log::RpcLog;
use crate::rpc::parse_quantity;

/// `keccak256("Transfer(address,address,uint256)")`
pub const TRANSFER_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";
/// `keccak256("Approval(address,address,uint256)")`
pub const APPROVAL_TOPIC: &str =
    "0x8c5be1e5ebec7d5bd14f71427d1e84f3dd0314c0f7b2291e5b200ac8c7c3b925";

/// Errors from turning an [`RpcLog`] into a [`RawEvent`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("log was removed by a reorg")]
    Removed,

    #[error("log is still pending (missing {0})")]
    Pending(&'static str),

    #[error("unexpected event signature {0}")]
    UnknownTopic(String),

    #[error("expected {expected} topics, got {got}")]
    TopicCount { expected: usize, got: usize },

    #[error("invalid hex in {field}: {reason}")]
    Hex { field: &'static str, reason: String },

    #[error("{field} must be 32 bytes, got {len}")]
    WordLength { field: &'static str, len: usize },
}

/// Signature topic for an event kind.
pub fn topic_for(kind: EventKind) -> &'static str {
    match kind {
        EventKind::Transfer => TRANSFER_TOPIC,
        EventKind::Approval => APPROVAL_TOPIC,
    }
}

/// Event kind a signature topic belongs to.
pub fn kind_for_topic(topic: &str) -> Option<EventKind> {
    if topic.eq_ignore_ascii_case(TRANSFER_TOPIC) {
        Some(EventKind::Transfer)
    } else if topic.eq_ignore_ascii_case(APPROVAL_TOPIC) {
        Some(EventKind::Approval)
    } else {
        None
    }
}

/// Decode a log into a [`RawEvent`] with named arguments.
pub fn decode_log(log: &RpcLog) -> Result<RawEvent, DecodeError> {
    if log.removed {
        return Err(DecodeError::Removed);
    }
    let topic0 = log.topic0().unwrap_or_default();
    let kind = kind_for_topic(topic0).ok_or_else(|| DecodeError::UnknownTopic(topic0.to_string()))?;
    if log.topics.len() != 3 {
        return Err(DecodeError::TopicCount {
            expected: 3,
            got: log.topics.len(),
        });
    }

    let first = address_word(&log.topics[1], "topics[1]")?;
    let second = address_word(&log.topics[2], "topics[2]")?;
    let value = U256::from_be_slice(&word(&log.data, "data")?).to_string();

    let args = match kind {
        EventKind::Transfer => json!({ "from": first, "to": second, "value": value }),
        EventKind::Approval => json!({ "owner": first, "spender": second, "value": value }),
    };

    let block_number = log.block_number.as_deref().ok_or(DecodeError::Pending("blockNumber"))?;
    let log_index = log.log_index.as_deref().ok_or(DecodeError::Pending("logIndex"))?;
    let tx_hash = log.tx_hash.clone().ok_or(DecodeError::Pending("transactionHash"))?;

    Ok(RawEvent {
        event_name: kind.name().to_string(),
        block_number: quantity_field(block_number, "blockNumber")?,
        tx_hash,
        log_index: u32::try_from(quantity_field(log_index, "logIndex")?).map_err(|e| DecodeError::Hex {
            field: "logIndex",
            reason: e.to_string(),
        })?,
        args,
    })
}

fn quantity_field(raw: &str, field: &'static str) -> Result<u64, DecodeError> {
    parse_quantity(raw).map_err(|e| DecodeError::Hex {
        field,
        reason: e.to_string(),
    })
}

fn word(raw: &str, field: &'static str) -> Result<[u8; 32], DecodeError> {
    let bytes = hex::decode(raw.strip_prefix("0x").unwrap_or(raw)).map_err(|e| DecodeError::Hex {
        field,
        reason: e.to_string(),
    })?;
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| DecodeError::WordLength {
        field,
        len: bytes.len(),
    })
}

fn address_word(raw: &str, field: &'static str) -> Result<String, DecodeError> {
    let word = word(raw, field)?;
    Ok(Address::from_slice(&word[12..]).to_checksum(None))
}
