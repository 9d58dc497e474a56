//! EVM log wire format and `eth_getLogs` / `eth_subscribe` filters.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::rpc::quantity;

/// A raw EVM log as returned by `eth_getLogs` or pushed by a `logs`
/// subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    #[serde(rename = "blockNumber")]
    pub block_number: Option<String>,
    #[serde(rename = "transactionHash")]
    pub tx_hash: Option<String>,
    #[serde(rename = "logIndex")]
    pub log_index: Option<String>,
    #[serde(default)]
    pub removed: bool,
}

impl RpcLog {
    /// First topic (the event signature hash), if any.
    pub fn topic0(&self) -> Option<&str> {
        self.topics.first().map(String::as_str)
    }
}

/// Filter for one contract and one event signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    pub address: String,
    pub topic0: String,
}

impl LogFilter {
    pub fn new(address: impl Into<String>, topic0: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            topic0: topic0.into(),
        }
    }

    /// `eth_getLogs` parameter object for `[from, to]`.
    pub fn range(&self, from: u64, to: u64) -> Value {
        json!({
            "address": self.address,
            "fromBlock": quantity(from),
            "toBlock": quantity(to),
            "topics": [self.topic0],
        })
    }

    /// `eth_subscribe("logs", …)` parameter object.
    pub fn live(&self) -> Value {
        json!({
            "address": self.address,
            "topics": [self.topic0],
        })
    }
}
