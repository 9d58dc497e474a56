//! chainstream-evm — EVM chain client for ChainStream.
//!
//! - [`client`] — WebSocket JSON-RPC [`WsChainClient`] and its [`WsConnector`]
//! - [`abi`] — ERC-20 `Transfer` / `Approval` log decoding
//! - [`log`] — `eth_getLogs` wire format and filters
//! - [`rpc`] — JSON-RPC 2.0 envelopes

pub mod abi;
pub mod client;
pub mod log;
pub mod rpc;
pub mod subscriptions;

pub use abi::{decode_log, DecodeError, APPROVAL_TOPIC, TRANSFER_TOPIC};
pub use client::{WsChainClient, WsConnector};
