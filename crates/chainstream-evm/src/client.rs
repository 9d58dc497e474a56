//! WebSocket JSON-RPC chain client.
//!
//! One [`WsChainClient`] owns one socket through a background task. It does
//! not reconnect on its own: when the socket drops, pending calls fail, live
//! streams end, and the engine asks [`WsConnector`] for a fresh client.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use alloy_primitives::Address;
use async_trait::async_trait;
use futures::{stream, SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use chainstream_core::client::{ChainClient, ChainConnector, ListenerId, LiveSubscription};
use chainstream_core::error::StreamError;
use chainstream_core::types::{EventKind, RawEvent};

use crate::abi::{decode_log, topic_for, DecodeError};
use crate::log::{LogFilter, RpcLog};
use crate::rpc::{parse_quantity, JsonRpcRequest, JsonRpcResponse, RpcId, SubscriptionNotification};
use crate::subscriptions::{SubscriptionId, SubscriptionManager};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A response plus, for `eth_subscribe`, the listener registered before any
/// push for it could be routed.
struct Reply {
    response: JsonRpcResponse,
    listener: Option<mpsc::UnboundedReceiver<Value>>,
}

struct PendingCall {
    tx: oneshot::Sender<Result<Reply, StreamError>>,
    subscribe: bool,
}

type PendingMap = Arc<Mutex<HashMap<u64, PendingCall>>>;

/// Command sent from callers to the background WS task.
enum WsCommand {
    Send {
        req: JsonRpcRequest,
        tx: oneshot::Sender<Result<Reply, StreamError>>,
    },
    Close,
}

fn task_closed() -> StreamError {
    StreamError::Source("WebSocket connection closed".into())
}

/// Chain client for one ERC-20 contract over a single WebSocket.
pub struct WsChainClient {
    url: String,
    contract: String,
    cmd_tx: mpsc::UnboundedSender<WsCommand>,
    subscriptions: SubscriptionManager,
    next_id: AtomicU64,
}

impl WsChainClient {
    /// Open the socket and start the background task.
    pub async fn connect(url: &str, contract: &str) -> Result<Self, StreamError> {
        let (socket, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| StreamError::Source(format!("WebSocket connect to {url} failed: {e}")))?;
        tracing::info!(url, "WebSocket connected");

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let subscriptions = SubscriptionManager::new();
        tokio::spawn(ws_task(url.to_string(), socket, cmd_rx, subscriptions.clone()));

        Ok(Self {
            url: url.to_string(),
            contract: contract.to_string(),
            cmd_tx,
            subscriptions,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn request(&self, method: &str, params: Vec<Value>) -> Result<Reply, StreamError> {
        let req = JsonRpcRequest::new(self.next_id.fetch_add(1, Ordering::Relaxed), method, params);
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(WsCommand::Send { req, tx })
            .map_err(|_| task_closed())?;
        rx.await.map_err(|_| task_closed())?
    }

    /// Issue a call and deserialize its result.
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> Result<T, StreamError> {
        let reply = self.request(method, params).await?;
        decode_result(method, reply.response)
    }

    fn filter(&self, kind: EventKind) -> LogFilter {
        LogFilter::new(self.contract.clone(), topic_for(kind))
    }
}

fn decode_result<T: DeserializeOwned>(method: &str, response: JsonRpcResponse) -> Result<T, StreamError> {
    let result = response.into_result()?;
    serde_json::from_value(result)
        .map_err(|e| StreamError::Source(format!("{method}: unexpected result: {e}")))
}

fn decode_push(kind: EventKind, value: Value) -> Option<RawEvent> {
    let log = match serde_json::from_value::<RpcLog>(value) {
        Ok(log) => log,
        Err(e) => {
            tracing::warn!(%kind, error = %e, "skipping malformed live log");
            return None;
        }
    };
    match decode_log(&log) {
        Ok(raw) => Some(raw),
        Err(DecodeError::Removed) => {
            tracing::debug!(%kind, "ignoring removed log");
            None
        }
        Err(e) => {
            tracing::warn!(%kind, error = %e, "skipping undecodable live log");
            None
        }
    }
}

impl Drop for WsChainClient {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(WsCommand::Close);
    }
}

#[async_trait]
impl ChainClient for WsChainClient {
    async fn current_head(&self) -> Result<u64, StreamError> {
        let raw: String = self.call("eth_blockNumber", vec![]).await?;
        parse_quantity(&raw)
    }

    async fn query_range(
        &self,
        kind: EventKind,
        from: u64,
        to: u64,
    ) -> Result<Vec<RawEvent>, StreamError> {
        let logs: Vec<RpcLog> = self
            .call("eth_getLogs", vec![self.filter(kind).range(from, to)])
            .await?;

        let mut events = Vec::with_capacity(logs.len());
        for log in &logs {
            match decode_log(log) {
                Ok(raw) => events.push(raw),
                Err(DecodeError::Removed) => {}
                Err(e) => tracing::warn!(%kind, from, to, error = %e, "skipping undecodable log"),
            }
        }
        tracing::debug!(%kind, from, to, count = events.len(), "logs fetched");
        Ok(events)
    }

    async fn subscribe_live(&self, kind: EventKind) -> Result<LiveSubscription, StreamError> {
        let reply = self
            .request("eth_subscribe", vec![json!("logs"), self.filter(kind).live()])
            .await?;
        let listener = reply.listener;
        let id: String = decode_result("eth_subscribe", reply.response)?;
        let listener =
            listener.ok_or_else(|| StreamError::Source(format!("eth_subscribe returned no usable id '{id}'")))?;

        let events = stream::unfold(listener, |mut rx| async move { rx.recv().await.map(|v| (v, rx)) })
            .filter_map(move |value| async move { decode_push(kind, value) })
            .boxed();

        tracing::debug!(%kind, subscription = %id, "log subscription active");
        Ok(LiveSubscription {
            id: ListenerId(id),
            kind,
            events,
        })
    }

    async fn unsubscribe(&self, id: &ListenerId) -> Result<(), StreamError> {
        self.subscriptions.remove(&SubscriptionId(id.0.clone()));
        let _removed: bool = self.call("eth_unsubscribe", vec![json!(id.0)]).await?;
        Ok(())
    }

    async fn probe(&self) -> Result<(), StreamError> {
        self.current_head().await.map(|_| ())
    }

    async fn close(&self) {
        let _ = self.cmd_tx.send(WsCommand::Close);
    }
}

/// Background task that owns the socket.
async fn ws_task(
    url: String,
    socket: Socket,
    mut cmd_rx: mpsc::UnboundedReceiver<WsCommand>,
    subscriptions: SubscriptionManager,
) {
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (mut sink, mut stream) = socket.split();

    let reason = loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                None | Some(WsCommand::Close) => {
                    let _ = sink.send(Message::Close(None)).await;
                    break "closed by client";
                }
                Some(WsCommand::Send { req, tx }) => {
                    let msg = match serde_json::to_string(&req) {
                        Ok(msg) => msg,
                        Err(e) => {
                            let _ = tx.send(Err(StreamError::Other(format!("encode {}: {e}", req.method))));
                            continue;
                        }
                    };
                    let id = match req.id {
                        RpcId::Number(n) => n,
                        _ => 0,
                    };
                    lock(&pending).insert(id, PendingCall { tx, subscribe: req.method == "eth_subscribe" });
                    if sink.send(Message::Text(msg.into())).await.is_err() {
                        break "send failed";
                    }
                }
            },
            msg = stream.next() => match msg {
                None => break "stream ended",
                Some(Err(e)) => {
                    tracing::warn!(url = %url, error = %e, "WS receive error");
                    break "receive error";
                }
                Some(Ok(Message::Text(text))) => handle_message(text.as_str(), &pending, &subscriptions),
                Some(Ok(Message::Close(_))) => break "closed by server",
                Some(Ok(_)) => {}
            },
        }
    };

    tracing::info!(url = %url, reason, "WebSocket connection ended");
    for (_, call) in lock(&pending).drain() {
        let _ = call
            .tx
            .send(Err(StreamError::Source(format!("connection lost: {reason}"))));
    }
    subscriptions.clear();
}

fn lock(pending: &PendingMap) -> std::sync::MutexGuard<'_, HashMap<u64, PendingCall>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

fn handle_message(text: &str, pending: &PendingMap, subscriptions: &SubscriptionManager) {
    let Ok(val) = serde_json::from_str::<Value>(text) else {
        tracing::debug!("failed to parse WS message as JSON");
        return;
    };

    // Subscription push
    if val.get("method").and_then(Value::as_str) == Some("eth_subscription") {
        match serde_json::from_value::<SubscriptionNotification>(val) {
            Ok(n) => {
                let id = SubscriptionId(n.params.subscription);
                if !subscriptions.dispatch(&id, n.params.result) {
                    tracing::trace!(subscription = %id, "push for unknown subscription");
                }
            }
            Err(e) => tracing::debug!(error = %e, "malformed subscription push"),
        }
        return;
    }

    // Regular JSON-RPC response
    let resp = match serde_json::from_value::<JsonRpcResponse>(val) {
        Ok(resp) => resp,
        Err(e) => {
            tracing::debug!(error = %e, "unrecognised WS message");
            return;
        }
    };
    let RpcId::Number(id) = resp.id else {
        return;
    };
    let Some(call) = lock(pending).remove(&id) else {
        return;
    };
    let listener = match (&resp.result, call.subscribe) {
        (Some(Value::String(sub)), true) => Some(subscriptions.register(SubscriptionId(sub.clone()))),
        _ => None,
    };
    let _ = call.tx.send(Ok(Reply {
        response: resp,
        listener,
    }));
}

/// Connects [`WsChainClient`]s for one endpoint and token contract.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    contract: String,
}

impl WsConnector {
    /// `contract` must be a 20-byte hex address.
    pub fn new(url: impl Into<String>, contract: &str) -> Result<Self, StreamError> {
        let address = Address::from_str(contract)
            .map_err(|e| StreamError::Other(format!("invalid token address '{contract}': {e}")))?;
        Ok(Self {
            url: url.into(),
            contract: address.to_checksum(None),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Checksummed contract address.
    pub fn contract(&self) -> &str {
        &self.contract
    }
}

#[async_trait]
impl ChainConnector for WsConnector {
    async fn connect(&self) -> Result<Arc<dyn ChainClient>, StreamError> {
        Ok(Arc::new(WsChainClient::connect(&self.url, &self.contract).await?))
    }
}
