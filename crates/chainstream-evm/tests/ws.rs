//! `WsChainClient` against a scripted local WebSocket node.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use chainstream_core::{ChainClient, ChainConnector, EventKind};
use chainstream_evm::{WsConnector, TRANSFER_TOPIC};

const TOKEN: &str = "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48";
const FROM: &str = "0x0000000000000000000000001111111111111111111111111111111111111111";
const TO: &str = "0x0000000000000000000000002222222222222222222222222222222222222222";

fn transfer_log(block: &str, index: &str) -> Value {
    json!({
        "address": TOKEN,
        "topics": [TRANSFER_TOPIC, FROM, TO],
        "data": "0x000000000000000000000000000000000000000000000000000000000000000a",
        "blockNumber": block,
        "transactionHash": "0xfeed",
        "logIndex": index,
        "removed": false
    })
}

/// Serve one connection. With `hang_up`, the node closes the socket right
/// after the first subscription push.
async fn spawn_node(hang_up: bool) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

        while let Some(Ok(msg)) = ws.next().await {
            let Message::Text(text) = msg else { continue };
            let req: Value = serde_json::from_str(text.as_str()).unwrap();
            let (result, push) = match req["method"].as_str().unwrap() {
                "eth_blockNumber" => (json!("0x64"), None),
                "eth_getLogs" => {
                    let filter = &req["params"][0];
                    assert_eq!(filter["topics"][0], TRANSFER_TOPIC);
                    let from = filter["fromBlock"].as_str().unwrap().to_string();
                    (json!([transfer_log(&from, "0x0"), transfer_log(&from, "0x1")]), None)
                }
                "eth_subscribe" => {
                    assert_eq!(req["params"][0], "logs");
                    let push = json!({
                        "jsonrpc": "2.0",
                        "method": "eth_subscription",
                        "params": { "subscription": "0xsub1", "result": transfer_log("0x65", "0x3") }
                    });
                    (json!("0xsub1"), Some(push))
                }
                "eth_unsubscribe" => (json!(true), None),
                other => panic!("unexpected method {other}"),
            };

            let reply = json!({ "jsonrpc": "2.0", "id": req["id"], "result": result });
            ws.send(Message::Text(reply.to_string().into())).await.unwrap();
            if let Some(push) = push {
                ws.send(Message::Text(push.to_string().into())).await.unwrap();
                if hang_up {
                    let _ = ws.close(None).await;
                    return;
                }
            }
        }
    });

    format!("ws://{addr}")
}

#[tokio::test]
async fn head_and_range_queries() {
    let url = spawn_node(false).await;
    let client = WsConnector::new(url, TOKEN).unwrap().connect().await.unwrap();

    assert_eq!(client.current_head().await.unwrap(), 100);
    client.probe().await.unwrap();

    let events = client.query_range(EventKind::Transfer, 90, 100).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].block_number, 90);
    assert_eq!(events[1].log_index, 1);
    assert_eq!(events[0].args["value"], "10");
    assert_eq!(events[0].args["from"], "0x1111111111111111111111111111111111111111");

    client.close().await;
}

#[tokio::test]
async fn push_right_after_subscribe_is_not_lost() {
    let url = spawn_node(false).await;
    let client = WsConnector::new(url, TOKEN).unwrap().connect().await.unwrap();

    let mut sub = client.subscribe_live(EventKind::Transfer).await.unwrap();
    assert_eq!(sub.id.0, "0xsub1");

    let raw = tokio::time::timeout(Duration::from_secs(5), sub.events.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(raw.block_number, 101);
    assert_eq!(raw.log_index, 3);

    client.unsubscribe(&sub.id).await.unwrap();
}

#[tokio::test]
async fn hang_up_ends_streams_and_fails_calls() {
    let url = spawn_node(true).await;
    let client = WsConnector::new(url, TOKEN).unwrap().connect().await.unwrap();

    let mut sub = client.subscribe_live(EventKind::Transfer).await.unwrap();
    let first = tokio::time::timeout(Duration::from_secs(5), sub.events.next()).await.unwrap();
    assert!(first.is_some());

    let end = tokio::time::timeout(Duration::from_secs(5), sub.events.next()).await.unwrap();
    assert!(end.is_none());

    let err = client.current_head().await.unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn refused_connection_is_transient() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = WsConnector::new(format!("ws://{addr}"), TOKEN)
        .unwrap()
        .connect()
        .await
        .err()
        .unwrap();
    assert!(err.is_transient());
}
