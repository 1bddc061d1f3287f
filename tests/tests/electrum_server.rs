//! End-to-end electrum server behaviour over real transports.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crest_types::{ConsensusChange, UnlockHash, UnlockType};

mod common;
use common::*;

fn test_address() -> UnlockHash {
    UnlockHash::new(UnlockType::PublicKey, [5u8; 32])
}

#[tokio::test]
async fn version_then_ping_over_tcp() {
    let chain = Arc::new(MemChain::default());
    let server = spawn_electrum(chain, Duration::from_secs(60)).await;

    let mut client = LineClient::connect(server.tcp_addr).await;

    client
        .send(&json!({
            "id": 1,
            "jsonrpc": "2.0",
            "method": "server.version",
            "params": ["test-client", "1.0"],
        }))
        .await;
    let reply = client.recv().await;
    assert_eq!(reply["id"], json!(1));
    let result = reply["result"].as_array().unwrap();
    assert!(result[0].as_str().unwrap().starts_with("crest-electrum/"));
    assert_eq!(result[1], json!("1.0.0"));

    client
        .send(&json!({"id": 2, "jsonrpc": "2.0", "method": "server.ping"}))
        .await;
    let reply = client.recv().await;
    assert_eq!(reply, json!({"id": 2, "jsonrpc": "2.0", "result": null}));

    server.cancellation.cancel();
    server.server.close().await;
}

#[tokio::test]
async fn second_version_call_gets_101_then_disconnect() {
    let chain = Arc::new(MemChain::default());
    let server = spawn_electrum(chain, Duration::from_secs(60)).await;

    let mut client = LineClient::connect(server.tcp_addr).await;
    client.negotiate().await;

    client
        .send(&json!({
            "id": 9,
            "jsonrpc": "2.0",
            "method": "server.version",
            "params": ["test-client", "1.0"],
        }))
        .await;
    let reply = client.recv().await;
    assert_eq!(reply["error"]["code"], json!(101));
    assert_eq!(
        reply["error"]["message"],
        json!("Protocol version already set for this connection")
    );

    // The error is fatal; the server hangs up after responding.
    assert!(client.closed().await);

    server.cancellation.cancel();
    server.server.close().await;
}

#[tokio::test]
async fn batch_requests_answer_in_one_frame() {
    let chain = Arc::new(MemChain::default());
    let server = spawn_electrum(chain, Duration::from_secs(60)).await;

    let mut client = LineClient::connect(server.tcp_addr).await;
    client
        .send(&json!([
            {"id": 1, "jsonrpc": "2.0", "method": "server.ping"},
            {"jsonrpc": "2.0", "method": "server.ping"},
            {"id": 2, "jsonrpc": "2.0", "method": "no.such.method"},
        ]))
        .await;

    let reply = client.recv().await;
    let entries = reply.as_array().unwrap();
    // The notification entry is elided.
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["id"], json!(1));
    assert_eq!(entries[1]["id"], json!(2));
    assert_eq!(entries[1]["error"]["code"], json!(-32601));

    server.cancellation.cancel();
    server.server.close().await;
}

#[tokio::test]
async fn subscribe_then_consensus_change_notifies() {
    let chain = Arc::new(MemChain::default());
    let server = spawn_electrum(chain.clone(), Duration::from_secs(60)).await;
    let address = test_address();

    let mut client = LineClient::connect(server.tcp_addr).await;
    client.negotiate().await;

    client
        .send(&json!({
            "id": 2,
            "jsonrpc": "2.0",
            "method": "blockchain.address.subscribe",
            "params": [address.to_string()],
        }))
        .await;
    let reply = client.recv().await;
    let initial_status = reply["result"].as_str().unwrap().to_owned();

    // A new confirmed payment to the address lands on chain.
    let (tx, diff) = payment(0x21, address, 500);
    chain.push_confirmed(crest_types::ConfirmedTransaction {
        transaction: tx,
        block_id: ids::block_id(0x42),
        height: 7,
        block_index: 1,
    });
    server
        .consensus_tx
        .send_async(ConsensusChange {
            coin_diffs: vec![diff],
            ..Default::default()
        })
        .await
        .unwrap();

    // The unsolicited notification carries the recomputed status.
    let notification = client.recv().await;
    assert!(notification.get("id").is_none());
    assert_eq!(
        notification["method"],
        json!("blockchain.address.subscribe")
    );
    assert_eq!(
        notification["params"]["address"],
        json!(address.to_string())
    );
    let new_status = notification["params"]["status"].as_str().unwrap();
    assert_ne!(new_status, initial_status);

    // And it matches a fresh computation over the same chain state.
    let expected = crest_electrum::address_status(chain.as_ref(), chain.as_ref(), &address)
        .await
        .unwrap();
    assert_eq!(new_status, expected);

    server.cancellation.cancel();
    server.server.close().await;
}

#[tokio::test]
async fn unrelated_addresses_are_not_notified() {
    let chain = Arc::new(MemChain::default());
    let server = spawn_electrum(chain.clone(), Duration::from_secs(60)).await;
    let address = test_address();
    let other = UnlockHash::new(UnlockType::PublicKey, [6u8; 32]);

    let mut client = LineClient::connect(server.tcp_addr).await;
    client.negotiate().await;
    client
        .send(&json!({
            "id": 2,
            "jsonrpc": "2.0",
            "method": "blockchain.address.subscribe",
            "params": [address.to_string()],
        }))
        .await;
    client.recv().await;

    // A change touching only the other address stays silent for us;
    // one touching ours must get through afterwards.
    let (_, other_diff) = payment(0x31, other, 100);
    server
        .consensus_tx
        .send_async(ConsensusChange {
            coin_diffs: vec![other_diff],
            ..Default::default()
        })
        .await
        .unwrap();

    let (_, our_diff) = payment(0x32, address, 100);
    server
        .consensus_tx
        .send_async(ConsensusChange {
            coin_diffs: vec![our_diff],
            ..Default::default()
        })
        .await
        .unwrap();

    let notification = client.recv().await;
    assert_eq!(
        notification["params"]["address"],
        json!(address.to_string())
    );

    server.cancellation.cancel();
    server.server.close().await;
}

#[tokio::test]
async fn keepalive_closes_idle_clients() {
    let chain = Arc::new(MemChain::default());
    let server = spawn_electrum(chain, Duration::from_millis(200)).await;

    let mut client = LineClient::connect(server.tcp_addr).await;
    client.negotiate().await;

    // Silence; the server hangs up.
    assert!(client.closed().await);

    server.cancellation.cancel();
    server.server.close().await;
}

#[tokio::test]
async fn websocket_transport_speaks_the_same_protocol() {
    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    let chain = Arc::new(MemChain::default());
    let server = spawn_electrum(chain, Duration::from_secs(60)).await;
    let ws_addr = server.ws_addr.expect("ws transport enabled");

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{ws_addr}"))
        .await
        .expect("websocket handshake");

    ws.send(Message::Text(
        json!({
            "id": 1,
            "jsonrpc": "2.0",
            "method": "server.version",
            "params": ["ws-client", "1.0"],
        })
        .to_string(),
    ))
    .await
    .unwrap();

    let reply: Value = match ws.next().await.unwrap().unwrap() {
        Message::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected a text frame, got {other:?}"),
    };
    assert_eq!(reply["id"], json!(1));
    assert!(reply["result"].is_array());

    ws.send(Message::Text(
        json!({"id": 2, "jsonrpc": "2.0", "method": "server.ping"}).to_string(),
    ))
    .await
    .unwrap();
    let reply: Value = match ws.next().await.unwrap().unwrap() {
        Message::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected a text frame, got {other:?}"),
    };
    assert_eq!(reply, json!({"id": 2, "jsonrpc": "2.0", "result": null}));

    server.cancellation.cancel();
    server.server.close().await;
}
