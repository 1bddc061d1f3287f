//! End-to-end gateway behaviour over localhost TCP.

use std::time::Duration;

mod common;
use common::*;

#[tokio::test]
async fn connect_and_share_nodes() {
    let a = spawn_gateway(vec![]).await;
    let b = spawn_gateway(vec![]).await;

    a.gateway.connect(b.address.clone()).await.unwrap();

    // Dialer side: one outbound peer, flagged in the node table.
    let peers = a.gateway.peers().await;
    assert_eq!(peers.len(), 1);
    assert!(!peers[0].inbound);
    assert_eq!(peers[0].address, b.address);

    // Acceptor side eventually sees one inbound peer under the dial-back
    // address.
    wait_for("b to accept the peer", Duration::from_secs(5), || async {
        let peers = b.gateway.peers().await;
        peers.len() == 1 && peers[0].inbound
    })
    .await;

    a.gateway.close().await;
    b.gateway.close().await;
}

#[tokio::test]
async fn duplicate_connect_is_refused() {
    let a = spawn_gateway(vec![]).await;
    let b = spawn_gateway(vec![]).await;

    a.gateway.connect(b.address.clone()).await.unwrap();
    let err = a.gateway.connect(b.address.clone()).await.unwrap_err();
    assert!(matches!(err, crest_gateway::Error::PeerAlreadyConnected));

    a.gateway.close().await;
    b.gateway.close().await;
}

#[tokio::test]
async fn self_dial_is_rejected_and_node_forgotten() {
    let a = spawn_gateway(vec![]).await;

    let err = a.gateway.connect(a.address.clone()).await.unwrap_err();
    assert!(matches!(err, crest_gateway::Error::SelfDial));
    assert!(a.gateway.peers().await.is_empty());

    // A later manual connect still fails the same way instead of
    // turning us into our own peer.
    let err = a.gateway.connect(a.address.clone()).await.unwrap_err();
    assert!(matches!(err, crest_gateway::Error::SelfDial));

    a.gateway.close().await;
}

#[tokio::test]
async fn disconnect_removes_peer_on_both_sides() {
    let a = spawn_gateway(vec![]).await;
    let b = spawn_gateway(vec![]).await;

    a.gateway.connect(b.address.clone()).await.unwrap();
    wait_for("b to accept the peer", Duration::from_secs(5), || async {
        b.gateway.peers().await.len() == 1
    })
    .await;

    a.gateway.disconnect(&b.address).await.unwrap();
    assert!(a.gateway.peers().await.is_empty());

    // The session closure propagates to b's listener.
    wait_for("b to drop the peer", Duration::from_secs(5), || async {
        b.gateway.peers().await.is_empty()
    })
    .await;

    a.gateway.close().await;
    b.gateway.close().await;
}

#[tokio::test]
async fn discover_ip_reports_observed_host() {
    let a = spawn_gateway(vec![]).await;
    let b = spawn_gateway(vec![]).await;

    a.gateway.connect(b.address.clone()).await.unwrap();
    let host = a.gateway.discover_address(&b.address).await.unwrap();
    assert_eq!(host, "127.0.0.1");

    a.gateway.close().await;
    b.gateway.close().await;
}

#[tokio::test]
async fn bootstrap_mesh_reaches_well_connected() {
    let seed = spawn_gateway(vec![]).await;

    let mut members = Vec::new();
    for _ in 0..4 {
        members.push(spawn_gateway(vec![seed.address.clone()]).await);
    }

    // Every member learns more addresses via the ShareNodes init-RPC and
    // the peer manager keeps dialing until the outbound target is met.
    wait_for(
        "every member to reach the outbound target",
        Duration::from_secs(60),
        || async {
            for member in &members {
                if member.gateway.outbound_count().await < 2 {
                    return false;
                }
            }
            true
        },
    )
    .await;

    // Kill one member; survivors restore the invariant.
    let killed = members.pop().unwrap();
    killed.gateway.close().await;

    wait_for(
        "survivors to restore the outbound target",
        Duration::from_secs(60),
        || async {
            for member in &members {
                if member.gateway.outbound_count().await < 2 {
                    return false;
                }
            }
            true
        },
    )
    .await;

    for member in members {
        member.gateway.close().await;
    }
    seed.gateway.close().await;
}

#[tokio::test]
async fn kicking_prefers_same_host_and_spares_outbound() {
    // Tiny fully-connected threshold so the third inbound peer forces a
    // kick. All peers share the host 127.0.0.1, so the same-host rule
    // picks some inbound victim, never the outbound peer.
    let hub = spawn_gateway_with(vec![], |config| {
        config.fully_connected_threshold = 2;
    })
    .await;

    let outbound_target = spawn_gateway(vec![]).await;
    hub.gateway.connect(outbound_target.address.clone()).await.unwrap();

    let inbound_a = spawn_gateway(vec![]).await;
    inbound_a.gateway.connect(hub.address.clone()).await.unwrap();
    wait_for("hub to hold two peers", Duration::from_secs(5), || async {
        hub.gateway.peers().await.len() == 2
    })
    .await;

    let inbound_b = spawn_gateway(vec![]).await;
    inbound_b.gateway.connect(hub.address.clone()).await.unwrap();

    wait_for(
        "hub to kick an inbound peer",
        Duration::from_secs(5),
        || async {
            let peers = hub.gateway.peers().await;
            peers.len() == 2
                && peers.iter().any(|p| !p.inbound)
                && peers.iter().any(|p| p.inbound)
        },
    )
    .await;

    // The outbound peer survived the kick.
    let peers = hub.gateway.peers().await;
    assert!(peers.iter().any(|p| p.address == outbound_target.address));

    hub.gateway.close().await;
    outbound_target.gateway.close().await;
    inbound_a.gateway.close().await;
    inbound_b.gateway.close().await;
}

#[tokio::test]
async fn rpc_streams_reach_registered_handlers() {
    use std::sync::Arc;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Echo;

    #[async_trait::async_trait]
    impl crest_gateway::RpcHandler for Echo {
        async fn handle(
            &self,
            mut stream: crest_gateway::mux::Stream,
            _remote: crest_types::NetAddress,
        ) -> Result<(), crest_gateway::Error> {
            let mut payload = Vec::new();
            stream.read_to_end(&mut payload).await?;
            stream.write_all(&payload).await?;
            stream.shutdown().await?;
            Ok(())
        }
    }

    let a = spawn_gateway(vec![]).await;
    let b = spawn_gateway(vec![]).await;
    b.gateway.register_rpc("Echo", Arc::new(Echo));

    a.gateway.connect(b.address.clone()).await.unwrap();

    let mut stream = a.gateway.open_rpc(&b.address, "Echo").await.unwrap();
    stream.write_all(b"over the mesh").await.unwrap();
    stream.shutdown().await.unwrap();

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"over the mesh");

    a.gateway.close().await;
    b.gateway.close().await;
}
