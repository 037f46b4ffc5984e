//! Two nodes over real WebSocket connections
//!
//! Tests:
//! - Request/response matching and timeouts on a peer connection
//! - A node finalizing a round by polling its peer
//! - The peer following through its own polls
//! - A lagging node catching up through SyncView/SyncDiff
//! - Redialing a peer that was not up when the node started

use std::sync::Arc;
use std::time::Duration;

use ledger_state::{Identifier, MemoryStore};
use tokio::net::TcpListener;

use crate::{
    driver::{ConsensusNode, ConsensusNodeBuilder},
    error::NetworkError,
    ledger::{Genesis, GenesisAccount, Ledger, LedgerParams},
    peer::PeerClient,
    resolver::ResolverParams,
};

fn resolver_params() -> ResolverParams {
    ResolverParams {
        k: 4,
        alpha: 0.8,
        beta: 2,
    }
}

fn genesis() -> Genesis {
    Genesis {
        accounts: vec![GenesisAccount {
            id: Identifier::hash(b"alice"),
            balance: 1_000,
            stake: 100,
        }],
    }
}

fn ledger() -> Arc<Ledger> {
    let params = LedgerParams {
        difficulty: 0,
        resolver: resolver_params(),
        retained_views: 8,
    };
    Arc::new(Ledger::open(Arc::new(MemoryStore::new()), &genesis(), params).unwrap())
}

fn node(name: &str) -> ConsensusNode {
    node_at(name, "127.0.0.1:0", &[])
}

fn node_at(name: &str, listen_addr: &str, peers: &[String]) -> ConsensusNode {
    let mut builder = ConsensusNodeBuilder::new()
        .listen_addr(listen_addr)
        .node_id(Identifier::hash(name.as_bytes()))
        .resolver(resolver_params());
    for peer in peers {
        builder = builder.peer(peer);
    }
    builder.build(ledger())
}

/// Start both nodes and connect them in both directions
async fn pair() -> (ConsensusNode, ConsensusNode) {
    let a = node("a");
    let b = node("b");
    let a_addr = a.start().await.unwrap();
    let b_addr = b.start().await.unwrap();

    a.connect_peer(b_addr).await.unwrap();
    b.connect_peer(a_addr).await.unwrap();
    (a, b)
}

/// Step `node` until it finalizes a round
async fn step_until_finalized(node: &ConsensusNode) -> ledger_state::Round {
    for _ in 0..16 {
        if let Some(round) = node.step().await.unwrap() {
            return round;
        }
    }
    panic!("node did not finalize");
}

#[tokio::test]
async fn test_request_roundtrip() {
    let (a, b) = pair().await;
    let client = a.broadcaster().peers().connected().pop().unwrap();

    let root = client.sync_view(a.ledger().root()).await.unwrap().root.unwrap();
    assert_eq!(root, b.ledger().root());

    let tx = a.ledger().create_nop(Identifier::hash(b"a"));
    let (vote, preferred) = tokio::join!(client.gossip(tx.clone()), client.query(tx.clone()));
    assert!(vote.unwrap().vote);
    assert_eq!(preferred.unwrap().preferred, tx.id);
}

#[tokio::test]
async fn test_unanswered_request_times_out() {
    // Accepts the WebSocket handshake but never answers
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let _ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let client = PeerClient::connect(addr, Duration::from_millis(100)).await.unwrap();
    let result = client.sync_diff(1).await;
    assert!(matches!(result, Err(NetworkError::Timeout)));
}

#[tokio::test]
async fn test_connect_to_closed_port_fails() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = PeerClient::connect(addr, Duration::from_millis(100)).await;
    assert!(matches!(result, Err(NetworkError::Connect { .. })));
}

#[tokio::test]
async fn test_two_nodes_finalize_same_root() {
    let (a, b) = pair().await;

    let round = step_until_finalized(&a).await;
    assert_eq!(round.view_id, 1);
    assert_eq!(a.ledger().view_id(), 2);

    // b committed to the same candidate when a queried it
    assert_eq!(b.ledger().resolver().preferred(), Some(round.id()));

    let follow = step_until_finalized(&b).await;
    assert_eq!(follow.id(), round.id());
    assert_eq!(b.ledger().root(), a.ledger().root());
    assert_eq!(b.ledger().snapshot(), a.ledger().snapshot());

    let stats = a.stats();
    assert_eq!(stats.view_id, 2);
    assert_eq!(stats.rounds_finalized, 1);
    assert_eq!(stats.connected_peers, 1);
    assert!(stats.queries_sent >= 2);
}

#[tokio::test]
async fn test_lagging_node_syncs() {
    let (a, b) = pair().await;

    step_until_finalized(&a).await;
    assert_eq!(b.ledger().view_id(), 1);

    assert!(b.sync_once().await.unwrap());
    assert!(!b.broadcaster().is_paused());
    assert_eq!(b.ledger().view_id(), a.ledger().view_id());
    assert_eq!(b.ledger().root(), a.ledger().root());
    assert_eq!(b.ledger().snapshot(), a.ledger().snapshot());
    assert_eq!(b.stats().syncs_completed, 1);

    // Nothing left to catch up on
    assert!(!b.sync_once().await.unwrap());
}

#[tokio::test]
async fn test_peer_started_later_is_redialed() {
    // Reserve an address for b, then free it so a cannot reach it yet
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let b_addr = listener.local_addr().unwrap();
    drop(listener);

    let a = node_at("a", "127.0.0.1:0", &[b_addr.to_string()]);
    a.start().await.unwrap();
    assert_eq!(a.stats().connected_peers, 0);
    assert!(a.step().await.unwrap().is_none());

    let b = node_at("b", &b_addr.to_string(), &[]);
    assert_eq!(b.start().await.unwrap(), b_addr);

    assert_eq!(a.reconnect_peers().await, 1);
    assert_eq!(a.stats().connected_peers, 1);

    // Already connected peers are left alone
    assert_eq!(a.reconnect_peers().await, 0);

    let round = step_until_finalized(&a).await;
    assert_eq!(round.view_id, 1);
    assert_eq!(a.stats().rounds_finalized, 1);
}
