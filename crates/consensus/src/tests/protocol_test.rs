//! Handler tests
//!
//! Exercises the four exchanges directly through `Protocol::dispatch`:
//! - Gossip votes and idempotent re-gossip
//! - Query preference commitment and previous-view answers
//! - Queries about transactions whose id does not match their contents
//! - SyncView root tracking and preference
//! - SyncDiff payloads that a lagging ledger can replay
//! - Empty answers while paused

use std::net::SocketAddr;
use std::sync::Arc;

use ledger_state::{Identifier, MemoryStore, StateDiff, Transaction};

use crate::{
    broadcast::Broadcaster,
    error::LedgerError,
    handlers::Protocol,
    ledger::{Genesis, GenesisAccount, Ledger, LedgerParams},
    peer::PeerSet,
    processor::TAG_NOP,
    resolver::ResolverParams,
    syncer::Syncer,
    types::*,
};

const EASY: u64 = 0;
/// No realistic transaction reaches this many leading zero bits
const IMPOSSIBLE: u64 = 255;

fn genesis() -> Genesis {
    Genesis {
        accounts: vec![GenesisAccount {
            id: Identifier::hash(b"alice"),
            balance: 500,
            stake: 0,
        }],
    }
}

fn ledger(difficulty: u64) -> Arc<Ledger> {
    let params = LedgerParams {
        difficulty,
        resolver: ResolverParams::default(),
        retained_views: 8,
    };
    Arc::new(Ledger::open(Arc::new(MemoryStore::new()), &genesis(), params).unwrap())
}

fn protocol(ledger: Arc<Ledger>) -> Protocol {
    let broadcaster = Arc::new(Broadcaster::new(Arc::new(PeerSet::new()), 10));
    let syncer = Arc::new(Syncer::new(ResolverParams::default(), ledger.view_id()));
    Protocol::new(ledger, broadcaster, syncer)
}

fn peer() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 4000))
}

fn gossip(protocol: &Protocol, tx: Transaction) -> bool {
    match protocol.dispatch(peer(), Request::Gossip(GossipRequest { tx })) {
        Response::Gossip(response) => response.vote,
        other => panic!("unexpected response {:?}", other.opcode()),
    }
}

fn query(protocol: &Protocol, tx: Transaction) -> Identifier {
    match protocol.dispatch(peer(), Request::Query(QueryRequest { tx })) {
        Response::Query(response) => response.preferred,
        other => panic!("unexpected response {:?}", other.opcode()),
    }
}

/// Finalize one nop so the ledger moves to the next view
fn advance(ledger: &Ledger) {
    let tx = ledger.create_nop(Identifier::hash(b"driver"));
    ledger.receive_transaction(tx.clone()).unwrap();
    ledger.finalize(tx.id).unwrap();
}

#[test]
fn test_gossip_votes() {
    let ledger = ledger(EASY);
    let protocol = protocol(ledger.clone());

    let tx = ledger.create_nop(Identifier::hash(b"alice"));
    assert!(gossip(&protocol, tx.clone()));
    assert!(gossip(&protocol, tx));
    assert_eq!(ledger.pool_len(), 1);
}

#[test]
fn test_gossip_rejection_is_repeatable() {
    let ledger = ledger(EASY);
    let protocol = protocol(ledger.clone());

    let dangling = Transaction::new(
        Identifier::hash(b"alice"),
        0,
        vec![Identifier::hash(b"nowhere")],
        ledger.view_id(),
        TAG_NOP,
        Vec::new(),
    );

    assert!(!gossip(&protocol, dangling.clone()));
    assert!(!gossip(&protocol, dangling));
    assert_eq!(ledger.pool_len(), 0);
}

#[test]
fn test_query_commits_first_critical_transaction() {
    let ledger = ledger(EASY);
    let protocol = protocol(ledger.clone());

    let first = ledger.create_nop(Identifier::hash(b"a"));
    let second = ledger.create_nop(Identifier::hash(b"b"));

    assert_eq!(query(&protocol, first.clone()), first.id);
    assert_eq!(query(&protocol, second.clone()), first.id);
    assert_eq!(ledger.resolver().preferred(), Some(first.id));

    // Candidates learned from queries can become the round root
    let round = ledger.finalize(first.id).unwrap();
    assert_eq!(round.id(), first.id);
}

#[test]
fn test_query_with_mismatched_id_is_ignored() {
    let ledger = ledger(EASY);
    let protocol = protocol(ledger.clone());

    let mut forged = ledger.create_nop(Identifier::hash(b"mallory"));
    forged.id = Identifier::hash(b"claimed");

    assert_eq!(query(&protocol, forged.clone()), Identifier::ZERO);
    assert_eq!(ledger.resolver().preferred(), None);
    assert_eq!(ledger.transaction(&forged.id), None);
    assert!(matches!(
        ledger.finalize(forged.id),
        Err(LedgerError::UnknownTransaction(id)) if id == forged.id
    ));

    // An honest transaction is still committed afterwards
    let honest = ledger.create_nop(Identifier::hash(b"a"));
    assert_eq!(query(&protocol, honest.clone()), honest.id);
}

#[test]
fn test_query_without_critical_transaction() {
    let ledger = ledger(IMPOSSIBLE);
    let protocol = protocol(ledger.clone());

    let tx = ledger.create_nop(Identifier::hash(b"a"));
    assert_eq!(query(&protocol, tx), Identifier::ZERO);
    assert_eq!(ledger.resolver().preferred(), None);
}

#[test]
fn test_query_about_previous_view_answers_root() {
    let ledger = ledger(EASY);
    let protocol = protocol(ledger.clone());

    let stale = ledger.create_nop(Identifier::hash(b"a"));
    advance(&ledger);
    let root_id = ledger.root().id();

    let current = ledger.create_nop(Identifier::hash(b"b"));
    assert_eq!(query(&protocol, current.clone()), current.id);

    // Answered with the root whatever the resolver holds
    assert_eq!(query(&protocol, stale), root_id);
    assert_eq!(ledger.resolver().preferred(), Some(current.id));
}

#[test]
fn test_query_never_prefers_current_root() {
    let ledger = ledger(EASY);
    let protocol = protocol(ledger.clone());

    let root = ledger.root();
    assert_eq!(query(&protocol, root.root.clone()), root.id());
    assert_eq!(ledger.resolver().preferred(), None);
}

#[test]
fn test_sync_view_prefers_newer_root() {
    let behind = ledger(EASY);
    let ahead = ledger(EASY);
    advance(&ahead);
    advance(&ahead);

    let protocol = protocol(behind.clone());

    let response = protocol.handle_sync_view(peer(), SyncViewRequest { root: ahead.root() });
    assert_eq!(response.root, Some(ahead.root()));
    assert_eq!(protocol.syncer().resolver().preferred(), Some(ahead.root().id()));
    assert_eq!(protocol.syncer().peer_root(&peer()), Some(ahead.root().id()));

    // Repeating the advertisement changes nothing
    let again = protocol.handle_sync_view(peer(), SyncViewRequest { root: ahead.root() });
    assert_eq!(again.root, Some(ahead.root()));
    assert_eq!(protocol.syncer().known_roots(), 1);
}

#[test]
fn test_sync_view_with_older_root_answers_local_root() {
    let behind = ledger(EASY);
    let ahead = ledger(EASY);
    advance(&ahead);

    let protocol = protocol(ahead.clone());
    let response = protocol.handle_sync_view(peer(), SyncViewRequest { root: behind.root() });

    assert_eq!(response.root, Some(ahead.root()));
    assert_eq!(protocol.syncer().resolver().preferred(), None);
}

#[test]
fn test_sync_diff_brings_peer_up_to_date() {
    let ahead = ledger(EASY);
    let behind = ledger(EASY);
    advance(&ahead);
    advance(&ahead);

    let protocol = protocol(ahead.clone());
    let response = match protocol.dispatch(
        peer(),
        Request::SyncDiff(SyncDiffRequest {
            view_id: behind.view_id(),
        }),
    ) {
        Response::SyncDiff(response) => response,
        other => panic!("unexpected response {:?}", other.opcode()),
    };

    let root = response.root.unwrap();
    assert_eq!(root, ahead.root());
    assert!(!StateDiff::from_bytes(&response.diff).unwrap().full);

    behind.apply_sync(root, &response.diff).unwrap();
    assert_eq!(behind.snapshot(), ahead.snapshot());
    assert_eq!(behind.view_id(), ahead.view_id());
}

#[test]
fn test_paused_handlers_answer_empty() {
    let ledger = ledger(EASY);
    let protocol = protocol(ledger.clone());
    protocol.broadcaster().pause();

    let tx = ledger.create_nop(Identifier::hash(b"a"));
    assert!(!gossip(&protocol, tx.clone()));
    assert_eq!(query(&protocol, tx), Identifier::ZERO);
    assert_eq!(
        protocol.handle_sync_view(peer(), SyncViewRequest { root: ledger.root() }),
        SyncViewResponse::default()
    );
    assert_eq!(
        protocol.handle_sync_diff(SyncDiffRequest { view_id: 0 }),
        SyncDiffResponse::default()
    );

    // Nothing was touched
    assert_eq!(ledger.pool_len(), 0);
    assert_eq!(ledger.resolver().preferred(), None);
    assert_eq!(protocol.syncer().known_roots(), 0);

    protocol.broadcaster().resume();
    let tx = ledger.create_nop(Identifier::hash(b"a"));
    assert!(gossip(&protocol, tx));
}
