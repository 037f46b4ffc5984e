//! Syncer - tracks the roots peers advertise and which one to sync to

use crate::resolver::{Resolver, ResolverParams};
use dashmap::DashMap;
use ledger_state::{Round, TransactionId};
use std::net::SocketAddr;

/// Candidate roots learned through SyncView exchanges
pub struct Syncer {
    /// Root id each peer last advertised
    peer_roots: DashMap<SocketAddr, TransactionId>,
    /// Advertised rounds by id
    roots: DashMap<TransactionId, Round>,
    /// Preference among advertised roots
    resolver: Resolver,
}

impl Syncer {
    pub fn new(params: ResolverParams, view_id: u64) -> Self {
        Self {
            peer_roots: DashMap::new(),
            roots: DashMap::new(),
            resolver: Resolver::new(params, view_id),
        }
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Record that `peer` advertised `round`. A round already cached under
    /// the same id is kept as is.
    pub fn add_root_if_not_exists(&self, peer: SocketAddr, round: Round) {
        let id = round.id();
        self.peer_roots.insert(peer, id);
        self.roots.entry(id).or_insert(round);
    }

    pub fn get_root_by_id(&self, id: &TransactionId) -> Option<Round> {
        self.roots.get(id).map(|r| r.value().clone())
    }

    /// Root last advertised by `peer`
    pub fn peer_root(&self, peer: &SocketAddr) -> Option<TransactionId> {
        self.peer_roots.get(peer).map(|r| *r.value())
    }

    pub fn known_roots(&self) -> usize {
        self.roots.len()
    }

    /// Start over once the ledger has moved to another view
    pub fn ensure_view(&self, view_id: u64) {
        if self.resolver.view_id() != view_id {
            self.reset(view_id);
        }
    }

    /// Forget every advertised root and preference
    pub fn reset(&self, view_id: u64) {
        self.peer_roots.clear();
        self.roots.clear();
        self.resolver.reset(view_id);
        tracing::debug!("Syncer reset for view {}", view_id);
    }
}
