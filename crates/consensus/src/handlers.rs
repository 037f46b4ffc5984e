//! Inbound request handlers
//!
//! `Protocol` is built once at startup and shared by every connection
//! task. Each handler turns one request into exactly one response and
//! never blocks on I/O; the connection task writes the response back.

use crate::broadcast::Broadcaster;
use crate::ledger::Ledger;
use crate::syncer::Syncer;
use crate::types::{
    GossipRequest, GossipResponse, QueryRequest, QueryResponse, Request, Response,
    SyncDiffRequest, SyncDiffResponse, SyncViewRequest, SyncViewResponse,
};
use ledger_state::Identifier;
use std::net::SocketAddr;
use std::sync::Arc;

/// Everything a handler needs, passed explicitly
pub struct Protocol {
    ledger: Arc<Ledger>,
    broadcaster: Arc<Broadcaster>,
    syncer: Arc<Syncer>,
}

impl Protocol {
    pub fn new(ledger: Arc<Ledger>, broadcaster: Arc<Broadcaster>, syncer: Arc<Syncer>) -> Self {
        Self {
            ledger,
            broadcaster,
            syncer,
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn syncer(&self) -> &Arc<Syncer> {
        &self.syncer
    }

    /// Route a request from `peer` to its handler
    pub fn dispatch(&self, peer: SocketAddr, request: Request) -> Response {
        match request {
            Request::Gossip(req) => Response::Gossip(self.handle_gossip(req)),
            Request::Query(req) => Response::Query(self.handle_query(req)),
            Request::SyncView(req) => Response::SyncView(self.handle_sync_view(peer, req)),
            Request::SyncDiff(req) => Response::SyncDiff(self.handle_sync_diff(req)),
        }
    }

    /// Vote on whether `req.tx` is admissible
    pub fn handle_gossip(&self, req: GossipRequest) -> GossipResponse {
        if self.broadcaster.is_paused() {
            return GossipResponse::default();
        }

        let tx_id = req.tx.id;
        match self.ledger.receive_transaction(req.tx) {
            Ok(()) => {
                tracing::debug!("Gave a positive vote to transaction {}", tx_id);
                GossipResponse { vote: true }
            }
            Err(e) => {
                tracing::warn!("Gave a negative vote to transaction {}: {}", tx_id, e);
                GossipResponse { vote: false }
            }
        }
    }

    /// Answer a finality query with our preferred transaction.
    ///
    /// A critical transaction offered while we have no preference becomes
    /// our preference. A query about the previous view is answered with
    /// the root that closed it. Transactions whose id does not match their
    /// contents get the zero identifier.
    pub fn handle_query(&self, req: QueryRequest) -> QueryResponse {
        if self.broadcaster.is_paused() {
            return QueryResponse::default();
        }

        let tx = req.tx;
        if tx.compute_id() != tx.id {
            tracing::warn!("Ignoring finality query about {}: id does not match contents", tx.id);
            return QueryResponse::default();
        }

        let (root, view_id) = self.ledger.root_and_view();
        let resolver = self.ledger.resolver();

        if tx.is_critical(self.ledger.difficulty())
            && resolver.preferred().is_none()
            && tx.id != root.id()
        {
            let id = tx.id;
            if self.ledger.note_candidate(tx.clone()) && resolver.prefer(id) {
                tracing::debug!("Preferring critical transaction {} in view {}", id, view_id);
            }
        }

        let preferred = if view_id.checked_sub(1) == Some(tx.view_id) {
            root.id()
        } else {
            resolver.preferred().unwrap_or(Identifier::ZERO)
        };

        tracing::debug!(
            "Responded to finality query in view {} with {}",
            view_id,
            preferred
        );
        QueryResponse { preferred }
    }

    /// Learn the peer's root and answer with the round we converge on
    pub fn handle_sync_view(&self, peer: SocketAddr, req: SyncViewRequest) -> SyncViewResponse {
        if self.broadcaster.is_paused() {
            return SyncViewResponse::default();
        }

        let local_view = self.ledger.view_id();
        self.syncer.ensure_view(local_view);

        let advertised = req.root;
        let advertised_id = advertised.id();
        let advertised_view = advertised.view_id;
        self.syncer.add_root_if_not_exists(peer, advertised);

        let resolver = self.syncer.resolver();
        if local_view < advertised_view
            && resolver.preferred().is_none()
            && resolver.prefer(advertised_id)
        {
            tracing::debug!(
                "Preferring sync root {} (view {}) advertised by {}",
                advertised_id,
                advertised_view,
                peer
            );
        }

        let root = resolver
            .preferred()
            .and_then(|id| self.syncer.get_root_by_id(&id))
            .unwrap_or_else(|| self.ledger.root());

        SyncViewResponse { root: Some(root) }
    }

    /// Ship the state changes since the requester's view
    pub fn handle_sync_diff(&self, req: SyncDiffRequest) -> SyncDiffResponse {
        if self.broadcaster.is_paused() {
            return SyncDiffResponse::default();
        }

        let (root, diff) = self.ledger.dump_diff_with_root(req.view_id);
        tracing::debug!(
            "Serving {} byte diff since view {} up to root {}",
            diff.len(),
            req.view_id,
            root.id()
        );

        SyncDiffResponse {
            root: Some(root),
            diff,
        }
    }
}
