//! Consensus node - wires the ledger to the network and drives finality
//!
//! Each tick the node makes sure the current view has a preferred root
//! candidate (proposing nop transactions until a critical one shows up),
//! polls a sample of peers with it and finalizes once the resolver has
//! decided. Every `sync_every` ticks it also checks whether its peers have
//! moved past its view and, if a quorum agrees on a newer root, catches up
//! by replaying their state diff.

use crate::broadcast::Broadcaster;
use crate::error::{LedgerError, NetworkError};
use crate::handlers::Protocol;
use crate::ledger::Ledger;
use crate::peer::{PeerClient, PeerServer, PeerSet};
use crate::resolver::ResolverParams;
use crate::syncer::Syncer;
use crate::types::{ConsensusConfig, ConsensusStats};
use ledger_state::{AccountId, Round, TransactionId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Ticks between attempts to redial missing peers
const REDIAL_EVERY: u64 = 10;

/// A node taking part in consensus
pub struct ConsensusNode {
    config: ConsensusConfig,
    ledger: Arc<Ledger>,
    broadcaster: Arc<Broadcaster>,
    syncer: Arc<Syncer>,
    protocol: Arc<Protocol>,
    server: PeerServer,
    stats: RwLock<ConsensusStats>,
}

impl ConsensusNode {
    pub fn new(config: ConsensusConfig, ledger: Arc<Ledger>) -> Self {
        let peers = Arc::new(PeerSet::new());
        let broadcaster = Arc::new(Broadcaster::new(peers, config.resolver.k));
        let syncer = Arc::new(Syncer::new(config.resolver, ledger.view_id()));
        let protocol = Arc::new(Protocol::new(
            ledger.clone(),
            broadcaster.clone(),
            syncer.clone(),
        ));
        let server = PeerServer::new(protocol.clone());

        Self {
            config,
            ledger,
            broadcaster,
            syncer,
            protocol,
            server,
            stats: RwLock::new(ConsensusStats::default()),
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

    pub fn protocol(&self) -> &Arc<Protocol> {
        &self.protocol
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    /// Start the peer server and dial the configured peers. Peers that
    /// cannot be reached yet are retried from [`ConsensusNode::run`].
    pub async fn start(&self) -> anyhow::Result<SocketAddr> {
        let local_addr = self.server.start(&self.config.listen_addr).await?;
        self.reconnect_peers().await;

        tracing::info!(
            "Consensus node started on {}, {} peers connected, view {}",
            local_addr,
            self.broadcaster.peers().len(),
            self.ledger.view_id()
        );
        Ok(local_addr)
    }

    /// Dial `addr` and add it to the peer set
    pub async fn connect_peer(&self, addr: SocketAddr) -> Result<(), NetworkError> {
        let timeout = Duration::from_millis(self.config.request_timeout_ms);
        let client = tokio::time::timeout(timeout, PeerClient::connect(addr, timeout))
            .await
            .map_err(|_| NetworkError::Timeout)??;
        self.broadcaster.peers().insert(client);
        Ok(())
    }

    /// Dial every configured peer without an open connection, whether it
    /// was never reached or has since dropped. Returns how many connected.
    pub async fn reconnect_peers(&self) -> usize {
        let mut connected = 0;

        for peer in &self.config.peers {
            let Some(addr) = resolve(peer).await else {
                tracing::warn!("Could not resolve peer address {}", peer);
                continue;
            };

            let open = self
                .broadcaster
                .peers()
                .get(&addr)
                .is_some_and(|client| !client.is_closed());
            if open {
                continue;
            }

            match self.connect_peer(addr).await {
                Ok(()) => connected += 1,
                Err(e) => tracing::debug!("Peer {} not reachable: {}", addr, e),
            }
        }

        connected
    }

    /// Create a nop for the current view, admit it locally and gossip it
    async fn propose(&self) {
        let tx = self.ledger.create_nop(self.config.node_id);
        if let Err(e) = self.ledger.receive_transaction(tx.clone()) {
            tracing::warn!("Own nop transaction {} rejected: {}", tx.id, e);
            return;
        }

        match self.broadcaster.broadcast(&tx).await {
            Ok(votes) => {
                self.stats.write().transactions_broadcast += 1;
                tracing::trace!("Nop {} got {} positive votes", tx.id, votes);
            }
            Err(e) => tracing::debug!("Broadcast of nop {} failed: {}", tx.id, e),
        }
    }

    /// One consensus tick. Returns the round finalized by this tick, if any.
    pub async fn step(&self) -> Result<Option<Round>, LedgerError> {
        if self.broadcaster.is_paused() {
            return Ok(None);
        }

        let view_id = self.ledger.view_id();
        let resolver = self.ledger.resolver();

        if resolver.preferred().is_none() {
            match self.ledger.critical_candidate() {
                Some(tx) => {
                    if resolver.prefer(tx.id) {
                        tracing::debug!(
                            "Preferring own critical transaction {} in view {}",
                            tx.id,
                            view_id
                        );
                    }
                }
                None => {
                    self.propose().await;
                    return Ok(None);
                }
            }
        }

        let Some(preferred) = resolver.preferred() else {
            return Ok(None);
        };
        let Some(candidate) = self.ledger.transaction(&preferred) else {
            tracing::debug!("Preferred transaction {} is not known locally", preferred);
            return Ok(None);
        };

        if candidate.view_id != view_id {
            tracing::warn!(
                "Dropping preference {} from view {} while in view {}",
                preferred,
                candidate.view_id,
                view_id
            );
            resolver.reset(view_id);
            return Ok(None);
        }

        let responses = self.broadcaster.query(&candidate).await;
        self.stats.write().queries_sent += 1;
        resolver.record_poll(&responses);

        if !resolver.decided() {
            return Ok(None);
        }

        match self.ledger.finalize(preferred) {
            Ok(round) => {
                self.stats.write().rounds_finalized += 1;
                self.syncer.ensure_view(self.ledger.view_id());
                Ok(Some(round))
            }
            Err(LedgerError::RootViewMismatch { expected, got }) => {
                tracing::warn!(
                    "Decided root {} is from view {}, ledger is at {}",
                    preferred,
                    got,
                    expected
                );
                resolver.reset(expected);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Ask peers for their latest root and catch up if a quorum of them
    /// agrees on a root past our view. Returns whether the ledger moved.
    pub async fn sync_once(&self) -> Result<bool, LedgerError> {
        if self.broadcaster.is_paused() {
            return Ok(false);
        }

        let local_view = self.ledger.view_id();
        let answers = self.broadcaster.sync_view(&self.ledger.root()).await;
        if answers.is_empty() {
            return Ok(false);
        }

        let quorum = sync_quorum(&self.config.resolver, answers.len());
        let mut tally: HashMap<TransactionId, (Round, Vec<SocketAddr>)> = HashMap::new();
        for (peer, round) in &answers {
            if round.view_id >= local_view {
                tally
                    .entry(round.id())
                    .or_insert_with(|| (round.clone(), Vec::new()))
                    .1
                    .push(*peer);
            }
        }

        let Some((target, holders)) = tally
            .into_values()
            .filter(|(_, holders)| holders.len() >= quorum)
            .max_by_key(|(round, holders)| (holders.len(), round.view_id))
        else {
            return Ok(false);
        };

        tracing::info!(
            "{} of {} peers are at root {} (view {}), syncing from view {}",
            holders.len(),
            answers.len(),
            target.id(),
            target.view_id,
            local_view
        );

        self.broadcaster.pause();
        let result = self.fetch_and_apply(&holders, local_view).await;
        self.broadcaster.resume();
        self.syncer.reset(self.ledger.view_id());

        result
    }

    async fn fetch_and_apply(
        &self,
        holders: &[SocketAddr],
        local_view: u64,
    ) -> Result<bool, LedgerError> {
        for peer in holders {
            let response = match self.broadcaster.sync_diff(*peer, local_view).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!("Fetching diff from {} failed: {}", peer, e);
                    continue;
                }
            };

            let Some(root) = response.root else {
                tracing::debug!("Peer {} is paused, trying next", peer);
                continue;
            };

            match self.ledger.apply_sync(root, &response.diff) {
                Ok(()) => {
                    self.stats.write().syncs_completed += 1;
                    return Ok(true);
                }
                Err(e @ (LedgerError::Storage(_) | LedgerError::Kv(_))) => return Err(e),
                Err(e) => tracing::warn!("Diff from {} rejected: {}", peer, e),
            }
        }

        Ok(false)
    }

    /// Tick until a storage failure stops the node
    pub async fn run(&self) -> Result<(), LedgerError> {
        let period = Duration::from_millis(self.config.query_interval_ms.max(1));
        let mut interval = tokio::time::interval(period);
        let mut ticks: u64 = 0;

        loop {
            interval.tick().await;
            ticks += 1;

            if ticks % REDIAL_EVERY == 0 {
                self.reconnect_peers().await;
            }

            if self.config.sync_every > 0 && ticks % self.config.sync_every == 0 {
                self.sync_once().await?;
            }

            if let Some(round) = self.step().await? {
                tracing::debug!("Tick {} finalized view {}", ticks, round.view_id);
            }
        }
    }

    /// Get current stats
    pub fn stats(&self) -> ConsensusStats {
        let mut stats = self.stats.read().clone();
        stats.view_id = self.ledger.view_id();
        stats.connected_peers = self.broadcaster.peers().len();
        stats
    }
}

/// Answers that must agree on a newer root before syncing to it
fn sync_quorum(params: &ResolverParams, answers: usize) -> usize {
    let needed = (params.alpha * answers as f64).ceil() as usize;
    needed.max(1)
}

async fn resolve(addr: &str) -> Option<SocketAddr> {
    if let Ok(addr) = addr.parse() {
        return Some(addr);
    }
    tokio::net::lookup_host(addr).await.ok()?.next()
}

/// Builder for ConsensusNode
pub struct ConsensusNodeBuilder {
    config: ConsensusConfig,
}

impl ConsensusNodeBuilder {
    pub fn new() -> Self {
        Self {
            config: ConsensusConfig::default(),
        }
    }

    pub fn config(mut self, config: ConsensusConfig) -> Self {
        self.config = config;
        self
    }

    pub fn listen_addr(mut self, addr: &str) -> Self {
        self.config.listen_addr = addr.to_string();
        self
    }

    pub fn peer(mut self, addr: &str) -> Self {
        self.config.peers.push(addr.to_string());
        self
    }

    pub fn node_id(mut self, id: AccountId) -> Self {
        self.config.node_id = id;
        self
    }

    pub fn resolver(mut self, params: ResolverParams) -> Self {
        self.config.resolver = params;
        self
    }

    pub fn query_interval_ms(mut self, ms: u64) -> Self {
        self.config.query_interval_ms = ms;
        self
    }

    pub fn sync_every(mut self, ticks: u64) -> Self {
        self.config.sync_every = ticks;
        self
    }

    pub fn build(self, ledger: Arc<Ledger>) -> ConsensusNode {
        ConsensusNode::new(self.config, ledger)
    }
}

impl Default for ConsensusNodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
