//! Broadcaster - outbound fan-out to connected peers
//!
//! Also owns the pause flag. While a sync is replacing local state the
//! node is paused and every inbound handler answers with an empty
//! response instead of reading state that is about to change.

use crate::error::NetworkError;
use crate::peer::PeerSet;
use crate::types::SyncDiffResponse;
use futures_util::future::join_all;
use ledger_state::{Identifier, Round, Transaction};
use rand::seq::SliceRandom;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Sends gossip, finality queries and sync requests to peers
pub struct Broadcaster {
    peers: Arc<PeerSet>,
    paused: AtomicBool,
    /// Peers sampled per finality query
    sample_size: usize,
    broadcasts: AtomicU64,
    queries: AtomicU64,
}

impl Broadcaster {
    pub fn new(peers: Arc<PeerSet>, sample_size: usize) -> Self {
        Self {
            peers,
            paused: AtomicBool::new(false),
            sample_size,
            broadcasts: AtomicU64::new(0),
            queries: AtomicU64::new(0),
        }
    }

    pub fn peers(&self) -> &Arc<PeerSet> {
        &self.peers
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
        tracing::debug!("Broadcaster paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        tracing::debug!("Broadcaster resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Transactions broadcast so far
    pub fn broadcasts(&self) -> u64 {
        self.broadcasts.load(Ordering::Relaxed)
    }

    /// Finality queries sent so far
    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    /// Gossip `tx` to every connected peer and count positive votes.
    ///
    /// A failing peer is logged and skipped. Fails only when no peer
    /// answered at all.
    pub async fn broadcast(&self, tx: &Transaction) -> Result<usize, NetworkError> {
        let peers = self.peers.connected();
        if peers.is_empty() {
            return Err(NetworkError::NoPeerReachable);
        }

        let results = join_all(peers.iter().map(|peer| peer.gossip(tx.clone()))).await;

        let mut answered = 0;
        let mut votes = 0;
        for (peer, result) in peers.iter().zip(results) {
            match result {
                Ok(response) => {
                    answered += 1;
                    if response.vote {
                        votes += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!("Gossip of {} to {} failed: {}", tx.id, peer.addr(), e);
                }
            }
        }

        if answered == 0 {
            return Err(NetworkError::NoPeerReachable);
        }

        self.broadcasts.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            "Broadcast {} to {} peers, {} positive votes",
            tx.id,
            answered,
            votes
        );
        Ok(votes)
    }

    /// Ask a random sample of peers which transaction they prefer for the
    /// view of `tx`. Peers that fail to answer count as the zero
    /// identifier.
    pub async fn query(&self, tx: &Transaction) -> Vec<Identifier> {
        let peers = self.peers.connected();
        let sample: Vec<_> = peers
            .choose_multiple(&mut rand::thread_rng(), self.sample_size)
            .cloned()
            .collect();

        let results = join_all(sample.iter().map(|peer| peer.query(tx.clone()))).await;
        self.queries.fetch_add(1, Ordering::Relaxed);

        sample
            .iter()
            .zip(results)
            .map(|(peer, result)| match result {
                Ok(response) => response.preferred,
                Err(e) => {
                    tracing::debug!("Query to {} failed: {}", peer.addr(), e);
                    Identifier::ZERO
                }
            })
            .collect()
    }

    /// Advertise `root` to every peer and collect the rounds they answer
    /// with. Paused and failing peers are left out.
    pub async fn sync_view(&self, root: &Round) -> Vec<(SocketAddr, Round)> {
        let peers = self.peers.connected();
        let results = join_all(peers.iter().map(|peer| peer.sync_view(root.clone()))).await;

        peers
            .iter()
            .zip(results)
            .filter_map(|(peer, result)| match result {
                Ok(response) => response.root.map(|round| (peer.addr(), round)),
                Err(e) => {
                    tracing::debug!("Sync view with {} failed: {}", peer.addr(), e);
                    None
                }
            })
            .collect()
    }

    /// Fetch the state diff since `view_id` from `peer`
    pub async fn sync_diff(
        &self,
        peer: SocketAddr,
        view_id: u64,
    ) -> Result<SyncDiffResponse, NetworkError> {
        let client = self.peers.get(&peer).ok_or(NetworkError::Closed)?;
        client.sync_diff(view_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pause_flag() {
        let broadcaster = Broadcaster::new(Arc::new(PeerSet::new()), 3);
        assert!(!broadcaster.is_paused());

        broadcaster.pause();
        assert!(broadcaster.is_paused());

        broadcaster.resume();
        assert!(!broadcaster.is_paused());
    }

    #[tokio::test]
    async fn test_broadcast_without_peers_fails() {
        let broadcaster = Broadcaster::new(Arc::new(PeerSet::new()), 3);
        let tx = Transaction::new(Identifier::ZERO, 0, vec![Identifier::ZERO], 1, 0, Vec::new());

        assert!(matches!(
            broadcaster.broadcast(&tx).await,
            Err(NetworkError::NoPeerReachable)
        ));
        assert!(broadcaster.query(&tx).await.is_empty());
        assert_eq!(broadcaster.broadcasts(), 0);
    }
}
