//! Ledger - account state, round history and the transaction pool
//!
//! The ledger is the single write serialization point of a node. It owns
//! the versioned state tree, the latest finalized round, the persisted
//! round ring, the pool of admitted transactions for the current view and
//! the resolver that picks the next round root.
//!
//! Locks are only held for in-memory work. Writers (finalize, sync) are
//! serialized by a separate commit lock so that persistence happens
//! outside the state lock.

use crate::error::{AdmissionRejected, LedgerError};
use crate::processor::{
    NopProcessor, StakeProcessor, TransactionProcessor, TransferProcessor, TAG_NOP, TAG_STAKE,
    TAG_TRANSFER,
};
use crate::resolver::{Resolver, ResolverParams};
use crate::types::ConsensusConfig;
use ledger_state::accounts::{
    read_account_nonce, write_account_balance, write_account_nonce, write_account_stake,
};
use ledger_state::rounds::{load_tree_checkpoint, store_tree_checkpoint};
use ledger_state::{
    load_rounds, store_round, AccountId, AccountRecord, KvStore, Round, RoundRing, Snapshot,
    StateDiff, Transaction, TransactionId, VersionedTree,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Most parents a locally created transaction references
const MAX_PARENTS: usize = 16;

/// Initial funds of one account
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisAccount {
    pub id: AccountId,
    #[serde(default)]
    pub balance: u64,
    #[serde(default)]
    pub stake: u64,
}

/// Account state written when a node starts from an empty store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Genesis {
    #[serde(default)]
    pub accounts: Vec<GenesisAccount>,
}

impl Genesis {
    pub fn from_json(json: &str) -> Result<Self, LedgerError> {
        serde_json::from_str(json).map_err(|e| LedgerError::Genesis(e.to_string()))
    }

    /// Read a genesis file. A missing file is an empty genesis.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(json) => Self::from_json(&json),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("Genesis file {:?} not found, starting with no accounts", path);
                Ok(Self::default())
            }
            Err(e) => Err(LedgerError::Genesis(format!("reading {:?}: {}", path, e))),
        }
    }

    pub fn apply(&self, state: &mut Snapshot) {
        for account in &self.accounts {
            write_account_balance(state, &account.id, account.balance);
            write_account_stake(state, &account.id, account.stake);
        }
    }
}

/// Ledger tuning
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LedgerParams {
    /// Leading zero bits that make a transaction critical
    pub difficulty: u64,
    pub resolver: ResolverParams,
    /// Older view snapshots kept for serving diffs
    pub retained_views: usize,
}

impl Default for LedgerParams {
    fn default() -> Self {
        Self::from(&ConsensusConfig::default())
    }
}

impl From<&ConsensusConfig> for LedgerParams {
    fn from(config: &ConsensusConfig) -> Self {
        Self {
            difficulty: config.difficulty,
            resolver: config.resolver,
            retained_views: config.retained_views,
        }
    }
}

struct LedgerInner {
    tree: VersionedTree,
    /// Latest finalized round
    root: Round,
    ring: RoundRing,
    /// Admitted transactions of the current view, by id
    pool: BTreeMap<TransactionId, Transaction>,
    /// Critical transactions learned from finality queries
    candidates: HashMap<TransactionId, Transaction>,
}

impl LedgerInner {
    fn lookup(&self, id: &TransactionId) -> Option<&Transaction> {
        self.pool.get(id).or_else(|| self.candidates.get(id))
    }

    /// `root` and every locally known ancestor back to the previous
    /// round, ordered by id
    fn ancestry(&self, root: &Transaction) -> Vec<Transaction> {
        let stop = self.root.id();
        let mut seen = BTreeSet::from([root.id]);
        let mut queue = VecDeque::from([root.clone()]);
        let mut out = Vec::new();

        while let Some(tx) = queue.pop_front() {
            for parent in &tx.parents {
                if *parent == stop || !seen.insert(*parent) {
                    continue;
                }
                match self.lookup(parent) {
                    Some(found) => queue.push_back(found.clone()),
                    None => {
                        tracing::debug!("Ancestor {} of {} is not known locally", parent, root.id)
                    }
                }
            }
            out.push(tx);
        }

        out.sort_by_key(|tx| tx.id);
        out
    }
}

/// Account state plus consensus bookkeeping for the current view
pub struct Ledger {
    kv: Arc<dyn KvStore>,
    inner: RwLock<LedgerInner>,
    /// Serializes finalize and sync
    commit: Mutex<()>,
    processors: RwLock<HashMap<u8, Arc<dyn TransactionProcessor>>>,
    resolver: Resolver,
    difficulty: u64,
    /// Nonce of the next locally created transaction
    nonce: AtomicU64,
}

impl Ledger {
    /// Open the ledger stored in `kv`.
    ///
    /// A store that was never initialized is seeded from `genesis`. A store
    /// holding corrupt rounds, or a checkpoint that does not match the
    /// latest round, is an error and the node must not start.
    pub fn open(
        kv: Arc<dyn KvStore>,
        genesis: &Genesis,
        params: LedgerParams,
    ) -> Result<Self, LedgerError> {
        let (root, ring, snapshot) = match load_rounds(kv.as_ref()) {
            Ok(loaded) => {
                let root = loaded
                    .chronological()
                    .pop()
                    .ok_or(LedgerError::EmptyRoundLedger)?;
                let snapshot = load_tree_checkpoint(kv.as_ref())?.unwrap_or_default();
                if snapshot.checksum() != root.state_root {
                    return Err(LedgerError::CheckpointMismatch {
                        view_id: root.view_id,
                    });
                }

                tracing::info!(
                    "Loaded {} rounds, latest root {} closed view {}",
                    loaded.rounds.len(),
                    root.id(),
                    root.view_id
                );
                (root, loaded.ring(), snapshot)
            }
            Err(e) if e.is_missing() => {
                let mut snapshot = Snapshot::new();
                genesis.apply(&mut snapshot);
                let root = Round::genesis(snapshot.checksum());
                let ring = RoundRing::default().advance();

                persist(kv.as_ref(), &root, ring, &snapshot)?;

                tracing::info!(
                    "Initialized ledger from genesis with {} accounts",
                    genesis.accounts.len()
                );
                (root, ring, snapshot)
            }
            Err(e) => return Err(e.into()),
        };

        let view_id = root.view_id + 1;
        let ledger = Self {
            kv,
            inner: RwLock::new(LedgerInner {
                tree: VersionedTree::new(snapshot, view_id, params.retained_views),
                root,
                ring,
                pool: BTreeMap::new(),
                candidates: HashMap::new(),
            }),
            commit: Mutex::new(()),
            processors: RwLock::new(HashMap::new()),
            resolver: Resolver::new(params.resolver, view_id),
            difficulty: params.difficulty,
            nonce: AtomicU64::new(0),
        };

        ledger.register_processor(TAG_NOP, NopProcessor);
        ledger.register_processor(TAG_TRANSFER, TransferProcessor);
        ledger.register_processor(TAG_STAKE, StakeProcessor);

        Ok(ledger)
    }

    /// Install the processor for `tag`, replacing any previous one
    pub fn register_processor<P: TransactionProcessor + 'static>(&self, tag: u8, processor: P) {
        self.processors.write().insert(tag, Arc::new(processor));
    }

    fn processor(&self, tag: u8) -> Option<Arc<dyn TransactionProcessor>> {
        self.processors.read().get(&tag).cloned()
    }

    /// The view currently being decided
    pub fn view_id(&self) -> u64 {
        self.inner.read().tree.view_id()
    }

    /// Latest finalized round
    pub fn root(&self) -> Round {
        self.inner.read().root.clone()
    }

    /// Latest finalized round and the view it opened, read under one lock
    pub fn root_and_view(&self) -> (Round, u64) {
        let inner = self.inner.read();
        (inner.root.clone(), inner.tree.view_id())
    }

    pub fn difficulty(&self) -> u64 {
        self.difficulty
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// State as of the latest finalized round
    pub fn snapshot(&self) -> Snapshot {
        self.inner.read().tree.current().clone()
    }

    pub fn account(&self, id: &AccountId) -> AccountRecord {
        AccountRecord::load(self.inner.read().tree.current(), id)
    }

    /// A pooled or candidate transaction of the current view
    pub fn transaction(&self, id: &TransactionId) -> Option<Transaction> {
        self.inner.read().lookup(id).cloned()
    }

    pub fn pool_len(&self) -> usize {
        self.inner.read().pool.len()
    }

    /// Remember a critical transaction seen in a finality query so it can
    /// be finalized even if it was never gossiped to us. Returns false for
    /// a transaction whose id does not match its contents.
    pub fn note_candidate(&self, tx: Transaction) -> bool {
        if tx.compute_id() != tx.id {
            return false;
        }
        self.inner.write().candidates.entry(tx.id).or_insert(tx);
        true
    }

    /// Lowest-id critical transaction in the pool
    pub fn critical_candidate(&self) -> Option<Transaction> {
        let inner = self.inner.read();
        let root_id = inner.root.id();
        inner
            .pool
            .values()
            .find(|tx| tx.id != root_id && tx.is_critical(self.difficulty))
            .cloned()
    }

    /// Run `tx` on a copy of `base`, bumping the sender's nonce
    fn apply_transaction(
        &self,
        base: &Snapshot,
        tx: &Transaction,
    ) -> Result<Snapshot, AdmissionRejected> {
        let processor = self
            .processor(tx.tag)
            .ok_or(AdmissionRejected::UnknownTag(tx.tag))?;

        let mut next = base.clone();
        processor
            .apply(&mut next, tx)
            .map_err(|e| AdmissionRejected::Processing(e.0))?;

        let nonce = read_account_nonce(&next, &tx.sender).unwrap_or(0);
        write_account_nonce(&mut next, &tx.sender, nonce.saturating_add(1));
        Ok(next)
    }

    /// Admit `tx` into the pool of the current view.
    ///
    /// Transactions already in the pool are accepted again without being
    /// re-inserted. The processor dry-run sees the finalized state only,
    /// not the effects of other pooled transactions.
    pub fn receive_transaction(&self, tx: Transaction) -> Result<(), AdmissionRejected> {
        if tx.compute_id() != tx.id {
            return Err(AdmissionRejected::IdMismatch);
        }

        let (base, view_id) = {
            let inner = self.inner.read();
            if inner.pool.contains_key(&tx.id) {
                return Ok(());
            }

            let view_id = inner.tree.view_id();
            if tx.view_id != view_id {
                return Err(AdmissionRejected::WrongView {
                    expected: view_id,
                    got: tx.view_id,
                });
            }

            if tx.parents.is_empty() {
                return Err(AdmissionRejected::NoParents);
            }

            let root_id = inner.root.id();
            if let Some(missing) = tx
                .parents
                .iter()
                .find(|p| **p != root_id && !inner.pool.contains_key(*p))
            {
                return Err(AdmissionRejected::MissingParent(*missing));
            }

            (inner.tree.current().clone(), view_id)
        };

        self.apply_transaction(&base, &tx)?;

        let mut inner = self.inner.write();
        let current = inner.tree.view_id();
        if current != view_id {
            return Err(AdmissionRejected::WrongView {
                expected: current,
                got: tx.view_id,
            });
        }

        tracing::debug!("Admitted transaction {} (tag {}) into view {}", tx.id, tx.tag, view_id);
        inner.pool.entry(tx.id).or_insert(tx);
        Ok(())
    }

    /// Close the current view with `root_id` as its root.
    ///
    /// Applies the root and its pooled ancestors in id order; a
    /// transaction whose processor fails is skipped. The new round is
    /// persisted before it becomes visible.
    pub fn finalize(&self, root_id: TransactionId) -> Result<Round, LedgerError> {
        let _commit = self.commit.lock();

        let (base, view_id, ring, root_tx, batch) = {
            let inner = self.inner.read();
            let view_id = inner.tree.view_id();
            let root_tx = inner
                .lookup(&root_id)
                .cloned()
                .ok_or(LedgerError::UnknownTransaction(root_id))?;
            if root_tx.view_id != view_id {
                return Err(LedgerError::RootViewMismatch {
                    expected: view_id,
                    got: root_tx.view_id,
                });
            }
            let batch = inner.ancestry(&root_tx);
            (inner.tree.current().clone(), view_id, inner.ring, root_tx, batch)
        };

        let mut next = base;
        let mut applied = 0u32;
        for tx in &batch {
            match self.apply_transaction(&next, tx) {
                Ok(state) => {
                    next = state;
                    applied += 1;
                }
                Err(e) => {
                    tracing::warn!("Skipping transaction {} in view {}: {}", tx.id, view_id, e)
                }
            }
        }

        let round = Round::new(view_id, root_tx, applied, next.checksum());
        let ring = ring.advance();
        persist(self.kv.as_ref(), &round, ring, &next)?;

        self.commit_round(round.clone(), ring, next);

        tracing::info!(
            "Finalized view {} with root {} ({} of {} transactions applied)",
            view_id,
            round.id(),
            applied,
            batch.len()
        );
        Ok(round)
    }

    fn commit_round(&self, round: Round, ring: RoundRing, state: Snapshot) {
        let next_view = round.view_id + 1;
        {
            let mut inner = self.inner.write();
            inner.tree.commit(next_view, state);
            inner.root = round;
            inner.ring = ring;
            inner.pool.clear();
            inner.candidates.clear();
        }
        self.resolver.reset(next_view);
    }

    /// Encoded `StateDiff` that brings a peer at `view_id` to our state
    pub fn dump_diff(&self, view_id: u64) -> Vec<u8> {
        self.inner.read().tree.diff_since(view_id).to_bytes()
    }

    /// [`Ledger::dump_diff`] together with the root it leads to, read
    /// under one lock
    pub fn dump_diff_with_root(&self, view_id: u64) -> (Round, Vec<u8>) {
        let inner = self.inner.read();
        (inner.root.clone(), inner.tree.diff_since(view_id).to_bytes())
    }

    /// Adopt `root` from a peer, replaying `diff` on our state.
    ///
    /// The replayed state must hash to the root's state root.
    pub fn apply_sync(&self, root: Round, diff: &[u8]) -> Result<(), LedgerError> {
        let diff = StateDiff::from_bytes(diff)?;
        let _commit = self.commit.lock();

        let (base, local_view, ring) = {
            let inner = self.inner.read();
            (inner.tree.current().clone(), inner.tree.view_id(), inner.ring)
        };

        if root.view_id < local_view {
            return Err(LedgerError::StaleRoot {
                local: local_view,
                remote: root.view_id,
            });
        }

        let next = diff.apply_to(&base);
        if next.checksum() != root.state_root {
            return Err(LedgerError::StateRootMismatch {
                view_id: root.view_id,
            });
        }

        let ring = ring.advance();
        persist(self.kv.as_ref(), &root, ring, &next)?;

        tracing::info!(
            "Synced from view {} to view {} (root {}, {} diff entries{})",
            local_view,
            root.view_id + 1,
            root.id(),
            diff.entries.len(),
            if diff.full { ", full dump" } else { "" }
        );
        self.commit_round(root, ring, next);
        Ok(())
    }

    /// A nop transaction for the current view building on the pool tips,
    /// or on the latest root if the pool is empty
    pub fn create_nop(&self, sender: AccountId) -> Transaction {
        let inner = self.inner.read();

        let referenced: BTreeSet<TransactionId> = inner
            .pool
            .values()
            .flat_map(|tx| tx.parents.iter().copied())
            .collect();
        let mut parents: Vec<TransactionId> = inner
            .pool
            .keys()
            .filter(|id| !referenced.contains(*id))
            .take(MAX_PARENTS)
            .copied()
            .collect();
        if parents.is_empty() {
            parents.push(inner.root.id());
        }

        Transaction::new(
            sender,
            self.nonce.fetch_add(1, Ordering::Relaxed),
            parents,
            inner.tree.view_id(),
            TAG_NOP,
            Vec::new(),
        )
    }

    /// Flush the durable store
    pub fn flush(&self) -> Result<(), LedgerError> {
        self.kv.flush()?;
        Ok(())
    }
}

/// Write the checkpoint, then the round, then flush
fn persist(
    kv: &dyn KvStore,
    round: &Round,
    ring: RoundRing,
    state: &Snapshot,
) -> Result<(), LedgerError> {
    store_tree_checkpoint(kv, state)?;
    store_round(kv, round, ring.latest_ix, ring.oldest_ix, ring.stored_count)?;
    kv.flush()?;
    Ok(())
}
