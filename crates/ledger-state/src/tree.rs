//! Versioned ordered key-value tree
//!
//! Uses `im::OrdMap` so that cloning a snapshot is O(1) with structural
//! sharing. Each finalized view gets its own snapshot; later views
//! supersede but never mutate earlier ones, so handlers can read a
//! snapshot while the ledger builds the next one.

use borsh::{BorshDeserialize, BorshSerialize};
use im::OrdMap;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Ordered key-value tree the account layout is written against
pub trait StateTree {
    /// Look up the value stored under `key`
    fn lookup(&self, key: &[u8]) -> Option<&[u8]>;

    /// Insert or overwrite the value stored under `key`
    fn insert(&mut self, key: Vec<u8>, value: Vec<u8>);

    /// Remove `key`, returning whether it was present
    fn delete(&mut self, key: &[u8]) -> bool;
}

/// One mutation separating two snapshots. `None` means the key was removed.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct DiffEntry {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

/// Immutable-by-clone view of the tree
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    entries: OrdMap<Vec<u8>, Vec<u8>>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot from raw entries (e.g. a loaded checkpoint)
    pub fn from_entries(entries: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Collect every entry in key order
    pub fn to_entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Checksum over all entries in key order
    pub fn checksum(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        for (key, value) in self.entries.iter() {
            hasher.update(&(key.len() as u32).to_le_bytes());
            hasher.update(key);
            hasher.update(&(value.len() as u32).to_le_bytes());
            hasher.update(value);
        }
        *hasher.finalize().as_bytes()
    }

    /// Compute the mutations that turn `self` into `newer`.
    ///
    /// Walks both maps in key order; entries are emitted in key order.
    pub fn diff(&self, newer: &Snapshot) -> Vec<DiffEntry> {
        let mut out = Vec::new();
        let mut old_iter = self.entries.iter().peekable();
        let mut new_iter = newer.entries.iter().peekable();

        loop {
            let order = match (old_iter.peek(), new_iter.peek()) {
                (None, None) => break,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some((old_key, _)), Some((new_key, _))) => old_key.cmp(new_key),
            };

            match order {
                Ordering::Less => {
                    if let Some((key, _)) = old_iter.next() {
                        out.push(DiffEntry {
                            key: key.clone(),
                            value: None,
                        });
                    }
                }
                Ordering::Greater => {
                    if let Some((key, value)) = new_iter.next() {
                        out.push(DiffEntry {
                            key: key.clone(),
                            value: Some(value.clone()),
                        });
                    }
                }
                Ordering::Equal => {
                    if let (Some((_, old_value)), Some((key, new_value))) =
                        (old_iter.next(), new_iter.next())
                    {
                        if old_value != new_value {
                            out.push(DiffEntry {
                                key: key.clone(),
                                value: Some(new_value.clone()),
                            });
                        }
                    }
                }
            }
        }

        out
    }

    /// Replay mutations produced by [`Snapshot::diff`]
    pub fn apply_diff(&mut self, diff: &[DiffEntry]) {
        for entry in diff {
            match &entry.value {
                Some(value) => {
                    self.entries.insert(entry.key.clone(), value.clone());
                }
                None => {
                    self.entries.remove(&entry.key);
                }
            }
        }
    }
}

impl StateTree for Snapshot {
    fn lookup(&self, key: &[u8]) -> Option<&[u8]> {
        self.entries.get(key).map(|v| v.as_slice())
    }

    fn insert(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.entries.insert(key, value);
    }

    fn delete(&mut self, key: &[u8]) -> bool {
        self.entries.remove(key).is_some()
    }
}

/// Tree mutations shipped to a lagging peer
#[derive(Debug, Clone, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct StateDiff {
    /// Entries are a full dump rather than a delta against the peer's view
    pub full: bool,
    pub entries: Vec<DiffEntry>,
}

impl StateDiff {
    /// Rebuild the newer snapshot on top of `base`
    pub fn apply_to(&self, base: &Snapshot) -> Snapshot {
        let mut next = if self.full {
            Snapshot::new()
        } else {
            base.clone()
        };
        next.apply_diff(&self.entries);
        next
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        borsh::to_vec(self).expect("StateDiff serialization should not fail")
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, borsh::io::Error> {
        borsh::from_slice(data)
    }
}

/// The current snapshot plus the snapshots that opened recent views
#[derive(Debug, Clone)]
pub struct VersionedTree {
    current: Snapshot,
    view_id: u64,
    history: BTreeMap<u64, Snapshot>,
    retain: usize,
}

impl VersionedTree {
    /// Start at `view_id` with `current`, keeping at most `retain` older
    /// snapshots around for diffs.
    pub fn new(current: Snapshot, view_id: u64, retain: usize) -> Self {
        Self {
            current,
            view_id,
            history: BTreeMap::new(),
            retain,
        }
    }

    pub fn current(&self) -> &Snapshot {
        &self.current
    }

    pub fn view_id(&self) -> u64 {
        self.view_id
    }

    /// Snapshot that was current when `view_id` began, if still retained
    pub fn at_view(&self, view_id: u64) -> Option<&Snapshot> {
        if view_id == self.view_id {
            return Some(&self.current);
        }
        self.history.get(&view_id)
    }

    /// Supersede the current snapshot with `next`, which opens `view_id`
    pub fn commit(&mut self, view_id: u64, next: Snapshot) {
        let previous = std::mem::replace(&mut self.current, next);
        self.history.insert(self.view_id, previous);
        self.view_id = view_id;

        while self.history.len() > self.retain {
            let Some((&oldest, _)) = self.history.iter().next() else {
                break;
            };
            self.history.remove(&oldest);
        }
    }

    /// Diff between the snapshot that opened `view_id` and the current
    /// one. Views no longer retained (or never seen) yield a full dump.
    pub fn diff_since(&self, view_id: u64) -> StateDiff {
        match self.at_view(view_id) {
            Some(base) => StateDiff {
                full: false,
                entries: base.diff(&self.current),
            },
            None => StateDiff {
                full: true,
                entries: Snapshot::new().diff(&self.current),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(pairs: &[(&[u8], &[u8])]) -> Snapshot {
        Snapshot::from_entries(
            pairs
                .iter()
                .map(|(k, v)| (k.to_vec(), v.to_vec()))
                .collect(),
        )
    }

    #[test]
    fn test_snapshot_clone_is_isolated() {
        let mut base = snapshot(&[(b"a", b"1")]);
        let frozen = base.clone();

        base.insert(b"b".to_vec(), b"2".to_vec());
        assert!(base.delete(b"a"));

        assert_eq!(frozen.lookup(b"a"), Some(&b"1"[..]));
        assert_eq!(frozen.lookup(b"b"), None);
        assert_eq!(base.lookup(b"a"), None);
    }

    #[test]
    fn test_diff_and_apply() {
        let old = snapshot(&[(b"a", b"1"), (b"b", b"2"), (b"c", b"3")]);
        let new = snapshot(&[(b"b", b"2"), (b"c", b"30"), (b"d", b"4")]);

        let diff = old.diff(&new);
        assert_eq!(
            diff,
            vec![
                DiffEntry { key: b"a".to_vec(), value: None },
                DiffEntry { key: b"c".to_vec(), value: Some(b"30".to_vec()) },
                DiffEntry { key: b"d".to_vec(), value: Some(b"4".to_vec()) },
            ]
        );

        let mut replayed = old.clone();
        replayed.apply_diff(&diff);
        assert_eq!(replayed, new);
        assert_eq!(replayed.checksum(), new.checksum());
    }

    #[test]
    fn test_versioned_tree_retention() {
        let mut tree = VersionedTree::new(snapshot(&[(b"k", b"0")]), 1, 2);

        for view in 2..=4u64 {
            let mut next = tree.current().clone();
            next.insert(b"k".to_vec(), view.to_le_bytes().to_vec());
            tree.commit(view, next);
        }

        assert_eq!(tree.view_id(), 4);
        assert!(tree.at_view(1).is_none());
        assert!(tree.at_view(2).is_some());
        assert!(tree.at_view(3).is_some());

        // Diff from a pruned view is a full dump
        let full = tree.diff_since(1);
        assert!(full.full);
        assert_eq!(full.entries.len(), 1);

        let delta = tree.diff_since(3);
        assert!(!delta.full);
        assert_eq!(delta.entries.len(), 1);
        assert!(tree.diff_since(4).entries.is_empty());
    }

    #[test]
    fn test_full_dump_drops_stale_keys() {
        let remote = snapshot(&[(b"a", b"1")]);
        let lagging = snapshot(&[(b"a", b"0"), (b"stale", b"x")]);

        let dump = StateDiff {
            full: true,
            entries: Snapshot::new().diff(&remote),
        };
        let decoded = StateDiff::from_bytes(&dump.to_bytes()).unwrap();

        assert_eq!(decoded.apply_to(&lagging), remote);
    }
}
