//! Durable key-value stores backing the round ledger
//!
//! `SledStore` persists to disk; `MemoryStore` uses DashMap and is used by
//! tests and ephemeral nodes.

use crate::error::KvError;
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;

/// Minimal get/put store the round ledger is written against
pub trait KvStore: Send + Sync {
    /// Fetch the value under `key`, failing with `KvError::NotFound` if absent
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, KvError>;

    /// Store `value` under `key`
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), KvError>;

    /// Flush pending writes to durable storage
    fn flush(&self) -> Result<(), KvError> {
        Ok(())
    }
}

/// Sled-backed persistent store
pub struct SledStore {
    /// Sled database instance
    db: sled::Db,
    /// Ledger tree
    ledger: sled::Tree,
}

impl SledStore {
    /// Open or create a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, KvError> {
        let db = sled::open(&path)?;
        let ledger = db.open_tree("ledger")?;

        tracing::info!("Opened ledger store at {:?}", path.as_ref());

        Ok(Self { db, ledger })
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.ledger.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ledger.is_empty()
    }
}

impl KvStore for SledStore {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, KvError> {
        match self.ledger.get(key)? {
            Some(value) => Ok(value.to_vec()),
            None => Err(KvError::NotFound),
        }
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), KvError> {
        self.ledger.insert(key, value)?;
        Ok(())
    }

    fn flush(&self) -> Result<(), KvError> {
        self.db.flush()?;
        Ok(())
    }
}

/// Thread-safe in-memory store
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, KvError> {
        self.entries
            .get(key)
            .map(|r| r.value().clone())
            .ok_or(KvError::NotFound)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), KvError> {
        self.entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_sled_store_survives_reopen() {
        let dir = tempdir().unwrap();

        {
            let store = SledStore::open(dir.path()).unwrap();
            store.put(b"key", b"value").unwrap();
            store.flush().unwrap();
        }

        let store = SledStore::open(dir.path()).unwrap();
        assert_eq!(store.get(b"key").unwrap(), b"value".to_vec());
        assert!(matches!(store.get(b"missing"), Err(KvError::NotFound)));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        assert!(store.is_empty());

        store.put(&[0x9], &[0, 0, 0, 1]).unwrap();
        store.put(&[0x9], &[0, 0, 0, 2]).unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&[0x9]).unwrap(), vec![0, 0, 0, 2]);
    }
}
