//! Ledger State - account layout, versioned tree and round persistence
//!
//! This crate provides the storage side of the ledger node:
//! - Identifiers, transactions and finalized rounds
//! - A versioned ordered tree with cheap per-view snapshots and diffs
//! - The account field layout on top of that tree
//! - The round ring buffer persisted to a durable key-value store

pub mod accounts;
pub mod error;
pub mod kv;
pub mod rounds;
pub mod tree;
pub mod types;

pub use accounts::{AccountField, AccountRecord, FieldCodec, FieldValue};
pub use error::{CodecError, KvError, StorageError};
pub use kv::{KvStore, MemoryStore, SledStore};
pub use rounds::{load_rounds, store_round, LoadedRounds, RoundRing, MAX_STORED_ROUNDS};
pub use tree::{DiffEntry, Snapshot, StateDiff, StateTree, VersionedTree};
pub use types::{AccountId, Identifier, Round, Transaction, TransactionId, ID_SIZE};
