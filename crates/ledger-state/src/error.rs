//! Storage and codec errors

use thiserror::Error;

/// Errors from the durable key-value store
#[derive(Error, Debug)]
pub enum KvError {
    #[error("key not found")]
    NotFound,

    #[error("storage backend error: {0}")]
    Backend(#[from] sled::Error),
}

/// Errors from persisting or loading the round ledger
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("error storing {what}")]
    Store {
        what: &'static str,
        #[source]
        source: KvError,
    },

    #[error("round ledger not initialized: missing {what}")]
    Uninitialized { what: &'static str },

    #[error("error loading {what}")]
    Load {
        what: String,
        #[source]
        source: KvError,
    },

    #[error("malformed {what}: expected {expected} bytes, got {actual}")]
    Truncated {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("error unmarshaling round {index}")]
    Decode {
        index: usize,
        #[source]
        source: borsh::io::Error,
    },

    #[error("error encoding or decoding tree checkpoint: {0}")]
    Checkpoint(#[from] bincode::Error),
}

impl StorageError {
    /// True when the store has never been initialized (cold start), as
    /// opposed to holding corrupt data.
    pub fn is_missing(&self) -> bool {
        matches!(self, StorageError::Uninitialized { .. })
    }
}

/// Soft failures when decoding a stored account field.
///
/// These never propagate past the account layer: a field that fails to
/// decode reads as absent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("expected {expected} bytes, got {actual}")]
    Decode { expected: usize, actual: usize },

    #[error("page decompression failed: {0}")]
    Compression(String),
}
