//! Consensus errors

use crate::types::Opcode;
use ledger_state::{KvError, StorageError, TransactionId};
use std::net::SocketAddr;
use thiserror::Error;

/// Why a gossiped transaction did not get a positive vote.
///
/// Rejection is the expected steady-state outcome for bad or stale
/// transactions, not a fault.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionRejected {
    #[error("transaction id does not match its contents")]
    IdMismatch,

    #[error("transaction is for view {got}, ledger is at view {expected}")]
    WrongView { expected: u64, got: u64 },

    #[error("transaction has no parents")]
    NoParents,

    #[error("parent {0} is unknown")]
    MissingParent(TransactionId),

    #[error("no processor registered for tag {0}")]
    UnknownTag(u8),

    #[error("processor rejected transaction: {0}")]
    Processing(String),
}

/// Failure of a transaction processor
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ProcessError(pub String);

/// Ledger failures. Storage failures are fatal for the operation.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("flushing ledger store failed: {0}")]
    Kv(#[from] KvError),

    #[error("round ledger holds no rounds")]
    EmptyRoundLedger,

    #[error("tree checkpoint does not match round {view_id}")]
    CheckpointMismatch { view_id: u64 },

    #[error("invalid genesis: {0}")]
    Genesis(String),

    #[error("transaction {0} is unknown")]
    UnknownTransaction(TransactionId),

    #[error("root candidate belongs to view {got}, ledger is at view {expected}")]
    RootViewMismatch { expected: u64, got: u64 },

    #[error("sync root for view {remote} is not ahead of local view {local}")]
    StaleRoot { local: u64, remote: u64 },

    #[error("synced state does not match root of view {view_id}")]
    StateRootMismatch { view_id: u64 },

    #[error("malformed state diff: {0}")]
    Diff(#[from] borsh::io::Error),
}

/// Per-peer network failures. They disconnect that peer only.
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },

    #[error("connection closed")]
    Closed,

    #[error("request timed out")]
    Timeout,

    #[error("malformed frame: {0}")]
    Decode(#[from] borsh::io::Error),

    #[error("expected {expected:?}, got {got:?}")]
    UnexpectedResponse { expected: Opcode, got: Opcode },

    #[error("no peer reachable")]
    NoPeerReachable,
}
