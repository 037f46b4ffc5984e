//! Ledger Consensus - probabilistic finality over a peer network
//!
//! Architecture:
//! - The ledger admits gossiped transactions into a per-view pool
//! - Critical transactions become root candidates; the first one a node
//!   sees in a view is its preference for the rest of the view
//! - Nodes poll random peer samples and finalize once the preference
//!   has won enough consecutive polls
//! - Lagging nodes catch up by replaying a state diff from their peers

pub mod broadcast;
pub mod driver;
pub mod error;
pub mod handlers;
pub mod ledger;
pub mod peer;
pub mod processor;
pub mod resolver;
pub mod syncer;
pub mod types;

#[cfg(test)]
mod tests;

pub use broadcast::Broadcaster;
pub use driver::{ConsensusNode, ConsensusNodeBuilder};
pub use error::{AdmissionRejected, LedgerError, NetworkError, ProcessError};
pub use handlers::Protocol;
pub use ledger::{Genesis, GenesisAccount, Ledger, LedgerParams};
pub use peer::{PeerClient, PeerServer, PeerSet};
pub use processor::{NopProcessor, StakeProcessor, TransactionProcessor, TransferProcessor};
pub use resolver::{Resolver, ResolverParams, ResolverStatus};
pub use syncer::Syncer;
pub use types::*;
