//! Peer protocol messages and consensus configuration

use crate::resolver::ResolverParams;
use borsh::{BorshDeserialize, BorshSerialize};
use ledger_state::{AccountId, Identifier, Round, Transaction, TransactionId};
use serde::{Deserialize, Serialize};

/// Ask a peer to vote on a transaction
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct GossipRequest {
    pub tx: Transaction,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct GossipResponse {
    pub vote: bool,
}

/// Finality query: which transaction does the peer prefer?
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct QueryRequest {
    pub tx: Transaction,
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct QueryResponse {
    /// Zero when the peer has no preference
    pub preferred: TransactionId,
}

impl Default for QueryResponse {
    fn default() -> Self {
        Self {
            preferred: Identifier::ZERO,
        }
    }
}

/// Advertise our latest round and learn which one the peer converged on
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SyncViewRequest {
    pub root: Round,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SyncViewResponse {
    /// `None` only when the peer is paused
    pub root: Option<Round>,
}

/// Ask for the state changes since `view_id`
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SyncDiffRequest {
    pub view_id: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SyncDiffResponse {
    /// `None` only when the peer is paused
    pub root: Option<Round>,
    /// Encoded `StateDiff`
    pub diff: Vec<u8>,
}

/// Message kinds on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    GossipRequest,
    GossipResponse,
    QueryRequest,
    QueryResponse,
    SyncViewRequest,
    SyncViewResponse,
    SyncDiffRequest,
    SyncDiffResponse,
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum Request {
    Gossip(GossipRequest),
    Query(QueryRequest),
    SyncView(SyncViewRequest),
    SyncDiff(SyncDiffRequest),
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Gossip(_) => Opcode::GossipRequest,
            Request::Query(_) => Opcode::QueryRequest,
            Request::SyncView(_) => Opcode::SyncViewRequest,
            Request::SyncDiff(_) => Opcode::SyncDiffRequest,
        }
    }

    /// Opcode of the response this request expects
    pub fn response_opcode(&self) -> Opcode {
        match self {
            Request::Gossip(_) => Opcode::GossipResponse,
            Request::Query(_) => Opcode::QueryResponse,
            Request::SyncView(_) => Opcode::SyncViewResponse,
            Request::SyncDiff(_) => Opcode::SyncDiffResponse,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum Response {
    Gossip(GossipResponse),
    Query(QueryResponse),
    SyncView(SyncViewResponse),
    SyncDiff(SyncDiffResponse),
}

impl Response {
    pub fn opcode(&self) -> Opcode {
        match self {
            Response::Gossip(_) => Opcode::GossipResponse,
            Response::Query(_) => Opcode::QueryResponse,
            Response::SyncView(_) => Opcode::SyncViewResponse,
            Response::SyncDiff(_) => Opcode::SyncDiffResponse,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum Body {
    Request(Request),
    Response(Response),
}

/// One frame on a peer connection. Responses echo the request id.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Envelope {
    pub request_id: u64,
    pub body: Body,
}

impl Envelope {
    pub fn to_bytes(&self) -> Vec<u8> {
        borsh::to_vec(self).expect("Envelope serialization should not fail")
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, borsh::io::Error> {
        borsh::from_slice(data)
    }
}

/// Configuration for a consensus node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Identity used as sender of locally created transactions
    pub node_id: AccountId,
    /// Address peers connect to
    pub listen_addr: String,
    /// Peers to dial at startup
    pub peers: Vec<String>,
    /// Leading zero bits required for a critical transaction
    pub difficulty: u64,
    /// Snowball sampling parameters
    pub resolver: ResolverParams,
    /// Milliseconds between consensus steps
    pub query_interval_ms: u64,
    /// Run a sync round every N steps (0 disables sync)
    pub sync_every: u64,
    /// Milliseconds to wait for a peer's response
    pub request_timeout_ms: u64,
    /// Older view snapshots retained for serving diffs
    pub retained_views: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            node_id: Identifier::ZERO,
            listen_addr: "127.0.0.1:3000".to_string(),
            peers: Vec::new(),
            difficulty: 4,
            resolver: ResolverParams::default(),
            query_interval_ms: 100,
            sync_every: 50,
            request_timeout_ms: 2_000,
            retained_views: 16,
        }
    }
}

/// Stats about the consensus node
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsensusStats {
    pub view_id: u64,
    pub connected_peers: usize,
    pub rounds_finalized: u64,
    pub transactions_broadcast: u64,
    pub queries_sent: u64,
    pub syncs_completed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_roundtrip() {
        let tx = Transaction::new(Identifier::hash(b"a"), 1, vec![Identifier::ZERO], 1, 0, vec![7]);
        let envelope = Envelope {
            request_id: 42,
            body: Body::Request(Request::Query(QueryRequest { tx })),
        };

        let decoded = Envelope::from_bytes(&envelope.to_bytes()).unwrap();
        assert_eq!(decoded, envelope);
        assert!(Envelope::from_bytes(&[0xFF; 3]).is_err());
    }

    #[test]
    fn test_response_opcodes_pair_with_requests() {
        let request = Request::SyncDiff(SyncDiffRequest { view_id: 3 });
        let response = Response::SyncDiff(SyncDiffResponse::default());

        assert_eq!(request.opcode(), Opcode::SyncDiffRequest);
        assert_eq!(request.response_opcode(), response.opcode());
        assert_ne!(
            Request::Gossip(GossipRequest {
                tx: Transaction::new(Identifier::ZERO, 0, Vec::new(), 0, 0, Vec::new())
            })
            .response_opcode(),
            response.opcode()
        );
    }

    #[test]
    fn test_config_defaults_from_partial_json() {
        let config: ConsensusConfig =
            serde_json::from_str(r#"{ "difficulty": 0, "peers": ["127.0.0.1:3001"] }"#).unwrap();

        assert_eq!(config.difficulty, 0);
        assert_eq!(config.peers, vec!["127.0.0.1:3001".to_string()]);
        assert_eq!(config.query_interval_ms, 100);
    }
}
