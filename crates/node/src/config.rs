//! Node Configuration

use anyhow::Context;
use ledger_consensus::{ConsensusConfig, ResolverParams};
use ledger_state::AccountId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Node configuration, read from an optional JSON file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Identity used as sender of the node's own transactions
    pub node_id: AccountId,
    /// Peer server bind address
    pub listen_addr: String,
    /// Peers to dial at startup
    pub peers: Vec<String>,
    /// Directory of the round ledger store
    pub data_dir: PathBuf,
    /// Genesis accounts, used only on first start
    pub genesis_path: PathBuf,
    /// Leading zero bits that make a transaction critical
    pub difficulty: u64,
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

impl Default for NodeConfig {
    fn default() -> Self {
        let consensus = ConsensusConfig::default();
        Self {
            node_id: consensus.node_id,
            listen_addr: consensus.listen_addr,
            peers: consensus.peers,
            data_dir: PathBuf::from("./data"),
            genesis_path: PathBuf::from("./config/genesis.json"),
            difficulty: consensus.difficulty,
            resolver: consensus.resolver,
            query_interval_ms: consensus.query_interval_ms,
            sync_every: consensus.sync_every,
            request_timeout_ms: consensus.request_timeout_ms,
            retained_views: consensus.retained_views,
        }
    }
}

impl NodeConfig {
    /// Load a JSON config file. Missing keys take their defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {:?}", path))?;
        serde_json::from_str(&json).with_context(|| format!("parsing config file {:?}", path))
    }

    /// The consensus part of the configuration
    pub fn consensus(&self) -> ConsensusConfig {
        ConsensusConfig {
            node_id: self.node_id,
            listen_addr: self.listen_addr.clone(),
            peers: self.peers.clone(),
            difficulty: self.difficulty,
            resolver: self.resolver,
            query_interval_ms: self.query_interval_ms,
            sync_every: self.sync_every,
            request_timeout_ms: self.request_timeout_ms,
            retained_views: self.retained_views,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_partial_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(
            &path,
            r#"{ "listen_addr": "0.0.0.0:4000", "resolver": { "beta": 3 } }"#,
        )
        .unwrap();

        let config = NodeConfig::load(&path).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:4000");
        assert_eq!(config.resolver.beta, 3);
        assert_eq!(config.resolver.k, ResolverParams::default().k);
        assert_eq!(config.data_dir, PathBuf::from("./data"));

        let consensus = config.consensus();
        assert_eq!(consensus.listen_addr, "0.0.0.0:4000");
        assert_eq!(consensus.resolver.beta, 3);
    }

    #[test]
    fn test_load_rejects_bad_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(NodeConfig::load(&path).is_err());
        assert!(NodeConfig::load(&dir.path().join("missing.json")).is_err());
    }
}
