//! Ledger Node
//!
//! Opens the round ledger from disk (seeding it from the genesis file on
//! first start), joins its peers and drives consensus until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use ledger_consensus::{ConsensusNodeBuilder, Genesis, Ledger, LedgerParams};
use ledger_state::{AccountId, SledStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

use config::NodeConfig;

/// Ledger node command line
#[derive(Parser, Debug)]
#[command(name = "ledger-node")]
#[command(about = "Ledger node with sampled-voting finality")]
struct Args {
    /// JSON config file. Flags below override its values.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Peer server bind address
    #[arg(long)]
    listen_addr: Option<String>,

    /// Peer to dial at startup (repeatable)
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Data directory for the round ledger
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Genesis file, read only when the data directory is empty
    #[arg(long)]
    genesis: Option<PathBuf>,

    /// Identity for the node's own transactions (base58)
    #[arg(long)]
    node_id: Option<AccountId>,

    /// Leading zero bits for a critical transaction
    #[arg(long)]
    difficulty: Option<u64>,

    /// Milliseconds between consensus steps
    #[arg(long)]
    query_interval_ms: Option<u64>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Seconds between stats reports (0 disables)
    #[arg(long, default_value = "30")]
    stats_interval: u64,
}

impl Args {
    fn node_config(&self) -> Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::load(path)?,
            None => NodeConfig::default(),
        };

        if let Some(addr) = &self.listen_addr {
            config.listen_addr = addr.clone();
        }
        if !self.peers.is_empty() {
            config.peers = self.peers.clone();
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(path) = &self.genesis {
            config.genesis_path = path.clone();
        }
        if let Some(id) = self.node_id {
            config.node_id = id;
        }
        if let Some(difficulty) = self.difficulty {
            config.difficulty = difficulty;
        }
        if let Some(ms) = self.query_interval_ms {
            config.query_interval_ms = ms;
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = args.node_config()?;

    tracing::info!("Starting ledger node");
    tracing::info!("  Listen: {}", config.listen_addr);
    tracing::info!("  Peers: {:?}", config.peers);
    tracing::info!("  Data directory: {:?}", config.data_dir);
    tracing::info!("  Node id: {}", config.node_id);
    tracing::info!(
        "  Resolver: k={} alpha={} beta={}, difficulty {}",
        config.resolver.k,
        config.resolver.alpha,
        config.resolver.beta,
        config.difficulty
    );

    std::fs::create_dir_all(&config.data_dir)?;
    let store = SledStore::open(&config.data_dir)
        .with_context(|| format!("opening store at {:?}", config.data_dir))?;

    let genesis = Genesis::load(&config.genesis_path)?;
    let consensus = config.consensus();
    let ledger = Ledger::open(Arc::new(store), &genesis, LedgerParams::from(&consensus))
        .context("round ledger failed to load, refusing to start")?;
    let ledger = Arc::new(ledger);

    tracing::info!(
        "Ledger at view {}, root {}",
        ledger.view_id(),
        ledger.root().id()
    );

    let node = Arc::new(ConsensusNodeBuilder::new().config(consensus).build(ledger.clone()));
    let local_addr = node.start().await?;
    tracing::info!("Peer server listening on {}. Press Ctrl+C to stop.", local_addr);

    if args.stats_interval > 0 {
        let node = node.clone();
        let period = Duration::from_secs(args.stats_interval);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let stats = node.stats();
                tracing::info!(
                    "View {} | {} peers | {} finalized | {} queries | {} syncs",
                    stats.view_id,
                    stats.connected_peers,
                    stats.rounds_finalized,
                    stats.queries_sent,
                    stats.syncs_completed
                );
            }
        });
    }

    tokio::select! {
        result = node.run() => {
            if let Err(e) = result {
                tracing::error!("Consensus stopped: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down...");
        }
    }

    ledger.flush()?;
    tracing::info!("Node stopped at view {}", ledger.view_id());

    Ok(())
}
