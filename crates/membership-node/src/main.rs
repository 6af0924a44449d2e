//! membership-node: gossip membership daemon.
//!
//! Joins a cluster through its seeds, keeps the membership view up to date and
//! logs every view change until interrupted.

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use membership_core::ViewChange;
use membership_node::{MembershipNode, NodeConfig};

#[derive(Parser, Debug)]
#[command(name = "membership-node")]
#[command(about = "Gossip-based group membership and failure detection")]
struct Args {
    /// JSON configuration file
    #[arg(short, long, env = "MEMBERSHIP_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on (overrides the config file)
    #[arg(short, long, env = "MEMBERSHIP_BIND")]
    bind: Option<SocketAddr>,

    /// Seed peer address; may be repeated
    #[arg(short, long = "seed")]
    seeds: Vec<SocketAddr>,

    /// Node id within the cluster (overrides the config file)
    #[arg(long, env = "MEMBERSHIP_NODE_ID")]
    node_id: Option<i32>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

impl Args {
    fn node_config(&self) -> Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::load(path)?,
            None => NodeConfig::default(),
        };
        if let Some(bind) = self.bind {
            config.transport.bind = bind;
        }
        if !self.seeds.is_empty() {
            config.transport.seeds = self.seeds.clone();
        }
        if let Some(node_id) = self.node_id {
            config.node_id = node_id;
        }
        Ok(config)
    }
}

fn log_view_change(change: &ViewChange) {
    let members: Vec<i32> = change.view.members.iter().collect();
    info!(
        "View {} {}: members {:?}, leader {}",
        change.view_number,
        if change.view.stable { "stable" } else { "forming" },
        members,
        change.leader
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,membership_node=debug,membership_core=debug"
    } else {
        "info,membership_node=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = args.node_config()?;
    info!("Starting membership-node {}", config.node_id);
    info!("Listen address: {}", config.transport.bind);
    info!("Seeds: {:?}", config.transport.seeds);

    let node = MembershipNode::start(config).await?;
    let _subscription = node.subscribe(Arc::new(log_view_change));

    info!("Node running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    node.shutdown().await;
    Ok(())
}
