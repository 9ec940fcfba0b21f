//! Shelfcast node entry point.

use anyhow::Context;
use clap::Parser;
use shelfcast_node::config::NodeConfig;
use shelfcast_node::observability::init_logging;
use shelfcast_node::Node;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Shelfcast Node - real-time fan-out for reading progress, notifications and chat
#[derive(Parser, Debug)]
#[command(name = "shelfcast-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a YAML or TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP listen address
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// Stream registry listen address
    #[arg(long)]
    stream_addr: Option<SocketAddr>,

    /// Datagram registry listen address
    #[arg(long)]
    datagram_addr: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    /// Do not bridge the socket registries to SSE
    #[arg(long)]
    no_bridge: bool,
}

impl Args {
    fn apply(&self, config: &mut NodeConfig) {
        if let Some(addr) = self.http_addr {
            config.http.listen = addr;
        }
        if let Some(addr) = self.stream_addr {
            config.stream.listen = addr;
        }
        if let Some(addr) = self.datagram_addr {
            config.datagram.listen = addr;
        }
        if let Some(level) = &self.log_level {
            config.log.level = level.clone();
        }
        if self.log_json {
            config.log.json = true;
        }
        if self.no_bridge {
            config.bridge.enabled = false;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config =
        NodeConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    args.apply(&mut config);

    init_logging(&config.log.level, config.log.json);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting shelfcast node");

    let node = Node::start(config).await.context("failed to start node")?;
    tracing::info!("Node is ready. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    node.shutdown().await;
    Ok(())
}
