//! ember-node binary: configuration, logging, runtime, lifecycle.

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ember_node::{Network, Node, NodeConfig};

#[derive(Parser, Debug)]
#[command(name = "ember-node", version, about = "Headers-only RandomX proof-of-work node")]
struct Cli {
    /// Chain to follow: main, test, or regtest.
    #[arg(long)]
    network: Option<Network>,

    /// P2P listen port (defaults to the network's port).
    #[arg(long)]
    listen_port: Option<u16>,

    /// Disable the inbound listener.
    #[arg(long)]
    no_listen: bool,

    /// Data directory root.
    #[arg(long)]
    datadir: Option<std::path::PathBuf>,

    /// Tokio worker threads (0 = number of cores).
    #[arg(long)]
    io_threads: Option<usize>,

    /// Maximum outbound connections.
    #[arg(long)]
    max_outbound: Option<usize>,

    /// Maximum inbound connections.
    #[arg(long)]
    max_inbound: Option<usize>,

    /// Seconds between outbound connection attempts.
    #[arg(long)]
    connect_interval: Option<u64>,

    /// Seconds between maintenance passes.
    #[arg(long)]
    maintenance_interval: Option<u64>,

    /// Use the full-memory RandomX dataset (faster verify, ~2 GiB).
    #[arg(long)]
    randomx_fast: bool,

    /// RandomX VMs kept per thread (minimum 2).
    #[arg(long)]
    randomx_vm_cache: Option<usize>,

    /// Reorganizations at least this deep are refused.
    #[arg(long)]
    suspicious_reorg_depth: Option<u64>,
}

impl Cli {
    fn apply(self, config: &mut NodeConfig) {
        if let Some(network) = self.network {
            config.network = network;
        }
        if let Some(port) = self.listen_port {
            config.listen_port = port;
        }
        if self.no_listen {
            config.listen_enabled = false;
        }
        if let Some(datadir) = self.datadir {
            config.datadir = datadir;
        }
        if let Some(threads) = self.io_threads {
            config.io_threads = threads;
        }
        if let Some(n) = self.max_outbound {
            config.max_outbound = n;
        }
        if let Some(n) = self.max_inbound {
            config.max_inbound = n;
        }
        if let Some(secs) = self.connect_interval {
            config.connect_interval_secs = secs;
        }
        if let Some(secs) = self.maintenance_interval {
            config.maintenance_interval_secs = secs;
        }
        if self.randomx_fast {
            config.randomx_fast_mode = true;
        }
        if let Some(n) = self.randomx_vm_cache {
            config.randomx_vm_cache_size = n;
        }
        if let Some(depth) = self.suspicious_reorg_depth {
            config.suspicious_reorg_depth = depth;
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = NodeConfig::from_env();
    Cli::parse().apply(&mut config);

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if config.io_threads > 0 {
        builder.worker_threads(config.io_threads);
    }
    let runtime = builder.build()?;

    runtime.block_on(async move {
        let node = Node::new(config)?;
        node.start().await?;
        node.run_until_shutdown().await?;
        info!("bye");
        Ok(())
    })
}
