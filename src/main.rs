use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use gridnode::capacity::ResourceUsageConfig;
use gridnode::config::NodeConfig;
use gridnode::dashboard::{run_dashboard, DashboardState};
use gridnode::events::OutboundEvent;
use gridnode::node::ComputeNode;
use gridnode::shutdown::install_shutdown_handler;
use gridnode::worker::ShellExecutor;

#[derive(Parser, Debug)]
#[command(name = "gridnode")]
#[command(about = "A compute node scheduler for a decentralized job-execution network")]
struct Args {
    /// Node ID (unique identifier for this node)
    #[arg(long, default_value = "node-0")]
    node_id: String,

    /// CPU capacity to offer, in cores or millicores (e.g. "2" or "1500m")
    #[arg(long, default_value = "1")]
    cpu: String,

    /// Memory capacity to offer (e.g. "2Gi", "500M")
    #[arg(long, default_value = "1Gi")]
    memory: String,

    /// Disk capacity to offer (e.g. "10Gi")
    #[arg(long, default_value = "10Gi")]
    disk: String,

    /// GPU count to offer
    #[arg(long, default_value = "0")]
    gpu: String,

    /// Directory for per-shard result files
    #[arg(long, default_value = "/tmp/gridnode-results")]
    results_dir: String,

    /// Port for the web dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = NodeConfig::new(
        args.node_id,
        ResourceUsageConfig {
            cpu: args.cpu,
            memory: args.memory,
            disk: args.disk,
            gpu: args.gpu,
        },
    )
    .with_results_dir(args.results_dir);

    tracing::info!(
        node_id = %config.node_id,
        cpu = %config.capacity.cpu,
        memory = %config.capacity.memory,
        disk = %config.capacity.disk,
        gpu = %config.capacity.gpu,
        "Starting gridnode"
    );

    let cancel = install_shutdown_handler();

    // The gossip transport is wired in by the deployment; the bare binary
    // logs outbound events and receives nothing.
    let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::channel::<OutboundEvent>(64);
    let (_inbound_tx, inbound_rx) = tokio::sync::mpsc::channel(64);

    tokio::spawn(async move {
        while let Some(event) = outbound_rx.recv().await {
            tracing::info!(event = ?event, "outbound event");
        }
    });

    let executor = Arc::new(ShellExecutor::new());
    let node = Arc::new(ComputeNode::new(config, executor, outbound_tx, cancel.clone())?);

    if let Some(port) = args.dashboard_port {
        let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
        let state = DashboardState {
            node_id: node.config.node_id.clone(),
            capacity: node.capacity.clone(),
            shards: node.shards.clone(),
        };
        tokio::spawn(async move {
            run_dashboard(addr, state).await;
        });
    }

    node.run(inbound_rx, cancel).await;

    Ok(())
}
