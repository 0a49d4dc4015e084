//! Drives one job through the full shard lifecycle in a single process.
//!
//! A loopback "requester" accepts every bid and verifies every proposal, so
//! the node's outbound events feed straight back into its inbound channel.
//! Run with: cargo run --example local_loopback

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use gridnode::capacity::ResourceUsageConfig;
use gridnode::config::NodeConfig;
use gridnode::events::{OutboundEvent, TransportEvent};
use gridnode::node::ComputeNode;
use gridnode::scheduler::{construct_job, JobDeal};
use gridnode::worker::ShellExecutor;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let results_dir = tempfile_dir()?;
    let config = NodeConfig::new(
        "loopback-node",
        ResourceUsageConfig {
            cpu: "2".to_string(),
            memory: "1Gi".to_string(),
            disk: "1Gi".to_string(),
            gpu: "0".to_string(),
        },
    )
    .with_results_dir(&results_dir);

    let cancel = CancellationToken::new();
    let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::channel(64);
    let (inbound_tx, inbound_rx) = tokio::sync::mpsc::channel(64);

    let executor = Arc::new(ShellExecutor::new());
    let node = Arc::new(ComputeNode::new(
        config,
        executor,
        outbound_tx,
        cancel.clone(),
    )?);

    let node_task = {
        let node = node.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            node.run(inbound_rx, cancel).await;
        })
    };

    let job = construct_job(
        "loopback-requester",
        "echo hello from the grid",
        vec![],
        ResourceUsageConfig {
            cpu: "500m".to_string(),
            memory: "100Mi".to_string(),
            disk: "".to_string(),
            gpu: "".to_string(),
        },
        vec![],
        vec![],
        vec!["demo".to_string()],
        1,
        JobDeal {
            concurrency: 1,
            confidence: 0,
            min_bids: 0,
        },
    )?;
    inbound_tx
        .send(TransportEvent::JobAnnounced { job })
        .await?;

    // Loopback requester: accept the bid, verify the proposal, stop once the
    // shard publishes.
    while let Some(event) = outbound_rx.recv().await {
        match event {
            OutboundEvent::BidOnJob { shard, .. } => {
                tracing::info!(shard_id = %shard.id(), "requester: accepting bid");
                inbound_tx
                    .send(TransportEvent::BidAccepted {
                        shard_id: shard.id(),
                    })
                    .await?;
            }
            OutboundEvent::ShardExecutionFinished {
                job_id,
                shard_index,
                message,
                proposal,
                ..
            } => {
                tracing::info!(%job_id, shard_index, message, "requester: verifying proposal");
                let proposal: serde_json::Value = serde_json::from_slice(&proposal)?;
                tracing::info!(proposal = %proposal, "requester: proposal accepted");
                inbound_tx
                    .send(TransportEvent::ResultsVerified {
                        shard_id: gridnode::scheduler::ShardId::new(&job_id, shard_index),
                    })
                    .await?;
            }
            OutboundEvent::PublishShard { shard, .. } => {
                tracing::info!(shard_id = %shard.id(), "requester: shard published, job complete");
                break;
            }
            OutboundEvent::ShardError {
                job_id, message, ..
            } => {
                tracing::error!(%job_id, message, "requester: shard failed");
                break;
            }
            OutboundEvent::CapacityAdvert { node_id, free, .. } => {
                tracing::debug!(%node_id, free = %free, "requester: capacity advert");
            }
        }
    }

    cancel.cancel();
    node_task.await?;
    Ok(())
}

fn tempfile_dir() -> std::io::Result<std::path::PathBuf> {
    let dir = std::env::temp_dir().join(format!("gridnode-loopback-{}", std::process::id()));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
