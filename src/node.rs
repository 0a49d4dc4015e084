use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::capacity::{CapacityManager, ResourceUsage};
use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::events::{EventAdapter, OutboundEvent, TransportEvent};
use crate::scheduler::fsm::{Controller, FsmServices, ShardAction, ShardRequest, ShardRunner};
use crate::scheduler::job::{Job, JobShard, ShardId};
use crate::scheduler::manager::ShardFsmManager;
use crate::worker::Executor;

/// The compute node's claim about one executed shard, handed to the verifier
/// before publication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultProposal {
    pub shard_id: ShardId,
    pub exit_code: i32,
    pub stdout_len: u64,
    pub stderr_len: u64,
    pub results_path: String,
}

/// Implements the narrow capabilities the state machines consume: outbound
/// notifications over the gossip channel and shard execution through the
/// installed executor. Holds no reference back to the node or the manager.
pub struct NodeController {
    node_id: String,
    executor: Arc<dyn Executor>,
    results_dir: PathBuf,
    outbound: mpsc::Sender<OutboundEvent>,
}

impl NodeController {
    pub fn new(
        node_id: String,
        executor: Arc<dyn Executor>,
        results_dir: PathBuf,
        outbound: mpsc::Sender<OutboundEvent>,
    ) -> Self {
        Self {
            node_id,
            executor,
            results_dir,
            outbound,
        }
    }

    async fn publish(&self, event: OutboundEvent) -> Result<()> {
        self.outbound
            .send(event)
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    pub async fn advertise_capacity(&self, total: ResourceUsage, free: ResourceUsage) -> Result<()> {
        self.publish(OutboundEvent::CapacityAdvert {
            node_id: self.node_id.clone(),
            total,
            free,
        })
        .await
    }
}

#[async_trait]
impl Controller for NodeController {
    async fn bid_on_job(&self, shard: &JobShard) -> Result<()> {
        tracing::info!(shard_id = %shard.id(), "bidding on shard");
        self.publish(OutboundEvent::BidOnJob {
            node_id: self.node_id.clone(),
            shard: shard.clone(),
        })
        .await
    }

    async fn shard_execution_finished(
        &self,
        job_id: Uuid,
        shard_index: u32,
        message: String,
        proposal: Vec<u8>,
    ) -> Result<()> {
        self.publish(OutboundEvent::ShardExecutionFinished {
            node_id: self.node_id.clone(),
            job_id,
            shard_index,
            message,
            proposal,
        })
        .await
    }

    async fn shard_error(&self, job_id: Uuid, shard_index: u32, message: String) -> Result<()> {
        self.publish(OutboundEvent::ShardError {
            node_id: self.node_id.clone(),
            job_id,
            shard_index,
            message,
        })
        .await
    }

    async fn publish_shard(&self, shard: &JobShard) -> Result<()> {
        tracing::info!(shard_id = %shard.id(), "publishing shard results to requester");
        self.publish(OutboundEvent::PublishShard {
            node_id: self.node_id.clone(),
            shard: shard.clone(),
        })
        .await
    }
}

#[async_trait]
impl ShardRunner for NodeController {
    /// Runs one shard and assembles the results proposal. A non-zero exit
    /// code still yields a proposal; whether that outcome is acceptable is
    /// the verifier's call, not the compute node's.
    async fn run_shard(&self, shard: &JobShard) -> Result<Vec<u8>> {
        let shard_id = shard.id();
        let dir = self.results_dir.join(shard_id.as_str().replace(':', "-"));
        tokio::fs::create_dir_all(&dir).await?;

        let exit_code = match self.executor.run_shard(shard, &dir).await {
            Ok(()) => 0,
            Err(Error::NonZeroExitCode(code)) => {
                tracing::warn!(shard_id = %shard_id, exit_code = code, "shard exited non-zero; proposing results anyway");
                code
            }
            Err(e) => return Err(e),
        };

        let stdout_len = tokio::fs::metadata(dir.join("stdout")).await?.len();
        let stderr_len = tokio::fs::metadata(dir.join("stderr")).await?.len();
        let proposal = ResultProposal {
            shard_id,
            exit_code,
            stdout_len,
            stderr_len,
            results_path: dir.to_string_lossy().into_owned(),
        };
        Ok(serde_json::to_vec(&proposal)?)
    }
}

/// One compute node: capacity accounting, shard state machines, event
/// translation, and the control loop that ties them together.
pub struct ComputeNode {
    pub config: NodeConfig,
    pub capacity: Arc<CapacityManager>,
    pub shards: Arc<ShardFsmManager>,
    executor: Arc<dyn Executor>,
    controller: Arc<NodeController>,
    adapter: EventAdapter,
    services: FsmServices,
    default_requirements: ResourceUsage,
}

impl ComputeNode {
    pub fn new(
        config: NodeConfig,
        executor: Arc<dyn Executor>,
        outbound: mpsc::Sender<OutboundEvent>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let total = ResourceUsage::parse(&config.capacity)?;
        let default_requirements = ResourceUsage::parse(&config.default_job_requirements)?;
        let capacity = Arc::new(CapacityManager::new(total));
        let shards = Arc::new(ShardFsmManager::new(Duration::from_millis(
            config.request_timeout_ms,
        )));
        let controller = Arc::new(NodeController::new(
            config.node_id.clone(),
            executor.clone(),
            config.results_dir.clone(),
            outbound,
        ));
        let services = FsmServices {
            controller: controller.clone(),
            runner: controller.clone(),
            capacity: capacity.clone(),
            cancel,
        };
        let adapter = EventAdapter::new(shards.clone());

        tracing::info!(node_id = %config.node_id, total = %total, "compute node initialized");

        Ok(Self {
            config,
            capacity,
            shards,
            executor,
            controller,
            adapter,
            services,
            default_requirements,
        })
    }

    /// Static eligibility check for an announced job, then one state machine
    /// per shard. Ineligible jobs are skipped quietly; other nodes will bid.
    pub async fn on_job_announcement(&self, job: Job) {
        if !self.executor.is_installed().await {
            tracing::debug!(job_id = %job.id, "executor not installed; skipping job");
            return;
        }
        let requirements = match ResourceUsage::parse(&job.spec.resources) {
            Ok(parsed) => parsed.with_defaults(&self.default_requirements),
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "unparseable job resources; skipping job");
                return;
            }
        };
        let requirements = match self.input_adjusted_requirements(&job, requirements).await {
            Some(requirements) => requirements,
            None => return,
        };

        for index in 0..job.spec.shard_count {
            let shard = JobShard {
                job: job.clone(),
                index,
            };
            self.shards
                .start_if_absent(shard, requirements, self.services.clone());
        }
    }

    /// Inputs must already be resolvable on this node, and their size counts
    /// against the shard's disk requirement.
    async fn input_adjusted_requirements(
        &self,
        job: &Job,
        mut requirements: ResourceUsage,
    ) -> Option<ResourceUsage> {
        for input in &job.spec.inputs {
            match self.executor.has_storage_locally(input).await {
                Ok(true) => match self.executor.get_volume_size(input).await {
                    Ok(size) => requirements.disk += size,
                    Err(e) => {
                        tracing::warn!(job_id = %job.id, volume = %input.name, error = %e, "failed to size input volume; skipping job");
                        return None;
                    }
                },
                Ok(false) => {
                    tracing::debug!(job_id = %job.id, volume = %input.name, "input not available locally; skipping job");
                    return None;
                }
                Err(e) => {
                    tracing::warn!(job_id = %job.id, volume = %input.name, error = %e, "failed to check input volume; skipping job");
                    return None;
                }
            }
        }
        Some(requirements)
    }

    /// Runs the node until the inbound channel closes or the token fires.
    ///
    /// Spawns the control loop (periodic rebalance and bid dispatch) and the
    /// capacity advertisement loop, then consumes inbound transport events.
    pub async fn run(
        self: Arc<Self>,
        inbound: mpsc::Receiver<TransportEvent>,
        cancel: CancellationToken,
    ) {
        let control = self.clone();
        let control_cancel = cancel.clone();
        tokio::spawn(async move {
            control.control_loop(control_cancel).await;
        });

        let advertiser = self.clone();
        let advertise_cancel = cancel.clone();
        tokio::spawn(async move {
            advertiser.advertise_loop(advertise_cancel).await;
        });

        self.event_loop(inbound, cancel).await;
    }

    /// Periodically asks the capacity manager to rebalance, then dispatches
    /// its decisions: `Bid` to every newly admitted shard, a fatal failure to
    /// every shard that can never fit this node. Requests are sent outside
    /// all locks.
    async fn control_loop(&self, cancel: CancellationToken) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.control_interval_ms));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            let outcome = self.capacity.rebalance(self.shards.as_ref());
            for shard_id in outcome.oversized {
                self.shards
                    .send_request(&shard_id, ShardRequest::fail(Error::CapacityExceeded.to_string()))
                    .await;
            }
            for shard_id in outcome.to_bid {
                self.shards
                    .send_request(&shard_id, ShardRequest::new(ShardAction::Bid))
                    .await;
            }
        }
    }

    /// Advertises total and free capacity to the gossip layer so requesters
    /// can target their announcements.
    async fn advertise_loop(&self, cancel: CancellationToken) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.advertise_interval_ms));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            let total = self.capacity.total();
            let free = self.capacity.free();
            if let Err(e) = self.controller.advertise_capacity(total, free).await {
                tracing::warn!(error = %e, "failed to advertise capacity");
                break;
            }
        }
    }

    async fn event_loop(
        &self,
        mut inbound: mpsc::Receiver<TransportEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("shutdown requested; stopping event loop");
                    break;
                }
                event = inbound.recv() => match event {
                    Some(event) => event,
                    None => {
                        tracing::info!("inbound event channel closed; stopping event loop");
                        break;
                    }
                },
            };
            match event {
                TransportEvent::JobAnnounced { job } => self.on_job_announcement(job).await,
                other => self.adapter.handle(other).await,
            }
        }
    }
}
