//! Boundary between the gossip transport and the shard state machines.
//!
//! Inbound transport events are translated into typed [`ShardRequest`]s and
//! routed through the manager; outbound events are what this node publishes
//! back to the network. The transport itself (delivery, ordering, retries) is
//! out of scope here; this layer only assumes it may see duplicates.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::capacity::ResourceUsage;
use crate::scheduler::fsm::{ShardAction, ShardRequest};
use crate::scheduler::job::{Job, JobShard, ShardId};
use crate::scheduler::manager::ShardFsmManager;

/// Transport-level failure codes, mapped into human-readable failure reasons
/// before they reach a state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportErrorCode {
    VerifierRejected,
    VerifierUnreachable,
    PeerUnreachable,
    Internal,
}

fn describe(code: TransportErrorCode) -> &'static str {
    match code {
        TransportErrorCode::VerifierRejected => "results rejected by verifier",
        TransportErrorCode::VerifierUnreachable => "verifier unreachable",
        TransportErrorCode::PeerUnreachable => "peer disappeared mid-handshake",
        TransportErrorCode::Internal => "internal transport error",
    }
}

/// Events delivered to this node by the gossip layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TransportEvent {
    JobAnnounced { job: Job },
    BidAccepted { shard_id: ShardId },
    BidRejected { shard_id: ShardId },
    ResultsVerified { shard_id: ShardId },
    VerificationFailed {
        shard_id: ShardId,
        code: TransportErrorCode,
    },
    PeerPublished { shard_id: ShardId },
    Cancelled { shard_id: ShardId },
}

/// Events this node publishes to the gossip layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OutboundEvent {
    BidOnJob {
        node_id: String,
        shard: JobShard,
    },
    ShardExecutionFinished {
        node_id: String,
        job_id: Uuid,
        shard_index: u32,
        message: String,
        proposal: Vec<u8>,
    },
    ShardError {
        node_id: String,
        job_id: Uuid,
        shard_index: u32,
        message: String,
    },
    PublishShard {
        node_id: String,
        shard: JobShard,
    },
    CapacityAdvert {
        node_id: String,
        total: ResourceUsage,
        free: ResourceUsage,
    },
}

/// Translates transport events into state machine requests.
///
/// The transport does not guarantee exactly-once, so deliveries are
/// deduplicated by `(shard, action)`. Delivery uses the manager's bounded
/// deadline: a stuck machine is escalated by logging, never bypassed.
pub struct EventAdapter {
    shards: Arc<ShardFsmManager>,
    seen: Mutex<HashMap<ShardId, HashSet<ShardAction>>>,
}

impl EventAdapter {
    pub fn new(shards: Arc<ShardFsmManager>) -> Self {
        Self {
            shards,
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub async fn handle(&self, event: TransportEvent) {
        let (shard_id, request) = match event {
            TransportEvent::BidAccepted { shard_id } => {
                (shard_id, ShardRequest::new(ShardAction::Run))
            }
            TransportEvent::BidRejected { shard_id } => {
                (shard_id, ShardRequest::new(ShardAction::Rejected))
            }
            TransportEvent::ResultsVerified { shard_id } => {
                (shard_id, ShardRequest::new(ShardAction::Publish))
            }
            TransportEvent::VerificationFailed { shard_id, code } => {
                (shard_id, ShardRequest::fail(describe(code)))
            }
            TransportEvent::Cancelled { shard_id } => {
                (shard_id, ShardRequest::fail("cancelled by requester"))
            }
            TransportEvent::PeerPublished { shard_id } => {
                // Publication confirmations are informational; publishing is
                // driven locally by the state machine.
                tracing::debug!(shard_id = %shard_id, "peer publish confirmed");
                return;
            }
            TransportEvent::JobAnnounced { job } => {
                tracing::warn!(job_id = %job.id, "job announcements are handled by the node, not the adapter");
                return;
            }
        };

        if !self.first_delivery(&shard_id, request.action) {
            tracing::warn!(
                shard_id = %shard_id,
                action = %request.action,
                "swallowing duplicate event"
            );
            return;
        }

        if !self.shards.send_request(&shard_id, request).await {
            // Machine already reaped; its dedup history can go too.
            self.seen.lock().unwrap().remove(&shard_id);
        }
    }

    fn first_delivery(&self, shard_id: &ShardId, action: ShardAction) -> bool {
        let mut seen = self.seen.lock().unwrap();
        seen.entry(shard_id.clone()).or_default().insert(action)
    }
}
