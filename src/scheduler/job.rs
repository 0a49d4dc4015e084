use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::capacity::ResourceUsageConfig;
use crate::error::{Error, Result};

/// Stable identifier for one shard of one job, derived from
/// `(job id, shard index)`. Used as the map key across the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardId(String);

impl ShardId {
    pub fn new(job_id: &Uuid, index: u32) -> Self {
        Self(format!("{}:{}", job_id, index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A named input or output volume attached to a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSpec {
    pub name: String,
    pub path: String,
}

/// What to run and what it needs. The command is executed by the node's
/// installed executor; resource strings are parsed at admission time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub command: String,
    pub env: Vec<String>,
    pub resources: ResourceUsageConfig,
    pub inputs: Vec<StorageSpec>,
    pub outputs: Vec<StorageSpec>,
    pub annotations: Vec<String>,
    /// How many shards the job fans out into. Always at least 1.
    pub shard_count: u32,
}

/// Requester-side scheduling terms. Carried opaquely by the compute node and
/// echoed back on outbound events; only the requester consumes them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct JobDeal {
    pub concurrency: u32,
    pub confidence: u32,
    pub min_bids: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub requester_node: String,
    pub spec: JobSpec,
    pub deal: JobDeal,
    pub created_at: DateTime<Utc>,
}

/// One unit of work: a single shard of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobShard {
    pub job: Job,
    pub index: u32,
}

impl JobShard {
    pub fn id(&self) -> ShardId {
        ShardId::new(&self.job.id, self.index)
    }
}

impl std::fmt::Display for JobShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "shard {}", self.id())
    }
}

/// Annotations are forwarded to other nodes, so only a conservative
/// character set is allowed through.
fn is_safe_annotation(annotation: &str) -> bool {
    !annotation.is_empty()
        && annotation
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
}

/// Build a job from user input, validating the deal and filtering unsafe
/// annotations.
#[allow(clippy::too_many_arguments)]
pub fn construct_job(
    requester_node: impl Into<String>,
    command: impl Into<String>,
    env: Vec<String>,
    resources: ResourceUsageConfig,
    inputs: Vec<StorageSpec>,
    outputs: Vec<StorageSpec>,
    annotations: Vec<String>,
    shard_count: u32,
    deal: JobDeal,
) -> Result<Job> {
    if deal.concurrency == 0 {
        return Err(Error::InvalidJob("concurrency must be >= 1".to_string()));
    }
    if shard_count == 0 {
        return Err(Error::InvalidJob("shard count must be >= 1".to_string()));
    }

    let (safe, unsafe_annotations): (Vec<String>, Vec<String>) = annotations
        .into_iter()
        .partition(|a| is_safe_annotation(a));
    if !unsafe_annotations.is_empty() {
        tracing::warn!(
            dropped = ?unsafe_annotations,
            "dropping annotations with unsafe characters"
        );
    }

    Ok(Job {
        id: Uuid::new_v4(),
        requester_node: requester_node.into(),
        spec: JobSpec {
            command: command.into(),
            env,
            resources,
            inputs,
            outputs,
            annotations: safe,
            shard_count,
        },
        deal,
        created_at: Utc::now(),
    })
}
