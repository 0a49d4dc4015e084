//! Shared helpers for scheduler tests: eventually-assertions and recording
//! doubles for the controller and runner capabilities.

#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use gridnode::capacity::{CapacityManager, ResourceUsage, ResourceUsageConfig};
use gridnode::error::{Error, Result};
use gridnode::scheduler::{
    construct_job, Controller, FsmServices, Job, JobDeal, JobShard, ShardRunner,
};

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(20)).await;
    assert!(result, "{}", message);
}

/// One outbound notification observed by the recording controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerCall {
    Bid(String),
    ExecutionFinished { shard: String, proposal: Vec<u8> },
    ShardError(String),
    Publish(String),
}

/// Controller double that records every outbound notification.
#[derive(Default)]
pub struct RecordingController {
    calls: Mutex<Vec<ControllerCall>>,
    fail_bids: bool,
}

impl RecordingController {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A controller whose bid emission always fails.
    pub fn failing_bids() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            fail_bids: true,
        })
    }

    pub fn calls(&self) -> Vec<ControllerCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn bids(&self) -> usize {
        self.count(|call| matches!(call, ControllerCall::Bid(_)))
    }

    pub fn executions_finished(&self) -> usize {
        self.count(|call| matches!(call, ControllerCall::ExecutionFinished { .. }))
    }

    pub fn shard_errors(&self) -> usize {
        self.count(|call| matches!(call, ControllerCall::ShardError(_)))
    }

    pub fn publishes(&self) -> usize {
        self.count(|call| matches!(call, ControllerCall::Publish(_)))
    }

    fn count(&self, pred: impl Fn(&ControllerCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: ControllerCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Controller for RecordingController {
    async fn bid_on_job(&self, shard: &JobShard) -> Result<()> {
        if self.fail_bids {
            return Err(Error::ExecutionFailed("bid emission failed".to_string()));
        }
        self.record(ControllerCall::Bid(shard.id().to_string()));
        Ok(())
    }

    async fn shard_execution_finished(
        &self,
        job_id: Uuid,
        shard_index: u32,
        _message: String,
        proposal: Vec<u8>,
    ) -> Result<()> {
        self.record(ControllerCall::ExecutionFinished {
            shard: format!("{}:{}", job_id, shard_index),
            proposal,
        });
        Ok(())
    }

    async fn shard_error(&self, job_id: Uuid, shard_index: u32, _message: String) -> Result<()> {
        self.record(ControllerCall::ShardError(format!("{}:{}", job_id, shard_index)));
        Ok(())
    }

    async fn publish_shard(&self, shard: &JobShard) -> Result<()> {
        self.record(ControllerCall::Publish(shard.id().to_string()));
        Ok(())
    }
}

/// Runner double returning a fixed proposal or a fixed failure.
pub struct StubRunner {
    proposal: Vec<u8>,
    failure: Option<String>,
}

impl StubRunner {
    pub fn ok(proposal: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            proposal,
            failure: None,
        })
    }

    pub fn failing(reason: &str) -> Arc<Self> {
        Arc::new(Self {
            proposal: Vec::new(),
            failure: Some(reason.to_string()),
        })
    }
}

#[async_trait]
impl ShardRunner for StubRunner {
    async fn run_shard(&self, _shard: &JobShard) -> Result<Vec<u8>> {
        match &self.failure {
            Some(reason) => Err(Error::ExecutionFailed(reason.clone())),
            None => Ok(self.proposal.clone()),
        }
    }
}

pub fn usage(cpu: f64, memory: u64, gpu: u64) -> ResourceUsage {
    ResourceUsage {
        cpu,
        memory,
        disk: 0,
        gpu,
    }
}

pub fn test_job(command: &str) -> Job {
    construct_job(
        "test-requester",
        command,
        vec![],
        ResourceUsageConfig::default(),
        vec![],
        vec![],
        vec![],
        1,
        JobDeal {
            concurrency: 1,
            confidence: 0,
            min_bids: 0,
        },
    )
    .unwrap()
}

pub fn test_shard(command: &str) -> JobShard {
    JobShard {
        job: test_job(command),
        index: 0,
    }
}

/// Capabilities bundle wired with recording doubles, for driving state
/// machines without a full node.
pub struct TestServices {
    pub controller: Arc<RecordingController>,
    pub runner: Arc<StubRunner>,
    pub capacity: Arc<CapacityManager>,
    pub cancel: CancellationToken,
}

impl TestServices {
    pub fn new(total: ResourceUsage) -> Self {
        Self {
            controller: RecordingController::new(),
            runner: StubRunner::ok(vec![0x01]),
            capacity: Arc::new(CapacityManager::new(total)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_controller(mut self, controller: Arc<RecordingController>) -> Self {
        self.controller = controller;
        self
    }

    pub fn with_runner(mut self, runner: Arc<StubRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn services(&self) -> FsmServices {
        FsmServices {
            controller: self.controller.clone(),
            runner: self.runner.clone(),
            capacity: self.capacity.clone(),
            cancel: self.cancel.clone(),
        }
    }
}
