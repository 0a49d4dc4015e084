use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::capacity::CapacityManager;
use crate::error::{Error, Result};
use crate::scheduler::job::{JobShard, ShardId};

/// Actions that can be requested of a shard state machine from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShardAction {
    /// Capacity has been reserved; announce a bid for the shard.
    Bid,
    /// The requester refused our bid; terminate cleanly.
    Rejected,
    /// Our bid was accepted; execute the shard.
    Run,
    /// The verifier accepted the results; publish them.
    Publish,
    /// Something failed outside the state machine; abort with a reason.
    Fail,
}

impl std::fmt::Display for ShardAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ShardAction::Bid => "Bid",
            ShardAction::Rejected => "Rejected",
            ShardAction::Run => "Run",
            ShardAction::Publish => "Publish",
            ShardAction::Fail => "Fail",
        };
        write!(f, "{}", name)
    }
}

/// Request enqueued on a state machine's inbound channel.
#[derive(Debug, Clone)]
pub struct ShardRequest {
    pub action: ShardAction,
    pub failure_reason: Option<String>,
}

impl ShardRequest {
    pub fn new(action: ShardAction) -> Self {
        Self {
            action,
            failure_reason: None,
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            action: ShardAction::Fail,
            failure_reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    Initial,
    /// Selected as a candidate, waiting for capacity to be reserved.
    Enqueued,
    /// Bid announced, waiting for it to be accepted or rejected.
    Bidding,
    /// Bid accepted, the shard is executing.
    Running,
    /// Execution finished, handing the results proposal to the verifier.
    PublishingToVerifier,
    /// Waiting for the verifier's decision.
    VerifyingResults,
    /// Results verified, publishing them to the requester.
    PublishingToRequester,
    /// Failed; the error path always continues to `Completed`.
    Error,
    /// Terminal, reached on success and failure alike.
    Completed,
}

impl ShardState {
    /// States whose reserved capacity counts against the node total.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ShardState::Bidding
                | ShardState::Running
                | ShardState::PublishingToVerifier
                | ShardState::VerifyingResults
                | ShardState::PublishingToRequester
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ShardState::Completed)
    }
}

impl std::fmt::Display for ShardState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ShardState::Initial => "InitialState",
            ShardState::Enqueued => "Enqueued",
            ShardState::Bidding => "Bidding",
            ShardState::Running => "Running",
            ShardState::PublishingToVerifier => "PublishingToVerifier",
            ShardState::VerifyingResults => "VerifyingResults",
            ShardState::PublishingToRequester => "PublishingToRequester",
            ShardState::Error => "Error",
            ShardState::Completed => "Completed",
        };
        write!(f, "{}", name)
    }
}

/// Outbound notifications the state machine needs from its host node.
/// Injected at construction so the machine holds no back-pointer to the node
/// or its manager.
#[async_trait]
pub trait Controller: Send + Sync {
    async fn bid_on_job(&self, shard: &JobShard) -> Result<()>;
    async fn shard_execution_finished(
        &self,
        job_id: Uuid,
        shard_index: u32,
        message: String,
        proposal: Vec<u8>,
    ) -> Result<()>;
    async fn shard_error(&self, job_id: Uuid, shard_index: u32, message: String) -> Result<()>;
    async fn publish_shard(&self, shard: &JobShard) -> Result<()>;
}

/// Executes one shard and returns the results proposal handed to the verifier.
#[async_trait]
pub trait ShardRunner: Send + Sync {
    async fn run_shard(&self, shard: &JobShard) -> Result<Vec<u8>>;
}

/// Capabilities handed to every state machine at construction.
#[derive(Clone)]
pub struct FsmServices {
    pub controller: Arc<dyn Controller>,
    pub runner: Arc<dyn ShardRunner>,
    pub capacity: Arc<CapacityManager>,
    pub cancel: CancellationToken,
}

/// Current and previous state, shared between the driver task (sole writer)
/// and the manager's snapshot accessors.
#[derive(Debug)]
pub(crate) struct StateCell {
    states: Mutex<(ShardState, ShardState)>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        Self {
            states: Mutex::new((ShardState::Initial, ShardState::Initial)),
        }
    }

    pub(crate) fn current(&self) -> ShardState {
        self.states.lock().unwrap().0
    }

    pub(crate) fn previous(&self) -> ShardState {
        self.states.lock().unwrap().1
    }

    fn transition_to(&self, next: ShardState) -> ShardState {
        let mut states = self.states.lock().unwrap();
        let prev = states.0;
        *states = (next, prev);
        prev
    }
}

/// One finite-state machine driving a single shard from enqueue to terminal.
///
/// `Enqueued`, `Bidding` and `VerifyingResults` are waiting states that block
/// on the inbound channel; the remaining states perform their side effect and
/// transition on their own. The driver task is the only consumer of the
/// channel and the only writer of the state cell.
pub(crate) struct ShardFsm {
    shard: JobShard,
    shard_id: ShardId,
    services: FsmServices,
    req_rx: mpsc::Receiver<ShardRequest>,
    state: Arc<StateCell>,
    terminated: Arc<AtomicBool>,
    result_proposal: Vec<u8>,
    bid_sent: bool,
    error_msg: String,
}

impl ShardFsm {
    pub(crate) fn new(
        shard: JobShard,
        req_rx: mpsc::Receiver<ShardRequest>,
        state: Arc<StateCell>,
        terminated: Arc<AtomicBool>,
        services: FsmServices,
    ) -> Self {
        let shard_id = shard.id();
        Self {
            shard,
            shard_id,
            services,
            req_rx,
            state,
            terminated,
            result_proposal: Vec::new(),
            bid_sent: false,
            error_msg: String::new(),
        }
    }

    /// Runs the machine to completion, then marks it terminated and drops the
    /// inbound receiver. Late senders observe a closed channel; the manager's
    /// `send_request` turns that into a logged no-op.
    pub(crate) async fn run(mut self) {
        let mut state = ShardState::Enqueued;
        loop {
            state = match state {
                ShardState::Enqueued => self.enqueued_state().await,
                ShardState::Bidding => self.bidding_state().await,
                ShardState::Running => self.running_state().await,
                ShardState::PublishingToVerifier => self.publishing_to_verifier_state().await,
                ShardState::VerifyingResults => self.verifying_results_state().await,
                ShardState::PublishingToRequester => self.publishing_to_requester_state().await,
                ShardState::Error => self.error_state().await,
                ShardState::Initial | ShardState::Completed => {
                    self.transition(ShardState::Completed);
                    break;
                }
            };
        }
        self.terminated.store(true, Ordering::Release);
        self.services.capacity.release(&self.shard_id);
    }

    fn transition(&self, next: ShardState) {
        let prev = self.state.transition_to(next);
        tracing::debug!(shard_id = %self.shard_id, from = %prev, to = %next, "shard state transition");
    }

    /// Next inbound request. Node shutdown surfaces as a failure request so
    /// waiting states drain through the error path.
    async fn next_request(&mut self) -> ShardRequest {
        tokio::select! {
            _ = self.services.cancel.cancelled() => {
                ShardRequest::fail(Error::CancellationRequested.to_string())
            }
            req = self.req_rx.recv() => {
                req.unwrap_or_else(|| ShardRequest::fail("request channel closed"))
            }
        }
    }

    /// Runs a driver-state side effect under the cancellation token.
    async fn cancellable<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            _ = self.services.cancel.cancelled() => Err(Error::CancellationRequested),
            res = fut => res,
        }
    }

    fn ignore(&self, action: ShardAction) {
        tracing::warn!(
            shard_id = %self.shard_id,
            state = %self.state.current(),
            action = %action,
            "ignoring unexpected action"
        );
    }

    fn failure_reason(req: ShardRequest) -> String {
        req.failure_reason
            .unwrap_or_else(|| "unspecified failure".to_string())
    }

    // Waiting for capacity to be reserved before bidding on the job.
    async fn enqueued_state(&mut self) -> ShardState {
        self.transition(ShardState::Enqueued);
        loop {
            let req = self.next_request().await;
            match req.action {
                ShardAction::Bid => {
                    let bid = self.services.controller.bid_on_job(&self.shard);
                    match self.cancellable(bid).await {
                        Ok(()) => {
                            // Once the bid is out, any later failure must be
                            // reported so the requester can retry elsewhere.
                            self.bid_sent = true;
                            return ShardState::Bidding;
                        }
                        Err(e) => {
                            self.error_msg = e.to_string();
                            return ShardState::Error;
                        }
                    }
                }
                ShardAction::Fail => {
                    self.error_msg = Self::failure_reason(req);
                    return ShardState::Error;
                }
                other => self.ignore(other),
            }
        }
    }

    // Bid announced, waiting for the requester's decision.
    async fn bidding_state(&mut self) -> ShardState {
        self.transition(ShardState::Bidding);
        loop {
            let req = self.next_request().await;
            match req.action {
                ShardAction::Run => return ShardState::Running,
                ShardAction::Rejected => {
                    tracing::info!(shard_id = %self.shard_id, "bid rejected by requester");
                    return ShardState::Completed;
                }
                ShardAction::Fail => {
                    self.error_msg = Self::failure_reason(req);
                    return ShardState::Error;
                }
                other => self.ignore(other),
            }
        }
    }

    // Bid accepted; execute the shard and keep the results proposal.
    async fn running_state(&mut self) -> ShardState {
        self.transition(ShardState::Running);
        let run = self.services.runner.run_shard(&self.shard);
        match self.cancellable(run).await {
            Ok(proposal) => {
                self.result_proposal = proposal;
                ShardState::PublishingToVerifier
            }
            Err(e) => {
                self.error_msg = e.to_string();
                ShardState::Error
            }
        }
    }

    async fn publishing_to_verifier_state(&mut self) -> ShardState {
        self.transition(ShardState::PublishingToVerifier);
        let message = format!(
            "got results proposal of length: {}",
            self.result_proposal.len()
        );
        let notify = self.services.controller.shard_execution_finished(
            self.shard.job.id,
            self.shard.index,
            message,
            self.result_proposal.clone(),
        );
        match self.cancellable(notify).await {
            Ok(()) => ShardState::VerifyingResults,
            Err(e) => {
                self.error_msg = e.to_string();
                ShardState::Error
            }
        }
    }

    // Waiting for the verifier's decision on the proposal.
    async fn verifying_results_state(&mut self) -> ShardState {
        self.transition(ShardState::VerifyingResults);
        loop {
            let req = self.next_request().await;
            match req.action {
                ShardAction::Publish => return ShardState::PublishingToRequester,
                ShardAction::Fail => {
                    self.error_msg = Self::failure_reason(req);
                    return ShardState::Error;
                }
                other => self.ignore(other),
            }
        }
    }

    async fn publishing_to_requester_state(&mut self) -> ShardState {
        self.transition(ShardState::PublishingToRequester);
        let publish = self.services.controller.publish_shard(&self.shard);
        match self.cancellable(publish).await {
            Ok(()) => ShardState::Completed,
            Err(e) => {
                self.error_msg = e.to_string();
                ShardState::Error
            }
        }
    }

    async fn error_state(&mut self) -> ShardState {
        self.transition(ShardState::Error);
        let message = format!("{} failed: {}", self.shard, self.error_msg);
        tracing::error!(shard_id = %self.shard_id, error = %self.error_msg, "shard failed");
        if self.bid_sent {
            // The requester saw our bid; it must also see the failure. This is
            // the final notification, so it is attempted even during shutdown.
            if let Err(e) = self
                .services
                .controller
                .shard_error(self.shard.job.id, self.shard.index, message)
                .await
            {
                tracing::error!(
                    shard_id = %self.shard_id,
                    error = %e,
                    "failed to report shard error"
                );
            }
        }
        ShardState::Completed
    }
}
