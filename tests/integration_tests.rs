//! End-to-end tests: a full compute node with the shell executor, driven by a
//! loopback requester that accepts bids and verifies proposals.

mod test_harness;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use gridnode::capacity::ResourceUsageConfig;
use gridnode::config::NodeConfig;
use gridnode::events::{OutboundEvent, TransportEvent};
use gridnode::node::ComputeNode;
use gridnode::scheduler::{construct_job, Job, JobDeal, ShardId};
use gridnode::worker::ShellExecutor;
use test_harness::assert_eventually;

struct LoopbackNode {
    node: Arc<ComputeNode>,
    inbound_tx: mpsc::Sender<TransportEvent>,
    events: Arc<Mutex<Vec<OutboundEvent>>>,
    cancel: CancellationToken,
    results_dir: PathBuf,
    _results_dir_guard: tempfile::TempDir,
}

impl LoopbackNode {
    /// Starts a node plus a requester task that records every outbound event
    /// and, when `auto_requester` is set, accepts bids and verifies results.
    async fn start(cpu: &str, auto_requester: bool) -> Self {
        let results_dir_guard = tempfile::tempdir().unwrap();
        let results_dir = results_dir_guard.path().to_path_buf();

        let mut config = NodeConfig::new(
            "test-node",
            ResourceUsageConfig {
                cpu: cpu.to_string(),
                memory: "1Gi".to_string(),
                disk: "1Gi".to_string(),
                gpu: "0".to_string(),
            },
        )
        .with_results_dir(&results_dir);
        config.control_interval_ms = 20;

        let cancel = CancellationToken::new();
        let (outbound_tx, mut outbound_rx) = mpsc::channel(64);
        let (inbound_tx, inbound_rx) = mpsc::channel(64);

        let executor = Arc::new(ShellExecutor::new());
        let node = Arc::new(
            ComputeNode::new(config, executor, outbound_tx, cancel.clone()).unwrap(),
        );

        let events: Arc<Mutex<Vec<OutboundEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let recorded = events.clone();
        let requester_tx = inbound_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = outbound_rx.recv().await {
                recorded.lock().unwrap().push(event.clone());
                if !auto_requester {
                    continue;
                }
                match event {
                    OutboundEvent::BidOnJob { shard, .. } => {
                        let _ = requester_tx
                            .send(TransportEvent::BidAccepted {
                                shard_id: shard.id(),
                            })
                            .await;
                    }
                    OutboundEvent::ShardExecutionFinished {
                        job_id,
                        shard_index,
                        ..
                    } => {
                        let _ = requester_tx
                            .send(TransportEvent::ResultsVerified {
                                shard_id: ShardId::new(&job_id, shard_index),
                            })
                            .await;
                    }
                    _ => {}
                }
            }
        });

        let runner = node.clone();
        let run_cancel = cancel.clone();
        tokio::spawn(async move {
            runner.run(inbound_rx, run_cancel).await;
        });

        Self {
            node,
            inbound_tx,
            events,
            cancel,
            results_dir,
            _results_dir_guard: results_dir_guard,
        }
    }

    async fn announce(&self, job: Job) {
        self.inbound_tx
            .send(TransportEvent::JobAnnounced { job })
            .await
            .unwrap();
    }

    fn events(&self) -> Vec<OutboundEvent> {
        self.events.lock().unwrap().clone()
    }

    fn count(&self, pred: impl Fn(&OutboundEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }

    fn bids(&self) -> usize {
        self.count(|e| matches!(e, OutboundEvent::BidOnJob { .. }))
    }

    fn publishes(&self) -> usize {
        self.count(|e| matches!(e, OutboundEvent::PublishShard { .. }))
    }

    fn shard_errors(&self) -> usize {
        self.count(|e| matches!(e, OutboundEvent::ShardError { .. }))
    }
}

impl Drop for LoopbackNode {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn job(command: &str, cpu: &str) -> Job {
    construct_job(
        "loopback-requester",
        command,
        vec![],
        ResourceUsageConfig {
            cpu: cpu.to_string(),
            memory: "10Mi".to_string(),
            disk: "".to_string(),
            gpu: "".to_string(),
        },
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

#[tokio::test]
async fn full_lifecycle_over_the_loopback_requester() {
    let harness = LoopbackNode::start("2", true).await;
    let announced = job("echo hello from the grid", "1");
    let job_id = announced.id;
    harness.announce(announced).await;

    assert_eventually(
        || async { harness.publishes() == 1 },
        Duration::from_secs(5),
        "shard should publish",
    )
    .await;

    assert_eq!(harness.bids(), 1);
    assert_eq!(harness.shard_errors(), 0);

    // The proposal carries the executor's verdict on the shard.
    let events = harness.events();
    let proposal = events
        .iter()
        .find_map(|event| match event {
            OutboundEvent::ShardExecutionFinished { proposal, .. } => Some(proposal.clone()),
            _ => None,
        })
        .expect("execution finished event");
    let proposal: serde_json::Value = serde_json::from_slice(&proposal).unwrap();
    assert_eq!(proposal["exit_code"], 0);

    // Result files landed under the node's results directory.
    let shard_dir = harness.results_dir.join(format!("{}-0", job_id));
    let stdout = std::fs::read(shard_dir.join("stdout")).unwrap();
    assert_eq!(stdout, b"hello from the grid\n");
}

#[tokio::test]
async fn oversized_job_never_bids() {
    let harness = LoopbackNode::start("1", true).await;
    harness.announce(job("echo too big", "8")).await;

    // The machine is created, fails with a capacity error, and is reaped.
    assert_eventually(
        || async { harness.node.shards.all().is_empty() },
        Duration::from_secs(5),
        "oversized shard should terminate and be reaped",
    )
    .await;

    assert_eq!(harness.bids(), 0);
    // No bid was ever sent, so no failure is broadcast either.
    assert_eq!(harness.shard_errors(), 0);
}

#[tokio::test]
async fn duplicate_announcements_run_the_shard_once() {
    let harness = LoopbackNode::start("2", true).await;
    let announced = job("echo once", "1");
    harness.announce(announced.clone()).await;
    harness.announce(announced).await;

    assert_eventually(
        || async { harness.publishes() == 1 },
        Duration::from_secs(5),
        "shard should publish once",
    )
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.bids(), 1);
    assert_eq!(harness.publishes(), 1);
}

#[tokio::test]
async fn admission_is_head_of_line_across_jobs() {
    let harness = LoopbackNode::start("2", true).await;
    let first = job("sleep 0.2; echo first", "2");
    let second = job("echo second", "1");
    let first_id = first.id;
    let second_id = second.id;
    harness.announce(first).await;
    // Give the control loop a tick to admit the head before the second
    // announcement lands behind it.
    tokio::time::sleep(Duration::from_millis(60)).await;
    harness.announce(second).await;

    assert_eventually(
        || async { harness.publishes() == 2 },
        Duration::from_secs(10),
        "both shards should eventually publish",
    )
    .await;

    // The second job fits the node on its own, but it may only start bidding
    // once the first has finished and freed its reservation.
    let events = harness.events();
    let index_of = |pred: &dyn Fn(&OutboundEvent) -> bool| {
        events.iter().position(|e| pred(e)).expect("expected event")
    };
    let first_publish = index_of(&|e| {
        matches!(e, OutboundEvent::PublishShard { shard, .. } if shard.job.id == first_id)
    });
    let second_bid = index_of(&|e| {
        matches!(e, OutboundEvent::BidOnJob { shard, .. } if shard.job.id == second_id)
    });
    assert!(
        second_bid > first_publish,
        "second job bid (index {}) should come after first job publish (index {})",
        second_bid,
        first_publish
    );
}

#[tokio::test]
async fn cancellation_mid_run_reports_shard_error() {
    let harness = LoopbackNode::start("2", true).await;
    harness.announce(job("sleep 30", "1")).await;

    assert_eventually(
        || async { harness.bids() == 1 },
        Duration::from_secs(5),
        "shard should bid",
    )
    .await;
    // Let the accepted bid reach the Running state before pulling the plug.
    tokio::time::sleep(Duration::from_millis(200)).await;

    harness.cancel.cancel();

    assert_eventually(
        || async { harness.shard_errors() == 1 },
        Duration::from_secs(5),
        "cancelled shard should report a failure to its requester",
    )
    .await;
    assert_eq!(harness.publishes(), 0);
}

#[tokio::test]
async fn capacity_is_advertised_to_the_network() {
    let harness = LoopbackNode::start("2", false).await;

    assert_eventually(
        || async {
            harness.count(|e| matches!(e, OutboundEvent::CapacityAdvert { .. })) >= 1
        },
        Duration::from_secs(2),
        "node should advertise its capacity",
    )
    .await;

    // Idle node: everything it has is free.
    let events = harness.events();
    assert!(events.iter().any(|event| matches!(
        event,
        OutboundEvent::CapacityAdvert { total, free, .. } if free == total
    )));
}

#[tokio::test]
async fn duplicate_transport_events_are_swallowed() {
    let harness = LoopbackNode::start("2", false).await;
    let announced = job("echo dedup", "1");
    let shard_id = ShardId::new(&announced.id, 0);
    harness.announce(announced).await;

    assert_eventually(
        || async { harness.bids() == 1 },
        Duration::from_secs(5),
        "shard should bid",
    )
    .await;

    // The transport redelivers the acceptance; only one run happens.
    for _ in 0..3 {
        harness
            .inbound_tx
            .send(TransportEvent::BidAccepted {
                shard_id: shard_id.clone(),
            })
            .await
            .unwrap();
    }
    harness
        .inbound_tx
        .send(TransportEvent::ResultsVerified {
            shard_id: shard_id.clone(),
        })
        .await
        .unwrap();

    assert_eventually(
        || async { harness.publishes() == 1 },
        Duration::from_secs(5),
        "shard should publish once",
    )
    .await;
    assert_eq!(harness.shard_errors(), 0);
}
