use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::capacity::{CapacityItem, CapacityTracker, ResourceUsage};
use crate::scheduler::fsm::{FsmServices, ShardFsm, ShardRequest, ShardState, StateCell};
use crate::scheduler::job::{JobShard, ShardId};

const REQUEST_CHANNEL_CAPACITY: usize = 16;

/// Shared view of one live state machine: its identity, capacity claim,
/// current state, and the sending half of its inbound channel.
#[derive(Clone)]
pub struct ShardHandle {
    capacity_item: CapacityItem,
    state: Arc<StateCell>,
    tx: mpsc::Sender<ShardRequest>,
    terminated: Arc<AtomicBool>,
}

impl ShardHandle {
    pub fn shard_id(&self) -> &ShardId {
        &self.capacity_item.shard_id
    }

    pub fn requirements(&self) -> ResourceUsage {
        self.capacity_item.requirements
    }

    pub fn capacity_item(&self) -> &CapacityItem {
        &self.capacity_item
    }

    pub fn state(&self) -> ShardState {
        self.state.current()
    }

    pub fn previous_state(&self) -> ShardState {
        self.state.previous()
    }
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<ShardId, ShardHandle>,
    /// Insertion order is admission priority: earlier entries bid first when
    /// capacity frees up.
    ordered: VecDeque<ShardHandle>,
}

/// Owns the collection of live shard state machines: O(1) event routing via
/// the id map, admission ordering via the insertion-ordered list, and the
/// reaper that drains terminal machines from the front of that list.
pub struct ShardFsmManager {
    inner: Mutex<Inner>,
    request_timeout: Duration,
}

impl ShardFsmManager {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            request_timeout,
        }
    }

    /// Creates and launches a state machine for the shard unless one is
    /// already tracked. Returns whether a new machine was started; duplicate
    /// announcements are a no-op.
    pub fn start_if_absent(
        &self,
        shard: JobShard,
        requirements: ResourceUsage,
        services: FsmServices,
    ) -> bool {
        let shard_id = shard.id();
        let fsm = {
            let mut inner = self.inner.lock().unwrap();
            if inner.by_id.contains_key(&shard_id) {
                tracing::debug!(shard_id = %shard_id, "shard already tracked; ignoring duplicate");
                return false;
            }
            let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
            let state = Arc::new(StateCell::new());
            let terminated = Arc::new(AtomicBool::new(false));
            let handle = ShardHandle {
                capacity_item: CapacityItem {
                    shard_id: shard_id.clone(),
                    requirements,
                },
                state: state.clone(),
                tx,
                terminated: terminated.clone(),
            };
            inner.by_id.insert(shard_id.clone(), handle.clone());
            inner.ordered.push_back(handle);
            ShardFsm::new(shard, rx, state, terminated, services)
        };
        tokio::spawn(fsm.run());
        tracing::info!(shard_id = %shard_id, "shard state machine started");
        true
    }

    pub fn get(&self, shard_id: &ShardId) -> Option<ShardHandle> {
        self.inner.lock().unwrap().by_id.get(shard_id).cloned()
    }

    /// Routes an external event to the shard's state machine. Returns whether
    /// a live machine was found; delivery problems (terminated machine, full
    /// or closed channel) are logged and swallowed so a late event can never
    /// wedge the caller.
    pub async fn send_request(&self, shard_id: &ShardId, request: ShardRequest) -> bool {
        let handle = self.get(shard_id);
        let Some(handle) = handle else {
            tracing::warn!(
                shard_id = %shard_id,
                action = %request.action,
                "no state machine for shard; dropping event"
            );
            return false;
        };
        let action = request.action;
        if handle.terminated.load(Ordering::Acquire) {
            tracing::warn!(
                shard_id = %shard_id,
                action = %action,
                "ignoring action after termination"
            );
            return true;
        }
        match tokio::time::timeout(self.request_timeout, handle.tx.send(request)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                tracing::warn!(
                    shard_id = %shard_id,
                    action = %action,
                    "ignoring action after request channel closed"
                );
            }
            Err(_) => {
                tracing::warn!(
                    shard_id = %shard_id,
                    action = %action,
                    "timed out delivering action; shard may be stuck"
                );
            }
        }
        true
    }

    /// Shards waiting for capacity, in admission order.
    pub fn enqueued(&self) -> Vec<ShardHandle> {
        self.snapshot(|state| state == ShardState::Enqueued)
    }

    /// Shards holding capacity (bidding through publishing), in admission
    /// order.
    pub fn active(&self) -> Vec<ShardHandle> {
        self.snapshot(|state| state.is_active())
    }

    /// All tracked shards, in admission order.
    pub fn all(&self) -> Vec<ShardHandle> {
        self.snapshot(|_| true)
    }

    fn snapshot(&self, keep: impl Fn(ShardState) -> bool) -> Vec<ShardHandle> {
        let mut inner = self.inner.lock().unwrap();
        Self::reap_completed(&mut inner);
        inner
            .ordered
            .iter()
            .filter(|handle| keep(handle.state()))
            .cloned()
            .collect()
    }

    /// Removes completed machines from the front of the ordered list only,
    /// preserving the admission order of the survivors without copying. A
    /// completed shard behind a live one stays until its predecessors drain.
    fn reap_completed(inner: &mut Inner) {
        while let Some(front) = inner.ordered.front() {
            if !front.state().is_terminal() {
                break;
            }
            if let Some(handle) = inner.ordered.pop_front() {
                inner.by_id.remove(handle.shard_id());
                tracing::debug!(shard_id = %handle.shard_id(), "reaped completed shard");
            }
        }
    }
}

impl CapacityTracker for ShardFsmManager {
    fn backlog_iterator(&self, handler: &mut dyn FnMut(&CapacityItem)) {
        for handle in self.enqueued() {
            handler(handle.capacity_item());
        }
    }

    fn active_iterator(&self, handler: &mut dyn FnMut(&CapacityItem)) {
        for handle in self.active() {
            handler(handle.capacity_item());
        }
    }
}
