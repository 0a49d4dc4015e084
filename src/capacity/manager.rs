use std::collections::HashMap;
use std::sync::Mutex;

use crate::capacity::usage::ResourceUsage;
use crate::scheduler::job::ShardId;

/// A shard's standing claim on node resources, alive while the shard is
/// enqueued or active.
#[derive(Debug, Clone)]
pub struct CapacityItem {
    pub shard_id: ShardId,
    pub requirements: ResourceUsage,
}

/// Outcome of a single reservation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Capacity reserved; the shard may proceed to bidding.
    Admitted,
    /// Not enough free capacity right now; retried on the next rebalance.
    Deferred,
    /// Requirements exceed the node total; permanently inadmissible.
    Exceeded,
}

/// Decisions produced by one rebalance pass, dispatched by the control loop
/// outside all locks.
#[derive(Debug, Default)]
pub struct RebalanceOutcome {
    /// Backlog shards admitted this pass, in admission order.
    pub to_bid: Vec<ShardId>,
    /// Backlog shards whose requirements can never fit this node.
    pub oversized: Vec<ShardId>,
}

/// View of the scheduler's shard collection that the capacity manager walks
/// during rebalance. Both iterators visit shards in admission order.
pub trait CapacityTracker {
    fn backlog_iterator(&self, handler: &mut dyn FnMut(&CapacityItem));
    fn active_iterator(&self, handler: &mut dyn FnMut(&CapacityItem));
}

/// Sole authority on node resources. Tracks an immutable total and the
/// reservations currently held against it; nothing else subtracts from free
/// capacity directly.
#[derive(Debug)]
pub struct CapacityManager {
    total: ResourceUsage,
    reserved: Mutex<HashMap<ShardId, ResourceUsage>>,
}

impl CapacityManager {
    pub fn new(total: ResourceUsage) -> Self {
        Self {
            total,
            reserved: Mutex::new(HashMap::new()),
        }
    }

    pub fn total(&self) -> ResourceUsage {
        self.total
    }

    /// Sum of all currently held reservations.
    pub fn reserved_total(&self) -> ResourceUsage {
        let reserved = self.reserved.lock().unwrap();
        reserved
            .values()
            .fold(ResourceUsage::default(), |acc, usage| acc.add(usage))
    }

    pub fn free(&self) -> ResourceUsage {
        self.total.sub(&self.reserved_total())
    }

    /// Admits the item iff its requirements fit within the current free
    /// capacity. Re-reserving an already reserved shard is a no-op that
    /// reports `Admitted`.
    pub fn reserve(&self, item: &CapacityItem) -> Admission {
        if !item.requirements.fits_within(&self.total) {
            return Admission::Exceeded;
        }
        let mut reserved = self.reserved.lock().unwrap();
        if reserved.contains_key(&item.shard_id) {
            return Admission::Admitted;
        }
        let in_use = reserved
            .values()
            .fold(ResourceUsage::default(), |acc, usage| acc.add(usage));
        let free = self.total.sub(&in_use);
        if item.requirements.fits_within(&free) {
            reserved.insert(item.shard_id.clone(), item.requirements);
            tracing::debug!(shard_id = %item.shard_id, free = %self.total.sub(&in_use.add(&item.requirements)), "capacity reserved");
            Admission::Admitted
        } else {
            Admission::Deferred
        }
    }

    /// Idempotent: releasing a shard that holds no reservation is a no-op.
    pub fn release(&self, shard_id: &ShardId) {
        let mut reserved = self.reserved.lock().unwrap();
        if reserved.remove(shard_id).is_some() {
            tracing::debug!(shard_id = %shard_id, "capacity released");
        }
    }

    /// Periodic admission pass. Refreshes the reservation table against the
    /// tracker's live shards, then walks the backlog in admission order,
    /// admitting as many as fit.
    ///
    /// Admission is strict head-of-line: a backlog shard that does not fit
    /// right now blocks everything behind it, so large jobs cannot be starved
    /// by streams of small ones. A shard that can never fit the node total is
    /// reported as oversized and skipped, since it is leaving the backlog
    /// rather than waiting in it.
    pub fn rebalance(&self, tracker: &dyn CapacityTracker) -> RebalanceOutcome {
        let mut backlog: Vec<CapacityItem> = Vec::new();
        tracker.backlog_iterator(&mut |item| backlog.push(item.clone()));
        let mut active: Vec<CapacityItem> = Vec::new();
        tracker.active_iterator(&mut |item| active.push(item.clone()));

        let mut outcome = RebalanceOutcome::default();
        let mut reserved = self.reserved.lock().unwrap();

        // Refresh the running total: active shards always hold a reservation,
        // backlog shards keep one only if already admitted (bid dispatched but
        // not yet processed). Everything else has terminated and drops out.
        let mut refreshed: HashMap<ShardId, ResourceUsage> = HashMap::new();
        for item in &active {
            refreshed.insert(item.shard_id.clone(), item.requirements);
        }
        for item in &backlog {
            if let Some(requirements) = reserved.get(&item.shard_id) {
                refreshed.insert(item.shard_id.clone(), *requirements);
            }
        }
        *reserved = refreshed;

        let mut in_use = reserved
            .values()
            .fold(ResourceUsage::default(), |acc, usage| acc.add(usage));

        for item in &backlog {
            if reserved.contains_key(&item.shard_id) {
                // Already admitted on a previous pass; not part of this one.
                continue;
            }
            if !item.requirements.fits_within(&self.total) {
                tracing::warn!(
                    shard_id = %item.shard_id,
                    requirements = %item.requirements,
                    total = %self.total,
                    "shard requirements exceed node capacity"
                );
                outcome.oversized.push(item.shard_id.clone());
                continue;
            }
            let free = self.total.sub(&in_use);
            if !item.requirements.fits_within(&free) {
                // Head of line does not fit; do not skip ahead.
                break;
            }
            reserved.insert(item.shard_id.clone(), item.requirements);
            in_use = in_use.add(&item.requirements);
            outcome.to_bid.push(item.shard_id.clone());
        }

        outcome
    }
}
