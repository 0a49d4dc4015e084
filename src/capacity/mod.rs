//! Resource accounting and admission control.
//!
//! [`ResourceUsage`] models CPU / memory / disk / GPU quantities parsed from
//! human units. [`CapacityManager`] owns the node total and decides when an
//! enqueued shard may proceed to bidding.

pub mod manager;
pub mod usage;

pub use manager::{Admission, CapacityItem, CapacityManager, CapacityTracker, RebalanceOutcome};
pub use usage::{ResourceUsage, ResourceUsageConfig};
