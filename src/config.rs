use std::path::PathBuf;

use crate::capacity::ResourceUsageConfig;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Stable identifier for this node, included in outbound events.
    pub node_id: String,
    /// Total compute capacity this node offers, in human units ("2", "4Gi", "1").
    pub capacity: ResourceUsageConfig,
    /// Requirements applied to job specs that leave a resource field empty.
    pub default_job_requirements: ResourceUsageConfig,
    /// Directory under which per-shard result files are written.
    pub results_dir: PathBuf,
    /// How often the control loop asks the capacity manager to rebalance.
    pub control_interval_ms: u64,
    /// How often free capacity is advertised to the gossip layer.
    pub advertise_interval_ms: u64,
    /// Upper bound on delivering an inbound request to a shard state machine.
    pub request_timeout_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "node-0".to_string(),
            capacity: ResourceUsageConfig {
                cpu: "1".to_string(),
                memory: "1Gi".to_string(),
                disk: "10Gi".to_string(),
                gpu: "0".to_string(),
            },
            default_job_requirements: ResourceUsageConfig {
                cpu: "100m".to_string(),
                memory: "100Mi".to_string(),
                disk: "".to_string(),
                gpu: "".to_string(),
            },
            results_dir: PathBuf::from("/tmp/gridnode-results"),
            control_interval_ms: 100,
            advertise_interval_ms: 5000,
            request_timeout_ms: 2000,
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: impl Into<String>, capacity: ResourceUsageConfig) -> Self {
        Self {
            node_id: node_id.into(),
            capacity,
            ..Default::default()
        }
    }

    pub fn with_results_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.results_dir = dir.into();
        self
    }
}
