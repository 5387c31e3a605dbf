//! Configuration (spec 6), loaded from YAML the way `config.rs` and
//! `simulator::SimulationConfig` load the teacher's simulation config: every tunable
//! gets a `#[serde(default = "xxx_default")]` free function so a partially specified
//! document still deserializes into sane defaults, and a hand-written `Default` impl
//! assembles them for programmatic construction in tests.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn scale_down_enabled_default() -> bool {
    true
}
fn scale_down_unneeded_time_default() -> Duration {
    Duration::from_secs(10 * 60)
}
fn scale_down_unready_time_default() -> Duration {
    Duration::from_secs(20 * 60)
}
fn scale_down_utilization_threshold_default() -> f64 {
    0.5
}
fn scale_down_delay_after_add_default() -> Duration {
    Duration::from_secs(10 * 60)
}
fn scale_down_delay_after_failure_default() -> Duration {
    Duration::from_secs(3 * 60)
}
fn max_node_provision_time_default() -> Duration {
    Duration::from_secs(15 * 60)
}
fn max_node_startup_time_default() -> Duration {
    Duration::from_secs(15 * 60)
}
fn max_nodes_total_default() -> u64 {
    u64::MAX
}
fn max_cores_total_default() -> u64 {
    u64::MAX
}
fn max_memory_total_default() -> u64 {
    u64::MAX
}
fn expendable_pods_priority_cutoff_default() -> i32 {
    0
}
fn new_pod_scale_up_delay_default() -> Duration {
    Duration::ZERO
}
fn max_scale_down_parallelism_default() -> usize {
    10
}
fn max_drain_parallelism_default() -> usize {
    1
}
fn node_deletion_batcher_interval_default() -> Duration {
    Duration::ZERO
}
fn node_delete_delay_after_taint_default() -> Duration {
    Duration::from_secs(5)
}
fn max_pod_eviction_time_default() -> Duration {
    Duration::from_secs(2 * 60)
}
fn ok_total_unready_count_default() -> usize {
    3
}
fn max_total_unready_percentage_default() -> f64 {
    0.45
}
fn scan_interval_default() -> Duration {
    Duration::from_secs(10)
}
fn max_autoprovisioned_node_group_count_default() -> usize {
    15
}

/// Cluster-wide autoscaling options (spec 6). Mirrors the field-per-tunable shape of
/// the teacher's `ClusterAutoscalerConfig` / `KubeClusterAutoscalerConfig`, widened to
/// the full option set the static loop and its collaborators consult.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AutoscalingOptions {
    #[serde(default = "scale_down_enabled_default")]
    pub scale_down_enabled: bool,
    #[serde(default = "scale_down_unneeded_time_default", with = "duration_secs")]
    pub scale_down_unneeded_time: Duration,
    #[serde(default = "scale_down_unready_time_default", with = "duration_secs")]
    pub scale_down_unready_time: Duration,
    #[serde(default = "scale_down_utilization_threshold_default")]
    pub scale_down_utilization_threshold: f64,
    #[serde(default = "scale_down_delay_after_add_default", with = "duration_secs")]
    pub scale_down_delay_after_add: Duration,
    #[serde(
        default = "scale_down_delay_after_failure_default",
        with = "duration_secs"
    )]
    pub scale_down_delay_after_failure: Duration,

    #[serde(default = "max_node_provision_time_default", with = "duration_secs")]
    pub max_node_provision_time: Duration,
    #[serde(default = "max_node_startup_time_default", with = "duration_secs")]
    pub max_node_startup_time: Duration,

    #[serde(default = "max_nodes_total_default")]
    pub max_nodes_total: u64,
    #[serde(default = "max_cores_total_default")]
    pub max_cores_total: u64,
    #[serde(default = "max_memory_total_default")]
    pub max_memory_total_bytes: u64,

    #[serde(default = "expendable_pods_priority_cutoff_default")]
    pub expendable_pods_priority_cutoff: i32,
    #[serde(default = "new_pod_scale_up_delay_default", with = "duration_secs")]
    pub new_pod_scale_up_delay: Duration,
    #[serde(default)]
    pub bypassed_schedulers: HashSet<String>,

    #[serde(default = "max_scale_down_parallelism_default")]
    pub max_scale_down_parallelism: usize,
    #[serde(default = "max_drain_parallelism_default")]
    pub max_drain_parallelism: usize,
    #[serde(
        default = "node_deletion_batcher_interval_default",
        with = "duration_secs"
    )]
    pub node_deletion_batcher_interval: Duration,
    #[serde(
        default = "node_delete_delay_after_taint_default",
        with = "duration_secs"
    )]
    pub node_delete_delay_after_taint: Duration,
    #[serde(default = "max_pod_eviction_time_default", with = "duration_secs")]
    pub max_pod_eviction_time: Duration,

    #[serde(default = "ok_total_unready_count_default")]
    pub ok_total_unready_count: usize,
    #[serde(default = "max_total_unready_percentage_default")]
    pub max_total_unready_percentage: f64,

    #[serde(default)]
    pub enforce_node_group_min_size: bool,
    #[serde(default)]
    pub node_autoprovisioning_enabled: bool,
    #[serde(default = "max_autoprovisioned_node_group_count_default")]
    pub max_autoprovisioned_node_group_count: usize,

    #[serde(default)]
    pub skip_nodes_with_system_pods: bool,
    #[serde(default)]
    pub skip_nodes_with_local_storage: bool,
    #[serde(default)]
    pub skip_nodes_with_custom_controller_pods: bool,

    #[serde(default = "scan_interval_default", with = "duration_secs")]
    pub scan_interval: Duration,
}

impl Default for AutoscalingOptions {
    fn default() -> Self {
        Self {
            scale_down_enabled: scale_down_enabled_default(),
            scale_down_unneeded_time: scale_down_unneeded_time_default(),
            scale_down_unready_time: scale_down_unready_time_default(),
            scale_down_utilization_threshold: scale_down_utilization_threshold_default(),
            scale_down_delay_after_add: scale_down_delay_after_add_default(),
            scale_down_delay_after_failure: scale_down_delay_after_failure_default(),
            max_node_provision_time: max_node_provision_time_default(),
            max_node_startup_time: max_node_startup_time_default(),
            max_nodes_total: max_nodes_total_default(),
            max_cores_total: max_cores_total_default(),
            max_memory_total_bytes: max_memory_total_default(),
            expendable_pods_priority_cutoff: expendable_pods_priority_cutoff_default(),
            new_pod_scale_up_delay: new_pod_scale_up_delay_default(),
            bypassed_schedulers: HashSet::new(),
            max_scale_down_parallelism: max_scale_down_parallelism_default(),
            max_drain_parallelism: max_drain_parallelism_default(),
            node_deletion_batcher_interval: node_deletion_batcher_interval_default(),
            node_delete_delay_after_taint: node_delete_delay_after_taint_default(),
            max_pod_eviction_time: max_pod_eviction_time_default(),
            ok_total_unready_count: ok_total_unready_count_default(),
            max_total_unready_percentage: max_total_unready_percentage_default(),
            enforce_node_group_min_size: false,
            node_autoprovisioning_enabled: false,
            max_autoprovisioned_node_group_count: max_autoprovisioned_node_group_count_default(),
            skip_nodes_with_system_pods: false,
            skip_nodes_with_local_storage: false,
            skip_nodes_with_custom_controller_pods: false,
            scan_interval: scan_interval_default(),
        }
    }
}

/// Per-node-group override of a subset of the cluster-wide options (spec 6): whether
/// scale-down is disabled for this group and whether it follows zero-or-max ("atomic")
/// scaling semantics (spec 3, invariant 5).
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct NodeGroupAutoscalingOptions {
    #[serde(default)]
    pub scale_down_disabled: bool,
    #[serde(default)]
    pub zero_or_max_node_scaling: bool,
    pub scale_down_unneeded_time: Option<Duration>,
    pub scale_down_unready_time: Option<Duration>,
    pub scale_down_utilization_threshold: Option<f64>,
    pub max_node_provision_time: Option<Duration>,
}

impl NodeGroupAutoscalingOptions {
    /// Resolves this override against cluster-wide defaults, the way
    /// `NodeGroup::GetOptions(defaults)` does in spec 6.
    pub fn resolve(&self, defaults: &AutoscalingOptions) -> ResolvedNodeGroupOptions {
        ResolvedNodeGroupOptions {
            scale_down_disabled: self.scale_down_disabled,
            atomic: self.zero_or_max_node_scaling,
            scale_down_unneeded_time: self
                .scale_down_unneeded_time
                .unwrap_or(defaults.scale_down_unneeded_time),
            scale_down_unready_time: self
                .scale_down_unready_time
                .unwrap_or(defaults.scale_down_unready_time),
            scale_down_utilization_threshold: self
                .scale_down_utilization_threshold
                .unwrap_or(defaults.scale_down_utilization_threshold),
            max_node_provision_time: self
                .max_node_provision_time
                .unwrap_or(defaults.max_node_provision_time),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedNodeGroupOptions {
    pub scale_down_disabled: bool,
    pub atomic: bool,
    pub scale_down_unneeded_time: Duration,
    pub scale_down_unready_time: Duration,
    pub scale_down_utilization_threshold: f64,
    pub max_node_provision_time: Duration,
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_document_fills_defaults() {
        let yaml = "scale_down_enabled: false\nmax_nodes_total: 5\n";
        let opts: AutoscalingOptions = serde_yaml::from_str(yaml).unwrap();
        assert!(!opts.scale_down_enabled);
        assert_eq!(opts.max_nodes_total, 5);
        assert_eq!(opts.max_drain_parallelism, max_drain_parallelism_default());
    }

    #[test]
    fn test_node_group_options_fall_back_to_defaults() {
        let defaults = AutoscalingOptions::default();
        let overrides = NodeGroupAutoscalingOptions {
            scale_down_disabled: true,
            ..Default::default()
        };
        let resolved = overrides.resolve(&defaults);
        assert!(resolved.scale_down_disabled);
        assert_eq!(resolved.scale_down_unneeded_time, defaults.scale_down_unneeded_time);
    }
}
