//! Cluster State Registry (spec 4.C, component C). Converts the provider's per-group
//! instance lists, the lister-observed node list, and the wall clock into a stable
//! per-node readiness classification plus per-group health and backoff bookkeeping.
//! Grounded on the teacher's `ClusterController`'s node-bookkeeping map, generalized
//! from "one simulated cluster" into the classification/backoff machinery spec 4.C
//! names; the classification algorithm itself is new since the teacher never models
//! provider-vs-registered-node staleness at all.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::warn;

use crate::core::cloud_provider::{CloudProvider, ErrorClass, Instance, InstanceLifecycleState};
use crate::core::common::{Clock, NodeGroupId, Timestamp};
use crate::core::node::Node;
use crate::core::taints::{has_startup_taint, TaintConfig};
use crate::errors::ClusterStateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeReadiness {
    Ready,
    NotStarted,
    Unready,
    Deleted,
    Unregistered,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffStatus {
    pub in_backoff: bool,
    pub until: Option<Timestamp>,
}

struct GroupState {
    observed_target: u64,
    last_target_change: Timestamp,
    instances: Vec<Instance>,
    /// Backoff windows keyed by provider error code (spec 4.C: "distinct codes have
    /// distinct backoff state").
    backoff: HashMap<String, Timestamp>,
}

impl GroupState {
    fn new() -> Self {
        Self {
            observed_target: 0,
            last_target_change: Timestamp::zero(),
            instances: Vec::new(),
            backoff: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct HealthSnapshot {
    total: usize,
    unready: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreationError {
    pub group: NodeGroupId,
    pub instance_id: String,
    pub code: String,
}

/// Cooldown applied to a group on a failed scale-up, keyed by error code. The source
/// computes this from an exponential schedule per error class; a fixed window is a
/// faithful simplification for the static loop's synchronous tick model.
pub const SCALE_UP_BACKOFF_DURATION: Duration = Duration::from_secs(5 * 60);

pub struct ClusterStateRegistry {
    clock: Arc<dyn Clock>,
    max_node_provision_time: Duration,
    max_node_startup_time: Duration,
    ok_total_unready_count: usize,
    max_total_unready_percentage: f64,
    groups: Mutex<HashMap<NodeGroupId, GroupState>>,
    classifications: Mutex<HashMap<String, NodeReadiness>>,
    health: Mutex<HealthSnapshot>,
}

impl ClusterStateRegistry {
    pub fn new(
        clock: Arc<dyn Clock>,
        max_node_provision_time: Duration,
        max_node_startup_time: Duration,
        ok_total_unready_count: usize,
        max_total_unready_percentage: f64,
    ) -> Self {
        Self {
            clock,
            max_node_provision_time,
            max_node_startup_time,
            ok_total_unready_count,
            max_total_unready_percentage,
            groups: Mutex::new(HashMap::new()),
            classifications: Mutex::new(HashMap::new()),
            health: Mutex::new(HealthSnapshot::default()),
        }
    }

    /// Snapshots provider instance lists per group; sticky last-good on failure, per
    /// spec 4.C: a provider hiccup never wipes out the previous tick's view.
    pub fn refresh_provider_cache(&self, provider: &dyn CloudProvider) -> Result<(), ClusterStateError> {
        let mut groups = self.groups.lock().unwrap();
        let mut failures = Vec::new();
        for group in provider.node_groups() {
            let entry = groups.entry(group.id()).or_insert_with(GroupState::new);
            match (group.nodes(), group.target_size()) {
                (Ok(instances), Ok(target)) => {
                    entry.instances = instances;
                    entry.observed_target = target;
                }
                (instances_result, target_result) => {
                    failures.push(group.id().to_string());
                    if let Ok(instances) = instances_result {
                        entry.instances = instances;
                    }
                    if let Ok(target) = target_result {
                        entry.observed_target = target;
                    }
                }
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            let msg = failures.join(", ");
            warn!("provider cache refresh failed for groups [{msg}], serving last-good snapshot");
            Err(ClusterStateError::StaleProviderCache(msg))
        }
    }

    /// Recomputes per-node classification and per-group health counters (spec 4.C).
    pub fn update_nodes(&self, all_nodes: &[Node], taint_config: &TaintConfig) {
        let now = self.clock.now();
        let nodes_by_name: HashMap<&str, &Node> =
            all_nodes.iter().map(|n| (n.metadata.name.as_str(), n)).collect();

        let mut classifications = HashMap::new();
        let mut health = HealthSnapshot::default();

        let groups = self.groups.lock().unwrap();
        for group_state in groups.values() {
            for instance in &group_state.instances {
                let node = nodes_by_name.get(instance.id.as_str()).copied();
                let readiness = classify(
                    Some(instance),
                    node,
                    now,
                    self.max_node_provision_time,
                    self.max_node_startup_time,
                    taint_config,
                );
                classifications.insert(instance.id.clone(), readiness);
                health.total += 1;
                if matches!(readiness, NodeReadiness::Unready | NodeReadiness::Unregistered) {
                    health.unready += 1;
                }
            }
        }
        drop(groups);

        // Nodes present in the lister snapshot but not attached to any tracked
        // instance (e.g. provider has no record yet) still get a best-effort
        // classification so the loop's health gate sees them.
        for node in all_nodes {
            classifications.entry(node.metadata.name.clone()).or_insert_with(|| {
                classify(
                    None,
                    Some(node),
                    now,
                    self.max_node_provision_time,
                    self.max_node_startup_time,
                    taint_config,
                )
            });
        }

        *self.classifications.lock().unwrap() = classifications;
        *self.health.lock().unwrap() = health;
    }

    pub fn classification_of(&self, node_name: &str) -> Option<NodeReadiness> {
        self.classifications.lock().unwrap().get(node_name).copied()
    }

    /// Instances present in the provider but whose node object never appeared within
    /// `MaxNodeProvisionTime` (spec 4.C).
    pub fn get_unregistered_nodes(&self) -> Vec<(NodeGroupId, String)> {
        let groups = self.groups.lock().unwrap();
        let classifications = self.classifications.lock().unwrap();
        let mut out = Vec::new();
        for (group_id, state) in groups.iter() {
            for instance in &state.instances {
                if classifications.get(&instance.id) == Some(&NodeReadiness::Unregistered) {
                    out.push((group_id.clone(), instance.id.clone()));
                }
            }
        }
        out
    }

    pub fn is_cluster_healthy(&self) -> bool {
        let health = *self.health.lock().unwrap();
        if health.total == 0 {
            return true;
        }
        let fraction = health.unready as f64 / health.total as f64;
        health.unready <= self.ok_total_unready_count && fraction <= self.max_total_unready_percentage
    }

    pub fn backoff_status(&self, group: &NodeGroupId) -> BackoffStatus {
        let now = self.clock.now();
        let groups = self.groups.lock().unwrap();
        let Some(state) = groups.get(group) else {
            return BackoffStatus {
                in_backoff: false,
                until: None,
            };
        };
        let active: Vec<Timestamp> = state
            .backoff
            .values()
            .copied()
            .filter(|until| *until > now)
            .collect();
        match active.iter().max() {
            Some(until) => BackoffStatus {
                in_backoff: true,
                until: Some(*until),
            },
            None => BackoffStatus {
                in_backoff: false,
                until: None,
            },
        }
    }

    pub fn register_scale_up(&self, group: &NodeGroupId, _delta: u64) {
        let now = self.clock.now();
        let mut groups = self.groups.lock().unwrap();
        let entry = groups.entry(group.clone()).or_insert_with(GroupState::new);
        entry.last_target_change = now;
    }

    pub fn register_failed_scale_up(&self, group: &NodeGroupId, error_code: &str) {
        let now = self.clock.now();
        let mut groups = self.groups.lock().unwrap();
        let entry = groups.entry(group.clone()).or_insert_with(GroupState::new);
        entry.last_target_change = now;
        entry
            .backoff
            .insert(error_code.to_string(), now.plus_seconds(SCALE_UP_BACKOFF_DURATION.as_secs()));
    }

    /// Every Instance in state Creating whose ErrorInfo is non-empty (spec 4.C
    /// "Creation-error inventory"). `OutOfResources` errors also drive backoff
    /// registration via `record_creation_errors`; this just enumerates the inventory.
    pub fn creation_errors(&self) -> Vec<CreationError> {
        let groups = self.groups.lock().unwrap();
        let mut out = Vec::new();
        for (group_id, state) in groups.iter() {
            for instance in &state.instances {
                if instance.state != InstanceLifecycleState::Creating {
                    continue;
                }
                if let Some(error) = &instance.error {
                    out.push(CreationError {
                        group: group_id.clone(),
                        instance_id: instance.id.clone(),
                        code: error.code.clone(),
                    });
                }
            }
        }
        out
    }

    /// Applies every `OutOfResources` creation error's backoff window to its owning
    /// group (spec 4.C: "every Instance with ErrorInfo of class OutOfResources ⇒
    /// group enters backoff keyed by ErrorInfo.code").
    pub fn record_creation_error_backoffs(&self) {
        let now = self.clock.now();
        let mut groups = self.groups.lock().unwrap();
        for (_, state) in groups.iter_mut() {
            let codes: Vec<String> = state
                .instances
                .iter()
                .filter(|i| i.state == InstanceLifecycleState::Creating)
                .filter_map(|i| i.error.as_ref())
                .filter(|e| e.class == ErrorClass::OutOfResources)
                .map(|e| e.code.clone())
                .collect();
            for code in codes {
                state
                    .backoff
                    .insert(code, now.plus_seconds(SCALE_UP_BACKOFF_DURATION.as_secs()));
            }
        }
    }

    /// Node ids eligible for `deleteCreatedNodesWithErrors`, expanded to every member
    /// of a group when that group is atomic (spec 4.C "Atomic-group rule").
    pub fn deletion_set_for_creation_errors(
        &self,
        provider: &dyn CloudProvider,
    ) -> HashMap<NodeGroupId, Vec<String>> {
        let groups = self.groups.lock().unwrap();
        let mut out: HashMap<NodeGroupId, Vec<String>> = HashMap::new();
        let provider_groups: HashMap<NodeGroupId, _> =
            provider.node_groups().into_iter().map(|g| (g.id(), g)).collect();

        for (group_id, state) in groups.iter() {
            let erroring: Vec<String> = state
                .instances
                .iter()
                .filter(|i| i.state == InstanceLifecycleState::Creating && i.error.is_some())
                .map(|i| i.id.clone())
                .collect();
            if erroring.is_empty() {
                continue;
            }
            let atomic = provider_groups.get(group_id).map(|g| g.atomic()).unwrap_or(false);
            if atomic {
                let all_members: Vec<String> = state.instances.iter().map(|i| i.id.clone()).collect();
                out.insert(group_id.clone(), all_members);
            } else {
                out.insert(group_id.clone(), erroring);
            }
        }
        out
    }

    pub fn observed_target_size(&self, group: &NodeGroupId) -> Option<u64> {
        self.groups.lock().unwrap().get(group).map(|s| s.observed_target)
    }

    pub fn last_target_change(&self, group: &NodeGroupId) -> Option<Timestamp> {
        self.groups.lock().unwrap().get(group).map(|s| s.last_target_change)
    }
}

/// Pure classification function, matching spec 4.C's algorithm step for step. Kept
/// free-standing (rather than a method) so it can be unit tested against literal
/// timestamps without constructing a whole registry.
fn classify(
    instance: Option<&Instance>,
    node: Option<&Node>,
    now: Timestamp,
    max_node_provision_time: Duration,
    max_node_startup_time: Duration,
    taint_config: &TaintConfig,
) -> NodeReadiness {
    if let Some(inst) = instance {
        if inst.state == InstanceLifecycleState::Deleting {
            return NodeReadiness::Deleted;
        }
    }
    match node {
        None => match instance {
            Some(inst) => {
                if now.since(inst.created_at) <= max_node_provision_time.as_secs() {
                    NodeReadiness::NotStarted
                } else {
                    NodeReadiness::Unregistered
                }
            }
            None => NodeReadiness::Unregistered,
        },
        Some(n) => {
            // A startup-tainted node never classifies as Ready (spec 4.T
            // `FilterOutNodesWithStartupTaints`), even if the node object itself
            // reports ready.
            if n.status.is_ready() && !has_startup_taint(n, taint_config) {
                NodeReadiness::Ready
            } else if now.since(n.metadata.creation_timestamp) <= max_node_startup_time.as_secs() {
                NodeReadiness::NotStarted
            } else {
                NodeReadiness::Unready
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cloud_provider::{Instance, StaticCloudProvider, StaticNodeGroup};
    use crate::core::common::{FakeClock, Resources};
    use crate::core::node::{Taint, TaintEffect};

    fn registry(clock: Arc<FakeClock>) -> ClusterStateRegistry {
        ClusterStateRegistry::new(clock, Duration::from_secs(10), Duration::from_secs(10), 3, 0.45)
    }

    #[test]
    fn test_classify_running_instance_without_node_is_not_started_then_unregistered() {
        let instance = Instance::running("broken", Timestamp(0));
        let config = TaintConfig::default();
        let now_within = Timestamp(5);
        assert_eq!(
            classify(Some(&instance), None, now_within, Duration::from_secs(10), Duration::from_secs(10), &config),
            NodeReadiness::NotStarted
        );
        let now_past = Timestamp(11);
        assert_eq!(
            classify(Some(&instance), None, now_past, Duration::from_secs(10), Duration::from_secs(10), &config),
            NodeReadiness::Unregistered
        );
    }

    #[test]
    fn test_classify_not_ready_node_transitions_to_unready_past_startup_time() {
        let node = Node::new("n1", Resources::new(1000, 1024)).mark_not_ready();
        let config = TaintConfig::default();
        let now_within = Timestamp(5);
        assert_eq!(
            classify(None, Some(&node), now_within, Duration::from_secs(10), Duration::from_secs(10), &config),
            NodeReadiness::NotStarted
        );
        let now_past = Timestamp(11);
        assert_eq!(
            classify(None, Some(&node), now_past, Duration::from_secs(10), Duration::from_secs(10), &config),
            NodeReadiness::Unready
        );
    }

    #[test]
    fn test_classify_startup_tainted_node_never_reports_ready() {
        let mut node = Node::new("n1", Resources::new(1000, 1024));
        node.spec.taints.push(Taint::new(
            "startup-taint.cluster-autoscaler.kubernetes.io/gpu-init",
            "",
            TaintEffect::NoSchedule,
        ));
        let config = TaintConfig::default();
        let now_within = Timestamp(5);
        assert_eq!(
            classify(None, Some(&node), now_within, Duration::from_secs(10), Duration::from_secs(10), &config),
            NodeReadiness::NotStarted
        );
        let now_past = Timestamp(11);
        assert_eq!(
            classify(None, Some(&node), now_past, Duration::from_secs(10), Duration::from_secs(10), &config),
            NodeReadiness::Unready
        );
    }

    #[test]
    fn test_unregistered_node_scenario_from_spec() {
        let clock = Arc::new(FakeClock::new(Timestamp(0)));
        let registry = registry(Arc::clone(&clock) as Arc<dyn Clock>);
        let provider = StaticCloudProvider::new();
        let group = provider.add_group(
            StaticNodeGroup::new("ng1", 1, 10, 3, Resources::new(1000, 1024))
                .with_instance(Instance::running("n1", Timestamp(0)))
                .with_instance(Instance::running("broken", Timestamp(0))),
        );
        let _ = group;
        registry.refresh_provider_cache(&provider).unwrap();

        let n1 = Node::new("n1", Resources::new(1000, 1024));
        registry.update_nodes(&[n1], &TaintConfig::default());
        clock.advance(11);
        registry.update_nodes(&[Node::new("n1", Resources::new(1000, 1024))], &TaintConfig::default());

        let unregistered = registry.get_unregistered_nodes();
        assert_eq!(unregistered.len(), 1);
        assert_eq!(unregistered[0].1, "broken");
    }

    #[test]
    fn test_atomic_group_creation_error_expands_to_all_members() {
        let clock = Arc::new(FakeClock::new(Timestamp(0)));
        let registry = registry(Arc::clone(&clock) as Arc<dyn Clock>);
        let provider = StaticCloudProvider::new();
        provider.add_group(
            StaticNodeGroup::new("d", 0, 3, 3, Resources::new(1000, 1024))
                .atomic()
                .with_instance(Instance::running("d-1", Timestamp(0)))
                .with_instance(Instance::running("d-2", Timestamp(0)))
                .with_instance(Instance::creating("d-3", Timestamp(0)).with_error(ErrorClass::Other, "quota")),
        );
        registry.refresh_provider_cache(&provider).unwrap();
        let deletion_set = registry.deletion_set_for_creation_errors(&provider);
        let members = deletion_set.get(&NodeGroupId("d".to_string())).unwrap();
        assert_eq!(members.len(), 3);
    }

    #[test]
    fn test_is_cluster_healthy_respects_both_count_and_percentage_gates() {
        let clock = Arc::new(FakeClock::new(Timestamp(0)));
        let registry = ClusterStateRegistry::new(
            Arc::clone(&clock) as Arc<dyn Clock>,
            Duration::from_secs(10),
            Duration::from_secs(10),
            0,
            0.5,
        );
        let provider = StaticCloudProvider::new();
        provider.add_group(
            StaticNodeGroup::new("ng1", 0, 5, 2, Resources::new(1000, 1024))
                .with_instance(Instance::running("n1", Timestamp(0)))
                .with_instance(Instance::running("n2", Timestamp(0))),
        );
        registry.refresh_provider_cache(&provider).unwrap();
        clock.advance(20);
        let n1 = Node::new("n1", Resources::new(1000, 1024));
        let n2 = Node::new("n2", Resources::new(1000, 1024)).mark_not_ready();
        registry.update_nodes(&[n1, n2], &TaintConfig::default());
        assert!(!registry.is_cluster_healthy());
    }
}
