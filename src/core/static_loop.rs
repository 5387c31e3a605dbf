//! Static Loop (spec 4.H, component H): ties components B-G together on every tick,
//! enforcing ordering, timeouts, and the cross-cutting rules spec 4.H numbers 1-9.
//! Grounded on the teacher's `kube_cluster_autoscaler::run_iteration` tick shape (pull
//! snapshots, refresh state, decide, act, clean up) generalized from the teacher's
//! single `scale_up_if_needed` branch into the full nine-step ordering spec 4.H
//! specifies, including the scale-down path the teacher never implements.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{info, warn};

use crate::config::AutoscalingOptions;
use crate::core::cloud_provider::CloudProvider;
use crate::core::cluster_state::{ClusterStateRegistry, NodeReadiness};
use crate::core::common::{Clock, NodeGroupId, Timestamp};
use crate::core::listers::{DaemonSetLister, NodeLister, PodDisruptionBudgetLister, PodLister};
use crate::core::scale_down::actuator::{NodeDeletionJob, NodeMutator, ScaleDownActuator};
use crate::core::scale_down::deletion_tracker::DeletionState;
use crate::core::scale_down::planner::{CandidateNode, ScaleDownPlanner};
use crate::core::scale_up::{ScaleUpOrchestrator, ScaleUpStatus};
use crate::core::snapshot::ClusterSnapshot;
use crate::core::taints::TaintConfig;
use crate::core::template::synthesize_template;
use crate::errors::TickError;

/// Deletion records older than this are dropped from the tracker each tick, bounding
/// how long a completed result can suppress a double-delete race (spec 3).
const DELETION_RESULT_GRACE_PERIOD: Duration = Duration::from_secs(5 * 60);

struct LoopState {
    last_scale_up_time: Timestamp,
    last_scale_down_fail_time: Timestamp,
}

pub struct StaticLoop {
    provider: Arc<dyn CloudProvider>,
    node_lister: Arc<dyn NodeLister>,
    pod_lister: Arc<dyn PodLister>,
    pdb_lister: Arc<dyn PodDisruptionBudgetLister>,
    #[allow(dead_code)]
    daemonset_lister: Arc<dyn DaemonSetLister>,
    mutator: Arc<dyn NodeMutator>,
    clock: Arc<dyn Clock>,
    options: AutoscalingOptions,
    taint_config: TaintConfig,
    csr: ClusterStateRegistry,
    planner: ScaleDownPlanner,
    actuator: ScaleDownActuator,
    scale_up: ScaleUpOrchestrator,
    state: Mutex<LoopState>,
}

impl StaticLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: Arc<dyn CloudProvider>,
        node_lister: Arc<dyn NodeLister>,
        pod_lister: Arc<dyn PodLister>,
        pdb_lister: Arc<dyn PodDisruptionBudgetLister>,
        daemonset_lister: Arc<dyn DaemonSetLister>,
        mutator: Arc<dyn NodeMutator>,
        clock: Arc<dyn Clock>,
        options: AutoscalingOptions,
        taint_config: TaintConfig,
        scale_up: ScaleUpOrchestrator,
    ) -> Self {
        let csr = ClusterStateRegistry::new(
            Arc::clone(&clock),
            options.max_node_provision_time,
            options.max_node_startup_time,
            options.ok_total_unready_count,
            options.max_total_unready_percentage,
        );
        let tracker = Arc::new(crate::core::scale_down::deletion_tracker::DeletionTracker::new());
        let actuator = ScaleDownActuator::new(
            tracker,
            Arc::clone(&clock),
            options.max_scale_down_parallelism,
            options.max_drain_parallelism,
            options.node_delete_delay_after_taint,
            options.max_pod_eviction_time,
            options.node_deletion_batcher_interval,
        );
        Self {
            provider,
            node_lister,
            pod_lister,
            pdb_lister,
            daemonset_lister,
            mutator,
            clock,
            options,
            taint_config,
            csr,
            planner: ScaleDownPlanner::new(),
            actuator,
            scale_up,
            state: Mutex::new(LoopState {
                last_scale_up_time: Timestamp::zero(),
                last_scale_down_fail_time: Timestamp::zero(),
            }),
        }
    }

    /// One tick, in the nine-step order spec 4.H specifies.
    pub fn tick(&self) -> Result<(), TickError> {
        let now = self.clock.now();

        // 1. Snapshots.
        let nodes = self.node_lister.list();
        let pods = self.pod_lister.list();
        let pdbs = self.pdb_lister.list();
        let mut snapshot = ClusterSnapshot::build(nodes.clone(), pods.clone());
        self.inject_upcoming_nodes(&mut snapshot);

        // 2. Refresh cluster state.
        let mut provider_call_failures = 0usize;
        if self.csr.refresh_provider_cache(&*self.provider).is_err() {
            provider_call_failures += 1;
        }
        self.csr.update_nodes(&nodes, &self.taint_config);

        // 3. Health gate.
        let healthy = self.csr.is_cluster_healthy();
        if !healthy {
            warn!("cluster unhealthy this tick; skipping scale actions");
        }

        // 4. Pod classification: eligibility is evaluated inside the scale-up
        // orchestrator, which owns the bypassed-scheduler / young-pod filters (spec
        // 4.E); here we only need the raw unschedulable set.
        let unschedulable_pods: Vec<_> = pods.iter().filter(|p| p.status.is_unschedulable()).cloned().collect();

        // 5. fixNodeGroupSize.
        self.fix_node_group_sizes(&nodes, now);

        let mut scaled_up_this_tick = false;
        if healthy {
            if !unschedulable_pods.is_empty() {
                // 6. Scale-up.
                let current_totals = self.current_totals(&nodes);
                let caps = (
                    self.options.max_nodes_total,
                    self.options.max_cores_total,
                    self.options.max_memory_total_bytes,
                );
                let decision = self.scale_up.run(
                    &*self.provider,
                    &self.csr,
                    &self.taint_config,
                    &unschedulable_pods,
                    now,
                    self.options.new_pod_scale_up_delay,
                    &self.options.bypassed_schedulers,
                    self.options.expendable_pods_priority_cutoff,
                    self.options.enforce_node_group_min_size,
                    current_totals,
                    caps,
                );
                if decision.status == ScaleUpStatus::ScaledUp {
                    for (group_id, delta) in &decision.deltas {
                        if let Some(group) = self.provider.node_groups().into_iter().find(|g| &g.id() == group_id) {
                            if group.increase_size(*delta).is_ok() {
                                self.csr.register_scale_up(group_id, *delta);
                            } else {
                                provider_call_failures += 1;
                            }
                        }
                    }
                    self.state.lock().unwrap().last_scale_up_time = now;
                    scaled_up_this_tick = true;
                }
            }

            // 7. Scale-down, suppressed this tick if a scale-up just happened.
            if !scaled_up_this_tick && self.options.scale_down_enabled {
                let state = self.state.lock().unwrap();
                let delay_after_add_ok = now.since(state.last_scale_up_time) >= self.options.scale_down_delay_after_add.as_secs();
                let delay_after_failure_ok =
                    now.since(state.last_scale_down_fail_time) >= self.options.scale_down_delay_after_failure.as_secs();
                drop(state);

                if delay_after_add_ok && delay_after_failure_ok {
                    self.run_scale_down(&snapshot, &nodes, &pdbs, now);
                }
            }
        }

        // 8. Cleanup runs unconditionally (spec 9: independent of the health gate).
        let deletion_failures_from_cleanup = self.cleanup_unregistered_and_errored_nodes();

        // 9. Advance the deletion tracker and roll failures into `lastScaleDownFailTime`.
        let deletion_failures = self.advance_deletion_tracker(now);

        let total_deletion_failures = deletion_failures + deletion_failures_from_cleanup;
        if provider_call_failures > 0 || total_deletion_failures > 0 {
            Err(if provider_call_failures > 0 {
                TickError::ProviderCalls(provider_call_failures)
            } else {
                TickError::Deletions(total_deletion_failures)
            })
        } else {
            Ok(())
        }
    }

    fn current_totals(&self, nodes: &[crate::core::node::Node]) -> (u64, u64, u64) {
        let total_nodes = nodes.len() as u64;
        let mut total_cores = 0u64;
        let mut total_memory = 0u64;
        for node in nodes {
            total_cores += node.status.allocatable.cpu_millis.div_ceil(1000);
            total_memory += node.status.allocatable.memory_bytes;
        }
        (total_nodes, total_cores, total_memory)
    }

    /// Injects synthetic node-info entries for provider-reported capacity that has not
    /// registered as a `Node` object yet, so scale-down simulation doesn't evict pods
    /// the coming capacity would absorb (spec 4.F "Upcoming nodes").
    fn inject_upcoming_nodes(&self, snapshot: &mut ClusterSnapshot) {
        for group in self.provider.node_groups() {
            let Ok(target) = group.target_size() else { continue };
            let registered = snapshot
                .all_node_infos()
                .filter(|info| info.node.node_group_label() == Some(group.id().0.as_str()))
                .count() as u64;
            if target <= registered {
                continue;
            }
            for i in registered..target {
                if let Ok(node_info) = synthesize_template(&group, &self.taint_config) {
                    let mut node = node_info.node;
                    node.metadata.name = format!("{}-upcoming-{}", group.id().0, i);
                    snapshot.add_upcoming_node(node);
                }
            }
        }
    }

    /// Decrements a group's target back to its observed size when the provider has
    /// been stuck below target past `MaxNodeProvisionTime` (spec 4.H step 5).
    fn fix_node_group_sizes(&self, nodes: &[crate::core::node::Node], now: Timestamp) {
        for group in self.provider.node_groups() {
            let Some(target) = self.csr.observed_target_size(&group.id()) else {
                continue;
            };
            let registered = nodes
                .iter()
                .filter(|n| n.node_group_label() == Some(group.id().0.as_str()))
                .count() as u64;
            if registered >= target {
                continue;
            }
            let Some(last_change) = self.csr.last_target_change(&group.id()) else {
                continue;
            };
            if now.since(last_change) > self.options.max_node_provision_time.as_secs() {
                if group.decrease_target_size(target - registered).is_ok() {
                    info!(
                        "fixNodeGroupSize: group {} stuck at {} below target {}, correcting",
                        group.id(),
                        registered,
                        target
                    );
                }
            }
        }
    }

    fn run_scale_down(
        &self,
        snapshot: &ClusterSnapshot,
        nodes: &[crate::core::node::Node],
        pdbs: &[crate::core::listers::PodDisruptionBudget],
        now: Timestamp,
    ) {
        let currently_deleting: std::collections::HashSet<String> = self
            .actuator
            .check_status()
            .into_iter()
            .filter(|(_, record)| record.state != DeletionState::Done)
            .map(|(name, _)| name)
            .collect();

        let mut candidates = Vec::new();
        let mut group_by_node: HashMap<String, NodeGroupId> = HashMap::new();
        let mut atomic_by_group: HashMap<NodeGroupId, bool> = HashMap::new();
        for group in self.provider.node_groups() {
            let resolved = group.get_options(&self.options).resolve(&self.options);
            let atomic = group.atomic() || resolved.atomic;
            atomic_by_group.insert(group.id(), atomic);
            let target = group.target_size().unwrap_or(group.min_size());
            for node in nodes.iter().filter(|n| n.node_group_label() == Some(group.id().0.as_str())) {
                let readiness = self.csr.classification_of(&node.metadata.name).unwrap_or(NodeReadiness::Ready);
                group_by_node.insert(node.metadata.name.clone(), group.id());
                candidates.push(CandidateNode {
                    name: node.metadata.name.clone(),
                    group: group.id(),
                    readiness,
                    scale_down_disabled: resolved.scale_down_disabled,
                    group_above_min: target > group.min_size(),
                    scale_down_unneeded_time: resolved.scale_down_unneeded_time,
                    scale_down_unready_time: resolved.scale_down_unready_time,
                    scale_down_utilization_threshold: resolved.scale_down_utilization_threshold,
                });
            }
        }

        let transitions = self.planner.update_cluster_state(
            snapshot,
            &candidates,
            pdbs,
            &currently_deleting,
            self.options.expendable_pods_priority_cutoff,
            now,
        );
        for transition in transitions {
            match transition {
                crate::core::scale_down::planner::UnneededTransition::Entered(node) => {
                    self.mutator.mark_deletion_candidate(&node, now.0);
                }
                crate::core::scale_down::planner::UnneededTransition::Exited(node) => {
                    self.mutator.clean_deletion_candidate(&node);
                }
            }
        }
        let plan = self.planner.nodes_to_delete(snapshot, &candidates, now);

        if plan.empty.is_empty() && plan.need_drain.is_empty() {
            return;
        }

        let groups: HashMap<NodeGroupId, _> = self.provider.node_groups().into_iter().map(|g| (g.id(), g)).collect();
        let mut jobs = Vec::new();
        for node in plan.empty {
            if let Some(group_id) = group_by_node.get(&node) {
                if let Some(group) = groups.get(group_id) {
                    jobs.push(NodeDeletionJob {
                        node,
                        group: Arc::clone(group),
                        needs_drain: false,
                        atomic: atomic_by_group.get(group_id).copied().unwrap_or(false),
                    });
                }
            }
        }
        for node in plan.need_drain {
            if let Some(group_id) = group_by_node.get(&node) {
                if let Some(group) = groups.get(group_id) {
                    jobs.push(NodeDeletionJob {
                        node,
                        group: Arc::clone(group),
                        needs_drain: true,
                        atomic: atomic_by_group.get(group_id).copied().unwrap_or(false),
                    });
                }
            }
        }

        self.actuator.start_deletion(Arc::clone(&self.provider), Arc::clone(&self.mutator), jobs);
    }

    /// `removeOldUnregisteredNodes` and `deleteCreatedNodesWithErrors` (spec 4.H step
    /// 8); runs regardless of the health gate (spec 9 resolved Open Question).
    fn cleanup_unregistered_and_errored_nodes(&self) -> usize {
        let mut failures = 0;

        let mut unregistered_by_group: HashMap<NodeGroupId, Vec<String>> = HashMap::new();
        for (group_id, instance_id) in self.csr.get_unregistered_nodes() {
            unregistered_by_group.entry(group_id).or_default().push(instance_id);
        }
        for (group_id, instance_ids) in unregistered_by_group {
            let Some(group) = self.provider.node_groups().into_iter().find(|g| g.id() == group_id) else {
                continue;
            };
            let resolved = group.get_options(&self.options).resolve(&self.options);
            let targets = if group.atomic() || resolved.atomic {
                group
                    .nodes()
                    .map(|instances| instances.into_iter().map(|i| i.id).collect())
                    .unwrap_or(instance_ids)
            } else {
                instance_ids
            };
            if group.delete_nodes(&targets).is_err() {
                failures += 1;
            }
        }

        self.csr.record_creation_error_backoffs();
        for (group_id, targets) in self.csr.deletion_set_for_creation_errors(&*self.provider) {
            let Some(group) = self.provider.node_groups().into_iter().find(|g| g.id() == group_id) else {
                continue;
            };
            if group.delete_nodes(&targets).is_err() {
                failures += 1;
            }
        }

        failures
    }

    fn advance_deletion_tracker(&self, now: Timestamp) -> usize {
        let mut failures = 0;
        for (_, record) in self.actuator.check_status() {
            if record.state == DeletionState::Done {
                if let Some(Err(_)) = &record.result {
                    failures += 1;
                }
            }
        }
        if failures > 0 {
            self.state.lock().unwrap().last_scale_down_fail_time = now;
        }
        let grace_boundary = Timestamp(now.0.saturating_sub(DELETION_RESULT_GRACE_PERIOD.as_secs()));
        self.actuator.clear_results_not_newer_than(grace_boundary);
        failures
    }
}
