//! Scale-Up Orchestrator (spec 4.E, component E). The *expander* that ranks candidate
//! groups is an explicit external collaborator (spec 1 non-goal: "the core invokes it
//! but does not define ranking"); this module owns everything the core enforces around
//! it — backoff filtering, pod eligibility, cluster-wide caps, and min-size
//! enforcement. Grounded on the teacher's `horizontal_pod_autoscaler` decision-making
//! shape (compute a delta, then clamp it against configured bounds), generalized from
//! one metric ratio to the pod-bin-packing-against-a-template computation spec 4.E asks
//! for, since the teacher has no analogous "pick a node group" logic of its own.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};

use crate::core::cloud_provider::{CloudProvider, NodeGroup};
use crate::core::cluster_state::ClusterStateRegistry;
use crate::core::common::{NodeGroupId, Resources, Timestamp};
use crate::core::pod::Pod;
use crate::core::snapshot::NodeInfo;
use crate::core::taints::TaintConfig;
use crate::core::template::synthesize_template;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleUpStatus {
    ScaledUp,
    NoPodsToScaleUp,
    NoOptions,
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScaleUpDecision {
    pub deltas: Vec<(NodeGroupId, u64)>,
    pub status: ScaleUpStatus,
}

/// One group the expander may choose to grow, paired with the sanitized template it
/// would provision (spec 4.E, spec 1 "expander ranks candidate groups").
pub struct ExpansionOption {
    pub group: Arc<dyn NodeGroup>,
    pub template: NodeInfo,
    pub headroom: u64,
}

/// External ranking strategy (spec 1 non-goal). `rank` returns option indices,
/// best-first; the core applies caps and bin-packing math around whatever order comes
/// back, never inspecting the ranking's rationale.
pub trait Expander: Send + Sync {
    fn rank(&self, options: &[ExpansionOption]) -> Vec<usize>;
}

/// Deterministic default: ranks by declaration order. Adequate for tests and for a
/// deployment with a single node group; a real deployment supplies its own (spec 1).
pub struct FirstFitExpander;

impl Expander for FirstFitExpander {
    fn rank(&self, options: &[ExpansionOption]) -> Vec<usize> {
        (0..options.len()).collect()
    }
}

/// Whether `pod`'s creation age and scheduler-visibility make it a scale-up trigger
/// (spec 4.E): a pod under an unrecognized, non-bypassed scheduler never triggers
/// scale-up, and a pod younger than its effective delay is held back. Annotation parse
/// failures fall back to allowing the pod through, per spec 9's resolved Open Question.
pub fn eligible_for_scale_up(
    pod: &Pod,
    now: Timestamp,
    new_pod_scale_up_delay: Duration,
    bypassed_schedulers: &HashSet<String>,
) -> bool {
    let scheduler = &pod.spec.scheduler_name;
    let scheduler_recognized = scheduler.is_empty() || bypassed_schedulers.contains(scheduler);
    if !scheduler.is_empty() && !scheduler_recognized {
        return false;
    }

    let age = now.since(pod.metadata.creation_timestamp);
    let effective_delay = match pod.scale_up_delay_override() {
        Some(Ok(seconds)) => seconds,
        Some(Err(raw)) => {
            warn!(
                "pod {} carries an unparsable scale-up delay annotation ({raw:?}); falling back to the global delay",
                pod.metadata.name
            );
            new_pod_scale_up_delay.as_secs()
        }
        None => new_pod_scale_up_delay.as_secs(),
    };
    age >= effective_delay
}

pub struct ScaleUpOrchestrator {
    expander: Arc<dyn Expander>,
}

impl ScaleUpOrchestrator {
    pub fn new(expander: Arc<dyn Expander>) -> Self {
        Self { expander }
    }

    /// Runs one scale-up decision. `current_totals` is the cluster's existing node
    /// count / total cores / total memory, used to enforce `MaxNodesTotal` et al. as
    /// cluster-wide ceilings rather than per-tick deltas.
    #[allow(clippy::too_many_arguments)]
    pub fn run(
        &self,
        provider: &dyn CloudProvider,
        csr: &ClusterStateRegistry,
        taint_config: &TaintConfig,
        unschedulable_pods: &[Pod],
        now: Timestamp,
        new_pod_scale_up_delay: Duration,
        bypassed_schedulers: &HashSet<String>,
        expendable_pods_priority_cutoff: i32,
        enforce_node_group_min_size: bool,
        current_totals: (u64, u64, u64),
        caps: (u64, u64, u64),
    ) -> ScaleUpDecision {
        let mut deltas: Vec<(NodeGroupId, u64)> = Vec::new();

        if enforce_node_group_min_size {
            for group in provider.node_groups() {
                if let Ok(target) = group.target_size() {
                    if target < group.min_size() {
                        deltas.push((group.id(), group.min_size() - target));
                    }
                }
            }
        }

        let demand_pods: Vec<&Pod> = unschedulable_pods
            .iter()
            .filter(|p| p.spec.priority >= expendable_pods_priority_cutoff)
            .filter(|p| eligible_for_scale_up(p, now, new_pod_scale_up_delay, bypassed_schedulers))
            .collect();

        if demand_pods.is_empty() {
            return ScaleUpDecision {
                status: if deltas.is_empty() {
                    ScaleUpStatus::NoPodsToScaleUp
                } else {
                    ScaleUpStatus::ScaledUp
                },
                deltas,
            };
        }

        let (max_nodes_total, max_cores_total, max_memory_total) = caps;
        let (cur_nodes, cur_cores, cur_memory) = current_totals;
        let mut node_budget = max_nodes_total.saturating_sub(cur_nodes);
        let mut core_budget = max_cores_total.saturating_sub(cur_cores);
        let mut memory_budget = max_memory_total.saturating_sub(cur_memory);

        let candidates: Vec<ExpansionOption> = provider
            .node_groups()
            .into_iter()
            .filter(|g| !csr.backoff_status(&g.id()).in_backoff)
            .filter_map(|g| {
                let target = g.target_size().ok()?;
                if target >= g.max_size() {
                    return None;
                }
                let template = synthesize_template(&g, taint_config).ok()?;
                Some(ExpansionOption {
                    headroom: g.max_size() - target,
                    group: g,
                    template,
                })
            })
            .collect();

        if candidates.is_empty() {
            return ScaleUpDecision {
                status: if deltas.is_empty() {
                    ScaleUpStatus::NoOptions
                } else {
                    ScaleUpStatus::ScaledUp
                },
                deltas,
            };
        }

        let order = self.expander.rank(&candidates);
        let mut remaining = Resources::zero();
        for pod in &demand_pods {
            remaining = remaining.saturating_add(&pod.spec.resources.requests);
        }

        // Spec 4.E's decision contract returns a set of deltas, not a single group: walk
        // the full expander-ranked order, assigning each candidate group a share of the
        // still-unmet demand rather than stopping after the first one that fits.
        let mut scaled_up_any = false;
        for idx in order {
            if remaining.cpu_millis == 0 && remaining.memory_bytes == 0 {
                break;
            }
            if node_budget == 0 || core_budget == 0 || memory_budget == 0 {
                break;
            }
            let option = &candidates[idx];
            let capacity = option.template.node.status.allocatable;
            if capacity.cpu_millis == 0 && capacity.memory_bytes == 0 {
                continue;
            }
            let nodes_for_cpu = if capacity.cpu_millis == 0 {
                0
            } else {
                remaining.cpu_millis.div_ceil(capacity.cpu_millis)
            };
            let nodes_for_memory = if capacity.memory_bytes == 0 {
                0
            } else {
                remaining.memory_bytes.div_ceil(capacity.memory_bytes)
            };
            let mut nodes_needed = nodes_for_cpu.max(nodes_for_memory).max(1);

            nodes_needed = nodes_needed.min(option.headroom).min(node_budget);
            let node_cores = capacity.cpu_millis.div_ceil(1000).max(1);
            nodes_needed = nodes_needed
                .min(core_budget / node_cores.max(1))
                .min(memory_budget / capacity.memory_bytes.max(1));

            if nodes_needed == 0 {
                continue;
            }

            deltas.push((option.group.id(), nodes_needed));
            node_budget -= nodes_needed;
            core_budget = core_budget.saturating_sub(nodes_needed * node_cores);
            memory_budget = memory_budget.saturating_sub(nodes_needed * capacity.memory_bytes);
            let provided = Resources::new(
                nodes_needed.saturating_mul(capacity.cpu_millis),
                nodes_needed.saturating_mul(capacity.memory_bytes),
            );
            remaining = remaining.saturating_sub(&provided);
            scaled_up_any = true;
            info!("scale-up decision: group {} +{}", option.group.id(), nodes_needed);
        }

        let status = if scaled_up_any || !deltas.is_empty() {
            ScaleUpStatus::ScaledUp
        } else {
            ScaleUpStatus::NoOptions
        };

        ScaleUpDecision { deltas, status }
    }
}
