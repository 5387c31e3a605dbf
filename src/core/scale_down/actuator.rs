//! Scale-Down Actuator (spec 4.G, component G). Executes eligible deletions under
//! parallelism bounds, via the per-node state machine
//! `Pending -> Tainting -> (Draining)? -> Deleting -> Done`. The teacher has no
//! analogous concurrent-actuation code (`dslab_core` events are all synchronous
//! single-threaded callbacks), so this module is enriched from `ioustamora-AerolithDB`'s
//! `tokio::sync::Semaphore` + `JoinSet` bounded-worker-pool idiom (see DESIGN.md),
//! applied to the taint/drain/delete pipeline spec 4.G and spec 5 describe.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::core::cloud_provider::{CloudProvider, NodeGroup};
use crate::core::common::{Clock, NodeGroupId, Timestamp};
use crate::core::scale_down::deletion_tracker::{DeletionState, DeletionTracker};
use crate::core::taints::{DEFAULT_CONFLICT_RETRY_INTERVAL, DEFAULT_MAX_RETRY_DEADLINE};
use crate::errors::{ActuationError, TaintError};

/// Mutating operations against the live cluster (taint/cordon/evict) are not part of
/// the cloud provider contract (spec 6) or the read-only listers (spec 1); this is the
/// third external collaborator the actuator needs, analogous to a Kubernetes API
/// client's node/pod write path.
pub trait NodeMutator: Send + Sync {
    fn taint_to_be_deleted(&self, node: &str, unix_time: u64) -> Result<(), TaintError>;
    fn cordon(&self, node: &str);
    fn untaint_and_uncordon(&self, node: &str);
    fn evictable_pod_names(&self, node: &str) -> Vec<String>;
    fn evict_pod(&self, node: &str, pod: &str) -> Result<(), ActuationError>;
    fn pod_gone(&self, node: &str, pod: &str) -> bool;
    /// Deployment owning `pod`, as `(namespace, name)`, if any (spec E.5,
    /// `restarter.go`'s rollout-restart step).
    fn owning_deployment(&self, node: &str, pod: &str) -> Option<(String, String)>;
    /// Patches the Deployment's pod-template annotation to trigger a rollout restart,
    /// mirroring `Restart()`'s `kubectl.kubernetes.io/restartedAt` patch.
    fn restart_deployment(&self, namespace: &str, name: &str) -> Result<(), ActuationError>;
    /// Applies the soft `DeletionCandidateOfClusterAutoscaler` taint while a node sits
    /// in the Unneeded table.
    fn mark_deletion_candidate(&self, node: &str, unix_time: u64);
    /// Removes the soft taint when a node leaves the Unneeded table before deletion.
    fn clean_deletion_candidate(&self, node: &str);
}

pub struct NodeDeletionJob {
    pub node: String,
    pub group: Arc<dyn NodeGroup>,
    pub needs_drain: bool,
    pub atomic: bool,
}

pub struct ScaleDownActuator {
    tracker: Arc<DeletionTracker>,
    clock: Arc<dyn Clock>,
    deletion_semaphore: Arc<Semaphore>,
    drain_semaphore: Arc<Semaphore>,
    node_delete_delay_after_taint: Duration,
    max_pod_eviction_time: Duration,
    node_deletion_batcher_interval: Duration,
    max_retry_deadline: Duration,
    conflict_retry_interval: Duration,
}

impl ScaleDownActuator {
    pub fn new(
        tracker: Arc<DeletionTracker>,
        clock: Arc<dyn Clock>,
        max_scale_down_parallelism: usize,
        max_drain_parallelism: usize,
        node_delete_delay_after_taint: Duration,
        max_pod_eviction_time: Duration,
        node_deletion_batcher_interval: Duration,
    ) -> Self {
        Self {
            tracker,
            clock,
            deletion_semaphore: Arc::new(Semaphore::new(max_scale_down_parallelism.max(1))),
            drain_semaphore: Arc::new(Semaphore::new(max_drain_parallelism.max(1))),
            node_delete_delay_after_taint,
            max_pod_eviction_time,
            node_deletion_batcher_interval,
            max_retry_deadline: DEFAULT_MAX_RETRY_DEADLINE,
            conflict_retry_interval: DEFAULT_CONFLICT_RETRY_INTERVAL,
        }
    }

    pub fn with_retry_schedule(mut self, max_retry_deadline: Duration, conflict_retry_interval: Duration) -> Self {
        self.max_retry_deadline = max_retry_deadline;
        self.conflict_retry_interval = conflict_retry_interval;
        self
    }

    /// Non-blocking per spec 4.G: registers every job with the tracker synchronously
    /// (so `Pending` is visible immediately) and detaches the rest of the pipeline as
    /// a background task the next tick reconciles via `CheckStatus` (spec 5).
    pub fn start_deletion(&self, provider: Arc<dyn CloudProvider>, mutator: Arc<dyn NodeMutator>, jobs: Vec<NodeDeletionJob>) {
        let now = self.clock.now();
        let mut accepted = Vec::new();
        for job in jobs {
            match self.tracker.start(&job.node, now) {
                Ok(()) => accepted.push(job),
                Err(e) => warn!("refusing to start deletion for {}: {e}", job.node),
            }
        }
        if accepted.is_empty() {
            return;
        }

        let tracker = Arc::clone(&self.tracker);
        let clock = Arc::clone(&self.clock);
        let deletion_semaphore = Arc::clone(&self.deletion_semaphore);
        let drain_semaphore = Arc::clone(&self.drain_semaphore);
        let node_delete_delay_after_taint = self.node_delete_delay_after_taint;
        let max_pod_eviction_time = self.max_pod_eviction_time;
        let node_deletion_batcher_interval = self.node_deletion_batcher_interval;
        let max_retry_deadline = self.max_retry_deadline;
        let conflict_retry_interval = self.conflict_retry_interval;

        tokio::spawn(async move {
            run_deletion_round(
                provider,
                mutator,
                tracker,
                clock,
                deletion_semaphore,
                drain_semaphore,
                accepted,
                node_delete_delay_after_taint,
                max_pod_eviction_time,
                node_deletion_batcher_interval,
                max_retry_deadline,
                conflict_retry_interval,
            )
            .await;
        });
    }

    pub fn check_status(&self) -> HashMap<String, crate::core::scale_down::deletion_tracker::DeletionRecord> {
        self.tracker.check_status()
    }

    pub fn clear_results_not_newer_than(&self, t: Timestamp) {
        self.tracker.clear_results_not_newer_than(t);
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_deletion_round(
    provider: Arc<dyn CloudProvider>,
    mutator: Arc<dyn NodeMutator>,
    tracker: Arc<DeletionTracker>,
    clock: Arc<dyn Clock>,
    deletion_semaphore: Arc<Semaphore>,
    drain_semaphore: Arc<Semaphore>,
    jobs: Vec<NodeDeletionJob>,
    node_delete_delay_after_taint: Duration,
    max_pod_eviction_time: Duration,
    node_deletion_batcher_interval: Duration,
    max_retry_deadline: Duration,
    conflict_retry_interval: Duration,
) {
    let mut prepared: JoinSet<(String, NodeGroupId, bool, Result<(), ActuationError>)> = JoinSet::new();

    for job in jobs {
        let tracker = Arc::clone(&tracker);
        let clock = Arc::clone(&clock);
        let mutator = Arc::clone(&mutator);
        let deletion_semaphore = Arc::clone(&deletion_semaphore);
        let drain_semaphore = Arc::clone(&drain_semaphore);
        let group_id = job.group.id();
        let atomic = job.atomic;
        let node = job.node.clone();
        let needs_drain = job.needs_drain;

        prepared.spawn(async move {
            let _permit = deletion_semaphore.acquire_owned().await.unwrap();
            let result = prepare_node(
                &node,
                needs_drain,
                &tracker,
                &*clock,
                &*mutator,
                &drain_semaphore,
                node_delete_delay_after_taint,
                max_pod_eviction_time,
                max_retry_deadline,
                conflict_retry_interval,
            )
            .await;
            (node, group_id, atomic, result)
        });
    }

    let mut by_group: HashMap<NodeGroupId, Vec<(String, bool)>> = HashMap::new();
    let mut failed: Vec<(String, ActuationError)> = Vec::new();

    while let Some(joined) = prepared.join_next().await {
        let Ok((node, group_id, atomic, result)) = joined else {
            continue;
        };
        match result {
            Ok(()) => by_group.entry(group_id).or_default().push((node, atomic)),
            Err(e) => failed.push((node, e)),
        }
    }

    for (node, err) in failed {
        tracker.complete(&node, clock.now(), Err(err));
    }

    if node_deletion_batcher_interval > Duration::ZERO {
        tokio::time::sleep(node_deletion_batcher_interval).await;
    }

    let groups: HashMap<NodeGroupId, Arc<dyn NodeGroup>> =
        provider.node_groups().into_iter().map(|g| (g.id(), g)).collect();

    for (group_id, members) in by_group {
        let Some(group) = groups.get(&group_id) else {
            continue;
        };
        let atomic = members.iter().any(|(_, a)| *a);
        let targets: Vec<String> = if atomic {
            group
                .nodes()
                .map(|instances| instances.into_iter().map(|i| i.id).collect())
                .unwrap_or_else(|_| members.iter().map(|(n, _)| n.clone()).collect())
        } else {
            members.iter().map(|(n, _)| n.clone()).collect()
        };

        match group.delete_nodes(&targets) {
            Ok(()) => {
                for (node, _) in &members {
                    tracker.complete(node, clock.now(), Ok(()));
                }
                info!("deleted nodes {:?} from group {}", targets, group_id);
            }
            Err(e) => {
                for (node, _) in &members {
                    mutator.untaint_and_uncordon(node);
                    tracker.complete(
                        node,
                        clock.now(),
                        Err(ActuationError::DeleteFailed {
                            group: group_id.clone(),
                            message: e.to_string(),
                        }),
                    );
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn prepare_node(
    node: &str,
    needs_drain: bool,
    tracker: &DeletionTracker,
    clock: &dyn Clock,
    mutator: &dyn NodeMutator,
    drain_semaphore: &Semaphore,
    node_delete_delay_after_taint: Duration,
    max_pod_eviction_time: Duration,
    max_retry_deadline: Duration,
    conflict_retry_interval: Duration,
) -> Result<(), ActuationError> {
    tracker.set_state(node, DeletionState::Tainting);
    taint_with_retry(mutator, node, clock, max_retry_deadline, conflict_retry_interval)
        .await
        .map_err(|e| ActuationError::Tainting(node.to_string(), e))?;

    if needs_drain {
        let _permit = drain_semaphore.acquire().await.unwrap();
        tracker.set_state(node, DeletionState::Draining);
        if node_delete_delay_after_taint > Duration::ZERO {
            tokio::time::sleep(node_delete_delay_after_taint).await;
        }

        let pods = mutator.evictable_pod_names(node);
        let mut restarted: std::collections::HashSet<(String, String)> = std::collections::HashSet::new();
        for pod in &pods {
            if let Some((namespace, deployment)) = mutator.owning_deployment(node, pod) {
                if restarted.insert((namespace.clone(), deployment.clone())) {
                    mutator.restart_deployment(&namespace, &deployment)?;
                }
            }
        }
        for pod in &pods {
            mutator.evict_pod(node, pod)?;
        }

        let waited = tokio::time::timeout(max_pod_eviction_time, wait_for_pods_gone(mutator, node, &pods)).await;
        if waited.is_err() {
            mutator.untaint_and_uncordon(node);
            return Err(ActuationError::DrainTimedOut(node.to_string()));
        }
    }

    tracker.set_state(node, DeletionState::Deleting);
    Ok(())
}

async fn taint_with_retry(
    mutator: &dyn NodeMutator,
    node: &str,
    clock: &dyn Clock,
    max_retry_deadline: Duration,
    conflict_retry_interval: Duration,
) -> Result<(), TaintError> {
    let deadline = clock.now().plus_seconds(max_retry_deadline.as_secs());
    loop {
        match mutator.taint_to_be_deleted(node, clock.now().0) {
            Ok(()) => {
                mutator.cordon(node);
                return Ok(());
            }
            Err(_) if clock.now() < deadline => {
                tokio::time::sleep(conflict_retry_interval).await;
            }
            Err(_) => {
                return Err(TaintError::RetryDeadlineExceeded {
                    node: node.to_string(),
                    taint_key: crate::core::taints::TO_BE_DELETED_TAINT.to_string(),
                })
            }
        }
    }
}

async fn wait_for_pods_gone(mutator: &dyn NodeMutator, node: &str, pods: &[String]) {
    loop {
        if pods.iter().all(|p| mutator.pod_gone(node, p)) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cloud_provider::{Instance, StaticCloudProvider, StaticNodeGroup};
    use crate::core::common::{FakeClock, Resources};
    use std::sync::Mutex as StdMutex;

    struct FakeMutator {
        tainted: StdMutex<Vec<String>>,
        evicted: StdMutex<Vec<String>>,
        pods: Vec<String>,
        owners: HashMap<String, (String, String)>,
        restarted: StdMutex<Vec<(String, String)>>,
    }

    impl FakeMutator {
        fn new() -> Self {
            Self {
                tainted: StdMutex::new(Vec::new()),
                evicted: StdMutex::new(Vec::new()),
                pods: Vec::new(),
                owners: HashMap::new(),
                restarted: StdMutex::new(Vec::new()),
            }
        }
    }

    impl NodeMutator for FakeMutator {
        fn taint_to_be_deleted(&self, node: &str, _unix_time: u64) -> Result<(), TaintError> {
            self.tainted.lock().unwrap().push(node.to_string());
            Ok(())
        }
        fn cordon(&self, _node: &str) {}
        fn untaint_and_uncordon(&self, _node: &str) {}
        fn evictable_pod_names(&self, _node: &str) -> Vec<String> {
            self.pods.clone()
        }
        fn evict_pod(&self, node: &str, pod: &str) -> Result<(), ActuationError> {
            self.evicted.lock().unwrap().push(format!("{node}/{pod}"));
            Ok(())
        }
        fn pod_gone(&self, _node: &str, _pod: &str) -> bool {
            true
        }
        fn owning_deployment(&self, _node: &str, pod: &str) -> Option<(String, String)> {
            self.owners.get(pod).cloned()
        }
        fn restart_deployment(&self, namespace: &str, name: &str) -> Result<(), ActuationError> {
            self.restarted.lock().unwrap().push((namespace.to_string(), name.to_string()));
            Ok(())
        }
        fn mark_deletion_candidate(&self, _node: &str, _unix_time: u64) {}
        fn clean_deletion_candidate(&self, _node: &str) {}
    }

    #[tokio::test]
    async fn test_start_deletion_completes_empty_node_without_draining() {
        let tracker = Arc::new(DeletionTracker::new());
        let clock = Arc::new(FakeClock::new(Timestamp(0)));
        let actuator = ScaleDownActuator::new(
            Arc::clone(&tracker),
            Arc::clone(&clock) as Arc<dyn Clock>,
            2,
            1,
            Duration::ZERO,
            Duration::from_secs(5),
            Duration::ZERO,
        );

        let provider = Arc::new(StaticCloudProvider::new());
        let group = provider.add_group(
            StaticNodeGroup::new("ng1", 0, 5, 2, Resources::new(1000, 1024))
                .with_instance(Instance::running("n1", Timestamp(0)))
                .with_instance(Instance::running("n2", Timestamp(0))),
        );
        let mutator = Arc::new(FakeMutator::new());

        actuator.start_deletion(
            provider.clone() as Arc<dyn CloudProvider>,
            mutator.clone() as Arc<dyn NodeMutator>,
            vec![NodeDeletionJob {
                node: "n2".to_string(),
                group: group as Arc<dyn crate::core::cloud_provider::NodeGroup>,
                needs_drain: false,
                atomic: false,
            }],
        );

        for _ in 0..50 {
            if !tracker.is_active("n2") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!tracker.is_active("n2"));
        assert!(mutator.tainted.lock().unwrap().contains(&"n2".to_string()));
    }

    #[tokio::test]
    async fn test_drain_restarts_deployment_once_per_node_before_evicting() {
        let tracker = Arc::new(DeletionTracker::new());
        let clock = Arc::new(FakeClock::new(Timestamp(0)));
        let mut mutator = FakeMutator::new();
        mutator.pods = vec!["p1".to_string(), "p2".to_string()];
        mutator
            .owners
            .insert("p1".to_string(), ("default".to_string(), "web".to_string()));
        mutator
            .owners
            .insert("p2".to_string(), ("default".to_string(), "web".to_string()));
        let mutator = Arc::new(mutator);
        let drain_semaphore = Arc::new(Semaphore::new(1));
        tracker.start("n1", Timestamp(0)).unwrap();

        prepare_node(
            "n1",
            true,
            &tracker,
            &*clock,
            &*mutator,
            &drain_semaphore,
            Duration::ZERO,
            Duration::from_secs(5),
            Duration::from_secs(1),
            Duration::from_millis(10),
        )
        .await
        .unwrap();

        assert_eq!(
            *mutator.restarted.lock().unwrap(),
            vec![("default".to_string(), "web".to_string())]
        );
        assert_eq!(mutator.evicted.lock().unwrap().len(), 2);
    }
}
