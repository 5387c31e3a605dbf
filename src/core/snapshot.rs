//! Node/Pod Snapshot (spec 4, component B) and the cluster snapshot arena used by the
//! scale-down planner's eviction simulation (spec 4.F.3, spec 9 "arena + index map").
//! Grounded on the teacher's `ClusterState`/`core::cluster_controller` map-of-nodes
//! idiom, generalized into a by-name arena that supports cheap forking instead of the
//! teacher's single mutable simulation-wide state.

use std::collections::BTreeMap;

use crate::core::common::Resources;
use crate::core::node::Node;
use crate::core::pod::Pod;

/// One node plus the pods currently scheduled onto it, as seen at snapshot time.
/// `upcoming` marks a synthetic entry injected for provider-reported capacity that has
/// not registered as a `Node` object yet (spec 4.F "Upcoming nodes").
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub node: Node,
    pub pods: Vec<Pod>,
    pub upcoming: bool,
}

impl NodeInfo {
    pub fn new(node: Node) -> Self {
        Self {
            node,
            pods: Vec::new(),
            upcoming: false,
        }
    }

    pub fn upcoming(node: Node) -> Self {
        Self {
            node,
            pods: Vec::new(),
            upcoming: true,
        }
    }

    pub fn requested(&self) -> Resources {
        self.pods
            .iter()
            .fold(Resources::zero(), |acc, p| acc.saturating_add(&p.spec.resources.requests))
    }

    pub fn free(&self) -> Resources {
        self.node.status.allocatable.saturating_sub(&self.requested())
    }

    pub fn utilization(&self) -> f64 {
        self.requested().utilization_against(&self.node.status.allocatable)
    }

    /// Non-DaemonSet, non-mirror pods: the only pods a drain or eviction simulation
    /// actually has to relocate (spec 4.F.3, spec 4.G.2).
    pub fn evictable_pods(&self) -> impl Iterator<Item = &Pod> {
        self.pods.iter().filter(|p| !p.is_daemonset_pod() && !p.is_mirror_pod())
    }

    pub fn can_fit(&self, requested: &Resources) -> bool {
        requested.fits_within(&self.free())
    }
}

/// Arena of node-info records keyed by node name (spec 9). Cloning is the snapshot's
/// copy-on-write mechanism: `fork()` hands the planner a private working copy so
/// simulated placements never leak back into the published cluster view.
#[derive(Debug, Clone, Default)]
pub struct ClusterSnapshot {
    nodes: BTreeMap<String, NodeInfo>,
}

impl ClusterSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a fresh snapshot from listers' output: assigns each pod to its node's
    /// entry, leaving unschedulable pods (no `status.node_name`) out of every node.
    pub fn build(nodes: Vec<Node>, pods: Vec<Pod>) -> Self {
        let mut snapshot = Self::new();
        for node in nodes {
            snapshot.add_node(node);
        }
        for pod in pods {
            if let Some(node_name) = pod.status.node_name.clone() {
                snapshot.add_pod(&node_name, pod);
            }
        }
        snapshot
    }

    pub fn add_node(&mut self, node: Node) {
        let name = node.metadata.name.clone();
        self.nodes.insert(name, NodeInfo::new(node));
    }

    /// Injects a synthetic node-info for upcoming provider capacity (spec 4.F).
    pub fn add_upcoming_node(&mut self, node: Node) {
        let name = node.metadata.name.clone();
        self.nodes.insert(name, NodeInfo::upcoming(node));
    }

    pub fn add_pod(&mut self, node_name: &str, pod: Pod) {
        if let Some(info) = self.nodes.get_mut(node_name) {
            info.pods.push(pod);
        }
    }

    pub fn remove_pod(&mut self, node_name: &str, pod_name: &str) -> Option<Pod> {
        let info = self.nodes.get_mut(node_name)?;
        let idx = info.pods.iter().position(|p| p.metadata.name == pod_name)?;
        Some(info.pods.remove(idx))
    }

    pub fn remove_node(&mut self, node_name: &str) -> Option<NodeInfo> {
        self.nodes.remove(node_name)
    }

    pub fn node_info(&self, node_name: &str) -> Option<&NodeInfo> {
        self.nodes.get(node_name)
    }

    pub fn node_info_mut(&mut self, node_name: &str) -> Option<&mut NodeInfo> {
        self.nodes.get_mut(node_name)
    }

    pub fn all_node_infos(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Private working copy for simulation; mutations to the fork never touch `self`.
    pub fn fork(&self) -> ClusterSnapshot {
        self.clone()
    }

    /// Tries to place `pod` on any node other than `exclude`, respecting only resource
    /// fit. Affinity/taint matching against node-info labels is layered on top by
    /// callers that need it; this is the resource-fit primitive both the scale-down
    /// planner's simulation and template synthesis share.
    pub fn find_placement(&self, pod: &Pod, exclude: &str) -> Option<String> {
        self.nodes
            .values()
            .filter(|info| info.node.metadata.name != exclude)
            .find(|info| info.can_fit(&pod.spec.resources.requests))
            .map(|info| info.node.metadata.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::common::Resources;

    #[test]
    fn test_build_assigns_pods_to_their_node_only() {
        let nodes = vec![
            Node::new("n1", Resources::new(1000, 1024)),
            Node::new("n2", Resources::new(1000, 1024)),
        ];
        let pods = vec![
            Pod::new("p1", Resources::new(200, 200)).assigned_to("n1"),
            Pod::new("p2", Resources::new(200, 200)).unschedulable(),
        ];
        let snapshot = ClusterSnapshot::build(nodes, pods);
        assert_eq!(snapshot.node_info("n1").unwrap().pods.len(), 1);
        assert_eq!(snapshot.node_info("n2").unwrap().pods.len(), 0);
    }

    #[test]
    fn test_fork_mutation_does_not_affect_original() {
        let mut snapshot = ClusterSnapshot::new();
        snapshot.add_node(Node::new("n1", Resources::new(1000, 1024)));
        let mut forked = snapshot.fork();
        forked.add_pod("n1", Pod::new("p1", Resources::new(100, 100)).assigned_to("n1"));
        assert_eq!(snapshot.node_info("n1").unwrap().pods.len(), 0);
        assert_eq!(forked.node_info("n1").unwrap().pods.len(), 1);
    }

    #[test]
    fn test_find_placement_excludes_source_node_and_checks_fit() {
        let mut snapshot = ClusterSnapshot::new();
        snapshot.add_node(Node::new("n1", Resources::new(1000, 1024)));
        snapshot.add_node(Node::new("n2", Resources::new(1000, 1024)));
        snapshot.add_pod("n2", Pod::new("filler", Resources::new(900, 100)).assigned_to("n2"));
        let pod = Pod::new("p1", Resources::new(200, 200));
        assert_eq!(snapshot.find_placement(&pod, "n1"), None);
    }

    #[test]
    fn test_evictable_pods_skips_daemonset_and_mirror() {
        let mut info = NodeInfo::new(Node::new("n1", Resources::new(1000, 1024)));
        info.pods.push(Pod::new("ds", Resources::zero()).owned_by("DaemonSet", "ds1"));
        info.pods.push(Pod::new("regular", Resources::new(100, 100)));
        assert_eq!(info.evictable_pods().count(), 1);
    }
}
