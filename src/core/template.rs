//! Template & Utilization (spec 4, component D). Synthesizes the node-info template a
//! group would provision and computes per-node resource utilization used by the
//! scale-down planner's candidate gate. Grounded on the teacher's
//! `scheduler::model` node-capacity accessors plus `taints::sanitize_taints`, which
//! this module composes rather than duplicates.

use std::sync::Arc;

use crate::core::cloud_provider::NodeGroup;
use crate::core::node::Node;
use crate::core::snapshot::NodeInfo;
use crate::core::taints::{sanitize_taints, TaintConfig};
use crate::errors::ProviderError;

/// Builds the sanitized node-info template for a group (spec 4.T "before a live node is
/// sanitized into a node-group template"): pulls the provider's raw template and strips
/// autoscaler-owned, node-condition, and configured-prefix taints before it is used for
/// scale-up capacity estimation or scale-down eviction simulation of upcoming nodes.
pub fn synthesize_template(group: &Arc<dyn NodeGroup>, taint_config: &TaintConfig) -> Result<NodeInfo, ProviderError> {
    let mut node = group.template_node_info()?;
    node.spec.taints = sanitize_taints(&node.spec.taints, taint_config);
    Ok(NodeInfo::upcoming(node))
}

/// Fraction of allocatable capacity consumed on `node_info`, matching spec 4.F.2's
/// "sum of requested CPU/memory over allocatable" and spec 3's `utilization_against`.
pub fn utilization(node_info: &NodeInfo) -> f64 {
    node_info.utilization()
}

/// Utilization for every node in a slice, paired with the node's name, useful for the
/// planner's gate and for future observability surfaces (spec 1 scopes metrics out, but
/// the computation itself is in-scope ambient behavior, not a metrics backend).
pub fn utilization_by_node<'a>(infos: impl Iterator<Item = &'a NodeInfo>) -> Vec<(String, f64)> {
    infos
        .map(|info| (info.node.metadata.name.clone(), utilization(info)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cloud_provider::StaticNodeGroup;
    use crate::core::common::Resources;
    use crate::core::node::{Taint, TaintEffect};
    use crate::core::pod::Pod;

    #[test]
    fn test_synthesize_template_strips_node_condition_taint() {
        let group: Arc<dyn NodeGroup> =
            Arc::new(StaticNodeGroup::new("ng1", 0, 5, 1, Resources::new(1000, 1024)));
        let config = TaintConfig::default();
        let template = synthesize_template(&group, &config).unwrap();
        assert!(template.upcoming);
        assert!(template.node.spec.taints.is_empty());
    }

    #[test]
    fn test_sanitize_strips_configured_status_taint_from_a_raw_template() {
        let mut node = Node::new("n-tainted", Resources::new(1000, 1024));
        node.spec.taints.push(Taint::new(
            "status-taint.cluster-autoscaler.kubernetes.io/gpu",
            "",
            TaintEffect::NoSchedule,
        ));
        let config = TaintConfig::default();
        let sanitized = sanitize_taints(&node.spec.taints, &config);
        assert!(sanitized.is_empty());
    }

    #[test]
    fn test_utilization_picks_max_dimension() {
        let mut info = NodeInfo::new(Node::new("n1", Resources::new(1000, 1000)));
        info.pods.push(Pod::new("p1", Resources::new(900, 100)));
        assert_eq!(utilization(&info), 0.9);
    }
}
