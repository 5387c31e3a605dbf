//! Cloud Provider Contract (spec 4, component A). Scoped as a contract only: the core
//! calls into it but this crate defines no concrete cloud driver, matching spec 1's
//! explicit exclusion of "one specific cloud's instance-pool adapter". Grounded on the
//! teacher's `CloudProvider`/`NodeGroup` traits in
//! `autoscalers/cluster_autoscaler/interface.rs`, generalized from the teacher's
//! single simulated provider to the full contract spec 6 lists.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::config::{AutoscalingOptions, NodeGroupAutoscalingOptions};
use crate::core::common::{NodeGroupId, Resources, Timestamp};
use crate::core::node::Node;
use crate::errors::ProviderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceLifecycleState {
    Running,
    Creating,
    Deleting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    OutOfResources,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub class: ErrorClass,
    pub code: String,
}

/// A provider-side view of one machine, independent of whether a corresponding `Node`
/// object has registered yet (spec 3, "Instance (provider view)").
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub id: String,
    pub state: InstanceLifecycleState,
    pub created_at: Timestamp,
    pub error: Option<ErrorInfo>,
}

impl Instance {
    pub fn running(id: impl Into<String>, created_at: Timestamp) -> Self {
        Self {
            id: id.into(),
            state: InstanceLifecycleState::Running,
            created_at,
            error: None,
        }
    }

    pub fn creating(id: impl Into<String>, created_at: Timestamp) -> Self {
        Self {
            id: id.into(),
            state: InstanceLifecycleState::Creating,
            created_at,
            error: None,
        }
    }

    pub fn with_error(mut self, class: ErrorClass, code: impl Into<String>) -> Self {
        self.error = Some(ErrorInfo {
            class,
            code: code.into(),
        });
        self
    }
}

/// One homogeneous group of machines (spec 3, "NodeGroup"). The template this group
/// would provision, min/max/target bounds, and the atomic/autoprovisioned flags.
pub trait NodeGroup: Send + Sync {
    fn id(&self) -> NodeGroupId;
    fn min_size(&self) -> u64;
    fn max_size(&self) -> u64;
    fn target_size(&self) -> Result<u64, ProviderError>;
    fn increase_size(&self, delta: u64) -> Result<(), ProviderError>;
    fn delete_nodes(&self, nodes: &[String]) -> Result<(), ProviderError>;
    fn decrease_target_size(&self, delta: u64) -> Result<(), ProviderError>;
    fn nodes(&self) -> Result<Vec<Instance>, ProviderError>;
    /// Synthesizes a template `Node` representative of what this group would provision,
    /// used by component D before scale-up simulation has a live node to sample.
    fn template_node_info(&self) -> Result<Node, ProviderError>;
    fn exist(&self) -> bool;
    fn autoprovisioned(&self) -> bool;
    fn atomic(&self) -> bool;
    fn get_options(&self, defaults: &AutoscalingOptions) -> NodeGroupAutoscalingOptions;
}

/// The driver the core calls into (spec 6, "Cloud Provider driver (pluggable)").
pub trait CloudProvider: Send + Sync {
    fn node_groups(&self) -> Vec<Arc<dyn NodeGroup>>;
    fn node_group_for_node(&self, node: &Node) -> Option<Arc<dyn NodeGroup>>;
    fn has_instance(&self, node: &Node) -> bool;
    /// Optional cache-refresh hint; a no-op for providers with no internal cache.
    fn refresh(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// In-memory test double used by integration tests and as a reference provider: plain
/// `Mutex`-guarded maps rather than the teacher's `Rc<RefCell<>>`, since this crate's
/// actuator uses `tokio` tasks that must be `Send`.
pub struct StaticCloudProvider {
    groups: Mutex<HashMap<NodeGroupId, Arc<StaticNodeGroup>>>,
}

impl StaticCloudProvider {
    pub fn new() -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_group(&self, group: StaticNodeGroup) -> Arc<StaticNodeGroup> {
        let group = Arc::new(group);
        self.groups
            .lock()
            .unwrap()
            .insert(group.id.clone(), Arc::clone(&group));
        group
    }

    pub fn group(&self, id: &NodeGroupId) -> Option<Arc<StaticNodeGroup>> {
        self.groups.lock().unwrap().get(id).cloned()
    }
}

impl Default for StaticCloudProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl CloudProvider for StaticCloudProvider {
    fn node_groups(&self) -> Vec<Arc<dyn NodeGroup>> {
        self.groups
            .lock()
            .unwrap()
            .values()
            .map(|g| Arc::clone(g) as Arc<dyn NodeGroup>)
            .collect()
    }

    fn node_group_for_node(&self, node: &Node) -> Option<Arc<dyn NodeGroup>> {
        let label = node.node_group_label()?;
        self.group(&NodeGroupId(label.to_string()))
            .map(|g| g as Arc<dyn NodeGroup>)
    }

    fn has_instance(&self, node: &Node) -> bool {
        self.node_group_for_node(node)
            .map(|g| {
                g.nodes()
                    .map(|instances| instances.iter().any(|i| i.id == node.metadata.name))
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }
}

pub struct StaticNodeGroup {
    id: NodeGroupId,
    min_size: u64,
    max_size: u64,
    atomic: bool,
    autoprovisioned: bool,
    template_capacity: Resources,
    state: Mutex<StaticNodeGroupState>,
}

struct StaticNodeGroupState {
    target_size: u64,
    instances: Vec<Instance>,
    deleted: Vec<String>,
}

impl StaticNodeGroup {
    pub fn new(
        id: impl Into<NodeGroupId>,
        min_size: u64,
        max_size: u64,
        target_size: u64,
        template_capacity: Resources,
    ) -> Self {
        Self {
            id: id.into(),
            min_size,
            max_size,
            atomic: false,
            autoprovisioned: false,
            template_capacity,
            state: Mutex::new(StaticNodeGroupState {
                target_size,
                instances: Vec::new(),
                deleted: Vec::new(),
            }),
        }
    }

    pub fn atomic(mut self) -> Self {
        self.atomic = true;
        self
    }

    pub fn with_instance(self, instance: Instance) -> Self {
        self.state.lock().unwrap().instances.push(instance);
        self
    }

    pub fn deleted_nodes(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }
}

impl NodeGroup for StaticNodeGroup {
    fn id(&self) -> NodeGroupId {
        self.id.clone()
    }

    fn min_size(&self) -> u64 {
        self.min_size
    }

    fn max_size(&self) -> u64 {
        self.max_size
    }

    fn target_size(&self) -> Result<u64, ProviderError> {
        Ok(self.state.lock().unwrap().target_size)
    }

    fn increase_size(&self, delta: u64) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        let new_target = state.target_size.saturating_add(delta);
        if new_target > self.max_size {
            return Err(ProviderError::Backend {
                group: self.id.clone(),
                message: format!("target {} would exceed max {}", new_target, self.max_size),
            });
        }
        state.target_size = new_target;
        Ok(())
    }

    fn delete_nodes(&self, nodes: &[String]) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        state
            .instances
            .retain(|i| !nodes.iter().any(|n| n == &i.id));
        state.target_size = state.target_size.saturating_sub(nodes.len() as u64);
        state.deleted.extend(nodes.iter().cloned());
        Ok(())
    }

    fn decrease_target_size(&self, delta: u64) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.target_size = state.target_size.saturating_sub(delta);
        Ok(())
    }

    fn nodes(&self) -> Result<Vec<Instance>, ProviderError> {
        Ok(self.state.lock().unwrap().instances.clone())
    }

    fn template_node_info(&self) -> Result<Node, ProviderError> {
        Ok(Node::new(format!("{}-template", self.id.0), self.template_capacity)
            .with_label("node_group", self.id.0.clone()))
    }

    fn exist(&self) -> bool {
        true
    }

    fn autoprovisioned(&self) -> bool {
        self.autoprovisioned
    }

    fn atomic(&self) -> bool {
        self.atomic
    }

    fn get_options(&self, defaults: &AutoscalingOptions) -> NodeGroupAutoscalingOptions {
        NodeGroupAutoscalingOptions {
            zero_or_max_node_scaling: self.atomic,
            scale_down_unneeded_time: Some(defaults.scale_down_unneeded_time),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increase_size_respects_max() {
        let group = StaticNodeGroup::new("ng1", 1, 2, 1, Resources::new(1000, 1024));
        assert!(group.increase_size(1).is_ok());
        assert_eq!(group.target_size().unwrap(), 2);
        assert!(group.increase_size(1).is_err());
    }

    #[test]
    fn test_delete_nodes_updates_target_and_instances() {
        let group = StaticNodeGroup::new("ng1", 0, 5, 2, Resources::new(1000, 1024))
            .with_instance(Instance::running("n1", Timestamp(0)))
            .with_instance(Instance::running("n2", Timestamp(0)));
        group.delete_nodes(&["n1".to_string()]).unwrap();
        assert_eq!(group.target_size().unwrap(), 1);
        assert_eq!(group.nodes().unwrap().len(), 1);
        assert_eq!(group.deleted_nodes(), vec!["n1".to_string()]);
    }

    #[test]
    fn test_provider_resolves_group_for_node_by_label() {
        let provider = StaticCloudProvider::new();
        provider.add_group(StaticNodeGroup::new("ng1", 0, 5, 1, Resources::new(1000, 1024)));
        let node = Node::new("n1", Resources::new(500, 512)).with_label("node_group", "ng1");
        assert!(provider.node_group_for_node(&node).is_some());
        let stray = Node::new("n2", Resources::new(500, 512));
        assert!(provider.node_group_for_node(&stray).is_none());
    }
}
