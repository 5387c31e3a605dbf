//! Type definition for the Node primitive of the cluster (spec 3).

use serde::{Deserialize, Serialize};

use crate::core::common::{ObjectMeta, Resources, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    pub value: String,
    pub effect: TaintEffect,
}

impl Taint {
    pub fn new(key: impl Into<String>, value: impl Into<String>, effect: TaintEffect) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            effect,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    #[serde(default)]
    pub provider_id: String,
    #[serde(default)]
    pub taints: Vec<Taint>,
    #[serde(default)]
    pub unschedulable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeConditionType {
    Ready,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCondition {
    pub condition_type: NodeConditionType,
    pub status: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub capacity: Resources,
    #[serde(default)]
    pub allocatable: Resources,
    #[serde(default)]
    pub conditions: Vec<NodeCondition>,
}

impl NodeStatus {
    /// True iff the node carries a `Ready=true` condition. A node with no condition at
    /// all is treated as not-ready, matching kubelet behavior before the first
    /// heartbeat is observed.
    pub fn is_ready(&self) -> bool {
        self.conditions
            .iter()
            .any(|c| c.condition_type == NodeConditionType::Ready && c.status)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub metadata: ObjectMeta,
    #[serde(default = "default_node_spec")]
    pub spec: NodeSpec,
    pub status: NodeStatus,
}

fn default_node_spec() -> NodeSpec {
    NodeSpec {
        provider_id: String::new(),
        taints: Vec::new(),
        unschedulable: false,
    }
}

impl Node {
    pub fn new(name: impl Into<String>, capacity: Resources) -> Self {
        let mut status = NodeStatus {
            capacity,
            allocatable: capacity,
            conditions: vec![NodeCondition {
                condition_type: NodeConditionType::Ready,
                status: true,
            }],
        };
        status.allocatable = capacity;
        Self {
            metadata: ObjectMeta::named(name),
            spec: default_node_spec(),
            status,
        }
    }

    pub fn with_creation_timestamp(mut self, ts: Timestamp) -> Self {
        self.metadata.creation_timestamp = ts;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.labels.insert(key.into(), value.into());
        self
    }

    pub fn mark_not_ready(mut self) -> Self {
        self.status.conditions = vec![NodeCondition {
            condition_type: NodeConditionType::Ready,
            status: false,
        }];
        self
    }

    pub fn has_taint(&self, key: &str) -> bool {
        self.spec.taints.iter().any(|t| t.key == key)
    }

    pub fn node_group_label(&self) -> Option<&str> {
        self.metadata.labels.get("node_group").map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_node_is_ready_by_default() {
        let node = Node::new("n1", Resources::new(1000, 1024));
        assert!(node.status.is_ready());
        assert_eq!(node.status.allocatable, node.status.capacity);
    }

    #[test]
    fn test_mark_not_ready_flips_condition() {
        let node = Node::new("n1", Resources::new(1000, 1024)).mark_not_ready();
        assert!(!node.status.is_ready());
    }

    #[test]
    fn test_has_taint_checks_key_only() {
        let mut node = Node::new("n1", Resources::new(1000, 1024));
        node.spec.taints.push(Taint::new("k", "v", TaintEffect::NoSchedule));
        assert!(node.has_taint("k"));
        assert!(!node.has_taint("other"));
    }
}
