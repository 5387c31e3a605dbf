//! Type definition for the Pod primitive of the cluster (spec 3).

use serde::{Deserialize, Serialize};

use crate::core::common::{ObjectMeta, Resources};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub controller: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodConditionType {
    PodScheduled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodCondition {
    pub condition_type: PodConditionType,
    pub status: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub requests: Resources,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodSpec {
    #[serde(default)]
    pub resources: ResourceRequirements,
    /// Name of the scheduler this pod was submitted under. Empty means the cluster's
    /// default scheduler.
    #[serde(default)]
    pub scheduler_name: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub owner_references: Vec<OwnerReference>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodStatus {
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default)]
    pub conditions: Vec<PodCondition>,
    #[serde(default)]
    pub nominated_node_name: Option<String>,
}

impl PodStatus {
    /// Mirrors the `PodScheduled=False` condition the teacher's
    /// `kube_cluster_autoscaler` docstring calls out as how unschedulable pods are
    /// recognized.
    pub fn is_unschedulable(&self) -> bool {
        self.node_name.is_none()
            && self
                .conditions
                .iter()
                .any(|c| c.condition_type == PodConditionType::PodScheduled && !c.status)
    }
}

pub const POD_SCALE_UP_DELAY_ANNOTATION: &str = "cluster-autoscaler.kubernetes.io/pod-scale-up-delay";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    pub metadata: ObjectMeta,
    pub spec: PodSpec,
    #[serde(default)]
    pub status: PodStatus,
}

impl Pod {
    pub fn new(name: impl Into<String>, requests: Resources) -> Self {
        Self {
            metadata: ObjectMeta::named(name),
            spec: PodSpec {
                resources: ResourceRequirements { requests },
                scheduler_name: String::new(),
                priority: 0,
                owner_references: Vec::new(),
            },
            status: PodStatus::default(),
        }
    }

    pub fn unschedulable(mut self) -> Self {
        self.status.conditions = vec![PodCondition {
            condition_type: PodConditionType::PodScheduled,
            status: false,
        }];
        self.status.node_name = None;
        self
    }

    pub fn assigned_to(mut self, node_name: impl Into<String>) -> Self {
        self.status.node_name = Some(node_name.into());
        self.status.conditions = vec![PodCondition {
            condition_type: PodConditionType::PodScheduled,
            status: true,
        }];
        self
    }

    pub fn owned_by(mut self, kind: impl Into<String>, name: impl Into<String>) -> Self {
        self.spec.owner_references.push(OwnerReference {
            kind: kind.into(),
            name: name.into(),
            controller: true,
        });
        self
    }

    pub fn is_daemonset_pod(&self) -> bool {
        self.spec
            .owner_references
            .iter()
            .any(|o| o.kind == "DaemonSet")
    }

    /// Mirror pods (e.g. static pods surfaced by the kubelet) are owned by the Node
    /// itself and, like DaemonSet pods, are never evicted by the scale-down actuator.
    pub fn is_mirror_pod(&self) -> bool {
        self.spec.owner_references.iter().any(|o| o.kind == "Node")
    }

    /// Parses the per-pod scale-up delay override. Returns `None` and never errors:
    /// an unparsable value is treated by the caller as "fall back to the global
    /// delay", per spec 4.E and the resolved Open Question in spec 9.
    pub fn scale_up_delay_override(&self) -> Option<Result<u64, String>> {
        self.metadata
            .annotations
            .get(POD_SCALE_UP_DELAY_ANNOTATION)
            .map(|raw| parse_duration_seconds(raw).ok_or_else(|| raw.clone()))
    }
}

/// Parses a small subset of Go-style duration strings (`"5m"`, `"30s"`, `"1h"`, plain
/// seconds) sufficient for the scale-up delay annotation. Returns `None` on anything
/// else, including the literal `"error"` used in spec 8's young-pod-filter scenario.
fn parse_duration_seconds(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if let Some(digits) = raw.strip_suffix('h') {
        return digits.parse::<u64>().ok().map(|v| v * 3600);
    }
    if let Some(digits) = raw.strip_suffix('m') {
        return digits.parse::<u64>().ok().map(|v| v * 60);
    }
    if let Some(digits) = raw.strip_suffix('s') {
        return digits.parse::<u64>().ok();
    }
    raw.parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unschedulable_detection_requires_unassigned_and_scheduled_false() {
        let pod = Pod::new("p1", Resources::new(100, 100)).unschedulable();
        assert!(pod.status.is_unschedulable());
    }

    #[test]
    fn test_assigned_pod_is_not_unschedulable() {
        let pod = Pod::new("p1", Resources::new(100, 100)).assigned_to("n1");
        assert!(!pod.status.is_unschedulable());
    }

    #[test]
    fn test_daemonset_pod_detection() {
        let pod = Pod::new("p1", Resources::new(100, 100)).owned_by("DaemonSet", "ds1");
        assert!(pod.is_daemonset_pod());
        assert!(!pod.is_mirror_pod());
    }

    #[test]
    fn test_parse_duration_variants() {
        assert_eq!(parse_duration_seconds("5m"), Some(300));
        assert_eq!(parse_duration_seconds("30s"), Some(30));
        assert_eq!(parse_duration_seconds("1h"), Some(3600));
        assert_eq!(parse_duration_seconds("42"), Some(42));
        assert_eq!(parse_duration_seconds("error"), None);
    }

    #[test]
    fn test_scale_up_delay_override_reports_parse_failure_without_erroring() {
        let mut pod = Pod::new("p1", Resources::new(100, 100));
        pod.metadata
            .annotations
            .insert(POD_SCALE_UP_DELAY_ANNOTATION.to_string(), "error".to_string());
        assert_eq!(pod.scale_up_delay_override(), Some(Err("error".to_string())));

        pod.metadata
            .annotations
            .insert(POD_SCALE_UP_DELAY_ANNOTATION.to_string(), "5m".to_string());
        assert_eq!(pod.scale_up_delay_override(), Some(Ok(300)));
    }
}
