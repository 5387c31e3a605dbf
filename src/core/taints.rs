//! Taint utility (spec 4.T), grounded directly on the upstream
//! `utils/taints/taints.go` kept under `examples/original_source`: the wire-compatible
//! taint keys, the retry/backoff constants for optimistic-concurrency conflicts, and
//! the three-category sanitization `SanitizeTaints` performs before a live node is
//! turned into a node-group template.

use std::collections::HashSet;
use std::time::Duration;

use lazy_static::lazy_static;

use crate::core::node::{Node, Taint, TaintEffect};

pub const TO_BE_DELETED_TAINT: &str = "ToBeDeletedByClusterAutoscaler";
pub const DELETION_CANDIDATE_TAINT: &str = "DeletionCandidateOfClusterAutoscaler";

pub const IGNORE_TAINT_PREFIX: &str = "ignore-taint.cluster-autoscaler.kubernetes.io/";
pub const STARTUP_TAINT_PREFIX: &str = "startup-taint.cluster-autoscaler.kubernetes.io/";
pub const STATUS_TAINT_PREFIX: &str = "status-taint.cluster-autoscaler.kubernetes.io/";

/// Default deadline for taint-update retries under optimistic-concurrency conflicts
/// (spec 4.T). Overridable per `AutoscalingOptions` for tests, matching the "mutable
/// only in unit tests" comment on the Go source's package-level vars.
pub const DEFAULT_MAX_RETRY_DEADLINE: Duration = Duration::from_secs(5);
pub const DEFAULT_CONFLICT_RETRY_INTERVAL: Duration = Duration::from_millis(750);

lazy_static! {
    /// Taint keys that represent a transient node condition rather than an
    /// operator-applied policy; these are always stripped before templating and are
    /// never individually reported.
    static ref NODE_CONDITION_TAINTS: HashSet<&'static str> = HashSet::from([
        "node.kubernetes.io/not-ready",
        "node.kubernetes.io/unreachable",
        "node.kubernetes.io/unschedulable",
        "node.kubernetes.io/memory-pressure",
        "node.kubernetes.io/disk-pressure",
        "node.kubernetes.io/network-unavailable",
        "node.kubernetes.io/pid-pressure",
        "node.cloudprovider.kubernetes.io/uninitialized",
        "node.cloudprovider.kubernetes.io/shutdown",
        "cloud.google.com/impending-node-termination",
        "NodeWithImpairedVolumes",
    ]);
}

/// Taints configured for a node group beyond the fixed set above: operator-declared
/// startup and status taint keys, in addition to the three prefixes.
#[derive(Debug, Default, Clone)]
pub struct TaintConfig {
    pub startup_taints: HashSet<String>,
    pub status_taints: HashSet<String>,
}

impl TaintConfig {
    pub fn is_startup_taint(&self, key: &str) -> bool {
        self.startup_taints.contains(key)
            || key.starts_with(IGNORE_TAINT_PREFIX)
            || key.starts_with(STARTUP_TAINT_PREFIX)
    }

    pub fn is_status_taint(&self, key: &str) -> bool {
        self.status_taints.contains(key) || key.starts_with(STATUS_TAINT_PREFIX)
    }
}

pub fn mark_to_be_deleted(taints: &mut Vec<Taint>, unix_time: u64, cordon: &mut bool) -> bool {
    add_taint(
        taints,
        Taint::new(TO_BE_DELETED_TAINT, unix_time.to_string(), TaintEffect::NoSchedule),
        cordon,
    )
}

pub fn mark_deletion_candidate(taints: &mut Vec<Taint>, unix_time: u64) -> bool {
    let mut no_cordon = false;
    add_taint(
        taints,
        Taint::new(
            DELETION_CANDIDATE_TAINT,
            unix_time.to_string(),
            TaintEffect::PreferNoSchedule,
        ),
        &mut no_cordon,
    )
}

/// Removes the soft `DeletionCandidateOfClusterAutoscaler` taint, mirroring
/// `CleanDeletionCandidate` in the Go source: called when a node leaves the Unneeded
/// table before the hard taint/delete path ever starts.
pub fn clean_deletion_candidate(taints: &mut Vec<Taint>) -> bool {
    clean_taint(taints, DELETION_CANDIDATE_TAINT)
}

/// Adds `taint` to `taints` unless a taint with the same key is already present, in
/// which case this is a no-op success (spec 4.T). Returns whether a taint was actually
/// added, mirroring `addTaintToSpec`'s return value in the Go source, which callers use
/// to decide whether an update call to the API server is even needed.
pub fn add_taint(taints: &mut Vec<Taint>, taint: Taint, cordon: &mut bool) -> bool {
    if taints.iter().any(|t| t.key == taint.key) {
        return false;
    }
    if *cordon {
        // cordon already requested by an earlier taint in this same call
    }
    *cordon = *cordon || matches!(taint.effect, TaintEffect::NoSchedule);
    taints.push(taint);
    true
}

pub fn has_taint(taints: &[Taint], key: &str) -> bool {
    taints.iter().any(|t| t.key == key)
}

pub fn has_to_be_deleted_taint(node: &Node) -> bool {
    has_taint(&node.spec.taints, TO_BE_DELETED_TAINT)
}

pub fn get_taint_time(taints: &[Taint], key: &str) -> Option<u64> {
    taints
        .iter()
        .find(|t| t.key == key)
        .and_then(|t| t.value.parse::<u64>().ok())
}

/// Removes the named taint from `taints`. Returns whether anything was removed, the
/// same shape `CleanTaint` in the Go source returns so the caller only issues an update
/// when there was something to clean.
pub fn clean_taint(taints: &mut Vec<Taint>, key: &str) -> bool {
    let before = taints.len();
    taints.retain(|t| t.key != key);
    taints.len() != before
}

/// Strips autoscaler-owned taints, node-condition taints, and the three configured
/// prefixes before a live node is sanitized into a node-group template (spec 4.T,
/// grounded on `SanitizeTaints` in the Go source).
pub fn sanitize_taints(taints: &[Taint], config: &TaintConfig) -> Vec<Taint> {
    taints
        .iter()
        .filter(|t| t.key != TO_BE_DELETED_TAINT && t.key != DELETION_CANDIDATE_TAINT)
        .filter(|t| !NODE_CONDITION_TAINTS.contains(t.key.as_str()))
        .filter(|t| !config.is_startup_taint(&t.key) && !config.is_status_taint(&t.key))
        .cloned()
        .collect()
}

/// Forces nodes bearing a startup taint into the unready classification for this tick,
/// even if the kubelet reports them ready (spec 4.T, `FilterOutNodesWithStartupTaints`).
pub fn has_startup_taint(node: &Node, config: &TaintConfig) -> bool {
    node.spec
        .taints
        .iter()
        .any(|t| config.is_startup_taint(&t.key))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaintReportCategory {
    ToBeDeleted,
    DeletionCandidate,
    StartupTaint,
    StatusTaint,
    Other,
}

/// Buckets a taint key for observability logging, grounded on `CountNodeTaints` /
/// `getTaintTypeToReport` in the Go source. Kept even though this crate implements no
/// metrics backend (spec 1 scopes "metric emission" out) because the bucketing is also
/// how the static loop decides log verbosity for taint churn.
pub fn categorize_taint(key: &str, config: &TaintConfig) -> TaintReportCategory {
    if key == TO_BE_DELETED_TAINT {
        return TaintReportCategory::ToBeDeleted;
    }
    if key == DELETION_CANDIDATE_TAINT {
        return TaintReportCategory::DeletionCandidate;
    }
    if config.is_startup_taint(key) {
        return TaintReportCategory::StartupTaint;
    }
    if config.is_status_taint(key) {
        return TaintReportCategory::StatusTaint;
    }
    TaintReportCategory::Other
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_taint_is_noop_if_key_present() {
        let mut taints = vec![Taint::new("k", "1", TaintEffect::NoSchedule)];
        let mut cordon = false;
        let added = add_taint(&mut taints, Taint::new("k", "2", TaintEffect::NoSchedule), &mut cordon);
        assert!(!added);
        assert_eq!(taints.len(), 1);
        assert_eq!(taints[0].value, "1");
    }

    #[test]
    fn test_add_taint_sets_cordon_for_no_schedule() {
        let mut taints = vec![];
        let mut cordon = false;
        add_taint(&mut taints, Taint::new(TO_BE_DELETED_TAINT, "10", TaintEffect::NoSchedule), &mut cordon);
        assert!(cordon);
    }

    #[test]
    fn test_clean_deletion_candidate_removes_soft_taint_only() {
        let mut taints = vec![
            Taint::new(DELETION_CANDIDATE_TAINT, "1", TaintEffect::PreferNoSchedule),
            Taint::new(TO_BE_DELETED_TAINT, "1", TaintEffect::NoSchedule),
        ];
        assert!(clean_deletion_candidate(&mut taints));
        assert_eq!(taints.len(), 1);
        assert_eq!(taints[0].key, TO_BE_DELETED_TAINT);
        assert!(!clean_deletion_candidate(&mut taints));
    }

    #[test]
    fn test_clean_taint_removes_matching_key_only() {
        let mut taints = vec![
            Taint::new("a", "1", TaintEffect::NoSchedule),
            Taint::new("b", "2", TaintEffect::NoSchedule),
        ];
        assert!(clean_taint(&mut taints, "a"));
        assert_eq!(taints.len(), 1);
        assert_eq!(taints[0].key, "b");
        assert!(!clean_taint(&mut taints, "a"));
    }

    #[test]
    fn test_sanitize_taints_strips_all_three_categories() {
        let config = TaintConfig {
            startup_taints: HashSet::from(["custom-startup".to_string()]),
            status_taints: HashSet::new(),
        };
        let taints = vec![
            Taint::new(TO_BE_DELETED_TAINT, "1", TaintEffect::NoSchedule),
            Taint::new(DELETION_CANDIDATE_TAINT, "1", TaintEffect::PreferNoSchedule),
            Taint::new("node.kubernetes.io/not-ready", "", TaintEffect::NoExecute),
            Taint::new("custom-startup", "", TaintEffect::NoSchedule),
            Taint::new("ignore-taint.cluster-autoscaler.kubernetes.io/gpu", "", TaintEffect::NoSchedule),
            Taint::new("keep-me", "", TaintEffect::NoSchedule),
        ];
        let sanitized = sanitize_taints(&taints, &config);
        assert_eq!(sanitized.len(), 1);
        assert_eq!(sanitized[0].key, "keep-me");
    }

    #[test]
    fn test_categorize_taint() {
        let config = TaintConfig::default();
        assert_eq!(categorize_taint(TO_BE_DELETED_TAINT, &config), TaintReportCategory::ToBeDeleted);
        assert_eq!(
            categorize_taint("status-taint.cluster-autoscaler.kubernetes.io/x", &config),
            TaintReportCategory::StatusTaint
        );
        assert_eq!(categorize_taint("whatever", &config), TaintReportCategory::Other);
    }
}
