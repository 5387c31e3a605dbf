//! DeletionTracker (spec 3, spec 4.G): single-writer-per-node record of an in-flight
//! node deletion. Grounded on the teacher's `cluster_controller`'s node-state map
//! idiom, generalized to the explicit state machine spec 4.G names instead of the
//! teacher's coarser "node removed" bookkeeping.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::core::common::Timestamp;
use crate::errors::ActuationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionState {
    Pending,
    Tainting,
    Draining,
    Deleting,
    Done,
}

#[derive(Debug, Clone)]
pub struct DeletionRecord {
    pub state: DeletionState,
    pub requested_at: Timestamp,
    pub completed_at: Option<Timestamp>,
    pub result: Option<Result<(), ActuationError>>,
}

/// Map node -> deletion record. A per-node `Mutex`-guarded entry gives single-writer
/// semantics (spec 3) without serializing unrelated nodes against each other.
#[derive(Default)]
pub struct DeletionTracker {
    records: Mutex<HashMap<String, DeletionRecord>>,
}

impl DeletionTracker {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Begins tracking `node`. Fails with `SafetyViolation` if the node is already
    /// under active deletion (spec 3 invariant 4: never concurrently a candidate and
    /// an active-deletion subject).
    pub fn start(&self, node: &str, now: Timestamp) -> Result<(), ActuationError> {
        let mut records = self.records.lock().unwrap();
        if let Some(existing) = records.get(node) {
            if existing.state != DeletionState::Done {
                return Err(ActuationError::SafetyViolation(node.to_string()));
            }
        }
        records.insert(
            node.to_string(),
            DeletionRecord {
                state: DeletionState::Pending,
                requested_at: now,
                completed_at: None,
                result: None,
            },
        );
        Ok(())
    }

    pub fn set_state(&self, node: &str, state: DeletionState) {
        if let Some(record) = self.records.lock().unwrap().get_mut(node) {
            record.state = state;
        }
    }

    pub fn complete(&self, node: &str, now: Timestamp, result: Result<(), ActuationError>) {
        if let Some(record) = self.records.lock().unwrap().get_mut(node) {
            record.state = DeletionState::Done;
            record.completed_at = Some(now);
            record.result = Some(result);
        }
    }

    pub fn is_active(&self, node: &str) -> bool {
        self.records
            .lock()
            .unwrap()
            .get(node)
            .map(|r| r.state != DeletionState::Done)
            .unwrap_or(false)
    }

    /// Per-node status snapshot for the planner and CSR (spec 4.G `CheckStatus`).
    pub fn check_status(&self) -> HashMap<String, DeletionRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn active_deletion_count(&self) -> usize {
        self.records
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.state != DeletionState::Done)
            .count()
    }

    pub fn active_drain_count(&self) -> usize {
        self.records
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.state == DeletionState::Draining)
            .count()
    }

    /// Drops completed records older than `t`, the grace period that otherwise
    /// suppresses double-delete races (spec 3 "retains records for a grace period").
    pub fn clear_results_not_newer_than(&self, t: Timestamp) {
        self.records
            .lock()
            .unwrap()
            .retain(|_, record| record.completed_at.map(|c| c > t).unwrap_or(true));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_rejects_node_already_under_active_deletion() {
        let tracker = DeletionTracker::new();
        tracker.start("n1", Timestamp(0)).unwrap();
        let err = tracker.start("n1", Timestamp(1)).unwrap_err();
        assert_eq!(err, ActuationError::SafetyViolation("n1".to_string()));
    }

    #[test]
    fn test_start_allowed_again_after_done() {
        let tracker = DeletionTracker::new();
        tracker.start("n1", Timestamp(0)).unwrap();
        tracker.complete("n1", Timestamp(5), Ok(()));
        assert!(tracker.start("n1", Timestamp(6)).is_ok());
    }

    #[test]
    fn test_clear_results_drops_old_completions_only() {
        let tracker = DeletionTracker::new();
        tracker.start("n1", Timestamp(0)).unwrap();
        tracker.complete("n1", Timestamp(10), Ok(()));
        tracker.start("n2", Timestamp(0)).unwrap();
        tracker.complete("n2", Timestamp(100), Ok(()));
        tracker.clear_results_not_newer_than(Timestamp(50));
        let status = tracker.check_status();
        assert!(!status.contains_key("n1"));
        assert!(status.contains_key("n2"));
    }

    #[test]
    fn test_active_deletion_and_drain_counts() {
        let tracker = DeletionTracker::new();
        tracker.start("n1", Timestamp(0)).unwrap();
        tracker.set_state("n1", DeletionState::Draining);
        tracker.start("n2", Timestamp(0)).unwrap();
        tracker.set_state("n2", DeletionState::Tainting);
        assert_eq!(tracker.active_deletion_count(), 2);
        assert_eq!(tracker.active_drain_count(), 1);
    }
}
