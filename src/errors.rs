//! Error taxonomy (spec 7). The teacher has no fallible boundary worth a dedicated
//! error type — it panics and unwraps freely inside a discrete-event simulation where
//! every input is constructed by the same process. A control loop driving a real cloud
//! provider cannot afford that, so every module boundary here returns a concrete,
//! named `thiserror` type instead of `anyhow`, matching the taxonomy spec 7 lays out:
//! transient, policy, out-of-resources, fatal, and safety.

use thiserror::Error;

use crate::core::common::NodeGroupId;

/// Errors surfaced by a `CloudProvider` / `NodeGroup` implementation. Transient by
/// convention unless the call itself reports otherwise; the static loop retries or
/// backs off rather than treating these as fatal.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("node group not found: {0}")]
    NodeGroupNotFound(NodeGroupId),
    #[error("provider call failed for group {group}: {message}")]
    Backend { group: NodeGroupId, message: String },
    #[error("node group {0} does not support this operation")]
    Unsupported(NodeGroupId),
}

/// Errors from the cluster state registry's bookkeeping (component C).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClusterStateError {
    #[error("provider cache refresh failed, serving last-good snapshot: {0}")]
    StaleProviderCache(String),
    #[error("unknown node group: {0}")]
    UnknownNodeGroup(NodeGroupId),
}

/// Errors from taint application/removal (component T). These are always retried
/// locally up to `maxRetryDeadline` before being surfaced, so reaching this type means
/// the retry budget was exhausted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaintError {
    #[error("timed out applying taint {taint_key} to node {node}")]
    RetryDeadlineExceeded { node: String, taint_key: String },
}

/// Errors from the scale-down actuator's per-node state machine (component G).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ActuationError {
    #[error("tainting node {0} failed: {1}")]
    Tainting(String, TaintError),
    #[error("draining node {0} timed out waiting for pod eviction to take effect")]
    DrainTimedOut(String),
    #[error("provider delete_nodes failed for group {group}: {message}")]
    DeleteFailed { group: NodeGroupId, message: String },
    #[error("node {0} is both a scale-down candidate and already under active deletion")]
    SafetyViolation(String),
}

/// Aggregate error a single tick of the static loop can report. A tick always finishes
/// its cleanup phase before returning this, per spec 7's propagation policy: this type
/// is informational, not a signal to stop the loop.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TickError {
    #[error("{0} provider call(s) failed during this tick")]
    ProviderCalls(usize),
    #[error("{0} node deletion(s) failed during this tick")]
    Deletions(usize),
    #[error("listers were unavailable at startup: {0}")]
    Fatal(String),
}
