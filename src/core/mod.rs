//! Core control-loop components, laid out one module per component of the design:
//! data model, cloud provider contract, listers, cluster snapshot, cluster state
//! registry, template/utilization, scale-up orchestrator, scale-down planner and
//! actuator, taint utility, and the static loop tying them together.

pub mod cloud_provider;
pub mod cluster_state;
pub mod common;
pub mod listers;
pub mod node;
pub mod pod;
pub mod scale_down;
pub mod scale_up;
pub mod snapshot;
pub mod static_loop;
pub mod taints;
pub mod template;
