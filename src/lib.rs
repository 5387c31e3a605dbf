//! Static autoscaling control loop and scale-down engine for a container-orchestration
//! cluster. See `core` for the component breakdown.

pub mod config;
pub mod core;
pub mod errors;
