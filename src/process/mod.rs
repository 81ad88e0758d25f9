//! Workload creation and lifecycle.
//!
//! [`factory::WorkloadProcessFactory`] assembles a launch (name, ports,
//! labels, environment, placement) and hands it to
//! [`workload::WorkloadProcess`], which owns the running workload: stdio
//! tunnels, heartbeat supervision, terminal-state arbitration and cleanup.

pub mod factory;
pub mod heartbeat;
pub mod workload;

pub use factory::{LaunchRequest, WorkloadProcessFactory};
pub use workload::{FailureReason, ProcessState, WorkloadProcess};
