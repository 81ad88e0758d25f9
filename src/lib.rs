//! Remote sandboxed process execution substrate.
//!
//! Launches a connector image as an isolated multi-container workload in a
//! cluster, tunnels its stdio back to the calling host, and exposes the
//! running workload through a uniform process-control interface.

pub mod cluster;
pub mod config;
pub mod error;
pub mod naming;
pub mod placement;
pub mod ports;
pub mod process;

pub use error::{Result, WorkerError};
