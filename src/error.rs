use thiserror::Error;

use crate::cluster::ClusterError;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Port pool exhausted, no local ports left for stdio tunnels")]
    PortsExhausted,

    #[error("Port {0} is not currently taken (double release or foreign port)")]
    PortNotTaken(u16),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Heartbeat lost for workload {name} (job {job_id}, attempt {attempt})")]
    HeartbeatLost {
        name: String,
        job_id: String,
        attempt: u32,
    },

    #[error("Workload {name} exited with unexpected status {code}")]
    UnexpectedExit { name: String, code: i32 },

    #[error("Startup of workload {name} failed: {reason}")]
    Startup { name: String, reason: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
