//! Control-plane boundary.
//!
//! The rest of the crate speaks a small, cluster-agnostic workload model and
//! the [`ClusterApi`] trait. Production uses the [`kube`](self::kube)
//! implementation; tests inject a fake.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::PullPolicy;

pub mod kube;

/// Port the stdin relay sidecar listens on inside the workload network.
/// Part of the workload topology contract: spec builders configure the
/// sidecar with it and cluster implementations report it back in
/// [`WorkloadEndpoint`].
pub const STDIN_TUNNEL_PORT: u16 = 9001;

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Cluster API error: {0}")]
    Api(String),

    #[error("Workload not found: {0}")]
    NotFound(String),

    #[error("Timed out after {0:?} waiting for workload {1}")]
    Timeout(Duration, String),
}

/// Scheduling toleration, passed through to the control plane unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toleration {
    pub key: String,
    pub operator: String,
    pub value: Option<String>,
    pub effect: Option<String>,
}

/// Per-container resource requests and limits, pre-validated by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    pub cpu_request: Option<String>,
    pub cpu_limit: Option<String>,
    pub memory_request: Option<String>,
    pub memory_limit: Option<String>,
}

/// A volume shared between containers of one workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    pub name: String,
    pub mount_path: String,
}

/// One container of a workload.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub pull_policy: PullPolicy,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub resources: Option<ResourceLimits>,
    /// Container ports to expose.
    pub ports: Vec<u16>,
    /// Names of [`WorkloadSpec::volumes`] entries mounted into this
    /// container, at each volume's mount path.
    pub volume_mounts: Vec<String>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>, pull_policy: PullPolicy) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            pull_policy,
            command: Vec::new(),
            args: Vec::new(),
            env: BTreeMap::new(),
            resources: None,
            ports: Vec::new(),
            volume_mounts: Vec::new(),
        }
    }
}

/// A complete multi-container workload request.
#[derive(Debug, Clone)]
pub struct WorkloadSpec {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub node_selectors: BTreeMap<String, String>,
    pub tolerations: Vec<Toleration>,
    pub image_pull_secrets: Vec<String>,
    pub init_containers: Vec<ContainerSpec>,
    pub containers: Vec<ContainerSpec>,
    pub volumes: Vec<VolumeSpec>,
}

/// Where a ready workload can be reached for the stdin tunnel.
#[derive(Debug, Clone)]
pub struct WorkloadEndpoint {
    pub ip: IpAddr,
    /// Port the remote stdin listener accepts on.
    pub stdin_port: u16,
}

/// Operations this crate needs from the cluster control plane.
///
/// Assumed reliable and eventually consistent. Injected as
/// `Arc<dyn ClusterApi>` so the lifecycle code can be exercised against a
/// fake cluster in tests.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Submit a workload. Fails if an object with the same name exists.
    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<(), ClusterError>;

    /// Wait until all containers of the workload are ready, up to `timeout`.
    async fn await_ready(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<WorkloadEndpoint, ClusterError>;

    /// Wait for the main (first) container to terminate and return its exit
    /// code.
    async fn wait_terminated(&self, namespace: &str, name: &str) -> Result<i32, ClusterError>;

    /// Delete the workload object. Deleting an already-gone workload is
    /// success.
    async fn delete_workload(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;
}
