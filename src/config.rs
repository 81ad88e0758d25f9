use std::collections::BTreeMap;
use std::time::Duration;

use crate::cluster::Toleration;

/// Trust level of a connector image.
///
/// Custom (community-built, uncertified) images are subject to stricter
/// placement isolation than certified ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorTrust {
    /// Image certified by the platform. Runs on the standard node pool.
    Certified,
    /// Uncertified custom image. Runs on the isolated node pool when one
    /// is configured.
    Custom,
}

/// Image pull policy for workload containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullPolicy {
    Always,
    IfNotPresent,
    Never,
}

impl PullPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PullPolicy::Always => "Always",
            PullPolicy::IfNotPresent => "IfNotPresent",
            PullPolicy::Never => "Never",
        }
    }
}

/// Heartbeat probing configuration.
///
/// The workload is declared failed once the heartbeat endpoint has been
/// unreachable for longer than `grace_period` while the workload is running.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// How often the endpoint is probed.
    pub interval: Duration,
    /// How long the endpoint may stay unreachable before the workload is
    /// declared failed.
    pub grace_period: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            grace_period: Duration::from_secs(60),
        }
    }
}

/// Shared configuration for all workloads launched by one factory.
///
/// Assumed already validated; this crate performs no config file loading.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Namespace that spawned workloads live in.
    pub namespace: String,
    /// Node selectors for the standard node pool.
    pub node_selectors: BTreeMap<String, String>,
    /// Node selectors for the isolated node pool, if one is provisioned.
    /// Custom connectors are scheduled here when set.
    pub isolated_node_selectors: Option<BTreeMap<String, String>>,
    /// Tolerations applied to every workload.
    pub tolerations: Vec<Toleration>,
    /// Annotations applied to every workload.
    pub annotations: BTreeMap<String, String>,
    /// Image pull secrets for the main connector image.
    pub image_pull_secrets: Vec<String>,
    /// Pull policy for the main connector image.
    pub job_image_pull_policy: PullPolicy,
    /// Pull policy for the sidecar utility images.
    pub sidecar_image_pull_policy: PullPolicy,
    /// Image providing socat, used by the stdio relay sidecars.
    pub socat_image: String,
    /// Image providing a shell, used by the init container.
    pub busybox_image: String,
    /// Image providing curl, used by the heartbeat sidecar.
    pub curl_image: String,
    /// Environment passed to every main container, overridable per launch.
    pub env: BTreeMap<String, String>,
    /// Heartbeat probing settings.
    pub heartbeat: HeartbeatConfig,
    /// How long to wait for the cluster to report the workload ready.
    pub startup_timeout: Duration,
    /// How long to wait for the relay sidecars to dial back after readiness.
    pub tunnel_accept_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            node_selectors: BTreeMap::new(),
            isolated_node_selectors: None,
            tolerations: Vec::new(),
            annotations: BTreeMap::new(),
            image_pull_secrets: Vec::new(),
            job_image_pull_policy: PullPolicy::IfNotPresent,
            sidecar_image_pull_policy: PullPolicy::IfNotPresent,
            socat_image: "alpine/socat:1.7.4.4".to_string(),
            busybox_image: "busybox:1.35".to_string(),
            curl_image: "curlimages/curl:8.8.0".to_string(),
            env: BTreeMap::new(),
            heartbeat: HeartbeatConfig::default(),
            startup_timeout: Duration::from_secs(300),
            tunnel_accept_timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_config_default() {
        let cfg = WorkerConfig::default();
        assert_eq!(cfg.namespace, "default");
        assert!(cfg.node_selectors.is_empty());
        assert!(cfg.isolated_node_selectors.is_none());
        assert_eq!(cfg.job_image_pull_policy, PullPolicy::IfNotPresent);
        assert_eq!(cfg.startup_timeout, Duration::from_secs(300));
    }

    #[test]
    fn heartbeat_config_default() {
        let cfg = HeartbeatConfig::default();
        assert_eq!(cfg.interval, Duration::from_secs(10));
        assert_eq!(cfg.grace_period, Duration::from_secs(60));
    }

    #[test]
    fn pull_policy_as_str() {
        assert_eq!(PullPolicy::Always.as_str(), "Always");
        assert_eq!(PullPolicy::IfNotPresent.as_str(), "IfNotPresent");
        assert_eq!(PullPolicy::Never.as_str(), "Never");
    }
}
