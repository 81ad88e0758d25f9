use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cluster::{ClusterApi, ResourceLimits};
use crate::config::{ConnectorTrust, WorkerConfig};
use crate::error::{Result, WorkerError};
use crate::naming::{workload_name, KUBE_NAME_LEN_LIMIT};
use crate::placement;
use crate::ports::PortPool;
use crate::process::workload::{WorkloadLaunch, WorkloadProcess};

/// Label carrying the job id. Always present, overriding caller labels.
pub const JOB_LABEL_KEY: &str = "job-id";
/// Label carrying the attempt number. Always present.
pub const ATTEMPT_LABEL_KEY: &str = "attempt-id";
/// Fixed marker identifying workloads spawned by this substrate, so
/// external tooling can find and sweep them.
pub const WORKER_MARKER_KEY: &str = "podbridge";
pub const WORKER_MARKER_VALUE: &str = "worker";

/// One connector invocation, as requested by the calling pipeline. All
/// values are assumed pre-validated.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    /// Differentiates e.g. the source from the destination of one sync.
    pub job_type: String,
    pub job_id: String,
    pub attempt: u32,
    pub image: String,
    pub trust: ConnectorTrust,
    /// Whether the caller will write to the workload's stdin. When false,
    /// no stdin tunnel is set up and the remote process reads EOF.
    pub uses_stdin: bool,
    /// Files staged into the workload's config directory before start.
    pub files: BTreeMap<String, String>,
    pub entrypoint: String,
    pub args: Vec<String>,
    pub resources: Option<ResourceLimits>,
    /// Hosts the connector is expected to reach. Enforcement happens
    /// elsewhere; recorded here for correlation.
    pub allowed_hosts: Vec<String>,
    pub custom_labels: BTreeMap<String, String>,
    /// Job-scoped metadata, lowest-precedence environment source.
    pub job_metadata: BTreeMap<String, String>,
    /// Main-container ports to expose, keyed by internal port. The mapping
    /// values are consumed by the calling pipeline.
    pub internal_to_external_ports: BTreeMap<u16, u16>,
    /// Highest-precedence environment source.
    pub additional_env: BTreeMap<String, String>,
}

/// Launches connector workloads.
///
/// Holds the shared collaborators every launch needs: the cluster handle,
/// worker configuration, the injected port pool, the heartbeat URL spawned
/// workloads probe, and the host address relay sidecars dial back to.
pub struct WorkloadProcessFactory {
    cluster: Arc<dyn ClusterApi>,
    config: WorkerConfig,
    ports: Arc<PortPool>,
    heartbeat_url: String,
    process_runner_host: String,
}

impl WorkloadProcessFactory {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        config: WorkerConfig,
        ports: Arc<PortPool>,
        heartbeat_url: String,
        process_runner_host: String,
    ) -> Self {
        Self {
            cluster,
            config,
            ports,
            heartbeat_url,
            process_runner_host,
        }
    }

    /// Create and start a workload for one connector invocation.
    ///
    /// Ports are taken before the spec is assembled because they are
    /// embedded into the relay sidecar configuration. On any failure the
    /// taken ports are released before the error propagates and no cluster
    /// object is left behind.
    pub async fn create(&self, request: LaunchRequest) -> Result<WorkloadProcess> {
        if request.entrypoint.trim().is_empty() {
            return Err(WorkerError::Configuration(format!(
                "no entrypoint for image {} (job {}, attempt {})",
                request.image, request.job_id, request.attempt
            )));
        }

        let name = workload_name(
            &request.image,
            &request.job_type,
            &request.job_id,
            request.attempt,
            KUBE_NAME_LEN_LIMIT,
        );
        tracing::info!(
            name = %name,
            image = %request.image,
            job_id = %request.job_id,
            attempt = request.attempt,
            allowed_hosts = ?request.allowed_hosts,
            "Launching workload"
        );

        let stdout_port = self.ports.take()?;
        let stderr_port = match self.ports.take() {
            Ok(port) => port,
            Err(e) => {
                // Give back the first port before surfacing the failure.
                if let Err(release_err) = self.ports.release(stdout_port) {
                    tracing::error!(port = stdout_port, error = %release_err, "Port release failed");
                }
                return Err(e);
            }
        };
        tracing::debug!(name = %name, stdout_port, stderr_port, "Tunnel ports allocated");

        let launch = WorkloadLaunch {
            labels: build_labels(&request.job_id, request.attempt, &request.custom_labels),
            env: merge_env(&request.job_metadata, &self.config.env, &request.additional_env),
            node_selectors: placement::node_selectors(request.trust, &self.config),
            exposed_ports: request.internal_to_external_ports.keys().copied().collect(),
            name,
            job_id: request.job_id,
            attempt: request.attempt,
            image: request.image,
            stdout_port,
            stderr_port,
            heartbeat_url: self.heartbeat_url.clone(),
            process_runner_host: self.process_runner_host.clone(),
            uses_stdin: request.uses_stdin,
            files: request.files,
            entrypoint: request.entrypoint,
            args: request.args,
            resources: request.resources,
            config: self.config.clone(),
        };

        // From here on the launch owns the ports; start() releases them on
        // its own failure paths.
        WorkloadProcess::start(self.cluster.clone(), self.ports.clone(), launch).await
    }
}

/// General labels applied to every workload: caller-supplied labels overlaid
/// with the reserved keys, which always win on collision.
pub fn build_labels(
    job_id: &str,
    attempt: u32,
    custom_labels: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut labels = custom_labels.clone();
    labels.insert(JOB_LABEL_KEY.to_string(), job_id.to_string());
    labels.insert(ATTEMPT_LABEL_KEY.to_string(), attempt.to_string());
    labels.insert(WORKER_MARKER_KEY.to_string(), WORKER_MARKER_VALUE.to_string());
    labels
}

/// Merge the three environment sources; rightmost wins on collision.
pub fn merge_env(
    job_metadata: &BTreeMap<String, String>,
    worker_env: &BTreeMap<String, String>,
    additional_env: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut env = job_metadata.clone();
    env.extend(worker_env.iter().map(|(k, v)| (k.clone(), v.clone())));
    env.extend(additional_env.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn reserved_labels_always_present() {
        let labels = build_labels("42", 3, &map(&[("team", "ingest")]));
        assert_eq!(labels.get(JOB_LABEL_KEY).map(String::as_str), Some("42"));
        assert_eq!(labels.get(ATTEMPT_LABEL_KEY).map(String::as_str), Some("3"));
        assert_eq!(
            labels.get(WORKER_MARKER_KEY).map(String::as_str),
            Some(WORKER_MARKER_VALUE)
        );
        assert_eq!(labels.get("team").map(String::as_str), Some("ingest"));
    }

    #[test]
    fn reserved_labels_override_collisions() {
        let labels = build_labels(
            "42",
            3,
            &map(&[(JOB_LABEL_KEY, "spoofed"), (WORKER_MARKER_KEY, "spoofed")]),
        );
        assert_eq!(labels.get(JOB_LABEL_KEY).map(String::as_str), Some("42"));
        assert_eq!(
            labels.get(WORKER_MARKER_KEY).map(String::as_str),
            Some(WORKER_MARKER_VALUE)
        );
    }

    #[test]
    fn env_merge_precedence() {
        let merged = merge_env(
            &map(&[("A", "1")]),
            &map(&[("A", "2"), ("B", "2")]),
            &map(&[("B", "3")]),
        );
        assert_eq!(merged, map(&[("A", "2"), ("B", "3")]));
    }

    #[test]
    fn env_merge_keeps_disjoint_keys() {
        let merged = merge_env(
            &map(&[("JOB", "42")]),
            &map(&[("SHARED", "x")]),
            &map(&[("EXTRA", "y")]),
        );
        assert_eq!(merged.len(), 3);
    }
}
