//! Kubernetes-backed [`ClusterApi`] implementation over `kube` and
//! `k8s-openapi`. Workloads map to pods with `restartPolicy: Never`;
//! readiness and termination are observed by polling pod status.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, EnvVar, LocalObjectReference, Pod, PodSpec,
    Toleration as KubeToleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};

use super::{
    ClusterApi, ClusterError, ContainerSpec, Toleration, WorkloadEndpoint, WorkloadSpec,
    STDIN_TUNNEL_PORT,
};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Production cluster client.
#[derive(Clone)]
pub struct KubeCluster {
    client: kube::Client,
}

impl KubeCluster {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<(), ClusterError> {
        let pod = build_pod(spec);
        self.pods(&spec.namespace)
            .create(&PostParams::default(), &pod)
            .await
            .map_err(to_cluster_error)?;
        tracing::info!(name = %spec.name, namespace = %spec.namespace, "Workload submitted");
        Ok(())
    }

    async fn await_ready(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<WorkloadEndpoint, ClusterError> {
        let pods = self.pods(namespace);
        let wait = async {
            loop {
                let pod = pods.get(name).await.map_err(to_cluster_error)?;
                if let Some(endpoint) = ready_endpoint(&pod) {
                    return Ok(endpoint);
                }
                if let Some(code) = terminated_exit_code(&pod) {
                    // Died before ever becoming ready.
                    return Err(ClusterError::Api(format!(
                        "workload {name} terminated during startup with code {code}"
                    )));
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(ClusterError::Timeout(timeout, name.to_string())),
        }
    }

    async fn wait_terminated(&self, namespace: &str, name: &str) -> Result<i32, ClusterError> {
        let pods = self.pods(namespace);
        loop {
            let pod = pods.get(name).await.map_err(to_cluster_error)?;
            if let Some(code) = terminated_exit_code(&pod) {
                return Ok(code);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn delete_workload(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        match self
            .pods(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            // Already gone is success: deletion is idempotent.
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(to_cluster_error(e)),
        }
    }
}

fn to_cluster_error(e: kube::Error) -> ClusterError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => ClusterError::NotFound(ae.message),
        other => ClusterError::Api(other.to_string()),
    }
}

/// Endpoint once every container reports ready and the pod has an IP.
fn ready_endpoint(pod: &Pod) -> Option<WorkloadEndpoint> {
    let status = pod.status.as_ref()?;
    let statuses = status.container_statuses.as_ref()?;
    let expected = pod.spec.as_ref().map(|s| s.containers.len()).unwrap_or(0);
    if statuses.len() < expected || !statuses.iter().all(|c| c.ready) {
        return None;
    }
    let ip = status.pod_ip.as_ref()?.parse().ok()?;
    Some(WorkloadEndpoint {
        ip,
        stdin_port: STDIN_TUNNEL_PORT,
    })
}

/// Exit code of the main (first-declared) container, if it has terminated.
fn terminated_exit_code(pod: &Pod) -> Option<i32> {
    let main_name = pod.spec.as_ref()?.containers.first()?.name.clone();
    let statuses = pod.status.as_ref()?.container_statuses.as_ref()?;
    statuses
        .iter()
        .find(|c| c.name == main_name)?
        .state
        .as_ref()?
        .terminated
        .as_ref()
        .map(|t| t.exit_code)
}

fn build_pod(spec: &WorkloadSpec) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            namespace: Some(spec.namespace.clone()),
            labels: Some(spec.labels.clone()),
            annotations: Some(spec.annotations.clone()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            init_containers: if spec.init_containers.is_empty() {
                None
            } else {
                Some(
                    spec.init_containers
                        .iter()
                        .map(|c| build_container(c, &spec.volumes))
                        .collect(),
                )
            },
            containers: spec
                .containers
                .iter()
                .map(|c| build_container(c, &spec.volumes))
                .collect(),
            node_selector: if spec.node_selectors.is_empty() {
                None
            } else {
                Some(spec.node_selectors.clone())
            },
            tolerations: if spec.tolerations.is_empty() {
                None
            } else {
                Some(spec.tolerations.iter().map(build_toleration).collect())
            },
            image_pull_secrets: if spec.image_pull_secrets.is_empty() {
                None
            } else {
                Some(
                    spec.image_pull_secrets
                        .iter()
                        .map(|s| LocalObjectReference { name: s.clone() })
                        .collect(),
                )
            },
            volumes: if spec.volumes.is_empty() {
                None
            } else {
                Some(
                    spec.volumes
                        .iter()
                        .map(|v| Volume {
                            name: v.name.clone(),
                            empty_dir: Some(EmptyDirVolumeSource::default()),
                            ..Default::default()
                        })
                        .collect(),
                )
            },
            ..Default::default()
        }),
        status: None,
    }
}

fn build_container(spec: &ContainerSpec, volumes: &[super::VolumeSpec]) -> Container {
    Container {
        name: spec.name.clone(),
        image: Some(spec.image.clone()),
        image_pull_policy: Some(spec.pull_policy.as_str().to_string()),
        command: if spec.command.is_empty() {
            None
        } else {
            Some(spec.command.clone())
        },
        args: if spec.args.is_empty() {
            None
        } else {
            Some(spec.args.clone())
        },
        env: if spec.env.is_empty() {
            None
        } else {
            Some(
                spec.env
                    .iter()
                    .map(|(k, v)| EnvVar {
                        name: k.clone(),
                        value: Some(v.clone()),
                        value_from: None,
                    })
                    .collect(),
            )
        },
        ports: if spec.ports.is_empty() {
            None
        } else {
            Some(
                spec.ports
                    .iter()
                    .map(|p| ContainerPort {
                        container_port: i32::from(*p),
                        ..Default::default()
                    })
                    .collect(),
            )
        },
        resources: spec.resources.as_ref().map(build_resources),
        volume_mounts: {
            let mounts: Vec<VolumeMount> = spec
                .volume_mounts
                .iter()
                .filter_map(|name| volumes.iter().find(|v| &v.name == name))
                .map(|v| VolumeMount {
                    name: v.name.clone(),
                    mount_path: v.mount_path.clone(),
                    ..Default::default()
                })
                .collect();
            if mounts.is_empty() {
                None
            } else {
                Some(mounts)
            }
        },
        ..Default::default()
    }
}

fn build_resources(
    limits: &super::ResourceLimits,
) -> k8s_openapi::api::core::v1::ResourceRequirements {
    let mut requests = BTreeMap::new();
    let mut caps = BTreeMap::new();
    if let Some(cpu) = &limits.cpu_request {
        requests.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(mem) = &limits.memory_request {
        requests.insert("memory".to_string(), Quantity(mem.clone()));
    }
    if let Some(cpu) = &limits.cpu_limit {
        caps.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(mem) = &limits.memory_limit {
        caps.insert("memory".to_string(), Quantity(mem.clone()));
    }
    k8s_openapi::api::core::v1::ResourceRequirements {
        requests: if requests.is_empty() {
            None
        } else {
            Some(requests)
        },
        limits: if caps.is_empty() { None } else { Some(caps) },
        ..Default::default()
    }
}

fn build_toleration(t: &Toleration) -> KubeToleration {
    KubeToleration {
        key: Some(t.key.clone()),
        operator: Some(t.operator.clone()),
        value: t.value.clone(),
        effect: t.effect.clone(),
        toleration_seconds: None,
    }
}
