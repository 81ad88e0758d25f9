use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::cluster::{
    ClusterApi, ContainerSpec, ResourceLimits, VolumeSpec, WorkloadSpec, STDIN_TUNNEL_PORT,
};
use crate::config::WorkerConfig;
use crate::error::{Result, WorkerError};
use crate::ports::PortPool;
use crate::process::heartbeat::HeartbeatMonitor;

const MAIN_CONTAINER: &str = "main";
const INIT_CONTAINER: &str = "init";
const STDIN_RELAY: &str = "relay-stdin";
const STDOUT_RELAY: &str = "relay-stdout";
const STDERR_RELAY: &str = "relay-stderr";
const HEARTBEAT_SIDECAR: &str = "heartbeat";

const PIPES_VOLUME: &str = "stdio";
const PIPES_MOUNT: &str = "/pipes";
const CONFIG_VOLUME: &str = "config";
const CONFIG_MOUNT: &str = "/config";

/// Seconds between in-pod heartbeat probes.
const SIDECAR_HEARTBEAT_INTERVAL_SECS: u64 = 10;

/// Why a workload reached [`ProcessState::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// The heartbeat endpoint was unreachable past the grace period.
    HeartbeatLost,
    /// The control plane failed while the workload was being watched.
    Cluster(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::HeartbeatLost => write!(f, "heartbeat lost"),
            FailureReason::Cluster(e) => write!(f, "cluster failure: {e}"),
        }
    }
}

/// Lifecycle of one workload. Terminal states are absorbing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    Creating,
    Running,
    Exited(i32),
    Killed,
    Failed(FailureReason),
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProcessState::Creating | ProcessState::Running)
    }

    /// Exit code, if the main container exited on its own.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ProcessState::Exited(code) => Some(*code),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::Creating => write!(f, "creating"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Exited(code) => write!(f, "exited({code})"),
            ProcessState::Killed => write!(f, "killed"),
            ProcessState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Everything the factory resolved for one launch, handed to
/// [`WorkloadProcess::start`].
#[derive(Debug, Clone)]
pub(crate) struct WorkloadLaunch {
    pub name: String,
    pub job_id: String,
    pub attempt: u32,
    pub image: String,
    pub stdout_port: u16,
    pub stderr_port: u16,
    pub heartbeat_url: String,
    /// Host the relay sidecars dial back to.
    pub process_runner_host: String,
    pub uses_stdin: bool,
    /// Files staged into the workload's config mount before the main
    /// container starts.
    pub files: BTreeMap<String, String>,
    pub entrypoint: String,
    pub args: Vec<String>,
    pub resources: Option<ResourceLimits>,
    pub labels: BTreeMap<String, String>,
    pub node_selectors: BTreeMap<String, String>,
    /// Main-container ports to expose; the internal→external mapping itself
    /// is consumed by the calling pipeline.
    pub exposed_ports: Vec<u16>,
    pub env: BTreeMap<String, String>,
    pub config: WorkerConfig,
}

/// A connector running as a multi-container workload in the cluster, driven
/// through a local process-control interface.
///
/// One supervisor task per instance arbitrates natural exit, heartbeat loss
/// and explicit kill; whichever happens first wins, cleanup (workload
/// deletion, port release) runs exactly once, and the terminal state is
/// published only after cleanup finished.
#[derive(Debug)]
pub struct WorkloadProcess {
    name: String,
    job_id: String,
    attempt: u32,
    started_at: DateTime<Utc>,
    state_rx: watch::Receiver<ProcessState>,
    kill_token: CancellationToken,
    stdin: Mutex<Option<OwnedWriteHalf>>,
    stdout: Mutex<Option<OwnedReadHalf>>,
    stderr: Mutex<Option<OwnedReadHalf>>,
}

impl WorkloadProcess {
    /// Submit the workload and bring it to `Running`.
    ///
    /// Owns the two tunnel ports from here on: they are released exactly
    /// once, either on a startup failure below or by the supervisor on the
    /// terminal transition.
    pub(crate) async fn start(
        cluster: Arc<dyn ClusterApi>,
        pool: Arc<PortPool>,
        launch: WorkloadLaunch,
    ) -> Result<WorkloadProcess> {
        let name = launch.name.clone();
        let job_id = launch.job_id.clone();
        let attempt = launch.attempt;
        let namespace = launch.config.namespace.clone();
        let started_at = Utc::now();

        // Listeners must exist before the spec is submitted so the relay
        // sidecars have something to dial back to.
        let stdout_listener = match bind(launch.stdout_port).await {
            Ok(l) => l,
            Err(e) => return Err(startup_failure(&pool, &launch, None, &name, e).await),
        };
        let stderr_listener = match bind(launch.stderr_port).await {
            Ok(l) => l,
            Err(e) => return Err(startup_failure(&pool, &launch, None, &name, e).await),
        };

        let spec = build_workload_spec(&launch, &namespace);
        if let Err(e) = cluster.create_workload(&spec).await {
            // Submission rejections keep their cluster identity so callers
            // can match on them; no object exists, only the ports need
            // returning.
            tracing::error!(name = %name, error = %e, "Workload submission rejected");
            release_ports(&pool, &name, [launch.stdout_port, launch.stderr_port]);
            return Err(WorkerError::Cluster(e));
        }

        let endpoint = match cluster
            .await_ready(&namespace, &name, launch.config.startup_timeout)
            .await
        {
            Ok(endpoint) => endpoint,
            Err(e) => {
                return Err(startup_failure(
                    &pool,
                    &launch,
                    Some((&*cluster, namespace.as_str())),
                    &name,
                    WorkerError::from(e),
                )
                .await)
            }
        };
        tracing::info!(name = %name, ip = %endpoint.ip, "Workload containers ready");

        let accept_timeout = launch.config.tunnel_accept_timeout;
        let stdout_conn = match accept_tunnel(stdout_listener, accept_timeout, "stdout").await {
            Ok(conn) => conn,
            Err(e) => {
                return Err(startup_failure(
                    &pool,
                    &launch,
                    Some((&*cluster, namespace.as_str())),
                    &name,
                    e,
                )
                .await)
            }
        };
        let stderr_conn = match accept_tunnel(stderr_listener, accept_timeout, "stderr").await {
            Ok(conn) => conn,
            Err(e) => {
                return Err(startup_failure(
                    &pool,
                    &launch,
                    Some((&*cluster, namespace.as_str())),
                    &name,
                    e,
                )
                .await)
            }
        };

        let stdin = if launch.uses_stdin {
            match dial_stdin(endpoint.ip, endpoint.stdin_port).await {
                Ok(writer) => Some(writer),
                Err(e) => {
                    return Err(startup_failure(
                        &pool,
                        &launch,
                        Some((&*cluster, namespace.as_str())),
                        &name,
                        e,
                    )
                    .await)
                }
            }
        } else {
            None
        };

        let (stdout_read, _) = stdout_conn.into_split();
        let (stderr_read, _) = stderr_conn.into_split();

        let (state_tx, state_rx) = watch::channel(ProcessState::Creating);
        let _ = state_tx.send(ProcessState::Running);
        tracing::info!(name = %name, "Workload running");

        let kill_token = CancellationToken::new();
        let monitor = HeartbeatMonitor::new(launch.heartbeat_url.clone(), &launch.config.heartbeat);

        tokio::spawn(supervise(
            cluster,
            pool,
            state_tx,
            kill_token.clone(),
            monitor,
            namespace,
            launch.name,
            launch.job_id,
            launch.attempt,
            launch.stdout_port,
            launch.stderr_port,
        ));

        Ok(WorkloadProcess {
            name,
            job_id,
            attempt,
            started_at,
            state_rx,
            kill_token,
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(Some(stdout_read)),
            stderr: Mutex::new(Some(stderr_read)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Current state. Never transitions out of a terminal state.
    pub fn state(&self) -> ProcessState {
        self.state_rx.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        !self.state().is_terminal()
    }

    /// Exit code of the main container, once it has exited naturally.
    pub fn exit_status(&self) -> Option<i32> {
        self.state().exit_code()
    }

    /// Writer for the workload's stdin. Yields once; `None` when the
    /// process was created without stdin or the writer was already taken.
    pub fn take_stdin(&self) -> Option<OwnedWriteHalf> {
        self.stdin.lock().expect("stdin lock poisoned").take()
    }

    /// Reader for the workload's stdout tunnel. Yields once.
    pub fn take_stdout(&self) -> Option<OwnedReadHalf> {
        self.stdout.lock().expect("stdout lock poisoned").take()
    }

    /// Reader for the workload's stderr tunnel. Yields once.
    pub fn take_stderr(&self) -> Option<OwnedReadHalf> {
        self.stderr.lock().expect("stderr lock poisoned").take()
    }

    /// Block until the workload reaches a terminal state.
    ///
    /// Safe to call from any number of tasks; by the time this returns, the
    /// workload object is deleted and both tunnel ports are back in the
    /// pool.
    pub async fn wait(&self) -> ProcessState {
        let mut rx = self.state_rx.clone();
        loop {
            {
                let state = rx.borrow();
                if state.is_terminal() {
                    return state.clone();
                }
            }
            if rx.changed().await.is_err() {
                // Supervisor gone; the last published value is terminal.
                return rx.borrow().clone();
            }
        }
    }

    /// Wait, then fold the terminal state into a `Result` for callers that
    /// only care whether the connector succeeded.
    pub async fn wait_checked(&self) -> Result<()> {
        match self.wait().await {
            ProcessState::Exited(0) => Ok(()),
            ProcessState::Exited(code) => Err(WorkerError::UnexpectedExit {
                name: self.name.clone(),
                code,
            }),
            ProcessState::Killed => Err(WorkerError::Internal(format!(
                "workload {} was killed",
                self.name
            ))),
            ProcessState::Failed(FailureReason::HeartbeatLost) => Err(WorkerError::HeartbeatLost {
                name: self.name.clone(),
                job_id: self.job_id.clone(),
                attempt: self.attempt,
            }),
            ProcessState::Failed(FailureReason::Cluster(e)) => {
                Err(WorkerError::Cluster(crate::cluster::ClusterError::Api(e)))
            }
            state => Err(WorkerError::Internal(format!(
                "wait returned non-terminal state {state}"
            ))),
        }
    }

    /// Force termination. Idempotent, and safe to race against natural
    /// exit: the supervisor picks exactly one outcome and the loser is a
    /// no-op. Returns the terminal state once cleanup has finished.
    pub async fn kill(&self) -> ProcessState {
        self.kill_token.cancel();
        self.wait().await
    }
}

/// Arbitrates the terminal transition and performs the one cleanup.
#[allow(clippy::too_many_arguments)]
async fn supervise(
    cluster: Arc<dyn ClusterApi>,
    pool: Arc<PortPool>,
    state_tx: watch::Sender<ProcessState>,
    kill_token: CancellationToken,
    monitor: HeartbeatMonitor,
    namespace: String,
    name: String,
    job_id: String,
    attempt: u32,
    stdout_port: u16,
    stderr_port: u16,
) {
    let terminal = tokio::select! {
        result = cluster.wait_terminated(&namespace, &name) => match result {
            Ok(code) => {
                if code == 0 {
                    tracing::info!(name = %name, job_id = %job_id, attempt, "Workload exited cleanly");
                } else {
                    tracing::warn!(name = %name, job_id = %job_id, attempt, code, "Workload exited with nonzero status");
                }
                ProcessState::Exited(code)
            }
            Err(e) => {
                tracing::error!(name = %name, error = %e, "Lost track of workload");
                ProcessState::Failed(FailureReason::Cluster(e.to_string()))
            }
        },
        () = monitor.lost() => {
            tracing::warn!(name = %name, job_id = %job_id, attempt, "Heartbeat lost, failing workload");
            ProcessState::Failed(FailureReason::HeartbeatLost)
        }
        () = kill_token.cancelled() => {
            tracing::info!(name = %name, job_id = %job_id, attempt, "Workload killed");
            ProcessState::Killed
        }
    };

    if let Err(e) = cluster.delete_workload(&namespace, &name).await {
        tracing::warn!(name = %name, error = %e, "Failed to delete workload during cleanup");
    }
    release_ports(&pool, &name, [stdout_port, stderr_port]);

    tracing::info!(name = %name, state = %terminal, "Workload reached terminal state");
    let _ = state_tx.send(terminal);
}

async fn bind(port: u16) -> Result<TcpListener> {
    TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| WorkerError::Internal(format!("failed to bind tunnel port {port}: {e}")))
}

async fn accept_tunnel(
    listener: TcpListener,
    timeout: std::time::Duration,
    stream_name: &str,
) -> Result<TcpStream> {
    match tokio::time::timeout(timeout, listener.accept()).await {
        Ok(Ok((conn, peer))) => {
            tracing::debug!(stream = stream_name, %peer, "Tunnel connected");
            Ok(conn)
        }
        Ok(Err(e)) => Err(WorkerError::Internal(format!(
            "accept on {stream_name} tunnel failed: {e}"
        ))),
        Err(_) => Err(WorkerError::Internal(format!(
            "{stream_name} tunnel was not established within {timeout:?}"
        ))),
    }
}

/// The stdin relay may come up a beat after readiness; retry briefly.
async fn dial_stdin(ip: std::net::IpAddr, port: u16) -> Result<OwnedWriteHalf> {
    let mut last_err = None;
    for _ in 0..10 {
        match TcpStream::connect((ip, port)).await {
            Ok(conn) => {
                let (_, writer) = conn.into_split();
                return Ok(writer);
            }
            Err(e) => {
                last_err = Some(e);
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            }
        }
    }
    Err(WorkerError::Internal(format!(
        "stdin tunnel to {ip}:{port} failed: {}",
        last_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}

/// Startup failed: tear down whatever exists and surface a wrapped error.
/// `delete` carries the cluster handle once a workload object was created.
async fn startup_failure(
    pool: &Arc<PortPool>,
    launch: &WorkloadLaunch,
    delete: Option<(&dyn ClusterApi, &str)>,
    name: &str,
    cause: WorkerError,
) -> WorkerError {
    if let Some((cluster, namespace)) = delete {
        if let Err(e) = cluster.delete_workload(namespace, name).await {
            tracing::warn!(name = %name, error = %e, "Failed to delete workload after startup failure");
        }
    }
    release_ports(pool, name, [launch.stdout_port, launch.stderr_port]);
    WorkerError::Startup {
        name: name.to_string(),
        reason: cause.to_string(),
    }
}

fn release_ports(pool: &Arc<PortPool>, name: &str, ports: [u16; 2]) {
    for port in ports {
        if let Err(e) = pool.release(port) {
            tracing::error!(name = %name, port, error = %e, "Port release failed");
        }
    }
}

/// Assemble the multi-container spec: init container creating the stdio
/// pipes and staging config files, the connector as main container, socat
/// relays bridging the pipes to the caller's ports, and a curl sidecar that
/// probes the heartbeat URL and exits (taking the workload down) when the
/// orchestrator has gone away.
fn build_workload_spec(launch: &WorkloadLaunch, namespace: &str) -> WorkloadSpec {
    let cfg = &launch.config;

    let mut init = ContainerSpec::new(INIT_CONTAINER, &cfg.busybox_image, cfg.sidecar_image_pull_policy);
    init.command = vec!["sh".to_string(), "-c".to_string(), init_script(launch)];
    for (i, (path, content)) in launch.files.iter().enumerate() {
        init.env.insert(format!("FILE_{i}_PATH"), path.clone());
        init.env.insert(format!("FILE_{i}"), content.clone());
    }
    init.volume_mounts = vec![PIPES_VOLUME.to_string(), CONFIG_VOLUME.to_string()];

    let mut main = ContainerSpec::new(MAIN_CONTAINER, &launch.image, cfg.job_image_pull_policy);
    main.command = vec!["sh".to_string(), "-c".to_string(), main_script(launch)];
    main.env = launch.env.clone();
    main.resources = launch.resources.clone();
    main.ports = launch.exposed_ports.clone();
    main.volume_mounts = vec![PIPES_VOLUME.to_string(), CONFIG_VOLUME.to_string()];

    let mut containers = vec![main];

    if launch.uses_stdin {
        let mut relay = ContainerSpec::new(STDIN_RELAY, &cfg.socat_image, cfg.sidecar_image_pull_policy);
        relay.command = vec!["socat".to_string()];
        relay.args = vec![
            "-d".to_string(),
            format!("TCP-LISTEN:{STDIN_TUNNEL_PORT}"),
            format!("OPEN:{PIPES_MOUNT}/stdin"),
        ];
        relay.ports = vec![STDIN_TUNNEL_PORT];
        relay.volume_mounts = vec![PIPES_VOLUME.to_string()];
        containers.push(relay);
    }

    for (relay_name, pipe, port) in [
        (STDOUT_RELAY, "stdout", launch.stdout_port),
        (STDERR_RELAY, "stderr", launch.stderr_port),
    ] {
        let mut relay = ContainerSpec::new(relay_name, &cfg.socat_image, cfg.sidecar_image_pull_policy);
        relay.command = vec!["socat".to_string()];
        relay.args = vec![
            "-d".to_string(),
            format!("OPEN:{PIPES_MOUNT}/{pipe}"),
            format!("TCP:{}:{}", launch.process_runner_host, port),
        ];
        relay.volume_mounts = vec![PIPES_VOLUME.to_string()];
        containers.push(relay);
    }

    let mut heartbeat = ContainerSpec::new(HEARTBEAT_SIDECAR, &cfg.curl_image, cfg.sidecar_image_pull_policy);
    heartbeat.command = vec![
        "sh".to_string(),
        "-c".to_string(),
        format!(
            "while true; do curl -sSf {} >/dev/null || exit 1; sleep {}; done",
            launch.heartbeat_url, SIDECAR_HEARTBEAT_INTERVAL_SECS
        ),
    ];
    containers.push(heartbeat);

    WorkloadSpec {
        name: launch.name.clone(),
        namespace: namespace.to_string(),
        labels: launch.labels.clone(),
        annotations: cfg.annotations.clone(),
        node_selectors: launch.node_selectors.clone(),
        tolerations: cfg.tolerations.clone(),
        image_pull_secrets: cfg.image_pull_secrets.clone(),
        init_containers: vec![init],
        containers,
        volumes: vec![
            VolumeSpec {
                name: PIPES_VOLUME.to_string(),
                mount_path: PIPES_MOUNT.to_string(),
            },
            VolumeSpec {
                name: CONFIG_VOLUME.to_string(),
                mount_path: CONFIG_MOUNT.to_string(),
            },
        ],
    }
}

fn init_script(launch: &WorkloadLaunch) -> String {
    let mut script = format!("mkfifo {PIPES_MOUNT}/stdin {PIPES_MOUNT}/stdout {PIPES_MOUNT}/stderr");
    for i in 0..launch.files.len() {
        script.push_str(&format!(
            " && printf '%s' \"$FILE_{i}\" > \"{CONFIG_MOUNT}/$FILE_{i}_PATH\""
        ));
    }
    script
}

fn main_script(launch: &WorkloadLaunch) -> String {
    let stdin_source = if launch.uses_stdin {
        format!("{PIPES_MOUNT}/stdin")
    } else {
        "/dev/null".to_string()
    };
    let mut command = launch.entrypoint.clone();
    for arg in &launch.args {
        command.push(' ');
        command.push_str(&shell_quote(arg));
    }
    format!(
        "cd {CONFIG_MOUNT} && exec {command} < {stdin_source} > {PIPES_MOUNT}/stdout 2> {PIPES_MOUNT}/stderr"
    )
}

/// Single-quote an argument so the in-pod shell passes it through as one
/// word, whatever it contains.
fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}
