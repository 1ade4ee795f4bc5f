//! Container runtime facade.
//!
//! This module provides the `ContainerRuntime` trait and a Docker-based
//! implementation using the `bollard` crate. The facade normalizes transport
//! and API failures into the core error kinds and fixes the sandbox security
//! profile: no network, capped memory and CPU, dropped capabilities,
//! read-only root filesystem with a writable tmpfs `/tmp`, and an
//! idle-keep-alive entrypoint so containers survive between executions.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use sandpool_core::{Error, Result};

/// Label attached to every container the service creates, used to find
/// orphans from a crashed process.
pub const MANAGED_LABEL_KEY: &str = "managed-by";
/// Value of [`MANAGED_LABEL_KEY`].
pub const MANAGED_LABEL_VALUE: &str = "sandpool";
/// Label carrying the owning pool name ("ephemeral" outside a pool).
pub const POOL_LABEL_KEY: &str = "sandpool.pool";

/// Standard CPU accounting period in microseconds.
const CPU_PERIOD: i64 = 100_000;

// =============================================================================
// Facade Types
// =============================================================================

/// Runtime state of a container, reduced to what the scheduler cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Exited,
    Missing,
}

/// Output of one exec inside a container.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub timed_out: bool,
}

impl ExecOutput {
    /// A successful exec with the given stdout.
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
            timed_out: false,
        }
    }

    /// A failed exec with the given exit code and stderr.
    pub fn failure(exit_code: i64, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code,
            timed_out: false,
        }
    }

    /// A timed-out exec carrying whatever output was captured.
    pub fn timeout(partial_stdout: impl Into<String>) -> Self {
        Self {
            stdout: partial_stdout.into(),
            stderr: String::new(),
            exit_code: -1,
            timed_out: true,
        }
    }
}

/// Fixed resource profile applied to every sandbox container.
///
/// Callers cannot influence this: the same caps apply to pooled and
/// ephemeral sandboxes alike.
#[derive(Debug, Clone)]
pub struct SandboxProfile {
    pub memory_limit_bytes: i64,
    pub cpu_quota: i64,
    pub pids_limit: i64,
}

impl SandboxProfile {
    /// Build a profile from the configured memory cap (bytes) and CPU limit
    /// (fractional cores).
    pub fn new(memory_limit_bytes: i64, cpu_limit: f64) -> Self {
        Self {
            memory_limit_bytes,
            cpu_quota: (cpu_limit * CPU_PERIOD as f64) as i64,
            pids_limit: 128,
        }
    }
}

// =============================================================================
// Runtime Trait
// =============================================================================

/// Thin adapter over the container runtime API.
///
/// The Docker implementation is the production backend; `MockRuntime`
/// implements the same surface in memory for deterministic tests.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Check that the runtime daemon is reachable.
    async fn ping(&self) -> Result<()>;

    /// Whether the image is available locally.
    async fn image_exists(&self, reference: &str) -> Result<bool>;

    /// Pull an image, bounded by `timeout` for the whole attempt.
    async fn pull_image(&self, reference: &str, timeout: Duration) -> Result<()>;

    /// Create a sandbox container from the fixed profile. Returns its id.
    /// The container is created but not started.
    async fn create_sandbox(
        &self,
        reference: &str,
        profile: &SandboxProfile,
        pool: &str,
    ) -> Result<String>;

    /// Start a created container.
    async fn start_container(&self, id: &str) -> Result<()>;

    /// Run a command inside a running container.
    ///
    /// `stdin` is piped to the process and closed; output streams are
    /// captured independently. On wall-clock timeout the partial output is
    /// returned with `timed_out = true` (the process is left to the caller
    /// to signal).
    async fn exec(
        &self,
        id: &str,
        cmd: Vec<String>,
        stdin: Option<Vec<u8>>,
        workdir: Option<&str>,
        timeout: Duration,
    ) -> Result<ExecOutput>;

    /// Stop a container with a grace period in seconds.
    async fn stop_container(&self, id: &str, grace_secs: i64) -> Result<()>;

    /// Force-remove a container.
    async fn remove_container(&self, id: &str) -> Result<()>;

    /// Reduced runtime state of a container.
    async fn inspect_state(&self, id: &str) -> Result<ContainerState>;

    /// Ids of all containers carrying the service's management label,
    /// including stopped ones.
    async fn list_managed_containers(&self) -> Result<Vec<String>>;
}

// =============================================================================
// Docker Implementation
// =============================================================================

/// Docker-backed runtime using the local daemon socket.
pub struct DockerRuntime {
    docker: bollard::Docker,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon.
    pub fn connect() -> Result<Self> {
        let docker = bollard::Docker::connect_with_local_defaults().map_err(|e| {
            Error::runtime_api(format!(
                "failed to connect to Docker daemon: {}. Is Docker running?",
                e
            ))
        })?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map_err(|e| Error::runtime_api(format!("cannot ping Docker daemon: {}", e)))?;
        Ok(())
    }

    async fn image_exists(&self, reference: &str) -> Result<bool> {
        match self.docker.inspect_image(reference).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(Error::runtime_api(format!("image inspect failed: {}", e))),
        }
    }

    async fn pull_image(&self, reference: &str, timeout: Duration) -> Result<()> {
        use bollard::image::CreateImageOptions;
        use futures::StreamExt;

        let options = CreateImageOptions {
            from_image: reference.to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);

        let drain = async {
            while let Some(progress) = stream.next().await {
                match progress {
                    Ok(info) => {
                        if let Some(error) = info.error {
                            return Err(classify_pull_failure(&error));
                        }
                    }
                    Err(e) => return Err(map_pull_error(&e)),
                }
            }
            Ok(())
        };

        match tokio::time::timeout(timeout, drain).await {
            Ok(result) => result,
            Err(_) => Err(Error::image_pull(format!(
                "pull did not complete within {}s",
                timeout.as_secs()
            ))),
        }
    }

    async fn create_sandbox(
        &self,
        reference: &str,
        profile: &SandboxProfile,
        pool: &str,
    ) -> Result<String> {
        use bollard::container::{Config, CreateContainerOptions};
        use bollard::models::HostConfig;

        let name = format!("sandpool-{}", uuid::Uuid::new_v4().simple());

        let host_config = HostConfig {
            memory: Some(profile.memory_limit_bytes),
            cpu_quota: Some(profile.cpu_quota),
            cpu_period: Some(CPU_PERIOD),
            network_mode: Some("none".to_string()),
            readonly_rootfs: Some(true),
            // Writable scratch space; everything the execution protocol
            // touches lives under /tmp.
            tmpfs: Some(HashMap::from([(
                "/tmp".to_string(),
                "rw,size=104857600".to_string(),
            )])),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            pids_limit: Some(profile.pids_limit),
            ..Default::default()
        };

        let config = Config {
            image: Some(reference.to_string()),
            // Idle keep-alive: the container does nothing until an exec
            // delivers a script.
            entrypoint: Some(vec!["sleep".to_string()]),
            cmd: Some(vec!["infinity".to_string()]),
            host_config: Some(host_config),
            labels: Some(HashMap::from([
                (
                    MANAGED_LABEL_KEY.to_string(),
                    MANAGED_LABEL_VALUE.to_string(),
                ),
                (POOL_LABEL_KEY.to_string(), pool.to_string()),
            ])),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| Error::sandbox_creation(format!("container create failed: {}", e)))?;

        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container::<String>(id, None)
            .await
            .map_err(|e| Error::sandbox_creation(format!("container start failed: {}", e)))?;
        Ok(())
    }

    async fn exec(
        &self,
        id: &str,
        cmd: Vec<String>,
        stdin: Option<Vec<u8>>,
        workdir: Option<&str>,
        timeout: Duration,
    ) -> Result<ExecOutput> {
        use bollard::container::LogOutput;
        use bollard::exec::{CreateExecOptions, StartExecResults};
        use futures::StreamExt;
        use tokio::io::AsyncWriteExt;

        let options = CreateExecOptions::<String> {
            cmd: Some(cmd),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            attach_stdin: Some(stdin.is_some()),
            working_dir: workdir.map(str::to_string),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(id, options)
            .await
            .map_err(|e| Error::runtime_api(format!("exec create failed: {}", e)))?;

        let start = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| Error::runtime_api(format!("exec start failed: {}", e)))?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached {
            mut output,
            mut input,
        } = start
        {
            if let Some(bytes) = stdin {
                // Feed stdin from a separate task so a full output buffer
                // cannot deadlock the write.
                tokio::spawn(async move {
                    let _ = input.write_all(&bytes).await;
                    let _ = input.shutdown().await;
                });
            }

            let collect = async {
                while let Some(msg) = output.next().await {
                    match msg {
                        Ok(LogOutput::StdOut { message }) => {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(LogOutput::StdErr { message }) => {
                            stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(_) => {}
                        Err(e) => {
                            return Err(Error::runtime_api(format!(
                                "error reading exec output: {}",
                                e
                            )));
                        }
                    }
                }
                Ok(())
            };

            match tokio::time::timeout(timeout, collect).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Ok(ExecOutput {
                        stdout,
                        stderr,
                        exit_code: -1,
                        timed_out: true,
                    });
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| Error::runtime_api(format!("exec inspect failed: {}", e)))?;

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code: inspect.exit_code.unwrap_or(-1),
            timed_out: false,
        })
    }

    async fn stop_container(&self, id: &str, grace_secs: i64) -> Result<()> {
        use bollard::container::StopContainerOptions;

        self.docker
            .stop_container(id, Some(StopContainerOptions { t: grace_secs }))
            .await
            .map_err(|e| Error::runtime_api(format!("container stop failed: {}", e)))?;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        use bollard::container::RemoveContainerOptions;

        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| Error::runtime_api(format!("container remove failed: {}", e)))?;
        Ok(())
    }

    async fn inspect_state(&self, id: &str) -> Result<ContainerState> {
        use bollard::container::InspectContainerOptions;
        use bollard::models::ContainerStateStatusEnum;

        let info = match self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => info,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => return Ok(ContainerState::Missing),
            Err(e) => return Err(Error::runtime_api(format!("container inspect failed: {}", e))),
        };

        let status = info.state.and_then(|s| s.status);
        Ok(match status {
            Some(ContainerStateStatusEnum::RUNNING) => ContainerState::Running,
            _ => ContainerState::Exited,
        })
    }

    async fn list_managed_containers(&self) -> Result<Vec<String>> {
        use bollard::container::ListContainersOptions;

        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{}={}", MANAGED_LABEL_KEY, MANAGED_LABEL_VALUE)],
        )]);

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| Error::runtime_api(format!("container list failed: {}", e)))?;

        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }
}

/// Classify a pull-progress error message into fatal vs transient.
fn classify_pull_failure(message: &str) -> Error {
    let lower = message.to_lowercase();
    if lower.contains("not found") || lower.contains("manifest unknown") {
        Error::image_resolve(format!("image not found in registry: {}", message))
    } else if lower.contains("unauthorized") || lower.contains("authentication") {
        Error::image_resolve(format!("registry authentication required: {}", message))
    } else {
        Error::image_pull(message.to_string())
    }
}

/// Map a bollard pull error into the resolve/pull split: 404 and auth
/// responses are fatal, everything else is transient.
fn map_pull_error(e: &bollard::errors::Error) -> Error {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => Error::image_resolve(format!("image not found in registry: {}", message)),
        bollard::errors::Error::DockerResponseServerError {
            status_code: 401 | 403,
            message,
        } => Error::image_resolve(format!("registry authentication required: {}", message)),
        other => Error::image_pull(other.to_string()),
    }
}

// =============================================================================
// Mock Runtime (for testing without Docker)
// =============================================================================

/// In-memory mock runtime for unit and integration tests.
///
/// Containers are entries in a map, images are string sets, and exec results
/// can be scripted per call (falling back to an empty success). Counters
/// expose how many containers were created/removed and how many pulls ran.
#[derive(Default)]
pub struct MockRuntime {
    local_images: std::sync::Mutex<std::collections::HashSet<String>>,
    registry_images: std::sync::Mutex<std::collections::HashSet<String>>,
    containers: std::sync::Mutex<HashMap<String, bool>>,
    exec_results: std::sync::Mutex<std::collections::VecDeque<ExecOutput>>,
    exec_log: std::sync::Mutex<Vec<Vec<String>>>,
    exec_delay: std::sync::Mutex<Option<Duration>>,
    fail_creates: std::sync::atomic::AtomicUsize,
    next_id: std::sync::atomic::AtomicUsize,
    pub created: std::sync::atomic::AtomicUsize,
    pub removed: std::sync::atomic::AtomicUsize,
    pub pulls: std::sync::atomic::AtomicUsize,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an image as already present locally.
    pub fn with_local_image(self, reference: &str) -> Self {
        self.local_images.lock().unwrap().insert(reference.to_string());
        self
    }

    /// Make an image pullable from the mock registry.
    pub fn with_registry_image(self, reference: &str) -> Self {
        self.registry_images
            .lock()
            .unwrap()
            .insert(reference.to_string());
        self
    }

    /// Queue a scripted result for the next exec call.
    pub fn push_exec_result(&self, result: ExecOutput) {
        self.exec_results.lock().unwrap().push_back(result);
    }

    /// Delay every exec by `d`, to simulate long-running scripts.
    pub fn set_exec_delay(&self, d: Duration) {
        *self.exec_delay.lock().unwrap() = Some(d);
    }

    /// Make the next `n` create calls fail.
    pub fn fail_next_creates(&self, n: usize) {
        self.fail_creates
            .store(n, std::sync::atomic::Ordering::SeqCst);
    }

    /// Number of containers currently known to the mock (running or not).
    pub fn container_count(&self) -> usize {
        self.containers.lock().unwrap().len()
    }

    /// Every command passed to exec, in call order.
    pub fn exec_commands(&self) -> Vec<Vec<String>> {
        self.exec_log.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn image_exists(&self, reference: &str) -> Result<bool> {
        Ok(self.local_images.lock().unwrap().contains(reference))
    }

    async fn pull_image(&self, reference: &str, _timeout: Duration) -> Result<()> {
        if self.registry_images.lock().unwrap().contains(reference) {
            self.pulls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.local_images
                .lock()
                .unwrap()
                .insert(reference.to_string());
            Ok(())
        } else {
            Err(Error::image_resolve(format!(
                "image not found in registry: {}",
                reference
            )))
        }
    }

    async fn create_sandbox(
        &self,
        reference: &str,
        _profile: &SandboxProfile,
        _pool: &str,
    ) -> Result<String> {
        use std::sync::atomic::Ordering;

        if self
            .fail_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::sandbox_creation("scripted create failure"));
        }
        if !self.local_images.lock().unwrap().contains(reference) {
            return Err(Error::sandbox_creation(format!(
                "image not present locally: {}",
                reference
            )));
        }

        let id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.containers.lock().unwrap().insert(id.clone(), false);
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        match self.containers.lock().unwrap().get_mut(id) {
            Some(running) => {
                *running = true;
                Ok(())
            }
            None => Err(Error::sandbox_creation("no such container")),
        }
    }

    async fn exec(
        &self,
        id: &str,
        cmd: Vec<String>,
        _stdin: Option<Vec<u8>>,
        _workdir: Option<&str>,
        _timeout: Duration,
    ) -> Result<ExecOutput> {
        match self.containers.lock().unwrap().get(id) {
            Some(true) => {}
            Some(false) => return Err(Error::runtime_api("container is not running")),
            None => return Err(Error::runtime_api("no such container")),
        }
        self.exec_log.lock().unwrap().push(cmd);

        let delay = *self.exec_delay.lock().unwrap();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }

        Ok(self
            .exec_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ExecOutput::success("")))
    }

    async fn stop_container(&self, id: &str, _grace_secs: i64) -> Result<()> {
        if let Some(running) = self.containers.lock().unwrap().get_mut(id) {
            *running = false;
        }
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        if self.containers.lock().unwrap().remove(id).is_some() {
            self.removed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
        Ok(())
    }

    async fn inspect_state(&self, id: &str) -> Result<ContainerState> {
        Ok(match self.containers.lock().unwrap().get(id) {
            Some(true) => ContainerState::Running,
            Some(false) => ContainerState::Exited,
            None => ContainerState::Missing,
        })
    }

    async fn list_managed_containers(&self) -> Result<Vec<String>> {
        Ok(self.containers.lock().unwrap().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_cpu_quota() {
        let profile = SandboxProfile::new(256 * 1024 * 1024, 0.5);
        assert_eq!(profile.cpu_quota, 50_000);
        assert_eq!(profile.memory_limit_bytes, 256 * 1024 * 1024);
    }

    #[test]
    fn test_classify_pull_failure() {
        assert!(matches!(
            classify_pull_failure("manifest unknown: tag nope"),
            Error::ImageResolve(_)
        ));
        assert!(matches!(
            classify_pull_failure("unauthorized: login required"),
            Error::ImageResolve(_)
        ));
        assert!(matches!(
            classify_pull_failure("connection reset by peer"),
            Error::ImagePull(_)
        ));
    }

    #[tokio::test]
    async fn test_mock_container_lifecycle() {
        let mock = MockRuntime::new().with_local_image("alpine:latest");
        let profile = SandboxProfile::new(1024, 0.5);

        let id = mock
            .create_sandbox("alpine:latest", &profile, "default")
            .await
            .unwrap();
        assert_eq!(mock.inspect_state(&id).await.unwrap(), ContainerState::Exited);

        mock.start_container(&id).await.unwrap();
        assert_eq!(mock.inspect_state(&id).await.unwrap(), ContainerState::Running);

        let out = mock
            .exec(&id, vec!["true".into()], None, None, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);

        mock.remove_container(&id).await.unwrap();
        assert_eq!(
            mock.inspect_state(&id).await.unwrap(),
            ContainerState::Missing
        );
    }

    #[tokio::test]
    async fn test_mock_pull_from_registry() {
        let mock = MockRuntime::new().with_registry_image("python:3.11");

        assert!(!mock.image_exists("python:3.11").await.unwrap());
        mock.pull_image("python:3.11", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(mock.image_exists("python:3.11").await.unwrap());

        let err = mock
            .pull_image("missing:latest", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ImageResolve(_)));
    }
}
