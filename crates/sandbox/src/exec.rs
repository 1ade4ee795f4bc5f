//! Per-container execution protocol.
//!
//! Given a leased sandbox handle and a script job, the engine stages the
//! script (and any attachments) into a unique working directory under the
//! container's `/tmp`, runs it through `/bin/sh`, enforces the wall-clock
//! timeout, captures stdout/stderr independently, and cleans up. It also
//! decides whether the sandbox can safely go back to its pool.

use base64::Engine as _;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use sandpool_core::types::ScriptJob;
use sandpool_core::{Error, ExecutionResult, Result};

use crate::factory::SandboxHandle;
use crate::runtime::{ContainerRuntime, ContainerState, ExecOutput};

/// Executions per sandbox before age-based recycling. Bounds filesystem and
/// memory drift inside long-lived containers.
pub const MAX_SANDBOX_EXECUTIONS: u32 = 100;

/// Cap per output stream; anything beyond is dropped and marked.
pub const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

const TRUNCATION_MARKER: &str = "\n[...output truncated]";

/// Time allowed for staging and cleanup execs (not the script itself).
const HOUSEKEEPING_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace between SIGTERM and SIGKILL after a timeout.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Runs scripts inside leased sandboxes.
pub struct ExecutionEngine {
    runtime: Arc<dyn ContainerRuntime>,
}

impl ExecutionEngine {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// Execute a job inside the sandbox, enforcing `timeout`.
    ///
    /// `cancel` flips to true when the owning pool (or the service) is
    /// draining past its grace: the running script gets the same
    /// SIGTERM-then-SIGKILL treatment as a timeout and the result carries a
    /// cancellation error.
    ///
    /// Always returns a result; infrastructure failures are folded into the
    /// result's `error` field and taint the handle. The caller remains
    /// responsible for the release-or-destroy decision via [`Self::is_reusable`].
    pub async fn execute(
        &self,
        handle: &mut SandboxHandle,
        job: &ScriptJob,
        timeout: Duration,
        cancel: watch::Receiver<bool>,
    ) -> ExecutionResult {
        let started = Instant::now();
        handle.exec_count += 1;

        let workdir = format!("/tmp/{}", uuid::Uuid::new_v4().simple());

        let result = match self
            .run_protocol(handle, job, timeout, &workdir, started, cancel)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                handle.taint();
                ExecutionResult::infrastructure_failure(
                    e.to_string(),
                    started.elapsed().as_secs_f64(),
                )
            }
        };

        self.remove_workdir(handle, &workdir).await;
        handle.last_used = Instant::now();

        result
    }

    async fn run_protocol(
        &self,
        handle: &mut SandboxHandle,
        job: &ScriptJob,
        timeout: Duration,
        workdir: &str,
        started: Instant,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<ExecutionResult> {
        self.stage_script(handle, workdir, &job.script).await?;
        for file in &job.files {
            self.stage_file(handle, workdir, &file.name, &file.content)
                .await?;
        }

        // The script file runs exactly as provided (no shebang injection);
        // the recorded pid lets the timeout path signal the process group.
        let run_cmd = format!("echo $$ > {d}/.pid; exec '{d}/script.sh'", d = workdir);
        let container_id = handle.container_id.clone();
        let run = self.runtime.exec(
            &container_id,
            vec!["/bin/sh".to_string(), "-c".to_string(), run_cmd],
            Some(job.stdin.clone().into_bytes()),
            Some(workdir),
            timeout,
        );
        let output = tokio::select! {
            biased;
            _ = wait_canceled(&mut cancel) => {
                tracing::warn!(image = %handle.image, "Execution canceled, stopping script");
                self.terminate_script(handle, workdir).await;
                handle.taint();
                return Ok(ExecutionResult {
                    success: false,
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: -1,
                    execution_time: started.elapsed().as_secs_f64(),
                    error: Some(Error::Canceled("shutdown in progress".into()).to_string()),
                });
            }
            output = run => output?,
        };

        if output.timed_out {
            tracing::warn!(
                image = %handle.image,
                timeout_secs = timeout.as_secs(),
                "Script execution timed out"
            );
            self.terminate_script(handle, workdir).await;
            handle.taint();
            return Ok(ExecutionResult {
                success: false,
                stdout: truncate_output(output.stdout),
                stderr: truncate_output(output.stderr),
                exit_code: -1,
                execution_time: started.elapsed().as_secs_f64(),
                error: Some(Error::ExecutionTimeout.to_string()),
            });
        }

        Ok(ExecutionResult {
            success: output.exit_code == 0,
            stdout: truncate_output(output.stdout),
            stderr: truncate_output(output.stderr),
            exit_code: output.exit_code,
            execution_time: started.elapsed().as_secs_f64(),
            error: None,
        })
    }

    /// Write the script into the working directory: base64 through the exec
    /// channel, decoded to a `.tmp` name, then renamed so the final path
    /// only ever holds complete content.
    async fn stage_script(
        &self,
        handle: &SandboxHandle,
        workdir: &str,
        script: &str,
    ) -> Result<()> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(script.as_bytes());
        let cmd = format!(
            "mkdir -p {d} && echo '{b64}' | base64 -d > {d}/script.sh.tmp \
             && mv {d}/script.sh.tmp {d}/script.sh && chmod +x {d}/script.sh",
            d = workdir,
            b64 = encoded
        );
        self.housekeeping_exec(handle, cmd, "stage script").await
    }

    /// Deliver one attachment into the working directory.
    ///
    /// The file name is caller-controlled (path policy only guarantees it is
    /// a safe relative path), so every interpolation into the staging command
    /// is shell-quoted.
    async fn stage_file(
        &self,
        handle: &SandboxHandle,
        workdir: &str,
        name: &std::path::Path,
        content: &[u8],
    ) -> Result<()> {
        let relative = name.to_string_lossy();
        let encoded = base64::engine::general_purpose::STANDARD.encode(content);
        let tmp = shell_quote(&format!("{}/{}.tmp", workdir, relative));
        let dest = shell_quote(&format!("{}/{}", workdir, relative));
        let mkdir = match name.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                format!(
                    "mkdir -p {} && ",
                    shell_quote(&format!("{}/{}", workdir, parent.to_string_lossy()))
                )
            }
            _ => String::new(),
        };
        let cmd = format!(
            "{mkdir}echo '{b64}' | base64 -d > {tmp} && mv {tmp} {dest}",
            mkdir = mkdir,
            b64 = encoded,
            tmp = tmp,
            dest = dest
        );
        self.housekeeping_exec(handle, cmd, "stage file").await
    }

    async fn housekeeping_exec(
        &self,
        handle: &SandboxHandle,
        cmd: String,
        what: &str,
    ) -> Result<()> {
        let output = self
            .runtime
            .exec(
                &handle.container_id,
                vec!["/bin/sh".to_string(), "-c".to_string(), cmd],
                None,
                None,
                HOUSEKEEPING_TIMEOUT,
            )
            .await?;
        if output.timed_out || output.exit_code != 0 {
            return Err(Error::runtime_api(format!(
                "failed to {}: exit {}: {}",
                what,
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Kill a timed-out script: SIGTERM to its process group, a short grace,
    /// then SIGKILL. Failures are ignored; the handle is already tainted
    /// and will be destroyed.
    async fn terminate_script(&self, handle: &SandboxHandle, workdir: &str) {
        self.signal_script(handle, workdir, "TERM").await;
        tokio::time::sleep(KILL_GRACE).await;
        self.signal_script(handle, workdir, "KILL").await;
    }

    async fn signal_script(&self, handle: &SandboxHandle, workdir: &str, signal: &str) {
        let cmd = format!(
            "pid=$(cat {d}/.pid 2>/dev/null); \
             if [ -n \"$pid\" ]; then kill -{sig} -\"$pid\" 2>/dev/null || kill -{sig} \"$pid\" 2>/dev/null; fi; true",
            d = workdir,
            sig = signal
        );
        if let Err(e) = self
            .runtime
            .exec(
                &handle.container_id,
                vec!["/bin/sh".to_string(), "-c".to_string(), cmd],
                None,
                None,
                Duration::from_secs(5),
            )
            .await
        {
            tracing::debug!(error = %e, signal = signal, "Failed to signal timed-out script");
        }
    }

    /// Remove the working directory. Failure taints the handle (the sandbox
    /// filesystem can no longer be trusted clean) but never fails the result.
    async fn remove_workdir(&self, handle: &mut SandboxHandle, workdir: &str) {
        let removed = self
            .runtime
            .exec(
                &handle.container_id,
                vec!["rm".to_string(), "-rf".to_string(), workdir.to_string()],
                None,
                None,
                HOUSEKEEPING_TIMEOUT,
            )
            .await;
        match removed {
            Ok(ExecOutput { exit_code: 0, timed_out: false, .. }) => {}
            Ok(_) | Err(_) => {
                tracing::warn!(image = %handle.image, "Failed to clean execution workdir");
                handle.taint();
            }
        }
    }

    /// Whether a handle may return to its pool after an execution.
    pub async fn is_reusable(&self, handle: &SandboxHandle) -> bool {
        if handle.tainted {
            return false;
        }
        if handle.exec_count >= MAX_SANDBOX_EXECUTIONS {
            tracing::debug!(image = %handle.image, "Sandbox hit execution limit, recycling");
            return false;
        }
        matches!(
            self.runtime.inspect_state(&handle.container_id).await,
            Ok(ContainerState::Running)
        )
    }
}

/// Resolve once the cancellation flag flips to true. A dropped sender means
/// cancellation can no longer arrive, so the future never resolves.
async fn wait_canceled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|canceled| *canceled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Single-quote a path for safe inclusion in a shell command, escaping
/// embedded quotes as `'\''`.
fn shell_quote(path: &str) -> String {
    format!("'{}'", path.replace('\'', "'\\''"))
}

/// Enforce the per-stream output cap, marking truncation.
fn truncate_output(mut s: String) -> String {
    if s.len() > MAX_OUTPUT_BYTES {
        let mut cut = MAX_OUTPUT_BYTES;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push_str(TRUNCATION_MARKER);
    }
    s
}
