//! Sandbox creation and destruction.

use std::sync::Arc;
use std::time::{Duration, Instant};

use sandpool_core::{Error, Result};

use crate::runtime::{ContainerRuntime, ContainerState, SandboxProfile};

/// How long to wait for a started container to report "running".
const STARTUP_WAIT: Duration = Duration::from_secs(3);
/// Poll interval while waiting for startup.
const STARTUP_POLL: Duration = Duration::from_millis(100);

// =============================================================================
// Sandbox Handle
// =============================================================================

/// One runtime container owned by the scheduler.
///
/// While a handle sits in a pool's idle set it is running and clean; while
/// leased it is exclusively owned by one execution. The handle carries the
/// owning pool's name (not a reference) so ownership stays one-directional.
#[derive(Debug)]
pub struct SandboxHandle {
    pub container_id: String,
    pub image: String,
    /// Name of the owning pool; `None` on the ephemeral path.
    pub pool: Option<String>,
    pub created_at: Instant,
    pub last_used: Instant,
    pub exec_count: u32,
    pub tainted: bool,
}

impl SandboxHandle {
    /// Mark the sandbox as perturbed; tainted handles are never pooled again.
    pub fn taint(&mut self) {
        self.tainted = true;
    }
}

// =============================================================================
// Sandbox Factory
// =============================================================================

/// Creates sandbox containers from the fixed security profile.
pub struct SandboxFactory {
    runtime: Arc<dyn ContainerRuntime>,
    profile: SandboxProfile,
}

impl SandboxFactory {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, profile: SandboxProfile) -> Self {
        Self { runtime, profile }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Create and start a sandbox for an image that is already present.
    ///
    /// Waits until the container reports "running" before returning a clean
    /// handle. A container that was created but failed to start is removed
    /// before the error propagates.
    pub async fn create(&self, image: &str, pool: Option<&str>) -> Result<SandboxHandle> {
        let pool_label = pool.unwrap_or("ephemeral");
        let id = self
            .runtime
            .create_sandbox(image, &self.profile, pool_label)
            .await?;

        if let Err(e) = self.start_and_wait(&id).await {
            // Don't leave a half-created container behind.
            let _ = self.runtime.remove_container(&id).await;
            return Err(e);
        }

        tracing::debug!(image = %image, pool = %pool_label, "Sandbox created");

        let now = Instant::now();
        Ok(SandboxHandle {
            container_id: id,
            image: image.to_string(),
            pool: pool.map(str::to_string),
            created_at: now,
            last_used: now,
            exec_count: 0,
            tainted: false,
        })
    }

    async fn start_and_wait(&self, id: &str) -> Result<()> {
        self.runtime.start_container(id).await?;

        let deadline = Instant::now() + STARTUP_WAIT;
        loop {
            match self.runtime.inspect_state(id).await? {
                ContainerState::Running => return Ok(()),
                ContainerState::Missing => {
                    return Err(Error::sandbox_creation(
                        "container disappeared during startup",
                    ));
                }
                ContainerState::Exited => {
                    if Instant::now() >= deadline {
                        return Err(Error::sandbox_creation(
                            "container did not reach running state",
                        ));
                    }
                    tokio::time::sleep(STARTUP_POLL).await;
                }
            }
        }
    }

    /// Stop and remove a sandbox. Best-effort: failures are logged, not
    /// propagated, since destruction runs on cleanup paths.
    pub async fn destroy(&self, handle: &SandboxHandle) {
        if let Err(e) = self.runtime.stop_container(&handle.container_id, 5).await {
            tracing::debug!(error = %e, "Sandbox stop failed (continuing with remove)");
        }
        if let Err(e) = self.runtime.remove_container(&handle.container_id).await {
            tracing::warn!(error = %e, "Sandbox remove failed");
        } else {
            tracing::debug!(image = %handle.image, "Sandbox destroyed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MockRuntime;

    fn factory(runtime: Arc<MockRuntime>) -> SandboxFactory {
        SandboxFactory::new(runtime, SandboxProfile::new(256 * 1024 * 1024, 0.5))
    }

    #[tokio::test]
    async fn test_create_returns_clean_running_handle() {
        let runtime = Arc::new(MockRuntime::new().with_local_image("alpine:latest"));
        let f = factory(runtime.clone());

        let handle = f.create("alpine:latest", Some("default")).await.unwrap();
        assert!(!handle.tainted);
        assert_eq!(handle.exec_count, 0);
        assert_eq!(handle.pool.as_deref(), Some("default"));
        assert_eq!(
            runtime.inspect_state(&handle.container_id).await.unwrap(),
            ContainerState::Running
        );
    }

    #[tokio::test]
    async fn test_create_fails_when_image_missing() {
        let runtime = Arc::new(MockRuntime::new());
        let f = factory(runtime.clone());

        let err = f.create("ghost:latest", None).await.unwrap_err();
        assert!(matches!(err, Error::SandboxCreation(_)));
        assert_eq!(runtime.container_count(), 0);
    }

    #[tokio::test]
    async fn test_destroy_removes_container() {
        let runtime = Arc::new(MockRuntime::new().with_local_image("alpine:latest"));
        let f = factory(runtime.clone());

        let handle = f.create("alpine:latest", None).await.unwrap();
        assert_eq!(runtime.container_count(), 1);

        f.destroy(&handle).await;
        assert_eq!(runtime.container_count(), 0);
        assert_eq!(runtime.removed.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
