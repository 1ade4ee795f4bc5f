//! Pool registry and request dispatcher.
//!
//! The registry is built once at startup from the configured default pool
//! and any custom pools; membership is frozen afterwards, so dispatch reads
//! it without locks. Requests for an image with no pool fall back to a
//! one-shot ephemeral sandbox that is destroyed after the execution.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use sandpool_core::types::ScriptJob;
use sandpool_core::{AppConfig, Error, ExecutionResult, Result};
use sandpool_sandbox::{
    ContainerRuntime, ExecutionEngine, ImageResolver, SandboxFactory, SandboxProfile,
};

use crate::metrics::{Metrics, MetricsSnapshot, PoolMetricsEntry};
use crate::pool::Pool;

/// Grace given to each pool when the service shuts down.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Wait for canceled ephemeral executions to wind down during shutdown.
const EPHEMERAL_CANCEL_WAIT: Duration = Duration::from_secs(10);

/// Routes execution requests to pools or ephemeral sandboxes.
pub struct PoolRegistry {
    // Keyed by both the raw configured reference and its canonical form, so
    // operator-supplied names that omit the registry prefix still match.
    pools: HashMap<String, Arc<Pool>>,
    default_pool: Arc<Pool>,
    resolver: Arc<ImageResolver>,
    factory: Arc<SandboxFactory>,
    engine: ExecutionEngine,
    metrics: Arc<Metrics>,
    script_timeout: Duration,
    acquire_timeout: Duration,
    // Cancellation for the ephemeral path (pools carry their own signal);
    // fired during shutdown once the pools have drained.
    cancel_tx: watch::Sender<bool>,
    ephemeral_in_flight: AtomicUsize,
}

impl std::fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry").finish_non_exhaustive()
    }
}

impl PoolRegistry {
    /// Build the registry from configuration. Fails fast on malformed or
    /// duplicate pool definitions; no containers are created here.
    pub fn new(config: &AppConfig, runtime: Arc<dyn ContainerRuntime>) -> Result<Arc<Self>> {
        let profile = SandboxProfile::new(config.memory_limit_bytes()?, config.cpu_limit);
        let resolver = Arc::new(ImageResolver::new(
            runtime.clone(),
            config.custom_image_registry.clone(),
            Duration::from_secs(config.custom_image_pull_timeout),
            config.custom_image_pull_retries,
        ));
        let factory = Arc::new(SandboxFactory::new(runtime.clone(), profile));
        let engine = ExecutionEngine::new(runtime);
        let metrics = Arc::new(Metrics::new());

        let mut pools = HashMap::new();

        let canonical_base = resolver.resolve(&config.base_image)?;
        let default_pool = Pool::new(
            "default",
            canonical_base.clone(),
            config.pool_size,
            resolver.clone(),
            factory.clone(),
            metrics.clone(),
        );
        pools.insert(config.base_image.clone(), default_pool.clone());
        pools.insert(canonical_base, default_pool.clone());

        for (image, size) in config.custom_pool_entries()? {
            let canonical = resolver.resolve(&image)?;
            if pools.contains_key(&image) || pools.contains_key(&canonical) {
                return Err(Error::validation(format!(
                    "CUSTOM_POOLS image '{}' duplicates an existing pool",
                    image
                )));
            }
            let pool = Pool::new(
                format!("custom-{}", image.replace([':', '/'], "-")),
                canonical.clone(),
                size,
                resolver.clone(),
                factory.clone(),
                metrics.clone(),
            );
            pools.insert(image, pool.clone());
            pools.insert(canonical, pool);
        }

        tracing::info!(pools = pools_in(&pools).len(), "Pool registry built");

        let (cancel_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            pools,
            default_pool,
            resolver,
            factory,
            engine,
            metrics,
            script_timeout: Duration::from_secs(config.timeout),
            // A request waits at most one script-timeout for a lease.
            acquire_timeout: Duration::from_secs(config.timeout),
            cancel_tx,
            ephemeral_in_flight: AtomicUsize::new(0),
        }))
    }

    /// Start warming every pool toward its target size, in parallel across
    /// pools. The registry serves requests immediately; acquires block until
    /// replenishment catches up.
    pub fn warm_up(&self) {
        for pool in pools_in(&self.pools) {
            tracing::info!(pool = %pool.name(), image = %pool.image(), "Warming pool");
            pool.spawn_replenish();
        }
    }

    /// Execute a job, routing on the requested image.
    ///
    /// Never returns an error: every failure is folded into the result so
    /// the boundary can always answer 200 with a body.
    pub async fn dispatch(&self, image: Option<&str>, job: ScriptJob) -> ExecutionResult {
        let started = Instant::now();

        let outcome = match image.filter(|s| !s.is_empty()) {
            None => self.execute_pooled(&self.default_pool, &job).await,
            Some(reference) => match self.pools.get(reference) {
                Some(pool) => self.execute_pooled(pool, &job).await,
                None => match self.resolver.resolve(reference) {
                    Ok(canonical) => match self.pools.get(&canonical) {
                        Some(pool) => self.execute_pooled(pool, &job).await,
                        None => self.execute_ephemeral(&canonical, &job).await,
                    },
                    Err(e) => Err(e),
                },
            },
        };

        let result = outcome.unwrap_or_else(|e| {
            ExecutionResult::infrastructure_failure(e.to_string(), started.elapsed().as_secs_f64())
        });
        self.metrics.record_execution(&result);
        result
    }

    async fn execute_pooled(&self, pool: &Arc<Pool>, job: &ScriptJob) -> Result<ExecutionResult> {
        let mut handle = pool.acquire(self.acquire_timeout).await?;
        pool.record_execution();

        let result = self
            .engine
            .execute(&mut handle, job, self.script_timeout, pool.cancel_signal())
            .await;
        let clean = self.engine.is_reusable(&handle).await;
        pool.release(handle, clean).await;

        Ok(result)
    }

    /// One-shot path for images without a pool: pull if needed, run once,
    /// destroy unconditionally.
    async fn execute_ephemeral(&self, canonical: &str, job: &ScriptJob) -> Result<ExecutionResult> {
        tracing::info!(image = %canonical, "No pool for image, using ephemeral sandbox");

        match self.resolver.ensure(canonical).await {
            Ok(true) => self.metrics.inc_image_pulls(),
            Ok(false) => {}
            Err(e) => {
                self.metrics.inc_image_pull_failures();
                return Err(e);
            }
        }

        let mut handle = self.factory.create(canonical, None).await?;
        self.metrics.inc_containers_created();

        self.ephemeral_in_flight.fetch_add(1, Ordering::SeqCst);
        let result = self
            .engine
            .execute(
                &mut handle,
                job,
                self.script_timeout,
                self.cancel_tx.subscribe(),
            )
            .await;

        self.factory.destroy(&handle).await;
        self.metrics.inc_containers_destroyed();
        self.ephemeral_in_flight.fetch_sub(1, Ordering::SeqCst);

        Ok(result)
    }

    /// Drain every pool concurrently, then cancel any ephemeral executions
    /// still running (pool drains already consumed the grace).
    pub async fn shutdown(&self, grace: Duration) {
        tracing::info!("Draining all pools");
        let drains = pools_in(&self.pools)
            .into_iter()
            .map(|pool| async move { pool.drain(grace).await });
        futures::future::join_all(drains).await;

        let _ = self.cancel_tx.send(true);
        let deadline = Instant::now() + EPHEMERAL_CANCEL_WAIT;
        while self.ephemeral_in_flight.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                tracing::warn!(
                    in_flight = self.ephemeral_in_flight.load(Ordering::SeqCst),
                    "Ephemeral executions still running after cancellation"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Metrics snapshot combining global counters with per-pool gauges.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        let pools = pools_in(&self.pools);
        let mut pool_metrics = BTreeMap::new();
        let mut total_available = 0;

        for pool in &pools {
            let stats = pool.stats();
            total_available += stats.idle;
            pool_metrics.insert(
                stats.image.clone(),
                PoolMetricsEntry {
                    pool_size: stats.target_size,
                    available_containers: stats.idle,
                    in_flight: stats.in_flight,
                    total_executions: stats.executions,
                },
            );
        }

        self.metrics
            .snapshot(pools.len(), total_available, pool_metrics)
    }

    /// Pool for a raw or canonical reference, if one exists.
    pub fn pool_for(&self, reference: &str) -> Option<&Arc<Pool>> {
        self.pools.get(reference)
    }
}

/// Distinct pools in the registry (the map holds each pool under up to two
/// keys).
fn pools_in(pools: &HashMap<String, Arc<Pool>>) -> Vec<Arc<Pool>> {
    let mut seen = Vec::new();
    let mut out: Vec<Arc<Pool>> = Vec::new();
    for pool in pools.values() {
        if !seen.contains(&pool.name().to_string()) {
            seen.push(pool.name().to_string());
            out.push(pool.clone());
        }
    }
    out.sort_by(|a, b| a.name().cmp(b.name()));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandpool_sandbox::MockRuntime;

    fn test_config() -> AppConfig {
        AppConfig {
            pool_size: 2,
            timeout: 2,
            ..AppConfig::default()
        }
    }

    fn registry_with(config: &AppConfig, runtime: Arc<MockRuntime>) -> Arc<PoolRegistry> {
        PoolRegistry::new(config, runtime as Arc<dyn ContainerRuntime>).unwrap()
    }

    async fn wait_for_available(registry: &PoolRegistry, n: usize) {
        for _ in 0..200 {
            if registry.metrics_snapshot().total_available_containers >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("registry never reached {} available containers", n);
    }

    #[tokio::test]
    async fn test_dispatch_default_pool() {
        let runtime = Arc::new(MockRuntime::new().with_local_image("alpine:latest"));
        let registry = registry_with(&test_config(), runtime);
        registry.warm_up();
        wait_for_available(&registry, 2).await;

        let result = registry
            .dispatch(None, ScriptJob::script("echo hi"))
            .await;
        assert!(result.success);

        let snap = registry.metrics_snapshot();
        assert_eq!(snap.executions_total, 1);
        assert_eq!(snap.executions_success, 1);
        assert_eq!(snap.pools_active, 1);
        // Clean release: the pool is back at target.
        assert_eq!(snap.total_available_containers, 2);
    }

    #[tokio::test]
    async fn test_dispatch_custom_pool_by_raw_and_canonical_key() {
        let runtime = Arc::new(
            MockRuntime::new()
                .with_local_image("registry.local/alpine:latest")
                .with_local_image("registry.local/python:3.11"),
        );
        let config = AppConfig {
            pool_size: 1,
            custom_image_registry: "registry.local".into(),
            custom_pools: "python:3.11:1".into(),
            timeout: 2,
            ..AppConfig::default()
        };
        let registry = registry_with(&config, runtime);
        registry.warm_up();
        wait_for_available(&registry, 2).await;

        // Raw name (no registry prefix) and canonical name hit the same pool.
        let raw = registry.pool_for("python:3.11").unwrap();
        let canonical = registry.pool_for("registry.local/python:3.11").unwrap();
        assert_eq!(raw.name(), canonical.name());

        let result = registry
            .dispatch(Some("python:3.11"), ScriptJob::script("echo hi"))
            .await;
        assert!(result.success);

        let snap = registry.metrics_snapshot();
        assert_eq!(snap.pools_active, 2);
        assert_eq!(
            snap.pool_metrics["registry.local/python:3.11"].total_executions,
            1
        );
    }

    #[tokio::test]
    async fn test_dispatch_ephemeral_creates_and_destroys() {
        let runtime = Arc::new(
            MockRuntime::new()
                .with_local_image("alpine:latest")
                .with_registry_image("node:20"),
        );
        let registry = registry_with(&test_config(), runtime.clone());
        registry.warm_up();
        wait_for_available(&registry, 2).await;

        let before = registry.metrics_snapshot();
        let result = registry
            .dispatch(Some("node:20"), ScriptJob::script("echo hi"))
            .await;
        assert!(result.success);

        let snap = registry.metrics_snapshot();
        assert_eq!(snap.image_pulls, 1);
        assert_eq!(snap.containers_created, before.containers_created + 1);
        assert_eq!(snap.containers_destroyed, before.containers_destroyed + 1);
        // Idle capacity is untouched by the ephemeral path.
        assert_eq!(snap.total_available_containers, 2);
    }

    #[tokio::test]
    async fn test_dispatch_malformed_image_fails_without_container() {
        let runtime = Arc::new(MockRuntime::new().with_local_image("alpine:latest"));
        let registry = registry_with(&test_config(), runtime.clone());
        registry.warm_up();
        wait_for_available(&registry, 2).await;

        let created_before = runtime.created.load(std::sync::atomic::Ordering::SeqCst);
        let result = registry
            .dispatch(Some("NOT A VALID REF"), ScriptJob::script("echo hi"))
            .await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("malformed"));
        assert_eq!(
            runtime.created.load(std::sync::atomic::Ordering::SeqCst),
            created_before
        );
    }

    #[tokio::test]
    async fn test_dispatch_unknown_image_reports_resolve_error() {
        let runtime = Arc::new(MockRuntime::new().with_local_image("alpine:latest"));
        let registry = registry_with(&test_config(), runtime);
        registry.warm_up();
        wait_for_available(&registry, 2).await;

        let result = registry
            .dispatch(Some("does-not-exist:nope"), ScriptJob::script("echo x"))
            .await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("not found"));

        let snap = registry.metrics_snapshot();
        assert_eq!(snap.image_pull_failures, 1);
        assert_eq!(snap.executions_failed, 1);
    }

    #[tokio::test]
    async fn test_duplicate_custom_pool_rejected() {
        let config = AppConfig {
            custom_pools: "alpine:latest:2".into(),
            ..AppConfig::default()
        };
        let runtime = Arc::new(MockRuntime::new());
        let err = PoolRegistry::new(&config, runtime as Arc<dyn ContainerRuntime>).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_shutdown_drains_all_pools() {
        let runtime = Arc::new(MockRuntime::new().with_local_image("alpine:latest"));
        let registry = registry_with(&test_config(), runtime.clone());
        registry.warm_up();
        wait_for_available(&registry, 2).await;

        registry.shutdown(Duration::from_secs(1)).await;
        assert_eq!(runtime.container_count(), 0);

        let result = registry.dispatch(None, ScriptJob::script("echo hi")).await;
        assert!(!result.success);
    }
}
