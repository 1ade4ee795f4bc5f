//! Service-wide metrics aggregation.
//!
//! Counters are lock-free atomics updated from the dispatch path; the
//! snapshot is a flat JSON-serializable structure combined with per-pool
//! gauges read at snapshot time.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use sandpool_core::ExecutionResult;

/// Global counters shared by the registry and every pool.
#[derive(Debug, Default)]
pub struct Metrics {
    executions_total: AtomicU64,
    executions_success: AtomicU64,
    executions_failed: AtomicU64,
    executions_timeout: AtomicU64,
    containers_created: AtomicU64,
    containers_destroyed: AtomicU64,
    image_pulls: AtomicU64,
    image_pull_failures: AtomicU64,
    pool_acquire_timeouts: AtomicU64,
    execution_time_micros: AtomicU64,
    execution_time_count: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one finished execution into the counters.
    pub fn record_execution(&self, result: &ExecutionResult) {
        self.executions_total.fetch_add(1, Ordering::Relaxed);
        if result.success {
            self.executions_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.executions_failed.fetch_add(1, Ordering::Relaxed);
        }
        if result.error.as_deref() == Some("execution timeout") {
            self.executions_timeout.fetch_add(1, Ordering::Relaxed);
        }
        self.execution_time_micros.fetch_add(
            (result.execution_time * 1_000_000.0) as u64,
            Ordering::Relaxed,
        );
        self.execution_time_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_containers_created(&self) {
        self.containers_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_containers_destroyed(&self) {
        self.containers_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_image_pulls(&self) {
        self.image_pulls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_image_pull_failures(&self) {
        self.image_pull_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_pool_acquire_timeouts(&self) {
        self.pool_acquire_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn containers_created(&self) -> u64 {
        self.containers_created.load(Ordering::Relaxed)
    }

    pub fn containers_destroyed(&self) -> u64 {
        self.containers_destroyed.load(Ordering::Relaxed)
    }

    /// Assemble the full snapshot with the per-pool gauges supplied by the
    /// registry.
    pub fn snapshot(
        &self,
        pools_active: usize,
        total_available_containers: usize,
        pool_metrics: BTreeMap<String, PoolMetricsEntry>,
    ) -> MetricsSnapshot {
        MetricsSnapshot {
            pools_active,
            total_available_containers,
            executions_total: self.executions_total.load(Ordering::Relaxed),
            executions_success: self.executions_success.load(Ordering::Relaxed),
            executions_failed: self.executions_failed.load(Ordering::Relaxed),
            executions_timeout: self.executions_timeout.load(Ordering::Relaxed),
            containers_created: self.containers_created.load(Ordering::Relaxed),
            containers_destroyed: self.containers_destroyed.load(Ordering::Relaxed),
            image_pulls: self.image_pulls.load(Ordering::Relaxed),
            image_pull_failures: self.image_pull_failures.load(Ordering::Relaxed),
            pool_acquire_timeouts: self.pool_acquire_timeouts.load(Ordering::Relaxed),
            execution_time_sum: self.execution_time_micros.load(Ordering::Relaxed) as f64
                / 1_000_000.0,
            execution_time_count: self.execution_time_count.load(Ordering::Relaxed),
            pool_metrics,
        }
    }
}

/// Per-pool gauges reported under `pool_metrics`, keyed by image.
#[derive(Debug, Clone, Serialize)]
pub struct PoolMetricsEntry {
    pub pool_size: usize,
    pub available_containers: usize,
    pub in_flight: usize,
    pub total_executions: u64,
}

/// Flat snapshot served from `GET /metrics`.
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub pools_active: usize,
    pub total_available_containers: usize,
    pub executions_total: u64,
    pub executions_success: u64,
    pub executions_failed: u64,
    pub executions_timeout: u64,
    pub containers_created: u64,
    pub containers_destroyed: u64,
    pub image_pulls: u64,
    pub image_pull_failures: u64,
    pub pool_acquire_timeouts: u64,
    pub execution_time_sum: f64,
    pub execution_time_count: u64,
    pub pool_metrics: BTreeMap<String, PoolMetricsEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_result(secs: f64) -> ExecutionResult {
        ExecutionResult {
            success: true,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
            execution_time: secs,
            error: None,
        }
    }

    #[test]
    fn test_record_execution_buckets() {
        let m = Metrics::new();
        m.record_execution(&ok_result(0.5));
        m.record_execution(&ExecutionResult::infrastructure_failure("boom", 0.1));
        m.record_execution(&ExecutionResult::infrastructure_failure(
            "execution timeout",
            2.0,
        ));

        let snap = m.snapshot(1, 0, BTreeMap::new());
        assert_eq!(snap.executions_total, 3);
        assert_eq!(snap.executions_success, 1);
        assert_eq!(snap.executions_failed, 2);
        assert_eq!(snap.executions_timeout, 1);
        assert_eq!(snap.execution_time_count, 3);
        assert!((snap.execution_time_sum - 2.6).abs() < 0.001);
    }

    #[test]
    fn test_snapshot_serializes_flat() {
        let m = Metrics::new();
        m.inc_containers_created();
        let mut pools = BTreeMap::new();
        pools.insert(
            "alpine:latest".to_string(),
            PoolMetricsEntry {
                pool_size: 5,
                available_containers: 5,
                in_flight: 0,
                total_executions: 7,
            },
        );

        let json = serde_json::to_value(m.snapshot(1, 5, pools)).unwrap();
        assert_eq!(json["pools_active"], 1);
        assert_eq!(json["total_available_containers"], 5);
        assert_eq!(json["containers_created"], 1);
        assert_eq!(json["pool_metrics"]["alpine:latest"]["pool_size"], 5);
        assert_eq!(
            json["pool_metrics"]["alpine:latest"]["total_executions"],
            7
        );
    }
}
