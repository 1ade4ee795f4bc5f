#![deny(unused)]
//! Scheduling layer for sandpool.
//!
//! Owns the per-image container pools, the registry that routes each
//! execution request to a pool lease or an ephemeral sandbox, and the
//! metrics aggregator the operator surface reads from.
//!
//! Ownership is strictly one-directional: the registry owns the pools, a
//! pool owns its idle handles, and a leased handle belongs to exactly one
//! execution until it is released back (clean) or destroyed (tainted).

pub mod metrics;
pub mod pool;
pub mod registry;

pub use metrics::{Metrics, MetricsSnapshot, PoolMetricsEntry};
pub use pool::{Pool, PoolStats};
pub use registry::PoolRegistry;
