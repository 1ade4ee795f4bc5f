//! Environment-driven configuration.
//!
//! All settings are consumed from environment variables at startup (the
//! service carries no config files). Defaults are set in code so a bare
//! `docker run` against the local socket works out of the box.

use ::config::{Config, Environment};
use serde::Deserialize;

use crate::error::{Error, Result};

/// Service configuration, loaded once at startup.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// Default pool target size (`POOL_SIZE`).
    pub pool_size: usize,
    /// Default pool image (`BASE_IMAGE`).
    pub base_image: String,
    /// Per-container memory cap, e.g. "256m" (`MEMORY_LIMIT`).
    pub memory_limit: String,
    /// Per-container CPU quota in fractional cores (`CPU_LIMIT`).
    pub cpu_limit: f64,
    /// Script wall-clock timeout in seconds (`TIMEOUT`).
    pub timeout: u64,
    /// Registry prefix applied to bare image references (`CUSTOM_IMAGE_REGISTRY`).
    pub custom_image_registry: String,
    /// Seconds allowed per pull attempt (`CUSTOM_IMAGE_PULL_TIMEOUT`).
    pub custom_image_pull_timeout: u64,
    /// Pull attempts before giving up (`CUSTOM_IMAGE_PULL_RETRIES`).
    pub custom_image_pull_retries: u32,
    /// Additional pools as `img1:n1,img2:n2,...` (`CUSTOM_POOLS`).
    pub custom_pools: String,
    /// HTTP listen port (`HOST_PORT`).
    pub host_port: u16,
    /// Logging verbosity (`LOG_LEVEL`).
    pub log_level: String,
}

impl AppConfig {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self> {
        let s = Config::builder()
            .set_default("pool_size", 5)
            .and_then(|b| b.set_default("base_image", "alpine:latest"))
            .and_then(|b| b.set_default("memory_limit", "256m"))
            .and_then(|b| b.set_default("cpu_limit", 0.5))
            .and_then(|b| b.set_default("timeout", 30))
            .and_then(|b| b.set_default("custom_image_registry", ""))
            .and_then(|b| b.set_default("custom_image_pull_timeout", 300))
            .and_then(|b| b.set_default("custom_image_pull_retries", 3))
            .and_then(|b| b.set_default("custom_pools", ""))
            .and_then(|b| b.set_default("host_port", 8080))
            .and_then(|b| b.set_default("log_level", "INFO"))
            .map_err(|e| Error::validation(format!("config defaults: {}", e)))?
            // Map POOL_SIZE=5 to pool_size, BASE_IMAGE=... to base_image, etc.
            .add_source(Environment::default())
            .build()
            .map_err(|e| Error::validation(format!("config load: {}", e)))?;

        let cfg: AppConfig = s
            .try_deserialize()
            .map_err(|e| Error::validation(format!("config parse: {}", e)))?;

        if cfg.pool_size == 0 {
            return Err(Error::validation("POOL_SIZE must be at least 1"));
        }
        if cfg.cpu_limit <= 0.0 {
            return Err(Error::validation("CPU_LIMIT must be positive"));
        }
        parse_memory_limit(&cfg.memory_limit)?;
        parse_custom_pools(&cfg.custom_pools)?;

        Ok(cfg)
    }

    /// Parsed `CUSTOM_POOLS` entries as `(image, size)` pairs.
    pub fn custom_pool_entries(&self) -> Result<Vec<(String, usize)>> {
        parse_custom_pools(&self.custom_pools)
    }

    /// Per-container memory cap in bytes.
    pub fn memory_limit_bytes(&self) -> Result<i64> {
        parse_memory_limit(&self.memory_limit)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            pool_size: 5,
            base_image: "alpine:latest".into(),
            memory_limit: "256m".into(),
            cpu_limit: 0.5,
            timeout: 30,
            custom_image_registry: String::new(),
            custom_image_pull_timeout: 300,
            custom_image_pull_retries: 3,
            custom_pools: String::new(),
            host_port: 8080,
            log_level: "INFO".into(),
        }
    }
}

/// Parse a memory limit string (e.g. "1g", "256m", "1048576") to bytes.
pub fn parse_memory_limit(limit: &str) -> Result<i64> {
    let limit = limit.trim().to_lowercase();

    if let Some(num) = limit.strip_suffix('g') {
        let gigs: i64 = num
            .parse()
            .map_err(|_| Error::validation(format!("invalid memory limit '{}'", limit)))?;
        Ok(gigs * 1024 * 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('m') {
        let megs: i64 = num
            .parse()
            .map_err(|_| Error::validation(format!("invalid memory limit '{}'", limit)))?;
        Ok(megs * 1024 * 1024)
    } else {
        limit
            .parse()
            .map_err(|_| Error::validation(format!("invalid memory limit '{}'", limit)))
    }
}

/// Parse the `CUSTOM_POOLS` value: comma-separated `image:size` entries.
///
/// Each entry splits on the final colon so registry-qualified tags such as
/// `host:5000/img:tag:2` parse into (`host:5000/img:tag`, 2). Malformed
/// entries fail startup with a precise error rather than being skipped.
pub fn parse_custom_pools(raw: &str) -> Result<Vec<(String, usize)>> {
    let mut pools = Vec::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (image, size) = entry.rsplit_once(':').ok_or_else(|| {
            Error::validation(format!(
                "CUSTOM_POOLS entry '{}' is not of the form image:size",
                entry
            ))
        })?;
        if image.is_empty() {
            return Err(Error::validation(format!(
                "CUSTOM_POOLS entry '{}' has an empty image name",
                entry
            )));
        }
        let size: usize = size.parse().map_err(|_| {
            Error::validation(format!(
                "CUSTOM_POOLS entry '{}' has a non-numeric size '{}'",
                entry, size
            ))
        })?;
        if size == 0 {
            return Err(Error::validation(format!(
                "CUSTOM_POOLS entry '{}' must have a positive size",
                entry
            )));
        }
        if pools.iter().any(|(img, _)| img == image) {
            return Err(Error::validation(format!(
                "CUSTOM_POOLS lists image '{}' more than once",
                image
            )));
        }
        pools.push((image.to_string(), size));
    }
    Ok(pools)
}
