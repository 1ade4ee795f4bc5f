//! Image reference resolution and acquisition.
//!
//! References are canonicalized (optionally prefixed with the configured
//! registry), validated, and pulled on demand with bounded retry. Concurrent
//! `ensure` calls for the same canonical reference collapse into a single
//! in-flight pull via a per-reference async mutex, so warming a pool of
//! size N never races N identical pulls.

use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sandpool_core::{Error, Result};

use crate::runtime::ContainerRuntime;

/// Resolves and acquires container images.
pub struct ImageResolver {
    runtime: Arc<dyn ContainerRuntime>,
    registry_prefix: String,
    pull_timeout: Duration,
    pull_retries: u32,
    in_flight: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ImageResolver {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        registry_prefix: impl Into<String>,
        pull_timeout: Duration,
        pull_retries: u32,
    ) -> Self {
        Self {
            runtime,
            registry_prefix: registry_prefix.into(),
            pull_timeout,
            pull_retries: pull_retries.max(1),
            in_flight: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Validate a reference and return its canonical form.
    ///
    /// A bare reference (no registry host) gets the configured registry
    /// prefix prepended; a reference that already names a registry is kept
    /// as-is.
    pub fn resolve(&self, reference: &str) -> Result<String> {
        validate_reference(reference)?;

        if !self.registry_prefix.is_empty() && !has_registry_host(reference) {
            Ok(format!("{}/{}", self.registry_prefix, reference))
        } else {
            Ok(reference.to_string())
        }
    }

    /// Ensure a canonical reference is available locally, pulling if needed.
    ///
    /// Returns whether a pull actually happened. Transient pull failures are
    /// retried with exponential backoff; "not found" and authentication
    /// errors abort immediately.
    pub async fn ensure(&self, canonical: &str) -> Result<bool> {
        let gate = {
            let mut map = self.in_flight.lock().await;
            map.entry(canonical.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        // Holding the per-reference gate makes concurrent callers wait for
        // the first pull instead of racing their own.
        let result = {
            let _guard = gate.lock().await;
            self.check_and_pull(canonical).await
        };

        // The image field is caller-supplied, so the gate map must not grow
        // with every reference ever seen. Evict once no other caller holds
        // this entry (map + our clone account for two references).
        {
            let mut map = self.in_flight.lock().await;
            if let Some(entry) = map.get(canonical) {
                if Arc::strong_count(entry) <= 2 {
                    map.remove(canonical);
                }
            }
        }

        result
    }

    async fn check_and_pull(&self, canonical: &str) -> Result<bool> {
        if self.runtime.image_exists(canonical).await? {
            return Ok(false);
        }

        let mut last_error = None;
        for attempt in 1..=self.pull_retries {
            tracing::info!(
                image = %canonical,
                attempt,
                retries = self.pull_retries,
                "Pulling image"
            );
            match self.runtime.pull_image(canonical, self.pull_timeout).await {
                Ok(()) => {
                    tracing::info!(image = %canonical, "Image pulled");
                    return Ok(true);
                }
                Err(e @ Error::ImageResolve(_)) => return Err(e),
                Err(e) => {
                    tracing::warn!(image = %canonical, attempt, error = %e, "Image pull failed");
                    last_error = Some(e);
                    if attempt < self.pull_retries {
                        tokio::time::sleep(backoff_delay(attempt)).await;
                    }
                }
            }
        }

        Err(Error::image_pull(format!(
            "failed to pull {} after {} attempts: {}",
            canonical,
            self.pull_retries,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Resolve and ensure in one step; returns `(canonical, pulled)`.
    pub async fn resolve_and_ensure(&self, reference: &str) -> Result<(String, bool)> {
        let canonical = self.resolve(reference)?;
        let pulled = self.ensure(&canonical).await?;
        Ok((canonical, pulled))
    }
}

/// Exponential backoff with ±25% jitter: 1s, 2s, 4s, ... per failed attempt.
/// Shared by the pull retry loop here and pool replenishment retries.
pub fn backoff_delay(attempt: u32) -> Duration {
    let base = 1u64 << (attempt - 1).min(6);
    let jitter = rand::thread_rng().gen_range(0.75..=1.25);
    Duration::from_millis((base as f64 * 1000.0 * jitter) as u64)
}

/// Whether the first path component names a registry host.
///
/// Follows the Docker convention: a component containing a dot or a port
/// colon, or the literal `localhost`, is a host; everything else is a
/// repository component.
fn has_registry_host(reference: &str) -> bool {
    match reference.split_once('/') {
        Some((first, _)) => first.contains('.') || first.contains(':') || first == "localhost",
        None => false,
    }
}

/// Validate an image reference: `[host[:port]/]repo[/repo...][:tag]`.
pub fn validate_reference(reference: &str) -> Result<()> {
    if reference.is_empty() {
        return Err(Error::image_resolve("image reference is empty"));
    }
    if reference.len() > 255 {
        return Err(Error::image_resolve("image reference is too long"));
    }

    // Split off the tag: the last colon counts only when it appears after
    // the final slash (otherwise it is a registry port).
    let (path, tag) = match reference.rfind(':') {
        Some(idx) if idx > reference.rfind('/').map_or(0, |s| s) => {
            (&reference[..idx], Some(&reference[idx + 1..]))
        }
        _ => (reference, None),
    };

    if let Some(tag) = tag {
        if tag.is_empty()
            || tag.len() > 128
            || !tag
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
            || tag.starts_with('.')
            || tag.starts_with('-')
        {
            return Err(Error::image_resolve(format!(
                "malformed image tag in '{}'",
                reference
            )));
        }
    }

    let mut components = path.split('/').peekable();
    let mut first = true;
    while let Some(component) = components.next() {
        if component.is_empty() {
            return Err(Error::image_resolve(format!(
                "malformed image reference '{}'",
                reference
            )));
        }
        // The leading host component may carry a port and dots; repository
        // components are lowercase alphanumerics with ._- separators.
        let is_host = first && components.peek().is_some() && has_registry_host(reference);
        let valid = if is_host {
            component
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':'))
        } else {
            component
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '-' | '_'))
                && component.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        };
        if !valid {
            return Err(Error::image_resolve(format!(
                "malformed image reference '{}'",
                reference
            )));
        }
        first = false;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MockRuntime;

    fn resolver(runtime: Arc<MockRuntime>, prefix: &str) -> ImageResolver {
        ImageResolver::new(runtime, prefix, Duration::from_secs(5), 3)
    }

    #[test]
    fn test_validate_reference_accepts_common_forms() {
        assert!(validate_reference("alpine").is_ok());
        assert!(validate_reference("alpine:latest").is_ok());
        assert!(validate_reference("python:3.11-slim").is_ok());
        assert!(validate_reference("library/redis:7").is_ok());
        assert!(validate_reference("registry.example.com:5000/team/app:v1.2").is_ok());
        assert!(validate_reference("localhost/app").is_ok());
    }

    #[test]
    fn test_validate_reference_rejects_malformed() {
        assert!(validate_reference("").is_err());
        assert!(validate_reference("UPPER:latest").is_err());
        assert!(validate_reference("spaces in name").is_err());
        assert!(validate_reference("img:").is_err());
        assert!(validate_reference("img::tag").is_err());
        assert!(validate_reference("a//b").is_err());
        assert!(validate_reference("img:-bad").is_err());
    }

    #[tokio::test]
    async fn test_resolve_prepends_registry_for_bare_refs() {
        let r = resolver(Arc::new(MockRuntime::new()), "registry.local:5000");
        assert_eq!(
            r.resolve("alpine:latest").unwrap(),
            "registry.local:5000/alpine:latest"
        );
        // Already qualified: untouched.
        assert_eq!(
            r.resolve("other.io/img:1").unwrap(),
            "other.io/img:1"
        );
    }

    #[tokio::test]
    async fn test_resolve_without_registry_is_identity() {
        let r = resolver(Arc::new(MockRuntime::new()), "");
        assert_eq!(r.resolve("alpine:latest").unwrap(), "alpine:latest");
    }

    #[tokio::test]
    async fn test_ensure_skips_pull_when_local() {
        let runtime = Arc::new(MockRuntime::new().with_local_image("alpine:latest"));
        let r = resolver(runtime.clone(), "");
        assert!(!r.ensure("alpine:latest").await.unwrap());
        assert_eq!(runtime.pulls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ensure_pulls_once_when_missing() {
        let runtime = Arc::new(MockRuntime::new().with_registry_image("python:3.11"));
        let r = resolver(runtime.clone(), "");
        assert!(r.ensure("python:3.11").await.unwrap());
        assert_eq!(runtime.pulls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ensure_not_found_is_fatal() {
        let runtime = Arc::new(MockRuntime::new());
        let r = resolver(runtime, "");
        let err = r.ensure("ghost:nope").await.unwrap_err();
        assert!(matches!(err, Error::ImageResolve(_)));
    }

    #[tokio::test]
    async fn test_ensure_single_flight() {
        let runtime = Arc::new(MockRuntime::new().with_registry_image("node:20"));
        let r = Arc::new(resolver(runtime.clone(), ""));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let r = r.clone();
            handles.push(tokio::spawn(async move { r.ensure("node:20").await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        // All callers were served by one pull.
        assert_eq!(runtime.pulls.load(std::sync::atomic::Ordering::SeqCst), 1);
        // The gate entry is evicted once the last caller leaves.
        assert!(r.in_flight.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_ensure_does_not_accumulate_gate_entries() {
        let runtime = Arc::new(MockRuntime::new());
        let r = resolver(runtime, "");

        // Distinct caller-supplied references must not pile up in the
        // single-flight map, even when every pull fails.
        for i in 0..32 {
            let _ = r.ensure(&format!("ghost-{}:latest", i)).await;
        }
        assert!(r.in_flight.lock().await.is_empty());
    }

    #[test]
    fn test_backoff_delay_grows() {
        let d1 = backoff_delay(1);
        let d3 = backoff_delay(3);
        assert!(d1 >= Duration::from_millis(750) && d1 <= Duration::from_millis(1250));
        assert!(d3 >= Duration::from_millis(3000) && d3 <= Duration::from_millis(5000));
    }
}
