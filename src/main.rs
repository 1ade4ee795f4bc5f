#![deny(unused)]
//! sandpool: HTTP script execution service backed by pooled Docker sandboxes.
//!
//! Wires the layers together: configuration → tracing → Docker connection →
//! orphan cleanup → pool registry warm-up → HTTP server. On SIGTERM/ctrl-c
//! the boundary flips to 503, pools drain with a 30s grace, and a final
//! label sweep removes anything the drain missed.

use std::sync::Arc;

use sandpool_core::telemetry::configure_tracing;
use sandpool_core::AppConfig;
use sandpool_gateway::{GatewayConfig, GatewayServer};
use sandpool_sandbox::{ContainerRuntime, DockerRuntime};
use sandpool_scheduler::registry::SHUTDOWN_GRACE;
use sandpool_scheduler::PoolRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    configure_tracing(&config.log_level);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting sandpool");

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::connect()?);
    runtime.ping().await?;

    remove_managed_containers(&runtime, "orphaned").await;

    let registry = PoolRegistry::new(&config, runtime.clone())?;
    registry.warm_up();

    let gateway = GatewayServer::new(
        GatewayConfig {
            host: "0.0.0.0".into(),
            port: config.host_port,
        },
        registry.clone(),
    );
    let state = gateway.state();

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let mut server = tokio::spawn(gateway.run(async move {
        let _ = shutdown_rx.await;
    }));

    tokio::select! {
        // The server only returns on its own if it failed to bind or died.
        result = &mut server => {
            result??;
            return Ok(());
        }
        _ = shutdown_signal() => {}
    }

    tracing::info!("Shutdown signal received, draining");
    state.mark_draining();
    registry.shutdown(SHUTDOWN_GRACE).await;
    remove_managed_containers(&runtime, "leftover").await;

    let _ = shutdown_tx.send(());
    server.await??;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Resolve on SIGTERM or ctrl-c.
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

/// Force-remove every container carrying the service label. Covers
/// containers from a crashed previous process at startup and anything the
/// drain grace missed at shutdown.
async fn remove_managed_containers(runtime: &Arc<dyn ContainerRuntime>, kind: &str) {
    match runtime.list_managed_containers().await {
        Ok(ids) if !ids.is_empty() => {
            tracing::info!(count = ids.len(), kind = kind, "Removing managed sandbox containers");
            for id in ids {
                if let Err(e) = runtime.remove_container(&id).await {
                    tracing::warn!(error = %e, "Failed to remove container");
                }
            }
        }
        Ok(_) => {}
        Err(e) => {
            tracing::warn!(error = %e, "Could not scan for managed containers");
        }
    }
}
