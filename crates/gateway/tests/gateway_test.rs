//! Gateway integration tests.
//!
//! Drive the axum router directly with `tower::ServiceExt::oneshot` against
//! a registry backed by the mock runtime. No Docker needed.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use sandpool_core::AppConfig;
use sandpool_gateway::{GatewayConfig, GatewayServer};
use sandpool_sandbox::{ContainerRuntime, ExecOutput, MockRuntime};
use sandpool_scheduler::PoolRegistry;

// =============================================================================
// Helpers
// =============================================================================

fn test_registry(runtime: Arc<MockRuntime>, pool_size: usize) -> Arc<PoolRegistry> {
    let config = AppConfig {
        pool_size,
        timeout: 2,
        ..AppConfig::default()
    };
    PoolRegistry::new(&config, runtime as Arc<dyn ContainerRuntime>).unwrap()
}

async fn warm(registry: &PoolRegistry, n: usize) {
    registry.warm_up();
    for _ in 0..200 {
        if registry.metrics_snapshot().total_available_containers >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("pools never warmed to {} containers", n);
}

async fn get(app: Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn post_execute(app: Router, body: String) -> (StatusCode, Value) {
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/execute")
                .header("Content-Type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let runtime = Arc::new(MockRuntime::new().with_local_image("alpine:latest"));
    let registry = test_registry(runtime, 1);
    // Healthy before any pool has warmed.
    let server = GatewayServer::new(GatewayConfig::default(), registry);

    let (status, body) = get(server.build_router(), "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_execute_echo() {
    let runtime = Arc::new(MockRuntime::new().with_local_image("alpine:latest"));
    let registry = test_registry(runtime.clone(), 1);
    warm(&registry, 1).await;
    let server = GatewayServer::new(GatewayConfig::default(), registry);

    // stage, run, cleanup
    runtime.push_exec_result(ExecOutput::success(""));
    runtime.push_exec_result(ExecOutput::success("hello\n"));
    runtime.push_exec_result(ExecOutput::success(""));

    let (status, body) = post_execute(
        server.build_router(),
        json!({"script": "echo hello"}).to_string(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["stdout"], "hello\n");
    assert_eq!(body["stderr"], "");
    assert_eq!(body["exit_code"], 0);
    assert_eq!(body["error"], Value::Null);
}

#[tokio::test]
async fn test_execute_pipes_stdin() {
    let runtime = Arc::new(MockRuntime::new().with_local_image("alpine:latest"));
    let registry = test_registry(runtime.clone(), 1);
    warm(&registry, 1).await;
    let server = GatewayServer::new(GatewayConfig::default(), registry);

    runtime.push_exec_result(ExecOutput::success(""));
    runtime.push_exec_result(ExecOutput::success("abc"));
    runtime.push_exec_result(ExecOutput::success(""));

    let (status, body) = post_execute(
        server.build_router(),
        json!({"script": "cat", "stdin": "abc"}).to_string(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stdout"], "abc");
    assert_eq!(body["exit_code"], 0);
}

#[tokio::test]
async fn test_execute_missing_script_is_400() {
    let runtime = Arc::new(MockRuntime::new().with_local_image("alpine:latest"));
    let registry = test_registry(runtime, 1);
    let server = GatewayServer::new(GatewayConfig::default(), registry);

    let (status, body) =
        post_execute(server.build_router(), json!({"stdin": "x"}).to_string()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);

    let (status, _) = post_execute(server.build_router(), json!({"script": ""}).to_string()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_execute_malformed_body_is_400() {
    let runtime = Arc::new(MockRuntime::new().with_local_image("alpine:latest"));
    let registry = test_registry(runtime, 1);
    let server = GatewayServer::new(GatewayConfig::default(), registry);

    let (status, body) = post_execute(server.build_router(), "{not json".to_string()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_execute_ignores_unknown_fields() {
    let runtime = Arc::new(MockRuntime::new().with_local_image("alpine:latest"));
    let registry = test_registry(runtime, 1);
    warm(&registry, 1).await;
    let server = GatewayServer::new(GatewayConfig::default(), registry);

    let (status, body) = post_execute(
        server.build_router(),
        json!({"script": "true", "bogus": 42}).to_string(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
}

#[tokio::test]
async fn test_execute_rejects_traversal_file_name() {
    let runtime = Arc::new(MockRuntime::new().with_local_image("alpine:latest"));
    let registry = test_registry(runtime, 1);
    let server = GatewayServer::new(GatewayConfig::default(), registry);

    let (status, body) = post_execute(
        server.build_router(),
        json!({
            "script": "true",
            "files": [{"name": "../../etc/passwd", "content": ""}]
        })
        .to_string(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_execute_during_drain_is_503() {
    let runtime = Arc::new(MockRuntime::new().with_local_image("alpine:latest"));
    let registry = test_registry(runtime, 1);
    let server = GatewayServer::new(GatewayConfig::default(), registry);
    server.state().mark_draining();

    let (status, body) = post_execute(
        server.build_router(),
        json!({"script": "echo hi"}).to_string(),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_metrics_endpoint_shape() {
    let runtime = Arc::new(MockRuntime::new().with_local_image("alpine:latest"));
    let registry = test_registry(runtime, 2);
    warm(&registry, 2).await;
    let server = GatewayServer::new(GatewayConfig::default(), registry);

    let app = server.build_router();
    let (status, _) = post_execute(app.clone(), json!({"script": "true"}).to_string()).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = get(app, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pools_active"], 1);
    assert_eq!(body["total_available_containers"], 2);
    assert_eq!(body["executions_total"], 1);
    assert_eq!(body["executions_success"], 1);
    let pool = &body["pool_metrics"]["alpine:latest"];
    assert_eq!(pool["pool_size"], 2);
    assert_eq!(pool["available_containers"], 2);
    assert_eq!(pool["in_flight"], 0);
    assert_eq!(pool["total_executions"], 1);
}
