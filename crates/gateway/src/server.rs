//! Axum-based HTTP server for the execution service.

use axum::{
    extract::rejection::JsonRejection,
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use sandpool_core::fs_policy::validate_attachment_name;
use sandpool_core::types::{
    FileAttachment, JobFile, ScriptJob, MAX_FILE_COUNT, MAX_FILE_SIZE, MAX_TOTAL_FILE_SIZE,
};
use sandpool_core::{Error, Result};
use sandpool_scheduler::PoolRegistry;

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to bind to.
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Shared application state.
pub struct AppState {
    registry: Arc<PoolRegistry>,
    draining: AtomicBool,
}

impl AppState {
    /// Flip the boundary into shutdown mode: `/execute` starts answering 503.
    pub fn mark_draining(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }
}

/// HTTP server over the pool registry.
pub struct GatewayServer {
    config: GatewayConfig,
    state: Arc<AppState>,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, registry: Arc<PoolRegistry>) -> Self {
        Self {
            config,
            state: Arc::new(AppState {
                registry,
                draining: AtomicBool::new(false),
            }),
        }
    }

    /// Shared state handle, used by the binary to flag shutdown.
    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    /// Build the axum router.
    pub fn build_router(&self) -> Router {
        Router::new()
            .route("/execute", post(execute_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Bind and serve until the shutdown future resolves.
    pub async fn run(
        self,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Other(anyhow::anyhow!("failed to bind {}: {}", addr, e)))?;

        tracing::info!(addr = %addr, "HTTP server listening");

        axum::serve(listener, self.build_router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| Error::Other(anyhow::anyhow!("server error: {}", e)))?;

        Ok(())
    }
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// Execution request body.
///
/// Unknown fields are accepted and ignored; `script` is required and must be
/// non-empty. Attachments arrive base64-encoded and are delivered into the
/// script's working directory.
#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub script: Option<String>,
    #[serde(default)]
    pub stdin: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub files: Vec<FileAttachment>,
}

/// Error body for non-200 responses, mirroring the result shape.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    success: bool,
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> axum::response::Response {
    (
        status,
        Json(ErrorResponse {
            success: false,
            error: message.into(),
        }),
    )
        .into_response()
}

// =============================================================================
// Handlers
// =============================================================================

/// Health check handler. Healthy as soon as the registry is initialized,
/// even while pools are still warming.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "healthy" }))
}

/// Metrics snapshot handler.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.registry.metrics_snapshot())
}

/// Script execution handler.
async fn execute_handler(
    State(state): State<Arc<AppState>>,
    payload: std::result::Result<Json<ExecuteRequest>, JsonRejection>,
) -> axum::response::Response {
    if state.draining.load(Ordering::SeqCst) {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "service is shutting down");
    }

    let Json(request) = match payload {
        Ok(json) => json,
        Err(rejection) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("malformed request body: {}", rejection.body_text()),
            );
        }
    };

    let (image, job) = match build_job(request) {
        Ok(parts) => parts,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };

    tracing::debug!(
        script_len = job.script.len(),
        files = job.files.len(),
        image = image.as_deref().unwrap_or("<default>"),
        "Dispatching execution"
    );

    let result = state.registry.dispatch(image.as_deref(), job).await;
    (StatusCode::OK, Json(result)).into_response()
}

/// Validate the wire request into a dispatchable job.
fn build_job(request: ExecuteRequest) -> Result<(Option<String>, ScriptJob)> {
    let script = match request.script {
        Some(s) if !s.is_empty() => s,
        _ => return Err(Error::validation("script is required and must be non-empty")),
    };

    if request.files.len() > MAX_FILE_COUNT {
        return Err(Error::validation(format!(
            "too many files: {} (limit {})",
            request.files.len(),
            MAX_FILE_COUNT
        )));
    }

    let mut files = Vec::with_capacity(request.files.len());
    let mut total = 0usize;
    for attachment in &request.files {
        let name = validate_attachment_name(&attachment.name)?;
        let content = base64::engine::general_purpose::STANDARD
            .decode(&attachment.content)
            .map_err(|_| {
                Error::validation(format!(
                    "file '{}' content is not valid base64",
                    attachment.name
                ))
            })?;
        if content.len() > MAX_FILE_SIZE {
            return Err(Error::validation(format!(
                "file '{}' exceeds the {}MB per-file limit",
                attachment.name,
                MAX_FILE_SIZE / (1024 * 1024)
            )));
        }
        total += content.len();
        if total > MAX_TOTAL_FILE_SIZE {
            return Err(Error::validation(format!(
                "total file size exceeds the {}MB limit",
                MAX_TOTAL_FILE_SIZE / (1024 * 1024)
            )));
        }
        files.push(JobFile { name, content });
    }

    Ok((
        request.image,
        ScriptJob {
            script,
            stdin: request.stdin.unwrap_or_default(),
            files,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(script: Option<&str>, files: Vec<FileAttachment>) -> ExecuteRequest {
        ExecuteRequest {
            script: script.map(str::to_string),
            stdin: None,
            image: None,
            files,
        }
    }

    #[test]
    fn test_build_job_requires_script() {
        assert!(build_job(request(None, vec![])).is_err());
        assert!(build_job(request(Some(""), vec![])).is_err());
        assert!(build_job(request(Some("echo hi"), vec![])).is_ok());
    }

    #[test]
    fn test_build_job_decodes_files() {
        let attachment = FileAttachment {
            name: "data/input.txt".into(),
            content: base64::engine::general_purpose::STANDARD.encode(b"payload"),
        };
        let (_, job) = build_job(request(Some("cat data/input.txt"), vec![attachment])).unwrap();
        assert_eq!(job.files.len(), 1);
        assert_eq!(job.files[0].content, b"payload");
    }

    #[test]
    fn test_build_job_accepts_quoted_names() {
        // Names with shell metacharacters are legal; the execution engine
        // quotes them when staging.
        let attachment = FileAttachment {
            name: "it's data.txt".into(),
            content: base64::engine::general_purpose::STANDARD.encode(b"x"),
        };
        let (_, job) = build_job(request(Some("true"), vec![attachment])).unwrap();
        assert_eq!(job.files[0].name, std::path::PathBuf::from("it's data.txt"));
    }

    #[test]
    fn test_build_job_rejects_bad_attachments() {
        let traversal = FileAttachment {
            name: "../escape".into(),
            content: String::new(),
        };
        assert!(build_job(request(Some("true"), vec![traversal])).is_err());

        let not_base64 = FileAttachment {
            name: "ok.txt".into(),
            content: "not base64!!!".into(),
        };
        assert!(build_job(request(Some("true"), vec![not_base64])).is_err());
    }
}
