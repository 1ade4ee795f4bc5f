//! Error types for sandpool.

use thiserror::Error;

/// Result type alias using sandpool's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for sandpool.
///
/// Each variant corresponds to one failure kind observable at the service
/// boundary, either as an HTTP status (validation, shutdown) or as the
/// `error` field of an execution result. Messages never embed container ids.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Request boundary
    // =========================================================================
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Service is shutting down")]
    ShuttingDown,

    #[error("Execution canceled: {0}")]
    Canceled(String),

    // =========================================================================
    // Image acquisition
    // =========================================================================
    #[error("Image resolve failed: {0}")]
    ImageResolve(String),

    #[error("Image pull failed: {0}")]
    ImagePull(String),

    // =========================================================================
    // Sandbox lifecycle
    // =========================================================================
    #[error("Sandbox creation failed: {0}")]
    SandboxCreation(String),

    #[error("No sandbox available in pool '{pool}' within the acquire deadline")]
    PoolExhausted { pool: String },

    #[error("execution timeout")]
    ExecutionTimeout,

    #[error("Container runtime error: {0}")]
    RuntimeApi(String),

    // =========================================================================
    // Generic
    // =========================================================================
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an image resolve error.
    pub fn image_resolve(msg: impl Into<String>) -> Self {
        Self::ImageResolve(msg.into())
    }

    /// Create an image pull error.
    pub fn image_pull(msg: impl Into<String>) -> Self {
        Self::ImagePull(msg.into())
    }

    /// Create a sandbox creation error.
    pub fn sandbox_creation(msg: impl Into<String>) -> Self {
        Self::SandboxCreation(msg.into())
    }

    /// Create a runtime API error.
    pub fn runtime_api(msg: impl Into<String>) -> Self {
        Self::RuntimeApi(msg.into())
    }
}
