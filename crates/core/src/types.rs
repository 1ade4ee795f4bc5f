//! Request and result wire types.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// =============================================================================
// Execution Result
// =============================================================================

/// Outcome of one script execution, serialized verbatim to the caller.
///
/// `success` is true only when the script exited 0 with no timeout and no
/// infrastructure failure. `error` carries a human-readable cause for
/// non-script failures and is null otherwise (including for scripts that
/// simply exit non-zero).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub execution_time: f64,
    pub error: Option<String>,
}

impl ExecutionResult {
    /// A result for an execution that failed before (or outside of) the
    /// script itself: pool exhaustion, image errors, runtime failures.
    pub fn infrastructure_failure(error: impl Into<String>, execution_time: f64) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: -1,
            execution_time,
            error: Some(error.into()),
        }
    }
}

// =============================================================================
// Script Job
// =============================================================================

/// One file delivered into the execution working directory before the
/// script runs. The name has already been validated as a safe relative path.
#[derive(Debug, Clone)]
pub struct JobFile {
    pub name: PathBuf,
    pub content: Vec<u8>,
}

/// A validated script execution job, as handed to the scheduler.
///
/// This is the post-boundary form of a request: the script is known
/// non-empty, attachments are decoded and size-checked, and the target image
/// (if any) travels separately so the scheduler can route on it.
#[derive(Debug, Clone, Default)]
pub struct ScriptJob {
    pub script: String,
    pub stdin: String,
    pub files: Vec<JobFile>,
}

impl ScriptJob {
    /// A job running just a script, no stdin or attachments.
    pub fn script(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            ..Default::default()
        }
    }
}

// =============================================================================
// File Attachment (wire form)
// =============================================================================

/// Wire form of a file attachment: a relative name plus base64 content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAttachment {
    pub name: String,
    pub content: String,
}

/// Per-file attachment size cap (decoded bytes).
pub const MAX_FILE_SIZE: usize = 10 * 1024 * 1024;
/// Total attachment size cap per request (decoded bytes).
pub const MAX_TOTAL_FILE_SIZE: usize = 50 * 1024 * 1024;
/// Maximum number of attachments per request.
pub const MAX_FILE_COUNT: usize = 64;
