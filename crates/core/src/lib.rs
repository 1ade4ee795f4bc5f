#![deny(unused)]
//! Core types, errors, and configuration for sandpool.
//!
//! This crate provides the foundational building blocks shared across all
//! layers of the service: the error enum, the execution request/result wire
//! types, environment-driven configuration, and filesystem path policy for
//! attachment names.

pub mod config;
pub mod error;
pub mod fs_policy;
pub mod telemetry;
pub mod types;

pub use config::AppConfig;
pub use error::{Error, Result};
pub use types::{ExecutionResult, FileAttachment, JobFile, ScriptJob};
