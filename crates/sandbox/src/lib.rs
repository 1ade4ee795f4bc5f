#![deny(unused)]
//! Sandbox layer for sandpool.
//!
//! This crate owns everything that touches the container runtime: a thin
//! facade over the Docker API (with an in-memory mock for tests), image
//! resolution and pulling, sandbox creation with a fixed security profile,
//! and the per-container execution protocol.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────┐
//! │  Scheduler (pools, dispatch)           │
//! │    ↓ leases a handle                   │
//! ├────────────────────────────────────────┤
//! │  ExecutionEngine (script protocol)     │
//! │  SandboxFactory  (create + start)      │
//! │  ImageResolver   (canonicalize + pull) │
//! │    ↓ normalized calls                  │
//! ├────────────────────────────────────────┤
//! │  ContainerRuntime facade (bollard)     │
//! ├────────────────────────────────────────┤
//! │  Docker container (isolated)           │
//! │    /tmp  (tmpfs, writable)             │
//! │    No network, no root fs writes,      │
//! │    no capabilities, sleep infinity     │
//! └────────────────────────────────────────┘
//! ```

pub mod exec;
pub mod factory;
pub mod image;
pub mod runtime;

pub use exec::{ExecutionEngine, MAX_OUTPUT_BYTES, MAX_SANDBOX_EXECUTIONS};
pub use factory::{SandboxFactory, SandboxHandle};
pub use image::ImageResolver;
pub use runtime::{
    ContainerRuntime, ContainerState, DockerRuntime, ExecOutput, MockRuntime, SandboxProfile,
};
