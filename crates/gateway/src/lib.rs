#![deny(unused)]
//! HTTP boundary for sandpool.
//!
//! A thin axum server over the pool registry: `POST /execute` runs a script,
//! `GET /health` answers once the registry exists (pools may still be
//! warming), and `GET /metrics` serves the aggregator snapshot. Script
//! failures ride inside a 200 response body; only request validation (400)
//! and shutdown (503) surface as non-200 statuses.

pub mod server;

pub use server::{ExecuteRequest, GatewayConfig, GatewayServer};
