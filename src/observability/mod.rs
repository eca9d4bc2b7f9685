// src/observability/mod.rs
//! Tracing and logging initialization
//!
//! The engine logs through the `tracing` facade everywhere; this module wires
//! the subscriber for the worker binary. Library consumers install their own.

use crate::utils::errors::Result;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global tracing subscriber
///
/// Filter defaults to `info` for the engine and `warn` elsewhere; override
/// with `RUST_LOG`.
pub fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,relay_engine=info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    Ok(())
}
