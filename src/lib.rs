// src/lib.rs
//! Relay Execution Engine Library
//!
//! A worker for a distributed job-execution platform: it claims runs from a
//! central broker, resolves and autoinstalls the adaptors those runs depend
//! on, executes their expressions inside sandboxed isolation units, and
//! streams progress back over the broker's channel protocol.
//!
//! # Architecture
//!
//! The engine is structured into several key modules:
//!
//! - **model**: execution plans, adaptor specifiers, fault taxonomy
//! - **runtime**: expression parsing, sandboxed execution, the worker pool
//! - **resolver**: adaptor registry, autoinstall coordination, module linking
//! - **queue**: broker transport, claims, report channel, log batching
//! - **orchestrator**: the claim loop gluing queue and pool together
//! - **observability**: tracing/logging setup
//! - **utils**: configuration and error types

// Public module exports
pub mod model;
pub mod observability;
pub mod orchestrator;
pub mod queue;
pub mod resolver;
pub mod runtime;
pub mod utils;

// Re-export commonly used types
pub use model::error::{ExitClass, ExitReason, RunFault, Severity};
pub use model::plan::ExecutionPlan;
pub use runtime::worker_pool::{WorkerPool, WorkerPoolConfig, WorkflowEvent};
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
