// src/model/mod.rs
//! Execution data model
//!
//! Portable types shared between the queue client, the orchestrator, and the
//! worker pool:
//!
//! - **Plan**: Execution plans, steps, edges, and workflow options
//! - **Specifier**: Adaptor package identities and install aliases
//! - **Error**: Severity, exit reasons, serialized errors, sandbox faults
//!
//! Everything that crosses the wire is serde-serializable.

pub mod error;
pub mod plan;
pub mod specifier;

pub use error::{ErrorPosition, ExitClass, ExitReason, RunFault, SerializedError, Severity};
pub use plan::{EdgeCondition, ExecutionPlan, LinkerOverride, NextEdges, Step, WorkflowOptions};
pub use specifier::AdaptorSpecifier;
