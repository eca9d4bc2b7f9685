// src/runtime/mod.rs
//! Sandboxed plan execution
//!
//! Everything between a claimed plan and its lifecycle events:
//!
//! - **Expression**: parser for the compiled job-expression language
//! - **Sandbox**: scope-isolated evaluator with fault classification
//! - **Adaptor**: linked operation modules exposed to guest code
//! - **Worker Pool**: bounded pool of per-run isolation units
//! - **Payload**: byte-limit guard for outbound states and logs
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  Worker Pool (capacity N)               │
//! │  ┌──────────┐  ┌──────────┐  ┌──────────┐              │
//! │  │ unit     │  │ unit     │  │ unit     │  ...         │
//! │  │ thread   │  │ thread   │  │ thread   │              │
//! │  └────┬─────┘  └────┬─────┘  └────┬─────┘              │
//! │       │             │             │                     │
//! │   sandbox       sandbox       sandbox                   │
//! │   (scope)       (scope)       (scope)                   │
//! │       │             │             │                     │
//! │       └─────────────┴─────────────┘                     │
//! │                     │                                   │
//! │          lifecycle + log events (mpsc)                  │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod adaptor;
pub mod expression;
pub mod payload;
pub mod run_state;
pub mod sandbox;
pub mod worker_pool;

pub use adaptor::{LogLine, LogSink};
pub use payload::{PayloadGuard, PayloadVerdict, REDACTION_MESSAGE};
pub use run_state::{RunStatus, WorkflowRunState};
pub use sandbox::{execute, CancelToken, Scope, State};
pub use worker_pool::{PoolStats, WorkerPool, WorkerPoolConfig, WorkflowEvent};
