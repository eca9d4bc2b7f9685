// src/queue/mod.rs
//! Broker queue integration
//!
//! The worker is a client of a central broker: it claims runs off a shared
//! queue over a websocket channel protocol, fetches each run's materials,
//! and streams progress back. Submodules:
//!
//! - **socket**: websocket transport speaking the envelope protocol
//! - **client**: typed claim/fetch operations over a transport trait
//! - **report**: per-run ordered report channel with retry
//! - **batcher**: windowed batching of guest log lines
//! - **backoff**: bounded exponential retry shared by the above

pub mod backoff;
pub mod batcher;
pub mod client;
pub mod report;
pub mod socket;

pub use backoff::{try_with_backoff, BackoffOptions};
pub use batcher::{LogBatcher, RunLogEntry};
pub use client::{BrokerTransport, ClaimedRun, QueueClient, RunMaterials, QUEUE_TOPIC};
pub use report::Reporter;
pub use socket::{Envelope, Socket};
