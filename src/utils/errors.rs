// src/utils/errors.rs
//! Engine-wide error taxonomy
//!
//! Faults raised *inside* a sandboxed expression are classified separately as
//! [`crate::model::error::RunFault`] (they carry severity and source
//! positions). `EngineError` covers everything the engine itself can fail
//! with: plan validation, installs, pool routing, transport, configuration.

use thiserror::Error;

/// Engine-wide result type
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors produced by the engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// The claimed plan does not satisfy the data-model invariants
    #[error("invalid execution plan: {0}")]
    InvalidPlan(String),

    /// Adaptor installation failed
    #[error("failed to install adaptor '{alias}': {reason}")]
    InstallFailed { alias: String, reason: String },

    /// The local adaptor registry could not be validated or created.
    /// Fatal: every subsequent run depends on the registry.
    #[error("adaptor registry bootstrap failed: {0}")]
    RegistryBootstrap(String),

    /// A job referenced an adaptor that is not installed and was not
    /// eligible for autoinstall
    #[error("adaptor '{0}' is not installed")]
    AdaptorNotInstalled(String),

    /// An event or report referenced a run the pool does not know about
    /// (internal routing fault between pool units)
    #[error("no active run with id '{0}'")]
    TaskNotFound(String),

    /// The worker pool could not admit the plan
    #[error("worker pool exhausted")]
    PoolExhausted,

    /// Retries under backoff were exhausted. The message is part of the
    /// wire contract and must stay stable.
    #[error("max attempts exceeded")]
    MaxAttemptsExceeded,

    /// Websocket / channel transport failure
    #[error("transport error: {0}")]
    Transport(String),

    /// The broker replied with something the protocol does not allow
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Catch-all for runtime faults with no dedicated variant
    #[error("runtime error: {0}")]
    Runtime(String),
}
