// src/utils/config.rs
//! Engine configuration
//!
//! Layered loading: built-in defaults, then an optional `config/engine.toml`,
//! then `RELAY_ENGINE_*` environment variables (e.g.
//! `RELAY_ENGINE_WORKER__POOL_CAPACITY=8`). The engine does not own these
//! knobs conceptually; it only consumes them.

use crate::utils::errors::Result;
use config::{Config, Environment, File};
use serde::Deserialize;

/// Top-level engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Worker pool settings
    pub worker: WorkerConfig,

    /// Queue client settings
    pub queue: QueueConfig,

    /// Local adaptor registry settings
    pub registry: RegistryConfig,

    /// Payload-size enforcement settings
    pub payload: PayloadConfig,
}

/// Worker pool settings
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Maximum concurrent isolated execution units
    pub pool_capacity: usize,

    /// Default whole-plan timeout (ms), overridable per plan
    pub plan_timeout_ms: u64,

    /// Default per-step timeout (ms), overridable per plan
    pub step_timeout_ms: u64,
}

/// Queue client settings
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Broker websocket endpoint
    pub broker_url: String,

    /// Worker token presented on connect
    pub worker_token: String,

    /// Maximum runs requested per claim
    pub claim_demand: usize,

    /// Idle delay between claim attempts (ms)
    pub claim_interval_ms: u64,

    /// Log batching flush window (ms)
    pub log_batch_window_ms: u64,

    /// Minimum backoff delay (ms)
    pub backoff_min_ms: u64,

    /// Maximum backoff delay (ms)
    pub backoff_max_ms: u64,

    /// Maximum attempts before an operation fails with
    /// "max attempts exceeded"
    pub max_attempts: u32,
}

/// Local adaptor registry settings
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Registry root directory
    pub dir: String,
}

/// Payload-size enforcement settings
#[derive(Debug, Clone, Deserialize)]
pub struct PayloadConfig {
    /// Maximum serialized payload size (MB) before redaction
    pub limit_mb: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker: WorkerConfig {
                pool_capacity: 4,
                plan_timeout_ms: 300_000,
                step_timeout_ms: 60_000,
            },
            queue: QueueConfig {
                broker_url: "ws://localhost:4000/worker".to_string(),
                worker_token: String::new(),
                claim_demand: 1,
                claim_interval_ms: 1_000,
                log_batch_window_ms: 10,
                backoff_min_ms: 100,
                backoff_max_ms: 10_000,
                max_attempts: 5,
            },
            registry: RegistryConfig {
                dir: "/tmp/relay/repo".to_string(),
            },
            payload: PayloadConfig { limit_mb: 10 },
        }
    }
}

impl EngineConfig {
    /// Load configuration from defaults, file, and environment
    pub fn load() -> Result<Self> {
        let defaults = EngineConfig::default();

        let config = Config::builder()
            .set_default("worker.pool_capacity", defaults.worker.pool_capacity as i64)?
            .set_default("worker.plan_timeout_ms", defaults.worker.plan_timeout_ms as i64)?
            .set_default("worker.step_timeout_ms", defaults.worker.step_timeout_ms as i64)?
            .set_default("queue.broker_url", defaults.queue.broker_url.clone())?
            .set_default("queue.worker_token", defaults.queue.worker_token.clone())?
            .set_default("queue.claim_demand", defaults.queue.claim_demand as i64)?
            .set_default("queue.claim_interval_ms", defaults.queue.claim_interval_ms as i64)?
            .set_default("queue.log_batch_window_ms", defaults.queue.log_batch_window_ms as i64)?
            .set_default("queue.backoff_min_ms", defaults.queue.backoff_min_ms as i64)?
            .set_default("queue.backoff_max_ms", defaults.queue.backoff_max_ms as i64)?
            .set_default("queue.max_attempts", defaults.queue.max_attempts as i64)?
            .set_default("registry.dir", defaults.registry.dir.clone())?
            .set_default("payload.limit_mb", defaults.payload.limit_mb as i64)?
            .add_source(File::with_name("config/engine").required(false))
            .add_source(Environment::with_prefix("RELAY_ENGINE").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Payload limit in bytes
    pub fn payload_limit_bytes(&self) -> usize {
        (self.payload.limit_mb as usize) * 1024 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.worker.pool_capacity, 4);
        assert_eq!(config.queue.log_batch_window_ms, 10);
        assert_eq!(config.payload.limit_mb, 10);
    }

    #[test]
    fn test_payload_limit_bytes() {
        let config = EngineConfig::default();
        assert_eq!(config.payload_limit_bytes(), 10 * 1024 * 1024);
    }
}
