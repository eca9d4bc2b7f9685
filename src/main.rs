// src/main.rs
//! Relay Execution Engine
//!
//! Worker process: connects to the broker, claims runs, and executes them
//! in sandboxed isolation units until shut down.

use anyhow::Result;
use relay_engine::observability::init_tracing;
use relay_engine::orchestrator::{Orchestrator, OrchestratorConfig, PassthroughCompiler};
use relay_engine::queue::backoff::{try_with_backoff, BackoffOptions};
use relay_engine::queue::client::QueueClient;
use relay_engine::queue::socket::Socket;
use relay_engine::resolver::{AdaptorRegistry, Autoinstaller, FsRegistry, Resolver};
use relay_engine::runtime::worker_pool::{WorkerPool, WorkerPoolConfig};
use relay_engine::utils::config::EngineConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    info!("Starting Relay Execution Engine v{}", relay_engine::VERSION);

    let config = EngineConfig::load()?;
    info!("Configuration loaded: {:?}", config);

    let backoff = BackoffOptions {
        max_attempts: config.queue.max_attempts,
        min: Duration::from_millis(config.queue.backoff_min_ms),
        max: Duration::from_millis(config.queue.backoff_max_ms),
    };

    let registry: Arc<dyn AdaptorRegistry> = Arc::new(FsRegistry::new(&config.registry.dir));
    let installer = Autoinstaller::global({
        let registry = registry.clone();
        move || registry
    });
    let resolver = Arc::new(Resolver::new(registry));

    let pool = Arc::new(WorkerPool::new(
        WorkerPoolConfig {
            capacity: config.worker.pool_capacity,
            plan_timeout_ms: config.worker.plan_timeout_ms,
            step_timeout_ms: config.worker.step_timeout_ms,
            payload_limit_bytes: config.payload_limit_bytes(),
        },
        resolver,
    ));

    info!(url = %config.queue.broker_url, "connecting to broker");
    let socket = try_with_backoff(|_| Socket::connect(&config.queue.broker_url), backoff)
        .await?
        .with_reconnect_backoff(backoff);
    let client = Arc::new(QueueClient::new(Arc::new(socket), &config.queue.worker_token));

    let orchestrator = Arc::new(Orchestrator::new(
        client,
        pool,
        installer,
        Arc::new(PassthroughCompiler),
        OrchestratorConfig {
            claim_interval: Duration::from_millis(config.queue.claim_interval_ms),
            claim_demand: config.queue.claim_demand,
            log_batch_window: Duration::from_millis(config.queue.log_batch_window_ms),
            backoff,
        },
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal, cleaning up...");
            let _ = shutdown_tx.send(true);
        }
    });

    orchestrator.run(shutdown_rx).await?;
    info!("Worker stopped gracefully");
    Ok(())
}
