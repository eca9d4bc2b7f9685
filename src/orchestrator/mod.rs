// src/orchestrator/mod.rs
//! Run orchestration
//!
//! Glues the queue client to the worker pool. A periodic claim loop asks the
//! broker for as many runs as the pool has free slots; each claimed run is
//! handled end to end on its own task:
//!
//! 1. join the run topic, fetch the plan and its starting dataclip
//! 2. ensure adaptors are installed (a run whose adaptors cannot be
//!    installed is completed as `exception` and never dispatched)
//! 3. compile expressions and dispatch to the pool
//! 4. translate pool events into ordered reports (logs batched), then send
//!    the final `run:complete` with the computed exit reason
//!
//! A final state the payload guard had to redact completes the run as
//! `kill` / `PAYLOAD_TOO_LARGE`: the broker must never store a truncated
//! dataclip as if it were real output.

pub mod compiler;

pub use compiler::{ExpressionCompiler, PassthroughCompiler};

use crate::model::error::{ExitReason, SerializedError};
use crate::queue::backoff::{try_with_backoff, BackoffOptions};
use crate::queue::batcher::{LogBatcher, RunLogEntry};
use crate::queue::client::{ClaimedRun, QueueClient};
use crate::queue::report::Reporter;
use crate::runtime::worker_pool::{WorkerPool, WorkflowEvent};
use crate::resolver::Autoinstaller;
use crate::utils::errors::{EngineError, Result};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How often the claim loop polls the broker
    pub claim_interval: Duration,

    /// Upper bound on runs claimed per tick, further bounded by free pool
    /// slots
    pub claim_demand: usize,

    /// Batching window for guest log lines
    pub log_batch_window: Duration,

    /// Retry policy for claims and reports
    pub backoff: BackoffOptions,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            claim_interval: Duration::from_millis(1000),
            claim_demand: 1,
            log_batch_window: Duration::from_millis(10),
            backoff: BackoffOptions::default(),
        }
    }
}

pub struct Orchestrator {
    client: Arc<QueueClient>,
    pool: Arc<WorkerPool>,
    installer: Arc<Autoinstaller>,
    compiler: Arc<dyn ExpressionCompiler>,
    config: OrchestratorConfig,

    /// Set by a run task that hit an unrecoverable error; stops the claim
    /// loop and takes the worker down
    fatal: Mutex<Option<EngineError>>,
    fatal_tx: watch::Sender<bool>,
}

impl Orchestrator {
    pub fn new(
        client: Arc<QueueClient>,
        pool: Arc<WorkerPool>,
        installer: Arc<Autoinstaller>,
        compiler: Arc<dyn ExpressionCompiler>,
        config: OrchestratorConfig,
    ) -> Self {
        let (fatal_tx, _) = watch::channel(false);
        Self {
            client,
            pool,
            installer,
            compiler,
            config,
            fatal: Mutex::new(None),
            fatal_tx,
        }
    }

    /// Claim loop; returns when `shutdown` flips
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        try_with_backoff(|_| self.client.join_queue(), self.config.backoff).await?;
        info!("joined claim queue");

        let mut interval = tokio::time::interval(self.config.claim_interval);
        let mut fatal_rx = self.fatal_tx.subscribe();
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.claim_tick().await {
                        warn!(error = %e, "claim tick failed");
                    }
                }
                _ = fatal_rx.changed() => {
                    if let Some(e) = self.fatal.lock().take() {
                        error!(error = %e, "unrecoverable error, stopping worker");
                        return Err(e);
                    }
                }
                _ = shutdown.changed() => {
                    info!("shutdown requested, leaving claim loop");
                    break;
                }
            }
        }
        Ok(())
    }

    async fn claim_tick(self: &Arc<Self>) -> Result<()> {
        let demand = self.pool.stats().free.min(self.config.claim_demand);
        if demand == 0 {
            return Ok(());
        }

        let claimed = try_with_backoff(|_| self.client.claim(demand), self.config.backoff).await?;
        for run in claimed {
            let orchestrator = self.clone();
            tokio::spawn(async move {
                let run_id = run.id.clone();
                if let Err(e) = orchestrator.handle_run(run).await {
                    if matches!(e, EngineError::RegistryBootstrap(_)) {
                        *orchestrator.fatal.lock() = Some(e);
                        let _ = orchestrator.fatal_tx.send(true);
                    } else {
                        warn!(run_id = %run_id, error = %e, "run handling failed");
                    }
                }
            });
        }
        Ok(())
    }

    /// Drive one claimed run end to end
    pub async fn handle_run(&self, claim: ClaimedRun) -> Result<()> {
        let run_id = claim.id.clone();
        self.client.join_run(&claim).await?;

        let reporter = Reporter::new(
            self.client.transport(),
            QueueClient::run_topic(&run_id),
            self.config.backoff,
        );

        let outcome = self.execute_run(&run_id, &reporter).await;
        if let Err(e) = &outcome {
            // nothing was dispatched (or event translation broke); the
            // broker still gets a terminal report
            warn!(run_id = %run_id, error = %e, "run aborted before completion");
            let reason = ExitReason::exception(error_label(e), &e.to_string());
            let _ = reporter.enqueue("run:complete", serde_json::to_value(&reason)?);
        }

        reporter.close().await;
        self.client.leave_run(&run_id).await?;

        // a broken registry means no future run can install anything
        match outcome {
            Err(e @ EngineError::RegistryBootstrap(_)) => Err(e),
            _ => Ok(()),
        }
    }

    async fn execute_run(&self, run_id: &str, reporter: &Reporter) -> Result<()> {
        let materials = self.client.fetch_plan(run_id).await?;
        let mut plan = materials.plan;
        plan.validate()?;

        if let Some(clip_id) = &materials.starting_dataclip_id {
            let clip = self.client.fetch_dataclip(run_id, clip_id).await?;
            if let Some(start_id) = plan.initial_step().map(|s| s.id.clone()) {
                if let Some(step) = plan.steps.iter_mut().find(|s| s.id == start_id) {
                    if step.state.is_none() {
                        step.state = Some(clip);
                    }
                }
            }
        }

        // a step configured with a bare credential id gets the materialized
        // credential
        for index in 0..plan.steps.len() {
            let credential_id = match &plan.steps[index].configuration {
                Some(serde_json::Value::String(id)) => Some(id.clone()),
                _ => None,
            };
            if let Some(id) = credential_id {
                plan.steps[index].configuration =
                    Some(self.client.fetch_credential(run_id, &id).await?);
            }
        }

        if let Err(e) = self.installer.ensure(&plan.adaptor_specifiers()).await {
            if matches!(e, EngineError::RegistryBootstrap(_)) {
                return Err(e);
            }
            warn!(run_id, error = %e, "adaptor installation failed, run not dispatched");
            let reason = ExitReason::exception(error_label(&e), &e.to_string());
            reporter.enqueue("run:complete", serde_json::to_value(&reason)?)?;
            return Ok(());
        }

        for step in &mut plan.steps {
            if let Some(source) = step.expression.take() {
                step.expression = Some(self.compiler.compile(&source)?);
            }
        }

        reporter.enqueue("run:start", json!({}))?;

        let batcher = {
            let handle = reporter.handle();
            LogBatcher::new(self.config.log_batch_window, move |batch| {
                let _ = handle.enqueue("run:log", json!({ "logs": batch }));
            })
        };

        // broker-initiated cancellation for this run
        let cancel_watch = {
            let mut inbound = self.client.transport().subscribe();
            let topic = QueueClient::run_topic(run_id);
            let pool = self.pool.clone();
            let run_id = run_id.to_string();
            tokio::spawn(async move {
                while let Ok(envelope) = inbound.recv().await {
                    if envelope.topic == topic && envelope.event == "run:cancel" {
                        debug!(run_id = %run_id, "broker requested cancellation");
                        let _ = pool.cancel(&run_id);
                        break;
                    }
                }
            })
        };

        let mut events = self.pool.dispatch(plan).await?;
        let mut reason = ExitReason::success();
        let mut final_state = None;
        let mut terminal_error = None;
        let mut first_step_failure: Option<SerializedError> = None;

        while let Some(event) = events.recv().await {
            match event {
                WorkflowEvent::WorkflowStart { .. } => {}
                WorkflowEvent::StepStart { step_id, .. } => {
                    reporter.enqueue("step:start", json!({ "step_id": step_id }))?;
                }
                WorkflowEvent::StepLog { step_id, level, message, .. } => {
                    batcher.push(RunLogEntry::new(Some(step_id), &level, message));
                }
                WorkflowEvent::StepComplete { step_id, state, error, duration_ms, redacted, .. } => {
                    if let Some(error) = &error {
                        if first_step_failure.is_none() {
                            first_step_failure = Some(error.clone());
                        }
                    }
                    reporter.enqueue(
                        "step:complete",
                        json!({
                            "step_id": step_id,
                            "output": state,
                            "error": error,
                            "duration_ms": duration_ms,
                            "redacted": redacted,
                        }),
                    )?;
                }
                WorkflowEvent::WorkflowComplete { final_state: state, redacted, .. } => {
                    if redacted {
                        reason = ExitReason::payload_too_large();
                    } else if let Some(failure) = &first_step_failure {
                        // a recovered step failure still colors the run
                        reason = ExitReason {
                            reason: crate::model::error::ExitClass::Fail,
                            error_message: Some(failure.message.clone()),
                            error_type: Some(failure.name.clone()),
                        };
                        final_state = Some(state);
                    } else {
                        reason = ExitReason::success();
                        final_state = Some(state);
                    }
                }
                WorkflowEvent::WorkflowError { reason: terminal, error, .. } => {
                    reason = terminal;
                    terminal_error = Some(error);
                }
            }
        }

        cancel_watch.abort();
        batcher.flush();

        let mut payload = serde_json::to_value(&reason)?;
        if let Some(state) = final_state {
            payload["final_state"] = state;
        }
        if let Some(error) = terminal_error {
            payload["error"] = serde_json::to_value(&error)?;
        }
        reporter.enqueue("run:complete", payload)?;
        debug!(run_id, exit = reason.reason.as_str(), "run settled");
        Ok(())
    }
}

/// Error-type label attached to exception exits
fn error_label(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidPlan(_) => "ValidationError",
        EngineError::InstallFailed { .. } => "InstallError",
        EngineError::RegistryBootstrap(_) => "RegistryError",
        EngineError::AdaptorNotInstalled(_) => "ResolutionError",
        EngineError::Transport(_) | EngineError::MaxAttemptsExceeded => "TransportError",
        EngineError::Protocol(_) => "ProtocolError",
        _ => "RuntimeError",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_labels() {
        assert_eq!(error_label(&EngineError::InvalidPlan("x".to_string())), "ValidationError");
        assert_eq!(
            error_label(&EngineError::InstallFailed {
                alias: "a".to_string(),
                reason: "r".to_string()
            }),
            "InstallError"
        );
        assert_eq!(error_label(&EngineError::MaxAttemptsExceeded), "TransportError");
    }
}
