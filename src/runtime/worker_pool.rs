// src/runtime/worker_pool.rs
//! Bounded worker pool
//!
//! Executes plans on dedicated OS threads, at most `capacity` concurrently.
//! Admission is a fair semaphore, so waiting dispatches are served in FIFO
//! order. Each admitted plan gets a fresh isolation unit: its own thread, its
//! own single-threaded runtime, its own scope chain. Nothing a guest
//! expression does can leak into another run.
//!
//! # Architecture
//!
//! - `dispatch` acquires a permit, registers the run, spawns the unit thread
//!   and hands back an event receiver. The permit travels into the thread and
//!   is released when the unit finishes.
//! - The unit thread walks the plan's step graph, linking and executing one
//!   step at a time. Guest logs stream out as events while a step runs.
//! - `fail`-severity faults are recorded into the run state's error map and
//!   traversal continues along matching edges; `crash`/`kill` faults and
//!   cancellations abort the plan.
//! - A panic inside a unit is caught at the thread boundary and reported as
//!   a `workflow-error`, leaving the pool itself intact.

use crate::model::error::{ExitReason, SerializedError, Severity};
use crate::model::plan::ExecutionPlan;
use crate::resolver::Resolver;
use crate::runtime::adaptor::LogLine;
use crate::runtime::payload::PayloadGuard;
use crate::runtime::run_state::WorkflowRunState;
use crate::runtime::sandbox::{self, CancelToken, State};
use crate::utils::errors::{EngineError, Result};
use dashmap::DashMap;
use serde_json::json;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Maximum concurrently-executing plans
    pub capacity: usize,

    /// Default whole-plan timeout (ms), overridable per plan
    pub plan_timeout_ms: u64,

    /// Default per-step timeout (ms), overridable per plan
    pub step_timeout_ms: u64,

    /// Byte limit applied to outbound states and log messages
    pub payload_limit_bytes: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            capacity: 4,
            plan_timeout_ms: 300_000,
            step_timeout_ms: 60_000,
            payload_limit_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Lifecycle events emitted by an isolation unit, in execution order
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    WorkflowStart {
        run_id: String,
        thread_id: String,
    },
    StepStart {
        run_id: String,
        step_id: String,
        thread_id: String,
    },
    StepLog {
        run_id: String,
        step_id: String,
        level: String,
        message: serde_json::Value,
        redacted: bool,
    },
    StepComplete {
        run_id: String,
        step_id: String,
        state: State,
        error: Option<SerializedError>,
        duration_ms: u64,
        redacted: bool,
    },
    WorkflowComplete {
        run_id: String,
        final_state: State,
        duration_ms: u64,
        redacted: bool,
    },
    WorkflowError {
        run_id: String,
        error: SerializedError,
        reason: ExitReason,
    },
}

/// Point-in-time pool occupancy
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub capacity: usize,
    pub free: usize,
    pub active: usize,
}

struct RunRecord {
    state: WorkflowRunState,
    cancel: CancelToken,
}

pub struct WorkerPool {
    config: WorkerPoolConfig,
    resolver: Arc<Resolver>,
    semaphore: Arc<Semaphore>,
    runs: Arc<DashMap<String, RunRecord>>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, resolver: Arc<Resolver>) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.capacity));
        Self {
            config,
            resolver,
            semaphore,
            runs: Arc::new(DashMap::new()),
        }
    }

    /// Admit a plan and execute it on a fresh isolation unit
    ///
    /// Waits for a free slot if the pool is full. The returned receiver
    /// yields every lifecycle event of the run; the last event is always
    /// `WorkflowComplete` or `WorkflowError`.
    pub async fn dispatch(&self, plan: ExecutionPlan) -> Result<UnboundedReceiver<WorkflowEvent>> {
        plan.validate()?;

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EngineError::PoolExhausted)?;

        let run_id = plan.id.clone();
        let cancel = CancelToken::new();
        self.runs.insert(
            run_id.clone(),
            RunRecord {
                state: WorkflowRunState::new(&run_id),
                cancel: cancel.clone(),
            },
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let config = self.config.clone();
        let resolver = self.resolver.clone();
        let runs = self.runs.clone();

        debug!(run_id = %run_id, "dispatching plan to isolation unit");

        std::thread::Builder::new()
            .name(format!("unit-{}", run_id))
            .spawn(move || {
                let _permit = permit;
                unit_main(plan, tx, cancel, config, resolver, runs);
            })
            .map_err(|e| EngineError::Runtime(format!("cannot spawn unit thread: {}", e)))?;

        Ok(rx)
    }

    /// Request cancellation of a running plan
    pub fn cancel(&self, run_id: &str) -> Result<()> {
        let record = self
            .runs
            .get(run_id)
            .ok_or_else(|| EngineError::TaskNotFound(run_id.to_string()))?;
        info!(run_id, "cancellation requested");
        record.cancel.cancel();
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.config.capacity,
            free: self.semaphore.available_permits(),
            active: self.runs.len(),
        }
    }
}

/// Thread entrypoint for one isolation unit
fn unit_main(
    plan: ExecutionPlan,
    events: UnboundedSender<WorkflowEvent>,
    cancel: CancelToken,
    config: WorkerPoolConfig,
    resolver: Arc<Resolver>,
    runs: Arc<DashMap<String, RunRecord>>,
) {
    let run_id = plan.id.clone();
    let started = Instant::now();

    let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            report_unit_failure(&events, &runs, &run_id, started, &e.to_string());
            return;
        }
    };

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        rt.block_on(run_plan(&plan, &events, &cancel, &config, &resolver, &runs))
    }));

    if let Err(panic) = outcome {
        let message = panic_message(panic);
        warn!(run_id = %run_id, message = %message, "isolation unit crashed");
        report_unit_failure(&events, &runs, &run_id, started, &message);
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unit panicked".to_string()
    }
}

fn report_unit_failure(
    events: &UnboundedSender<WorkflowEvent>,
    runs: &DashMap<String, RunRecord>,
    run_id: &str,
    started: Instant,
    message: &str,
) {
    let error = SerializedError {
        source: "pool".to_string(),
        name: "UnitCrashError".to_string(),
        severity: Severity::Crash,
        message: message.to_string(),
        details: None,
        stack: None,
        position: None,
    };
    if let Some(mut record) = runs.get_mut(run_id) {
        record.state.mark_error(error.clone(), started.elapsed().as_millis() as u64);
    }
    let _ = events.send(WorkflowEvent::WorkflowError {
        run_id: run_id.to_string(),
        error,
        reason: ExitReason::exception("UnitCrashError", message),
    });
    runs.remove(run_id);
}

async fn run_plan(
    plan: &ExecutionPlan,
    events: &UnboundedSender<WorkflowEvent>,
    cancel: &CancelToken,
    config: &WorkerPoolConfig,
    resolver: &Resolver,
    runs: &DashMap<String, RunRecord>,
) {
    let run_id = plan.id.clone();
    let thread_id = format!("{:?}", std::thread::current().id());
    let started = Instant::now();
    let guard = PayloadGuard::new(config.payload_limit_bytes);

    if let Some(mut record) = runs.get_mut(&run_id) {
        record.state.mark_running(&thread_id);
    }
    let _ = events.send(WorkflowEvent::WorkflowStart {
        run_id: run_id.clone(),
        thread_id: thread_id.clone(),
    });

    let plan_timeout = plan.options.timeout_ms.unwrap_or(config.plan_timeout_ms);
    let plan_cancel = cancel.with_deadline(started + Duration::from_millis(plan_timeout));
    let step_timeout = plan.options.step_timeout_ms.unwrap_or(config.step_timeout_ms);

    // One log channel per plan; a sender is kept alive here so recv never
    // closes mid-run.
    let (log_tx, mut log_rx) = mpsc::unbounded_channel::<LogLine>();

    let initial = match plan.initial_step() {
        Some(step) => step,
        None => return,
    };

    let mut queue: VecDeque<(String, State)> = VecDeque::new();
    queue.push_back((
        initial.id.clone(),
        initial.state.clone().unwrap_or_else(|| json!({})),
    ));
    let mut executed: HashSet<String> = HashSet::new();
    let mut final_state: State = json!({});

    while let Some((step_id, mut input)) = queue.pop_front() {
        if !executed.insert(step_id.clone()) {
            continue;
        }
        // validated plans always resolve their edge targets
        let step = match plan.step(&step_id) {
            Some(step) => step,
            None => continue,
        };

        if !step.is_job() {
            // trigger node: route only
            final_state = input.clone();
            if plan.options.end.as_deref() == Some(step_id.as_str()) {
                break;
            }
            if let Some(next) = &step.next {
                for target in next.targets(false) {
                    queue.push_back((target.to_string(), input.clone()));
                }
            }
            continue;
        }

        let _ = events.send(WorkflowEvent::StepStart {
            run_id: run_id.clone(),
            step_id: step_id.clone(),
            thread_id: thread_id.clone(),
        });

        let scope = match resolver.link(step, log_tx.clone()).await {
            Ok(scope) => scope,
            Err(e) => {
                let message = e.to_string();
                let error = SerializedError {
                    source: "resolver".to_string(),
                    name: "ResolutionError".to_string(),
                    severity: Severity::Crash,
                    message: message.clone(),
                    details: Some(json!({ "step": step_id })),
                    stack: None,
                    position: None,
                };
                if let Some(mut record) = runs.get_mut(&run_id) {
                    record.state.mark_error(error.clone(), started.elapsed().as_millis() as u64);
                }
                let _ = events.send(WorkflowEvent::WorkflowError {
                    run_id: run_id.clone(),
                    error,
                    reason: ExitReason::exception("ResolutionError", &message),
                });
                runs.remove(&run_id);
                return;
            }
        };

        if let (Some(cfg), Some(obj)) = (&step.configuration, input.as_object_mut()) {
            obj.insert("configuration".to_string(), cfg.clone());
        }

        let step_started = Instant::now();
        let step_cancel = plan_cancel.with_deadline(step_started + Duration::from_millis(step_timeout));

        // expression is present: is_job() held above
        let source = step.expression.as_deref().unwrap_or_default();
        let exec = sandbox::execute(source, input.clone(), &scope, &step_cancel);
        tokio::pin!(exec);

        let outcome = loop {
            tokio::select! {
                biased;
                line = log_rx.recv() => {
                    if let Some(line) = line {
                        emit_log(events, &guard, &run_id, &step_id, line);
                    }
                }
                result = &mut exec => break result,
            }
        };
        // logs sent during the final poll of the expression
        while let Ok(line) = log_rx.try_recv() {
            emit_log(events, &guard, &run_id, &step_id, line);
        }

        let duration_ms = step_started.elapsed().as_millis() as u64;

        match outcome {
            Ok(state) => {
                let (out, verdict) = guard.outbound(&state);
                let _ = events.send(WorkflowEvent::StepComplete {
                    run_id: run_id.clone(),
                    step_id: step_id.clone(),
                    state: out,
                    error: None,
                    duration_ms,
                    redacted: verdict.is_redacted(),
                });
                final_state = state.clone();
                if plan.options.end.as_deref() == Some(step_id.as_str()) {
                    break;
                }
                if let Some(next) = &step.next {
                    for target in next.targets(false) {
                        queue.push_back((target.to_string(), state.clone()));
                    }
                }
            }
            Err(fault) if !fault.is_fatal() => {
                let fault = fault.with_step(&step_id);
                let serialized = fault.to_serialized("sandbox");
                debug!(run_id = %run_id, step_id = %step_id, fault = %fault, "step failed, continuing");

                // record the fault into the forwarded state's error map
                let mut next_state = input.clone();
                if let Some(obj) = next_state.as_object_mut() {
                    let errors = obj
                        .entry("errors".to_string())
                        .or_insert_with(|| json!({}));
                    if let Some(map) = errors.as_object_mut() {
                        map.insert(
                            step_id.clone(),
                            serde_json::to_value(&serialized).unwrap_or(serde_json::Value::Null),
                        );
                    }
                }

                let (out, verdict) = guard.outbound(&next_state);
                let _ = events.send(WorkflowEvent::StepComplete {
                    run_id: run_id.clone(),
                    step_id: step_id.clone(),
                    state: out,
                    error: Some(serialized),
                    duration_ms,
                    redacted: verdict.is_redacted(),
                });
                final_state = next_state.clone();
                if plan.options.end.as_deref() == Some(step_id.as_str()) {
                    break;
                }
                if let Some(next) = &step.next {
                    for target in next.targets(true) {
                        queue.push_back((target.to_string(), next_state.clone()));
                    }
                }
            }
            Err(fault) => {
                let fault = fault.with_step(&step_id);
                let serialized = fault.to_serialized("sandbox");
                let reason = ExitReason::from_fault(&fault);
                warn!(run_id = %run_id, step_id = %step_id, fault = %fault, "plan aborted");

                if let Some(mut record) = runs.get_mut(&run_id) {
                    record
                        .state
                        .mark_error(serialized.clone(), started.elapsed().as_millis() as u64);
                }
                let _ = events.send(WorkflowEvent::WorkflowError {
                    run_id: run_id.clone(),
                    error: serialized,
                    reason,
                });
                runs.remove(&run_id);
                return;
            }
        }
    }

    let duration_ms = started.elapsed().as_millis() as u64;
    let (out, verdict) = guard.outbound(&final_state);
    if let Some(mut record) = runs.get_mut(&run_id) {
        record.state.mark_complete(final_state, duration_ms);
    }
    let _ = events.send(WorkflowEvent::WorkflowComplete {
        run_id: run_id.clone(),
        final_state: out,
        duration_ms,
        redacted: verdict.is_redacted(),
    });
    runs.remove(&run_id);
    debug!(run_id = %run_id, duration_ms, "plan complete");
}

fn emit_log(
    events: &UnboundedSender<WorkflowEvent>,
    guard: &PayloadGuard,
    run_id: &str,
    step_id: &str,
    line: LogLine,
) {
    let (message, verdict) = guard.guarded(&line.message);
    let _ = events.send(WorkflowEvent::StepLog {
        run_id: run_id.to_string(),
        step_id: step_id.to_string(),
        level: line.level,
        message,
        redacted: verdict.is_redacted(),
    });
}
