// src/runtime/run_state.rs
//! Per-run lifecycle records
//!
//! A [`WorkflowRunState`] is created when the pool dispatches a plan,
//! mutated only by the pool, and removed when the run settles. External
//! components observe runs through emitted events, never by touching these
//! records.

use crate::model::error::SerializedError;
use crate::runtime::sandbox::State;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Plan lifecycle: `Pending → Running → {Complete | Error}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Complete,
    Error,
}

/// Mutable record owned by the worker pool for the lifetime of one plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRunState {
    pub id: String,
    pub status: RunStatus,

    /// Identity of the isolation unit executing the plan
    pub thread_id: Option<String>,

    pub start_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,

    pub error: Option<SerializedError>,
    pub result: Option<State>,
}

impl WorkflowRunState {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            status: RunStatus::Pending,
            thread_id: None,
            start_time: None,
            duration_ms: None,
            error: None,
            result: None,
        }
    }

    pub fn mark_running(&mut self, thread_id: &str) {
        self.status = RunStatus::Running;
        self.thread_id = Some(thread_id.to_string());
        self.start_time = Some(Utc::now());
    }

    pub fn mark_complete(&mut self, result: State, duration_ms: u64) {
        self.status = RunStatus::Complete;
        self.result = Some(result);
        self.duration_ms = Some(duration_ms);
    }

    pub fn mark_error(&mut self, error: SerializedError, duration_ms: u64) {
        self.status = RunStatus::Error;
        self.error = Some(error);
        self.duration_ms = Some(duration_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::error::{RunFault, ErrorPosition};

    #[test]
    fn test_lifecycle_transitions() {
        let mut state = WorkflowRunState::new("run-1");
        assert_eq!(state.status, RunStatus::Pending);

        state.mark_running("ThreadId(7)");
        assert_eq!(state.status, RunStatus::Running);
        assert!(state.start_time.is_some());

        state.mark_complete(serde_json::json!({"done": true}), 12);
        assert_eq!(state.status, RunStatus::Complete);
        assert_eq!(state.duration_ms, Some(12));
    }

    #[test]
    fn test_error_transition_keeps_structured_error() {
        let mut state = WorkflowRunState::new("run-1");
        state.mark_running("ThreadId(7)");
        let fault = RunFault::reference_error(
            "x",
            ErrorPosition { line: 1, column: 11, src: None },
        );
        state.mark_error(fault.to_serialized("sandbox"), 3);
        assert_eq!(state.status, RunStatus::Error);
        assert_eq!(state.error.as_ref().unwrap().name, "ReferenceError");
    }
}
