// src/model/error.rs
//! Failure classification for sandboxed runs
//!
//! Three layers, innermost first:
//!
//! - [`RunFault`]: what the sandbox raises, a classified fault with a
//!   severity and, where derivable, a source position.
//! - [`SerializedError`]: the structured wire form attached to step and run
//!   reports. Aborted runs never surface a bare stack trace without these
//!   fields.
//! - [`ExitReason`]: the final outcome label the broker uses for run
//!   bookkeeping. The reason strings are a stable wire contract.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification controlling whether a fault aborts a plan
///
/// `crash` and `kill` abort; `fail` is recorded into the run's per-step
/// error map and the plan may continue, depending on edge configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Fail,
    Crash,
    Kill,
}

/// Final outcome label reported to the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitClass {
    Success,
    Fail,
    Crash,
    Kill,
    Cancel,
    Exception,
}

impl ExitClass {
    /// Stable wire string
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitClass::Success => "success",
            ExitClass::Fail => "fail",
            ExitClass::Crash => "crash",
            ExitClass::Kill => "kill",
            ExitClass::Cancel => "cancel",
            ExitClass::Exception => "exception",
        }
    }
}

/// Exit reason attached to run-complete and step-complete reports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitReason {
    pub reason: ExitClass,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

impl ExitReason {
    pub fn success() -> Self {
        Self {
            reason: ExitClass::Success,
            error_message: None,
            error_type: None,
        }
    }

    /// Outbound final state exceeded the transport limit; the run cannot
    /// safely continue once its state is unrepresentable within limits.
    pub fn payload_too_large() -> Self {
        Self {
            reason: ExitClass::Kill,
            error_message: Some("final state exceeded payload size limit".to_string()),
            error_type: Some("PAYLOAD_TOO_LARGE".to_string()),
        }
    }

    pub fn exception(error_type: &str, message: &str) -> Self {
        Self {
            reason: ExitClass::Exception,
            error_message: Some(message.to_string()),
            error_type: Some(error_type.to_string()),
        }
    }

    pub fn from_fault(fault: &RunFault) -> Self {
        Self {
            reason: fault.exit,
            error_message: Some(fault.message.clone()),
            error_type: Some(fault.name.clone()),
        }
    }
}

/// Source position within a failing expression, 1-based
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPosition {
    pub line: u32,
    pub column: u32,

    /// The offending source line, when available
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
}

/// Structured error shape attached to reports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedError {
    /// Which component produced the error (e.g. "sandbox", "resolver")
    pub source: String,

    /// Error name (e.g. "CompileError", "TypeError")
    pub name: String,

    pub severity: Severity,

    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<ErrorPosition>,
}

/// A classified fault raised while executing a sandboxed expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFault {
    /// Error name surfaced to the user
    pub name: String,

    pub message: String,

    pub severity: Severity,

    /// Exit class the run reports if this fault aborts it
    pub exit: ExitClass,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<ErrorPosition>,

    /// Id of the step the fault occurred in, filled by the worker pool
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
}

impl RunFault {
    /// Source malformed; always fatal to the run
    pub fn compile_error(message: impl Into<String>, position: ErrorPosition) -> Self {
        Self {
            name: "CompileError".to_string(),
            message: message.into(),
            severity: Severity::Crash,
            exit: ExitClass::Crash,
            position: Some(position),
            step: None,
        }
    }

    /// Reference to an undeclared identifier at run time
    pub fn reference_error(ident: &str, position: ErrorPosition) -> Self {
        Self {
            name: "ReferenceError".to_string(),
            message: format!("{} is not defined", ident),
            severity: Severity::Crash,
            exit: ExitClass::Crash,
            position: Some(position),
            step: None,
        }
    }

    /// Runtime type fault inside a step; recoverable
    pub fn type_error(message: impl Into<String>, position: ErrorPosition) -> Self {
        Self {
            name: "TypeError".to_string(),
            message: message.into(),
            severity: Severity::Fail,
            exit: ExitClass::Fail,
            position: Some(position),
            step: None,
        }
    }

    /// Error thrown by adaptor code; severity is adaptor-defined and
    /// defaults to `fail`
    pub fn adaptor_error(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            severity: Severity::Fail,
            exit: ExitClass::Fail,
            position: None,
            step: None,
        }
    }

    /// Plan or step deadline exceeded
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            name: "TimeoutError".to_string(),
            message: message.into(),
            severity: Severity::Kill,
            exit: ExitClass::Kill,
            position: None,
            step: None,
        }
    }

    /// External cancellation propagated into the sandbox
    pub fn cancelled() -> Self {
        Self {
            name: "CancelledError".to_string(),
            message: "run cancelled".to_string(),
            severity: Severity::Kill,
            exit: ExitClass::Cancel,
            position: None,
            step: None,
        }
    }

    /// Whether this fault aborts the whole plan
    pub fn is_fatal(&self) -> bool {
        self.severity != Severity::Fail
    }

    pub fn with_step(mut self, step_id: &str) -> Self {
        self.step = Some(step_id.to_string());
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self.exit = match severity {
            Severity::Fail => ExitClass::Fail,
            Severity::Crash => ExitClass::Crash,
            Severity::Kill => ExitClass::Kill,
        };
        self
    }

    /// Wire form attached to reports
    pub fn to_serialized(&self, source: &str) -> SerializedError {
        SerializedError {
            source: source.to_string(),
            name: self.name.clone(),
            severity: self.severity,
            message: self.message.clone(),
            details: self.step.as_ref().map(|s| serde_json::json!({ "step": s })),
            stack: None,
            position: self.position.clone(),
        }
    }
}

impl fmt::Display for RunFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for RunFault {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_class_wire_strings() {
        assert_eq!(serde_json::to_string(&ExitClass::Success).unwrap(), "\"success\"");
        assert_eq!(serde_json::to_string(&ExitClass::Kill).unwrap(), "\"kill\"");
        assert_eq!(serde_json::to_string(&ExitClass::Exception).unwrap(), "\"exception\"");
    }

    #[test]
    fn test_compile_error_is_fatal() {
        let fault = RunFault::compile_error(
            "unexpected token",
            ErrorPosition { line: 1, column: 4, src: None },
        );
        assert!(fault.is_fatal());
        assert_eq!(fault.exit, ExitClass::Crash);
    }

    #[test]
    fn test_type_error_is_recoverable() {
        let fault = RunFault::type_error(
            "s is not a function",
            ErrorPosition { line: 1, column: 11, src: None },
        );
        assert!(!fault.is_fatal());
        assert_eq!(fault.severity, Severity::Fail);
    }

    #[test]
    fn test_adaptor_severity_override() {
        let fault = RunFault::adaptor_error("HttpError", "502 upstream").with_severity(Severity::Crash);
        assert!(fault.is_fatal());
        assert_eq!(fault.exit, ExitClass::Crash);
    }

    #[test]
    fn test_exit_reason_from_fault() {
        let fault = RunFault::reference_error(
            "x",
            ErrorPosition { line: 1, column: 11, src: Some("fn((s) => x)".to_string()) },
        );
        let reason = ExitReason::from_fault(&fault);
        assert_eq!(reason.reason, ExitClass::Crash);
        assert_eq!(reason.error_type.as_deref(), Some("ReferenceError"));
    }

    #[test]
    fn test_serialized_error_has_structured_fields() {
        let fault = RunFault::reference_error(
            "x",
            ErrorPosition { line: 1, column: 11, src: None },
        ).with_step("job-1");
        let err = fault.to_serialized("sandbox");
        assert_eq!(err.source, "sandbox");
        assert_eq!(err.name, "ReferenceError");
        assert_eq!(err.position.as_ref().unwrap().column, 11);
        assert!(err.details.is_some());
    }
}
