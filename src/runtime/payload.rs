// src/runtime/payload.rs
//! Payload size enforcement
//!
//! Step results and guest log messages crossing the pool boundary are
//! measured against a configured byte limit. Oversized values are replaced
//! with a redaction marker rather than dropped, so every lifecycle event is
//! still emitted and run execution continues. Whether a redacted *final*
//! state dooms the run is the orchestrator's call, not ours.

use serde::{Deserialize, Serialize};

/// Replacement value for an oversized payload
pub const REDACTION_MESSAGE: &str = "[REDACTED: payload exceeded size limit]";

/// Outcome of passing a value through the guard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadVerdict {
    Ok,
    Redacted,
}

impl PayloadVerdict {
    pub fn is_redacted(&self) -> bool {
        matches!(self, PayloadVerdict::Redacted)
    }
}

/// Byte-limit guard applied to states and log messages leaving a run
#[derive(Debug, Clone, Copy)]
pub struct PayloadGuard {
    limit_bytes: usize,
}

impl PayloadGuard {
    pub fn new(limit_bytes: usize) -> Self {
        Self { limit_bytes }
    }

    /// Serialized size of a JSON value in bytes
    pub fn measure(value: &serde_json::Value) -> usize {
        // Values this deep in the pipeline always serialize
        serde_json::to_string(value).map(|s| s.len()).unwrap_or(usize::MAX)
    }

    /// Replace `value` with the redaction marker if it exceeds the limit
    pub fn enforce(&self, value: &mut serde_json::Value) -> PayloadVerdict {
        if Self::measure(value) > self.limit_bytes {
            *value = serde_json::Value::String(REDACTION_MESSAGE.to_string());
            PayloadVerdict::Redacted
        } else {
            PayloadVerdict::Ok
        }
    }

    /// Guard a value without mutating the original
    pub fn guarded(&self, value: &serde_json::Value) -> (serde_json::Value, PayloadVerdict) {
        let mut out = value.clone();
        let verdict = self.enforce(&mut out);
        (out, verdict)
    }

    /// Prepare a state for the wire: credentials scrubbed, size enforced
    pub fn outbound(&self, state: &serde_json::Value) -> (serde_json::Value, PayloadVerdict) {
        let mut out = state.clone();
        scrub(&mut out);
        let verdict = self.enforce(&mut out);
        (out, verdict)
    }
}

/// Remove materialized credentials from a state before it leaves the worker
pub fn scrub(state: &mut serde_json::Value) {
    if let Some(obj) = state.as_object_mut() {
        obj.remove("configuration");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_small_payload_untouched() {
        let guard = PayloadGuard::new(1024);
        let mut value = json!({"data": {"x": 1}});
        assert_eq!(guard.enforce(&mut value), PayloadVerdict::Ok);
        assert_eq!(value, json!({"data": {"x": 1}}));
    }

    #[test]
    fn test_oversized_payload_replaced_with_marker() {
        let guard = PayloadGuard::new(16);
        let mut value = json!({"data": "a".repeat(64)});
        assert_eq!(guard.enforce(&mut value), PayloadVerdict::Redacted);
        assert_eq!(value, json!(REDACTION_MESSAGE));
    }

    #[test]
    fn test_guarded_leaves_original_intact() {
        let guard = PayloadGuard::new(4);
        let value = json!({"big": "payload"});
        let (out, verdict) = guard.guarded(&value);
        assert!(verdict.is_redacted());
        assert_eq!(out, json!(REDACTION_MESSAGE));
        assert_eq!(value, json!({"big": "payload"}));
    }

    #[test]
    fn test_outbound_scrubs_configuration() {
        let guard = PayloadGuard::new(1024);
        let state = json!({"configuration": {"token": "secret"}, "data": {"x": 1}});
        let (out, verdict) = guard.outbound(&state);
        assert_eq!(verdict, PayloadVerdict::Ok);
        assert_eq!(out, json!({"data": {"x": 1}}));
    }

    #[test]
    fn test_boundary_is_inclusive() {
        let value = json!({"k": "v"});
        let size = PayloadGuard::measure(&value);
        let mut at_limit = value.clone();
        assert_eq!(PayloadGuard::new(size).enforce(&mut at_limit), PayloadVerdict::Ok);
        let mut under_limit = value;
        assert_eq!(
            PayloadGuard::new(size - 1).enforce(&mut under_limit),
            PayloadVerdict::Redacted
        );
    }
}
