// src/runtime/adaptor.rs
//! Linked adaptor modules
//!
//! An adaptor module is the set of operation factories an expression is
//! compiled against. The module resolver decides *which* adaptors a run may
//! use (and verifies they are installed); this module provides their
//! sandbox-facing export tables.
//!
//! Guest logging flows out through a [`LogSink`] handed in at link time; the
//! owning pool unit attributes each line to the running step.

use crate::model::error::RunFault;
use crate::runtime::sandbox::{transformer_from, NativeFn, Operation, Scope, State, Value};
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;

/// A guest log line, prior to step attribution
#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    /// Log level string ("info", "error", ...)
    pub level: String,

    /// Structured message payload
    pub message: serde_json::Value,
}

/// Channel guest logs are forwarded through
pub type LogSink = tokio::sync::mpsc::UnboundedSender<LogLine>;

/// A resolved adaptor module ready to be linked into a run scope
pub struct LinkedModule {
    pub name: String,
    pub exports: Vec<(String, Value)>,
}

impl LinkedModule {
    /// Declare every export into the given scope frame
    pub fn link_into(&self, scope: &Scope) {
        for (name, value) in &self.exports {
            scope.declare(name, value.clone());
        }
    }
}

/// The core operation set every adaptor re-exports
///
/// Adaptor-specific operations would extend this table; the engine itself
/// only guarantees the core.
pub fn common_module(log: LogSink) -> LinkedModule {
    let mut exports = Vec::new();

    // fn(callable): wrap a state transformer as an operation
    exports.push((
        "fn".to_string(),
        NativeFn::value("fn", |ctx, mut args, pos| {
            if args.is_empty() {
                return Err(RunFault::type_error(
                    "fn expects a function argument",
                    ctx.error_position(pos),
                ));
            }
            let op = transformer_from(args.remove(0), ctx, pos)?;
            Ok(Value::Operation(op))
        }),
    ));

    // log(...values): emit a guest log line, state unchanged
    let sink = log.clone();
    exports.push((
        "log".to_string(),
        NativeFn::value("log", move |_ctx, args, _pos| {
            let message = log_message(&args);
            let sink = sink.clone();
            Ok(Value::Operation(Operation::sync(move |state| {
                // Receiver dropped means the run is already being torn down
                let _ = sink.send(LogLine {
                    level: "info".to_string(),
                    message: message.clone(),
                });
                Ok(state)
            })))
        }),
    ));

    // throwError(message): adaptor-raised error, default severity fail
    exports.push((
        "throwError".to_string(),
        NativeFn::value("throwError", |_ctx, args, _pos| {
            let message = match args.first() {
                Some(Value::Json(serde_json::Value::String(s))) => s.clone(),
                Some(other) => format!("{:?}", other),
                None => "adaptor error".to_string(),
            };
            Ok(Value::Operation(Operation::sync(move |_state| {
                Err(RunFault::adaptor_error("AdaptorError", message.clone()))
            })))
        }),
    ));

    // wait(ms): asynchronous pass-through operation
    exports.push((
        "wait".to_string(),
        NativeFn::value("wait", |_ctx, args, _pos| {
            let ms = match args.first() {
                Some(Value::Json(v)) => v.as_f64().unwrap_or(0.0).max(0.0) as u64,
                _ => 0,
            };
            Ok(Value::Operation(Operation::Async(Arc::new(move |state: State| {
                async move {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(state)
                }
                .boxed()
            }))))
        }),
    ));

    LinkedModule {
        name: "common".to_string(),
        exports,
    }
}

/// Export table for a named adaptor
pub fn module_for(adaptor_name: &str, log: LogSink) -> LinkedModule {
    let mut module = common_module(log);
    module.name = adaptor_name.to_string();
    module
}

fn log_message(args: &[Value]) -> serde_json::Value {
    let mut parts: Vec<serde_json::Value> = args
        .iter()
        .map(|v| match v {
            Value::Json(j) => j.clone(),
            other => serde_json::Value::String(format!("{:?}", other)),
        })
        .collect();
    if parts.len() == 1 {
        parts.remove(0)
    } else {
        serde_json::Value::Array(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::sandbox::{execute, CancelToken};
    use serde_json::json;

    #[tokio::test]
    async fn test_log_lines_reach_the_sink_in_order() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let scope = Scope::root();
        common_module(tx).link_into(&scope);

        execute(
            "log('first')\nlog('second', 2)",
            json!({}),
            &scope,
            &CancelToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(rx.recv().await.unwrap().message, json!("first"));
        assert_eq!(rx.recv().await.unwrap().message, json!(["second", 2.0]));
    }

    #[tokio::test]
    async fn test_log_preserves_state() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let scope = Scope::root();
        common_module(tx).link_into(&scope);

        let state = execute("log('hello')", json!({"data": 1}), &scope, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(state, json!({"data": 1}));
    }

    #[tokio::test]
    async fn test_fn_rejects_non_function_argument() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let scope = Scope::root();
        common_module(tx).link_into(&scope);

        let fault = execute("fn(42)", json!({}), &scope, &CancelToken::new())
            .await
            .unwrap_err();
        assert_eq!(fault.name, "TypeError");
    }
}
