// src/runtime/sandbox.rs
//! Sandbox executor
//!
//! Runs one compiled expression against one state object inside an isolated
//! scope. The scope is seeded exclusively from the linked adaptor modules;
//! there is no path from guest code to host process state, and assignments
//! made by one run are invisible to sibling runs.
//!
//! A compiled expression is a pipeline of operation invocations. Each
//! statement evaluates to a state transformer ([`Operation`]); transformers
//! are applied strictly sequentially: step *n+1* starts only after step
//! *n*'s value (or error) resolves.
//!
//! Failure classification:
//!
//! - parse failure → `CompileError`, severity `crash`
//! - undeclared identifier → `ReferenceError`, severity `crash`
//! - calling a non-function → `TypeError`, severity `fail`
//! - adaptor-thrown errors → adaptor-defined name, default severity `fail`

use crate::model::error::{ErrorPosition, RunFault};
use crate::runtime::expression::{self, Expr, ExprKind, Position};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Guest-visible state: a JSON document threaded through the pipeline
pub type State = serde_json::Value;

/// Cooperative cancellation and deadline token
///
/// The evaluator consults the token at every evaluation step, so a kill is
/// enforced even against guest code that would otherwise never yield.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a token sharing the same cancel flag but bounded by an
    /// additional deadline (the earlier one wins)
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) => Some(existing.min(deadline)),
            None => Some(deadline),
        };
        Self {
            cancelled: Arc::clone(&self.cancelled),
            deadline,
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Fault if cancelled or past the deadline
    pub fn check(&self) -> Result<(), RunFault> {
        if self.is_cancelled() {
            return Err(RunFault::cancelled());
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(RunFault::timeout("step exceeded its timeout"));
            }
        }
        Ok(())
    }

    /// Resolve once the token fires; used to interrupt in-flight async
    /// operations that never consult the token themselves
    pub async fn fired(&self) -> RunFault {
        loop {
            if let Err(fault) = self.check() {
                return fault;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }
}

/// Lexical scope chain
///
/// The root frame of a run holds the linked adaptor exports; lambda calls
/// push child frames. Assignment writes to the frame that already holds the
/// name, else to the run's root frame, never anywhere outside the run.
#[derive(Debug, Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

#[derive(Debug)]
struct ScopeInner {
    vars: RwLock<HashMap<String, Value>>,
    parent: Option<Scope>,
}

impl Scope {
    pub fn root() -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                vars: RwLock::new(HashMap::new()),
                parent: None,
            }),
        }
    }

    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                vars: RwLock::new(HashMap::new()),
                parent: Some(self.clone()),
            }),
        }
    }

    /// Bind a name in this frame
    pub fn declare(&self, name: &str, value: Value) {
        self.inner.vars.write().insert(name.to_string(), value);
    }

    /// Resolve a name through the chain
    pub fn get(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.inner.vars.read().get(name) {
            return Some(value.clone());
        }
        self.inner.parent.as_ref().and_then(|p| p.get(name))
    }

    /// Assign to the frame that holds the name, else to the run root
    pub fn assign(&self, name: &str, value: Value) {
        let mut frame = self.clone();
        loop {
            if frame.inner.vars.read().contains_key(name) {
                frame.inner.vars.write().insert(name.to_string(), value);
                return;
            }
            match frame.inner.parent.clone() {
                Some(parent) => frame = parent,
                None => {
                    frame.inner.vars.write().insert(name.to_string(), value);
                    return;
                }
            }
        }
    }
}

/// Values guest expressions evaluate to
#[derive(Clone)]
pub enum Value {
    /// Plain JSON data (including the threaded state)
    Json(State),
    /// A guest lambda with its captured environment
    Lambda(Arc<LambdaValue>),
    /// A host-provided adaptor function
    Native(Arc<NativeFn>),
    /// A state transformer produced by an operation factory
    Operation(Operation),
}

pub struct LambdaValue {
    pub params: Vec<String>,
    pub body: Expr,
    pub env: Scope,
}

/// Adaptor-provided function exposed to the sandbox
pub struct NativeFn {
    pub name: String,
    #[allow(clippy::type_complexity)]
    pub call: Box<dyn Fn(&EvalCtx, Vec<Value>, Position) -> Result<Value, RunFault> + Send + Sync>,
}

impl NativeFn {
    pub fn value(
        name: &str,
        call: impl Fn(&EvalCtx, Vec<Value>, Position) -> Result<Value, RunFault> + Send + Sync + 'static,
    ) -> Value {
        Value::Native(Arc::new(NativeFn {
            name: name.to_string(),
            call: Box::new(call),
        }))
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Json(v) => write!(f, "Json({})", v),
            Value::Lambda(l) => write!(f, "Lambda({})", l.params.join(", ")),
            Value::Native(n) => write!(f, "Native({})", n.name),
            Value::Operation(op) => op.fmt(f),
        }
    }
}

/// Tagged awaitable state transformer
///
/// One uniform interface over synchronous steps, asynchronous steps, and
/// composed chains; no runtime shape-sniffing.
#[derive(Clone)]
pub enum Operation {
    Sync(Arc<dyn Fn(State) -> Result<State, RunFault> + Send + Sync>),
    Async(Arc<dyn Fn(State) -> BoxFuture<'static, Result<State, RunFault>> + Send + Sync>),
    Chain(Vec<Operation>),
}

impl Operation {
    pub fn sync(f: impl Fn(State) -> Result<State, RunFault> + Send + Sync + 'static) -> Self {
        Operation::Sync(Arc::new(f))
    }

    pub fn apply(&self, state: State) -> BoxFuture<'_, Result<State, RunFault>> {
        match self {
            Operation::Sync(f) => {
                let result = f(state);
                async move { result }.boxed()
            }
            Operation::Async(f) => f(state),
            Operation::Chain(ops) => async move {
                let mut state = state;
                for op in ops {
                    state = op.apply(state).await?;
                }
                Ok(state)
            }
            .boxed(),
        }
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Sync(_) => write!(f, "Operation::Sync"),
            Operation::Async(_) => write!(f, "Operation::Async"),
            Operation::Chain(ops) => write!(f, "Operation::Chain({})", ops.len()),
        }
    }
}

/// Per-expression evaluation context: source text for error positions plus
/// the cancellation token
#[derive(Debug, Clone)]
pub struct EvalCtx {
    pub src: Arc<str>,
    pub cancel: CancelToken,
}

impl EvalCtx {
    pub fn error_position(&self, pos: Position) -> ErrorPosition {
        pos.to_error_position(&self.src)
    }
}

/// Evaluate one expression node
pub fn eval(expr: &Expr, scope: &Scope, ctx: &EvalCtx) -> Result<Value, RunFault> {
    ctx.cancel.check()?;

    match &expr.kind {
        ExprKind::Null => Ok(Value::Json(State::Null)),
        ExprKind::Bool(b) => Ok(Value::Json(State::Bool(*b))),
        ExprKind::Number(n) => Ok(Value::Json(serde_json::json!(*n))),
        ExprKind::Str(s) => Ok(Value::Json(State::String(s.clone()))),

        ExprKind::Ident(name) => scope
            .get(name)
            .ok_or_else(|| RunFault::reference_error(name, ctx.error_position(expr.pos))),

        ExprKind::Member { object, property, property_pos } => {
            let target = eval(object, scope, ctx)?;
            match target {
                Value::Json(v) => Ok(Value::Json(
                    v.get(property).cloned().unwrap_or(State::Null),
                )),
                other => Err(RunFault::type_error(
                    format!("cannot read property '{}' of {:?}", property, other),
                    ctx.error_position(*property_pos),
                )),
            }
        }

        ExprKind::Call { callee, args } => {
            let target = eval(callee, scope, ctx)?;
            let mut arg_values = Vec::with_capacity(args.len());
            for arg in args {
                arg_values.push(eval(arg, scope, ctx)?);
            }
            call_value(target, arg_values, expr.pos, ctx, &describe(callee))
        }

        ExprKind::Arrow { params, body } => Ok(Value::Lambda(Arc::new(LambdaValue {
            params: params.clone(),
            body: (**body).clone(),
            env: scope.clone(),
        }))),

        ExprKind::Assign { name, value } => {
            let value = eval(value, scope, ctx)?;
            scope.assign(name, value.clone());
            Ok(value)
        }
    }
}

/// Invoke a callable value
pub fn call_value(
    target: Value,
    args: Vec<Value>,
    pos: Position,
    ctx: &EvalCtx,
    callee_desc: &str,
) -> Result<Value, RunFault> {
    match target {
        Value::Native(f) => (f.call)(ctx, args, pos),
        Value::Lambda(lambda) => {
            let frame = lambda.env.child();
            for (i, param) in lambda.params.iter().enumerate() {
                frame.declare(param, args.get(i).cloned().unwrap_or(Value::Json(State::Null)));
            }
            eval(&lambda.body, &frame, ctx)
        }
        Value::Json(_) | Value::Operation(_) => Err(RunFault::type_error(
            format!("{} is not a function", callee_desc),
            ctx.error_position(pos),
        )),
    }
}

/// Coerce a statement's value into a state transformer
///
/// Operation factories (e.g. `fn`) already return operations; a bare lambda
/// is accepted as a synchronous transformer.
pub fn transformer_from(value: Value, ctx: &EvalCtx, pos: Position) -> Result<Operation, RunFault> {
    match value {
        Value::Operation(op) => Ok(op),
        Value::Lambda(_) | Value::Native(_) => {
            let ctx = ctx.clone();
            Ok(Operation::sync(move |state| {
                let out = call_value(value.clone(), vec![Value::Json(state)], pos, &ctx, "step")?;
                match out {
                    Value::Json(next) => Ok(next),
                    other => Err(RunFault::type_error(
                        format!("step returned {:?} instead of a state object", other),
                        ctx.error_position(pos),
                    )),
                }
            }))
        }
        Value::Json(_) => Err(RunFault::type_error(
            "expression statement did not produce an operation",
            ctx.error_position(pos),
        )),
    }
}

fn describe(expr: &Expr) -> String {
    match &expr.kind {
        ExprKind::Ident(name) => name.clone(),
        ExprKind::Member { property, .. } => property.clone(),
        _ => "expression".to_string(),
    }
}

/// Run a compiled expression against an initial state
///
/// The scope must be a freshly-linked run scope; faults come back classified
/// and positioned, never as bare panics.
pub async fn execute(
    compiled: &str,
    initial_state: State,
    scope: &Scope,
    cancel: &CancelToken,
) -> Result<State, RunFault> {
    let pipeline = expression::parse(compiled)?;

    let ctx = EvalCtx {
        src: Arc::from(compiled),
        cancel: cancel.clone(),
    };

    let mut state = initial_state;
    for statement in &pipeline.statements {
        ctx.cancel.check()?;
        let value = eval(statement, scope, &ctx)?;
        let op = transformer_from(value, &ctx, statement.pos)?;
        state = tokio::select! {
            result = op.apply(state) => result?,
            fault = ctx.cancel.fired() => return Err(fault),
        };
    }

    Ok(state)
}
