// src/orchestrator/compiler.rs
//! Expression compilation boundary
//!
//! Compilation (lowering user-authored job code to the executable pipeline
//! form) happens before dispatch, never inside the pool. The boundary is a
//! trait so deployments can plug in a real lowering pass; the default
//! assumes the broker hands out already-compiled expressions.

use crate::utils::errors::Result;

pub trait ExpressionCompiler: Send + Sync {
    fn compile(&self, source: &str) -> Result<String>;
}

/// Expressions arrive precompiled from the broker
pub struct PassthroughCompiler;

impl ExpressionCompiler for PassthroughCompiler {
    fn compile(&self, source: &str) -> Result<String> {
        Ok(source.to_string())
    }
}
