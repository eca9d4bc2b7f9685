// src/utils/mod.rs
//! Common utilities
//!
//! - **Config**: Layered engine configuration (defaults, file, environment)
//! - **Errors**: Engine-wide error taxonomy and `Result` alias

pub mod config;
pub mod errors;

pub use config::EngineConfig;
pub use errors::{EngineError, Result};
