// src/resolver/mod.rs
//! Module resolution
//!
//! Maps a step's adaptor specifiers to linked sandbox modules. Resolution
//! honors per-run linker overrides (local path or pinned version) and
//! refuses to link an adaptor the registry does not have; installs happen
//! earlier, via [`autoinstall::Autoinstaller`], so a miss here is a hard
//! error rather than a trigger.

pub mod autoinstall;
pub mod registry;

pub use autoinstall::Autoinstaller;
pub use registry::{AdaptorRegistry, FsRegistry};

use crate::model::plan::Step;
use crate::model::specifier::AdaptorSpecifier;
use crate::runtime::adaptor::{module_for, LogSink};
use crate::runtime::sandbox::Scope;
use crate::utils::errors::{EngineError, Result};
use std::sync::Arc;
use tracing::debug;

pub struct Resolver {
    registry: Arc<dyn AdaptorRegistry>,
}

impl Resolver {
    pub fn new(registry: Arc<dyn AdaptorRegistry>) -> Self {
        Self { registry }
    }

    /// Apply a step's linker overrides to one of its specifiers
    fn effective_specifier(step: &Step, spec: &AdaptorSpecifier) -> AdaptorSpecifier {
        match step.linker.get(&spec.name) {
            Some(over) => {
                if let Some(path) = &over.path {
                    return AdaptorSpecifier { name: path.clone(), version: None };
                }
                AdaptorSpecifier {
                    name: spec.name.clone(),
                    version: over.version.clone().or_else(|| spec.version.clone()),
                }
            }
            None => spec.clone(),
        }
    }

    /// Build a freshly-linked scope for one step
    ///
    /// Every adaptor's export table lands in the root frame. Scopes are never
    /// shared between runs; isolation depends on this.
    pub async fn link(&self, step: &Step, log: LogSink) -> Result<Scope> {
        let scope = Scope::root();

        for spec in step.specifiers() {
            let effective = Self::effective_specifier(step, &spec);

            if !effective.is_path() {
                let alias = effective.alias();
                if !self.registry.is_installed(&alias).await? {
                    return Err(EngineError::AdaptorNotInstalled(effective.to_string()));
                }
            }

            debug!(step = %step.id, specifier = %effective, "linking adaptor");
            module_for(&effective.name, log.clone()).link_into(&scope);
        }

        Ok(scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::plan::LinkerOverride;

    fn job_step(adaptors: Vec<&str>) -> Step {
        Step {
            id: "job-1".to_string(),
            adaptors: adaptors.into_iter().map(String::from).collect(),
            expression: Some("fn((s) => s)".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_link_installed_adaptor() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(FsRegistry::new(dir.path()));
        registry.install(&AdaptorSpecifier::parse("common@1.0.0")).await.unwrap();

        let resolver = Resolver::new(registry);
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let scope = resolver.link(&job_step(vec!["common@1.0.0"]), tx).await.unwrap();
        assert!(scope.get("fn").is_some());
        assert!(scope.get("log").is_some());
    }

    #[tokio::test]
    async fn test_link_missing_adaptor_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = Resolver::new(Arc::new(FsRegistry::new(dir.path())));
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();

        let err = resolver.link(&job_step(vec!["common@1.0.0"]), tx).await.unwrap_err();
        assert!(matches!(err, EngineError::AdaptorNotInstalled(_)));
    }

    #[tokio::test]
    async fn test_path_override_bypasses_registry() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = Resolver::new(Arc::new(FsRegistry::new(dir.path())));

        let mut step = job_step(vec!["common@1.0.0"]);
        step.linker.insert(
            "common".to_string(),
            LinkerOverride { path: Some("/srv/adaptors/common".to_string()), version: None },
        );

        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        // nothing installed, yet the path override links
        let scope = resolver.link(&step, tx).await.unwrap();
        assert!(scope.get("fn").is_some());
    }

    #[tokio::test]
    async fn test_version_override_changes_alias() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(FsRegistry::new(dir.path()));
        registry.install(&AdaptorSpecifier::parse("common@2.0.0")).await.unwrap();
        let resolver = Resolver::new(registry);

        let mut step = job_step(vec!["common@1.0.0"]);
        step.linker.insert(
            "common".to_string(),
            LinkerOverride { path: None, version: Some("2.0.0".to_string()) },
        );

        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        assert!(resolver.link(&step, tx).await.is_ok());
    }
}
