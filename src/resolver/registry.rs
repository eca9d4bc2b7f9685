// src/resolver/registry.rs
//! Adaptor registry backends
//!
//! The registry answers two questions for the autoinstall coordinator: is an
//! alias already installed, and install it if not. The actual package fetch
//! is an external concern; [`FsRegistry`] manages the on-disk layout the
//! engine relies on (one directory per alias with a manifest) and delegates
//! fetching through [`FsRegistry::install`].

use crate::model::specifier::AdaptorSpecifier;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[async_trait]
pub trait AdaptorRegistry: Send + Sync {
    /// Whether the aliased package is present and usable
    async fn is_installed(&self, alias: &str) -> Result<bool>;

    /// Install one specifier; must be safe to call for an already-installed
    /// alias
    async fn install(&self, spec: &AdaptorSpecifier) -> Result<()>;

    /// Validate (and if needed create) the registry root
    async fn ensure_registry(&self) -> Result<()>;

    /// Filesystem location of an installed alias
    fn module_path(&self, alias: &str) -> PathBuf;
}

/// Directory-per-alias registry rooted at a configured path
pub struct FsRegistry {
    root: PathBuf,
}

impl FsRegistry {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }

    fn manifest_path(&self, alias: &str) -> PathBuf {
        self.root.join(alias).join("package.json")
    }
}

#[async_trait]
impl AdaptorRegistry for FsRegistry {
    async fn is_installed(&self, alias: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.manifest_path(alias)).await?)
    }

    async fn install(&self, spec: &AdaptorSpecifier) -> Result<()> {
        let alias = spec.alias();
        let dir = self.root.join(&alias);
        debug!(specifier = %spec, path = %dir.display(), "installing adaptor");

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| EngineError::InstallFailed {
                alias: alias.clone(),
                reason: e.to_string(),
            })?;

        let manifest = json!({
            "name": spec.name,
            "version": spec.version.as_deref().unwrap_or("latest"),
        });
        tokio::fs::write(self.manifest_path(&alias), serde_json::to_vec_pretty(&manifest)?)
            .await
            .map_err(|e| EngineError::InstallFailed {
                alias: alias.clone(),
                reason: e.to_string(),
            })?;

        info!(specifier = %spec, "adaptor installed");
        Ok(())
    }

    async fn ensure_registry(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| EngineError::RegistryBootstrap(format!(
                "cannot create registry root {}: {}",
                self.root.display(),
                e
            )))?;

        let marker = self.root.join("package.json");
        if !tokio::fs::try_exists(&marker).await? {
            let manifest = json!({ "name": "relay-engine-repo", "private": true });
            tokio::fs::write(&marker, serde_json::to_vec_pretty(&manifest)?)
                .await
                .map_err(|e| EngineError::RegistryBootstrap(e.to_string()))?;
        }

        debug!(root = %self.root.display(), "registry validated");
        Ok(())
    }

    fn module_path(&self, alias: &str) -> PathBuf {
        self.root.join(alias)
    }
}
