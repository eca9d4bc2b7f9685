// src/resolver/autoinstall.rs
//! Autoinstall coordination
//!
//! Adaptors are installed lazily, on first use. Installs are expensive and
//! racy (plans claimed in the same breath usually want the same adaptor), so
//! the coordinator single-flights them: at most one in-flight install per
//! alias, with concurrent requesters awaiting the same shared future.
//! Distinct versions install concurrently.
//!
//! The registry root is validated exactly once per process, before the first
//! install. A bootstrap failure is fatal to the worker.

use crate::model::specifier::AdaptorSpecifier;
use crate::resolver::registry::AdaptorRegistry;
use crate::utils::errors::{EngineError, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

type InstallFuture = Shared<BoxFuture<'static, std::result::Result<(), Arc<EngineError>>>>;

static GLOBAL: OnceCell<Arc<Autoinstaller>> = OnceCell::new();

/// Process-wide install coordinator
pub struct Autoinstaller {
    registry: Arc<dyn AdaptorRegistry>,

    /// In-flight installs keyed by alias; entries are removed on settlement
    pending: Mutex<HashMap<String, InstallFuture>>,

    bootstrapped: tokio::sync::OnceCell<()>,
}

impl Autoinstaller {
    pub fn new(registry: Arc<dyn AdaptorRegistry>) -> Self {
        Self {
            registry,
            pending: Mutex::new(HashMap::new()),
            bootstrapped: tokio::sync::OnceCell::new(),
        }
    }

    /// The process-lifetime coordinator; the pending-install map must outlive
    /// any individual run
    pub fn global(registry: impl FnOnce() -> Arc<dyn AdaptorRegistry>) -> Arc<Autoinstaller> {
        GLOBAL.get_or_init(|| Arc::new(Autoinstaller::new(registry()))).clone()
    }

    /// Make every autoinstallable specifier available, installing what is
    /// missing
    ///
    /// Path specifiers are skipped. An install failure surfaces as
    /// [`EngineError::InstallFailed`] to every waiter of that alias.
    pub async fn ensure(&self, specifiers: &[AdaptorSpecifier]) -> Result<()> {
        if specifiers.iter().any(|s| s.autoinstallable()) {
            self.bootstrap().await?;
        }

        for spec in specifiers {
            if !spec.autoinstallable() {
                debug!(specifier = %spec, "path specifier, skipping autoinstall");
                continue;
            }
            let alias = spec.alias();
            if self.registry.is_installed(&alias).await? {
                continue;
            }
            self.install_singleflight(spec, &alias).await?;
        }

        Ok(())
    }

    async fn bootstrap(&self) -> Result<()> {
        self.bootstrapped
            .get_or_try_init(|| self.registry.ensure_registry())
            .await?;
        Ok(())
    }

    async fn install_singleflight(&self, spec: &AdaptorSpecifier, alias: &str) -> Result<()> {
        let (fut, instigator) = {
            let mut pending = self.pending.lock();
            match pending.get(alias) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let registry = self.registry.clone();
                    let spec = spec.clone();
                    let fut: InstallFuture = async move {
                        registry.install(&spec).await.map_err(Arc::new)
                    }
                    .boxed()
                    .shared();
                    pending.insert(alias.to_string(), fut.clone());
                    (fut, true)
                }
            }
        };

        if !instigator {
            debug!(alias, "awaiting in-flight install");
        }

        let result = fut.await;

        // Settled entries must not satisfy later requests; a failed install
        // is retried by the next run that needs the alias.
        self.pending.lock().remove(alias);

        result.map_err(|e| {
            warn!(alias, error = %e, "adaptor install failed");
            EngineError::InstallFailed {
                alias: alias.to_string(),
                reason: e.to_string(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingRegistry {
        installs: AtomicUsize,
        installed: Mutex<HashSet<String>>,
        fail: bool,
    }

    impl CountingRegistry {
        fn new(fail: bool) -> Self {
            Self {
                installs: AtomicUsize::new(0),
                installed: Mutex::new(HashSet::new()),
                fail,
            }
        }
    }

    #[async_trait]
    impl AdaptorRegistry for CountingRegistry {
        async fn is_installed(&self, alias: &str) -> Result<bool> {
            Ok(self.installed.lock().contains(alias))
        }

        async fn install(&self, spec: &AdaptorSpecifier) -> Result<()> {
            self.installs.fetch_add(1, Ordering::SeqCst);
            // Window for concurrent requesters to pile up on the alias
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail {
                return Err(EngineError::InstallFailed {
                    alias: spec.alias(),
                    reason: "registry unavailable".to_string(),
                });
            }
            self.installed.lock().insert(spec.alias());
            Ok(())
        }

        async fn ensure_registry(&self) -> Result<()> {
            Ok(())
        }

        fn module_path(&self, alias: &str) -> PathBuf {
            PathBuf::from("/tmp").join(alias)
        }
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_install() {
        let registry = Arc::new(CountingRegistry::new(false));
        let installer = Arc::new(Autoinstaller::new(registry.clone()));
        let spec = AdaptorSpecifier::parse("common@1.0.0");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let installer = installer.clone();
            let specs = vec![spec.clone()];
            handles.push(tokio::spawn(async move { installer.ensure(&specs).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(registry.installs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_versions_install_separately() {
        let registry = Arc::new(CountingRegistry::new(false));
        let installer = Autoinstaller::new(registry.clone());
        let specs = vec![
            AdaptorSpecifier::parse("common@1.0.0"),
            AdaptorSpecifier::parse("common@2.0.0"),
        ];
        installer.ensure(&specs).await.unwrap();
        assert_eq!(registry.installs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_install_surfaces_and_is_retried() {
        let registry = Arc::new(CountingRegistry::new(true));
        let installer = Autoinstaller::new(registry.clone());
        let specs = vec![AdaptorSpecifier::parse("common@1.0.0")];

        let err = installer.ensure(&specs).await.unwrap_err();
        assert!(matches!(err, EngineError::InstallFailed { .. }));

        // the settled failure was cleared, so a new attempt fires
        let _ = installer.ensure(&specs).await.unwrap_err();
        assert_eq!(registry.installs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_already_installed_alias_is_not_reinstalled() {
        let registry = Arc::new(CountingRegistry::new(false));
        registry.installed.lock().insert("common_1.0.0".to_string());
        let installer = Autoinstaller::new(registry.clone());

        installer
            .ensure(&[AdaptorSpecifier::parse("common@1.0.0")])
            .await
            .unwrap();
        assert_eq!(registry.installs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_path_specifiers_are_skipped() {
        let registry = Arc::new(CountingRegistry::new(false));
        let installer = Autoinstaller::new(registry.clone());

        installer
            .ensure(&[AdaptorSpecifier::parse("/srv/adaptors/common")])
            .await
            .unwrap();
        assert_eq!(registry.installs.load(Ordering::SeqCst), 0);
    }
}
