//! Extension manager
//!
//! Wires the registry, installer, lifecycle and resolver together and is
//! the entry point the rest of the application uses.

use crate::core::config::{ExtensionsConfig, StorageConfig};
use crate::core::error::Result;
use crate::core::http::HttpTransport;
use crate::core::network::NetworkMonitor;
use crate::core::rate_limit::{Clock, SystemClock};
use crate::db::repository::{DownloadStore, ReadingProgressStore};
use crate::extension::installer::ExtensionInstaller;
use crate::extension::lifecycle::{ExtensionLifecycle, UninstallReport};
use crate::extension::mangadex::{MangaDexSource, MANGADEX_ID};
use crate::extension::registry::{Source, SourceRegistry};
use crate::extension::resolver::SourceResolver;
use crate::extension::sandbox::ScriptSandbox;
use crate::extension::source::ContentSource;
use crate::extension::worker::ScriptHost;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Collaborators the manager needs
#[derive(Clone)]
pub struct ManagerServices {
    pub transport: Arc<dyn HttpTransport>,
    pub network: Arc<dyn NetworkMonitor>,
    pub progress: Arc<dyn ReadingProgressStore>,
    pub downloads: Arc<dyn DownloadStore>,
    pub clock: Arc<dyn Clock>,
}

impl ManagerServices {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        network: Arc<dyn NetworkMonitor>,
        progress: Arc<dyn ReadingProgressStore>,
        downloads: Arc<dyn DownloadStore>,
    ) -> Self {
        Self {
            transport,
            network,
            progress,
            downloads,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// One row of the source list
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceListing {
    pub id: String,
    pub name: String,
    pub version: Option<String>,
    pub builtin: bool,
    pub rate_limited: bool,
}

pub struct ExtensionManager {
    registry: Arc<SourceRegistry>,
    installer: ExtensionInstaller,
    lifecycle: ExtensionLifecycle,
    resolver: SourceResolver,
}

impl ExtensionManager {
    pub fn new(storage: &StorageConfig, config: &ExtensionsConfig, services: ManagerServices) -> Self {
        let registry = Arc::new(SourceRegistry::new(storage.registry_path()));
        let host = ScriptHost::new(
            services.transport.clone(),
            ScriptSandbox::from_config(config),
            config.fetch_deadline(),
        );

        let mut resolver = SourceResolver::new(registry.clone(), host.clone(), services.network.clone(), config.cooldown())
            .with_clock(services.clock.clone());

        if config.enable_builtin {
            let mangadex = MangaDexSource::new(
                services.transport.clone(),
                resolver.guard_for(MANGADEX_ID),
                services.network.clone(),
            );
            resolver = resolver.with_builtin(Arc::new(mangadex));
        }

        let installer = ExtensionInstaller::new(
            storage.extensions_dir.clone(),
            registry.clone(),
            services.transport.clone(),
            services.network.clone(),
            host,
            config.cooldown(),
        )
        .with_reserved_ids(resolver.builtin_ids());

        let lifecycle = ExtensionLifecycle::new(
            storage.extensions_dir.clone(),
            registry.clone(),
            services.progress,
            services.downloads,
        );

        Self {
            registry,
            installer,
            lifecycle,
            resolver,
        }
    }

    pub async fn install(&self, url: &str) -> Result<Source> {
        self.installer.install(url).await
    }

    pub async fn install_verified(&self, url: &str, sha256: &str) -> Result<Source> {
        self.installer.install_verified(url, sha256).await
    }

    pub async fn uninstall(&self, id: &str) -> Result<UninstallReport> {
        let report = self.lifecycle.uninstall(id).await?;
        if report.was_installed() {
            self.resolver.forget(id);
        }
        Ok(report)
    }

    /// Remove every installed script; user data stays
    pub async fn clear_all(&self) -> Result<usize> {
        let installed = self.registry.list().await?;
        let removed = self.lifecycle.clear_all().await?;
        for source in &installed {
            self.resolver.forget(&source.id);
        }
        info!(sources = installed.len(), files = removed, "Extensions reset");
        Ok(removed)
    }

    /// Installed sources, in install order
    pub async fn list(&self) -> Result<Vec<Source>> {
        self.registry.list().await
    }

    pub async fn find(&self, id: &str) -> Result<Option<Source>> {
        self.registry.find_by_id(id).await
    }

    /// Built-in sources followed by installed ones
    pub async fn sources(&self) -> Result<Vec<SourceListing>> {
        let mut listing: Vec<SourceListing> = self
            .resolver
            .builtins()
            .iter()
            .map(|source| SourceListing {
                id: source.id().to_string(),
                name: source.name().to_string(),
                version: None,
                builtin: true,
                rate_limited: source.is_rate_limited(),
            })
            .collect();

        for source in self.registry.list().await? {
            listing.push(SourceListing {
                rate_limited: self.resolver.guard_for(&source.id).is_rate_limited(),
                id: source.id,
                name: source.name,
                version: Some(source.version),
                builtin: false,
            });
        }

        Ok(listing)
    }

    pub async fn resolve(&self, id: &str) -> Result<Option<Arc<dyn ContentSource>>> {
        self.resolver.resolve(id).await
    }

    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }
}
