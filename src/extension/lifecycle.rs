//! Extension lifecycle: uninstall and bulk reset
//!
//! Uninstalling a source removes its script, its registry record and every
//! reading-progress and download entry tagged with its id. Each step is
//! best-effort: a failure is logged and recorded in the report, and the
//! remaining steps still run.

use crate::core::error::Result;
use crate::db::repository::{DownloadStore, ReadingProgressStore};
use crate::extension::registry::{Source, SourceRegistry};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// What an uninstall did
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UninstallReport {
    /// The removed record; `None` when the id was not installed
    pub source: Option<Source>,
    pub script_removed: bool,
    pub progress_removed: usize,
    pub downloads_removed: usize,
    /// Steps that failed, in order
    pub failures: Vec<String>,
}

impl UninstallReport {
    pub fn was_installed(&self) -> bool {
        self.source.is_some()
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct ExtensionLifecycle {
    extensions_dir: PathBuf,
    registry: Arc<SourceRegistry>,
    progress: Arc<dyn ReadingProgressStore>,
    downloads: Arc<dyn DownloadStore>,
}

impl ExtensionLifecycle {
    pub fn new(
        extensions_dir: PathBuf,
        registry: Arc<SourceRegistry>,
        progress: Arc<dyn ReadingProgressStore>,
        downloads: Arc<dyn DownloadStore>,
    ) -> Self {
        Self {
            extensions_dir,
            registry,
            progress,
            downloads,
        }
    }

    /// Remove a source and everything that references it
    ///
    /// Unknown ids are not an error. Only a registry that cannot be read
    /// at all fails the call.
    pub async fn uninstall(&self, id: &str) -> Result<UninstallReport> {
        let mut report = UninstallReport::default();

        let Some(source) = self.registry.find_by_id(id).await? else {
            info!(source = %id, "Uninstall requested for unknown source, nothing to do");
            return Ok(report);
        };

        info!(source = %id, path = %source.file_path.display(), "Uninstalling source");

        // 1. script file
        match remove_file_if_present(&source.file_path).await {
            Ok(removed) => report.script_removed = removed,
            Err(e) => {
                warn!(source = %id, error = %e, "Failed to delete script file");
                report.failures.push(format!("delete script: {}", e));
            }
        }

        // 2. registry record
        if let Err(e) = self.registry.remove(id).await {
            warn!(source = %id, error = %e, "Failed to unregister source");
            report.failures.push(format!("unregister: {}", e));
        }

        // 3. reading progress
        match self.progress.list_all().await {
            Ok(entries) => {
                for entry in entries.into_iter().filter(|e| e.source_id == id) {
                    match self.progress.remove(&entry.manga_id).await {
                        Ok(()) => report.progress_removed += 1,
                        Err(e) => {
                            warn!(source = %id, manga_id = %entry.manga_id, error = %e, "Failed to remove reading progress");
                            report.failures.push(format!("remove progress {}: {}", entry.manga_id, e));
                        }
                    }
                }
            }
            Err(e) => {
                warn!(source = %id, error = %e, "Failed to list reading progress");
                report.failures.push(format!("list progress: {}", e));
            }
        }

        // 4. downloads
        match self.downloads.list_all().await {
            Ok(manga) => {
                for manga in manga.into_iter().filter(|m| m.source_id == id) {
                    match self.downloads.delete_manga(&manga.manga_id).await {
                        Ok(()) => report.downloads_removed += 1,
                        Err(e) => {
                            warn!(source = %id, manga_id = %manga.manga_id, error = %e, "Failed to delete downloads");
                            report.failures.push(format!("delete downloads {}: {}", manga.manga_id, e));
                        }
                    }
                }
            }
            Err(e) => {
                warn!(source = %id, error = %e, "Failed to list downloads");
                report.failures.push(format!("list downloads: {}", e));
            }
        }

        info!(
            source = %id,
            progress_removed = report.progress_removed,
            downloads_removed = report.downloads_removed,
            failures = report.failures.len(),
            "Source uninstalled"
        );

        report.source = Some(source);
        Ok(report)
    }

    /// Delete every script in the extensions directory and empty the registry
    ///
    /// Reading progress and downloads are left untouched. Returns the
    /// number of files removed.
    pub async fn clear_all(&self) -> Result<usize> {
        let registry_path = self.registry.path().to_path_buf();
        let mut removed = 0;

        let mut entries = match tokio::fs::read_dir(&self.extensions_dir).await {
            Ok(entries) => Some(entries),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        if let Some(entries) = entries.as_mut() {
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path == registry_path || !entry.file_type().await?.is_file() {
                    continue;
                }
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete extension file"),
                }
            }
        }

        self.registry.clear().await?;
        info!(removed, "All extensions cleared");
        Ok(removed)
    }
}

async fn remove_file_if_present(path: &Path) -> std::io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
