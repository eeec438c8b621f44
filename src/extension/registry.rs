//! Registry of installed extension scripts
//!
//! A single JSON document (`installed.json`) listing every installed
//! source. Every mutation rewrites the whole document through a temporary
//! file and a rename, so readers never see a half-written list.

use crate::core::error::{Result, TsukiyoError};
use crate::extension::contract::DEFAULT_VERSION;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

fn default_version() -> String {
    DEFAULT_VERSION.to_string()
}

/// One installed source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub id: String,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(alias = "scriptPath")]
    pub file_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    /// Hex SHA-256 of the script as installed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_at: Option<DateTime<Utc>>,
}

/// The registry document on disk
#[derive(Debug)]
pub struct SourceRegistry {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    lock: Mutex<()>,
}

impl SourceRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All installed sources. A missing or empty document is an empty list.
    pub async fn list(&self) -> Result<Vec<Source>> {
        let _guard = self.lock.lock().await;
        self.read().await
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<Source>> {
        Ok(self.list().await?.into_iter().find(|s| s.id == id))
    }

    /// Append a source. Ids are unique.
    pub async fn add(&self, source: Source) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut sources = self.read().await?;
        if sources.iter().any(|s| s.id == source.id) {
            return Err(TsukiyoError::ValidationError(format!(
                "Source '{}' is already installed",
                source.id
            )));
        }

        info!(source = %source.id, version = %source.version, "Registering source");
        sources.push(source);
        self.write(&sources).await
    }

    /// Remove a source, returning its record if it was present
    pub async fn remove(&self, id: &str) -> Result<Option<Source>> {
        let _guard = self.lock.lock().await;
        let mut sources = self.read().await?;
        let Some(index) = sources.iter().position(|s| s.id == id) else {
            return Ok(None);
        };

        let removed = sources.remove(index);
        self.write(&sources).await?;
        debug!(source = %id, "Source unregistered");
        Ok(Some(removed))
    }

    /// Reset to an empty list
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.write(&[]).await
    }

    async fn read(&self) -> Result<Vec<Source>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        if content.trim().is_empty() {
            return Ok(Vec::new());
        }

        serde_json::from_str(&content).map_err(|e| {
            TsukiyoError::SerializationError(format!(
                "Registry document {} is corrupt: {}",
                self.path.display(),
                e
            ))
        })
    }

    async fn write(&self, sources: &[Source]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string_pretty(sources)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(id: &str) -> Source {
        Source {
            id: id.to_string(),
            name: format!("Source {}", id),
            version: "1.0.0".to_string(),
            file_path: PathBuf::from(format!("/tmp/{}.js", id)),
            source_url: None,
            checksum: None,
            installed_at: None,
        }
    }

    #[tokio::test]
    async fn test_missing_document_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SourceRegistry::new(dir.path().join("installed.json"));
        assert!(registry.list().await.unwrap().is_empty());
        assert!(registry.find_by_id("x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_add_remove_clear() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SourceRegistry::new(dir.path().join("extensions").join("installed.json"));

        registry.add(source("a")).await.unwrap();
        registry.add(source("b")).await.unwrap();
        assert!(registry.add(source("a")).await.is_err());

        let ids: Vec<_> = registry.list().await.unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["a", "b"]);

        assert_eq!(registry.remove("a").await.unwrap().map(|s| s.id), Some("a".to_string()));
        assert!(registry.remove("a").await.unwrap().is_none());

        registry.clear().await.unwrap();
        assert!(registry.list().await.unwrap().is_empty());
        assert!(registry.path().exists());
    }

    #[tokio::test]
    async fn test_reads_legacy_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("installed.json");
        std::fs::write(
            &path,
            r#"[{"id":"mangadex","name":"MangaDex","filePath":"/x/mangadex-1700000000000.js"}]"#,
        )
        .unwrap();

        let registry = SourceRegistry::new(&path);
        let sources = registry.list().await.unwrap();
        assert_eq!(sources[0].version, "1.0.0");
        assert_eq!(sources[0].file_path, PathBuf::from("/x/mangadex-1700000000000.js"));
    }

    #[tokio::test]
    async fn test_corrupt_document_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("installed.json");
        std::fs::write(&path, "[{").unwrap();

        let registry = SourceRegistry::new(&path);
        assert!(matches!(registry.list().await, Err(TsukiyoError::SerializationError(_))));
    }
}
