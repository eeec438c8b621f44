//! Offline chapter downloads
//!
//! Page URLs come from the source's `reader`, images are fetched with a
//! bounded number of requests in flight and stored as
//! `<downloads>/<manga>/<chapter>/NNN.<ext>`. Page URLs are untrusted and
//! go through the same network policy as script requests.

use crate::core::error::{Result, TsukiyoError};
use crate::core::http::{HttpRequest, HttpTransport};
use crate::core::network::NetworkMonitor;
use crate::db::models::DownloadedChapter;
use crate::db::repository::{chapter_download_dir, DownloadRepository};
use crate::extension::sandbox::ScriptSandbox;
use crate::extension::source::ContentSource;
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DEFAULT_CONCURRENCY: usize = 4;

/// Chapter to download and the manga it belongs to
#[derive(Debug, Clone)]
pub struct DownloadTarget {
    pub manga_id: String,
    pub manga_title: Option<String>,
    pub chapter_id: String,
    pub chapter_number: Option<String>,
}

pub struct ChapterDownloader {
    transport: Arc<dyn HttpTransport>,
    network: Arc<dyn NetworkMonitor>,
    store: Arc<DownloadRepository>,
    sandbox: ScriptSandbox,
    concurrency: usize,
}

impl ChapterDownloader {
    pub fn new(transport: Arc<dyn HttpTransport>, network: Arc<dyn NetworkMonitor>, store: Arc<DownloadRepository>) -> Self {
        Self {
            transport,
            network,
            store,
            sandbox: ScriptSandbox::default(),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_sandbox(mut self, sandbox: ScriptSandbox) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Download every page of a chapter and record it under the source's id
    pub async fn download_chapter(&self, source: &dyn ContentSource, target: &DownloadTarget) -> Result<DownloadedChapter> {
        if !self.network.is_connected().await {
            return Err(TsukiyoError::NotConnected);
        }

        let pages = source.reader(&target.chapter_id).await?;
        if pages.is_empty() {
            return Err(TsukiyoError::DownloadFailed(format!(
                "chapter {} of {} has no pages",
                target.chapter_id,
                source.id()
            )));
        }

        let dir = chapter_download_dir(self.store.downloads_dir(), &target.manga_id, &target.chapter_id);
        tokio::fs::create_dir_all(&dir).await?;
        info!(source = %source.id(), chapter = %target.chapter_id, pages = pages.len(), "Downloading chapter");

        let results: Vec<Result<PathBuf>> = stream::iter(pages.iter().enumerate())
            .map(|(index, url)| self.fetch_page(&dir, index, url))
            .buffered(self.concurrency)
            .collect()
            .await;

        let files = match results.into_iter().collect::<Result<Vec<_>>>() {
            Ok(files) => files,
            Err(e) => {
                warn!(chapter = %target.chapter_id, error = %e, "Chapter download failed, removing partial pages");
                if let Err(cleanup) = tokio::fs::remove_dir_all(&dir).await {
                    warn!(path = %dir.display(), error = %cleanup, "Failed to remove partial chapter");
                }
                return Err(e);
            }
        };

        let chapter = DownloadedChapter {
            chapter_id: target.chapter_id.clone(),
            chapter_number: target.chapter_number.clone(),
            pages: files,
            downloaded_at: chrono::Utc::now().timestamp_millis(),
        };
        self.store
            .record_chapter(&target.manga_id, source.id(), target.manga_title.as_deref(), &chapter)
            .await?;

        info!(source = %source.id(), chapter = %target.chapter_id, "Chapter downloaded");
        Ok(chapter)
    }

    async fn fetch_page(&self, dir: &Path, index: usize, url: &str) -> Result<PathBuf> {
        let response = self.sandbox.send(self.transport.as_ref(), HttpRequest::get(url)).await?;
        if !response.is_success() {
            return Err(TsukiyoError::DownloadFailed(format!(
                "page {} answered with status {}",
                url, response.status
            )));
        }

        let extension = image_extension(url, response.header("content-type"));
        let path = dir.join(format!("{:03}.{}", index + 1, extension));
        tokio::fs::write(&path, &response.body).await?;
        debug!(path = %path.display(), bytes = response.body.len(), "Page stored");
        Ok(path)
    }
}

/// File extension for a page: the URL's own when it names an image, else from the content type
fn image_extension(url: &str, content_type: Option<&str>) -> String {
    let from_url = url::Url::parse(url)
        .ok()
        .and_then(|u| {
            Path::new(u.path())
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_ascii_lowercase)
        })
        .filter(|ext| {
            mime_guess::from_ext(ext)
                .first()
                .map(|m| m.type_() == mime_guess::mime::IMAGE)
                .unwrap_or(false)
        });
    if let Some(ext) = from_url {
        return ext;
    }

    let essence = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase());
    match essence.as_deref() {
        Some("image/jpeg") => "jpg".to_string(),
        Some(other) => mime_guess::get_mime_extensions_str(other)
            .and_then(|exts| exts.first())
            .map(|ext| ext.to_string())
            .unwrap_or_else(|| "img".to_string()),
        None => "img".to_string(),
    }
}
