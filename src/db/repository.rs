//! Repository pattern implementation for data access layer
//!
//! The lifecycle manager only needs the narrow [`ReadingProgressStore`] and
//! [`DownloadStore`] views; the SQLite repositories add the write paths
//! used by the reader and the downloader.

use crate::core::error::Result;
use crate::db::manager::DatabaseManager;
use crate::db::models::{DownloadedChapter, DownloadedManga, ReadingProgressEntry};
use async_trait::async_trait;
use rusqlite::{params, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Reading progress as seen by the extension lifecycle
#[async_trait]
pub trait ReadingProgressStore: Send + Sync {
    /// All entries, most recently read first
    async fn list_all(&self) -> Result<Vec<ReadingProgressEntry>>;

    /// Remove the entry for a manga. Removing a missing entry is not an error.
    async fn remove(&self, manga_id: &str) -> Result<()>;
}

/// Offline downloads as seen by the extension lifecycle
#[async_trait]
pub trait DownloadStore: Send + Sync {
    async fn list_all(&self) -> Result<Vec<DownloadedManga>>;

    /// Delete a manga's downloaded files and records
    async fn delete_manga(&self, manga_id: &str) -> Result<()>;
}

/// Directory holding a manga's downloaded chapters
pub fn manga_download_dir(root: &Path, manga_id: &str) -> PathBuf {
    root.join(sanitize_segment(manga_id))
}

/// Directory holding one downloaded chapter's pages
pub fn chapter_download_dir(root: &Path, manga_id: &str, chapter_id: &str) -> PathBuf {
    manga_download_dir(root, manga_id).join(sanitize_segment(chapter_id))
}

fn sanitize_segment(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

fn progress_from_row(row: &Row<'_>) -> rusqlite::Result<ReadingProgressEntry> {
    Ok(ReadingProgressEntry {
        manga_id: row.get(0)?,
        source_id: row.get(1)?,
        manga_title: row.get(2)?,
        manga_cover: row.get(3)?,
        chapter_id: row.get(4)?,
        chapter_number: row.get(5)?,
        page: row.get(6)?,
        last_read: row.get(7)?,
    })
}

const PROGRESS_COLUMNS: &str =
    "manga_id, source_id, manga_title, manga_cover, chapter_id, chapter_number, page, last_read";

/// Repository for reading progress
#[derive(Debug, Clone)]
pub struct ReadingProgressRepository {
    db: Arc<DatabaseManager>,
}

impl ReadingProgressRepository {
    pub fn new(db: Arc<DatabaseManager>) -> Self {
        Self { db }
    }

    /// Insert or replace the entry for a manga
    pub async fn save(&self, entry: &ReadingProgressEntry) -> Result<()> {
        let entry = entry.clone();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO reading_progress (manga_id, source_id, manga_title, manga_cover, \
                     chapter_id, chapter_number, page, last_read) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                     ON CONFLICT(manga_id) DO UPDATE SET \
                     source_id = excluded.source_id, manga_title = excluded.manga_title, \
                     manga_cover = excluded.manga_cover, chapter_id = excluded.chapter_id, \
                     chapter_number = excluded.chapter_number, page = excluded.page, \
                     last_read = excluded.last_read",
                    params![
                        entry.manga_id,
                        entry.source_id,
                        entry.manga_title,
                        entry.manga_cover,
                        entry.chapter_id,
                        entry.chapter_number,
                        entry.page,
                        entry.last_read,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, manga_id: &str) -> Result<Option<ReadingProgressEntry>> {
        let manga_id = manga_id.to_string();
        self.db
            .execute(move |conn| {
                Ok(conn
                    .query_row(
                        &format!("SELECT {} FROM reading_progress WHERE manga_id = ?", PROGRESS_COLUMNS),
                        [&manga_id],
                        progress_from_row,
                    )
                    .optional()?)
            })
            .await
    }
}

#[async_trait]
impl ReadingProgressStore for ReadingProgressRepository {
    async fn list_all(&self) -> Result<Vec<ReadingProgressEntry>> {
        self.db
            .execute(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM reading_progress ORDER BY last_read DESC",
                    PROGRESS_COLUMNS
                ))?;
                let entries = stmt
                    .query_map([], progress_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(entries)
            })
            .await
    }

    async fn remove(&self, manga_id: &str) -> Result<()> {
        let manga_id = manga_id.to_string();
        self.db
            .execute(move |conn| {
                conn.execute("DELETE FROM reading_progress WHERE manga_id = ?", [&manga_id])?;
                Ok(())
            })
            .await
    }
}

/// Repository for downloaded manga and their page files
#[derive(Debug, Clone)]
pub struct DownloadRepository {
    db: Arc<DatabaseManager>,
    downloads_dir: PathBuf,
}

impl DownloadRepository {
    pub fn new(db: Arc<DatabaseManager>, downloads_dir: PathBuf) -> Self {
        Self { db, downloads_dir }
    }

    pub fn downloads_dir(&self) -> &Path {
        &self.downloads_dir
    }

    /// Record a downloaded chapter, creating the manga row if needed
    pub async fn record_chapter(
        &self,
        manga_id: &str,
        source_id: &str,
        title: Option<&str>,
        chapter: &DownloadedChapter,
    ) -> Result<()> {
        let manga_id = manga_id.to_string();
        let source_id = source_id.to_string();
        let title = title.map(str::to_string);
        let chapter = chapter.clone();
        let pages = serde_json::to_string(&chapter.pages)?;

        self.db
            .transaction(move |tx| {
                tx.execute(
                    "INSERT INTO downloaded_manga (manga_id, source_id, title) VALUES (?1, ?2, ?3) \
                     ON CONFLICT(manga_id) DO UPDATE SET source_id = excluded.source_id, \
                     title = COALESCE(excluded.title, downloaded_manga.title)",
                    params![manga_id, source_id, title],
                )?;
                tx.execute(
                    "INSERT OR REPLACE INTO downloaded_chapters \
                     (chapter_id, manga_id, chapter_number, pages, downloaded_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![chapter.chapter_id, manga_id, chapter.chapter_number, pages, chapter.downloaded_at],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn find(&self, manga_id: &str) -> Result<Option<DownloadedManga>> {
        let manga_id = manga_id.to_string();
        let all = self.list_all().await?;
        Ok(all.into_iter().find(|m| m.manga_id == manga_id))
    }
}

#[async_trait]
impl DownloadStore for DownloadRepository {
    async fn list_all(&self) -> Result<Vec<DownloadedManga>> {
        self.db
            .execute(|conn| {
                let mut manga: BTreeMap<String, DownloadedManga> = BTreeMap::new();

                let mut stmt = conn.prepare("SELECT manga_id, source_id, title FROM downloaded_manga")?;
                let rows = stmt.query_map([], |row| {
                    Ok(DownloadedManga {
                        manga_id: row.get(0)?,
                        source_id: row.get(1)?,
                        title: row.get(2)?,
                        chapters: Vec::new(),
                    })
                })?;
                for row in rows {
                    let entry = row?;
                    manga.insert(entry.manga_id.clone(), entry);
                }

                let mut stmt = conn.prepare(
                    "SELECT manga_id, chapter_id, chapter_number, pages, downloaded_at \
                     FROM downloaded_chapters ORDER BY downloaded_at ASC",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                })?;
                for row in rows {
                    let (manga_id, chapter_id, chapter_number, pages, downloaded_at) = row?;
                    let pages: Vec<PathBuf> = serde_json::from_str(&pages)?;
                    if let Some(entry) = manga.get_mut(&manga_id) {
                        entry.chapters.push(DownloadedChapter {
                            chapter_id,
                            chapter_number,
                            pages,
                            downloaded_at,
                        });
                    }
                }

                Ok(manga.into_values().collect())
            })
            .await
    }

    async fn delete_manga(&self, manga_id: &str) -> Result<()> {
        if let Some(manga) = self.find(manga_id).await? {
            for chapter in &manga.chapters {
                for page in &chapter.pages {
                    match tokio::fs::remove_file(page).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => {
                            tracing::warn!(manga_id = %manga_id, page = %page.display(), error = %e, "Failed to remove page file");
                        }
                    }
                }
            }
        }

        let dir = manga_download_dir(&self.downloads_dir, manga_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let manga_id = manga_id.to_string();
        self.db
            .execute(move |conn| {
                conn.execute("DELETE FROM downloaded_manga WHERE manga_id = ?", [&manga_id])?;
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(manga_id: &str, source_id: &str, last_read: i64) -> ReadingProgressEntry {
        ReadingProgressEntry {
            manga_id: manga_id.to_string(),
            source_id: source_id.to_string(),
            manga_title: Some(format!("Title {}", manga_id)),
            manga_cover: None,
            chapter_id: Some("c1".to_string()),
            chapter_number: Some("1".to_string()),
            page: 3,
            last_read,
        }
    }

    #[tokio::test]
    async fn test_progress_ordering_and_upsert() {
        let db = Arc::new(DatabaseManager::new_in_memory().unwrap());
        let repo = ReadingProgressRepository::new(db);

        repo.save(&entry("a", "src", 100)).await.unwrap();
        repo.save(&entry("b", "src", 300)).await.unwrap();
        repo.save(&entry("c", "other", 200)).await.unwrap();

        let ids: Vec<_> = repo.list_all().await.unwrap().into_iter().map(|e| e.manga_id).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);

        let mut updated = entry("a", "src", 400);
        updated.page = 9;
        repo.save(&updated).await.unwrap();

        let all = repo.list_all().await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].manga_id, "a");
        assert_eq!(repo.get("a").await.unwrap().unwrap().page, 9);
    }

    #[tokio::test]
    async fn test_progress_remove_missing_is_ok() {
        let db = Arc::new(DatabaseManager::new_in_memory().unwrap());
        let repo = ReadingProgressRepository::new(db);

        repo.remove("nope").await.unwrap();
        repo.save(&entry("a", "src", 1)).await.unwrap();
        repo.remove("a").await.unwrap();
        assert!(repo.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_download_delete_removes_files_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(DatabaseManager::new_in_memory().unwrap());
        let repo = DownloadRepository::new(db, dir.path().to_path_buf());

        let chapter_dir = chapter_download_dir(dir.path(), "manga/1", "ch 1");
        std::fs::create_dir_all(&chapter_dir).unwrap();
        let page = chapter_dir.join("001.jpg");
        std::fs::write(&page, b"img").unwrap();

        let chapter = DownloadedChapter {
            chapter_id: "ch 1".to_string(),
            chapter_number: Some("1".to_string()),
            pages: vec![page.clone()],
            downloaded_at: 10,
        };
        repo.record_chapter("manga/1", "src", Some("Manga"), &chapter).await.unwrap();

        let all = repo.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].chapters, vec![chapter]);

        repo.delete_manga("manga/1").await.unwrap();
        assert!(!page.exists());
        assert!(!manga_download_dir(dir.path(), "manga/1").exists());
        assert!(repo.list_all().await.unwrap().is_empty());

        // Deleting again is harmless.
        repo.delete_manga("manga/1").await.unwrap();
    }

    #[test]
    fn test_download_dir_segments_are_sanitized() {
        let root = Path::new("/data");
        assert_eq!(manga_download_dir(root, "../etc"), PathBuf::from("/data/___etc"));
        assert_eq!(chapter_download_dir(root, "m", ""), PathBuf::from("/data/m/_"));
    }
}
