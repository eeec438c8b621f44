//! Database models
//!
//! Data structures representing database tables

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Last reading position for a manga
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingProgressEntry {
    pub manga_id: String,
    pub source_id: String,
    pub manga_title: Option<String>,
    pub manga_cover: Option<String>,
    pub chapter_id: Option<String>,
    pub chapter_number: Option<String>,
    pub page: u32,
    /// Epoch milliseconds
    pub last_read: i64,
}

/// A downloaded manga with its chapters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadedManga {
    pub manga_id: String,
    pub source_id: String,
    pub title: Option<String>,
    pub chapters: Vec<DownloadedChapter>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadedChapter {
    pub chapter_id: String,
    pub chapter_number: Option<String>,
    /// Page image files in reading order
    pub pages: Vec<PathBuf>,
    /// Epoch milliseconds
    pub downloaded_at: i64,
}
