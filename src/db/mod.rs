//! Database module
//!
//! Reading progress and offline download records, stored in SQLite.

pub mod manager;
pub mod migrations;
pub mod models;
pub mod repository;

pub use manager::DatabaseManager;
pub use models::{DownloadedChapter, DownloadedManga, ReadingProgressEntry};
pub use repository::{DownloadRepository, DownloadStore, ReadingProgressRepository, ReadingProgressStore};
