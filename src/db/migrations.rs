//! Database migrations

use crate::core::error::Result;
use rusqlite::Connection;
use tracing::{debug, info, warn};

/// Migration version tracking table
const MIGRATION_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    applied_at DATETIME DEFAULT CURRENT_TIMESTAMP
)
"#;

/// Initial schema (version 1)
const MIGRATION_V1: &str = r#"
-- Reading progress, one row per manga
CREATE TABLE IF NOT EXISTS reading_progress (
    manga_id TEXT PRIMARY KEY,
    source_id TEXT NOT NULL,
    manga_title TEXT,
    manga_cover TEXT,
    chapter_id TEXT,
    chapter_number TEXT,
    page INTEGER NOT NULL DEFAULT 0,
    last_read INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_reading_progress_source ON reading_progress(source_id);
CREATE INDEX IF NOT EXISTS idx_reading_progress_last_read ON reading_progress(last_read);

-- Manga with at least one downloaded chapter
CREATE TABLE IF NOT EXISTS downloaded_manga (
    manga_id TEXT PRIMARY KEY,
    source_id TEXT NOT NULL,
    title TEXT,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_downloaded_manga_source ON downloaded_manga(source_id);

-- Downloaded chapters and their page image paths (JSON array)
CREATE TABLE IF NOT EXISTS downloaded_chapters (
    chapter_id TEXT NOT NULL,
    manga_id TEXT NOT NULL,
    chapter_number TEXT,
    pages TEXT NOT NULL,
    downloaded_at INTEGER NOT NULL,
    PRIMARY KEY (manga_id, chapter_id),
    FOREIGN KEY (manga_id) REFERENCES downloaded_manga(manga_id) ON DELETE CASCADE
);
"#;

/// Apply any migrations newer than the database's current version
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    debug!("Running database migrations");

    conn.execute_batch(MIGRATION_TABLE)?;

    let current_version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    debug!("Current database schema version: {}", current_version);

    if current_version < 1 {
        info!("Applying migration v1: Initial schema");
        apply_migration(conn, 1, MIGRATION_V1)?;
    }

    Ok(())
}

fn apply_migration(conn: &mut Connection, version: i64, sql: &str) -> Result<()> {
    let tx = conn.transaction()?;

    tx.execute_batch(sql).map_err(|e| {
        warn!("Migration v{} failed: {}", version, e);
        e
    })?;

    tx.execute("INSERT INTO schema_migrations (version) VALUES (?)", [version])?;
    tx.commit()?;

    info!("Migration v{} applied successfully", version);
    Ok(())
}
