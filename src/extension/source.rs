//! The capability contract every content source fulfils

use crate::core::error::Result;
use crate::extension::types::{
    ChapterSummary, ExplorerOptions, InformationsOptions, MangaInformations, MangaSummary, SearchOptions, Shelf,
};
use async_trait::async_trait;

/// A manga content source
///
/// Implemented natively by built-in sources and by [`ScriptSource`] for
/// installed extension scripts. Every remote operation is gated by the
/// source's rate-limit guard and fails with `RateLimited` while it cools
/// down, and with `NotConnected` when the device is offline.
///
/// [`ScriptSource`]: crate::extension::script_source::ScriptSource
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Registry identifier
    fn id(&self) -> &str;

    /// Display name
    fn name(&self) -> &str;

    async fn search(&self, query: &str, options: &SearchOptions) -> Result<Vec<MangaSummary>>;

    /// Named shelves, in the order the source presents them
    async fn explorer(&self, options: &ExplorerOptions) -> Result<Vec<Shelf>>;

    async fn informations(&self, manga_id: &str, options: &InformationsOptions) -> Result<MangaInformations>;

    /// One page of chapters, `page` starting at 1
    async fn chapters(&self, manga_id: &str, language: &str, page: u32, limit: u32) -> Result<Vec<ChapterSummary>>;

    /// Page image URLs of a chapter, in reading order
    async fn reader(&self, chapter_id: &str) -> Result<Vec<String>>;

    /// Whether the source is cooling down. Never performs I/O.
    fn is_rate_limited(&self) -> bool;
}
