//! Tsukiyo
//!
//! Manga reader core: content sources (built-in and installed extension
//! scripts), reading progress and offline downloads.

pub mod core;
pub mod db;
pub mod extension;

// Re-export commonly used types
pub use crate::core::{Config, TsukiyoError};
pub use db::DatabaseManager;
pub use extension::{ContentSource, ExtensionManager};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
