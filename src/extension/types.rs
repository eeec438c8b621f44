//! Data shapes exchanged with content sources
//!
//! Field names follow the JSON that extension scripts produce. Anything a
//! script returns beyond the known fields is kept in `extra`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A manga as listed in search results and explorer shelves
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MangaSummary {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, alias = "cover", alias = "image")]
    pub cover_url: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MangaSummary {
    pub fn new(id: impl Into<String>, title: Option<String>) -> Self {
        Self {
            id: id.into(),
            title,
            cover_url: None,
            extra: Map::new(),
        }
    }
}

/// Full description of one manga
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MangaDetail {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, alias = "cover", alias = "image")]
    pub cover_url: Option<String>,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub content_rating: Option<String>,
    #[serde(default)]
    pub available_languages: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One chapter of a manga
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterSummary {
    pub id: String,
    #[serde(default, deserialize_with = "number_or_string")]
    pub chapter: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, alias = "translatedLanguage")]
    pub language: Option<String>,
    #[serde(default)]
    pub pages: Option<u32>,
    #[serde(default, alias = "publishAt")]
    pub published_at: Option<String>,
    #[serde(default)]
    pub external_url: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Chapter numbers arrive as "12.5" from some sources and 12.5 from others.
fn number_or_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Sort order for search
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SearchOrder {
    #[default]
    Relevance,
    LatestUploadedChapter,
    FollowedCount,
    CreatedAt,
    Title,
}

impl SearchOrder {
    /// Key and direction as understood by sources, e.g. `("followedCount", "desc")`
    pub fn key_direction(&self) -> (&'static str, &'static str) {
        match self {
            SearchOrder::Relevance => ("relevance", "desc"),
            SearchOrder::LatestUploadedChapter => ("latestUploadedChapter", "desc"),
            SearchOrder::FollowedCount => ("followedCount", "desc"),
            SearchOrder::CreatedAt => ("createdAt", "desc"),
            SearchOrder::Title => ("title", "asc"),
        }
    }

    pub fn parse(key: &str) -> Option<Self> {
        match key {
            "relevance" => Some(SearchOrder::Relevance),
            "latestUploadedChapter" | "latest" => Some(SearchOrder::LatestUploadedChapter),
            "followedCount" | "followed" => Some(SearchOrder::FollowedCount),
            "createdAt" | "created" => Some(SearchOrder::CreatedAt),
            "title" => Some(SearchOrder::Title),
            _ => None,
        }
    }
}

impl Serialize for SearchOrder {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let (key, direction) = self.key_direction();
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(key, direction)?;
        map.end()
    }
}

/// Options passed to `search`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchOptions {
    pub limit: u32,
    /// Include mature content
    #[serde(rename = "plusEighteen")]
    pub mature: bool,
    pub order: SearchOrder,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            mature: false,
            order: SearchOrder::Relevance,
        }
    }
}

/// Options passed to `explorer`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplorerOptions {
    pub limit: u32,
    #[serde(rename = "plusEighteen")]
    pub mature: bool,
}

impl Default for ExplorerOptions {
    fn default() -> Self {
        Self { limit: 10, mature: false }
    }
}

/// Options passed to `informations`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InformationsOptions {
    pub language: String,
    pub page: u32,
    pub limit: u32,
}

impl Default for InformationsOptions {
    fn default() -> Self {
        Self {
            language: "en".to_string(),
            page: 1,
            limit: 100,
        }
    }
}

/// A named list of manga on the explorer screen
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shelf {
    pub name: String,
    pub entries: Vec<MangaSummary>,
}

/// Result of `informations`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MangaInformations {
    /// Absent when the details lookup failed but chapters may still be listed
    #[serde(default)]
    pub details: Option<MangaDetail>,
    #[serde(default)]
    pub chapters: Vec<ChapterSummary>,
}
