//! Built-in MangaDex source
//!
//! Native implementation of the [`ContentSource`] contract against the
//! MangaDex REST API. Installed scripts are held to the same contract.

use crate::core::error::{Result, TsukiyoError};
use crate::core::http::{HttpRequest, HttpTransport};
use crate::core::network::NetworkMonitor;
use crate::core::rate_limit::RateLimitGuard;
use crate::extension::source::ContentSource;
use crate::extension::types::{
    ChapterSummary, ExplorerOptions, InformationsOptions, MangaDetail, MangaInformations, MangaSummary,
    SearchOptions, SearchOrder, Shelf,
};
use async_trait::async_trait;
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

pub const MANGADEX_ID: &str = "mangadex";
pub const DEFAULT_API_URL: &str = "https://api.mangadex.org";
pub const DEFAULT_COVERS_URL: &str = "https://uploads.mangadex.org/covers";

const SAFE_RATINGS: [&str; 2] = ["safe", "suggestive"];
const MATURE_RATINGS: [&str; 2] = ["erotica", "pornographic"];

#[derive(Debug, Deserialize)]
struct Collection<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct Single<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct Relationship {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    attributes: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct MangaEntity {
    id: String,
    #[serde(default)]
    attributes: MangaAttributes,
    #[serde(default)]
    relationships: Vec<Relationship>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct MangaAttributes {
    title: Value,
    description: Value,
    status: Option<String>,
    year: Option<i32>,
    content_rating: Option<String>,
    available_translated_languages: Vec<Option<String>>,
    tags: Vec<TagEntity>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TagEntity {
    attributes: TagAttributes,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TagAttributes {
    name: Value,
}

#[derive(Debug, Deserialize)]
struct ChapterEntity {
    id: String,
    #[serde(default)]
    attributes: ChapterAttributes,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ChapterAttributes {
    chapter: Option<String>,
    title: Option<String>,
    translated_language: Option<String>,
    pages: Option<u32>,
    publish_at: Option<String>,
    external_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CoverEntity {
    attributes: CoverAttributes,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct CoverAttributes {
    file_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AtHome {
    base_url: String,
    chapter: AtHomeChapter,
}

#[derive(Debug, Deserialize)]
struct AtHomeChapter {
    hash: String,
    data: Vec<String>,
}

/// Localized string map (`{"en": "..."}`), preferring `language`, then English, then anything
fn localized(value: &Value, language: &str) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map
            .get(language)
            .or_else(|| map.get("en"))
            .or_else(|| map.values().next())
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

pub struct MangaDexSource {
    api_url: String,
    covers_url: String,
    transport: Arc<dyn HttpTransport>,
    guard: Arc<RateLimitGuard>,
    network: Arc<dyn NetworkMonitor>,
}

impl MangaDexSource {
    pub fn new(transport: Arc<dyn HttpTransport>, guard: Arc<RateLimitGuard>, network: Arc<dyn NetworkMonitor>) -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            covers_url: DEFAULT_COVERS_URL.to_string(),
            transport,
            guard,
            network,
        }
    }

    pub fn with_base_urls(mut self, api_url: impl Into<String>, covers_url: impl Into<String>) -> Self {
        self.api_url = api_url.into().trim_end_matches('/').to_string();
        self.covers_url = covers_url.into().trim_end_matches('/').to_string();
        self
    }

    fn endpoint(&self, path: &str, params: &[(String, String)]) -> Result<Url> {
        let mut url = Url::parse(&format!("{}{}", self.api_url, path))
            .map_err(|e| TsukiyoError::ValidationError(format!("Invalid MangaDex URL for {}: {}", path, e)))?;
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        if !self.network.is_connected().await {
            return Err(TsukiyoError::NotConnected);
        }
        self.guard.check()?;

        debug!(url = %url, "MangaDex request");
        let response = self
            .transport
            .send(HttpRequest::get(url.as_str()).header("Accept", "application/json"))
            .await?;

        if self.guard.record_status(response.status) {
            return Err(self.guard.rate_limited_error());
        }
        if !response.is_success() {
            return Err(TsukiyoError::NetworkError(format!(
                "MangaDex answered {} for {}",
                response.status,
                url.path()
            )));
        }

        response.json()
    }

    /// Cover file name from an included `cover_art` relationship, fetching it when not included
    async fn cover_file_name(&self, manga: &MangaEntity) -> Option<String> {
        let cover = manga.relationships.iter().find(|r| r.kind == "cover_art")?;

        let included = cover
            .attributes
            .as_ref()
            .and_then(|a| a.get("fileName"))
            .and_then(Value::as_str);
        if let Some(file_name) = included {
            return Some(file_name.to_string());
        }

        let url = self.endpoint(&format!("/cover/{}", cover.id), &[]).ok()?;
        match self.get_json::<Single<CoverEntity>>(url).await {
            Ok(found) => found.data.attributes.file_name,
            Err(e) => {
                warn!(manga_id = %manga.id, error = %e, "Failed to fetch cover");
                None
            }
        }
    }

    fn cover_url(&self, manga_id: &str, file_name: &str) -> String {
        format!("{}/{}/{}", self.covers_url, manga_id, file_name)
    }

    fn summary(&self, manga: &MangaEntity, cover_file: Option<String>) -> MangaSummary {
        let mut extra = Map::new();
        if let Some(status) = &manga.attributes.status {
            extra.insert("status".to_string(), Value::String(status.clone()));
        }
        if let Some(file_name) = &cover_file {
            extra.insert("coverFileName".to_string(), Value::String(file_name.clone()));
        }

        MangaSummary {
            id: manga.id.clone(),
            title: localized(&manga.attributes.title, "en"),
            cover_url: cover_file.map(|f| self.cover_url(&manga.id, &f)),
            extra,
        }
    }

    async fn list_manga(&self, title: &str, limit: u32, mature: bool, order: SearchOrder) -> Result<Vec<MangaSummary>> {
        let mut params = vec![param("limit", limit), param("includes[]", "cover_art")];
        if !title.is_empty() {
            params.push(param("title", title));
        }

        let mut ratings = SAFE_RATINGS.to_vec();
        if mature {
            ratings.extend(MATURE_RATINGS);
        }
        params.extend(ratings.into_iter().map(|rating| param("contentRating[]", rating)));

        // Relevance only means something for a title search.
        if order != SearchOrder::Relevance || !title.is_empty() {
            let (key, direction) = order.key_direction();
            params.push((format!("order[{}]", key), direction.to_string()));
        }
        let url = self.endpoint("/manga", &params)?;

        let manga: Collection<MangaEntity> = self.get_json(url).await?;

        // Covers are enriched concurrently.
        let covers = join_all(manga.data.iter().map(|m| self.cover_file_name(m))).await;
        Ok(manga
            .data
            .iter()
            .zip(covers)
            .map(|(m, cover)| self.summary(m, cover))
            .collect())
    }

    async fn detail(&self, manga_id: &str, language: &str) -> Result<MangaDetail> {
        let url = self.endpoint(
            &format!("/manga/{}", manga_id),
            &[param("includes[]", "cover_art"), param("includes[]", "author")],
        )?;
        let manga: Single<MangaEntity> = self.get_json(url).await?;
        let manga = manga.data;
        let cover = self.cover_file_name(&manga).await;

        let authors = manga
            .relationships
            .iter()
            .filter(|r| r.kind == "author")
            .filter_map(|r| r.attributes.as_ref()?.get("name")?.as_str().map(str::to_string))
            .collect();

        Ok(MangaDetail {
            id: manga.id.clone(),
            title: localized(&manga.attributes.title, language),
            description: localized(&manga.attributes.description, language),
            status: manga.attributes.status.clone(),
            cover_url: cover.map(|f| self.cover_url(&manga.id, &f)),
            authors,
            tags: manga
                .attributes
                .tags
                .iter()
                .filter_map(|t| localized(&t.attributes.name, language))
                .collect(),
            year: manga.attributes.year,
            content_rating: manga.attributes.content_rating.clone(),
            available_languages: manga
                .attributes
                .available_translated_languages
                .iter()
                .flatten()
                .cloned()
                .collect(),
            extra: Map::new(),
        })
    }
}

fn param(key: &str, value: impl ToString) -> (String, String) {
    (key.to_string(), value.to_string())
}

#[async_trait]
impl ContentSource for MangaDexSource {
    fn id(&self) -> &str {
        MANGADEX_ID
    }

    fn name(&self) -> &str {
        "MangaDex"
    }

    async fn search(&self, query: &str, options: &SearchOptions) -> Result<Vec<MangaSummary>> {
        self.list_manga(query, options.limit, options.mature, options.order).await
    }

    async fn explorer(&self, options: &ExplorerOptions) -> Result<Vec<Shelf>> {
        let (latest, followed) = futures::try_join!(
            self.list_manga("", options.limit, options.mature, SearchOrder::LatestUploadedChapter),
            self.list_manga("", options.limit, options.mature, SearchOrder::FollowedCount),
        )?;

        Ok(vec![
            Shelf {
                name: "Latest Manga".to_string(),
                entries: latest,
            },
            Shelf {
                name: "Most Followed Manga".to_string(),
                entries: followed,
            },
        ])
    }

    async fn informations(&self, manga_id: &str, options: &InformationsOptions) -> Result<MangaInformations> {
        let (detail, chapters) = futures::join!(
            self.detail(manga_id, &options.language),
            self.chapters(manga_id, &options.language, options.page, options.limit),
        );
        let chapters = chapters?;

        let details = match detail {
            Ok(detail) => Some(detail),
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                warn!(manga_id = %manga_id, error = %e, "Manga details unavailable, listing chapters only");
                None
            }
        };

        Ok(MangaInformations { details, chapters })
    }

    async fn chapters(&self, manga_id: &str, language: &str, page: u32, limit: u32) -> Result<Vec<ChapterSummary>> {
        let offset = page.saturating_sub(1).saturating_mul(limit);
        let mut params = vec![
            param("order[chapter]", "asc"),
            param("limit", limit),
            param("offset", offset),
        ];
        if !language.is_empty() {
            params.push(param("translatedLanguage[]", language));
        }

        let url = self.endpoint(&format!("/manga/{}/feed", manga_id), &params)?;
        let feed: Collection<ChapterEntity> = self.get_json(url).await?;

        Ok(feed
            .data
            .into_iter()
            .map(|c| ChapterSummary {
                id: c.id,
                chapter: c.attributes.chapter,
                title: c.attributes.title,
                language: c.attributes.translated_language,
                pages: c.attributes.pages,
                published_at: c.attributes.publish_at,
                external_url: c.attributes.external_url,
                extra: Map::new(),
            })
            .collect())
    }

    async fn reader(&self, chapter_id: &str) -> Result<Vec<String>> {
        let url = self.endpoint(&format!("/at-home/server/{}", chapter_id), &[])?;
        let server: AtHome = self.get_json(url).await?;

        Ok(server
            .chapter
            .data
            .iter()
            .map(|file| format!("{}/data/{}/{}", server.base_url, server.chapter.hash, file))
            .collect())
    }

    fn is_rate_limited(&self) -> bool {
        self.guard.is_rate_limited()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::http::StaticTransport;
    use crate::core::network::StaticNetwork;
    use serde_json::json;
    use std::time::Duration;

    fn source(transport: Arc<StaticTransport>, online: bool) -> MangaDexSource {
        let network = if online { StaticNetwork::online() } else { StaticNetwork::offline() };
        MangaDexSource::new(
            transport,
            Arc::new(RateLimitGuard::new(MANGADEX_ID, Duration::from_secs(60))),
            Arc::new(network),
        )
        .with_base_urls("https://api.test", "https://covers.test")
    }

    fn manga_list() -> Value {
        json!({
            "result": "ok",
            "data": [
                {
                    "id": "m1",
                    "attributes": { "title": { "en": "Frieren" }, "status": "ongoing" },
                    "relationships": [
                        { "id": "c1", "type": "cover_art", "attributes": { "fileName": "f.jpg" } }
                    ]
                },
                {
                    "id": "m2",
                    "attributes": { "title": { "ja-ro": "Dungeon Meshi" } },
                    "relationships": [{ "id": "c2", "type": "cover_art" }]
                },
                { "id": "m3", "attributes": { "title": {} }, "relationships": [] }
            ]
        })
    }

    #[tokio::test]
    async fn test_search_enriches_covers() {
        let transport = Arc::new(StaticTransport::new());
        transport.route_json("https://api.test/manga?", &manga_list());
        transport.route_json(
            "https://api.test/cover/c2",
            &json!({ "data": { "attributes": { "fileName": "g.png" } } }),
        );

        let results = source(transport.clone(), true)
            .search("fri", &SearchOptions::default())
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].cover_url.as_deref(), Some("https://covers.test/m1/f.jpg"));
        assert_eq!(results[1].title.as_deref(), Some("Dungeon Meshi"));
        assert_eq!(results[1].cover_url.as_deref(), Some("https://covers.test/m2/g.png"));
        assert_eq!(results[2].cover_url, None);

        let search_url = &transport.requests()[0].url;
        assert!(search_url.contains("title=fri"));
        assert!(search_url.contains("order%5Brelevance%5D=desc"));
        assert!(!search_url.contains("pornographic"));
        // One search plus one cover lookup
        assert_eq!(transport.request_count(), 2);
    }

    #[tokio::test]
    async fn test_explorer_shelves_in_order() {
        let transport = Arc::new(StaticTransport::new());
        transport.route_json("https://api.test/manga?", &json!({ "data": [] }));

        let shelves = source(transport.clone(), true)
            .explorer(&ExplorerOptions::default())
            .await
            .unwrap();

        let names: Vec<_> = shelves.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Latest Manga", "Most Followed Manga"]);
        assert_eq!(transport.request_count(), 2);
    }

    #[tokio::test]
    async fn test_chapters_pagination() {
        let transport = Arc::new(StaticTransport::new());
        transport.route_json(
            "https://api.test/manga/m1/feed",
            &json!({ "data": [
                { "id": "ch1", "attributes": { "chapter": "1", "translatedLanguage": "fr", "pages": 20 } }
            ] }),
        );

        let chapters = source(transport.clone(), true).chapters("m1", "fr", 3, 100).await.unwrap();
        assert_eq!(chapters[0].chapter.as_deref(), Some("1"));
        assert_eq!(chapters[0].language.as_deref(), Some("fr"));

        let url = &transport.requests()[0].url;
        assert!(url.contains("offset=200"));
        assert!(url.contains("order%5Bchapter%5D=asc"));
        assert!(url.contains("translatedLanguage%5B%5D=fr"));
    }

    #[tokio::test]
    async fn test_informations_without_details() {
        let transport = Arc::new(StaticTransport::new());
        transport.route_json("https://api.test/manga/m1/feed", &json!({ "data": [{ "id": "ch1" }] }));

        let info = source(transport, true)
            .informations("m1", &InformationsOptions::default())
            .await
            .unwrap();
        assert!(info.details.is_none());
        assert_eq!(info.chapters.len(), 1);
    }

    #[tokio::test]
    async fn test_reader_builds_page_urls() {
        let transport = Arc::new(StaticTransport::new());
        transport.route_json(
            "https://api.test/at-home/server/ch1",
            &json!({ "baseUrl": "https://node.test", "chapter": { "hash": "h", "data": ["1.png", "2.png"] } }),
        );

        let pages = source(transport, true).reader("ch1").await.unwrap();
        assert_eq!(pages, vec!["https://node.test/data/h/1.png", "https://node.test/data/h/2.png"]);
    }

    #[tokio::test]
    async fn test_429_trips_guard() {
        let transport = Arc::new(StaticTransport::new());
        transport.route("https://api.test/at-home/server/", 429, "slow down");
        let source = source(transport.clone(), true);

        assert!(matches!(source.reader("ch1").await, Err(TsukiyoError::RateLimited { .. })));
        assert!(source.is_rate_limited());

        assert!(matches!(source.reader("ch1").await, Err(TsukiyoError::RateLimited { .. })));
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn test_offline_issues_no_request() {
        let transport = Arc::new(StaticTransport::new());
        let result = source(transport.clone(), false).reader("ch1").await;
        assert!(matches!(result, Err(TsukiyoError::NotConnected)));
        assert_eq!(transport.request_count(), 0);
    }

    #[test]
    fn test_localized_fallbacks() {
        assert_eq!(localized(&json!({ "fr": "Bonjour", "en": "Hello" }), "fr").as_deref(), Some("Bonjour"));
        assert_eq!(localized(&json!({ "fr": "Bonjour", "en": "Hello" }), "de").as_deref(), Some("Hello"));
        assert_eq!(localized(&json!([]), "en"), None);
    }
}
