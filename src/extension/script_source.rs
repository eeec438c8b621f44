//! Content source backed by an installed extension script

use crate::core::error::{Result, TsukiyoError};
use crate::core::network::NetworkMonitor;
use crate::core::rate_limit::RateLimitGuard;
use crate::extension::registry::Source;
use crate::extension::source::ContentSource;
use crate::extension::types::{
    ChapterSummary, ExplorerOptions, InformationsOptions, MangaInformations, MangaSummary, SearchOptions, Shelf,
};
use crate::extension::worker::ScriptWorker;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;

/// A validated, evaluated extension script
pub struct ScriptSource {
    source: Source,
    worker: ScriptWorker,
    guard: Arc<RateLimitGuard>,
    network: Arc<dyn NetworkMonitor>,
}

impl std::fmt::Debug for ScriptSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptSource")
            .field("id", &self.source.id)
            .field("version", &self.source.version)
            .finish()
    }
}

impl ScriptSource {
    pub fn new(
        source: Source,
        worker: ScriptWorker,
        guard: Arc<RateLimitGuard>,
        network: Arc<dyn NetworkMonitor>,
    ) -> Self {
        Self {
            source,
            worker,
            guard,
            network,
        }
    }

    pub fn record(&self) -> &Source {
        &self.source
    }

    async fn call<T: DeserializeOwned + Default>(&self, member: &str, args: Vec<Value>) -> Result<T> {
        if !self.network.is_connected().await {
            return Err(TsukiyoError::NotConnected);
        }
        self.guard.check()?;

        tracing::debug!(source = %self.source.id, member, "Calling extension");
        let value = self.worker.invoke(member, args).await?;
        decode(&self.source.id, member, value)
    }
}

/// `null` and `undefined` results count as empty
fn decode<T: DeserializeOwned + Default>(source_id: &str, member: &str, value: Value) -> Result<T> {
    if value.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(value).map_err(|e| {
        TsukiyoError::ExtensionCallFailed(format!("{}.{} returned an unexpected shape: {}", source_id, member, e))
    })
}

/// Explorer results are an object of shelf name to entries, or already a list of shelves
fn decode_shelves(source_id: &str, value: Value) -> Result<Vec<Shelf>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Object(map) => map
            .into_iter()
            .map(|(name, entries)| {
                let entries: Vec<MangaSummary> = decode(source_id, "explorer", entries)?;
                Ok(Shelf { name, entries })
            })
            .collect(),
        other => decode(source_id, "explorer", other),
    }
}

#[async_trait]
impl ContentSource for ScriptSource {
    fn id(&self) -> &str {
        &self.source.id
    }

    fn name(&self) -> &str {
        &self.source.name
    }

    async fn search(&self, query: &str, options: &SearchOptions) -> Result<Vec<MangaSummary>> {
        self.call("search", vec![json!(query), serde_json::to_value(options)?]).await
    }

    async fn explorer(&self, options: &ExplorerOptions) -> Result<Vec<Shelf>> {
        let value: Value = self.call("explorer", vec![serde_json::to_value(options)?]).await?;
        decode_shelves(&self.source.id, value)
    }

    async fn informations(&self, manga_id: &str, options: &InformationsOptions) -> Result<MangaInformations> {
        self.call("informations", vec![json!(manga_id), serde_json::to_value(options)?]).await
    }

    async fn chapters(&self, manga_id: &str, language: &str, page: u32, limit: u32) -> Result<Vec<ChapterSummary>> {
        self.call("chapters", vec![json!(manga_id), json!(language), json!(page), json!(limit)])
            .await
    }

    async fn reader(&self, chapter_id: &str) -> Result<Vec<String>> {
        self.call("reader", vec![json!(chapter_id)]).await
    }

    fn is_rate_limited(&self) -> bool {
        self.guard.is_rate_limited()
    }
}
