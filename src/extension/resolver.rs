//! Source id to ready-to-call [`ContentSource`]
//!
//! Built-in sources are answered directly. Installed scripts are re-read
//! and re-evaluated on every resolve, so a resolved source always matches
//! the script on disk. Rate-limit guards outlive those evaluations: one
//! guard per source id, shared by every resolved instance.

use crate::core::error::{Result, TsukiyoError};
use crate::core::network::NetworkMonitor;
use crate::core::rate_limit::{Clock, RateLimitGuard, SystemClock};
use crate::extension::contract;
use crate::extension::registry::SourceRegistry;
use crate::extension::script_source::ScriptSource;
use crate::extension::source::ContentSource;
use crate::extension::worker::ScriptHost;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

pub struct SourceResolver {
    registry: Arc<SourceRegistry>,
    host: ScriptHost,
    network: Arc<dyn NetworkMonitor>,
    builtins: Vec<Arc<dyn ContentSource>>,
    cooldown: Duration,
    clock: Arc<dyn Clock>,
    guards: Mutex<HashMap<String, Arc<RateLimitGuard>>>,
}

impl SourceResolver {
    pub fn new(
        registry: Arc<SourceRegistry>,
        host: ScriptHost,
        network: Arc<dyn NetworkMonitor>,
        cooldown: Duration,
    ) -> Self {
        Self {
            registry,
            host,
            network,
            builtins: Vec::new(),
            cooldown,
            clock: Arc::new(SystemClock),
            guards: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_builtin(mut self, source: Arc<dyn ContentSource>) -> Self {
        self.builtins.push(source);
        self
    }

    pub fn builtins(&self) -> &[Arc<dyn ContentSource>] {
        &self.builtins
    }

    pub fn builtin_ids(&self) -> Vec<String> {
        self.builtins.iter().map(|s| s.id().to_string()).collect()
    }

    /// The guard shared by every instance of `source_id`
    pub fn guard_for(&self, source_id: &str) -> Arc<RateLimitGuard> {
        let mut guards = self.guards.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guards
            .entry(source_id.to_string())
            .or_insert_with(|| {
                Arc::new(RateLimitGuard::with_clock(source_id, self.cooldown, self.clock.clone()))
            })
            .clone()
    }

    /// Drop the guard of an uninstalled source
    pub fn forget(&self, source_id: &str) {
        let mut guards = self.guards.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guards.remove(source_id);
    }

    /// Resolve an id, `None` when no such source exists
    pub async fn resolve(&self, id: &str) -> Result<Option<Arc<dyn ContentSource>>> {
        if let Some(builtin) = self.builtins.iter().find(|s| s.id() == id) {
            return Ok(Some(builtin.clone()));
        }

        let Some(source) = self.registry.find_by_id(id).await? else {
            debug!(source = %id, "No such source");
            return Ok(None);
        };

        let code = tokio::fs::read_to_string(&source.file_path).await.map_err(|e| {
            warn!(source = %id, path = %source.file_path.display(), error = %e, "Cannot read installed script");
            TsukiyoError::ExtensionEvaluationFailed(format!(
                "script for {} at {} is unreadable: {}",
                id,
                source.file_path.display(),
                e
            ))
        })?;

        let guard = self.guard_for(id);
        let (worker, report) = self.host.evaluate(id, code, guard.clone()).await?;
        contract::validate(&report)?;

        debug!(source = %id, "Source resolved");
        Ok(Some(Arc::new(ScriptSource::new(source, worker, guard, self.network.clone()))))
    }
}
