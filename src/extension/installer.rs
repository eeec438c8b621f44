//! Extension installer
//!
//! Installing a script: normalize the URL, download it, optionally verify
//! its checksum, store it under a unique file name, evaluate it in a fresh
//! sandbox, validate the capability contract and register it. A failure at
//! any step after the file is written removes the file again.

use crate::core::error::{Result, TsukiyoError};
use crate::core::http::{HttpRequest, HttpTransport};
use crate::core::network::NetworkMonitor;
use crate::core::rate_limit::RateLimitGuard;
use crate::extension::contract::{self, CapabilityManifest};
use crate::extension::registry::{Source, SourceRegistry};
use crate::extension::worker::ScriptHost;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;

/// Rewrite a user-supplied script URL into one that serves the raw file
///
/// GitHub page URLs (`github.com/<owner>/<repo>/blob/<ref>/<path>`, and the
/// `/raw/` form) become `raw.githubusercontent.com/<owner>/<repo>/<ref>/<path>`.
/// Other http(s) URLs pass through without their fragment.
pub fn normalize_script_url(raw: &str) -> Result<String> {
    let mut url = Url::parse(raw.trim())
        .map_err(|e| TsukiyoError::ValidationError(format!("Invalid extension URL '{}': {}", raw, e)))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(TsukiyoError::ValidationError(format!(
            "Unsupported URL scheme '{}': only http and https are allowed",
            url.scheme()
        )));
    }
    url.set_fragment(None);

    let is_github = matches!(url.host_str(), Some("github.com") | Some("www.github.com"));
    if is_github {
        let segments: Vec<&str> = url.path_segments().map(|s| s.collect()).unwrap_or_default();
        if segments.len() >= 5 && matches!(segments[2], "blob" | "raw") {
            let mut rewritten = String::from("https://raw.githubusercontent.com");
            for (index, segment) in segments.iter().enumerate() {
                if index == 2 {
                    continue;
                }
                rewritten.push('/');
                rewritten.push_str(segment);
            }
            return Ok(rewritten);
        }
    }

    Ok(url.to_string())
}

fn extension_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\.[^/.]+$").unwrap_or_else(|e| panic!("invalid extension pattern: {e}")))
}

/// Base name for a script file: last URL path segment without its
/// extension, restricted to `[A-Za-z0-9_-]`
pub fn script_base_name(url: &str) -> String {
    let last = Url::parse(url)
        .ok()
        .and_then(|u| u.path_segments().and_then(|s| s.last().map(str::to_string)))
        .unwrap_or_default();
    let stem = extension_pattern().replace(&last, "");

    let cleaned: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim_matches('_').to_string();

    if cleaned.is_empty() {
        "extension".to_string()
    } else {
        cleaned
    }
}

/// `<base>-<millis>.js`, bumping the timestamp until the name is free
pub fn allocate_script_path(dir: &Path, base: &str, now_ms: i64) -> PathBuf {
    let mut stamp = now_ms;
    loop {
        let candidate = dir.join(format!("{}-{}.js", base, stamp));
        if !candidate.exists() {
            return candidate;
        }
        stamp += 1;
    }
}

/// First of `id`, `id-2`, `id-3`, ... not present in `taken`
pub fn unique_source_id(id: &str, taken: &HashSet<String>) -> String {
    if !taken.contains(id) {
        return id.to_string();
    }
    (2..)
        .map(|n| format!("{}-{}", id, n))
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or_else(|| id.to_string())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Removes a freshly written script unless the install is committed
struct PendingScript {
    path: PathBuf,
    committed: bool,
}

impl PendingScript {
    fn new(path: PathBuf) -> Self {
        Self { path, committed: false }
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for PendingScript {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        warn!("Rolling back installation: {}", self.path.display());
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                error!("Failed to remove rejected script {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Downloads, validates and registers extension scripts
pub struct ExtensionInstaller {
    extensions_dir: PathBuf,
    registry: Arc<SourceRegistry>,
    transport: Arc<dyn HttpTransport>,
    network: Arc<dyn NetworkMonitor>,
    host: ScriptHost,
    cooldown: Duration,
    reserved_ids: HashSet<String>,
}

impl ExtensionInstaller {
    pub fn new(
        extensions_dir: PathBuf,
        registry: Arc<SourceRegistry>,
        transport: Arc<dyn HttpTransport>,
        network: Arc<dyn NetworkMonitor>,
        host: ScriptHost,
        cooldown: Duration,
    ) -> Self {
        Self {
            extensions_dir,
            registry,
            transport,
            network,
            host,
            cooldown,
            reserved_ids: HashSet::new(),
        }
    }

    /// Ids that installed scripts may not take (built-in sources)
    pub fn with_reserved_ids<I: IntoIterator<Item = String>>(mut self, ids: I) -> Self {
        self.reserved_ids.extend(ids);
        self
    }

    /// Install the script at `url`
    pub async fn install(&self, url: &str) -> Result<Source> {
        self.install_inner(url, None).await
    }

    /// Install the script at `url`, refusing it unless its SHA-256 matches
    pub async fn install_verified(&self, url: &str, expected_sha256: &str) -> Result<Source> {
        self.install_inner(url, Some(expected_sha256)).await
    }

    async fn install_inner(&self, url: &str, expected_sha256: Option<&str>) -> Result<Source> {
        let url = normalize_script_url(url)?;

        if !self.network.is_connected().await {
            return Err(TsukiyoError::NotConnected);
        }

        info!(url = %url, "Installing extension");
        let bytes = self.download(&url).await?;

        let checksum = sha256_hex(&bytes);
        if let Some(expected) = expected_sha256 {
            if !checksum.eq_ignore_ascii_case(expected.trim()) {
                return Err(TsukiyoError::IntegrityMismatch(format!(
                    "expected sha256 {}, got {}",
                    expected.trim(),
                    checksum
                )));
            }
        }

        tokio::fs::create_dir_all(&self.extensions_dir).await?;
        let base = script_base_name(&url);
        let path = allocate_script_path(&self.extensions_dir, &base, chrono::Utc::now().timestamp_millis());
        tokio::fs::write(&path, &bytes).await?;
        let pending = PendingScript::new(path.clone());
        debug!(path = %path.display(), bytes = bytes.len(), "Script stored");

        // Evaluate what is on disk, exactly as later resolves will.
        let code = tokio::fs::read(&path).await?;
        let code = String::from_utf8(code)
            .map_err(|_| TsukiyoError::InvalidExtensionFormat("script is not UTF-8 text".to_string()))?;

        let manifest = self.evaluate_and_validate(&base, code).await?;

        let mut taken: HashSet<String> = self.registry.list().await?.into_iter().map(|s| s.id).collect();
        taken.extend(self.reserved_ids.iter().cloned());
        let id = unique_source_id(&manifest.id, &taken);
        if id != manifest.id {
            info!(declared = %manifest.id, assigned = %id, "Extension id already taken, using suffix");
        }

        let source = Source {
            id,
            name: manifest.name,
            version: manifest.version,
            file_path: path,
            source_url: Some(url),
            checksum: Some(checksum),
            installed_at: Some(chrono::Utc::now()),
        };

        self.registry.add(source.clone()).await?;
        pending.commit();

        info!(source = %source.id, version = %source.version, "Extension installed");
        Ok(source)
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let limit = self.host.sandbox().max_response_bytes();
        let response = self
            .transport
            .send(HttpRequest::get(url).max_body(limit))
            .await
            .map_err(|e| TsukiyoError::DownloadFailed(format!("{}: {}", url, e)))?;

        if !response.is_success() {
            return Err(TsukiyoError::DownloadFailed(format!(
                "{} answered with status {}",
                url, response.status
            )));
        }

        Ok(response.body)
    }

    async fn evaluate_and_validate(&self, label: &str, code: String) -> Result<CapabilityManifest> {
        // Install-time evaluation gets its own guard; the real one lives with the resolver.
        let guard = Arc::new(RateLimitGuard::new(label, self.cooldown));
        let (_worker, report) = self.host.evaluate(label, code, guard).await.map_err(|e| match e {
            TsukiyoError::ExtensionEvaluationFailed(_) => e,
            other => TsukiyoError::ExtensionEvaluationFailed(other.to_string()),
        })?;

        contract::validate(&report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_github_blob_url() {
        assert_eq!(
            normalize_script_url("https://github.com/u/r/blob/main/ext.js").unwrap(),
            "https://raw.githubusercontent.com/u/r/main/ext.js"
        );
        assert_eq!(
            normalize_script_url("https://github.com/u/r/raw/v1.2/dir/ext.js?raw=true#L3").unwrap(),
            "https://raw.githubusercontent.com/u/r/v1.2/dir/ext.js"
        );
    }

    #[test]
    fn test_other_urls_pass_through() {
        assert_eq!(
            normalize_script_url("https://raw.githubusercontent.com/u/r/main/ext.js").unwrap(),
            "https://raw.githubusercontent.com/u/r/main/ext.js"
        );
        assert_eq!(
            normalize_script_url("https://example.org/ext.js?v=2#top").unwrap(),
            "https://example.org/ext.js?v=2"
        );
        assert_eq!(
            normalize_script_url("https://github.com/u/r").unwrap(),
            "https://github.com/u/r"
        );
        assert!(normalize_script_url("ftp://example.org/ext.js").is_err());
        assert!(normalize_script_url("ext.js").is_err());
    }

    #[test]
    fn test_script_base_name() {
        assert_eq!(script_base_name("https://raw.githubusercontent.com/u/r/main/mangadex.js"), "mangadex");
        assert_eq!(script_base_name("https://x.test/dir/my.source.min.js"), "my_source_min");
        assert_eq!(script_base_name("https://x.test/"), "extension");
        assert_eq!(script_base_name("https://x.test/ext"), "ext");
    }

    #[test]
    fn test_allocate_script_path_skips_existing() {
        let dir = tempfile::tempdir().unwrap();
        let first = allocate_script_path(dir.path(), "ext", 1000);
        assert_eq!(first, dir.path().join("ext-1000.js"));
        std::fs::write(&first, "x").unwrap();

        let second = allocate_script_path(dir.path(), "ext", 1000);
        assert_eq!(second, dir.path().join("ext-1001.js"));
    }

    #[test]
    fn test_unique_source_id() {
        let taken: HashSet<String> = ["ext", "ext-2"].iter().map(|s| s.to_string()).collect();
        assert_eq!(unique_source_id("other", &taken), "other");
        assert_eq!(unique_source_id("ext", &taken), "ext-3");
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    proptest! {
        #[test]
        fn prop_github_normalization_is_idempotent(
            owner in "[a-z][a-z0-9-]{0,12}",
            repo in "[a-z][a-z0-9_.-]{0,12}",
            git_ref in "[a-z0-9]{1,10}",
            file in "[a-z]{1,10}",
        ) {
            let raw = format!("https://github.com/{}/{}/blob/{}/src/{}.js", owner, repo, git_ref, file);
            let once = normalize_script_url(&raw).unwrap();
            prop_assert!(once.starts_with("https://raw.githubusercontent.com/"));
            prop_assert!(!once.contains("/blob/"));
            prop_assert_eq!(normalize_script_url(&once).unwrap(), once.clone());
        }
    }
}
