//! End-to-end extension scenarios: install, resolve, rate limiting, uninstall.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tsukiyo::core::config::Config;
use tsukiyo::core::http::StaticTransport;
use tsukiyo::core::network::StaticNetwork;
use tsukiyo::core::rate_limit::ManualClock;
use tsukiyo::core::TsukiyoError;
use tsukiyo::db::{
    DatabaseManager, DownloadRepository, DownloadStore, DownloadedChapter, ReadingProgressEntry,
    ReadingProgressRepository, ReadingProgressStore,
};
use tsukiyo::extension::installer::sha256_hex;
use tsukiyo::extension::types::{ExplorerOptions, InformationsOptions, SearchOptions};
use tsukiyo::extension::{ExtensionManager, ManagerServices, REQUIRED_MEMBERS};

const SCRIPT_URL: &str = "https://raw.githubusercontent.com/acct/repo/main/ext.js";

const MEMBERS: [(&str, &str); 6] = [
    ("search", "async (query, options) => [{ id: 'm1', title: query + ':' + options.limit }]"),
    ("explorer", "async () => ({ Latest: [{ id: 'm1', title: 'One' }], Popular: [] })"),
    (
        "informations",
        "async (id) => ({ details: { id, title: 'Title ' + id }, chapters: [{ id: 'c1', chapter: 1 }] })",
    ),
    (
        "chapters",
        "async (id, lang, page, limit) => page > 1 ? [] : [{ id: 'c1', chapter: '1', translatedLanguage: lang }]",
    ),
    ("reader", "async (chapterId) => [chapterId + '/1.png', chapterId + '/2.png']"),
    ("isRateLimited", "() => false"),
];

/// Extension script with the given contract members
fn script_with(id: &str, name: &str, members: &[(&str, &str)]) -> String {
    let body: Vec<String> = members.iter().map(|(key, code)| format!("  {}: {},", key, code)).collect();
    format!(
        "module.exports = {{\n  id: '{}',\n  name: '{}',\n{}\n}};\n",
        id,
        name,
        body.join("\n")
    )
}

fn full_script() -> String {
    script_with("ext-1", "Ext One", &MEMBERS)
}

struct Harness {
    dir: TempDir,
    config: Config,
    transport: Arc<StaticTransport>,
    network: Arc<StaticNetwork>,
    clock: Arc<ManualClock>,
    progress: Arc<ReadingProgressRepository>,
    downloads: Arc<DownloadRepository>,
    manager: ExtensionManager,
}

impl Harness {
    fn new() -> Self {
        Self::with_builtin(false)
    }

    fn with_builtin(enable_builtin: bool) -> Self {
        Self::configured(|config| config.extensions.enable_builtin = enable_builtin)
    }

    fn configured(adjust: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::for_data_dir(dir.path()).unwrap();
        config.extensions.enable_builtin = false;
        adjust(&mut config);

        let transport = Arc::new(StaticTransport::new());
        let network = Arc::new(StaticNetwork::online());
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));

        let db = Arc::new(DatabaseManager::new_in_memory().unwrap());
        let progress = Arc::new(ReadingProgressRepository::new(db.clone()));
        let downloads = Arc::new(DownloadRepository::new(db, config.storage.downloads_dir.clone()));

        let services = ManagerServices::new(transport.clone(), network.clone(), progress.clone(), downloads.clone())
            .with_clock(clock.clone());
        let manager = ExtensionManager::new(&config.storage, &config.extensions, services);

        Self {
            dir,
            config,
            transport,
            network,
            clock,
            progress,
            downloads,
            manager,
        }
    }

    fn serve(&self, url: &str, script: &str) {
        self.transport.route(url, 200, script.as_bytes().to_vec());
    }

    /// Script files left in the extensions directory
    fn script_files(&self) -> Vec<PathBuf> {
        match std::fs::read_dir(&self.config.storage.extensions_dir) {
            Ok(entries) => entries
                .map(|e| e.unwrap().path())
                .filter(|p| p.extension().map(|e| e == "js").unwrap_or(false))
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[tokio::test]
async fn install_from_github_blob_url() {
    let h = Harness::new();
    h.serve(SCRIPT_URL, &full_script());

    let source = h
        .manager
        .install("https://github.com/acct/repo/blob/main/ext.js")
        .await
        .unwrap();

    assert_eq!(source.id, "ext-1");
    assert_eq!(source.name, "Ext One");
    assert_eq!(source.version, "1.0.0");
    assert_eq!(source.source_url.as_deref(), Some(SCRIPT_URL));
    assert_eq!(source.checksum, Some(sha256_hex(full_script().as_bytes())));

    let file_name = source.file_path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(file_name.starts_with("ext-") && file_name.ends_with(".js"), "{}", file_name);
    assert!(source.file_path.starts_with(&h.config.storage.extensions_dir));
    assert!(source.file_path.exists());

    assert_eq!(h.manager.list().await.unwrap(), vec![source]);
    assert_eq!(h.transport.requests()[0].url, SCRIPT_URL);
}

#[tokio::test]
async fn partial_script_is_rejected_without_leftovers() {
    let h = Harness::new();
    h.serve(SCRIPT_URL, &script_with("ext-1", "Ext One", &MEMBERS[..2]));

    let result = h.manager.install(SCRIPT_URL).await;

    assert!(matches!(result, Err(TsukiyoError::InvalidExtensionFormat(_))), "{:?}", result);
    assert!(h.manager.list().await.unwrap().is_empty());
    assert!(h.script_files().is_empty());
}

#[tokio::test]
async fn every_contract_member_is_required() {
    let h = Harness::new();

    for missing in REQUIRED_MEMBERS {
        let members: Vec<(&str, &str)> = MEMBERS.iter().copied().filter(|(key, _)| *key != missing).collect();
        let url = format!("https://scripts.test/without-{}.js", missing);
        h.serve(&url, &script_with("ext-1", "Ext One", &members));

        let result = h.manager.install(&url).await;
        match result {
            Err(TsukiyoError::InvalidExtensionFormat(message)) => assert!(message.contains(missing), "{}", message),
            other => panic!("install without {} gave {:?}", missing, other),
        }
    }

    assert!(h.manager.list().await.unwrap().is_empty());
    assert!(h.script_files().is_empty());
}

#[tokio::test]
async fn non_callable_member_is_rejected() {
    let h = Harness::new();
    let mut members = MEMBERS.to_vec();
    members[4] = ("reader", "['not', 'a', 'function']");
    h.serve(SCRIPT_URL, &script_with("ext-1", "Ext One", &members));

    assert!(matches!(
        h.manager.install(SCRIPT_URL).await,
        Err(TsukiyoError::InvalidExtensionFormat(_))
    ));
    assert!(h.script_files().is_empty());
}

#[tokio::test]
async fn throwing_script_fails_evaluation_and_is_removed() {
    let h = Harness::new();
    h.serve(SCRIPT_URL, "throw new Error('boom');");

    assert!(matches!(
        h.manager.install(SCRIPT_URL).await,
        Err(TsukiyoError::ExtensionEvaluationFailed(_))
    ));
    assert!(h.manager.list().await.unwrap().is_empty());
    assert!(h.script_files().is_empty());
}

#[tokio::test]
async fn failed_download_touches_nothing() {
    let h = Harness::new();
    h.transport.route(SCRIPT_URL, 500, "oops");

    assert!(matches!(
        h.manager.install(SCRIPT_URL).await,
        Err(TsukiyoError::DownloadFailed(_))
    ));
    assert!(h.manager.list().await.unwrap().is_empty());
    assert!(h.script_files().is_empty());
}

#[tokio::test]
async fn any_success_status_counts_as_downloaded() {
    let h = Harness::new();
    h.transport.route(SCRIPT_URL, 203, full_script().into_bytes());

    let source = h.manager.install(SCRIPT_URL).await.unwrap();
    assert_eq!(source.id, "ext-1");
    assert!(source.file_path.exists());
}

#[tokio::test]
async fn oversized_script_is_not_downloaded() {
    let h = Harness::configured(|config| config.extensions.max_response_bytes = 64);
    h.serve(SCRIPT_URL, &full_script());

    assert!(matches!(
        h.manager.install(SCRIPT_URL).await,
        Err(TsukiyoError::DownloadFailed(_))
    ));
    assert_eq!(h.transport.requests()[0].max_body_bytes, Some(64));
    assert!(h.manager.list().await.unwrap().is_empty());
    assert!(h.script_files().is_empty());
}

#[tokio::test]
async fn offline_install_issues_no_request() {
    let h = Harness::new();
    h.serve(SCRIPT_URL, &full_script());
    h.network.set_online(false);

    assert!(matches!(h.manager.install(SCRIPT_URL).await, Err(TsukiyoError::NotConnected)));
    assert_eq!(h.transport.request_count(), 0);
}

#[tokio::test]
async fn checksum_mismatch_is_refused_before_writing() {
    let h = Harness::new();
    h.serve(SCRIPT_URL, &full_script());

    let wrong = sha256_hex(b"something else");
    assert!(matches!(
        h.manager.install_verified(SCRIPT_URL, &wrong).await,
        Err(TsukiyoError::IntegrityMismatch(_))
    ));
    assert!(h.script_files().is_empty());

    let right = sha256_hex(full_script().as_bytes()).to_uppercase();
    let source = h.manager.install_verified(SCRIPT_URL, &right).await.unwrap();
    assert_eq!(source.id, "ext-1");
}

#[tokio::test]
async fn repeated_installs_get_distinct_files_and_ids() {
    let h = Harness::new();
    h.serve(SCRIPT_URL, &full_script());

    let first = h.manager.install(SCRIPT_URL).await.unwrap();
    let second = h.manager.install(SCRIPT_URL).await.unwrap();

    assert_ne!(first.file_path, second.file_path);
    assert_eq!(first.id, "ext-1");
    assert_eq!(second.id, "ext-1-2");
    assert_eq!(h.manager.list().await.unwrap().len(), 2);
    assert_eq!(h.script_files().len(), 2);
}

#[tokio::test]
async fn builtin_id_is_reserved() {
    let h = Harness::with_builtin(true);
    h.serve(SCRIPT_URL, &script_with("mangadex", "Fake MangaDex", &MEMBERS));

    let source = h.manager.install(SCRIPT_URL).await.unwrap();
    assert_eq!(source.id, "mangadex-2");

    let listing = h.manager.sources().await.unwrap();
    assert!(listing[0].builtin);
    assert_eq!(listing[0].id, "mangadex");
    assert_eq!(listing[1].id, "mangadex-2");
}

#[tokio::test]
async fn resolve_round_trip_follows_the_file_on_disk() {
    let h = Harness::new();
    h.serve(SCRIPT_URL, &full_script());
    let installed = h.manager.install(SCRIPT_URL).await.unwrap();

    let source = h.manager.resolve("ext-1").await.unwrap().unwrap();
    assert_eq!(source.id(), "ext-1");
    assert_eq!(source.name(), "Ext One");

    let found = source.search("frieren", &SearchOptions::default()).await.unwrap();
    assert_eq!(found[0].title.as_deref(), Some("frieren:10"));

    let shelves = source.explorer(&ExplorerOptions::default()).await.unwrap();
    assert_eq!(shelves.len(), 2);
    assert_eq!(shelves[0].name, "Latest");

    let info = source.informations("m1", &InformationsOptions::default()).await.unwrap();
    assert_eq!(info.details.unwrap().title.as_deref(), Some("Title m1"));
    assert_eq!(info.chapters[0].chapter.as_deref(), Some("1"));

    let chapters = source.chapters("m1", "fr", 1, 100).await.unwrap();
    assert_eq!(chapters[0].language.as_deref(), Some("fr"));
    assert!(source.chapters("m1", "fr", 2, 100).await.unwrap().is_empty());

    assert_eq!(source.reader("c1").await.unwrap(), vec!["c1/1.png", "c1/2.png"]);
    assert!(!source.is_rate_limited());

    // Rewrite the installed script; the next resolve sees the new code.
    let mut members = MEMBERS.to_vec();
    members[0] = ("search", "async () => [{ id: 'm2', title: 'changed' }]");
    std::fs::write(&installed.file_path, script_with("ext-1", "Ext One", &members)).unwrap();

    let source = h.manager.resolve("ext-1").await.unwrap().unwrap();
    let found = source.search("frieren", &SearchOptions::default()).await.unwrap();
    assert_eq!(found[0].title.as_deref(), Some("changed"));

    assert!(h.manager.resolve("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn rate_limit_cools_down_without_reset() {
    let h = Harness::new();
    let mut members = MEMBERS.to_vec();
    members[0] = (
        "search",
        "async (query) => { const r = await fetch('https://api.example.org/manga?title=' + query); return r.json(); }",
    );
    h.serve(SCRIPT_URL, &script_with("ext-1", "Ext One", &members));
    h.manager.install(SCRIPT_URL).await.unwrap();
    h.transport.route("https://api.example.org/manga", 429, "Too Many Requests");

    let source = h.manager.resolve("ext-1").await.unwrap().unwrap();
    assert!(!source.is_rate_limited());

    let result = source.search("x", &SearchOptions::default()).await;
    assert!(matches!(result, Err(TsukiyoError::RateLimited { .. })), "{:?}", result);
    assert!(source.is_rate_limited());

    // Cooling: refused before any request leaves the host.
    let requests = h.transport.request_count();
    assert!(matches!(
        source.search("x", &SearchOptions::default()).await,
        Err(TsukiyoError::RateLimited { .. })
    ));
    assert_eq!(h.transport.request_count(), requests);

    // A fresh resolve shares the cooldown.
    assert!(h.manager.resolve("ext-1").await.unwrap().unwrap().is_rate_limited());

    h.clock.advance(Duration::from_secs(59));
    assert!(source.is_rate_limited());
    h.clock.advance(Duration::from_secs(1));
    assert!(!source.is_rate_limited());

    h.transport
        .route_json("https://api.example.org/manga", &serde_json::json!([{ "id": "m9" }]));
    let found = source.search("x", &SearchOptions::default()).await.unwrap();
    assert_eq!(found[0].id, "m9");
}

fn progress_entry(manga_id: &str, source_id: &str) -> ReadingProgressEntry {
    ReadingProgressEntry {
        manga_id: manga_id.to_string(),
        source_id: source_id.to_string(),
        manga_title: None,
        manga_cover: None,
        chapter_id: Some("c1".to_string()),
        chapter_number: Some("1".to_string()),
        page: 4,
        last_read: 1_700_000_000_000,
    }
}

#[tokio::test]
async fn uninstall_cascades_and_is_idempotent() {
    let h = Harness::new();
    h.serve(SCRIPT_URL, &full_script());
    let source = h.manager.install(SCRIPT_URL).await.unwrap();
    let other = h.manager.install(SCRIPT_URL).await.unwrap();

    for manga in ["a", "b", "c"] {
        h.progress.save(&progress_entry(manga, &source.id)).await.unwrap();
    }
    h.progress.save(&progress_entry("z", &other.id)).await.unwrap();

    let page_dir = h.dir.path().join("pages");
    std::fs::create_dir_all(&page_dir).unwrap();
    for manga in ["a", "b"] {
        let page = page_dir.join(format!("{}-001.png", manga));
        std::fs::write(&page, b"png").unwrap();
        let chapter = DownloadedChapter {
            chapter_id: "c1".to_string(),
            chapter_number: Some("1".to_string()),
            pages: vec![page],
            downloaded_at: 1,
        };
        h.downloads.record_chapter(manga, &source.id, None, &chapter).await.unwrap();
    }

    let report = h.manager.uninstall(&source.id).await.unwrap();
    assert!(report.was_installed());
    assert!(report.is_clean(), "{:?}", report.failures);
    assert_eq!(report.progress_removed, 3);
    assert_eq!(report.downloads_removed, 2);
    assert!(!source.file_path.exists());
    assert!(!page_dir.join("a-001.png").exists());

    let progress = h.progress.list_all().await.unwrap();
    assert!(progress.iter().all(|e| e.source_id != source.id));
    assert_eq!(progress.len(), 1);
    assert!(h.downloads.list_all().await.unwrap().iter().all(|m| m.source_id != source.id));

    let registry_after_first = h.manager.list().await.unwrap();
    assert_eq!(registry_after_first, vec![other]);

    let again = h.manager.uninstall(&source.id).await.unwrap();
    assert!(!again.was_installed());
    assert_eq!(h.manager.list().await.unwrap(), registry_after_first);
}

#[tokio::test]
async fn clear_all_keeps_progress() {
    let h = Harness::new();
    h.serve(SCRIPT_URL, &full_script());
    let source = h.manager.install(SCRIPT_URL).await.unwrap();
    h.progress.save(&progress_entry("a", &source.id)).await.unwrap();

    assert_eq!(h.manager.clear_all().await.unwrap(), 1);
    assert!(h.manager.list().await.unwrap().is_empty());
    assert!(h.script_files().is_empty());
    assert_eq!(h.progress.list_all().await.unwrap().len(), 1);
    assert!(h.manager.resolve(&source.id).await.unwrap().is_none());
}
