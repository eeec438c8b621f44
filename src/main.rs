//! Tsukiyo command-line front end
//!
//! Manages extension sources and calls them. Command output is JSON on
//! stdout; logs go to stderr or the configured log file.

use tsukiyo::core::config::{Config, ConfigOverrides};
use tsukiyo::core::downloads::{ChapterDownloader, DownloadTarget};
use tsukiyo::core::http::{HttpTransport, ReqwestTransport};
use tsukiyo::core::network::{NetworkMonitor, StaticNetwork, TcpProbe};
use tsukiyo::core::{Logger, TsukiyoError};
use tsukiyo::db::{DatabaseManager, DownloadRepository, ReadingProgressRepository, ReadingProgressStore};
use tsukiyo::extension::sandbox::ScriptSandbox;
use tsukiyo::extension::types::{ExplorerOptions, InformationsOptions, SearchOptions, SearchOrder};
use tsukiyo::extension::{ContentSource, ExtensionManager, ManagerServices};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "tsukiyo", version, about = "Manga reader with installable extension sources")]
struct Cli {
    #[command(flatten)]
    overrides: ConfigOverrides,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List built-in and installed sources
    Sources,
    /// Install an extension script from a URL
    Install {
        url: String,
        /// Refuse the script unless its SHA-256 matches
        #[arg(long, value_name = "HEX")]
        sha256: Option<String>,
    },
    /// Uninstall a source and delete its reading progress and downloads
    Uninstall { id: String },
    /// Remove every installed extension script
    Clear,
    /// Search a source
    Search {
        source: String,
        query: String,
        #[arg(long, default_value_t = 10)]
        limit: u32,
        #[arg(long)]
        mature: bool,
        /// relevance, latest, followed, created or title
        #[arg(long, default_value = "relevance")]
        order: String,
    },
    /// Show a source's explorer shelves
    Explore {
        source: String,
        #[arg(long, default_value_t = 10)]
        limit: u32,
        #[arg(long)]
        mature: bool,
    },
    /// Manga details and first page of chapters
    Info {
        source: String,
        manga: String,
        #[arg(long, default_value = "en")]
        lang: String,
    },
    /// One page of a manga's chapters
    Chapters {
        source: String,
        manga: String,
        #[arg(long, default_value = "en")]
        lang: String,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 100)]
        limit: u32,
    },
    /// Page image URLs of a chapter
    Pages { source: String, chapter: String },
    /// Download a chapter for offline reading
    Download {
        source: String,
        manga: String,
        chapter: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        number: Option<String>,
    },
    /// Reading progress, most recent first
    Progress,
}

struct App {
    manager: ExtensionManager,
    transport: Arc<dyn HttpTransport>,
    network: Arc<dyn NetworkMonitor>,
    sandbox: ScriptSandbox,
    progress: Arc<ReadingProgressRepository>,
    downloads: Arc<DownloadRepository>,
}

impl App {
    fn build(config: &Config) -> Result<Self> {
        for dir in [
            &config.storage.data_dir,
            &config.storage.extensions_dir,
            &config.storage.downloads_dir,
        ] {
            std::fs::create_dir_all(dir).with_context(|| format!("Failed to create directory {:?}", dir))?;
        }

        let db = Arc::new(DatabaseManager::new(
            &config.database.path,
            config.database.connection_pool_size,
            Duration::from_millis(config.database.busy_timeout),
        )?);

        let transport: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new(config.extensions.fetch_deadline())?);
        let network: Arc<dyn NetworkMonitor> = if config.network.assume_online {
            Arc::new(StaticNetwork::online())
        } else {
            Arc::new(TcpProbe::new(
                &config.network.probe_host,
                config.network.probe_port,
                Duration::from_millis(config.network.probe_timeout),
                Duration::from_secs(config.network.probe_cache_ttl),
            ))
        };

        let progress = Arc::new(ReadingProgressRepository::new(db.clone()));
        let downloads = Arc::new(DownloadRepository::new(db, config.storage.downloads_dir.clone()));

        let services = ManagerServices::new(transport.clone(), network.clone(), progress.clone(), downloads.clone());
        let manager = ExtensionManager::new(&config.storage, &config.extensions, services);

        Ok(Self {
            manager,
            transport,
            network,
            sandbox: ScriptSandbox::from_config(&config.extensions),
            progress,
            downloads,
        })
    }

    async fn source(&self, id: &str) -> Result<Arc<dyn ContentSource>> {
        Ok(self
            .manager
            .resolve(id)
            .await?
            .ok_or_else(|| TsukiyoError::SourceNotFound(id.to_string()))?)
    }

    async fn run(&self, command: Command) -> Result<()> {
        match command {
            Command::Sources => print_json(&self.manager.sources().await?),
            Command::Install { url, sha256 } => {
                let source = match sha256 {
                    Some(hex) => self.manager.install_verified(&url, &hex).await?,
                    None => self.manager.install(&url).await?,
                };
                print_json(&source)
            }
            Command::Uninstall { id } => print_json(&self.manager.uninstall(&id).await?),
            Command::Clear => print_json(&serde_json::json!({ "removed": self.manager.clear_all().await? })),
            Command::Search {
                source,
                query,
                limit,
                mature,
                order,
            } => {
                let order = SearchOrder::parse(&order)
                    .ok_or_else(|| TsukiyoError::ValidationError(format!("Unknown search order '{}'", order)))?;
                let options = SearchOptions { limit, mature, order };
                print_json(&self.source(&source).await?.search(&query, &options).await?)
            }
            Command::Explore { source, limit, mature } => {
                let options = ExplorerOptions { limit, mature };
                print_json(&self.source(&source).await?.explorer(&options).await?)
            }
            Command::Info { source, manga, lang } => {
                let options = InformationsOptions {
                    language: lang,
                    ..Default::default()
                };
                print_json(&self.source(&source).await?.informations(&manga, &options).await?)
            }
            Command::Chapters {
                source,
                manga,
                lang,
                page,
                limit,
            } => print_json(&self.source(&source).await?.chapters(&manga, &lang, page, limit).await?),
            Command::Pages { source, chapter } => print_json(&self.source(&source).await?.reader(&chapter).await?),
            Command::Download {
                source,
                manga,
                chapter,
                title,
                number,
            } => {
                let source = self.source(&source).await?;
                let downloader = ChapterDownloader::new(self.transport.clone(), self.network.clone(), self.downloads.clone())
                    .with_sandbox(self.sandbox.clone());
                let target = DownloadTarget {
                    manga_id: manga,
                    manga_title: title,
                    chapter_id: chapter,
                    chapter_number: number,
                };
                print_json(&downloader.download_chapter(source.as_ref(), &target).await?)
            }
            Command::Progress => print_json(&self.progress.list_all().await?),
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match Config::load(&cli.overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            // Logging is not up yet.
            eprintln!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    let _logger = match Logger::init(&config.logging) {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return Err(e);
        }
    };

    info!(version = tsukiyo::VERSION, data_dir = ?config.storage.data_dir, "Starting tsukiyo");

    let app = App::build(&config)?;
    app.run(cli.command).await
}
