//! Configuration management

use clap::Args;
use config::{Config as ConfigBuilder, ConfigBuilder as Builder, ConfigError as BuilderError, Environment, File};
use config::builder::DefaultState;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid storage configuration: {0}")]
    InvalidStorage(String),

    #[error("Invalid database configuration: {0}")]
    InvalidDatabase(String),

    #[error("Invalid extensions configuration: {0}")]
    InvalidExtensions(String),

    #[error("Invalid network configuration: {0}")]
    InvalidNetwork(String),

    #[error("Invalid logging configuration: {0}")]
    InvalidLogging(String),

    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Configuration file not found: {0}")]
    FileNotFound(String),
}

impl From<BuilderError> for ConfigError {
    fn from(err: BuilderError) -> Self {
        ConfigError::LoadError(err.to_string())
    }
}

impl From<ConfigError> for crate::core::error::TsukiyoError {
    fn from(err: ConfigError) -> Self {
        crate::core::error::TsukiyoError::ConfigError(err.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
    pub extensions: ExtensionsConfig,
    pub network: NetworkConfig,
    pub logging: LoggingConfig,
}

/// Command-line overrides, flattened into the binary's CLI
#[derive(Debug, Default, Clone, Args)]
pub struct ConfigOverrides {
    /// Path to configuration file (TOML format)
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Data directory (extensions, downloads, database)
    #[arg(long, value_name = "DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Database file path
    #[arg(long, value_name = "PATH", global = true)]
    pub database: Option<PathBuf>,

    /// Log level (debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Skip the connectivity probe and assume the network is up
    #[arg(long, global = true)]
    pub assume_online: bool,
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("tsukiyo"))
        .unwrap_or_else(|| PathBuf::from("./data"))
}

fn with_defaults(data_dir: &Path) -> Result<Builder<DefaultState>, ConfigError> {
    let data = data_dir.display().to_string();
    let allowed: Vec<String> = Vec::new();

    Ok(ConfigBuilder::builder()
        .set_default("storage.data_dir", data.clone())?
        .set_default("storage.extensions_dir", data_dir.join("extensions").display().to_string())?
        .set_default("storage.downloads_dir", data_dir.join("downloads").display().to_string())?
        .set_default("database.path", data_dir.join("tsukiyo.db").display().to_string())?
        .set_default("database.connection_pool_size", 4)?
        .set_default("database.busy_timeout", 5000)?
        .set_default("extensions.rate_limit_cooldown", 60)?
        .set_default("extensions.evaluation_timeout", 10)?
        .set_default("extensions.call_timeout", 60)?
        .set_default("extensions.fetch_timeout", 30)?
        .set_default("extensions.max_response_bytes", 16 * 1024 * 1024)?
        .set_default("extensions.allowed_domains", allowed)?
        .set_default("extensions.allow_private_hosts", false)?
        .set_default("extensions.enable_builtin", true)?
        .set_default("network.probe_host", "1.1.1.1")?
        .set_default("network.probe_port", 443)?
        .set_default("network.probe_timeout", 3000)? // ms
        .set_default("network.probe_cache_ttl", 10)? // s
        .set_default("network.assume_online", false)?
        .set_default("logging.level", "info")?
        .set_default("logging.format", "text")?
        .set_default("logging.output", "stderr")?
        .set_default("logging.rotation", "daily")?)
}

impl Config {
    /// Load configuration with precedence: CLI args > Environment variables > Config file > Defaults
    pub fn load(overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        // Paths derived from the data directory follow an overridden data_dir.
        let data_dir = overrides.data_dir.clone().unwrap_or_else(default_data_dir);
        let mut builder = with_defaults(&data_dir)?;

        if let Some(config_path) = &overrides.config {
            if !config_path.exists() {
                return Err(ConfigError::FileNotFound(config_path.display().to_string()));
            }
            builder = builder.add_source(File::from(config_path.as_path()));
        }

        // Example: TSUKIYO_EXTENSIONS__CALL_TIMEOUT=30
        builder = builder.add_source(
            Environment::with_prefix("TSUKIYO")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("extensions.allowed_domains")
                .try_parsing(true),
        );

        if let Some(db_path) = &overrides.database {
            builder = builder.set_override("database.path", db_path.display().to_string())?;
        }
        if let Some(log_level) = &overrides.log_level {
            builder = builder.set_override("logging.level", log_level.clone())?;
        }
        if overrides.assume_online {
            builder = builder.set_override("network.assume_online", true)?;
        }

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path on top of the defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let config: Config = with_defaults(&default_data_dir())?
            .add_source(File::from(path))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Defaults rooted at the given data directory
    pub fn for_data_dir(data_dir: &Path) -> Result<Self, ConfigError> {
        let config: Config = with_defaults(data_dir)?.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.storage.validate()?;
        self.database.validate()?;
        self.extensions.validate()?;
        self.network.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub extensions_dir: PathBuf,
    pub downloads_dir: PathBuf,
}

impl StorageConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidStorage("data_dir cannot be empty".to_string()));
        }

        if self.extensions_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidStorage("extensions_dir cannot be empty".to_string()));
        }

        if self.downloads_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidStorage("downloads_dir cannot be empty".to_string()));
        }

        Ok(())
    }

    /// Location of the installed-extension registry document
    pub fn registry_path(&self) -> PathBuf {
        self.extensions_dir.join("installed.json")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub connection_pool_size: u32,
    pub busy_timeout: u64, // milliseconds
}

impl DatabaseConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidDatabase("path cannot be empty".to_string()));
        }

        if self.connection_pool_size == 0 {
            return Err(ConfigError::InvalidDatabase("connection_pool_size must be greater than 0".to_string()));
        }

        if self.busy_timeout == 0 {
            return Err(ConfigError::InvalidDatabase("busy_timeout must be greater than 0".to_string()));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtensionsConfig {
    pub rate_limit_cooldown: u64, // seconds
    pub evaluation_timeout: u64,  // seconds
    pub call_timeout: u64,        // seconds
    pub fetch_timeout: u64,       // seconds
    pub max_response_bytes: usize,
    pub allowed_domains: Vec<String>,
    pub allow_private_hosts: bool,
    pub enable_builtin: bool,
}

impl ExtensionsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate_limit_cooldown == 0 {
            return Err(ConfigError::InvalidExtensions("rate_limit_cooldown must be greater than 0".to_string()));
        }

        if self.evaluation_timeout == 0 {
            return Err(ConfigError::InvalidExtensions("evaluation_timeout must be greater than 0".to_string()));
        }

        if self.call_timeout == 0 {
            return Err(ConfigError::InvalidExtensions("call_timeout must be greater than 0".to_string()));
        }

        if self.fetch_timeout == 0 || self.fetch_timeout > self.call_timeout {
            return Err(ConfigError::InvalidExtensions(
                "fetch_timeout must be greater than 0 and not exceed call_timeout".to_string(),
            ));
        }

        if self.max_response_bytes == 0 {
            return Err(ConfigError::InvalidExtensions("max_response_bytes must be greater than 0".to_string()));
        }

        if let Some(bad) = self.allowed_domains.iter().find(|d| d.trim().is_empty() || d.contains('/')) {
            return Err(ConfigError::InvalidExtensions(format!("invalid allowed domain pattern: '{}'", bad)));
        }

        Ok(())
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.rate_limit_cooldown)
    }

    pub fn evaluation_deadline(&self) -> Duration {
        Duration::from_secs(self.evaluation_timeout)
    }

    pub fn call_deadline(&self) -> Duration {
        Duration::from_secs(self.call_timeout)
    }

    pub fn fetch_deadline(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub probe_host: String,
    pub probe_port: u16,
    pub probe_timeout: u64,   // milliseconds
    pub probe_cache_ttl: u64, // seconds
    pub assume_online: bool,
}

impl NetworkConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.probe_host.is_empty() {
            return Err(ConfigError::InvalidNetwork("probe_host cannot be empty".to_string()));
        }

        if self.probe_port == 0 {
            return Err(ConfigError::InvalidNetwork("probe_port must be greater than 0".to_string()));
        }

        if self.probe_timeout == 0 {
            return Err(ConfigError::InvalidNetwork("probe_timeout must be greater than 0".to_string()));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub log_file: Option<PathBuf>,
    pub rotation: String,
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.level.to_lowercase().as_str()) {
            return Err(ConfigError::InvalidLogging(format!("level must be one of: {:?}", valid_levels)));
        }

        let valid_formats = ["json", "text"];
        if !valid_formats.contains(&self.format.as_str()) {
            return Err(ConfigError::InvalidLogging(format!("format must be one of: {:?}", valid_formats)));
        }

        let valid_outputs = ["stderr", "file"];
        if !valid_outputs.contains(&self.output.as_str()) {
            return Err(ConfigError::InvalidLogging(format!("output must be one of: {:?}", valid_outputs)));
        }

        if self.output == "file" && self.log_file.is_none() {
            return Err(ConfigError::InvalidLogging(
                "log_file must be specified when output is 'file'".to_string(),
            ));
        }

        let valid_rotations = ["daily", "hourly", "never"];
        if !valid_rotations.contains(&self.rotation.as_str()) {
            return Err(ConfigError::InvalidLogging(format!("rotation must be one of: {:?}", valid_rotations)));
        }

        Ok(())
    }
}
