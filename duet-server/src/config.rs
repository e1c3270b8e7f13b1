//! Configuration for the Duet server.
//!
//! Layered, highest priority first:
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/duet/config.toml`)
//! 4. Compiled defaults
//!
//! The `[[users]]` array seeds the in-memory user directory and only comes
//! from the file.

use std::path::PathBuf;
use std::time::Duration;

use crate::directory::UserProfile;
use crate::messenger::MessengerSettings;

/// Errors that can occur when loading server configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    server: ServerSection,
    cache: CacheSection,
    sync: SyncSection,
    storage: StorageSection,
    users: Vec<UserProfile>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerSection {
    bind_addr: Option<String>,
    max_content_size: Option<usize>,
    outbound_queue_size: Option<usize>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct CacheSection {
    capacity: Option<usize>,
    default_page_size: Option<usize>,
    max_page_size: Option<usize>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SyncSection {
    enabled: Option<bool>,
    interval_secs: Option<u64>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct StorageSection {
    log_path: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the server.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Duet direct-messaging server")]
pub struct ServerCliArgs {
    /// Address to bind the server to.
    #[arg(short, long, env = "DUET_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/duet/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Durable message log file. Without it, messages are kept in memory.
    #[arg(long, env = "DUET_LOG_PATH")]
    pub log_path: Option<PathBuf>,

    /// Maximum message content size in bytes.
    #[arg(long)]
    pub max_content_size: Option<usize>,

    /// Depth of each connection's outbound queue.
    #[arg(long)]
    pub outbound_queue_size: Option<usize>,

    /// Seconds between hot-cache sync runs.
    #[arg(long)]
    pub sync_interval_secs: Option<u64>,

    /// Disable the periodic sync job.
    #[arg(long)]
    pub no_sync: bool,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "DUET_LOG")]
    pub log_level: String,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server to (e.g., `0.0.0.0:9100`).
    pub bind_addr: String,
    /// Maximum message content size in bytes.
    pub max_content_size: usize,
    /// Depth of each connection's outbound queue.
    pub outbound_queue_size: usize,
    /// Hot cache entries kept per conversation after a sync.
    pub cache_capacity: usize,
    /// Page size when a request does not give one.
    pub default_page_size: usize,
    /// Largest page size served.
    pub max_page_size: usize,
    /// Whether the periodic sync job runs.
    pub sync_enabled: bool,
    /// Interval between sync runs.
    pub sync_interval: Duration,
    /// Durable log file; `None` keeps the log in memory.
    pub log_path: Option<PathBuf>,
    /// Users seeded into the in-memory directory.
    pub users: Vec<UserProfile>,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9100".to_string(),
            max_content_size: duet_proto::message::MAX_CONTENT_SIZE,
            outbound_queue_size: crate::sessions::DEFAULT_OUTBOUND_QUEUE_SIZE,
            cache_capacity: crate::hot_cache::DEFAULT_CAPACITY,
            default_page_size: crate::retrieval::DEFAULT_PAGE_SIZE,
            max_page_size: crate::retrieval::DEFAULT_MAX_PAGE_SIZE,
            sync_enabled: true,
            sync_interval: crate::sync::DEFAULT_SYNC_INTERVAL,
            log_path: None,
            users: Vec::new(),
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path is tried and a missing
    /// file is treated as empty config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read or
    /// parsed, or a resolved value is out of range.
    pub fn load(cli: &ServerCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        let config = Self::resolve(cli, file);
        config.validate()?;
        Ok(config)
    }

    /// Settings for the messaging core.
    #[must_use]
    pub const fn messenger_settings(&self) -> MessengerSettings {
        MessengerSettings {
            cache_capacity: self.cache_capacity,
            default_page_size: self.default_page_size,
            max_page_size: self.max_page_size,
            max_content_size: self.max_content_size,
            outbound_queue_size: self.outbound_queue_size,
        }
    }

    /// Priority: CLI > file > default.
    fn resolve(cli: &ServerCliArgs, file: ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            bind_addr: cli
                .bind
                .clone()
                .or(file.server.bind_addr)
                .unwrap_or(defaults.bind_addr),
            max_content_size: cli
                .max_content_size
                .or(file.server.max_content_size)
                .unwrap_or(defaults.max_content_size),
            outbound_queue_size: cli
                .outbound_queue_size
                .or(file.server.outbound_queue_size)
                .unwrap_or(defaults.outbound_queue_size),
            cache_capacity: file.cache.capacity.unwrap_or(defaults.cache_capacity),
            default_page_size: file
                .cache
                .default_page_size
                .unwrap_or(defaults.default_page_size),
            max_page_size: file.cache.max_page_size.unwrap_or(defaults.max_page_size),
            sync_enabled: !cli.no_sync && file.sync.enabled.unwrap_or(defaults.sync_enabled),
            sync_interval: cli
                .sync_interval_secs
                .or(file.sync.interval_secs)
                .map_or(defaults.sync_interval, Duration::from_secs),
            log_path: cli.log_path.clone().or(file.storage.log_path),
            users: file.users,
            log_level: cli.log_level.clone(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("server.outbound_queue_size", self.outbound_queue_size),
            ("cache.capacity", self.cache_capacity),
            ("cache.default_page_size", self.default_page_size),
            ("cache.max_page_size", self.max_page_size),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{key} must be at least 1")));
            }
        }
        if self.default_page_size > self.max_page_size {
            return Err(ConfigError::Invalid(
                "cache.default_page_size exceeds cache.max_page_size".into(),
            ));
        }
        if self.sync_enabled && self.sync_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "sync.interval_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("duet").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
