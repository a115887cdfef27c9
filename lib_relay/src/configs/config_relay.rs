//! # Relay Configuration
//!
//! Settings are layered, later layers winning:
//!
//! 1. built-in defaults,
//! 2. a JSON config file (`server_mastodon.conf` unless `--config-path` says otherwise),
//! 3. environment variables and command-line flags.
//!
//! The raw layers are all-optional [`Config`] values; [`RelaySettings`] is the
//! validated, fully-populated result the server runs with.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::core::dispatcher::DEFAULT_QUEUE_CAPACITY;
use crate::core::upstream_manager::ReconnectPolicy;
use crate::error::ConfigError;
use crate::ingestors::mastodon_wss::MastodonConfig;

const DEFAULT_CONFIG_FILE: &str = "server_mastodon.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Mastodon public firehose relay", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "MASTODON_SERVER", help = "Base URL of the upstream Mastodon instance.")]
    pub mastodon_server: Option<String>,

    #[clap(long, env = "MASTODON_ACCESS_TOKEN", hide_env_values = true, help = "Bearer token for the upstream instance.")]
    pub mastodon_access_token: Option<String>,

    #[clap(long, env = "RELAY_PORT", help = "Port to listen on for subscriber connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "RELAY_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "RELAY_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "RELAY_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "RELAY_RECONNECT_BASE_DELAY_MS", help = "Base delay in milliseconds for upstream reconnect attempts.")]
    pub reconnect_base_delay_ms: Option<u64>,

    #[clap(long, env = "RELAY_MAX_RETRIES", help = "Reconnect attempts before falling back to polling.")]
    pub max_retries: Option<u32>,

    #[clap(long, env = "RELAY_POLL_INTERVAL_SECONDS", help = "Interval in seconds between polls once streaming is given up.")]
    pub poll_interval_seconds: Option<u64>,

    #[clap(long, env = "RELAY_SNAPSHOT_LIMIT", help = "Number of posts requested per timeline snapshot.")]
    pub snapshot_limit: Option<u32>,

    #[clap(long, env = "RELAY_MAX_REDIRECTS", help = "Redirects followed while resolving the streaming endpoint.")]
    pub max_redirects: Option<usize>,

    #[clap(long, env = "RELAY_SUBSCRIBER_QUEUE", help = "Posts a subscriber may fall behind before it is dropped.")]
    pub subscriber_queue: Option<usize>,

    #[clap(long, env = "TLS_CERT_PATH", help = "Path to the TLS certificate file.")]
    pub tls_cert_path: Option<PathBuf>,

    #[clap(long, env = "TLS_KEY_PATH", help = "Path to the TLS private key file.")]
    pub tls_key_path: Option<PathBuf>,
}

impl Config {
    /// Built-in defaults.
    pub fn defaults() -> Config {
        Config {
            mastodon_server: Some("https://mastodon.social".to_string()),
            port: Some(3000),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            reconnect_base_delay_ms: Some(1000),
            max_retries: Some(5),
            poll_interval_seconds: Some(60),
            snapshot_limit: Some(20),
            max_redirects: Some(5),
            subscriber_queue: Some(DEFAULT_QUEUE_CAPACITY),
            ..Default::default()
        }
    }

    // Merge two Config structs, where 'other' overrides 'self' for Some values
    pub fn merge(self, other: Config) -> Config {
        Config {
            mastodon_server: other.mastodon_server.or(self.mastodon_server),
            mastodon_access_token: other.mastodon_access_token.or(self.mastodon_access_token),
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            reconnect_base_delay_ms: other.reconnect_base_delay_ms.or(self.reconnect_base_delay_ms),
            max_retries: other.max_retries.or(self.max_retries),
            poll_interval_seconds: other.poll_interval_seconds.or(self.poll_interval_seconds),
            snapshot_limit: other.snapshot_limit.or(self.snapshot_limit),
            max_redirects: other.max_redirects.or(self.max_redirects),
            subscriber_queue: other.subscriber_queue.or(self.subscriber_queue),
            tls_cert_path: other.tls_cert_path.or(self.tls_cert_path),
            tls_key_path: other.tls_key_path.or(self.tls_key_path),
        }
    }
}

/// What became of the config file layer. Loading runs before logging is set
/// up, so the outcome is kept and reported with [`FileLayer::log`] afterwards.
#[derive(Debug)]
pub enum FileLayer {
    Loaded(PathBuf),
    Missing(PathBuf),
    /// The file exists but was skipped.
    Rejected(ConfigError),
}

impl FileLayer {
    pub fn log(&self) {
        match self {
            FileLayer::Loaded(path) => tracing::info!("Loaded config file {}.", path.display()),
            FileLayer::Missing(path) => tracing::info!(
                "Config file not found at {}. Using defaults and environment/CLI variables.",
                path.display()
            ),
            FileLayer::Rejected(e) => tracing::warn!("{}. Falling back to other sources.", e),
        }
    }
}

/// Reads a JSON config file. A missing file yields `Ok(None)`.
pub fn read_config_file(path: &Path) -> Result<Option<Config>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let file_error = |reason: String| ConfigError::File {
        path: path.display().to_string(),
        reason,
    };
    let config_str = fs::read_to_string(path).map_err(|e| file_error(e.to_string()))?;
    serde_json::from_str::<Config>(&config_str)
        .map(Some)
        .map_err(|e| file_error(e.to_string()))
}

/// Layers defaults, the config file and `cli` (which already carries the
/// environment).
pub fn load_config_from(cli: Config) -> (Config, FileLayer) {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current_config = Config::defaults();
    let file_layer = match read_config_file(&config_file_path) {
        Ok(Some(file_config)) => {
            current_config = current_config.merge(file_config);
            FileLayer::Loaded(config_file_path)
        }
        Ok(None) => FileLayer::Missing(config_file_path),
        Err(e) => FileLayer::Rejected(e),
    };
    (current_config.merge(cli), file_layer)
}

/// Parses the process arguments and environment and layers them.
pub fn load_config() -> (Config, FileLayer) {
    load_config_from(Config::parse())
}

/// Validated settings.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub port: u16,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub mastodon: MastodonConfig,
    pub reconnect: ReconnectPolicy,
    pub poll_interval: Duration,
    /// Per-subscriber queue bound.
    pub subscriber_queue: usize,
    /// Certificate and key, when both are configured.
    pub tls: Option<(PathBuf, PathBuf)>,
}

impl TryFrom<Config> for RelaySettings {
    type Error = ConfigError;

    fn try_from(config: Config) -> Result<Self, Self::Error> {
        let defaults = Config::defaults();
        let config = defaults.merge(config);

        let server = config.mastodon_server.unwrap_or_default();
        match url::Url::parse(&server) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            _ => return Err(ConfigError::InvalidServer(server)),
        }

        let poll_interval_seconds = config.poll_interval_seconds.unwrap_or(60);
        if poll_interval_seconds == 0 {
            return Err(ConfigError::Zero("poll interval"));
        }
        let snapshot_limit = config.snapshot_limit.unwrap_or(20);
        if snapshot_limit == 0 {
            return Err(ConfigError::Zero("snapshot limit"));
        }
        let subscriber_queue = config.subscriber_queue.unwrap_or(DEFAULT_QUEUE_CAPACITY);
        if subscriber_queue == 0 {
            return Err(ConfigError::Zero("subscriber queue"));
        }

        let access_token = config.mastodon_access_token.filter(|t| !t.trim().is_empty());

        Ok(RelaySettings {
            port: config.port.unwrap_or(3000),
            log_dir: config.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: config.log_level.unwrap_or_else(|| "info".to_string()),
            mastodon: MastodonConfig {
                server,
                access_token,
                snapshot_limit,
                max_redirects: config.max_redirects.unwrap_or(5),
                ..MastodonConfig::default()
            },
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(config.reconnect_base_delay_ms.unwrap_or(1000)),
                max_retries: config.max_retries.unwrap_or(5),
            },
            poll_interval: Duration::from_secs(poll_interval_seconds),
            subscriber_queue,
            tls: config.tls_cert_path.zip(config.tls_key_path),
        })
    }
}
