use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Source of a configuration value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Default,
    File,
    Environment,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::File => write!(f, "file"),
            ConfigSource::Environment => write!(f, "environment"),
        }
    }
}

/// A configuration value with its source
#[derive(Debug, Clone, Serialize)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> ConfigValue<T> {
    pub fn new(value: T, source: ConfigSource) -> Self {
        Self { value, source }
    }
}

/// Application configuration with source tracking
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Directory holding local replicas and server topic storage
    pub data_dir: ConfigValue<PathBuf>,
    /// Relay URL the CLI syncs with (e.g., "ws://localhost:8048")
    pub server_url: ConfigValue<String>,
    /// Port the relay listens on
    pub port: ConfigValue<u16>,
    /// Synchronizer request timeout, when set
    pub request_timeout_secs: ConfigValue<Option<u64>>,
    /// Fixed replica id for the local clock tag, when set
    pub replica_id: ConfigValue<Option<String>>,
    /// Config file path used (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
}

/// Internal struct for deserializing config file
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    data_dir: Option<PathBuf>,
    server_url: Option<String>,
    port: Option<u16>,
    request_timeout_secs: Option<u64>,
    replica_id: Option<String>,
}

pub const DEFAULT_PORT: u16 = 8048;

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut data_dir = ConfigValue::new(Self::default_data_dir(), ConfigSource::Default);
        let mut server_url = ConfigValue::new(format!("ws://localhost:{DEFAULT_PORT}"), ConfigSource::Default);
        let mut port = ConfigValue::new(DEFAULT_PORT, ConfigSource::Default);
        let mut request_timeout_secs = ConfigValue::new(None, ConfigSource::Default);
        let mut replica_id = ConfigValue::new(None, ConfigSource::Default);
        let mut config_file = None;

        let path = config_path
            .or_else(|| std::env::var("TABSYNC_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            let file_config: ConfigFile = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;

            config_file = Some(path.clone());

            if let Some(dir) = file_config.data_dir {
                // Resolve relative paths against config file's directory
                let resolved = if dir.is_relative() {
                    path.parent().map(|p| p.join(&dir)).unwrap_or(dir)
                } else {
                    dir
                };
                data_dir = ConfigValue::new(resolved, ConfigSource::File);
            }
            if let Some(url) = file_config.server_url {
                server_url = ConfigValue::new(url, ConfigSource::File);
            }
            if let Some(p) = file_config.port {
                port = ConfigValue::new(p, ConfigSource::File);
            }
            if let Some(secs) = file_config.request_timeout_secs {
                request_timeout_secs = ConfigValue::new(Some(secs), ConfigSource::File);
            }
            if let Some(id) = file_config.replica_id {
                replica_id = ConfigValue::new(Some(id), ConfigSource::File);
            }
        }

        if let Ok(dir) = std::env::var("TABSYNC_DATA_DIR") {
            data_dir = ConfigValue::new(PathBuf::from(dir), ConfigSource::Environment);
        }
        if let Ok(url) = std::env::var("TABSYNC_SERVER_URL") {
            server_url = ConfigValue::new(url, ConfigSource::Environment);
        }
        if let Ok(p) = std::env::var("TABSYNC_PORT") {
            let p = p
                .parse()
                .map_err(|_| ConfigError::InvalidValue("TABSYNC_PORT", p.clone()))?;
            port = ConfigValue::new(p, ConfigSource::Environment);
        }
        if let Ok(secs) = std::env::var("TABSYNC_REQUEST_TIMEOUT") {
            let secs = secs
                .parse()
                .map_err(|_| ConfigError::InvalidValue("TABSYNC_REQUEST_TIMEOUT", secs.clone()))?;
            request_timeout_secs = ConfigValue::new(Some(secs), ConfigSource::Environment);
        }
        if let Ok(id) = std::env::var("TABSYNC_REPLICA_ID") {
            replica_id = ConfigValue::new(Some(id), ConfigSource::Environment);
        }

        Ok(Self {
            data_dir,
            server_url,
            port,
            request_timeout_secs,
            replica_id,
            config_file,
        })
    }

    /// The configured request timeout, or `fallback` when unset.
    pub fn request_timeout(&self, fallback: Duration) -> Duration {
        self.request_timeout_secs
            .value
            .map(Duration::from_secs)
            .unwrap_or(fallback)
    }

    /// Where the CLI keeps its local replica of a topic.
    pub fn replica_dir(&self, topic: &str) -> PathBuf {
        self.data_dir.value.join("replicas").join(topic)
    }

    /// Where the relay keeps its topic storage.
    pub fn topics_dir(&self) -> PathBuf {
        self.data_dir.value.join("topics")
    }

    /// Default config directory (platform-specific):
    /// - Linux: ~/.config/tabsync/
    /// - macOS: ~/Library/Application Support/tabsync/
    /// - Windows: %APPDATA%/tabsync/
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tabsync")
    }

    /// Default data directory (platform-specific):
    /// - Linux: ~/.local/share/tabsync/
    /// - macOS: ~/Library/Application Support/tabsync/
    /// - Windows: %APPDATA%/tabsync/
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tabsync")
    }

    /// Default config file path (platform-specific config dir + config.yaml)
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.yaml")
    }
}

#[derive(Debug)]
pub enum ConfigError {
    ReadError(PathBuf, std::io::Error),
    ParseError(PathBuf, serde_yaml::Error),
    InvalidValue(&'static str, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidValue(name, value) => {
                write!(f, "Invalid value for {}: '{}'", name, value)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
