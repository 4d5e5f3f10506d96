//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use crate::archive::{ArchiveConfig, StalenessPolicy};
use crate::query::{Criterion, PrecedencePolicy};
use crate::scan::FingerprintMode;
use crate::storage::SourceSpec;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub index: IndexSection,

    #[serde(default)]
    pub cache: CacheSection,

    #[serde(default)]
    pub scan: ScanSection,

    #[serde(default, rename = "source")]
    pub sources: Vec<SourceConfig>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Persistent index configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IndexSection {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default = "default_reader_pool_size")]
    pub reader_pool_size: usize,
}

fn default_data_dir() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("seisindex").to_string_lossy().to_string())
        .unwrap_or_else(|| "./seisindex_data".to_string())
}

fn default_reader_pool_size() -> usize {
    4
}

impl Default for IndexSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            reader_pool_size: default_reader_pool_size(),
        }
    }
}

/// Decode cache configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_budget_bytes")]
    pub budget_bytes: usize,
}

fn default_budget_bytes() -> usize {
    crate::cache::DEFAULT_BUDGET_BYTES
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            budget_bytes: default_budget_bytes(),
        }
    }
}

/// Scanner and resolver configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ScanSection {
    /// `size+mtime` or `size+mtime+crc32`
    #[serde(default = "default_fingerprint")]
    pub fingerprint: String,

    /// `never`, `always` or a maximum age in seconds
    #[serde(default = "default_staleness")]
    pub staleness: String,

    #[serde(default)]
    pub follow_links: bool,

    /// Tie-break criteria, strongest first
    #[serde(default = "default_precedence")]
    pub precedence: Vec<String>,
}

fn default_fingerprint() -> String {
    "size+mtime".to_string()
}

fn default_staleness() -> String {
    "never".to_string()
}

fn default_precedence() -> Vec<String> {
    vec!["priority".to_string(), "recency".to_string(), "path".to_string()]
}

impl Default for ScanSection {
    fn default() -> Self {
        Self {
            fingerprint: default_fingerprint(),
            staleness: default_staleness(),
            follow_links: false,
            precedence: default_precedence(),
        }
    }
}

/// One `[[source]]` table
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub root: String,

    #[serde(default)]
    pub priority: i32,

    pub include: Option<String>,

    pub exclude: Option<String>,

    pub format: Option<String>,
}

impl From<&SourceConfig> for SourceSpec {
    fn from(config: &SourceConfig) -> Self {
        SourceSpec {
            root: PathBuf::from(&config.root),
            include: config.include.clone(),
            exclude: config.exclude.clone(),
            priority: config.priority,
            format: config.format.clone(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,

    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl LoggingConfig {
    /// Install the global tracing subscriber
    ///
    /// `RUST_LOG` takes precedence over the configured level.
    pub fn init(&self) -> Result<(), ConfigError> {
        use tracing_subscriber::fmt::writer::BoxMakeWriter;
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.level))
            .map_err(|e| ConfigError::Invalid(format!("Invalid log level '{}': {}", self.level, e)))?;

        let writer = match &self.file {
            Some(path) => {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| ConfigError::Io {
                        path: PathBuf::from(path),
                        error: e.to_string(),
                    })?;
                BoxMakeWriter::new(std::sync::Mutex::new(file))
            }
            None => BoxMakeWriter::new(std::io::stderr),
        };
        let ansi = self.file.is_none();

        let registry = tracing_subscriber::registry().with(filter);
        let result = match self.format.as_str() {
            "json" => registry
                .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
                .try_init(),
            "pretty" => registry
                .with(tracing_subscriber::fmt::layer().with_ansi(ansi).with_writer(writer))
                .try_init(),
            other => {
                return Err(ConfigError::Invalid(format!(
                    "Unknown log format '{}', expected pretty or json",
                    other
                )))
            }
        };

        result.map_err(|e| ConfigError::Invalid(format!("Logging already initialized: {}", e)))
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::parse(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("seisindex").join("config.toml")),
            Some(PathBuf::from("/etc/seisindex/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        if let Ok(data_dir) = std::env::var("SEISINDEX_DATA_DIR") {
            self.index.data_dir = data_dir;
        }

        if let Ok(bytes) = std::env::var("SEISINDEX_CACHE_BYTES") {
            match bytes.parse() {
                Ok(b) => self.cache.budget_bytes = b,
                Err(_) => tracing::warn!("Ignoring invalid SEISINDEX_CACHE_BYTES: {}", bytes),
            }
        }

        if let Ok(staleness) = std::env::var("SEISINDEX_STALENESS") {
            self.scan.staleness = staleness;
        }

        if let Ok(level) = std::env::var("SEISINDEX_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("SEISINDEX_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Validate and convert into the settings of an archive handle
    pub fn archive_config(&self) -> Result<ArchiveConfig, ConfigError> {
        let fingerprint: FingerprintMode = self.scan.fingerprint.parse().map_err(ConfigError::Invalid)?;
        let staleness: StalenessPolicy = self.scan.staleness.parse().map_err(ConfigError::Invalid)?;
        let criteria = self
            .scan
            .precedence
            .iter()
            .map(|c| c.parse::<Criterion>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(ConfigError::Invalid)?;
        if criteria.is_empty() {
            return Err(ConfigError::Invalid("scan.precedence must not be empty".to_string()));
        }
        if self.index.reader_pool_size == 0 {
            return Err(ConfigError::Invalid("index.reader_pool_size must be at least 1".to_string()));
        }

        Ok(ArchiveConfig {
            data_dir: expand_home(&self.index.data_dir),
            cache_budget_bytes: self.cache.budget_bytes,
            fingerprint,
            follow_links: self.scan.follow_links,
            staleness,
            precedence: PrecedencePolicy::new(criteria),
            reader_pool_size: self.index.reader_pool_size,
            sources: self.sources.iter().map(SourceSpec::from).collect(),
        })
    }
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# seisindex configuration
#
# Environment variables override these settings:
# - SEISINDEX_DATA_DIR
# - SEISINDEX_CACHE_BYTES
# - SEISINDEX_STALENESS
# - SEISINDEX_LOG_LEVEL
# - SEISINDEX_LOG_FORMAT

[index]
# Directory holding index.sqlite
data_dir = "~/.local/share/seisindex"

# Read-only connections kept for concurrent queries
reader_pool_size = 4

[cache]
# Memory budget for decoded payloads (bytes)
budget_bytes = 268435456

[scan]
# Change detection: size+mtime, or size+mtime+crc32 to also hash contents
fingerprint = "size+mtime"

# Rescan on open: never, always, or the maximum index age in seconds
staleness = "never"

# Follow symbolic links while walking sources
follow_links = false

# Which segment wins where data overlaps, strongest criterion first
precedence = ["priority", "recency", "path"]

# One table per archive source
# [[source]]
# root = "/data/archive"
# priority = 10
# include = "\\.trace$"
# exclude = "/tmp/"
# format = "text_trace"

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"

# Optional log file path
# file = "/var/log/seisindex/seisindex.log"
"#
    .to_string()
}
