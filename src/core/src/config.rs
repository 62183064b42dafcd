use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{KitError, Result};

/// Maximum number of parent ModelKits a Kitfile may inherit from through
/// `model.path` references.
pub const MAX_MODEL_REF_CHAIN: usize = 10;

/// File names recognised as a Kitfile, in lookup order.
pub const DEFAULT_KITFILE_NAMES: [&str; 3] = ["Kitfile", "kitfile", ".kitfile"];

/// Name of the per-context ignore file.
pub const IGNORE_FILE_NAME: &str = ".kitignore";

/// Default chunk size for chunked uploads (100 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 100 << 20;

const STORAGE_SUBPATH: &str = "storage";
const CACHE_SUBPATH: &str = "cache";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KitConfig {
    /// Directory holding local storage (and, unless overridden, the cache)
    pub config_home: PathBuf,

    /// Cache directory override
    pub cache_home: Option<PathBuf>,

    /// Log level
    pub log_level: LogLevel,

    /// Emit JSON log lines instead of human-readable ones
    pub log_json: bool,

    /// Registry transport settings
    pub network: NetworkOptions,
}

impl Default for KitConfig {
    fn default() -> Self {
        Self {
            config_home: PathBuf::from("."),
            cache_home: None,
            log_level: LogLevel::Warn,
            log_json: false,
            network: NetworkOptions::default(),
        }
    }
}

impl KitConfig {
    /// Configuration rooted at `config_home` with every other field defaulted.
    pub fn with_home(config_home: impl Into<PathBuf>) -> Self {
        Self {
            config_home: config_home.into(),
            ..Default::default()
        }
    }

    /// Load a YAML config file. A missing file yields the defaults rooted at
    /// the file's parent directory.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            let home = path.parent().unwrap_or_else(|| Path::new("."));
            return Ok(Self::with_home(home));
        }
        let data = std::fs::read_to_string(path).map_err(|e| {
            KitError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: KitConfig = serde_yaml::from_str(&data).map_err(|e| {
            KitError::ConfigError(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.network.validate()?;
        Ok(config)
    }

    /// `<config_home>/storage`
    pub fn storage_path(&self) -> PathBuf {
        self.config_home.join(STORAGE_SUBPATH)
    }

    /// `<cache_home or config_home>/cache`
    pub fn cache_path(&self) -> PathBuf {
        self.cache_home
            .as_ref()
            .unwrap_or(&self.config_home)
            .join(CACHE_SUBPATH)
    }
}

/// `<storage>/blobs`
pub fn blobs_path(storage: &Path) -> PathBuf {
    storage.join("blobs")
}

/// `<storage>/ingest`
pub fn ingest_path(storage: &Path) -> PathBuf {
    storage.join("ingest")
}

/// `<storage>/refs`
pub fn refs_path(storage: &Path) -> PathBuf {
    storage.join("refs")
}

/// Registry transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkOptions {
    /// Use plain HTTP instead of HTTPS
    pub plain_http: bool,

    /// Verify registry TLS certificates
    pub tls_verify: bool,

    /// HTTP(S) proxy URL
    pub proxy: Option<String>,

    /// Maximum number of parallel blob transfers
    pub concurrency: usize,

    /// Chunk size for chunked uploads, in bytes
    pub chunk_size: u64,

    /// Timeout for manifest and metadata requests, in seconds
    pub metadata_timeout_secs: u64,

    /// Timeout for blob transfers, in seconds
    pub transfer_timeout_secs: u64,

    /// User-Agent sent to registries
    pub user_agent: String,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            plain_http: false,
            tls_verify: true,
            proxy: None,
            concurrency: 5,
            chunk_size: DEFAULT_CHUNK_SIZE,
            metadata_timeout_secs: 10,
            transfer_timeout_secs: 3600, // 1 hour
            user_agent: format!("kitops/{}", crate::VERSION),
        }
    }
}

impl NetworkOptions {
    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(KitError::ConfigError(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(KitError::ConfigError(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}
