//! Configuration management for the backup engine.
//!
//! Loads configuration from an optional TOML file layered with
//! `BACKUP_ENGINE__SECTION__KEY` environment variable overrides, then
//! validates it once. Commands receive typed option structs built from it.

use crate::hash::HashAlgorithm;
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "BACKUP_ENGINE";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub crypto: CryptoConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Block size in bytes (default: 1MB)
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// Maximum concurrent backend operations per storage queue
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Hash algorithm used to fingerprint blocks (sha512, sha256)
    #[serde(default = "default_hash_algorithm")]
    pub hash_algorithm: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    /// Shared secret for both content and name encryption.
    /// Without it, backends store plaintext.
    #[serde(default)]
    pub key: Option<String>,

    /// Compress block content with zstd before encryption
    #[serde(default)]
    pub compression: bool,

    /// Compression level (1-22 for zstd)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Bearer token for HTTP backends
    #[serde(default)]
    pub token: Option<String>,

    /// Retries for transient HTTP failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial retry delay, doubled on each attempt
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Per-request timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_block_size() -> usize {
    1024 * 1024 // 1MB
}

fn default_concurrency() -> usize {
    10
}

fn default_hash_algorithm() -> String {
    "sha512".to_string()
}

fn default_compression_level() -> i32 {
    3
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    200
}

fn default_retry_max_delay_ms() -> u64 {
    10_000
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            concurrency: default_concurrency(),
            hash_algorithm: default_hash_algorithm(),
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            key: None,
            compression: false,
            compression_level: default_compression_level(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            token: None,
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, without environment overrides.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load defaults, then the optional file, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = ::config::Config::try_from(&Config::default()).map_err(config_error)?;
        let mut builder = ::config::Config::builder().add_source(defaults);

        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Toml)
                    .required(true),
            );
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(config_error)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values no command can run with.
    pub fn validate(&self) -> Result<()> {
        if self.engine.block_size == 0 {
            return Err(EngineError::Config("block_size must be greater than 0".into()));
        }
        if self.engine.concurrency == 0 {
            return Err(EngineError::Config("concurrency must be greater than 0".into()));
        }
        self.hash_algorithm()?;
        if !(1..=22).contains(&self.crypto.compression_level) {
            return Err(EngineError::Config(format!(
                "compression_level must be within 1-22, got {}",
                self.crypto.compression_level
            )));
        }
        if matches!(self.crypto.key.as_deref(), Some("")) {
            return Err(EngineError::Config("crypto key must not be empty".into()));
        }
        Ok(())
    }

    pub fn hash_algorithm(&self) -> Result<HashAlgorithm> {
        self.engine.hash_algorithm.parse()
    }
}

fn config_error(err: ::config::ConfigError) -> EngineError {
    EngineError::Config(err.to_string())
}

/// Options for one `persist` run.
#[derive(Debug, Clone)]
pub struct PersistOptions {
    pub block_size: usize,
    pub hash_algorithm: HashAlgorithm,
    /// File with one known-stored fingerprint per line
    pub skip_blocks_file: Option<PathBuf>,
    /// Seed the skip-set from every manifest already on the manifest backend
    pub scan_manifests: bool,
    /// Seed the skip-set by listing the data backend
    pub continue_from_backend: bool,
}

impl PersistOptions {
    /// Defaults for an incremental run: manifests are scanned unless a
    /// skip-blocks file is given.
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            block_size: config.engine.block_size,
            hash_algorithm: config.hash_algorithm()?,
            skip_blocks_file: None,
            scan_manifests: true,
            continue_from_backend: false,
        })
    }
}

/// Options for one `materialize` run.
#[derive(Debug, Clone, Default)]
pub struct MaterializeOptions {
    /// Restore only these paths (and everything below them); empty means all
    pub filters: Vec<String>,
    /// Re-apply permissions, timestamps and (as root) ownership
    pub apply_metadata: bool,
}
