//! Bootstrap configuration loading and resolution
//!
//! Configuration is a single TOML file. Every field has a built-in default, so
//! a missing file is a warning, never a startup failure.
//!
//! Resolution priority for each bootstrap value:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. Compiled default (fallback)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const ENV_CONFIG: &str = "CLIPQ_CONFIG";
pub const ENV_DATABASE: &str = "CLIPQ_DATABASE";
pub const ENV_PROVIDER_API_KEY: &str = "CLIPQ_PROVIDER_API_KEY";

/// Bootstrap configuration loaded from TOML
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    /// SQLite database shared by every worker process
    pub database_path: Option<PathBuf>,
    pub logging: LoggingConfig,
    pub http: HttpConfig,
    pub queues: QueueConfig,
    pub sequencer: SequencerConfig,
    pub provider: ProviderConfig,
    pub retry: RetryConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Operational HTTP endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1:5790".to_string(),
        }
    }
}

/// Queue names and delivery policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Raw upload messages consumed by the intake stage
    pub uploads: String,
    /// Normalized jobs consumed by the sequencer
    pub segments: String,
    /// Lease length of a received message before it becomes redeliverable
    pub visibility_timeout_secs: u64,
    /// Deliveries after which a message is dead-lettered
    pub max_deliveries: u32,
    /// Idle wait between empty receives
    pub poll_interval_ms: u64,
    /// First redelivery delay after a retriable failure (doubles per delivery)
    pub redelivery_backoff_ms: u64,
    pub redelivery_backoff_max_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            uploads: "uploads".to_string(),
            segments: "segments".to_string(),
            visibility_timeout_secs: 900,
            max_deliveries: 8,
            poll_interval_ms: 500,
            redelivery_backoff_ms: 1_000,
            redelivery_backoff_max_ms: 60_000,
        }
    }
}

/// Session store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Durable, shared across processes
    Sqlite,
    /// Process-local; only valid for a single worker process
    Memory,
}

/// Sequencer worker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    pub store: StoreBackend,
    /// Sequencer worker tasks in this process
    pub workers: usize,
    /// Intake worker tasks in this process (0 disables the intake stage)
    pub intake_workers: usize,
    /// Lifetime of a release claim; must exceed the slowest `process` call
    pub claim_ttl_secs: u64,
    /// How long a non-creator waits for the creator to commit the handle
    pub init_wait_ms: u64,
    /// Interval of the stalled-session sweep (0 disables it)
    pub sweep_interval_secs: u64,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            store: StoreBackend::Sqlite,
            workers: 4,
            intake_workers: 1,
            claim_ttl_secs: 900,
            init_wait_ms: 10_000,
            sweep_interval_secs: 30,
        }
    }
}

/// Feedback provider implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Openai,
    Echo,
}

/// Feedback provider settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub base_url: String,
    pub api_key: Option<String>,
    pub organization: Option<String>,
    pub project: Option<String>,
    pub assistant_id: Option<String>,
    /// Timeout of a single HTTP request
    pub request_timeout_secs: u64,
    /// Upper bound on waiting for one assistant run to complete
    pub completion_timeout_secs: u64,
    pub poll_initial_ms: u64,
    pub poll_max_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::Echo,
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            organization: None,
            project: None,
            assistant_id: None,
            request_timeout_secs: 60,
            completion_timeout_secs: 300,
            poll_initial_ms: 500,
            poll_max_ms: 5_000,
        }
    }
}

/// Bounded retry policy for external calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
        }
    }
}

/// Config file location resolution
///
/// An explicitly requested file (CLI or environment) must exist; discovered
/// locations are optional.
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    cli_path: Option<PathBuf>,
}

/// Where the config path came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Explicit(PathBuf),
    Discovered(PathBuf),
    Defaults,
}

impl ConfigResolver {
    pub fn new(cli_path: Option<PathBuf>) -> Self {
        Self { cli_path }
    }

    pub fn resolve(&self) -> ConfigSource {
        // Priority 1: Command-line argument
        if let Some(path) = &self.cli_path {
            return ConfigSource::Explicit(path.clone());
        }

        // Priority 2: Environment variable
        if let Ok(path) = std::env::var(ENV_CONFIG) {
            if !path.trim().is_empty() {
                return ConfigSource::Explicit(PathBuf::from(path));
            }
        }

        // Priority 3: user then system config file
        default_config_paths()
            .into_iter()
            .find(|path| path.exists())
            .map(ConfigSource::Discovered)
            .unwrap_or(ConfigSource::Defaults)
    }

    /// Resolve and load the configuration
    pub fn load(&self) -> Result<TomlConfig> {
        match self.resolve() {
            ConfigSource::Explicit(path) => load_toml_config(&path),
            ConfigSource::Discovered(path) => match load_toml_config(&path) {
                Ok(config) => Ok(config),
                Err(e) => {
                    warn!("Ignoring unreadable config {}: {}", path.display(), e);
                    Ok(TomlConfig::default())
                }
            },
            ConfigSource::Defaults => {
                warn!("No config file found, using built-in defaults");
                Ok(TomlConfig::default())
            }
        }
    }
}

/// Candidate config file locations, highest priority first
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("clipq").join("clipq.toml"));
    }
    if cfg!(unix) {
        paths.push(PathBuf::from("/etc/clipq/clipq.toml"));
    }
    paths
}

/// Load and parse a TOML config file
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    let config: TomlConfig = toml::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })?;
    info!("Loaded TOML configuration from {}", path.display());
    Ok(config)
}

/// Write a TOML config file, creating parent directories
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Resolve the database path: CLI → ENV → TOML → OS default
pub fn resolve_database_path(cli_arg: Option<&Path>, config: &TomlConfig) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(ENV_DATABASE) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = &config.database_path {
        return path.clone();
    }

    default_database_path()
}

/// OS-dependent default database location
pub fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("clipq").join("clipq.db"))
        .unwrap_or_else(|| PathBuf::from("./clipq_data/clipq.db"))
}

/// Resolve the provider API key: ENV → TOML
///
/// Warns when both sources carry a key, since only the environment value is
/// used.
pub fn resolve_provider_api_key(config: &TomlConfig) -> Option<String> {
    let env_key = std::env::var(ENV_PROVIDER_API_KEY)
        .ok()
        .filter(|key| is_valid_key(key));
    let toml_key = config
        .provider
        .api_key
        .clone()
        .filter(|key| is_valid_key(key));

    match (env_key, toml_key) {
        (Some(env_key), Some(_)) => {
            warn!(
                "Provider API key found in environment and TOML. Using environment (highest priority)."
            );
            Some(env_key)
        }
        (Some(env_key), None) => {
            info!("Provider API key loaded from environment variable");
            Some(env_key)
        }
        (None, Some(toml_key)) => {
            info!("Provider API key loaded from TOML config");
            Some(toml_key)
        }
        (None, None) => None,
    }
}

/// Validate API key (non-empty, non-whitespace)
pub fn is_valid_key(key: &str) -> bool {
    !key.trim().is_empty()
}
