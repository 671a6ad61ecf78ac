//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/forkline/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/forkline/` (~/.config/forkline/)
//! - Data: `$XDG_DATA_HOME/forkline/` (~/.local/share/forkline/)
//! - State/Logs: `$XDG_STATE_HOME/forkline/` (~/.local/state/forkline/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Checkpoint resolution limits
    #[serde(default)]
    pub resolver: ResolverConfig,

    /// Message graph admission limits
    #[serde(default)]
    pub graph: GraphConfig,

    /// Snapshot persistence behavior
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Execution engine stream settings
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

/// Checkpoint resolver configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ResolverConfig {
    /// How many messages (starting at the fork parent) are inspected for a checkpoint
    #[serde(default = "default_max_ancestor_hops")]
    pub max_ancestor_hops: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_ancestor_hops: default_max_ancestor_hops(),
        }
    }
}

fn default_max_ancestor_hops() -> usize {
    4
}

/// Message graph configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct GraphConfig {
    /// Upper bound on fixed-point admission passes (0 = pending-set size)
    #[serde(default)]
    pub max_admission_passes: usize,
}

/// Persistence configuration
#[derive(Debug, Deserialize, Clone)]
pub struct PersistenceConfig {
    /// Coalescing window for snapshot writes while a run streams
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Run audit records kept per thread
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            history_limit: default_history_limit(),
        }
    }
}

impl PersistenceConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

fn default_debounce_ms() -> u64 {
    250
}

fn default_history_limit() -> usize {
    500
}

/// Execution engine stream configuration
#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Event channel capacity between engine and session
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,

    /// Seconds without an event before the stream is treated as failed
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stream_buffer: default_stream_buffer(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EngineConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_stream_buffer() -> usize {
    64
}

fn default_timeout_secs() -> u64 {
    120
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.resolver.max_ancestor_hops == 0 {
            return Err(Error::Config(
                "resolver.max_ancestor_hops must be at least 1".to_string(),
            ));
        }
        if self.engine.stream_buffer == 0 {
            return Err(Error::Config(
                "engine.stream_buffer must be at least 1".to_string(),
            ));
        }
        if self.engine.timeout_secs == 0 {
            return Err(Error::Config(
                "engine.timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.persistence.history_limit == 0 {
            return Err(Error::Config(
                "persistence.history_limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/forkline/config.toml` (~/.config/forkline/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("forkline").join("config.toml")
    }

    /// Returns the data directory path (for SQLite database)
    ///
    /// `$XDG_DATA_HOME/forkline/` (~/.local/share/forkline/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("forkline")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/forkline/` (~/.local/state/forkline/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("forkline")
    }

    /// Returns the database file path
    ///
    /// `$XDG_DATA_HOME/forkline/forkline.db` (~/.local/share/forkline/forkline.db)
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("forkline.db")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/forkline/forkline.log` (~/.local/state/forkline/forkline.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join(crate::logging::LOG_FILE_PREFIX)
    }
}
