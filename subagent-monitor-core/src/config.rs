//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/subagent-monitor/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/subagent-monitor/` (~/.config/subagent-monitor/)
//! - Data: `$XDG_DATA_HOME/subagent-monitor/` (~/.local/share/subagent-monitor/)
//! - State/Logs: `$XDG_STATE_HOME/subagent-monitor/` (~/.local/state/subagent-monitor/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "subagent-monitor";

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
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Active-invocation registry settings
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Stop detection tuning
    #[serde(default)]
    pub detection: DetectionConfig,

    /// Statistics database settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Active-invocation registry configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    /// Override path for the registry state document
    pub state_path: Option<PathBuf>,

    /// Seconds after which non-active records are purged
    #[serde(default = "default_retention_secs")]
    pub retention_secs: i64,

    /// Upper bound on waiting for the registry lock
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Delay between non-blocking lock attempts
    #[serde(default = "default_lock_retry_ms")]
    pub lock_retry_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            state_path: None,
            retention_secs: default_retention_secs(),
            lock_timeout_ms: default_lock_timeout_ms(),
            lock_retry_ms: default_lock_retry_ms(),
        }
    }
}

fn default_retention_secs() -> i64 {
    3600
}

fn default_lock_timeout_ms() -> u64 {
    2000
}

fn default_lock_retry_ms() -> u64 {
    25
}

/// Stop-detection thresholds
#[derive(Debug, Deserialize, Clone)]
pub struct DetectionConfig {
    /// How many trailing transcript lines to scan for sidechain activity
    #[serde(default = "default_tail_lines")]
    pub tail_lines: usize,

    /// Candidates started within this many seconds get the recency bonus
    #[serde(default = "default_recent_start_secs")]
    pub recent_start_secs: i64,

    /// Maximum line distance for the position-proximity bonus
    #[serde(default = "default_position_window")]
    pub position_window: u64,

    /// Selections younger than this get the confidence age bonus
    #[serde(default = "default_confident_age_secs")]
    pub confident_age_secs: i64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            tail_lines: default_tail_lines(),
            recent_start_secs: default_recent_start_secs(),
            position_window: default_position_window(),
            confident_age_secs: default_confident_age_secs(),
        }
    }
}

fn default_tail_lines() -> usize {
    20
}

fn default_recent_start_secs() -> i64 {
    60
}

fn default_position_window() -> u64 {
    100
}

fn default_confident_age_secs() -> i64 {
    30
}

/// Statistics database configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Override path for the SQLite database
    pub database_path: Option<PathBuf>,

    /// SQLite busy timeout for contended writes
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

/// Logging configuration
#[derive(Debug, Deserialize)]
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

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::debug!("No config file found at {:?}, using defaults", config_path);
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

    /// Reject settings that would make lock acquisition or retention degenerate
    pub fn validate(&self) -> Result<()> {
        if self.registry.lock_timeout_ms == 0 {
            return Err(Error::Config(
                "registry.lock_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.registry.lock_retry_ms == 0 {
            return Err(Error::Config(
                "registry.lock_retry_ms must be greater than 0".to_string(),
            ));
        }
        if self.registry.retention_secs <= 0 {
            return Err(Error::Config(
                "registry.retention_secs must be positive".to_string(),
            ));
        }
        if self.detection.tail_lines == 0 {
            return Err(Error::Config(
                "detection.tail_lines must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/subagent-monitor/config.toml`
    pub fn config_path() -> PathBuf {
        xdg_config_home().join(APP_DIR).join("config.toml")
    }

    /// Returns the data directory path (registry state and SQLite database)
    ///
    /// `$XDG_DATA_HOME/subagent-monitor/`
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join(APP_DIR)
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/subagent-monitor/`
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join(APP_DIR)
    }

    /// Returns the log file path
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("subagent-monitor.log")
    }

    /// Registry state document, honoring the `[registry] state_path` override
    pub fn registry_path(&self) -> PathBuf {
        self.registry
            .state_path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("active_subagents.json"))
    }

    /// SQLite database path, honoring the `[storage] database_path` override
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("subagents.db"))
    }
}
