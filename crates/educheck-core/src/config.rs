//! Sync core configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/educheck/config.toml)
//! 3. Environment variables (EDUCHECK_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable prefix
const ENV_PREFIX: &str = "EDUCHECK";

/// Default dependency wait: 10 attempts of 200ms
const DEFAULT_INIT_TIMEOUT_MS: u64 = 2_000;

/// Sync core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the local cache database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// How long to wait for the auth, remote store and snapshot bridge
    /// handles before giving up for good
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,

    /// Queue writes made while offline and replay them on reconnect
    #[serde(default = "default_true")]
    pub offline_queue_enabled: bool,

    /// Log file path (defaults to {data_dir}/educheck.log)
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            init_timeout_ms: DEFAULT_INIT_TIMEOUT_MS,
            offline_queue_enabled: true,
            log_file: None,
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (EDUCHECK_DATA_DIR, EDUCHECK_INIT_TIMEOUT_MS, EDUCHECK_OFFLINE_QUEUE)
    /// 2. Config file (~/.config/educheck/config.toml or EDUCHECK_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Configuration rooted at a directory, everything else default
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // EDUCHECK_DATA_DIR
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        // EDUCHECK_INIT_TIMEOUT_MS (ignored if not a number)
        if let Ok(val) = std::env::var(format!("{}_INIT_TIMEOUT_MS", ENV_PREFIX)) {
            if let Ok(ms) = val.trim().parse::<u64>() {
                self.init_timeout_ms = ms;
            }
        }

        // EDUCHECK_OFFLINE_QUEUE
        if let Ok(val) = std::env::var(format!("{}_OFFLINE_QUEUE", ENV_PREFIX)) {
            self.offline_queue_enabled = val.eq_ignore_ascii_case("true") || val == "1";
        }
    }

    /// Ensure data directory exists
    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_file_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with EDUCHECK_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("educheck")
            .join("config.toml")
    }

    /// Get the path to the local cache database
    pub fn cache_path(&self) -> PathBuf {
        self.data_dir.join("cache.db")
    }

    /// Get the log file path
    pub fn log_path(&self) -> PathBuf {
        self.log_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("educheck.log"))
    }

    /// Dependency acquisition budget
    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("educheck")
}

fn default_init_timeout_ms() -> u64 {
    DEFAULT_INIT_TIMEOUT_MS
}

fn default_true() -> bool {
    true
}
