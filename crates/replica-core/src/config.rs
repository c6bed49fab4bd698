//! Replica configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/replica/config.toml)
//! 3. Environment variables (REPLICA_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix
const ENV_PREFIX: &str = "REPLICA";

/// Replica configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the local store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Base URL of the upstream HTTP API (optimistic writes, migration checks)
    #[serde(default)]
    pub api_url: Option<String>,

    /// Base URL of the change-feed endpoint
    #[serde(default)]
    pub stream_url: Option<String>,

    /// Identity used for role and membership queries
    #[serde(default)]
    pub user_id: Option<String>,

    /// Optional log file; logs go to stderr when unset
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Tables `replica sync` subscribes to when none are given
    #[serde(default = "default_tables")]
    pub tables: Vec<String>,

    /// Echo suppression windows
    #[serde(default)]
    pub echo: EchoConfig,

    /// Change-feed reconnect behaviour
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Upstream API client settings
    #[serde(default)]
    pub upstream: UpstreamConfig,
}

/// How long a pending optimistic write suppresses its replayed echo
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EchoConfig {
    pub create_window_ms: u64,
    pub delete_window_ms: u64,
    pub update_window_ms: u64,
    pub reorder_window_ms: u64,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            create_window_ms: 5_000,
            delete_window_ms: 5_000,
            update_window_ms: 15_000,
            reorder_window_ms: 15_000,
        }
    }
}

/// Exponential backoff bounds for the change feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl ReconnectConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.max(self.initial_delay_ms))
    }
}

/// Upstream request limits; a write whose request times out is rolled back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub timeout_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            api_url: None,
            stream_url: None,
            user_id: None,
            log_file: None,
            tables: default_tables(),
            echo: EchoConfig::default(),
            reconnect: ReconnectConfig::default(),
            upstream: UpstreamConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (REPLICA_DATA_DIR, REPLICA_API_URL, ...)
    /// 2. Config file (~/.config/replica/config.toml or REPLICA_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration, preferring an explicit path from the command line
    pub fn load_with_override(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
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

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        // Empty values clear the optional settings
        if let Ok(val) = std::env::var(format!("{}_API_URL", ENV_PREFIX)) {
            self.api_url = non_empty(val);
        }

        if let Ok(val) = std::env::var(format!("{}_STREAM_URL", ENV_PREFIX)) {
            self.stream_url = non_empty(val);
        }

        if let Ok(val) = std::env::var(format!("{}_USER_ID", ENV_PREFIX)) {
            self.user_id = non_empty(val);
        }

        if let Ok(val) = std::env::var(format!("{}_LOG_FILE", ENV_PREFIX)) {
            self.log_file = non_empty(val).map(PathBuf::from);
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

    /// Save configuration to the default file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    /// Save configuration to a specific file
    pub fn save_to_path(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Set a single value by key, as used by `replica config set`
    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "data_dir" => self.data_dir = PathBuf::from(value),
            "api_url" => self.api_url = non_empty(value.to_string()),
            "stream_url" => self.stream_url = non_empty(value.to_string()),
            "user_id" => self.user_id = non_empty(value.to_string()),
            "log_file" => self.log_file = non_empty(value.to_string()).map(PathBuf::from),
            "tables" => {
                self.tables = value
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect()
            }
            "echo.create_window_ms" => self.echo.create_window_ms = parse_ms(key, value)?,
            "echo.delete_window_ms" => self.echo.delete_window_ms = parse_ms(key, value)?,
            "echo.update_window_ms" => self.echo.update_window_ms = parse_ms(key, value)?,
            "echo.reorder_window_ms" => self.echo.reorder_window_ms = parse_ms(key, value)?,
            "reconnect.initial_delay_ms" => {
                self.reconnect.initial_delay_ms = parse_ms(key, value)?
            }
            "reconnect.max_delay_ms" => self.reconnect.max_delay_ms = parse_ms(key, value)?,
            "upstream.timeout_ms" => self.upstream.timeout_ms = parse_ms(key, value)?,
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with REPLICA_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("replica")
            .join("config.toml")
    }

    /// Get the path to the SQLite database
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("replica.db")
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("replica")
}

fn default_tables() -> Vec<String> {
    ["companies", "company_members", "spaces", "space_members", "space_items"]
        .iter()
        .map(|t| t.to_string())
        .collect()
}

fn non_empty(val: String) -> Option<String> {
    if val.is_empty() {
        None
    } else {
        Some(val)
    }
}

fn parse_ms(key: &str, value: &str) -> Result<u64> {
    value
        .parse()
        .with_context(|| format!("{} expects milliseconds, got '{}'", key, value))
}
