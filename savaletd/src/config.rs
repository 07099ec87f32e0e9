// ABOUTME: loads and checks the daemon toml configuration (socket, limits, environment, allow-list).
// ABOUTME: any error here is fatal at startup; on reload the previous allow-list is kept.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

pub const LOG_LEVELS: [&str; 4] = ["debug", "info", "warn", "error"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid log level: {0} (expected debug|info|warn|error)")]
    InvalidLogLevel(String),

    #[error("invalid limit: {0}")]
    InvalidLimit(String),

    #[error("allow-list is empty; refusing to run without any permitted command")]
    NoCommands,

    #[error("command entry {index} has an empty name")]
    EmptyName { index: usize },

    #[error("command {0} is listed more than once")]
    DuplicateCommand(String),

    #[error("command {name}: {message}")]
    InvalidTimeout { name: String, message: String },

    #[error("command {name}: argument pattern {index} is invalid: {source}")]
    InvalidPattern {
        name: String,
        index: usize,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    #[serde(default = "default_socket_mode")]
    pub socket_mode: u32,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub audit_path: Option<PathBuf>,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub environment: EnvironmentConfig,
    #[serde(default)]
    pub commands: Vec<CommandConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsConfig {
    /// Per-stream capture ceiling; output past it is discarded and flagged truncated.
    pub max_output_bytes: usize,
    pub max_concurrent: usize,
    /// Requests allowed to wait for a free slot; beyond this they fail fast.
    pub max_queued: usize,
    /// Time between SIGTERM and SIGKILL when a child overruns its deadline.
    pub kill_grace_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig {
            max_output_bytes: 1024 * 1024,
            max_concurrent: 16,
            max_queued: 32,
            kill_grace_ms: 2000,
        }
    }
}

impl LimitsConfig {
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnvironmentConfig {
    /// PATH handed to children; nothing else is inherited from the daemon.
    pub path: String,
    pub env: BTreeMap<String, String>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        EnvironmentConfig {
            path: "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandConfig {
    pub name: String,
    /// Binary to spawn; defaults to `name`.
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default)]
    pub args: Vec<ArgPattern>,
    /// Default timeout in seconds, used when the request asks for <= 0.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Largest timeout a request may ask for; defaults to `timeout`.
    #[serde(default)]
    pub max_timeout: Option<u64>,
}

/// `args = ["status", { glob = "*.service" }, { regex = "[0-9]+" }]`
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ArgPattern {
    Literal(String),
    Typed(TypedArgPattern),
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TypedArgPattern {
    Literal(String),
    Glob(String),
    Regex(String),
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/var/run/savalet.sock")
}

fn default_socket_mode() -> u32 {
    0o660
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timeout() -> u64 {
    30
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: DaemonConfig = toml::from_str(content)?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<(), ConfigError> {
        check_log_level(&self.log_level)?;
        if self.limits.max_concurrent == 0 {
            return Err(ConfigError::InvalidLimit("max_concurrent must be > 0".to_string()));
        }
        if self.limits.max_output_bytes == 0 {
            return Err(ConfigError::InvalidLimit("max_output_bytes must be > 0".to_string()));
        }
        if self.socket_mode > 0o777 {
            return Err(ConfigError::InvalidLimit(format!(
                "socket_mode {:o} is not a permission mode",
                self.socket_mode
            )));
        }
        Ok(())
    }
}

pub fn check_log_level(level: &str) -> Result<(), ConfigError> {
    if LOG_LEVELS.contains(&level) {
        Ok(())
    } else {
        Err(ConfigError::InvalidLogLevel(level.to_string()))
    }
}
