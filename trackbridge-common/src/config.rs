//! Configuration loading: server credentials and bootstrap TOML
//!
//! Credentials always come from the process environment. Everything else is
//! read from a bootstrap TOML file resolved in priority order:
//! 1. Command-line argument (highest priority)
//! 2. `TB_CONFIG` environment variable
//! 3. `<config dir>/trackbridge/config.toml`
//! 4. Compiled defaults (fallback)
//!
//! A missing or unparsable TOML file never stops startup; it is logged and the
//! compiled defaults are used instead.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming the bootstrap config file
pub const CONFIG_ENV_VAR: &str = "TB_CONFIG";

/// Default environment prefix for the origin server credentials
pub const ORIGIN_PREFIX: &str = "TB_ORIGIN";

/// Default environment prefix for the mirror server credentials
pub const MIRROR_PREFIX: &str = "TB_MIRROR";

/// Connection details for one tracking server
#[derive(Clone, PartialEq, Eq)]
pub struct ServerCredentials {
    /// Display name used in logs and in the `synced_from` tag
    pub name: String,
    /// Base URL, e.g. `https://studio.example.com`
    pub server_url: String,
    pub api_user: String,
    pub api_key: String,
}

impl fmt::Debug for ServerCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCredentials")
            .field("name", &self.name)
            .field("server_url", &self.server_url)
            .field("api_user", &self.api_user)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl ServerCredentials {
    /// Reads `{prefix}_SERVER_URL`, `{prefix}_API_USER`, `{prefix}_API_KEY`
    /// and the optional `{prefix}_SERVER_NAME` from the process environment.
    pub fn from_env(prefix: &str, default_name: &str) -> Result<Self> {
        Self::from_lookup(prefix, default_name, |key| std::env::var(key).ok())
    }

    /// Same as [`ServerCredentials::from_env`] with an injectable lookup
    pub fn from_lookup<F>(prefix: &str, default_name: &str, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |suffix: &str| {
            let key = format!("{}_{}", prefix, suffix);
            lookup(&key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| {
                    Error::connection(
                        default_name,
                        format!("missing environment variable {}", key),
                    )
                })
        };

        let server_url = read("SERVER_URL")?;
        let api_user = read("API_USER")?;
        let api_key = read("API_KEY")?;
        let name = read("SERVER_NAME").unwrap_or_else(|_| default_name.to_string());

        Ok(Self {
            name,
            server_url: server_url.trim_end_matches('/').to_string(),
            api_user,
            api_key,
        })
    }
}

/// Bootstrap configuration loaded from TOML
///
/// Every section is optional; absent keys fall back to compiled defaults.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TomlConfig {
    pub logging: LoggingConfig,
    pub retry: RetrySettings,
    pub sync: SyncSettings,
    pub shot_tasks: ShotTaskSettings,
    pub project_copy: ProjectCopySettings,
    pub supervisor: SupervisorSettings,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log file path (logs to stderr if not specified)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Retry-Fetch polling parameters
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub interval_ms: u64,
    pub multiplier: f64,
    pub max_interval_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            interval_ms: 1000,
            multiplier: 1.0,
            max_interval_ms: 10_000,
        }
    }
}

/// Cross-server synchronizer settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SyncSettings {
    pub enabled: bool,
    /// Case-insensitive substring a Task name must contain to be mirrored
    pub task_marker: String,
    /// Hub topics carrying entity-update notifications
    pub topics: Vec<String>,
    /// Bounded queue size between a hub and its dispatch loop
    pub channel_capacity: usize,
    pub origin_prefix: String,
    pub mirror_prefix: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            task_marker: "asset-request".to_string(),
            topics: vec!["ftrack.update".to_string()],
            channel_capacity: 256,
            origin_prefix: ORIGIN_PREFIX.to_string(),
            mirror_prefix: MIRROR_PREFIX.to_string(),
        }
    }
}

/// Shot task templating settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ShotTaskSettings {
    pub enabled: bool,
    /// Task names created under every new Shot, each resolved to a Type by name
    pub task_names: Vec<String>,
    pub default_status: String,
    pub default_priority: String,
    /// Environment prefix of the server this listener attaches to
    pub server_prefix: String,
}

impl Default for ShotTaskSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            task_names: vec![
                "Animation".to_string(),
                "Lighting".to_string(),
                "Compositing".to_string(),
            ],
            default_status: "Not Started".to_string(),
            default_priority: "None".to_string(),
            server_prefix: ORIGIN_PREFIX.to_string(),
        }
    }
}

/// Project copy action settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ProjectCopySettings {
    pub enabled: bool,
    pub server_prefix: String,
}

impl Default for ProjectCopySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            server_prefix: ORIGIN_PREFIX.to_string(),
        }
    }
}

/// Listener supervisor settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SupervisorSettings {
    /// How long to wait for listeners after a shutdown signal
    pub shutdown_grace_secs: u64,
    /// Restarts allowed after a listener crashes post-startup
    pub max_restarts: u32,
    pub restart_backoff_ms: u64,
    /// Bind address of the health endpoint
    pub health_addr: String,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            shutdown_grace_secs: 10,
            max_restarts: 3,
            restart_backoff_ms: 2000,
            health_addr: "127.0.0.1:5790".to_string(),
        }
    }
}

/// Resolve the bootstrap config path following the documented priority order
///
/// Returns `None` when no candidate exists on disk.
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Option<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    // Priority 3: Platform config directory
    dirs::config_dir()
        .map(|d| d.join("trackbridge").join("config.toml"))
        .filter(|p| p.exists())
}

/// Parse a TOML config file
pub fn read_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Invalid TOML in {}: {}", path.display(), e)))
}

/// Write a TOML config file (used to emit a starter config)
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

/// Load the bootstrap config, degrading to compiled defaults on any problem
pub fn load_config(cli_arg: Option<&Path>) -> TomlConfig {
    let Some(path) = resolve_config_path(cli_arg) else {
        info!("No config file found, using compiled defaults");
        return TomlConfig::default();
    };

    match read_toml_config(&path) {
        Ok(config) => {
            info!(path = %path.display(), "Loaded config file");
            config
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Config file unusable, using compiled defaults");
            TomlConfig::default()
        }
    }
}
