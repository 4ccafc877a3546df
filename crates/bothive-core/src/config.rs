//! Orchestrator configuration parsing and validation.
//!
//! Configuration is loaded from a TOML file. Every deployment constant the
//! orchestrator depends on (port range, heartbeat staleness window,
//! supervisor invocation, artifact paths) lives here rather than in code,
//! so that tests and alternate deployments can override them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse the TOML content.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The parsed configuration is internally inconsistent.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Lowest API port handed to spawned instances (inclusive).
    #[serde(default = "default_min_port")]
    pub min_port: u16,

    /// Highest API port handed to spawned instances (inclusive).
    #[serde(default = "default_max_port")]
    pub max_port: u16,

    /// Maximum age of a registry heartbeat before a `running` record is
    /// treated as stale. Stale records are reported as `offline` and do not
    /// block new spawns for the same identity.
    #[serde(default = "default_heartbeat_window_secs")]
    pub heartbeat_window_secs: u64,

    /// Process supervisor invocation settings.
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Command executed inside each spawned instance.
    #[serde(default = "default_bot_command")]
    pub bot_command: String,

    /// Working directory for spawned instances.
    #[serde(default = "default_bot_workdir")]
    pub bot_workdir: PathBuf,

    /// Directory holding per-instance launch descriptor files.
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,

    /// Directory holding per-instance log files.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Path to the `SQLite` instance registry.
    #[serde(default = "default_registry_path")]
    pub registry_path: PathBuf,
}

/// Settings for driving the external process supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Supervisor binary invoked for `jlist`/`start`/`delete`.
    #[serde(default = "default_supervisor_program")]
    pub program: String,

    /// Upper bound on any single supervisor invocation.
    #[serde(default = "default_supervisor_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            program: default_supervisor_program(),
            timeout_ms: default_supervisor_timeout_ms(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            min_port: default_min_port(),
            max_port: default_max_port(),
            heartbeat_window_secs: default_heartbeat_window_secs(),
            supervisor: SupervisorConfig::default(),
            bot_command: default_bot_command(),
            bot_workdir: default_bot_workdir(),
            artifact_dir: default_artifact_dir(),
            log_dir: default_log_dir(),
            registry_path: default_registry_path(),
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from a TOML file and validate it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails
    /// validation.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or the resulting
    /// configuration fails [`validate`](Self::validate).
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate internal consistency.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` if the port range is inverted, the
    /// heartbeat window is zero, or the supervisor program is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_port > self.max_port {
            return Err(ConfigError::Validation(format!(
                "port range is inverted: min_port={} > max_port={}",
                self.min_port, self.max_port
            )));
        }
        if self.heartbeat_window_secs == 0 {
            return Err(ConfigError::Validation(
                "heartbeat_window_secs must be non-zero".to_string(),
            ));
        }
        if self.supervisor.program.trim().is_empty() {
            return Err(ConfigError::Validation(
                "supervisor.program must not be empty".to_string(),
            ));
        }
        if self.bot_command.trim().is_empty() {
            return Err(ConfigError::Validation(
                "bot_command must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// The heartbeat staleness window as a `chrono` duration.
    #[must_use]
    pub fn heartbeat_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.heartbeat_window_secs.min(i64::MAX as u64) as i64)
    }

    /// The supervisor invocation timeout.
    #[must_use]
    pub const fn supervisor_timeout(&self) -> Duration {
        Duration::from_millis(self.supervisor.timeout_ms)
    }

    /// Number of ports in the allocatable range.
    #[must_use]
    pub const fn port_capacity(&self) -> u32 {
        self.max_port as u32 - self.min_port as u32 + 1
    }
}

fn default_min_port() -> u16 {
    8100
}

fn default_max_port() -> u16 {
    8200
}

fn default_heartbeat_window_secs() -> u64 {
    120
}

fn default_supervisor_program() -> String {
    "pm2".to_string()
}

fn default_supervisor_timeout_ms() -> u64 {
    15_000
}

fn default_bot_command() -> String {
    "bothive-runner".to_string()
}

fn default_bot_workdir() -> PathBuf {
    PathBuf::from("/var/lib/bothive/work")
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from("/var/lib/bothive/instances")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/bothive")
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("/var/lib/bothive/registry.db")
}
