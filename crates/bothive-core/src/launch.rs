//! Spawn-request validation and launch descriptor construction.
//!
//! A [`SpawnRequest`] is validated before any side effect: identity and
//! credential format checks happen here, and a rejection at this stage
//! leaves no trace in the allocator, cache, registry, or supervisor.
//!
//! The [`LaunchDescriptor`] is the fully-resolved value handed to the
//! process supervisor: command, arguments, environment, working directory,
//! per-instance log paths, and restart policy. It serializes to a
//! supervisor ecosystem file under the artifact directory; that file is the
//! persisted launch artifact removed again at teardown.
//!
//! The credential travels as a [`SecretString`] and is exposed exactly once,
//! while the environment map is assembled. It never appears in logs or in
//! `Debug` output of the descriptor.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

use crate::config::OrchestratorConfig;
use crate::error::SpawnError;
use crate::instance::{BotInstance, Network};

/// Identity: leading alphanumeric, then alphanumerics plus `._-`, 4 to 128
/// characters total. Wallet addresses in both hex and base58 form fit.
const IDENTITY_PATTERN: &str = r"^[A-Za-z0-9][A-Za-z0-9._-]{3,127}$";

/// Credential: 64 hex characters, optional `0x` prefix (a 32-byte key).
const SECRET_PATTERN: &str = r"^(0x)?[0-9a-fA-F]{64}$";

/// Pass-through parameter keys must look like environment variable names.
const PARAM_KEY_PATTERN: &str = r"^[A-Z][A-Z0-9_]{0,63}$";

fn identity_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(IDENTITY_PATTERN).expect("static pattern compiles"))
}

fn secret_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(SECRET_PATTERN).expect("static pattern compiles"))
}

fn param_key_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(PARAM_KEY_PATTERN).expect("static pattern compiles"))
}

/// A caller's request to spawn one bot instance.
pub struct SpawnRequest {
    /// Owner identity (opaque; a wallet address in this deployment).
    pub identity: String,
    /// Credential handed to the launched process. Never inspected beyond
    /// format validation, never logged.
    pub secret_material: SecretString,
    /// Deployment target, passed through to the process.
    pub network: Network,
    /// Additional trading parameters passed through as environment
    /// variables. Keys must be env-var shaped.
    pub params: BTreeMap<String, String>,
}

impl fmt::Debug for SpawnRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnRequest")
            .field("identity", &self.identity)
            .field("secret_material", &"[REDACTED]")
            .field("network", &self.network)
            .field("params", &self.params.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SpawnRequest {
    /// Create a request with no extra parameters.
    #[must_use]
    pub fn new(identity: impl Into<String>, secret_material: SecretString, network: Network) -> Self {
        Self {
            identity: identity.into(),
            secret_material,
            network,
            params: BTreeMap::new(),
        }
    }

    /// Validate identity, credential, and parameter formats.
    ///
    /// Rejection reasons never echo the credential back.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError::Validation`] on the first malformed field.
    pub fn validate(&self) -> Result<(), SpawnError> {
        if !identity_regex().is_match(&self.identity) {
            return Err(SpawnError::Validation {
                reason: format!(
                    "identity must match {IDENTITY_PATTERN}, got {:?}",
                    self.identity
                ),
            });
        }
        if !secret_regex().is_match(self.secret_material.expose_secret()) {
            return Err(SpawnError::Validation {
                reason: "secret material must be 64 hex characters (optional 0x prefix)"
                    .to_string(),
            });
        }
        for key in self.params.keys() {
            if !param_key_regex().is_match(key) {
                return Err(SpawnError::Validation {
                    reason: format!("parameter key {key:?} is not env-var shaped"),
                });
            }
        }
        Ok(())
    }
}

/// Restart behavior requested from the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestartPolicy {
    /// Whether the supervisor restarts the process when it exits.
    pub autorestart: bool,
    /// Restart budget before the supervisor gives up.
    pub max_restarts: u32,
    /// Delay between restarts, milliseconds.
    pub restart_delay_ms: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            autorestart: true,
            max_restarts: 10,
            restart_delay_ms: 5_000,
        }
    }
}

/// Fully-resolved process description submitted to the supervisor.
///
/// The environment contains the exposed credential; `Debug` redacts the
/// whole map rather than trying to guess which keys are sensitive.
#[derive(Clone)]
pub struct LaunchDescriptor {
    /// Supervisor process tag (= instance id).
    pub tag: String,
    /// Command the bot process runs.
    pub command: String,
    /// Arguments to the command.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: PathBuf,
    /// Process environment, credential included.
    pub env: BTreeMap<String, String>,
    /// Stdout log path, namespaced by instance id.
    pub log_out: PathBuf,
    /// Stderr log path, namespaced by instance id.
    pub log_err: PathBuf,
    /// Restart policy.
    pub restart: RestartPolicy,
    /// Where the serialized descriptor file lives.
    pub artifact_path: PathBuf,
}

impl fmt::Debug for LaunchDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchDescriptor")
            .field("tag", &self.tag)
            .field("command", &self.command)
            .field("args", &self.args)
            .field("cwd", &self.cwd)
            .field("env", &"[REDACTED]")
            .field("log_out", &self.log_out)
            .field("log_err", &self.log_err)
            .field("restart", &self.restart)
            .field("artifact_path", &self.artifact_path)
            .finish()
    }
}

/// Descriptor file path for an instance.
#[must_use]
pub fn descriptor_path(artifact_dir: &Path, instance_id: &str) -> PathBuf {
    artifact_dir.join(format!("{instance_id}.json"))
}

/// Log file paths for an instance: `(stdout, stderr)`.
#[must_use]
pub fn log_paths(log_dir: &Path, instance_id: &str) -> (PathBuf, PathBuf) {
    (
        log_dir.join(format!("{instance_id}.out.log")),
        log_dir.join(format!("{instance_id}.err.log")),
    )
}

impl LaunchDescriptor {
    /// Build the descriptor for a validated request and its assigned
    /// instance.
    #[must_use]
    pub fn build(
        config: &OrchestratorConfig,
        request: &SpawnRequest,
        instance: &BotInstance,
    ) -> Self {
        let (log_out, log_err) = log_paths(&config.log_dir, &instance.instance_id);

        let mut env = BTreeMap::new();
        env.insert("BOT_IDENTITY".to_string(), instance.identity.clone());
        env.insert("BOT_API_PORT".to_string(), instance.api_port.to_string());
        env.insert("BOT_NETWORK".to_string(), instance.network.to_string());
        env.insert(
            "BOT_PRIVATE_KEY".to_string(),
            request.secret_material.expose_secret().to_string(),
        );
        for (key, value) in &request.params {
            env.insert(key.clone(), value.clone());
        }

        Self {
            tag: instance.instance_id.clone(),
            command: config.bot_command.clone(),
            args: vec![
                "--port".to_string(),
                instance.api_port.to_string(),
                "--network".to_string(),
                instance.network.to_string(),
            ],
            cwd: config.bot_workdir.clone(),
            env,
            log_out,
            log_err,
            restart: RestartPolicy::default(),
            artifact_path: descriptor_path(&config.artifact_dir, &instance.instance_id),
        }
    }

    /// Serialize to the supervisor's ecosystem-file format.
    #[must_use]
    pub fn to_ecosystem_json(&self) -> serde_json::Value {
        serde_json::json!({
            "apps": [{
                "name": self.tag,
                "script": self.command,
                "args": self.args,
                "cwd": self.cwd,
                "env": self.env,
                "autorestart": self.restart.autorestart,
                "max_restarts": self.restart.max_restarts,
                "restart_delay": self.restart.restart_delay_ms,
                "out_file": self.log_out,
                "error_file": self.log_err,
            }]
        })
    }

    /// Write the descriptor file, creating the artifact directory if
    /// needed. The file carries the credential, so it is created
    /// owner-readable only.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be written.
    pub fn write_artifact(&self) -> std::io::Result<()> {
        if let Some(parent) = self.artifact_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_vec_pretty(&self.to_ecosystem_json())?;
        write_private(&self.artifact_path, &content)
    }

    /// Remove the descriptor file. Missing files are success.
    ///
    /// # Errors
    ///
    /// Returns an error for any failure other than the file being absent.
    pub fn remove_artifact(&self) -> std::io::Result<()> {
        remove_if_present(&self.artifact_path)
    }
}

/// Remove a file, treating "already gone" as success.
///
/// # Errors
///
/// Returns an error for any failure other than `NotFound`.
pub fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(unix)]
fn write_private(path: &Path, content: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(content)
}

#[cfg(not(unix))]
fn write_private(path: &Path, content: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, content)
}

/// Minimal descriptor for exercising supervisor drivers in tests.
#[cfg(test)]
pub(crate) fn test_descriptor(tag: &str) -> LaunchDescriptor {
    LaunchDescriptor {
        tag: tag.to_string(),
        command: "true".to_string(),
        args: Vec::new(),
        cwd: PathBuf::from("."),
        env: BTreeMap::new(),
        log_out: PathBuf::from("/tmp/test.out.log"),
        log_err: PathBuf::from("/tmp/test.err.log"),
        restart: RestartPolicy::default(),
        artifact_path: PathBuf::from("/tmp/test-descriptor.json"),
    }
}
