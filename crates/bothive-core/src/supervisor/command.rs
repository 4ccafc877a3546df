//! Supervisor driver for pm2-compatible process-manager CLIs.
//!
//! Drives the supervisor through three subcommands:
//!
//! - `jlist`: dump the process table as JSON
//! - `start <descriptor-file>`: submit a launch descriptor
//! - `delete <tag>`: remove a process by tag
//!
//! Every invocation runs with a bounded timeout and captured output. A
//! non-zero exit surfaces stderr (truncated) as the diagnostic; a `delete`
//! whose diagnostic says the process does not exist is success, because
//! teardown must be idempotent against at-least-once delivery.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::launch::LaunchDescriptor;

use super::{
    truncate_diagnostic, ProcessStatus, ProcessSupervisor, SupervisedProcess, SupervisorError,
};

/// Drives a pm2-style supervisor binary.
pub struct CommandSupervisor {
    program: String,
    timeout: Duration,
}

/// `jlist` row shape: the tag is the process name, the status lives under
/// the process environment object.
#[derive(Debug, Deserialize)]
struct JlistEntry {
    name: String,
    #[serde(default)]
    pm2_env: JlistEnv,
}

#[derive(Debug, Deserialize)]
struct JlistEnv {
    #[serde(default = "unknown_status")]
    status: ProcessStatus,
}

impl Default for JlistEnv {
    fn default() -> Self {
        Self {
            status: ProcessStatus::Unknown,
        }
    }
}

fn unknown_status() -> ProcessStatus {
    ProcessStatus::Unknown
}

impl CommandSupervisor {
    /// Create a driver for `program` with a per-invocation `timeout`.
    #[must_use]
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    /// Run one supervisor subcommand to completion under the timeout.
    async fn run(
        &self,
        operation: &'static str,
        args: &[&str],
    ) -> Result<std::process::Output, SupervisorError> {
        debug!(program = %self.program, ?args, "invoking supervisor");
        let child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        match timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => Ok(result?),
            Err(_elapsed) => Err(SupervisorError::Timeout {
                operation,
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }

    fn rejection(operation: &'static str, output: &std::process::Output) -> SupervisorError {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let raw = if stderr.trim().is_empty() { stdout } else { stderr };
        SupervisorError::Rejected {
            operation,
            diagnostic: truncate_diagnostic(&raw),
        }
    }
}

/// Delete diagnostics that mean "already gone" across pm2-style managers.
fn is_not_found_diagnostic(diagnostic: &str) -> bool {
    let lower = diagnostic.to_ascii_lowercase();
    lower.contains("not found")
        || lower.contains("doesn't exist")
        || lower.contains("does not exist")
        || lower.contains("no such process")
        || lower.contains("unknown process")
}

#[async_trait]
impl ProcessSupervisor for CommandSupervisor {
    async fn list(&self) -> Result<Vec<SupervisedProcess>, SupervisorError> {
        let output = self.run("list", &["jlist"]).await?;
        if !output.status.success() {
            return Err(Self::rejection("list", &output));
        }

        let entries: Vec<JlistEntry> =
            serde_json::from_slice(&output.stdout).map_err(|err| SupervisorError::Malformed {
                reason: err.to_string(),
            })?;

        Ok(entries
            .into_iter()
            .map(|entry| SupervisedProcess {
                tag: entry.name,
                status: entry.pm2_env.status,
            })
            .collect())
    }

    async fn submit(&self, descriptor: &LaunchDescriptor) -> Result<(), SupervisorError> {
        let artifact = descriptor.artifact_path.display().to_string();
        let output = self.run("submit", &["start", &artifact]).await?;
        if !output.status.success() {
            return Err(Self::rejection("submit", &output));
        }
        debug!(tag = %descriptor.tag, "supervisor acknowledged launch");
        Ok(())
    }

    async fn delete(&self, tag: &str) -> Result<(), SupervisorError> {
        let output = self.run("delete", &["delete", tag]).await?;
        if output.status.success() {
            return Ok(());
        }

        match Self::rejection("delete", &output) {
            SupervisorError::Rejected { diagnostic, .. }
                if is_not_found_diagnostic(&diagnostic) =>
            {
                debug!(tag, "delete of unknown tag treated as success");
                Ok(())
            }
            err => Err(err),
        }
    }
}
