//! Process supervisor capability interface.
//!
//! The orchestrator never owns bot processes; an external supervisor (a
//! process manager, container runtime, or systemd-alike) does. This module
//! defines the narrow capability the orchestrator needs from it (list,
//! submit, delete) so the concrete supervisor can be swapped without
//! touching orchestrator logic. All operations are treated as at-least-once
//! and idempotent: deleting a tag that is already gone is success.

pub mod command;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::launch::LaunchDescriptor;

pub use command::CommandSupervisor;

/// Maximum bytes of supervisor diagnostic output carried into errors.
pub const MAX_DIAGNOSTIC_LEN: usize = 2048;

/// Status of a supervised process as reported by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    /// Process is up.
    Online,
    /// Process is being started.
    Launching,
    /// Process is being stopped.
    Stopping,
    /// Process exists but is not running.
    Stopped,
    /// Process crashed or exceeded its restart budget.
    Errored,
    /// Any status string this client does not recognize.
    #[serde(other)]
    Unknown,
}

impl ProcessStatus {
    /// Whether the supervisor considers the process live.
    #[must_use]
    pub const fn is_online(&self) -> bool {
        matches!(self, Self::Online)
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Online => "online",
            Self::Launching => "launching",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Errored => "errored",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// One row of the supervisor's live process table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisedProcess {
    /// Process tag; for bot instances this is the instance id.
    pub tag: String,
    /// Reported status.
    pub status: ProcessStatus,
}

/// Errors from supervisor operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SupervisorError {
    /// The supervisor binary could not be invoked.
    #[error("failed to invoke supervisor: {0}")]
    Invoke(#[from] std::io::Error),

    /// The invocation exceeded its bounded timeout.
    #[error("supervisor {operation} timed out after {timeout_ms} ms")]
    Timeout {
        /// Which operation timed out.
        operation: &'static str,
        /// The configured bound.
        timeout_ms: u64,
    },

    /// The supervisor exited non-zero.
    #[error("supervisor rejected {operation}: {diagnostic}")]
    Rejected {
        /// Which operation was rejected.
        operation: &'static str,
        /// Diagnostic output, truncated to [`MAX_DIAGNOSTIC_LEN`].
        diagnostic: String,
    },

    /// The supervisor's output could not be parsed.
    #[error("unparseable supervisor output: {reason}")]
    Malformed {
        /// Why parsing failed.
        reason: String,
    },
}

/// Capability for driving the external process supervisor.
///
/// Every call must be bounded by a timeout; hangs in the supervisor must
/// never hang the orchestrator.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// The supervisor's live process table.
    ///
    /// # Errors
    ///
    /// Returns an error if the supervisor cannot be reached or its output
    /// cannot be parsed.
    async fn list(&self) -> Result<Vec<SupervisedProcess>, SupervisorError>;

    /// Submit a launch descriptor. Blocks on the supervisor's
    /// acknowledgment of the submission, not on the spawned process
    /// reaching steady state.
    ///
    /// # Errors
    ///
    /// Returns an error on rejection, timeout, or invocation failure.
    async fn submit(&self, descriptor: &LaunchDescriptor) -> Result<(), SupervisorError>;

    /// Delete the process with the given tag. Deleting an unknown tag is
    /// success.
    ///
    /// # Errors
    ///
    /// Returns an error on timeout, invocation failure, or a rejection
    /// other than "no such process".
    async fn delete(&self, tag: &str) -> Result<(), SupervisorError>;
}

/// Truncate diagnostic output to [`MAX_DIAGNOSTIC_LEN`] bytes on a char
/// boundary.
#[must_use]
pub fn truncate_diagnostic(raw: &str) -> String {
    if raw.len() <= MAX_DIAGNOSTIC_LEN {
        return raw.trim_end().to_string();
    }
    let mut cut = MAX_DIAGNOSTIC_LEN;
    while !raw.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}… ({} bytes truncated)", &raw[..cut], raw.len() - cut)
}
