//! Spawn-path error taxonomy.
//!
//! Everything a caller can see from a failed spawn. Read-path failures in
//! the duplicate guard are deliberately absent: those degrade to "no
//! conflict found from this source" and are logged, never surfaced.

use thiserror::Error;

use crate::guard::ActiveInstance;
use crate::lifecycle::LifecycleError;

/// Errors returned by [`Orchestrator::spawn`](crate::Orchestrator::spawn).
///
/// `Validation`, `Conflict`, and `NoCapacity` are rejected before any side
/// effect survives the call. `LaunchFailed` is returned only after the
/// partial reservation has been rolled back.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SpawnError {
    /// The request was malformed; nothing was reserved.
    #[error("invalid spawn request: {reason}")]
    Validation {
        /// Human-readable rejection reason.
        reason: String,
    },

    /// An active instance already exists for this identity.
    ///
    /// Carries the existing instance's connection info so callers can treat
    /// spawn as idempotent "ensure running".
    #[error("active instance already exists: {}", existing.instance_id)]
    Conflict {
        /// The conflicting instance, as seen by the duplicate guard.
        existing: ActiveInstance,
    },

    /// Every port in the configured range is bound or reserved.
    #[error("no free API ports in {min_port}-{max_port}")]
    NoCapacity {
        /// Low end of the scanned range (inclusive).
        min_port: u16,
        /// High end of the scanned range (inclusive).
        max_port: u16,
    },

    /// The process supervisor rejected the launch submission.
    ///
    /// The port reservation and any registry record have been rolled back.
    #[error("launch failed: {diagnostic}")]
    LaunchFailed {
        /// Supervisor diagnostic output, truncated to a bounded length.
        diagnostic: String,
    },

    /// Internal state-machine inconsistency. Indicates a bug rather than a
    /// caller mistake; the spawn is rolled back like a launch failure.
    #[error("internal lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),
}
