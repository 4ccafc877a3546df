//! Idempotent teardown of bot instances.
//!
//! Teardown reclaims everything a spawn acquired: the supervised process,
//! the registry record's active status, the port reservation, the launch
//! artifacts, and the cache entry. The steps are independently best-effort:
//! a supervisor that is down must not prevent the port from being released,
//! and vice versa. Partial failures are aggregated into a
//! [`TeardownReport`] rather than thrown; leaving a stale artifact behind
//! is preferable to refusing a user's stop request.
//!
//! Calling teardown on an already-torn-down (or never-seen) instance id is
//! a no-op success; every step tolerates absence.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::instance::{port_from_tag, InstanceStatus};
use crate::launch::{descriptor_path, log_paths, remove_if_present};
use crate::lifecycle::LifecycleTracker;
use crate::port::PortAllocator;
use crate::registry::InstanceRegistry;
use crate::supervisor::ProcessSupervisor;

/// One reclamation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownStep {
    /// Delete the supervised process by tag.
    SupervisorDelete,
    /// Mark the registry record stopped.
    RegistryMarkStopped,
    /// Release the in-process port reservation.
    PortRelease,
    /// Remove the descriptor and log files.
    ArtifactRemoval,
}

impl TeardownStep {
    /// Returns the step name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SupervisorDelete => "supervisor_delete",
            Self::RegistryMarkStopped => "registry_mark_stopped",
            Self::PortRelease => "port_release",
            Self::ArtifactRemoval => "artifact_removal",
        }
    }
}

/// Outcome of one step for one instance.
#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    /// The instance the step applied to.
    pub instance_id: String,
    /// Which step ran.
    pub step: TeardownStep,
    /// `None` on success; the failure description otherwise.
    pub warning: Option<String>,
}

/// Aggregated result of a teardown request.
#[derive(Debug, Clone, Serialize)]
pub struct TeardownReport {
    /// What was torn down: an instance id, or an identity for bulk
    /// cleanups.
    pub subject: String,
    /// Per-step outcomes, in execution order.
    pub outcomes: Vec<StepOutcome>,
}

impl TeardownReport {
    /// A report with no outcomes yet.
    #[must_use]
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            outcomes: Vec::new(),
        }
    }

    /// Whether every step succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.outcomes.iter().all(|outcome| outcome.warning.is_none())
    }

    /// The warnings collected across all steps.
    pub fn warnings(&self) -> impl Iterator<Item = &StepOutcome> {
        self.outcomes.iter().filter(|o| o.warning.is_some())
    }

    /// Fold another report's outcomes into this one.
    pub fn absorb(&mut self, other: TeardownReport) {
        self.outcomes.extend(other.outcomes);
    }

    fn push(&mut self, instance_id: &str, step: TeardownStep, warning: Option<String>) {
        if let Some(reason) = &warning {
            warn!(instance_id, step = step.as_str(), reason, "teardown step failed");
        }
        self.outcomes.push(StepOutcome {
            instance_id: instance_id.to_string(),
            step,
            warning,
        });
    }
}

/// Coordinates the reclamation steps across the orchestrator's resources.
pub struct TeardownCoordinator {
    supervisor: Arc<dyn ProcessSupervisor>,
    registry: Arc<dyn InstanceRegistry>,
    allocator: Arc<PortAllocator>,
    tracker: Arc<LifecycleTracker>,
    artifact_dir: PathBuf,
    log_dir: PathBuf,
}

impl TeardownCoordinator {
    /// Create a coordinator over the orchestrator's shared resources.
    #[must_use]
    pub fn new(
        supervisor: Arc<dyn ProcessSupervisor>,
        registry: Arc<dyn InstanceRegistry>,
        allocator: Arc<PortAllocator>,
        tracker: Arc<LifecycleTracker>,
        artifact_dir: PathBuf,
        log_dir: PathBuf,
    ) -> Self {
        Self {
            supervisor,
            registry,
            allocator,
            tracker,
            artifact_dir,
            log_dir,
        }
    }

    /// Tear down one instance by id. Idempotent; never fails outright.
    pub async fn teardown(&self, instance_id: &str) -> TeardownReport {
        info!(instance_id, "tearing down instance");
        let mut report = TeardownReport::new(instance_id);

        // Supervisor delete first: stop the process before reclaiming the
        // resources it uses. Unknown tags are success by contract.
        let warning = self
            .supervisor
            .delete(instance_id)
            .await
            .err()
            .map(|err| err.to_string());
        report.push(instance_id, TeardownStep::SupervisorDelete, warning);

        let warning = self
            .registry
            .mark_stopped(instance_id)
            .err()
            .map(|err| err.to_string());
        report.push(instance_id, TeardownStep::RegistryMarkStopped, warning);

        let warning = match self.resolve_port(instance_id) {
            Some(port) => {
                self.allocator.release(port);
                None
            }
            None => Some("could not determine port; nothing released".to_string()),
        };
        report.push(instance_id, TeardownStep::PortRelease, warning);

        let warning = self.remove_artifacts(instance_id).err();
        report.push(instance_id, TeardownStep::ArtifactRemoval, warning);

        // Cache last: once the record is gone we lose the port lookup above.
        if self.tracker.get(instance_id).is_some() {
            // Active records move to stopped first; terminal ones are left
            // as-is. Either way the record leaves the cache.
            let _ = self.tracker.transition(instance_id, InstanceStatus::Stopped);
            self.tracker.evict(instance_id);
        }

        report
    }

    /// Port for an instance, preferring live state over tag parsing.
    fn resolve_port(&self, instance_id: &str) -> Option<u16> {
        if let Some(instance) = self.tracker.get(instance_id) {
            return Some(instance.api_port);
        }
        if let Ok(Some(record)) = self.registry.find_by_instance(instance_id) {
            return Some(record.api_port);
        }
        port_from_tag(instance_id)
    }

    fn remove_artifacts(&self, instance_id: &str) -> Result<(), String> {
        let descriptor = descriptor_path(&self.artifact_dir, instance_id);
        let (log_out, log_err) = log_paths(&self.log_dir, instance_id);

        let mut failures = Vec::new();
        for path in [descriptor, log_out, log_err] {
            if let Err(err) = remove_if_present(&path) {
                failures.push(format!("{}: {err}", path.display()));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures.join("; "))
        }
    }
}
