//! Instance lifecycle tracking.
//!
//! The tracker owns the orchestrator's in-memory view of its instances and
//! enforces the status state machine (see [`crate::instance`]). It is the
//! third, lowest-priority source consulted by the duplicate guard: cheap and
//! always current for this process, worthless across restarts.
//!
//! Heartbeat staleness never mutates a tracked record. It only demotes the
//! *effective* status reported to callers, so a transient monitoring gap
//! cannot trigger a spurious respawn while the registry check still ignores
//! the stale row.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::info;

use crate::instance::{BotInstance, InstanceStatus};

/// Errors from lifecycle state changes.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LifecycleError {
    /// The state machine forbids this transition.
    #[error("invalid transition for {instance_id}: {from} -> {to}")]
    InvalidTransition {
        /// The instance whose transition was rejected.
        instance_id: String,
        /// Current status.
        from: InstanceStatus,
        /// Requested status.
        to: InstanceStatus,
    },

    /// No tracked instance with this id.
    #[error("instance not tracked: {instance_id}")]
    UnknownInstance {
        /// The id that was not found.
        instance_id: String,
    },

    /// An active instance with this id is already tracked.
    #[error("instance already tracked: {instance_id}")]
    AlreadyTracked {
        /// The duplicate id.
        instance_id: String,
    },
}

/// In-memory instance cache with state-machine enforcement.
#[derive(Default)]
pub struct LifecycleTracker {
    instances: RwLock<HashMap<String, BotInstance>>,
}

impl LifecycleTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, BotInstance>> {
        self.instances.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, BotInstance>> {
        self.instances
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Begin tracking a freshly-created instance in `Starting` state.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyTracked` if an instance with the same id is present
    /// and not terminal.
    pub fn track_starting(&self, instance: BotInstance) -> Result<(), LifecycleError> {
        let mut instances = self.write();
        if let Some(existing) = instances.get(&instance.instance_id) {
            if !existing.status.is_terminal() {
                return Err(LifecycleError::AlreadyTracked {
                    instance_id: instance.instance_id.clone(),
                });
            }
        }
        info!(
            instance_id = %instance.instance_id,
            identity = %instance.identity,
            api_port = instance.api_port,
            "tracking instance"
        );
        instances.insert(instance.instance_id.clone(), instance);
        Ok(())
    }

    /// Move a tracked instance to `to`, enforcing the transition table.
    /// Returns the updated record.
    ///
    /// # Errors
    ///
    /// Returns `UnknownInstance` for untracked ids and `InvalidTransition`
    /// when the state machine forbids the move.
    pub fn transition(
        &self,
        instance_id: &str,
        to: InstanceStatus,
    ) -> Result<BotInstance, LifecycleError> {
        let mut instances = self.write();
        let instance =
            instances
                .get_mut(instance_id)
                .ok_or_else(|| LifecycleError::UnknownInstance {
                    instance_id: instance_id.to_string(),
                })?;

        if !instance.status.can_transition_to(to) {
            return Err(LifecycleError::InvalidTransition {
                instance_id: instance_id.to_string(),
                from: instance.status,
                to,
            });
        }

        info!(instance_id, from = %instance.status, to = %to, "instance transition");
        instance.status = to;
        Ok(instance.clone())
    }

    /// Record a liveness signal for a tracked instance. Untracked ids are
    /// ignored (the registry is the durable home of heartbeats).
    pub fn observe_heartbeat(&self, instance_id: &str, at: DateTime<Utc>) {
        if let Some(instance) = self.write().get_mut(instance_id) {
            instance.last_heartbeat = Some(at);
        }
    }

    /// Stop tracking an instance, returning the final record if present.
    pub fn evict(&self, instance_id: &str) -> Option<BotInstance> {
        let removed = self.write().remove(instance_id);
        if removed.is_some() {
            info!(instance_id, "evicted instance from cache");
        }
        removed
    }

    /// Fetch a tracked instance by id.
    #[must_use]
    pub fn get(&self, instance_id: &str) -> Option<BotInstance> {
        self.read().get(instance_id).cloned()
    }

    /// The active (`starting` or `running`) instance for an identity, if
    /// this process is tracking one.
    #[must_use]
    pub fn find_active(&self, identity: &str) -> Option<BotInstance> {
        self.read()
            .values()
            .find(|instance| instance.identity == identity && instance.status.is_active())
            .cloned()
    }

    /// All tracked instances, optionally filtered by identity.
    #[must_use]
    pub fn list(&self, identity: Option<&str>) -> Vec<BotInstance> {
        self.read()
            .values()
            .filter(|instance| identity.map_or(true, |id| instance.identity == id))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::instance::Network;

    use super::*;

    fn tracker_with(identity: &str, port: u16) -> (LifecycleTracker, String) {
        let tracker = LifecycleTracker::new();
        let instance = BotInstance::new(identity, port, Network::Testnet);
        let id = instance.instance_id.clone();
        tracker.track_starting(instance).unwrap();
        (tracker, id)
    }

    #[test]
    fn test_track_transition_evict() {
        let (tracker, id) = tracker_with("0xabc123def", 8101);

        let running = tracker.transition(&id, InstanceStatus::Running).unwrap();
        assert_eq!(running.status, InstanceStatus::Running);

        let stopped = tracker.transition(&id, InstanceStatus::Stopped).unwrap();
        assert_eq!(stopped.status, InstanceStatus::Stopped);

        assert!(tracker.evict(&id).is_some());
        assert!(tracker.evict(&id).is_none());
        assert!(tracker.get(&id).is_none());
    }

    #[test]
    fn test_terminal_states_reject_transitions() {
        let (tracker, id) = tracker_with("0xabc123def", 8101);
        tracker.transition(&id, InstanceStatus::Error).unwrap();

        let err = tracker.transition(&id, InstanceStatus::Running).unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidTransition { .. }));
    }

    #[test]
    fn test_unknown_instance_errors() {
        let tracker = LifecycleTracker::new();
        let err = tracker
            .transition("bot-none-1", InstanceStatus::Running)
            .unwrap_err();
        assert!(matches!(err, LifecycleError::UnknownInstance { .. }));
    }

    #[test]
    fn test_duplicate_active_tracking_rejected() {
        let (tracker, _id) = tracker_with("0xabc123def", 8101);
        let dup = BotInstance::new("0xabc123def", 8101, Network::Testnet);
        let err = tracker.track_starting(dup).unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyTracked { .. }));
    }

    #[test]
    fn test_terminal_record_can_be_replaced() {
        let (tracker, id) = tracker_with("0xabc123def", 8101);
        tracker.transition(&id, InstanceStatus::Error).unwrap();

        // Same id again after the old record went terminal: allowed. The
        // orchestrator evicts on teardown, but a crashed teardown must not
        // wedge the identity forever.
        let replacement = BotInstance::new("0xabc123def", 8101, Network::Testnet);
        tracker.track_starting(replacement).unwrap();
        assert_eq!(tracker.get(&id).unwrap().status, InstanceStatus::Starting);
    }

    #[test]
    fn test_find_active_ignores_terminal() {
        let (tracker, id) = tracker_with("0xabc123def", 8101);
        assert!(tracker.find_active("0xabc123def").is_some());
        assert!(tracker.find_active("0xother000").is_none());

        tracker.transition(&id, InstanceStatus::Error).unwrap();
        assert!(tracker.find_active("0xabc123def").is_none());
    }

    #[test]
    fn test_heartbeat_observation() {
        let (tracker, id) = tracker_with("0xabc123def", 8101);
        assert!(tracker.get(&id).unwrap().last_heartbeat.is_none());

        let at = Utc::now();
        tracker.observe_heartbeat(&id, at);
        assert_eq!(tracker.get(&id).unwrap().last_heartbeat, Some(at));

        // Untracked ids are ignored silently.
        tracker.observe_heartbeat("bot-none-1", at);
    }

    #[test]
    fn test_list_filtering() {
        let tracker = LifecycleTracker::new();
        tracker
            .track_starting(BotInstance::new("0xaaaa1111", 8101, Network::Testnet))
            .unwrap();
        tracker
            .track_starting(BotInstance::new("0xbbbb2222", 8102, Network::Testnet))
            .unwrap();

        assert_eq!(tracker.list(None).len(), 2);
        assert_eq!(tracker.list(Some("0xaaaa1111")).len(), 1);
        assert!(tracker.list(Some("0xcccc3333")).is_empty());
    }
}
