//! Three-source duplicate detection.
//!
//! Before any spawn, the guard asks "does an active instance already exist
//! for this identity?" against three independently-consistent sources, in
//! priority order, first match winning:
//!
//! 1. the supervisor's live process table: ground truth, and the fastest to go
//!    stale in our favor (a dead process disappears from it);
//! 2. the persistent registry: survives orchestrator restarts, but only a
//!    `running` record with a fresh heartbeat counts;
//! 3. the in-process cache: last resort, only meaningful within this
//!    process's uptime.
//!
//! Reads are best-effort: a source that fails or times out degrades to "no
//! conflict found from this source" with a warning. A flaky registry must
//! never block spawning; the remaining sources still protect the
//! at-most-one-active invariant to the extent they can see.

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use crate::instance::{port_from_tag, tag_stem};
use crate::lifecycle::LifecycleTracker;
use crate::registry::InstanceRegistry;
use crate::supervisor::ProcessSupervisor;

/// Which source produced a duplicate verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardSource {
    /// Supervisor live process table.
    Supervisor,
    /// Persistent registry with a fresh heartbeat.
    Registry,
    /// In-process cache.
    Cache,
}

/// The existing active instance a spawn conflicts with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveInstance {
    /// Instance id / supervisor tag of the existing instance.
    pub instance_id: String,
    /// Owning identity.
    pub identity: String,
    /// API port, when the source knows it.
    pub api_port: Option<u16>,
    /// Which source reported it.
    pub source: GuardSource,
}

/// Duplicate guard over the three sources.
pub struct DuplicateGuard {
    heartbeat_window: chrono::Duration,
}

impl DuplicateGuard {
    /// Create a guard with the given heartbeat staleness window.
    #[must_use]
    pub const fn new(heartbeat_window: chrono::Duration) -> Self {
        Self { heartbeat_window }
    }

    /// Find the active instance for `identity`, if any source sees one.
    ///
    /// Sources are consulted in priority order and the first match
    /// short-circuits the rest.
    pub async fn find_active(
        &self,
        identity: &str,
        supervisor: &dyn ProcessSupervisor,
        registry: &dyn InstanceRegistry,
        tracker: &LifecycleTracker,
    ) -> Option<ActiveInstance> {
        if let Some(found) = self.check_supervisor(identity, supervisor).await {
            return Some(found);
        }
        if let Some(found) = self.check_registry(identity, registry) {
            return Some(found);
        }
        self.check_cache(identity, tracker)
    }

    /// Source 1: a supervisor process tagged for this identity and
    /// reported online.
    async fn check_supervisor(
        &self,
        identity: &str,
        supervisor: &dyn ProcessSupervisor,
    ) -> Option<ActiveInstance> {
        let table = match supervisor.list().await {
            Ok(table) => table,
            Err(err) => {
                warn!(identity, %err, "supervisor table unavailable, degrading");
                return None;
            }
        };

        let prefix = format!("{}-", tag_stem(identity));
        let found = table
            .iter()
            .find(|process| process.tag.starts_with(&prefix) && process.status.is_online())?;

        debug!(identity, tag = %found.tag, "duplicate found in supervisor table");
        Some(ActiveInstance {
            instance_id: found.tag.clone(),
            identity: identity.to_string(),
            api_port: port_from_tag(&found.tag),
            source: GuardSource::Supervisor,
        })
    }

    /// Source 2: a registry record that is `running` *and* heartbeat-fresh.
    /// Stale rows are ignored here; cleanup reclaims them separately.
    fn check_registry(
        &self,
        identity: &str,
        registry: &dyn InstanceRegistry,
    ) -> Option<ActiveInstance> {
        let records = match registry.list(Some(identity)) {
            Ok(records) => records,
            Err(err) => {
                warn!(identity, %err, "registry unavailable, degrading");
                return None;
            }
        };

        let now = Utc::now();
        let found = records.into_iter().find(|record| {
            record.status == crate::instance::InstanceStatus::Running
                && record.to_instance().heartbeat_fresh(self.heartbeat_window, now)
        })?;

        debug!(identity, instance_id = %found.instance_id, "duplicate found in registry");
        Some(ActiveInstance {
            instance_id: found.instance_id,
            identity: identity.to_string(),
            api_port: Some(found.api_port),
            source: GuardSource::Registry,
        })
    }

    /// Source 3: an active record in this process's cache. `Starting`
    /// counts here: an in-flight launch holds its identity exclusively.
    fn check_cache(&self, identity: &str, tracker: &LifecycleTracker) -> Option<ActiveInstance> {
        let found = tracker.find_active(identity)?;
        debug!(identity, instance_id = %found.instance_id, "duplicate found in cache");
        Some(ActiveInstance {
            instance_id: found.instance_id,
            identity: identity.to_string(),
            api_port: Some(found.api_port),
            source: GuardSource::Cache,
        })
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::Utc;

    use crate::instance::{BotInstance, InstanceStatus, Network};
    use crate::launch::LaunchDescriptor;
    use crate::registry::{RegistryRecord, SqliteRegistry};
    use crate::supervisor::{ProcessStatus, SupervisedProcess, SupervisorError};

    use super::*;

    /// Supervisor double with a canned table or a canned failure.
    struct TableSupervisor {
        table: Result<Vec<SupervisedProcess>, ()>,
    }

    #[async_trait]
    impl ProcessSupervisor for TableSupervisor {
        async fn list(&self) -> Result<Vec<SupervisedProcess>, SupervisorError> {
            match &self.table {
                Ok(table) => Ok(table.clone()),
                Err(()) => Err(SupervisorError::Malformed {
                    reason: "scripted failure".to_string(),
                }),
            }
        }

        async fn submit(&self, _descriptor: &LaunchDescriptor) -> Result<(), SupervisorError> {
            Ok(())
        }

        async fn delete(&self, _tag: &str) -> Result<(), SupervisorError> {
            Ok(())
        }
    }

    fn guard() -> DuplicateGuard {
        DuplicateGuard::new(chrono::Duration::seconds(120))
    }

    fn running_record(identity: &str, port: u16, heartbeat_age_secs: i64) -> RegistryRecord {
        let mut instance = BotInstance::new(identity, port, Network::Testnet);
        instance.status = InstanceStatus::Running;
        instance.last_heartbeat = Some(Utc::now() - chrono::Duration::seconds(heartbeat_age_secs));
        RegistryRecord::from(&instance)
    }

    #[tokio::test]
    async fn test_supervisor_match_wins() {
        let supervisor = TableSupervisor {
            table: Ok(vec![SupervisedProcess {
                tag: "bot-deadbeef-8101".to_string(),
                status: ProcessStatus::Online,
            }]),
        };
        let registry = SqliteRegistry::open_in_memory().unwrap();
        let tracker = LifecycleTracker::new();

        let found = guard()
            .find_active("0xdeadbeef99", &supervisor, &registry, &tracker)
            .await
            .unwrap();
        assert_eq!(found.source, GuardSource::Supervisor);
        assert_eq!(found.api_port, Some(8101));
    }

    #[tokio::test]
    async fn test_offline_supervisor_entry_is_not_a_conflict() {
        let supervisor = TableSupervisor {
            table: Ok(vec![SupervisedProcess {
                tag: "bot-deadbeef-8101".to_string(),
                status: ProcessStatus::Stopped,
            }]),
        };
        let registry = SqliteRegistry::open_in_memory().unwrap();
        let tracker = LifecycleTracker::new();

        assert!(guard()
            .find_active("0xdeadbeef99", &supervisor, &registry, &tracker)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_fresh_registry_record_is_a_conflict() {
        let supervisor = TableSupervisor { table: Ok(vec![]) };
        let registry = SqliteRegistry::open_in_memory().unwrap();
        registry.upsert(&running_record("0xdeadbeef99", 8101, 30)).unwrap();
        let tracker = LifecycleTracker::new();

        let found = guard()
            .find_active("0xdeadbeef99", &supervisor, &registry, &tracker)
            .await
            .unwrap();
        assert_eq!(found.source, GuardSource::Registry);
    }

    #[tokio::test]
    async fn test_stale_registry_record_is_ignored() {
        let supervisor = TableSupervisor { table: Ok(vec![]) };
        let registry = SqliteRegistry::open_in_memory().unwrap();
        // Heartbeat ten minutes old, well past the two-minute window.
        registry.upsert(&running_record("0xdeadbeef99", 8101, 600)).unwrap();
        let tracker = LifecycleTracker::new();

        assert!(guard()
            .find_active("0xdeadbeef99", &supervisor, &registry, &tracker)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_cache_is_last_resort_and_counts_starting() {
        let supervisor = TableSupervisor { table: Ok(vec![]) };
        let registry = SqliteRegistry::open_in_memory().unwrap();
        let tracker = LifecycleTracker::new();
        tracker
            .track_starting(BotInstance::new("0xdeadbeef99", 8101, Network::Testnet))
            .unwrap();

        let found = guard()
            .find_active("0xdeadbeef99", &supervisor, &registry, &tracker)
            .await
            .unwrap();
        assert_eq!(found.source, GuardSource::Cache);
    }

    #[tokio::test]
    async fn test_supervisor_failure_degrades_to_other_sources() {
        let supervisor = TableSupervisor { table: Err(()) };
        let registry = SqliteRegistry::open_in_memory().unwrap();
        registry.upsert(&running_record("0xdeadbeef99", 8101, 30)).unwrap();
        let tracker = LifecycleTracker::new();

        let found = guard()
            .find_active("0xdeadbeef99", &supervisor, &registry, &tracker)
            .await
            .unwrap();
        assert_eq!(found.source, GuardSource::Registry);
    }

    #[tokio::test]
    async fn test_all_sources_empty_permits_spawn() {
        let supervisor = TableSupervisor { table: Ok(vec![]) };
        let registry = SqliteRegistry::open_in_memory().unwrap();
        let tracker = LifecycleTracker::new();

        assert!(guard()
            .find_active("0xdeadbeef99", &supervisor, &registry, &tracker)
            .await
            .is_none());
    }
}
