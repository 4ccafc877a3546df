//! End-to-end orchestrator flows against a scripted supervisor and a real
//! on-disk registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use bothive_core::{
    BotInstance, InstanceRegistry, InstanceStatus, LaunchDescriptor, Network, Orchestrator,
    OrchestratorConfig, PortProber, ProcessStatus, ProcessSupervisor, RegistryRecord, SpawnError,
    SpawnRequest, SqliteRegistry, SupervisedProcess, SupervisorError,
};
use secrecy::SecretString;

/// Supervisor double: `submit` registers the tag as online, `delete`
/// removes it, and submission failures can be scripted.
#[derive(Default)]
struct ScriptedSupervisor {
    table: Mutex<HashMap<String, ProcessStatus>>,
    fail_submit: AtomicBool,
}

#[async_trait]
impl ProcessSupervisor for ScriptedSupervisor {
    async fn list(&self) -> Result<Vec<SupervisedProcess>, SupervisorError> {
        Ok(self
            .table
            .lock()
            .unwrap()
            .iter()
            .map(|(tag, status)| SupervisedProcess {
                tag: tag.clone(),
                status: *status,
            })
            .collect())
    }

    async fn submit(&self, descriptor: &LaunchDescriptor) -> Result<(), SupervisorError> {
        if self.fail_submit.load(Ordering::SeqCst) {
            return Err(SupervisorError::Rejected {
                operation: "submit",
                diagnostic: "script exited with code 1".to_string(),
            });
        }
        self.table
            .lock()
            .unwrap()
            .insert(descriptor.tag.clone(), ProcessStatus::Online);
        Ok(())
    }

    async fn delete(&self, tag: &str) -> Result<(), SupervisorError> {
        self.table.lock().unwrap().remove(tag);
        Ok(())
    }
}

struct NeverBound;

impl PortProber for NeverBound {
    fn is_bound(&self, _port: u16) -> bool {
        false
    }
}

struct Harness {
    orchestrator: Orchestrator,
    supervisor: Arc<ScriptedSupervisor>,
    registry: Arc<SqliteRegistry>,
    _dir: tempfile::TempDir,
}

fn harness_with_ports(min_port: u16, max_port: u16) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = OrchestratorConfig::from_toml(&format!(
        r#"
        min_port = {min_port}
        max_port = {max_port}
        artifact_dir = "{artifacts}"
        log_dir = "{logs}"
        registry_path = "{registry}"
        "#,
        artifacts = dir.path().join("instances").display(),
        logs = dir.path().join("logs").display(),
        registry = dir.path().join("registry.db").display(),
    ))
    .unwrap();

    let supervisor = Arc::new(ScriptedSupervisor::default());
    let registry = Arc::new(SqliteRegistry::open(&config.registry_path).unwrap());
    let orchestrator = Orchestrator::new(
        config,
        supervisor.clone(),
        registry.clone(),
        Arc::new(NeverBound),
    );
    Harness {
        orchestrator,
        supervisor,
        registry,
        _dir: dir,
    }
}

fn harness() -> Harness {
    harness_with_ports(8100, 8110)
}

fn secret() -> SecretString {
    SecretString::from("0x".to_string() + &"cd".repeat(32))
}

fn request(identity: &str) -> SpawnRequest {
    SpawnRequest::new(identity, secret(), Network::Testnet)
}

#[tokio::test]
async fn spawn_then_duplicate_returns_conflict_with_existing_info() {
    let hx = harness();

    let instance = hx.orchestrator.spawn(request("0xaaaa000011112222")).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Running);
    assert_eq!(instance.api_port, 8100);

    // Second spawn for the same identity: conflict carrying the live
    // instance's coordinates, not an opaque failure.
    let err = hx.orchestrator.spawn(request("0xaaaa000011112222")).await.unwrap_err();
    match err {
        SpawnError::Conflict { existing } => {
            assert_eq!(existing.instance_id, instance.instance_id);
            assert_eq!(existing.api_port, Some(instance.api_port));
        }
        other => panic!("expected conflict, got {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_spawns_for_one_identity_yield_one_instance() {
    let hx = Arc::new(harness());

    let mut handles = Vec::new();
    for _ in 0..8 {
        let hx = hx.clone();
        handles.push(tokio::spawn(async move {
            hx.orchestrator.spawn(request("0xaaaa000011112222")).await
        }));
    }

    let mut successes = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(SpawnError::Conflict { .. }) => conflicts += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(successes, 1, "exactly one spawn may win");
    assert_eq!(conflicts, 7);
    assert_eq!(hx.orchestrator.port_allocator().reserved_count(), 1);
}

#[tokio::test]
async fn distinct_identities_get_distinct_ports() {
    let hx = harness();

    let a = hx.orchestrator.spawn(request("0xaaaa000011112222")).await.unwrap();
    let b = hx.orchestrator.spawn(request("0xbbbb000011112222")).await.unwrap();
    let c = hx.orchestrator.spawn(request("0xcccc000011112222")).await.unwrap();

    let mut ports = [a.api_port, b.api_port, c.api_port];
    ports.sort_unstable();
    assert_eq!(ports, [8100, 8101, 8102]);
}

#[tokio::test]
async fn stale_registry_record_does_not_block_spawn() {
    let hx = harness();

    // A previous orchestrator's record: status says running, but the
    // heartbeat is ten minutes old, stale beyond the two-minute window.
    let mut ghost = BotInstance::new("0xbbbb333344445555", 8105, Network::Testnet);
    ghost.status = InstanceStatus::Running;
    ghost.last_heartbeat = Some(Utc::now() - chrono::Duration::minutes(10));
    hx.registry.upsert(&RegistryRecord::from(&ghost)).unwrap();

    let instance = hx.orchestrator.spawn(request("0xbbbb333344445555")).await.unwrap();
    assert_ne!(instance.instance_id, ghost.instance_id);
    assert_eq!(instance.status, InstanceStatus::Running);
}

#[tokio::test]
async fn fresh_registry_record_blocks_spawn() {
    let hx = harness();

    let mut live = BotInstance::new("0xbbbb333344445555", 8105, Network::Testnet);
    live.status = InstanceStatus::Running;
    live.last_heartbeat = Some(Utc::now() - chrono::Duration::seconds(30));
    hx.registry.upsert(&RegistryRecord::from(&live)).unwrap();

    let err = hx.orchestrator.spawn(request("0xbbbb333344445555")).await.unwrap_err();
    assert!(matches!(err, SpawnError::Conflict { .. }));
}

#[tokio::test]
async fn launch_failure_rolls_back_completely() {
    let hx = harness();
    hx.supervisor.fail_submit.store(true, Ordering::SeqCst);

    let err = hx.orchestrator.spawn(request("0xcccc666677778888")).await.unwrap_err();
    match err {
        SpawnError::LaunchFailed { diagnostic } => {
            assert!(diagnostic.contains("script exited"));
        }
        other => panic!("expected launch failure, got {other:?}"),
    }

    // No port reservation survives the rollback.
    assert_eq!(hx.orchestrator.port_allocator().reserved_count(), 0);

    // The durable record, if any, is non-running.
    for record in hx.registry.list(Some("0xcccc666677778888")).unwrap() {
        assert!(!record.status.is_active(), "record left active: {record:?}");
    }

    // And the identity can spawn again once the supervisor recovers.
    hx.supervisor.fail_submit.store(false, Ordering::SeqCst);
    let instance = hx.orchestrator.spawn(request("0xcccc666677778888")).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Running);
}

#[tokio::test]
async fn stop_is_idempotent_and_round_trip_mints_new_instance() {
    let hx = harness();

    let first = hx.orchestrator.spawn(request("0xdddd999900001111")).await.unwrap();

    let report = hx.orchestrator.stop(&first.instance_id).await;
    assert!(report.is_clean(), "outcomes: {:?}", report.outcomes);
    assert_eq!(hx.orchestrator.port_allocator().reserved_count(), 0);

    // Second stop: same terminal state, no error.
    let again = hx.orchestrator.stop(&first.instance_id).await;
    assert!(again.is_clean());

    // Respawn succeeds, mints a new id, and draws a valid in-range port.
    let second = hx.orchestrator.spawn(request("0xdddd999900001111")).await.unwrap();
    assert_ne!(second.instance_id, first.instance_id);
    assert!((8100..=8110).contains(&second.api_port));
}

#[tokio::test]
async fn stop_by_identity_resolves_the_active_instance() {
    let hx = harness();

    let instance = hx.orchestrator.spawn(request("0xeeee222233334444")).await.unwrap();
    let report = hx.orchestrator.stop("0xeeee222233334444").await;
    assert!(report
        .outcomes
        .iter()
        .any(|outcome| outcome.instance_id == instance.instance_id));
    assert!(hx.supervisor.table.lock().unwrap().is_empty());
    assert_eq!(hx.orchestrator.port_allocator().reserved_count(), 0);
}

#[tokio::test]
async fn exhausted_port_range_returns_no_capacity_without_side_effects() {
    let hx = harness_with_ports(8100, 8101);

    hx.orchestrator.spawn(request("0xaaaa000011112222")).await.unwrap();
    hx.orchestrator.spawn(request("0xbbbb000011112222")).await.unwrap();

    let err = hx.orchestrator.spawn(request("0xcccc000011112222")).await.unwrap_err();
    match err {
        SpawnError::NoCapacity { min_port, max_port } => {
            assert_eq!((min_port, max_port), (8100, 8101));
        }
        other => panic!("expected capacity exhaustion, got {other:?}"),
    }

    // The two live instances are untouched.
    assert_eq!(hx.orchestrator.port_allocator().reserved_count(), 2);
    assert!(hx.registry.list(Some("0xcccc000011112222")).unwrap().is_empty());
}

#[tokio::test]
async fn validation_failures_leave_no_trace() {
    let hx = harness();

    let bad = SpawnRequest::new(
        "0xaaaa000011112222",
        SecretString::from("not-a-key".to_string()),
        Network::Testnet,
    );
    let err = hx.orchestrator.spawn(bad).await.unwrap_err();
    assert!(matches!(err, SpawnError::Validation { .. }));
    assert_eq!(hx.orchestrator.port_allocator().reserved_count(), 0);
    assert!(hx.registry.list(None).unwrap().is_empty());
}

#[tokio::test]
async fn list_reports_effective_status_with_stale_heartbeats_offline() {
    let hx = harness();

    let instance = hx.orchestrator.spawn(request("0xaaaa000011112222")).await.unwrap();

    // Fresh heartbeat: running.
    hx.orchestrator
        .observe_heartbeat(&instance.instance_id, Utc::now())
        .unwrap();
    let snapshots = hx.orchestrator.list(Some("0xaaaa000011112222"));
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].effective_status.as_str(), "running");

    // Stale heartbeat: offline, while the stored status stays running.
    hx.orchestrator
        .observe_heartbeat(&instance.instance_id, Utc::now() - chrono::Duration::minutes(10))
        .unwrap();
    let snapshots = hx.orchestrator.list(Some("0xaaaa000011112222"));
    assert_eq!(snapshots[0].effective_status.as_str(), "offline");
    assert_eq!(snapshots[0].instance.status, InstanceStatus::Running);
}

#[tokio::test]
async fn deep_force_cleanup_reclaims_untracked_orphans_with_tag_match_only() {
    let hx = harness();

    // An orphan left behind by a crashed orchestrator: present in the
    // supervisor, unknown to registry and cache.
    hx.supervisor.table.lock().unwrap().insert(
        "bot-ffff1111-8104-zzz".to_string(),
        ProcessStatus::Online,
    );
    // An unrelated process that merely contains similar text must survive.
    hx.supervisor
        .table
        .lock()
        .unwrap()
        .insert("metrics-bot-ffff1111".to_string(), ProcessStatus::Online);

    let report = hx.orchestrator.force_cleanup("0xffff11112222aaaa", true).await;
    assert!(report
        .outcomes
        .iter()
        .any(|outcome| outcome.instance_id == "bot-ffff1111-8104-zzz"));

    let table = hx.supervisor.table.lock().unwrap();
    assert!(!table.contains_key("bot-ffff1111-8104-zzz"));
    assert!(table.contains_key("metrics-bot-ffff1111"));
}

#[tokio::test]
async fn shallow_force_cleanup_leaves_untracked_processes_alone() {
    let hx = harness();

    hx.supervisor.table.lock().unwrap().insert(
        "bot-ffff1111-8104-zzz".to_string(),
        ProcessStatus::Online,
    );

    hx.orchestrator.force_cleanup("0xffff11112222aaaa", false).await;
    assert!(hx
        .supervisor
        .table
        .lock()
        .unwrap()
        .contains_key("bot-ffff1111-8104-zzz"));
}
