//! The orchestrator facade.
//!
//! Wires the duplicate guard, port allocator, descriptor builder,
//! supervisor client, lifecycle tracker, and teardown coordinator into the
//! four operations exposed to callers: `spawn`, `list`, `stop`, and
//! `force_cleanup`.
//!
//! # Concurrency
//!
//! Spawn requests serialize on one async mutex across the span from "no
//! conflict found" to "port reserved and cache entry inserted". The
//! three-source duplicate check itself is read-only, but its verdict is only
//! trustworthy inside the same critical section as the reservation;
//! otherwise two spawns for one identity could both pass the guard before
//! either reserves state. The slow part of a spawn, writing the artifact
//! and waiting for the supervisor's acknowledgment, happens after the
//! lock is released, because the cache entry already excludes rivals.
//!
//! # Rollback
//!
//! A spawn rejected at any stage rolls back synchronously before
//! returning: the caller never observes a reserved-but-unowned port, and a
//! failed launch leaves the registry record in a non-running state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::OrchestratorConfig;
use crate::error::SpawnError;
use crate::guard::DuplicateGuard;
use crate::instance::{tag_stem, BotInstance, EffectiveStatus, InstanceStatus};
use crate::launch::{LaunchDescriptor, SpawnRequest};
use crate::lifecycle::LifecycleTracker;
use crate::port::{PortAllocator, PortProber};
use crate::registry::{InstanceRegistry, RegistryError, RegistryRecord};
use crate::supervisor::{truncate_diagnostic, ProcessSupervisor};
use crate::teardown::{TeardownCoordinator, TeardownReport};

/// An instance as reported to callers: the stored record plus the
/// staleness-adjusted status.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    /// The stored instance record.
    #[serde(flatten)]
    pub instance: BotInstance,
    /// Status after heartbeat-staleness demotion.
    pub effective_status: EffectiveStatus,
}

/// The bot-instance orchestrator.
pub struct Orchestrator {
    config: OrchestratorConfig,
    supervisor: Arc<dyn ProcessSupervisor>,
    registry: Arc<dyn InstanceRegistry>,
    allocator: Arc<PortAllocator>,
    tracker: Arc<LifecycleTracker>,
    guard: DuplicateGuard,
    teardown: TeardownCoordinator,
    /// Serializes guard verdict + port reservation + cache insert.
    spawn_lock: tokio::sync::Mutex<()>,
}

impl Orchestrator {
    /// Build an orchestrator from its capability implementations.
    #[must_use]
    pub fn new(
        config: OrchestratorConfig,
        supervisor: Arc<dyn ProcessSupervisor>,
        registry: Arc<dyn InstanceRegistry>,
        prober: Arc<dyn PortProber>,
    ) -> Self {
        let allocator = Arc::new(PortAllocator::new(
            config.min_port,
            config.max_port,
            prober,
        ));
        let tracker = Arc::new(LifecycleTracker::new());
        let guard = DuplicateGuard::new(config.heartbeat_window());
        let teardown = TeardownCoordinator::new(
            supervisor.clone(),
            registry.clone(),
            allocator.clone(),
            tracker.clone(),
            config.artifact_dir.clone(),
            config.log_dir.clone(),
        );
        Self {
            config,
            supervisor,
            registry,
            allocator,
            tracker,
            guard,
            teardown,
            spawn_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// The port allocator, exposed for observability.
    #[must_use]
    pub fn port_allocator(&self) -> &PortAllocator {
        &self.allocator
    }

    /// Spawn one bot instance for the request's identity.
    ///
    /// # Errors
    ///
    /// - [`SpawnError::Validation`]: malformed request; no side effects.
    /// - [`SpawnError::Conflict`]: an active instance exists; no side
    ///   effects, the existing instance's info is returned.
    /// - [`SpawnError::NoCapacity`]: port range exhausted; no side
    ///   effects.
    /// - [`SpawnError::LaunchFailed`]: the supervisor rejected the
    ///   submission; the reservation and registry record were rolled back.
    pub async fn spawn(&self, request: SpawnRequest) -> Result<BotInstance, SpawnError> {
        request.validate()?;

        // Critical section: verdict and reservation must be indivisible.
        let instance = {
            let _serialized = self.spawn_lock.lock().await;

            if let Some(existing) = self
                .guard
                .find_active(
                    &request.identity,
                    self.supervisor.as_ref(),
                    self.registry.as_ref(),
                    &self.tracker,
                )
                .await
            {
                info!(
                    identity = %request.identity,
                    existing = %existing.instance_id,
                    "spawn rejected: active instance exists"
                );
                return Err(SpawnError::Conflict { existing });
            }

            let port = self.allocator.allocate().map_err(|err| SpawnError::NoCapacity {
                min_port: err.min_port,
                max_port: err.max_port,
            })?;

            let instance = BotInstance::new(&request.identity, port, request.network);
            if let Err(err) = self.tracker.track_starting(instance.clone()) {
                self.allocator.release(port);
                return Err(err.into());
            }
            instance
        };

        info!(
            instance_id = %instance.instance_id,
            identity = %instance.identity,
            api_port = instance.api_port,
            network = %instance.network,
            "spawn accepted"
        );

        let descriptor = LaunchDescriptor::build(&self.config, &request, &instance);
        if let Err(err) = descriptor.write_artifact() {
            return self
                .rollback_launch(&instance, format!("failed to write launch artifact: {err}"))
                .await;
        }

        // Durable record before submission, so a crash window between
        // submit and the running update is still visible after restart.
        self.upsert_degraded(&instance);

        match self.supervisor.submit(&descriptor).await {
            Ok(()) => {
                let running = self
                    .tracker
                    .transition(&instance.instance_id, InstanceStatus::Running)?;
                self.upsert_degraded(&running);
                info!(instance_id = %running.instance_id, "instance running");
                Ok(running)
            }
            Err(err) => {
                self.rollback_launch(&instance, truncate_diagnostic(&err.to_string()))
                    .await
            }
        }
    }

    /// Roll back a partially-spawned instance and surface the failure.
    async fn rollback_launch(
        &self,
        instance: &BotInstance,
        diagnostic: String,
    ) -> Result<BotInstance, SpawnError> {
        warn!(
            instance_id = %instance.instance_id,
            diagnostic = %diagnostic,
            "launch failed, rolling back"
        );

        let _ = self
            .tracker
            .transition(&instance.instance_id, InstanceStatus::Error);

        let report = self.teardown.teardown(&instance.instance_id).await;
        if !report.is_clean() {
            warn!(
                instance_id = %instance.instance_id,
                warnings = report.warnings().count(),
                "rollback completed with warnings"
            );
        }

        // Leave the durable record in error state for the audit trail;
        // teardown marked it stopped, which is equally non-running.
        let mut errored = instance.clone();
        errored.status = InstanceStatus::Error;
        self.upsert_degraded(&errored);

        Err(SpawnError::LaunchFailed { diagnostic })
    }

    /// Registry writes on the spawn path degrade rather than fail: the
    /// supervisor table and cache still uphold the uniqueness invariant
    /// until the registry recovers.
    fn upsert_degraded(&self, instance: &BotInstance) {
        if let Err(err) = self.registry.upsert(&RegistryRecord::from(instance)) {
            warn!(
                instance_id = %instance.instance_id,
                %err,
                "registry write failed; continuing with degraded durability"
            );
        }
    }

    /// All known instances, optionally filtered by owner, newest first.
    ///
    /// Merges the durable registry (authoritative across restarts, carries
    /// heartbeats) with the in-process cache (authoritative for in-flight
    /// lifecycle), then applies heartbeat-staleness demotion.
    #[must_use]
    pub fn list(&self, identity: Option<&str>) -> Vec<InstanceSnapshot> {
        let mut merged: std::collections::HashMap<String, BotInstance> =
            std::collections::HashMap::new();

        match self.registry.list(identity) {
            Ok(records) => {
                for record in records {
                    merged.insert(record.instance_id.clone(), record.to_instance());
                }
            }
            Err(err) => {
                warn!(%err, "registry unavailable for list; serving cache only");
            }
        }

        for cached in self.tracker.list(identity) {
            match merged.entry(cached.instance_id.clone()) {
                std::collections::hash_map::Entry::Occupied(mut slot) => {
                    // Cache wins on lifecycle, registry wins on heartbeat
                    // recency.
                    let newest_beat = slot.get().last_heartbeat.max(cached.last_heartbeat);
                    let mut updated = cached;
                    updated.last_heartbeat = newest_beat;
                    slot.insert(updated);
                }
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(cached);
                }
            }
        }

        let window = self.config.heartbeat_window();
        let now = Utc::now();
        let mut snapshots: Vec<InstanceSnapshot> = merged
            .into_values()
            .map(|instance| InstanceSnapshot {
                effective_status: instance.effective_status(window, now),
                instance,
            })
            .collect();
        snapshots.sort_by(|a, b| b.instance.created_at.cmp(&a.instance.created_at));
        snapshots
    }

    /// Stop an instance by instance id or by owning identity.
    ///
    /// Unknown selectors are a clean no-op, matching teardown's
    /// idempotence.
    pub async fn stop(&self, selector: &str) -> TeardownReport {
        if self.is_instance_id(selector) {
            return self.teardown.teardown(selector).await;
        }

        // Identity path: tear down every active instance for the owner.
        let mut report = TeardownReport::new(selector);
        for instance_id in self.active_ids_for(selector) {
            report.absorb(self.teardown.teardown(&instance_id).await);
        }
        report
    }

    /// Operator-driven cleanup of everything attributable to an identity.
    ///
    /// With `deep`, also deletes supervisor processes whose tag provably
    /// derives from the identity even when no local or durable record
    /// tracks them (orphan recovery after lost state). Attribution
    /// requires a confirmed tag match; a mere substring hit elsewhere in
    /// the tag is not enough to risk collateral termination.
    pub async fn force_cleanup(&self, identity: &str, deep: bool) -> TeardownReport {
        info!(identity, deep, "force cleanup requested");
        let mut report = TeardownReport::new(identity);
        let mut seen = std::collections::HashSet::new();

        for instance in self.tracker.list(Some(identity)) {
            if seen.insert(instance.instance_id.clone()) {
                report.absorb(self.teardown.teardown(&instance.instance_id).await);
            }
        }
        match self.registry.list(Some(identity)) {
            Ok(records) => {
                for record in records {
                    if seen.insert(record.instance_id.clone()) {
                        report.absorb(self.teardown.teardown(&record.instance_id).await);
                    }
                }
            }
            Err(err) => {
                warn!(identity, %err, "registry unavailable for cleanup");
            }
        }

        if deep {
            let prefix = format!("{}-", tag_stem(identity));
            match self.supervisor.list().await {
                Ok(table) => {
                    for process in table {
                        if process.tag.starts_with(&prefix) && seen.insert(process.tag.clone()) {
                            info!(tag = %process.tag, "deep cleanup of untracked process");
                            report.absorb(self.teardown.teardown(&process.tag).await);
                        }
                    }
                }
                Err(err) => {
                    warn!(identity, %err, "supervisor unavailable for deep cleanup");
                }
            }
        }

        report
    }

    /// Record an externally-reported liveness signal.
    ///
    /// Only heartbeat state changes; this never triggers a spawn or a
    /// transition.
    ///
    /// # Errors
    ///
    /// Returns an error if the durable write fails.
    pub fn observe_heartbeat(
        &self,
        instance_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        self.registry.record_heartbeat(instance_id, at)?;
        self.tracker.observe_heartbeat(instance_id, at);
        Ok(())
    }

    /// Whether a selector names a known instance id (as opposed to an
    /// identity).
    fn is_instance_id(&self, selector: &str) -> bool {
        if self.tracker.get(selector).is_some() {
            return true;
        }
        matches!(self.registry.find_by_instance(selector), Ok(Some(_)))
    }

    /// Active instance ids for an identity across cache and registry.
    fn active_ids_for(&self, identity: &str) -> Vec<String> {
        let mut ids = Vec::new();
        if let Some(instance) = self.tracker.find_active(identity) {
            ids.push(instance.instance_id);
        }
        match self.registry.list(Some(identity)) {
            Ok(records) => {
                for record in records {
                    if record.status.is_active() && !ids.contains(&record.instance_id) {
                        ids.push(record.instance_id);
                    }
                }
            }
            Err(err) => {
                warn!(identity, %err, "registry unavailable while resolving stop target");
            }
        }
        ids
    }
}
