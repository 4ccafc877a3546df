//! Persistent instance registry client.
//!
//! The registry is the durable source of truth that survives orchestrator
//! restarts. Records carry a heartbeat timestamp written by an external
//! reporting mechanism; the orchestrator reads them through the duplicate
//! guard and writes them on spawn, launch outcome, and teardown. All write
//! operations are idempotent (upsert by instance id, mark-stopped of an
//! already-stopped record succeeds) so a crashed orchestrator cannot leave
//! the store in a state a retry cannot repair.

pub mod sqlite;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::instance::{BotInstance, InstanceStatus, Network};

pub use sqlite::SqliteRegistry;

/// Errors from registry operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistryError {
    /// Database error from `SQLite`.
    #[error("registry database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error while opening or preparing the database.
    #[error("registry I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One durable instance record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryRecord {
    /// Instance identifier, also the supervisor process tag. Primary key.
    pub instance_id: String,
    /// Owning identity.
    pub identity: String,
    /// Assigned API port.
    pub api_port: u16,
    /// Deployment target.
    pub network: Network,
    /// Stored lifecycle status.
    pub status: InstanceStatus,
    /// When the spawn was accepted.
    pub created_at: DateTime<Utc>,
    /// Most recent liveness signal, written by the external heartbeat
    /// reporter.
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl From<&BotInstance> for RegistryRecord {
    fn from(instance: &BotInstance) -> Self {
        Self {
            instance_id: instance.instance_id.clone(),
            identity: instance.identity.clone(),
            api_port: instance.api_port,
            network: instance.network,
            status: instance.status,
            created_at: instance.created_at,
            last_heartbeat: instance.last_heartbeat,
        }
    }
}

impl RegistryRecord {
    /// Rehydrate a cacheable instance from this record.
    #[must_use]
    pub fn to_instance(&self) -> BotInstance {
        BotInstance {
            identity: self.identity.clone(),
            instance_id: self.instance_id.clone(),
            api_port: self.api_port,
            network: self.network,
            status: self.status,
            created_at: self.created_at,
            last_heartbeat: self.last_heartbeat,
        }
    }
}

/// Capability for reading and writing durable instance records.
pub trait InstanceRegistry: Send + Sync {
    /// Insert or replace the record keyed by `record.instance_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn upsert(&self, record: &RegistryRecord) -> Result<(), RegistryError>;

    /// Fetch one record by instance id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn find_by_instance(&self, instance_id: &str) -> Result<Option<RegistryRecord>, RegistryError>;

    /// All records, optionally filtered by identity, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    fn list(&self, identity: Option<&str>) -> Result<Vec<RegistryRecord>, RegistryError>;

    /// Mark a record stopped. Succeeds as a no-op for unknown or
    /// already-stopped records.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn mark_stopped(&self, instance_id: &str) -> Result<(), RegistryError>;

    /// Record a liveness signal for an instance. Succeeds as a no-op for
    /// unknown records; only `last_heartbeat` is touched.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn record_heartbeat(&self, instance_id: &str, at: DateTime<Utc>) -> Result<(), RegistryError>;
}
