//! `SQLite`-backed instance registry.
//!
//! Uses WAL mode so the external heartbeat reporter and the orchestrator can
//! write concurrently without blocking reads. The connection is wrapped in a
//! mutex; registry operations are short single-statement transactions.

// SQLite stores integers as i64; ports fit in u16 and millisecond
// timestamps fit in i64 until long past this code's lifetime.
#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use super::{InstanceRegistry, RegistryError, RegistryRecord};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Durable registry stored in a `SQLite` database file.
pub struct SqliteRegistry {
    conn: Mutex<Connection>,
}

impl SqliteRegistry {
    /// Open (creating if needed) the registry at `path`.
    ///
    /// Parent directories are created; WAL mode and a busy timeout are
    /// applied before the schema runs.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or database cannot be created.
    pub fn open(path: &Path) -> Result<Self, RegistryError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::initialize(conn)
    }

    /// Open an in-memory registry. Used by tests and ephemeral deployments.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn open_in_memory() -> Result<Self, RegistryError> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self, RegistryError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    ) -> Result<T, RegistryError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(f(&conn)?)
    }
}

fn row_to_record(row: &Row<'_>) -> Result<RegistryRecord, rusqlite::Error> {
    let network: String = row.get("network")?;
    let status: String = row.get("status")?;
    let created_ms: i64 = row.get("created_at")?;
    let heartbeat_ms: Option<i64> = row.get("last_heartbeat")?;

    Ok(RegistryRecord {
        instance_id: row.get("instance_id")?,
        identity: row.get("identity")?,
        api_port: row.get::<_, i64>("api_port")? as u16,
        network: network
            .parse()
            .map_err(|e| conversion_err("network", Box::new(e)))?,
        status: status
            .parse()
            .map_err(|e| conversion_err("status", Box::new(e)))?,
        created_at: millis_to_datetime(created_ms)
            .ok_or_else(|| conversion_err("created_at", "out of range".into()))?,
        last_heartbeat: match heartbeat_ms {
            Some(ms) => Some(
                millis_to_datetime(ms)
                    .ok_or_else(|| conversion_err("last_heartbeat", "out of range".into()))?,
            ),
            None => None,
        },
    })
}

fn conversion_err(
    column: &str,
    source: Box<dyn std::error::Error + Send + Sync>,
) -> rusqlite::Error {
    debug!(column, %source, "registry row failed to convert");
    rusqlite::Error::FromSqlConversionFailure(0, Type::Text, source)
}

fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

impl InstanceRegistry for SqliteRegistry {
    fn upsert(&self, record: &RegistryRecord) -> Result<(), RegistryError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO instances
                     (instance_id, identity, api_port, network, status, created_at, last_heartbeat)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (instance_id) DO UPDATE SET
                     identity = excluded.identity,
                     api_port = excluded.api_port,
                     network = excluded.network,
                     status = excluded.status,
                     created_at = excluded.created_at,
                     last_heartbeat = excluded.last_heartbeat",
                params![
                    record.instance_id,
                    record.identity,
                    i64::from(record.api_port),
                    record.network.as_str(),
                    record.status.as_str(),
                    record.created_at.timestamp_millis(),
                    record.last_heartbeat.map(|t| t.timestamp_millis()),
                ],
            )?;
            Ok(())
        })
    }

    fn find_by_instance(&self, instance_id: &str) -> Result<Option<RegistryRecord>, RegistryError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT instance_id, identity, api_port, network, status, created_at, last_heartbeat
                 FROM instances WHERE instance_id = ?1",
                params![instance_id],
                row_to_record,
            )
            .optional()
        })
    }

    fn list(&self, identity: Option<&str>) -> Result<Vec<RegistryRecord>, RegistryError> {
        self.with_conn(|conn| {
            let mut records = Vec::new();
            match identity {
                Some(identity) => {
                    let mut stmt = conn.prepare(
                        "SELECT instance_id, identity, api_port, network, status, created_at, last_heartbeat
                         FROM instances WHERE identity = ?1 ORDER BY created_at DESC",
                    )?;
                    let rows = stmt.query_map(params![identity], row_to_record)?;
                    for row in rows {
                        records.push(row?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT instance_id, identity, api_port, network, status, created_at, last_heartbeat
                         FROM instances ORDER BY created_at DESC",
                    )?;
                    let rows = stmt.query_map([], row_to_record)?;
                    for row in rows {
                        records.push(row?);
                    }
                }
            }
            Ok(records)
        })
    }

    fn mark_stopped(&self, instance_id: &str) -> Result<(), RegistryError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE instances SET status = 'stopped' WHERE instance_id = ?1",
                params![instance_id],
            )?;
            debug!(instance_id, changed, "marked registry record stopped");
            Ok(())
        })
    }

    fn record_heartbeat(&self, instance_id: &str, at: DateTime<Utc>) -> Result<(), RegistryError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE instances SET last_heartbeat = ?2 WHERE instance_id = ?1",
                params![instance_id, at.timestamp_millis()],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::instance::{BotInstance, InstanceStatus, Network};

    use super::*;

    fn record(identity: &str, port: u16, status: InstanceStatus) -> RegistryRecord {
        let mut instance = BotInstance::new(identity, port, Network::Testnet);
        instance.status = status;
        RegistryRecord::from(&instance)
    }

    #[test]
    fn test_upsert_and_find_round_trip() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        let rec = record("0xabc123def456", 8101, InstanceStatus::Running);

        registry.upsert(&rec).unwrap();
        let found = registry.find_by_instance(&rec.instance_id).unwrap().unwrap();
        assert_eq!(found, rec);

        assert!(registry.find_by_instance("bot-none-1").unwrap().is_none());
    }

    #[test]
    fn test_upsert_replaces_by_instance_id() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        let mut rec = record("0xabc123def456", 8101, InstanceStatus::Starting);
        registry.upsert(&rec).unwrap();

        rec.status = InstanceStatus::Running;
        registry.upsert(&rec).unwrap();

        let found = registry.find_by_instance(&rec.instance_id).unwrap().unwrap();
        assert_eq!(found.status, InstanceStatus::Running);
        assert_eq!(registry.list(None).unwrap().len(), 1);
    }

    #[test]
    fn test_list_filters_by_identity() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        registry
            .upsert(&record("0xaaaa11112222", 8101, InstanceStatus::Running))
            .unwrap();
        registry
            .upsert(&record("0xbbbb33334444", 8102, InstanceStatus::Running))
            .unwrap();

        let all = registry.list(None).unwrap();
        assert_eq!(all.len(), 2);

        let one = registry.list(Some("0xaaaa11112222")).unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].identity, "0xaaaa11112222");

        assert!(registry.list(Some("0xunknown")).unwrap().is_empty());
    }

    #[test]
    fn test_mark_stopped_is_idempotent() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        let rec = record("0xabc123def456", 8101, InstanceStatus::Running);
        registry.upsert(&rec).unwrap();

        registry.mark_stopped(&rec.instance_id).unwrap();
        registry.mark_stopped(&rec.instance_id).unwrap();
        registry.mark_stopped("bot-unknown-1").unwrap();

        let found = registry.find_by_instance(&rec.instance_id).unwrap().unwrap();
        assert_eq!(found.status, InstanceStatus::Stopped);
    }

    #[test]
    fn test_record_heartbeat_touches_only_heartbeat() {
        let registry = SqliteRegistry::open_in_memory().unwrap();
        let rec = record("0xabc123def456", 8101, InstanceStatus::Running);
        registry.upsert(&rec).unwrap();

        let beat = Utc::now();
        registry.record_heartbeat(&rec.instance_id, beat).unwrap();

        let found = registry.find_by_instance(&rec.instance_id).unwrap().unwrap();
        assert_eq!(found.status, InstanceStatus::Running);
        assert_eq!(
            found.last_heartbeat.map(|t| t.timestamp_millis()),
            Some(beat.timestamp_millis())
        );

        // Unknown instance is a no-op, not an error.
        registry.record_heartbeat("bot-unknown-1", beat).unwrap();
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/registry.db");
        let registry = SqliteRegistry::open(&path).unwrap();
        registry
            .upsert(&record("0xabc123def456", 8101, InstanceStatus::Running))
            .unwrap();
        assert!(path.exists());
    }
}
