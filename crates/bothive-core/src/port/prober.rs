//! Listening-socket probing.
//!
//! Binding-and-releasing a candidate port is not a reliable probe: a
//! privileged process may hold the port in a way an unprivileged bind test
//! cannot see, and the bind itself can race the real consumer. Instead the
//! prober reads the kernel's socket tables (`/proc/net/tcp` and
//! `/proc/net/tcp6`, the same source `netstat` uses) and looks for a LISTEN
//! row on the candidate port.
//!
//! # Table Format
//!
//! ```text
//!   sl  local_address rem_address   st tx_queue rx_queue ...
//!    0: 0100007F:1FA5 00000000:0000 0A 00000000:00000000 ...
//! ```
//!
//! `local_address` is hex `ip:port`; `st` is the socket state, `0A` being
//! LISTEN.
//!
//! Probing fails closed: if the table cannot be read or parsed, the port is
//! reported as bound. Reporting a free port as bound wastes one candidate;
//! reporting a bound port as free hands two processes the same socket.

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

use tracing::{debug, warn};

/// Socket state code for LISTEN in the kernel tables.
const STATE_LISTEN: &str = "0A";

/// Maximum bytes read from one socket table (1 MiB).
///
/// A LISTEN-heavy host has hundreds of rows at ~150 bytes each; a table
/// larger than this is not something we should be slurping on every probe.
const MAX_TABLE_BYTES: u64 = 1024 * 1024;

/// Capability for checking whether a port is bound on the host.
pub trait PortProber: Send + Sync {
    /// Whether any process currently listens on `port`.
    ///
    /// Implementations must fail closed: when the answer cannot be
    /// determined, return `true`.
    fn is_bound(&self, port: u16) -> bool;
}

/// One socket table to scan.
#[derive(Debug, Clone)]
struct TableSource {
    path: PathBuf,
    /// Absence of an optional table (no IPv6 on the host) is not a probe
    /// failure; absence of a required one is.
    required: bool,
}

/// Production prober backed by the kernel socket tables.
#[derive(Debug)]
pub struct NetstatProber {
    tables: Vec<TableSource>,
}

impl Default for NetstatProber {
    fn default() -> Self {
        Self::new()
    }
}

impl NetstatProber {
    /// Prober over `/proc/net/tcp` (required) and `/proc/net/tcp6`
    /// (optional).
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: vec![
                TableSource {
                    path: PathBuf::from("/proc/net/tcp"),
                    required: true,
                },
                TableSource {
                    path: PathBuf::from("/proc/net/tcp6"),
                    required: false,
                },
            ],
        }
    }

    /// Prober over explicit table files. The first is treated as required,
    /// the rest as optional. Used by tests and non-standard mounts.
    #[must_use]
    pub fn with_table_paths(paths: Vec<PathBuf>) -> Self {
        let tables = paths
            .into_iter()
            .enumerate()
            .map(|(i, path)| TableSource {
                path,
                required: i == 0,
            })
            .collect();
        Self { tables }
    }

    /// Scan one table for a LISTEN row on `port`.
    fn table_has_listener(source: &TableSource, port: u16) -> Result<bool, ProbeFailure> {
        let file = match File::open(&source.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound && !source.required => {
                debug!(path = %source.path.display(), "optional socket table absent");
                return Ok(false);
            }
            Err(err) => {
                return Err(ProbeFailure {
                    path: source.path.display().to_string(),
                    reason: err.to_string(),
                });
            }
        };

        let mut content = String::new();
        file.take(MAX_TABLE_BYTES)
            .read_to_string(&mut content)
            .map_err(|err| ProbeFailure {
                path: source.path.display().to_string(),
                reason: err.to_string(),
            })?;

        for line in content.lines().skip(1) {
            let entry = parse_row(line).ok_or_else(|| ProbeFailure {
                path: source.path.display().to_string(),
                reason: format!("unparseable row: {line:.80}"),
            })?;
            if entry.state == STATE_LISTEN && entry.port == port {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl PortProber for NetstatProber {
    fn is_bound(&self, port: u16) -> bool {
        for source in &self.tables {
            match Self::table_has_listener(source, port) {
                Ok(true) => return true,
                Ok(false) => {}
                Err(failure) => {
                    warn!(
                        path = %failure.path,
                        reason = %failure.reason,
                        port,
                        "socket table probe failed; treating port as bound"
                    );
                    return true;
                }
            }
        }
        false
    }
}

struct ProbeFailure {
    path: String,
    reason: String,
}

struct SocketRow {
    port: u16,
    state: String,
}

/// Parse one data row of a kernel socket table.
fn parse_row(line: &str) -> Option<SocketRow> {
    let mut fields = line.split_whitespace();
    let _sl = fields.next()?;
    let local = fields.next()?;
    let _remote = fields.next()?;
    let state = fields.next()?;

    let (_addr, port_hex) = local.rsplit_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;

    Some(SocketRow {
        port,
        state: state.to_string(),
    })
}
