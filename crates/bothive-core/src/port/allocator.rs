//! Port allocation over a fixed range.
//!
//! The allocator scans the configured range in ascending order and reserves
//! the first port that is neither reserved in-process nor bound on the host.
//! The reservation set exists only to serialize concurrent spawns inside one
//! orchestrator process; it is lost on restart, which is safe because the
//! prober re-derives host-level availability on every scan.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tracing::debug;

use super::prober::PortProber;

/// Returned when every port in the range is bound or reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no free ports in range {min_port}-{max_port}")]
pub struct NoPortsAvailable {
    /// Low end of the scanned range (inclusive).
    pub min_port: u16,
    /// High end of the scanned range (inclusive).
    pub max_port: u16,
}

/// Mutex-guarded port reservations over `[min_port, max_port]`.
pub struct PortAllocator {
    min_port: u16,
    max_port: u16,
    prober: Arc<dyn PortProber>,
    reserved: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    /// Create an allocator over the inclusive range `[min_port, max_port]`.
    #[must_use]
    pub fn new(min_port: u16, max_port: u16, prober: Arc<dyn PortProber>) -> Self {
        Self {
            min_port,
            max_port,
            prober,
            reserved: Mutex::new(HashSet::new()),
        }
    }

    /// Reserve the lowest free port in the range.
    ///
    /// The scan and the reservation happen under one lock so two concurrent
    /// callers cannot be handed the same port.
    ///
    /// # Errors
    ///
    /// Returns [`NoPortsAvailable`] only after the full range has been
    /// scanned without a candidate.
    pub fn allocate(&self) -> Result<u16, NoPortsAvailable> {
        let mut reserved = self.reserved.lock().unwrap_or_else(PoisonError::into_inner);
        for port in self.min_port..=self.max_port {
            if reserved.contains(&port) {
                continue;
            }
            if self.prober.is_bound(port) {
                debug!(port, "candidate port bound on host, skipping");
                continue;
            }
            reserved.insert(port);
            debug!(port, "reserved API port");
            return Ok(port);
        }
        Err(NoPortsAvailable {
            min_port: self.min_port,
            max_port: self.max_port,
        })
    }

    /// Release a reservation. Safe to call for ports that were never
    /// reserved or were already released.
    pub fn release(&self, port: u16) {
        let mut reserved = self.reserved.lock().unwrap_or_else(PoisonError::into_inner);
        if reserved.remove(&port) {
            debug!(port, "released API port");
        }
    }

    /// Whether `port` is currently reserved in-process.
    #[must_use]
    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&port)
    }

    /// Number of in-process reservations.
    #[must_use]
    pub fn reserved_count(&self) -> usize {
        self.reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
