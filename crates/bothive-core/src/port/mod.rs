//! Port probing and allocation.
//!
//! The prober answers "is this port bound by *anyone* on the host" from the
//! kernel's listening-socket table; the allocator layers an in-process
//! reservation set on top so two concurrent spawns inside one orchestrator
//! cannot race each other onto the same port. Reservations are memory-only:
//! after a restart, availability is re-derived entirely from the prober.

pub mod allocator;
pub mod prober;

pub use allocator::{NoPortsAvailable, PortAllocator};
pub use prober::{NetstatProber, PortProber};
