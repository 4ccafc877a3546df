//! bothive-core - Bot-Instance Orchestrator Library
//!
//! This library spawns, tracks, and tears down one isolated trading-bot
//! process per owner identity on a shared host with a bounded pool of API
//! ports. Processes themselves are owned by an external process supervisor;
//! this crate drives it and reconciles three independently-consistent views
//! of the world: the supervisor's live process table, a durable instance
//! registry with heartbeat-based liveness, and an in-process cache.
//!
//! # Guarantees
//!
//! - At most one instance with status `starting` or `running` exists per
//!   identity at any time within one orchestrator process, and best-effort
//!   across restarts via the registry and supervisor checks.
//! - No two live instances share an API port; ports are probed against the
//!   host's listening-socket table before reservation, never trusted from
//!   memory alone.
//! - Every rejected spawn rolls back its partial reservations synchronously;
//!   callers never observe a reserved-but-unowned port.
//!
//! # Modules
//!
//! - [`config`]: TOML configuration (port range, heartbeat window, paths)
//! - [`instance`]: the `BotInstance` entity and its status state machine
//! - [`port`]: listening-socket prober and mutex-guarded port allocator
//! - [`registry`]: durable instance registry client (`SQLite` backend)
//! - [`supervisor`]: process-supervisor capability trait and CLI driver
//! - [`launch`]: spawn-request validation and launch descriptor building
//! - [`guard`]: three-source duplicate detection with priority merge
//! - [`lifecycle`]: instance state tracking and effective-status reporting
//! - [`teardown`]: idempotent, best-effort resource reclamation
//! - [`orchestrator`]: the facade wiring everything together

pub mod config;
pub mod error;
pub mod guard;
pub mod instance;
pub mod launch;
pub mod lifecycle;
pub mod orchestrator;
pub mod port;
pub mod registry;
pub mod supervisor;
pub mod teardown;

pub use config::{ConfigError, OrchestratorConfig};
pub use error::SpawnError;
pub use guard::{ActiveInstance, DuplicateGuard, GuardSource};
pub use instance::{BotInstance, EffectiveStatus, InstanceStatus, Network};
pub use launch::{LaunchDescriptor, RestartPolicy, SpawnRequest};
pub use lifecycle::{LifecycleError, LifecycleTracker};
pub use orchestrator::{InstanceSnapshot, Orchestrator};
pub use port::allocator::{NoPortsAvailable, PortAllocator};
pub use port::prober::{NetstatProber, PortProber};
pub use registry::sqlite::SqliteRegistry;
pub use registry::{InstanceRegistry, RegistryError, RegistryRecord};
pub use supervisor::command::CommandSupervisor;
pub use supervisor::{ProcessStatus, ProcessSupervisor, SupervisedProcess, SupervisorError};
pub use teardown::{TeardownCoordinator, TeardownReport, TeardownStep};
