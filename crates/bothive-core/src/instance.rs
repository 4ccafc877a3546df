//! The `BotInstance` entity and its status state machine.
//!
//! # State Machine
//!
//! ```text
//!                  launch submitted              explicit stop /
//!                  successfully                  force cleanup
//!     ┌──────────┐                ┌─────────┐                ┌─────────┐
//!     │ Starting │───────────────►│ Running │───────────────►│ Stopped │
//!     └────┬─────┘                └─────────┘                └─────────┘
//!          │
//!          │ launch submission failed
//!          ▼
//!     ┌─────────┐
//!     │  Error  │
//!     └─────────┘
//! ```
//!
//! `Stopped` and `Error` are terminal: a new spawn creates a new instance
//! record, never resurrects an old one. A stale heartbeat does not transition
//! a record; it only demotes the *effective* status reported to callers to
//! [`EffectiveStatus::Offline`].

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Deployment target passed through to the launched process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Test deployment; no real funds at risk.
    #[default]
    Testnet,
    /// Production deployment.
    Mainnet,
}

impl Network {
    /// Returns the network name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Testnet => "testnet",
            Self::Mainnet => "mainnet",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown network name.
#[derive(Debug, Error)]
#[error("unknown network: {0}")]
pub struct ParseNetworkError(String);

impl FromStr for Network {
    type Err = ParseNetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "testnet" => Ok(Self::Testnet),
            "mainnet" => Ok(Self::Mainnet),
            other => Err(ParseNetworkError(other.to_string())),
        }
    }
}

/// Stored lifecycle status of an instance record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Port reserved, launch not yet acknowledged by the supervisor.
    Starting,
    /// Launch acknowledged; liveness is now the registry's heartbeat.
    Running,
    /// Explicitly stopped or cleaned up. Terminal.
    Stopped,
    /// Launch submission failed. Terminal.
    Error,
}

impl InstanceStatus {
    /// Returns the status name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    /// Whether this status holds a port reservation and blocks new spawns
    /// for the same identity.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    /// Whether this status is terminal for the record.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }

    /// Whether the state machine permits moving to `next`.
    ///
    /// `Starting` may move to any other state (`Stopped` covers an explicit
    /// stop that races the launch acknowledgment). `Running` may only stop.
    /// Terminal states permit nothing.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        match self {
            Self::Starting => matches!(next, Self::Running | Self::Stopped | Self::Error),
            Self::Running => matches!(next, Self::Stopped),
            Self::Stopped | Self::Error => false,
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown status name.
#[derive(Debug, Error)]
#[error("unknown instance status: {0}")]
pub struct ParseStatusError(String);

impl FromStr for InstanceStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "error" => Ok(Self::Error),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// Status as reported to callers, after heartbeat staleness is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectiveStatus {
    /// Launch in flight.
    Starting,
    /// Running with a fresh heartbeat.
    Running,
    /// Stored status says running but the heartbeat is absent or stale.
    Offline,
    /// Stopped.
    Stopped,
    /// Failed at launch.
    Error,
}

impl EffectiveStatus {
    /// Returns the status name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Offline => "offline",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for EffectiveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tracked bot instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotInstance {
    /// Opaque owner key (a wallet address in this deployment).
    pub identity: String,

    /// Derived identifier: shortened identity plus the assigned port.
    /// Stable for the lifetime of the instance, unique across instances,
    /// and used as the supervisor process tag.
    pub instance_id: String,

    /// Assigned API port, unique among active instances.
    pub api_port: u16,

    /// Deployment target, informational.
    pub network: Network,

    /// Stored lifecycle status.
    pub status: InstanceStatus,

    /// When the spawn request was accepted.
    pub created_at: DateTime<Utc>,

    /// Most recent liveness signal observed through the registry.
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl BotInstance {
    /// Create a new instance record in `Starting` state.
    #[must_use]
    pub fn new(identity: impl Into<String>, api_port: u16, network: Network) -> Self {
        let identity = identity.into();
        Self {
            instance_id: instance_tag(&identity, api_port),
            identity,
            api_port,
            network,
            status: InstanceStatus::Starting,
            created_at: Utc::now(),
            last_heartbeat: None,
        }
    }

    /// Whether the last heartbeat is within `window` of `now`.
    ///
    /// An absent heartbeat is never fresh.
    #[must_use]
    pub fn heartbeat_fresh(&self, window: chrono::Duration, now: DateTime<Utc>) -> bool {
        self.last_heartbeat
            .is_some_and(|beat| now.signed_duration_since(beat) <= window)
    }

    /// Status as reported to callers: `Running` with an absent or stale
    /// heartbeat demotes to `Offline`; everything else maps directly.
    #[must_use]
    pub fn effective_status(&self, window: chrono::Duration, now: DateTime<Utc>) -> EffectiveStatus {
        match self.status {
            InstanceStatus::Starting => EffectiveStatus::Starting,
            InstanceStatus::Running => {
                if self.heartbeat_fresh(window, now) {
                    EffectiveStatus::Running
                } else {
                    EffectiveStatus::Offline
                }
            }
            InstanceStatus::Stopped => EffectiveStatus::Stopped,
            InstanceStatus::Error => EffectiveStatus::Error,
        }
    }
}

/// Maximum characters of the identity carried into derived names.
const IDENTITY_STEM_LEN: usize = 8;

/// Last launch stamp handed out, for strict monotonicity within one
/// process. Two spawns in the same millisecond must still get distinct
/// instance ids.
static LAST_LAUNCH_STAMP: AtomicI64 = AtomicI64::new(0);

/// Millisecond launch stamp, strictly increasing within this process.
fn next_launch_stamp() -> i64 {
    let now = Utc::now().timestamp_millis();
    let prev = LAST_LAUNCH_STAMP
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(now.max(last + 1))
        })
        .unwrap_or(now);
    now.max(prev + 1)
}

/// Lowercase base-36 rendering, the compact form used in instance ids.
fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Shortened, filesystem- and tag-safe form of an identity.
///
/// Strips an optional `0x` prefix, lowercases, drops anything that is not
/// alphanumeric, and truncates to a fixed length.
#[must_use]
pub fn identity_stem(identity: &str) -> String {
    let trimmed = identity.strip_prefix("0x").unwrap_or(identity);
    trimmed
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .take(IDENTITY_STEM_LEN)
        .collect()
}

/// Tag prefix shared by every instance of one identity, used for
/// supervisor-side attribution.
#[must_use]
pub fn tag_stem(identity: &str) -> String {
    format!("bot-{}", identity_stem(identity))
}

/// Full instance identifier / supervisor process tag:
/// `bot-<stem>-<port>-<stamp>`.
///
/// The launch stamp makes a respawn of the same identity onto the same
/// port a distinct instance; the stem/port prefix keeps the tag
/// attributable to its owner.
#[must_use]
pub fn instance_tag(identity: &str, api_port: u16) -> String {
    let stamp = next_launch_stamp().unsigned_abs();
    format!("{}-{}-{}", tag_stem(identity), api_port, to_base36(stamp))
}

/// Parse the API port back out of an instance tag, if well-formed.
///
/// Tags are positional: `bot`, stem, port, stamp. The stem is alphanumeric
/// and never contains the separator.
#[must_use]
pub fn port_from_tag(tag: &str) -> Option<u16> {
    tag.split('-').nth(2)?.parse().ok()
}
