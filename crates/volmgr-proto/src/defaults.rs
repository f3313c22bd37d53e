//! Tunable operational defaults for volmgr.
//!
//! Fixed protocol-level values (name constraints, flag bits, the on-disk
//! layout) live in [`crate::constants`] and the persistence layer. This
//! module centralizes the defaults that can be overridden through the
//! server configuration file.

// ─── Identifier Allocation ──────────────────────────────────────────────────

/// Highest node id assignable within one resource (node ids run 0..=max).
pub const DEFAULT_MAX_NODE_ID: u32 = 31;

/// Default maximum number of peer replicas per resource.
pub const DEFAULT_MAX_PEERS: u32 = 7;

/// Lowest device minor number handed out by auto-allocation.
pub const DEFAULT_MIN_MINOR_NR: u32 = 100;

/// Lowest network port handed out by auto-allocation.
pub const DEFAULT_MIN_PORT_NR: u16 = 7000;

/// Highest network port handed out by auto-allocation.
pub const DEFAULT_MAX_PORT_NR: u16 = 7999;

// ─── Secrets ────────────────────────────────────────────────────────────────

/// Shared secret used for resources when none is configured.
pub const DEFAULT_SECRET: &str = "default";

// ─── Persistence ────────────────────────────────────────────────────────────

/// Default path of the control-volume store on the control device.
pub const DEFAULT_STORE_PATH: &str = "/var/lib/volmgr/volmgr.bin";

/// Maximum attempts to open the control-volume store.
pub const STORE_OPEN_MAX_ATTEMPTS: u32 = 10;

/// Fixed part of the delay between store open attempts (milliseconds).
/// A random fraction of a second is added on top of this.
pub const STORE_OPEN_RETRY_BASE_MS: u64 = 500;

// ─── Server ─────────────────────────────────────────────────────────────────

/// Default path of the server configuration file.
pub const DEFAULT_CONF_PATH: &str = "/etc/volmgrd.cfg";

/// Default storage plugin name resolved through the registry.
pub const DEFAULT_STORAGE_PLUGIN: &str = "memory";

/// Default deployment-selection plugin name.
pub const DEFAULT_DEPLOYER_PLUGIN: &str = "balanced";

/// Default directory searched for the replication utilities.
pub const DEFAULT_UTIL_PATH: &str = "/usr/sbin";

// ─── Event Feed ─────────────────────────────────────────────────────────────

/// Utility spawned to follow the replication event log.
pub const DEFAULT_EVENTS_UTIL: &str = "drbdsetup";

/// Fixed delay between attempts to restart a broken event feed (seconds).
pub const EVENTS_RESTART_INTERVAL_SECS: u64 = 30;
