/// volmgr protocol and system constants.

/// Minimum node name length (RFC952/1035/1123 host name constraints)
pub const NODE_NAME_MINLEN: usize = 2;
/// Maximum node name length
pub const NODE_NAME_MAXLEN: usize = 255;
/// Maximum length of a single dot-separated node name label
pub const NODE_NAME_LABEL_MAXLEN: usize = 63;

/// Minimum resource name length
pub const RES_NAME_MINLEN: usize = 1;
/// Maximum resource name length (enough for a UUID string plus prefix)
pub const RES_NAME_MAXLEN: usize = 48;
/// Characters valid anywhere in a resource name besides letters and digits
pub const RES_NAME_VALID_CHARS: &str = "_";
/// Characters valid only inside a resource name (not leading/trailing)
pub const RES_NAME_VALID_INNER_CHARS: &str = "-";

/// Maximum volumes per resource
pub const MAX_RES_VOLS: u8 = 64;

/// Maximum device minor number
pub const MINOR_NR_MAX: u32 = 0xfffff;

/// Hard limit for the per-assignment fail counter
pub const FAIL_COUNT_HARD_LIMIT: u32 = 99;

/// Name of the control-volume resource
pub const CTRL_RES_NAME: &str = ".ctrlvol";

/// Node state flags
pub mod node_flags {
    /// Node is marked for removal, finalized by cleanup
    pub const REMOVE: u64 = 0x1;
    /// Storage pool information needs to be refreshed
    pub const UPD_POOL: u64 = 0x2;
    /// Node configuration needs to be re-applied
    pub const UPDATE: u64 = 0x4;
    /// Node carries a replica of the control volume
    pub const CTRL_VOL: u64 = 0x8;
    /// Node provides backing storage
    pub const STORAGE: u64 = 0x10;
    /// Node storage is managed outside of volmgr
    pub const EXTERNAL: u64 = 0x20;
}

/// Resource state flags
pub mod res_flags {
    /// Resource is marked for removal, finalized by cleanup
    pub const REMOVE: u64 = 0x1;
}

/// Volume state flags
pub mod vol_flags {
    /// Volume is marked for removal, finalized by cleanup
    pub const REMOVE: u64 = 0x1;
}

/// Assignment cstate/tstate flags
pub mod assg_flags {
    /// Resource is deployed on the node
    pub const DEPLOY: u64 = 0x1;
    /// Connections to peer replicas are established
    pub const CONNECT: u64 = 0x2;
    /// Client-only replica without local backing storage
    pub const DISKLESS: u64 = 0x4;
    /// Peer set changed, connections need to be re-evaluated
    pub const UPD_CON: u64 = 0x8;
    /// Drop and re-establish connections
    pub const RECONNECT: u64 = 0x10;
    /// This replica's data overwrites all peers on initial sync
    pub const OVERWRITE: u64 = 0x20;
    /// This replica's data is discarded in favor of a peer on sync
    pub const DISCARD: u64 = 0x40;
    /// Replication configuration needs to be rewritten
    pub const UPD_CONFIG: u64 = 0x80;
    /// Replica is kept passive
    pub const STANDBY: u64 = 0x100;
    /// Quorum state of the replica is ignored
    pub const QIGNORE: u64 = 0x200;
}

/// Volume-state cstate/tstate flags
pub mod vol_state_flags {
    /// Backing storage for the volume is allocated on the node
    pub const DEPLOY: u64 = 0x1;
    /// The volume is attached to the replication device
    pub const ATTACH: u64 = 0x2;
}
