/// Cluster member nodes.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{DmError, DmResult};
use crate::flags::FlagSet;
use crate::ident::check_node_name;

/// Address family of a node's network address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    pub const IPV4_LABEL: &'static str = "ipv4";
    pub const IPV6_LABEL: &'static str = "ipv6";

    /// Parse the configuration label ("ipv4" / "ipv6").
    pub fn from_label(label: &str) -> DmResult<Self> {
        match label {
            Self::IPV4_LABEL => Ok(Self::Ipv4),
            Self::IPV6_LABEL => Ok(Self::Ipv6),
            _ => Err(DmError::IpType),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Ipv4 => Self::IPV4_LABEL,
            Self::Ipv6 => Self::IPV6_LABEL,
        }
    }
}

impl Default for AddressFamily {
    fn default() -> Self {
        Self::Ipv4
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Pool size/free value meaning "not yet known".
pub const POOL_UNKNOWN: i64 = -1;

/// A volmgr cluster member node.
///
/// The state word is mutated through the flag operations only; the
/// remaining fields are fixed at registration except for the storage pool
/// figures, which the storage plugin refreshes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    name: String,
    addr: String,
    addr_family: AddressFamily,
    state: FlagSet,
    poolsize: i64,
    poolfree: i64,
}

impl Node {
    /// Register a node. Fails with a naming error if `name` violates the
    /// host name constraints.
    pub fn new(name: &str, addr: &str, addr_family: AddressFamily) -> DmResult<Self> {
        check_node_name(name)?;
        Ok(Self {
            name: name.to_string(),
            addr: addr.to_string(),
            addr_family,
            state: FlagSet::empty(),
            poolsize: POOL_UNKNOWN,
            poolfree: POOL_UNKNOWN,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn addr_family(&self) -> AddressFamily {
        self.addr_family
    }

    pub fn state(&self) -> FlagSet {
        self.state
    }

    pub fn set_state_flags(&mut self, mask: u64) {
        self.state.set(mask);
    }

    pub fn clear_state_flags(&mut self, mask: u64) {
        self.state.clear(mask);
    }

    /// Restore the raw state word (persistence load only).
    pub fn restore_state(&mut self, state: FlagSet) {
        self.state = state;
    }

    pub fn poolsize(&self) -> i64 {
        self.poolsize
    }

    pub fn poolfree(&self) -> i64 {
        self.poolfree
    }

    /// Record refreshed storage pool figures (kiB; -1 = unknown).
    pub fn set_pool_info(&mut self, poolsize: i64, poolfree: i64) {
        self.poolsize = poolsize;
        self.poolfree = poolfree;
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.name, self.addr_family, self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_validates_name() {
        assert!(Node::new("alice", "10.0.0.1", AddressFamily::Ipv4).is_ok());
        assert_eq!(
            Node::new("(unknown)", "10.0.0.1", AddressFamily::Ipv4),
            Err(DmError::InvalidName)
        );
    }

    #[test]
    fn test_pool_starts_unknown() {
        let node = Node::new("alice", "10.0.0.1", AddressFamily::Ipv4).unwrap();
        assert_eq!(node.poolsize(), POOL_UNKNOWN);
        assert_eq!(node.poolfree(), POOL_UNKNOWN);
    }

    #[test]
    fn test_addr_family_labels() {
        assert_eq!(AddressFamily::from_label("ipv4"), Ok(AddressFamily::Ipv4));
        assert_eq!(AddressFamily::from_label("ipv6"), Ok(AddressFamily::Ipv6));
        assert_eq!(AddressFamily::from_label("ipx"), Err(DmError::IpType));
    }
}
