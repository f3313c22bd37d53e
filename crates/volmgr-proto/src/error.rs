/// volmgr error types.
///
/// Every operation on the cluster control surface reports its outcome as
/// one code from a fixed enumeration (success = 0). The codes are stable
/// across versions because clients and peer nodes match on the numeric
/// value.

use serde::{Deserialize, Serialize};

/// Unified error type for all volmgr operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum DmError {
    #[error("invalid name")]
    InvalidName,
    #[error("object not found")]
    NotFound,
    #[error("object already exists")]
    Exists,
    #[error("invalid address family")]
    IpType,
    #[error("minor number out of range or no free minor numbers")]
    MinorNr,
    #[error("volume size out of range")]
    VolSize,
    #[error("invalid option")]
    InvalidOption,
    #[error("I/O error while accessing persistent configuration storage")]
    Persistence,
    #[error("invalid node id or no free node id number")]
    NodeId,
    #[error("invalid volume id or no free volume id number")]
    VolId,
    #[error("invalid port number or no free port numbers")]
    PortNr,
    #[error("the storage subsystem failed to perform the requested operation")]
    Storage,
    #[error("not enough free space")]
    NoSpace,
    #[error("deployment node count exceeds the number of nodes in the cluster")]
    NodeCount,
    #[error("plugin cannot be loaded")]
    Plugin,
    #[error("generation of the shared secret failed")]
    SecretGen,
    #[error("reconfiguring the control volume failed")]
    CtrlVol,
    #[error("debug exception / internal error")]
    Debug,
    #[error("function not implemented")]
    NotImplemented,
}

/// Return code reported for successful operations.
pub const DM_SUCCESS: u32 = 0;

impl DmError {
    /// Convert to the stable numeric return code.
    pub fn to_code(self) -> u32 {
        match self {
            Self::InvalidName => 100,
            Self::NotFound => 101,
            Self::Exists => 102,
            Self::IpType => 103,
            Self::MinorNr => 104,
            Self::VolSize => 105,
            Self::InvalidOption => 106,
            Self::Persistence => 107,
            Self::NodeId => 108,
            Self::VolId => 109,
            Self::PortNr => 110,
            Self::Storage => 111,
            Self::NoSpace => 112,
            Self::NodeCount => 113,
            Self::Plugin => 114,
            Self::SecretGen => 115,
            Self::CtrlVol => 116,
            Self::Debug => 1023,
            Self::NotImplemented => 0x7fff_ffff,
        }
    }

    /// Convert from a raw return code. `DM_SUCCESS` maps to `None`.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => None,
            100 => Some(Self::InvalidName),
            101 => Some(Self::NotFound),
            102 => Some(Self::Exists),
            103 => Some(Self::IpType),
            104 => Some(Self::MinorNr),
            105 => Some(Self::VolSize),
            106 => Some(Self::InvalidOption),
            107 => Some(Self::Persistence),
            108 => Some(Self::NodeId),
            109 => Some(Self::VolId),
            110 => Some(Self::PortNr),
            111 => Some(Self::Storage),
            112 => Some(Self::NoSpace),
            113 => Some(Self::NodeCount),
            114 => Some(Self::Plugin),
            115 => Some(Self::SecretGen),
            116 => Some(Self::CtrlVol),
            0x7fff_ffff => Some(Self::NotImplemented),
            _ => Some(Self::Debug),
        }
    }
}

/// Result type alias for volmgr operations.
pub type DmResult<T> = Result<T, DmError>;

/// Numeric return code for an operation result.
pub fn result_code(result: &DmResult<()>) -> u32 {
    match result {
        Ok(()) => DM_SUCCESS,
        Err(err) => err.to_code(),
    }
}

impl From<std::io::Error> for DmError {
    fn from(_: std::io::Error) -> Self {
        DmError::Persistence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip() {
        for err in [
            DmError::InvalidName,
            DmError::NotFound,
            DmError::Exists,
            DmError::Persistence,
            DmError::Storage,
            DmError::NodeCount,
            DmError::Plugin,
            DmError::Debug,
            DmError::NotImplemented,
        ] {
            assert_eq!(DmError::from_code(err.to_code()), Some(err));
        }
    }

    #[test]
    fn test_success_code() {
        assert_eq!(result_code(&Ok(())), DM_SUCCESS);
        assert_eq!(DmError::from_code(DM_SUCCESS), None);
    }

    #[test]
    fn test_unknown_code_is_debug() {
        assert_eq!(DmError::from_code(9999), Some(DmError::Debug));
    }
}
