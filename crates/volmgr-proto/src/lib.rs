//! # volmgr-proto
//!
//! Entity model, state flags, error codes, and constants shared by all
//! volmgr components.
//!
//! This crate defines the cluster graph (nodes, resources, volumes,
//! assignments, volume states), the typed state bitmasks used for
//! current-state/target-state tracking, the fixed return-code enumeration,
//! and the free-id allocation and name validation helpers.

pub mod assignment;
pub mod cluster;
pub mod constants;
pub mod defaults;
pub mod error;
pub mod flags;
pub mod ident;
pub mod node;
pub mod resource;

// Re-export commonly used types at the crate root
pub use assignment::{Assignment, BlockDeviceRef, VolumeState};
pub use cluster::{AssignmentKey, ClusterState};
pub use error::{DmError, DmResult};
pub use flags::FlagSet;
pub use node::{AddressFamily, Node};
pub use resource::{MinorNr, Resource, Volume};
