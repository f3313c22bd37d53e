/// Assignments and per-volume deployment state.
///
/// An assignment is the deployment of one resource onto one node. It holds
/// the two state words the reconciliation engine converges: `cstate`
/// (observed/applied) and `tstate` (desired). One `VolumeState` per volume
/// of the resource tracks backing-storage allocation and attachment.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::constants::{assg_flags, vol_state_flags, FAIL_COUNT_HARD_LIMIT};
use crate::flags::FlagSet;

/// Reference to an allocated backing block device (name + device path).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDeviceRef {
    pub name: String,
    pub path: String,
}

/// Per-assignment, per-volume deployment status record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeState {
    vol_id: u8,
    cstate: FlagSet,
    tstate: FlagSet,
    blockdevice: Option<BlockDeviceRef>,
}

impl VolumeState {
    pub fn new(vol_id: u8) -> Self {
        Self {
            vol_id,
            cstate: FlagSet::empty(),
            tstate: FlagSet::empty(),
            blockdevice: None,
        }
    }

    pub fn vol_id(&self) -> u8 {
        self.vol_id
    }

    pub fn cstate(&self) -> FlagSet {
        self.cstate
    }

    pub fn tstate(&self) -> FlagSet {
        self.tstate
    }

    /// Request backing storage for the volume on the node.
    pub fn deploy(&mut self) {
        self.tstate.set(vol_state_flags::DEPLOY);
    }

    /// Request release of the volume's backing storage.
    pub fn undeploy(&mut self) {
        self.tstate.clear(vol_state_flags::DEPLOY | vol_state_flags::ATTACH);
    }

    /// Request attachment of the volume to the replication device.
    pub fn attach(&mut self) {
        self.tstate.set(vol_state_flags::ATTACH);
    }

    /// Request detachment of the volume.
    pub fn detach(&mut self) {
        self.tstate.clear(vol_state_flags::ATTACH);
    }

    pub fn is_deployed(&self) -> bool {
        self.cstate.is_set(vol_state_flags::DEPLOY)
    }

    pub fn blockdevice(&self) -> Option<&BlockDeviceRef> {
        self.blockdevice.as_ref()
    }

    pub fn set_blockdevice(&mut self, name: &str, path: &str) {
        self.blockdevice = Some(BlockDeviceRef {
            name: name.to_string(),
            path: path.to_string(),
        });
    }

    pub fn clear_blockdevice(&mut self) {
        self.blockdevice = None;
    }

    /// Reconciliation engine only: record observed state.
    pub fn set_cstate_flags(&mut self, mask: u64) {
        self.cstate.set(mask);
    }

    /// Reconciliation engine only: record observed state.
    pub fn clear_cstate_flags(&mut self, mask: u64) {
        self.cstate.clear(mask);
    }

    /// Restore the raw state words (persistence load only).
    pub fn restore_states(&mut self, cstate: FlagSet, tstate: FlagSet) {
        self.cstate = cstate;
        self.tstate = tstate;
    }
}

/// The deployment of one resource onto one node.
///
/// Nodes and resources are referenced by name; the graph in
/// [`crate::cluster::ClusterState`] resolves them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    node: String,
    resource: String,
    node_id: u32,
    cstate: FlagSet,
    tstate: FlagSet,
    blockdevice: Option<BlockDeviceRef>,
    rc: u32,
    fail_count: u32,
    vol_states: BTreeMap<u8, VolumeState>,
}

impl Assignment {
    pub fn new(node: &str, resource: &str, node_id: u32, cstate: FlagSet, tstate: FlagSet) -> Self {
        Self {
            node: node.to_string(),
            resource: resource.to_string(),
            node_id,
            cstate,
            tstate,
            blockdevice: None,
            rc: 0,
            fail_count: 0,
            vol_states: BTreeMap::new(),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    pub fn cstate(&self) -> FlagSet {
        self.cstate
    }

    pub fn tstate(&self) -> FlagSet {
        self.tstate
    }

    /// Deployed from the point of view of observed state.
    pub fn is_deployed(&self) -> bool {
        self.cstate.is_set(assg_flags::DEPLOY)
    }

    /// Neither observed nor desired state wants the deployment; the
    /// assignment is garbage and may be collected.
    pub fn is_gone(&self) -> bool {
        self.cstate.is_clear(assg_flags::DEPLOY) && self.tstate.is_clear(assg_flags::DEPLOY)
    }

    /// Request deployment of the resource on the node.
    pub fn deploy(&mut self) {
        self.tstate.set(assg_flags::DEPLOY);
    }

    /// Request undeployment: the resource and all of its volumes are to be
    /// withdrawn from the node.
    pub fn undeploy(&mut self) {
        self.tstate = FlagSet::empty();
        for vol_state in self.vol_states.values_mut() {
            vol_state.undeploy();
        }
    }

    /// Request connections to peer replicas.
    pub fn connect(&mut self) {
        self.tstate.set(assg_flags::CONNECT);
    }

    /// Request a full drop-and-reconnect cycle.
    pub fn reconnect(&mut self) {
        self.tstate.set(assg_flags::RECONNECT);
    }

    /// Request that connections to peer replicas be torn down.
    pub fn disconnect(&mut self) {
        self.tstate.clear(assg_flags::CONNECT);
    }

    /// Mark the peer set as changed; the reconciliation engine adjusts the
    /// connections and clears the mark.
    pub fn update_connections(&mut self) {
        self.tstate.set(assg_flags::UPD_CON);
    }

    pub fn set_tstate_flags(&mut self, mask: u64) {
        self.tstate.set(mask);
    }

    pub fn clear_tstate_flags(&mut self, mask: u64) {
        self.tstate.clear(mask);
    }

    /// Reconciliation engine only: record observed state.
    pub fn set_cstate_flags(&mut self, mask: u64) {
        self.cstate.set(mask);
    }

    /// Reconciliation engine only: record observed state.
    pub fn clear_cstate_flags(&mut self, mask: u64) {
        self.cstate.clear(mask);
    }

    pub fn blockdevice(&self) -> Option<&BlockDeviceRef> {
        self.blockdevice.as_ref()
    }

    pub fn set_blockdevice(&mut self, name: &str, path: &str) {
        self.blockdevice = Some(BlockDeviceRef {
            name: name.to_string(),
            path: path.to_string(),
        });
    }

    /// Result code of the last reconciliation attempt.
    pub fn rc(&self) -> u32 {
        self.rc
    }

    pub fn set_rc(&mut self, rc: u32) {
        self.rc = rc;
    }

    pub fn fail_count(&self) -> u32 {
        self.fail_count
    }

    /// Count a failed reconciliation attempt, saturating at the hard limit.
    pub fn increase_fail_count(&mut self) {
        if self.fail_count < FAIL_COUNT_HARD_LIMIT {
            self.fail_count += 1;
        }
    }

    pub fn clear_fail_count(&mut self) {
        self.fail_count = 0;
    }

    /// Restore the counters (persistence load only).
    pub fn restore_counters(&mut self, rc: u32, fail_count: u32) {
        self.rc = rc;
        self.fail_count = fail_count.min(FAIL_COUNT_HARD_LIMIT);
    }

    pub fn volume_state(&self, vol_id: u8) -> Option<&VolumeState> {
        self.vol_states.get(&vol_id)
    }

    pub fn volume_state_mut(&mut self, vol_id: u8) -> Option<&mut VolumeState> {
        self.vol_states.get_mut(&vol_id)
    }

    pub fn add_volume_state(&mut self, vol_state: VolumeState) {
        self.vol_states.insert(vol_state.vol_id(), vol_state);
    }

    pub fn remove_volume_state(&mut self, vol_id: u8) -> Option<VolumeState> {
        self.vol_states.remove(&vol_id)
    }

    /// Iterate volume states in ascending volume-id order.
    pub fn iter_volume_states(&self) -> impl Iterator<Item = &VolumeState> {
        self.vol_states.values()
    }

    pub fn iter_volume_states_mut(&mut self) -> impl Iterator<Item = &mut VolumeState> {
        self.vol_states.values_mut()
    }

    pub fn volume_state_ids(&self) -> Vec<u8> {
        self.vol_states.keys().copied().collect()
    }
}

impl fmt::Display for Assignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} (id={}, cstate={}, tstate={})",
            self.node, self.resource, self.node_id, self.cstate, self.tstate
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_undeploy_clears_volume_states() {
        let mut assg = Assignment::new(
            "alice",
            "r0",
            0,
            FlagSet::empty(),
            FlagSet::from_bits(assg_flags::DEPLOY | assg_flags::CONNECT),
        );
        let mut vol_state = VolumeState::new(0);
        vol_state.deploy();
        vol_state.attach();
        assg.add_volume_state(vol_state);

        assg.undeploy();
        assert!(assg.tstate().is_clear(assg_flags::DEPLOY));
        let vol_state = assg.volume_state(0).unwrap();
        assert!(vol_state.tstate().is_clear(vol_state_flags::DEPLOY));
        assert!(vol_state.tstate().is_clear(vol_state_flags::ATTACH));
    }

    #[test]
    fn test_fail_count_cap() {
        let mut assg = Assignment::new("alice", "r0", 0, FlagSet::empty(), FlagSet::empty());
        for _ in 0..200 {
            assg.increase_fail_count();
        }
        assert_eq!(assg.fail_count(), FAIL_COUNT_HARD_LIMIT);
        assg.clear_fail_count();
        assert_eq!(assg.fail_count(), 0);
    }

    #[test]
    fn test_is_gone() {
        let mut assg = Assignment::new(
            "alice",
            "r0",
            0,
            FlagSet::empty(),
            FlagSet::from_bits(assg_flags::DEPLOY),
        );
        assert!(!assg.is_gone());
        assg.undeploy();
        assert!(assg.is_gone());
        assg.set_cstate_flags(assg_flags::DEPLOY);
        assert!(!assg.is_gone());
    }
}
