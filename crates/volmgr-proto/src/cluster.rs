/// The in-memory cluster configuration graph.
///
/// `ClusterState` owns the node, resource and assignment catalogues and the
/// relations between them. Assignments are stored once, keyed by
/// (node, resource), so the per-node and per-resource views can never
/// disagree.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::assignment::{Assignment, VolumeState};
use crate::constants::{assg_flags, node_flags, res_flags, vol_flags, vol_state_flags};
use crate::error::{DmError, DmResult};
use crate::node::Node;
use crate::resource::Resource;

/// Identifies an assignment: one resource deployed on one node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssignmentKey {
    pub node: String,
    pub resource: String,
}

impl AssignmentKey {
    pub fn new(node: &str, resource: &str) -> Self {
        Self {
            node: node.to_string(),
            resource: resource.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterState {
    nodes: BTreeMap<String, Node>,
    resources: BTreeMap<String, Resource>,
    assignments: BTreeMap<AssignmentKey, Assignment>,
}

impl ClusterState {
    pub fn new() -> Self {
        Self::default()
    }

    // ─── Nodes ───

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn node_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.nodes.get_mut(name)
    }

    pub fn add_node(&mut self, node: Node) -> DmResult<()> {
        if self.nodes.contains_key(node.name()) {
            return Err(DmError::Exists);
        }
        self.nodes.insert(node.name().to_string(), node);
        Ok(())
    }

    pub fn remove_node(&mut self, name: &str) -> Option<Node> {
        self.nodes.remove(name)
    }

    pub fn iter_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn iter_nodes_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.values_mut()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    // ─── Resources ───

    pub fn resource(&self, name: &str) -> Option<&Resource> {
        self.resources.get(name)
    }

    pub fn resource_mut(&mut self, name: &str) -> Option<&mut Resource> {
        self.resources.get_mut(name)
    }

    pub fn add_resource(&mut self, resource: Resource) -> DmResult<()> {
        if self.resources.contains_key(resource.name()) {
            return Err(DmError::Exists);
        }
        self.resources.insert(resource.name().to_string(), resource);
        Ok(())
    }

    pub fn remove_resource(&mut self, name: &str) -> Option<Resource> {
        self.resources.remove(name)
    }

    pub fn iter_resources(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    pub fn iter_resources_mut(&mut self) -> impl Iterator<Item = &mut Resource> {
        self.resources.values_mut()
    }

    // ─── Assignments ───

    pub fn assignment(&self, node: &str, resource: &str) -> Option<&Assignment> {
        self.assignments.get(&AssignmentKey::new(node, resource))
    }

    pub fn assignment_mut(&mut self, node: &str, resource: &str) -> Option<&mut Assignment> {
        self.assignments.get_mut(&AssignmentKey::new(node, resource))
    }

    /// Register an assignment. The referenced node and resource must exist.
    pub fn add_assignment(&mut self, assignment: Assignment) -> DmResult<()> {
        if !self.nodes.contains_key(assignment.node()) {
            return Err(DmError::NotFound);
        }
        if !self.resources.contains_key(assignment.resource()) {
            return Err(DmError::NotFound);
        }
        let key = AssignmentKey::new(assignment.node(), assignment.resource());
        if self.assignments.contains_key(&key) {
            return Err(DmError::Exists);
        }
        self.assignments.insert(key, assignment);
        Ok(())
    }

    pub fn remove_assignment(&mut self, node: &str, resource: &str) -> Option<Assignment> {
        self.assignments.remove(&AssignmentKey::new(node, resource))
    }

    pub fn iter_assignments(&self) -> impl Iterator<Item = &Assignment> {
        self.assignments.values()
    }

    pub fn iter_assignments_mut(&mut self) -> impl Iterator<Item = &mut Assignment> {
        self.assignments.values_mut()
    }

    pub fn assignments_of_node<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a Assignment> {
        self.assignments.values().filter(move |a| a.node() == node)
    }

    pub fn assignments_of_resource<'a>(
        &'a self,
        resource: &'a str,
    ) -> impl Iterator<Item = &'a Assignment> {
        self.assignments
            .values()
            .filter(move |a| a.resource() == resource)
    }

    /// Node ids currently taken by assignments of a resource.
    pub fn occupied_node_ids(&self, resource: &str) -> Vec<u64> {
        self.assignments_of_resource(resource)
            .map(|a| u64::from(a.node_id()))
            .collect()
    }

    /// Number of assignments of a resource that are or will become replicas,
    /// counting both deployed and deployment-pending ones.
    pub fn deployed_count(&self, resource: &str) -> usize {
        self.assignments_of_resource(resource)
            .filter(|a| {
                a.cstate().is_set(assg_flags::DEPLOY) || a.tstate().is_set(assg_flags::DEPLOY)
            })
            .count()
    }

    /// Grant one assignment the right to overwrite peer data. The flag is
    /// exclusive per resource; peers only lose it, their tstate is otherwise
    /// untouched.
    pub fn set_overwrite(&mut self, node: &str, resource: &str) -> DmResult<()> {
        if self.assignment(node, resource).is_none() {
            return Err(DmError::NotFound);
        }
        for assignment in self.assignments.values_mut() {
            if assignment.resource() != resource {
                continue;
            }
            if assignment.node() == node {
                assignment.clear_tstate_flags(assg_flags::DISCARD);
                assignment.set_tstate_flags(assg_flags::OVERWRITE);
            } else {
                assignment.clear_tstate_flags(assg_flags::OVERWRITE);
            }
        }
        Ok(())
    }

    /// Align the volume states of every assignment of a resource with the
    /// resource's current volume set. New volumes get a state record marked
    /// for deployment wherever the assignment itself is to be deployed;
    /// records for vanished volumes are dropped.
    pub fn update_volume_states(&mut self, resource: &str) {
        let vol_ids: Vec<u8> = match self.resources.get(resource) {
            Some(res) => res.iter_volumes().map(|v| v.id()).collect(),
            None => return,
        };
        for assignment in self.assignments.values_mut() {
            if assignment.resource() != resource {
                continue;
            }
            let deploying = assignment.tstate().is_set(assg_flags::DEPLOY);
            for &vol_id in &vol_ids {
                if assignment.volume_state(vol_id).is_none() {
                    let mut vol_state = VolumeState::new(vol_id);
                    if deploying {
                        vol_state.deploy();
                        vol_state.attach();
                    }
                    assignment.add_volume_state(vol_state);
                }
            }
            let stale: Vec<u8> = assignment
                .volume_state_ids()
                .into_iter()
                .filter(|id| !vol_ids.contains(id))
                .collect();
            for vol_id in stale {
                assignment.remove_volume_state(vol_id);
            }
        }
    }

    /// Garbage-collect objects whose removal has completed.
    ///
    /// Four sweeps, each building on the previous one: undeployed
    /// assignments; nodes marked for removal with no assignments left;
    /// undeployed volume state records; and finally volumes marked for
    /// removal that nothing deploys anymore, plus resources marked for
    /// removal with no assignments left. Idempotent.
    pub fn cleanup(&mut self) {
        // Sweep 1: drop assignments that are neither deployed nor wanted.
        self.assignments.retain(|_, a| !a.is_gone());

        // Sweep 2: drop nodes marked for removal with no assignments left.
        let assignments = &self.assignments;
        self.nodes.retain(|name, node| {
            !(node.state().is_set(node_flags::REMOVE)
                && !assignments.values().any(|a| a.node() == name))
        });

        // Sweep 3: drop volume state records that are neither deployed nor
        // wanted.
        for assignment in self.assignments.values_mut() {
            let gone: Vec<u8> = assignment
                .iter_volume_states()
                .filter(|vs| {
                    vs.cstate().is_clear(vol_state_flags::DEPLOY)
                        && vs.tstate().is_clear(vol_state_flags::DEPLOY)
                })
                .map(|vs| vs.vol_id())
                .collect();
            for vol_id in gone {
                assignment.remove_volume_state(vol_id);
            }
        }

        // Sweep 4: drop volumes marked for removal that no volume state
        // still deploys, then resources marked for removal that have no
        // assignments left.
        let removed_vols: Vec<(String, Vec<u8>)> = self
            .resources
            .values()
            .map(|res| {
                let ids = res
                    .iter_volumes()
                    .filter(|v| v.state().is_set(vol_flags::REMOVE))
                    .map(|v| v.id())
                    .collect();
                (res.name().to_string(), ids)
            })
            .collect();
        for (res_name, vol_ids) in &removed_vols {
            for &vol_id in vol_ids {
                let deployed = self.assignments.values().any(|a| {
                    a.resource() == res_name.as_str()
                        && a.volume_state(vol_id).map(|vs| vs.is_deployed()).unwrap_or(false)
                });
                if !deployed {
                    if let Some(res) = self.resources.get_mut(res_name) {
                        res.remove_volume(vol_id);
                    }
                }
            }
        }
        let assignments = &self.assignments;
        self.resources.retain(|name, res| {
            !(res.state().is_set(res_flags::REMOVE)
                && !assignments.values().any(|a| a.resource() == name))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::FlagSet;
    use crate::node::AddressFamily;
    use crate::resource::{MinorNr, Volume};

    fn sample_state() -> ClusterState {
        let mut cstate = ClusterState::new();
        cstate
            .add_node(Node::new("alice", "10.0.0.1", AddressFamily::Ipv4).unwrap())
            .unwrap();
        cstate
            .add_node(Node::new("bob", "10.0.0.2", AddressFamily::Ipv4).unwrap())
            .unwrap();
        let mut res = Resource::new("r0", 7000).unwrap();
        res.add_volume(Volume::new(0, 1024, MinorNr::new(100).unwrap()).unwrap())
            .unwrap();
        cstate.add_resource(res).unwrap();
        cstate
            .add_assignment(Assignment::new(
                "alice",
                "r0",
                0,
                FlagSet::empty(),
                FlagSet::from_bits(assg_flags::DEPLOY),
            ))
            .unwrap();
        cstate
            .add_assignment(Assignment::new(
                "bob",
                "r0",
                1,
                FlagSet::empty(),
                FlagSet::from_bits(assg_flags::DEPLOY),
            ))
            .unwrap();
        cstate.update_volume_states("r0");
        cstate
    }

    #[test]
    fn test_add_duplicate_rejected() {
        let mut cstate = sample_state();
        let err = cstate
            .add_node(Node::new("alice", "10.0.0.9", AddressFamily::Ipv4).unwrap())
            .unwrap_err();
        assert!(matches!(err, DmError::Exists));
        let err = cstate
            .add_assignment(Assignment::new(
                "alice",
                "r0",
                2,
                FlagSet::empty(),
                FlagSet::empty(),
            ))
            .unwrap_err();
        assert!(matches!(err, DmError::Exists));
    }

    #[test]
    fn test_assignment_requires_endpoints() {
        let mut cstate = sample_state();
        let err = cstate
            .add_assignment(Assignment::new(
                "charlie",
                "r0",
                2,
                FlagSet::empty(),
                FlagSet::empty(),
            ))
            .unwrap_err();
        assert!(matches!(err, DmError::NotFound));
    }

    #[test]
    fn test_overwrite_exclusive() {
        let mut cstate = sample_state();
        cstate.set_overwrite("alice", "r0").unwrap();
        cstate.set_overwrite("bob", "r0").unwrap();
        let alice = cstate.assignment("alice", "r0").unwrap();
        let bob = cstate.assignment("bob", "r0").unwrap();
        assert!(alice.tstate().is_clear(assg_flags::OVERWRITE));
        assert!(bob.tstate().is_set(assg_flags::OVERWRITE));
        assert!(bob.tstate().is_clear(assg_flags::DISCARD));
    }

    #[test]
    fn test_overwrite_leaves_peer_tstate_untouched() {
        let mut cstate = sample_state();
        cstate.set_overwrite("alice", "r0").unwrap();
        let bob = cstate.assignment("bob", "r0").unwrap();
        assert!(bob.tstate().is_clear(assg_flags::OVERWRITE));
        // Losing the flag must not schedule a data discard on the peer.
        assert!(bob.tstate().is_clear(assg_flags::DISCARD));
    }

    #[test]
    fn test_update_volume_states_adds_and_drops() {
        let mut cstate = sample_state();
        cstate
            .resource_mut("r0")
            .unwrap()
            .add_volume(Volume::new(1, 2048, MinorNr::new(101).unwrap()).unwrap())
            .unwrap();
        cstate.update_volume_states("r0");
        let alice = cstate.assignment("alice", "r0").unwrap();
        let vol_state = alice.volume_state(1).unwrap();
        assert!(vol_state.tstate().is_set(vol_state_flags::DEPLOY));

        cstate.resource_mut("r0").unwrap().remove_volume(1);
        cstate.update_volume_states("r0");
        assert!(cstate
            .assignment("alice", "r0")
            .unwrap()
            .volume_state(1)
            .is_none());
    }

    #[test]
    fn test_cleanup_collects_finished_removal() {
        let mut cstate = sample_state();
        // Undeploy everything and mark the whole graph for removal.
        for assignment in cstate.iter_assignments_mut() {
            assignment.undeploy();
        }
        cstate.resource_mut("r0").unwrap().remove();
        cstate.node_mut("alice").unwrap().set_state_flags(node_flags::REMOVE);
        cstate.cleanup();
        assert!(cstate.assignment("alice", "r0").is_none());
        assert!(cstate.resource("r0").is_none());
        assert!(cstate.node("alice").is_none());
        // bob was not marked for removal and stays.
        assert!(cstate.node("bob").is_some());
    }

    #[test]
    fn test_cleanup_keeps_deployed_objects() {
        let mut cstate = sample_state();
        for assignment in cstate.iter_assignments_mut() {
            assignment.set_cstate_flags(assg_flags::DEPLOY);
            for vol_state in assignment.iter_volume_states_mut() {
                vol_state.set_cstate_flags(vol_state_flags::DEPLOY);
            }
        }
        cstate.resource_mut("r0").unwrap().remove();
        cstate.cleanup();
        // Still deployed, so nothing may disappear yet.
        assert!(cstate.resource("r0").is_some());
        assert_eq!(cstate.iter_assignments().count(), 2);
    }

    #[test]
    fn test_cleanup_idempotent() {
        let mut cstate = sample_state();
        for assignment in cstate.iter_assignments_mut() {
            assignment.undeploy();
        }
        cstate.resource_mut("r0").unwrap().remove();
        cstate.cleanup();
        let nodes: Vec<String> = cstate.iter_nodes().map(|n| n.name().to_string()).collect();
        cstate.cleanup();
        let nodes_again: Vec<String> = cstate.iter_nodes().map(|n| n.name().to_string()).collect();
        assert_eq!(nodes, nodes_again);
        assert!(cstate.resource("r0").is_none());
    }
}
