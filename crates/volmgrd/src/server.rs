//! The cluster control surface.
//!
//! Every mutating operation follows the same transaction discipline:
//! open the control store writable, reload the graph if another cluster
//! member saved a newer snapshot (detected by digest comparison), apply
//! the in-memory mutation, run a reconciliation pass, and persist the new
//! snapshot, recording its digest. The store handle is dropped on every
//! path, success or failure, which closes the file.
//!
//! Cross-node concurrency is optimistic: there is no compare-and-swap on
//! the write-back, so the last writer wins between the reload and the
//! save.

use std::path::PathBuf;

use serde::Serialize;
use tracing::{debug, info, warn};

use volmgr_proto::assignment::{Assignment, VolumeState};
use volmgr_proto::cluster::ClusterState;
use volmgr_proto::constants::{assg_flags, node_flags, MAX_RES_VOLS, MINOR_NR_MAX};
use volmgr_proto::error::{DmError, DmResult};
use volmgr_proto::flags::FlagSet;
use volmgr_proto::ident::get_free_number;
use volmgr_proto::node::{AddressFamily, Node};
use volmgr_proto::resource::{MinorNr, Resource, Volume};

use crate::config::ServerConf;
use crate::deployer::{create_deployer, Deployer};
use crate::persistence::{ControlStore, HASH_LEN};
use crate::reconcile::{self, ResCtl};
use crate::storage::BlockDeviceManager;

pub struct Server {
    conf: ServerConf,
    node_name: String,
    store_path: PathBuf,
    graph: ClusterState,
    last_hash: Option<[u8; HASH_LEN]>,
    bd_mgr: BlockDeviceManager,
    deployer: Box<dyn Deployer>,
    res_ctl: Box<dyn ResCtl>,
}

impl Server {
    /// Resolve the configured plugins and build the server context. Fails
    /// fast on an unresolvable plugin name.
    pub fn new(conf: ServerConf, node_name: &str, res_ctl: Box<dyn ResCtl>) -> DmResult<Self> {
        let bd_mgr = BlockDeviceManager::new(conf.storage_plugin())?;
        let deployer = create_deployer(conf.deployer_plugin())?;
        let store_path = PathBuf::from(conf.store_path());
        Ok(Self {
            conf,
            node_name: node_name.to_string(),
            store_path,
            graph: ClusterState::new(),
            last_hash: None,
            bd_mgr,
            deployer,
            res_ctl,
        })
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn graph(&self) -> &ClusterState {
        &self.graph
    }

    // ─── Transaction discipline ─────────────────────────────────────────────

    /// Open the store writable and bring the in-memory graph up to date
    /// when another member saved a newer snapshot.
    async fn begin_modify_conf(&mut self) -> DmResult<ControlStore> {
        let mut store = ControlStore::open(&self.store_path, true).await?;
        let stored = store.get_stored_hash()?;
        if self.last_hash != Some(stored) {
            if self.last_hash.is_some() {
                info!("control store was modified by another member, reloading");
            }
            let (graph, report) = store.load()?;
            if report.errors {
                warn!("control store reload skipped unreadable records");
            }
            self.graph = graph;
            self.last_hash = Some(stored);
        }
        Ok(store)
    }

    /// Persist the graph and record the digest of the new snapshot.
    fn save_conf_data(&mut self, store: &mut ControlStore) -> DmResult<()> {
        store.save(&self.graph)?;
        self.last_hash = Some(store.get_stored_hash()?);
        Ok(())
    }

    async fn run_changes(&mut self) -> bool {
        reconcile::perform_changes(
            &mut self.graph,
            &self.node_name,
            &mut self.bd_mgr,
            self.res_ctl.as_ref(),
        )
        .await
    }

    /// Run one full transaction around a sync mutation without a
    /// reconciliation pass.
    async fn transact(
        &mut self,
        mutate: impl FnOnce(&mut Self) -> DmResult<()>,
    ) -> DmResult<()> {
        let mut store = self.begin_modify_conf().await?;
        mutate(self)?;
        self.save_conf_data(&mut store)
    }

    /// Like [`Self::transact`], with a reconciliation pass between the
    /// mutation and the save.
    async fn transact_and_converge(
        &mut self,
        mutate: impl FnOnce(&mut Self) -> DmResult<()>,
    ) -> DmResult<()> {
        let mut store = self.begin_modify_conf().await?;
        mutate(self)?;
        self.run_changes().await;
        self.save_conf_data(&mut store)
    }

    // ─── Node operations ────────────────────────────────────────────────────

    pub async fn create_node(
        &mut self,
        name: &str,
        addr: &str,
        addr_family: &str,
    ) -> DmResult<()> {
        let family = AddressFamily::from_label(addr_family)?;
        self.transact(|srv| {
            let node = Node::new(name, addr, family)?;
            srv.graph.add_node(node)?;
            info!("created node '{}' ({})", name, addr);
            Ok(())
        })
        .await
    }

    /// Withdraw and soft-delete a node. Without `force` each assignment is
    /// undeployed first and the node lingers REMOVE-flagged until cleanup;
    /// with `force` the assignments are dropped on the spot.
    pub async fn remove_node(&mut self, name: &str, force: bool) -> DmResult<()> {
        self.transact_and_converge(|srv| {
            if srv.graph.node(name).is_none() {
                return Err(DmError::NotFound);
            }
            let resources: Vec<String> = srv
                .graph
                .assignments_of_node(name)
                .map(|a| a.resource().to_string())
                .collect();
            if resources.is_empty() {
                srv.graph.remove_node(name);
                info!("removed node '{}'", name);
                return Ok(());
            }
            if force {
                for res_name in &resources {
                    srv.graph.remove_assignment(name, res_name);
                    srv.update_peer_connections(res_name, name);
                }
                srv.graph.remove_node(name);
                info!("force-removed node '{}'", name);
                return Ok(());
            }
            for res_name in &resources {
                if let Some(assignment) = srv.graph.assignment_mut(name, res_name) {
                    assignment.undeploy();
                }
                srv.update_peer_connections(res_name, name);
            }
            if let Some(node) = srv.graph.node_mut(name) {
                node.set_state_flags(node_flags::REMOVE);
            }
            info!("marked node '{}' for removal", name);
            Ok(())
        })
        .await
    }

    // ─── Resource operations ────────────────────────────────────────────────

    pub async fn create_resource(
        &mut self,
        name: &str,
        port: Option<u16>,
        secret: Option<&str>,
    ) -> DmResult<()> {
        self.transact(|srv| {
            if srv.graph.resource(name).is_some() {
                return Err(DmError::Exists);
            }
            let port = srv.allocate_port(port, None)?;
            let mut res = Resource::new(name, port)?;
            res.set_secret(secret.unwrap_or(srv.conf.secret()));
            srv.graph.add_resource(res)?;
            info!("created resource '{}' (port {})", name, port);
            Ok(())
        })
        .await
    }

    /// Change a resource's port or secret. Peer assignments are marked for
    /// a connection update so the running configuration follows.
    pub async fn modify_resource(
        &mut self,
        name: &str,
        port: Option<u16>,
        secret: Option<&str>,
    ) -> DmResult<()> {
        self.transact_and_converge(|srv| {
            if srv.graph.resource(name).is_none() {
                return Err(DmError::NotFound);
            }
            let new_port = match port {
                Some(p) => Some(srv.allocate_port(Some(p), Some(name))?),
                None => None,
            };
            let res = srv.graph.resource_mut(name).ok_or(DmError::NotFound)?;
            if let Some(p) = new_port {
                res.set_port(p);
            }
            if let Some(s) = secret {
                res.set_secret(s);
            }
            let assigned: Vec<String> = srv
                .graph
                .assignments_of_resource(name)
                .map(|a| a.node().to_string())
                .collect();
            for node in assigned {
                if let Some(assignment) = srv.graph.assignment_mut(&node, name) {
                    assignment.set_tstate_flags(assg_flags::UPD_CONFIG);
                    assignment.update_connections();
                }
            }
            info!("modified resource '{}'", name);
            Ok(())
        })
        .await
    }

    pub async fn remove_resource(&mut self, name: &str, force: bool) -> DmResult<()> {
        self.transact_and_converge(|srv| {
            if srv.graph.resource(name).is_none() {
                return Err(DmError::NotFound);
            }
            let nodes: Vec<String> = srv
                .graph
                .assignments_of_resource(name)
                .map(|a| a.node().to_string())
                .collect();
            if nodes.is_empty() {
                srv.graph.remove_resource(name);
                info!("removed resource '{}'", name);
                return Ok(());
            }
            if force {
                for node in &nodes {
                    srv.graph.remove_assignment(node, name);
                }
                srv.graph.remove_resource(name);
                info!("force-removed resource '{}'", name);
                return Ok(());
            }
            for node in &nodes {
                if let Some(assignment) = srv.graph.assignment_mut(node, name) {
                    assignment.undeploy();
                }
            }
            if let Some(res) = srv.graph.resource_mut(name) {
                res.remove();
            }
            info!("marked resource '{}' for removal", name);
            Ok(())
        })
        .await
    }

    // ─── Volume operations ──────────────────────────────────────────────────

    /// Create a volume inside a resource, auto-allocating the minor number
    /// and volume id unless given explicitly. Returns the volume id.
    pub async fn create_volume(
        &mut self,
        res_name: &str,
        size_kib: u64,
        minor: Option<u32>,
    ) -> DmResult<u8> {
        let mut store = self.begin_modify_conf().await?;
        let vol_id = self.create_volume_impl(res_name, size_kib, minor)?;
        self.run_changes().await;
        self.save_conf_data(&mut store)?;
        Ok(vol_id)
    }

    fn create_volume_impl(
        &mut self,
        res_name: &str,
        size_kib: u64,
        minor: Option<u32>,
    ) -> DmResult<u8> {
        if self.graph.resource(res_name).is_none() {
            return Err(DmError::NotFound);
        }
        let minor = self.allocate_minor(minor)?;
        let used_ids: Vec<u64> = self
            .graph
            .resource(res_name)
            .map(|res| res.iter_volumes().map(|v| u64::from(v.id())).collect())
            .unwrap_or_default();
        let vol_id = get_free_number(0, u64::from(MAX_RES_VOLS), &used_ids)
            .ok_or(DmError::VolId)? as u8;
        let volume = Volume::new(vol_id, size_kib, minor)?;
        let res = self.graph.resource_mut(res_name).ok_or(DmError::NotFound)?;
        res.add_volume(volume)?;
        self.graph.update_volume_states(res_name);
        info!(
            "created volume {}/{} ({} kiB, minor {})",
            res_name,
            vol_id,
            size_kib,
            minor.value()
        );
        Ok(vol_id)
    }

    pub async fn remove_volume(
        &mut self,
        res_name: &str,
        vol_id: u8,
        force: bool,
    ) -> DmResult<()> {
        self.transact_and_converge(|srv| {
            let res = srv.graph.resource_mut(res_name).ok_or(DmError::NotFound)?;
            if res.volume(vol_id).is_none() {
                return Err(DmError::NotFound);
            }
            if force {
                res.remove_volume(vol_id);
                let nodes: Vec<String> = srv
                    .graph
                    .assignments_of_resource(res_name)
                    .map(|a| a.node().to_string())
                    .collect();
                for node in nodes {
                    if let Some(assignment) = srv.graph.assignment_mut(&node, res_name) {
                        assignment.remove_volume_state(vol_id);
                    }
                }
                info!("force-removed volume {}/{}", res_name, vol_id);
                return Ok(());
            }
            if let Some(vol) = res.volume_mut(vol_id) {
                vol.remove();
            }
            let nodes: Vec<String> = srv
                .graph
                .assignments_of_resource(res_name)
                .map(|a| a.node().to_string())
                .collect();
            for node in nodes {
                if let Some(assignment) = srv.graph.assignment_mut(&node, res_name) {
                    if let Some(vol_state) = assignment.volume_state_mut(vol_id) {
                        vol_state.undeploy();
                    }
                }
            }
            info!("marked volume {}/{} for removal", res_name, vol_id);
            Ok(())
        })
        .await
    }

    // ─── Assignments ────────────────────────────────────────────────────────

    /// Create an assignment. `cstate` is normally zero; a non-zero value
    /// imports an already-deployed state, e.g. when adopting existing
    /// storage.
    pub async fn assign(
        &mut self,
        node: &str,
        res_name: &str,
        cstate: u64,
        tstate: u64,
    ) -> DmResult<()> {
        self.transact_and_converge(|srv| srv.assign_impl(node, res_name, cstate, tstate))
            .await
    }

    fn assign_impl(
        &mut self,
        node: &str,
        res_name: &str,
        cstate: u64,
        tstate: u64,
    ) -> DmResult<()> {
        if self.graph.node(node).is_none() || self.graph.resource(res_name).is_none() {
            return Err(DmError::NotFound);
        }
        if self.graph.assignment(node, res_name).is_some() {
            return Err(DmError::Exists);
        }
        let ts = FlagSet::from_bits(tstate);
        if ts.is_set(assg_flags::OVERWRITE)
            && (ts.is_set(assg_flags::DISKLESS) || ts.is_set(assg_flags::DISCARD))
        {
            return Err(DmError::InvalidOption);
        }
        let occupied = self.graph.occupied_node_ids(res_name);
        let node_id = get_free_number(0, u64::from(self.conf.max_node_id()), &occupied)
            .ok_or(DmError::NodeId)? as u32;

        let mut assignment =
            Assignment::new(node, res_name, node_id, FlagSet::from_bits(cstate), ts);
        let vol_ids: Vec<u8> = self
            .graph
            .resource(res_name)
            .map(|res| res.iter_volumes().map(|v| v.id()).collect())
            .unwrap_or_default();
        for vol_id in vol_ids {
            let mut vol_state = VolumeState::new(vol_id);
            vol_state.deploy();
            if !ts.is_set(assg_flags::DISKLESS) {
                vol_state.attach();
            }
            assignment.add_volume_state(vol_state);
        }
        self.graph.add_assignment(assignment)?;
        if ts.is_set(assg_flags::OVERWRITE) {
            self.graph.set_overwrite(node, res_name)?;
        }
        self.update_peer_connections(res_name, node);
        info!("assigned '{}' to '{}' (node id {})", res_name, node, node_id);
        Ok(())
    }

    /// Withdraw an assignment. Without `force` the teardown is graceful:
    /// disconnect first, then undeploy, leaving the record for cleanup.
    pub async fn unassign(&mut self, node: &str, res_name: &str, force: bool) -> DmResult<()> {
        self.transact_and_converge(|srv| {
            if srv.graph.assignment(node, res_name).is_none() {
                return Err(DmError::NotFound);
            }
            if force {
                srv.graph.remove_assignment(node, res_name);
            } else if let Some(assignment) = srv.graph.assignment_mut(node, res_name) {
                assignment.disconnect();
                assignment.undeploy();
            }
            srv.update_peer_connections(res_name, node);
            info!("unassigned '{}' from '{}'", res_name, node);
            Ok(())
        })
        .await
    }

    /// Deployed peers of a resource may need to drop or add a connection
    /// after the assignment set changed.
    fn update_peer_connections(&mut self, res_name: &str, skip_node: &str) {
        for assignment in self.graph.iter_assignments_mut() {
            if assignment.resource() == res_name
                && assignment.node() != skip_node
                && assignment.tstate().is_set(assg_flags::DEPLOY)
            {
                assignment.update_connections();
            }
        }
    }

    // ─── Automatic deployment ───────────────────────────────────────────────

    /// Deploy a resource onto `count` plugin-selected nodes.
    pub async fn auto_deploy(&mut self, res_name: &str, count: usize) -> DmResult<()> {
        let mut store = self.begin_modify_conf().await?;
        if self.graph.resource(res_name).is_none() {
            return Err(DmError::NotFound);
        }
        if self.graph.assignments_of_resource(res_name).next().is_some() {
            return Err(DmError::Exists);
        }
        if count == 0 || count > self.conf.max_peers() as usize {
            return Err(DmError::NodeCount);
        }
        let selected = self.select_deploy_targets(res_name, count, &[]).await?;
        for node in &selected {
            self.assign_impl(node, res_name, 0, assg_flags::DEPLOY | assg_flags::CONNECT)?;
        }
        self.run_changes().await;
        self.save_conf_data(&mut store)
    }

    /// Extend a deployment to more nodes. `count` is additional when
    /// `relative`, otherwise the absolute target replica count.
    pub async fn auto_extend(
        &mut self,
        res_name: &str,
        count: usize,
        relative: bool,
    ) -> DmResult<()> {
        let mut store = self.begin_modify_conf().await?;
        if self.graph.resource(res_name).is_none() {
            return Err(DmError::NotFound);
        }
        let current = self.graph.deployed_count(res_name);
        let target = if relative { current + count } else { count };
        if target <= current {
            return Err(DmError::InvalidOption);
        }
        if target > self.conf.max_peers() as usize {
            return Err(DmError::NodeCount);
        }
        let assigned: Vec<String> = self
            .graph
            .assignments_of_resource(res_name)
            .map(|a| a.node().to_string())
            .collect();
        let selected = self
            .select_deploy_targets(res_name, target - current, &assigned)
            .await?;
        for node in &selected {
            self.assign_impl(node, res_name, 0, assg_flags::DEPLOY | assg_flags::CONNECT)?;
        }
        self.run_changes().await;
        self.save_conf_data(&mut store)
    }

    /// Shrink a deployment. Assignments that are not yet fully deployed
    /// are withdrawn first, avoiding storage churn; the plugin then picks
    /// among the fully-deployed remainder.
    pub async fn auto_reduce(
        &mut self,
        res_name: &str,
        count: usize,
        relative: bool,
    ) -> DmResult<()> {
        let mut store = self.begin_modify_conf().await?;
        if self.graph.resource(res_name).is_none() {
            return Err(DmError::NotFound);
        }
        let current = self.graph.deployed_count(res_name);
        let target = if relative {
            current.saturating_sub(count)
        } else {
            count
        };
        if target >= current || target == 0 {
            return Err(DmError::InvalidOption);
        }
        let mut excess = current - target;

        let pending: Vec<String> = self
            .graph
            .assignments_of_resource(res_name)
            .filter(|a| {
                a.tstate().is_set(assg_flags::DEPLOY) && a.cstate().is_clear(assg_flags::DEPLOY)
            })
            .map(|a| a.node().to_string())
            .collect();
        for node in pending.iter().take(excess) {
            if let Some(assignment) = self.graph.assignment_mut(node, res_name) {
                assignment.undeploy();
            }
            self.update_peer_connections(res_name, node);
        }
        excess = excess.saturating_sub(pending.len());

        if excess > 0 {
            let deployed: Vec<String> = self
                .graph
                .assignments_of_resource(res_name)
                .filter(|a| a.cstate().is_set(assg_flags::DEPLOY))
                .map(|a| a.node().to_string())
                .collect();
            let candidates: Vec<&Node> = deployed
                .iter()
                .filter_map(|name| self.graph.node(name))
                .collect();
            let victims = self.deployer.undeploy_select(&candidates, excess)?;
            for node in &victims {
                if let Some(assignment) = self.graph.assignment_mut(node, res_name) {
                    assignment.disconnect();
                    assignment.undeploy();
                }
                self.update_peer_connections(res_name, node);
            }
        }
        self.run_changes().await;
        self.save_conf_data(&mut store)
    }

    /// Withdraw a resource from every node it is assigned to. Without
    /// `force` each assignment goes through the graceful teardown.
    pub async fn auto_undeploy(&mut self, res_name: &str, force: bool) -> DmResult<()> {
        self.transact_and_converge(|srv| {
            if srv.graph.resource(res_name).is_none() {
                return Err(DmError::NotFound);
            }
            let nodes: Vec<String> = srv
                .graph
                .assignments_of_resource(res_name)
                .map(|a| a.node().to_string())
                .collect();
            for node in &nodes {
                if force {
                    srv.graph.remove_assignment(node, res_name);
                } else if let Some(assignment) = srv.graph.assignment_mut(node, res_name) {
                    assignment.disconnect();
                    assignment.undeploy();
                }
            }
            info!("undeploying '{}' from {} node(s)", res_name, nodes.len());
            Ok(())
        })
        .await
    }

    /// Refresh the candidates' pool figures and let the deployer pick.
    async fn select_deploy_targets(
        &mut self,
        res_name: &str,
        count: usize,
        exclude: &[String],
    ) -> DmResult<Vec<String>> {
        let size_kib = self
            .graph
            .resource(res_name)
            .map(|res| res.size_sum_kib())
            .unwrap_or(0);
        let candidate_names: Vec<String> = self
            .graph
            .iter_nodes()
            .filter(|node| node.state().is_clear(node_flags::REMOVE))
            .filter(|node| !exclude.contains(&node.name().to_string()))
            .map(|node| node.name().to_string())
            .collect();
        for name in &candidate_names {
            if let Some(node) = self.graph.node_mut(name) {
                self.bd_mgr.update_pool(node).await?;
            }
        }
        let candidates: Vec<&Node> = candidate_names
            .iter()
            .filter_map(|name| self.graph.node(name))
            .collect();
        self.deployer.deploy_select(&candidates, count, size_kib)
    }

    // ─── State manipulation ─────────────────────────────────────────────────

    /// Apply clear-then-set masks to an assignment's state words. OVERWRITE
    /// and DISCARD are mutually exclusive; when both are requested in the
    /// same call OVERWRITE wins and forces DISCARD off. Setting OVERWRITE
    /// clears it on every peer of the resource.
    pub async fn modify_state(
        &mut self,
        node: &str,
        res_name: &str,
        cstate_clear: u64,
        cstate_set: u64,
        tstate_clear: u64,
        tstate_set: u64,
    ) -> DmResult<()> {
        self.transact_and_converge(|srv| {
            let mut tset = tstate_set;
            if tset & assg_flags::OVERWRITE != 0 {
                tset &= !assg_flags::DISCARD;
            }
            {
                let assignment = srv
                    .graph
                    .assignment_mut(node, res_name)
                    .ok_or(DmError::NotFound)?;
                assignment.clear_cstate_flags(cstate_clear);
                assignment.set_cstate_flags(cstate_set);
                assignment.clear_tstate_flags(tstate_clear);
                assignment.set_tstate_flags(tset);
                if tset & assg_flags::OVERWRITE != 0 {
                    assignment.clear_tstate_flags(assg_flags::DISCARD);
                } else if tset & assg_flags::DISCARD != 0 {
                    assignment.clear_tstate_flags(assg_flags::OVERWRITE);
                }
            }
            if tset & assg_flags::OVERWRITE != 0 {
                srv.graph.set_overwrite(node, res_name)?;
            }
            Ok(())
        })
        .await
    }

    pub async fn connect(&mut self, node: &str, res_name: &str, reconnect: bool) -> DmResult<()> {
        self.transact_and_converge(|srv| {
            let assignment = srv
                .graph
                .assignment_mut(node, res_name)
                .ok_or(DmError::NotFound)?;
            if reconnect {
                assignment.reconnect();
            }
            assignment.connect();
            Ok(())
        })
        .await
    }

    pub async fn disconnect(&mut self, node: &str, res_name: &str) -> DmResult<()> {
        self.transact_and_converge(|srv| {
            let assignment = srv
                .graph
                .assignment_mut(node, res_name)
                .ok_or(DmError::NotFound)?;
            assignment.disconnect();
            Ok(())
        })
        .await
    }

    pub async fn attach(&mut self, node: &str, res_name: &str, vol_id: u8) -> DmResult<()> {
        self.transact_and_converge(|srv| {
            let assignment = srv
                .graph
                .assignment_mut(node, res_name)
                .ok_or(DmError::NotFound)?;
            let vol_state = assignment.volume_state_mut(vol_id).ok_or(DmError::VolId)?;
            vol_state.attach();
            Ok(())
        })
        .await
    }

    pub async fn detach(&mut self, node: &str, res_name: &str, vol_id: u8) -> DmResult<()> {
        self.transact_and_converge(|srv| {
            let assignment = srv
                .graph
                .assignment_mut(node, res_name)
                .ok_or(DmError::NotFound)?;
            let vol_state = assignment.volume_state_mut(vol_id).ok_or(DmError::VolId)?;
            vol_state.detach();
            Ok(())
        })
        .await
    }

    // ─── Maintenance ────────────────────────────────────────────────────────

    /// Refresh this node's pool size/free figures from the storage backend.
    pub async fn update_pool(&mut self) -> DmResult<()> {
        let mut store = self.begin_modify_conf().await?;
        let node = self
            .graph
            .node_mut(&self.node_name)
            .ok_or(DmError::NotFound)?;
        self.bd_mgr.update_pool(node).await?;
        node.clear_state_flags(node_flags::UPD_POOL);
        self.save_conf_data(&mut store)
    }

    /// Finalize completed soft-deletes.
    pub async fn cleanup(&mut self) -> DmResult<()> {
        self.transact(|srv| {
            srv.graph.cleanup();
            Ok(())
        })
        .await
    }

    /// Persist the current in-memory graph unconditionally.
    pub async fn save_conf(&mut self) -> DmResult<()> {
        let mut store = ControlStore::open(&self.store_path, true).await?;
        self.save_conf_data(&mut store)
    }

    /// Replace the in-memory graph with the persisted snapshot.
    pub async fn load_conf(&mut self) -> DmResult<()> {
        let mut store = ControlStore::open(&self.store_path, false).await?;
        let (graph, report) = store.load()?;
        if report.errors {
            warn!("control store load skipped unreadable records");
        }
        self.graph = graph;
        self.last_hash = Some(store.get_stored_hash()?);
        Ok(())
    }

    /// Reload the configuration and re-resolve the plugins.
    pub async fn reconfigure(&mut self, conf: ServerConf) -> DmResult<()> {
        let bd_mgr = BlockDeviceManager::new(conf.storage_plugin())?;
        let deployer = create_deployer(conf.deployer_plugin())?;
        self.bd_mgr = bd_mgr;
        self.deployer = deployer;
        self.store_path = PathBuf::from(conf.store_path());
        self.conf = conf;
        self.bd_mgr.reconfigure(&self.conf).await?;
        info!("reconfigured (storage '{}')", self.bd_mgr.plugin_name());
        Ok(())
    }

    /// Bring already-deployed local resources up after a restart, then run
    /// one convergence pass.
    pub async fn initial_up(&mut self) -> DmResult<()> {
        self.load_conf().await?;
        reconcile::initial_up(&self.graph, &self.node_name, self.res_ctl.as_ref()).await;
        let mut store = ControlStore::open(&self.store_path, true).await?;
        self.run_changes().await;
        self.save_conf_data(&mut store)
    }

    /// A peer wrote the control volume: reload and converge.
    pub async fn react_to_peer_change(&mut self) -> DmResult<()> {
        let mut store = self.begin_modify_conf().await?;
        if self.run_changes().await {
            self.save_conf_data(&mut store)?;
        }
        debug!("peer change pass complete");
        Ok(())
    }

    // ─── Free-id lookups ────────────────────────────────────────────────────

    pub fn get_free_minor_nr(&self) -> DmResult<u32> {
        self.allocate_minor(None).map(|m| m.value())
    }

    pub fn get_free_port_nr(&self) -> DmResult<u16> {
        self.allocate_port(None, None)
    }

    pub fn get_free_node_id(&self, res_name: &str) -> DmResult<u32> {
        if self.graph.resource(res_name).is_none() {
            return Err(DmError::NotFound);
        }
        let occupied = self.graph.occupied_node_ids(res_name);
        get_free_number(0, u64::from(self.conf.max_node_id()), &occupied)
            .map(|id| id as u32)
            .ok_or(DmError::NodeId)
    }

    pub fn get_free_volume_id(&self, res_name: &str) -> DmResult<u8> {
        let res = self.graph.resource(res_name).ok_or(DmError::NotFound)?;
        let used: Vec<u64> = res.iter_volumes().map(|v| u64::from(v.id())).collect();
        get_free_number(0, u64::from(MAX_RES_VOLS), &used)
            .map(|id| id as u8)
            .ok_or(DmError::VolId)
    }

    fn allocate_port(&self, requested: Option<u16>, own_resource: Option<&str>) -> DmResult<u16> {
        let min = self.conf.min_port_nr();
        let max = self.conf.max_port_nr();
        let used: Vec<u64> = self
            .graph
            .iter_resources()
            .filter(|res| own_resource != Some(res.name()))
            .map(|res| u64::from(res.port()))
            .collect();
        match requested {
            Some(port) => {
                if port < min || port > max || used.contains(&u64::from(port)) {
                    Err(DmError::PortNr)
                } else {
                    Ok(port)
                }
            }
            None => get_free_number(u64::from(min), u64::from(max), &used)
                .map(|p| p as u16)
                .ok_or(DmError::PortNr),
        }
    }

    fn allocate_minor(&self, requested: Option<u32>) -> DmResult<MinorNr> {
        let used: Vec<u64> = self
            .graph
            .iter_resources()
            .flat_map(|res| res.iter_volumes().map(|v| u64::from(v.minor().value())))
            .collect();
        match requested {
            Some(minor) => {
                let minor = MinorNr::new(minor)?;
                if u64::from(minor.value()) < u64::from(self.conf.min_minor_nr())
                    || used.contains(&u64::from(minor.value()))
                {
                    Err(DmError::MinorNr)
                } else {
                    Ok(minor)
                }
            }
            None => {
                let nr = get_free_number(
                    u64::from(self.conf.min_minor_nr()),
                    u64::from(MINOR_NR_MAX),
                    &used,
                )
                .ok_or(DmError::MinorNr)?;
                MinorNr::new(nr as u32)
            }
        }
    }

    // ─── List views ─────────────────────────────────────────────────────────

    pub fn list_nodes(&self) -> Vec<NodeView> {
        self.graph
            .iter_nodes()
            .map(|node| NodeView {
                name: node.name().to_string(),
                addr: node.addr().to_string(),
                addr_family: node.addr_family().label().to_string(),
                state: node.state().bits(),
                poolsize: node.poolsize(),
                poolfree: node.poolfree(),
            })
            .collect()
    }

    pub fn list_resources(&self) -> Vec<ResourceView> {
        self.graph
            .iter_resources()
            .map(|res| ResourceView {
                name: res.name().to_string(),
                port: res.port(),
                state: res.state().bits(),
                volumes: res
                    .iter_volumes()
                    .map(|vol| VolumeView {
                        id: vol.id(),
                        size_kib: vol.size_kib(),
                        minor: vol.minor().value(),
                        state: vol.state().bits(),
                    })
                    .collect(),
            })
            .collect()
    }

    pub fn list_assignments(&self) -> Vec<AssignmentView> {
        self.graph
            .iter_assignments()
            .map(|assignment| AssignmentView {
                node: assignment.node().to_string(),
                resource: assignment.resource().to_string(),
                node_id: assignment.node_id(),
                cstate: assignment.cstate().bits(),
                tstate: assignment.tstate().bits(),
                rc: assignment.rc(),
                fail_count: assignment.fail_count(),
                vol_states: assignment
                    .iter_volume_states()
                    .map(|vs| VolumeStateView {
                        vol_id: vs.vol_id(),
                        cstate: vs.cstate().bits(),
                        tstate: vs.tstate().bits(),
                    })
                    .collect(),
            })
            .collect()
    }
}

// ─── View structs for client rendering ──────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct NodeView {
    pub name: String,
    pub addr: String,
    pub addr_family: String,
    pub state: u64,
    pub poolsize: i64,
    pub poolfree: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct VolumeView {
    pub id: u8,
    pub size_kib: u64,
    pub minor: u32,
    pub state: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceView {
    pub name: String,
    pub port: u16,
    pub state: u64,
    pub volumes: Vec<VolumeView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VolumeStateView {
    pub vol_id: u8,
    pub cstate: u64,
    pub tstate: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssignmentView {
    pub node: String,
    pub resource: String,
    pub node_id: u32,
    pub cstate: u64,
    pub tstate: u64,
    pub rc: u32,
    pub fail_count: u32,
    pub vol_states: Vec<VolumeStateView>,
}
