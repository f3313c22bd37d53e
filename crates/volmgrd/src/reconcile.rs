//! The reconciliation engine.
//!
//! Drives each local assignment's observed state (cstate) toward its
//! declared target state (tstate) by allocating backing storage through
//! the storage plugin and steering the replication tooling through the
//! [`ResCtl`] contract. cstate bits are flipped only after the
//! corresponding action was observed to succeed, so a crashed or failed
//! pass leaves an honest picture behind. With no pending deltas a pass
//! performs no work and reports no change.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info, warn};

use volmgr_proto::assignment::Assignment;
use volmgr_proto::cluster::ClusterState;
use volmgr_proto::constants::{assg_flags, vol_state_flags, FAIL_COUNT_HARD_LIMIT};
use volmgr_proto::error::{DmError, DmResult, DM_SUCCESS};

use crate::storage::BlockDeviceManager;

/// Shell-level control of the replication tooling for one resource.
#[async_trait]
pub trait ResCtl: Send + Sync {
    /// Bring the resource up on this node.
    async fn up(&self, res_name: &str) -> DmResult<()>;

    /// Take the resource down on this node.
    async fn down(&self, res_name: &str) -> DmResult<()>;

    /// Establish connections to the peer replicas. `discard` requests that
    /// the local data generation be thrown away in favor of the peers'.
    async fn connect(&self, res_name: &str, discard: bool) -> DmResult<()>;

    async fn disconnect(&self, res_name: &str) -> DmResult<()>;

    async fn attach(&self, res_name: &str, vol_id: u8, bd_path: &str) -> DmResult<()>;

    async fn detach(&self, res_name: &str, vol_id: u8) -> DmResult<()>;

    /// Re-apply the resource configuration (peer set, options).
    async fn adjust(&self, res_name: &str) -> DmResult<()>;

    /// Force the local data generation to be the new baseline.
    async fn overwrite_peers(&self, res_name: &str) -> DmResult<()>;
}

/// Invokes the configured replication utility as a child process.
pub struct CmdResCtl {
    util: PathBuf,
}

impl CmdResCtl {
    pub fn new(util_path: &str, util: &str) -> Self {
        Self {
            util: PathBuf::from(util_path).join(util),
        }
    }

    async fn run(&self, args: &[&str]) -> DmResult<()> {
        debug!("running {} {}", self.util.display(), args.join(" "));
        let status = Command::new(&self.util)
            .args(args)
            .status()
            .await
            .map_err(|e| {
                warn!("cannot run {}: {}", self.util.display(), e);
                DmError::Storage
            })?;
        if status.success() {
            Ok(())
        } else {
            warn!(
                "{} {} exited with {}",
                self.util.display(),
                args.join(" "),
                status
            );
            Err(DmError::Storage)
        }
    }
}

#[async_trait]
impl ResCtl for CmdResCtl {
    async fn up(&self, res_name: &str) -> DmResult<()> {
        self.run(&["up", res_name]).await
    }

    async fn down(&self, res_name: &str) -> DmResult<()> {
        self.run(&["down", res_name]).await
    }

    async fn connect(&self, res_name: &str, discard: bool) -> DmResult<()> {
        if discard {
            self.run(&["connect", "--discard-my-data", res_name]).await
        } else {
            self.run(&["connect", res_name]).await
        }
    }

    async fn disconnect(&self, res_name: &str) -> DmResult<()> {
        self.run(&["disconnect", res_name]).await
    }

    async fn attach(&self, res_name: &str, vol_id: u8, bd_path: &str) -> DmResult<()> {
        self.run(&["attach", res_name, &vol_id.to_string(), bd_path])
            .await
    }

    async fn detach(&self, res_name: &str, vol_id: u8) -> DmResult<()> {
        self.run(&["detach", res_name, &vol_id.to_string()]).await
    }

    async fn adjust(&self, res_name: &str) -> DmResult<()> {
        self.run(&["adjust", res_name]).await
    }

    async fn overwrite_peers(&self, res_name: &str) -> DmResult<()> {
        self.run(&["primary", "--force", res_name]).await
    }
}

/// One pass of convergence for every assignment of `node_name`. Returns
/// whether any state changed. Per-assignment failures are recorded on the
/// assignment (rc, fail counter) and do not stop the pass.
pub async fn perform_changes(
    graph: &mut ClusterState,
    node_name: &str,
    bd_mgr: &mut BlockDeviceManager,
    res_ctl: &dyn ResCtl,
) -> bool {
    // Volume sizes per resource, gathered up front so the assignment
    // borrows below stay simple.
    let vol_sizes: BTreeMap<String, BTreeMap<u8, u64>> = graph
        .iter_resources()
        .map(|res| {
            (
                res.name().to_string(),
                res.iter_volumes().map(|v| (v.id(), v.size_kib())).collect(),
            )
        })
        .collect();

    let local: Vec<String> = graph
        .assignments_of_node(node_name)
        .map(|a| a.resource().to_string())
        .collect();

    let mut changed = false;
    for res_name in local {
        let Some(assignment) = graph.assignment_mut(node_name, &res_name) else {
            continue;
        };
        if assignment.fail_count() >= FAIL_COUNT_HARD_LIMIT {
            warn!(
                "assignment {}:{} reached the failure limit, skipping",
                node_name, res_name
            );
            continue;
        }
        let sizes = vol_sizes.get(&res_name).cloned().unwrap_or_default();
        match converge_assignment(assignment, &res_name, &sizes, bd_mgr, res_ctl).await {
            Ok(step_changed) => {
                if step_changed {
                    assignment.set_rc(DM_SUCCESS);
                    changed = true;
                }
            }
            Err(e) => {
                warn!(
                    "reconciliation of {}:{} failed: {}",
                    node_name, res_name, e
                );
                assignment.set_rc(e.to_code());
                assignment.increase_fail_count();
                changed = true;
            }
        }
    }
    changed
}

async fn converge_assignment(
    assignment: &mut Assignment,
    res_name: &str,
    vol_sizes: &BTreeMap<u8, u64>,
    bd_mgr: &mut BlockDeviceManager,
    res_ctl: &dyn ResCtl,
) -> DmResult<bool> {
    let mut changed = false;
    let ts = assignment.tstate();
    let cs = assignment.cstate();
    let diskless = ts.is_set(assg_flags::DISKLESS);

    // Deploy: allocate volume storage, then bring the resource up.
    if ts.is_set(assg_flags::DEPLOY) && cs.is_clear(assg_flags::DEPLOY) {
        if !diskless {
            let pending: Vec<u8> = assignment
                .iter_volume_states()
                .filter(|vs| {
                    vs.tstate().is_set(vol_state_flags::DEPLOY)
                        && vs.cstate().is_clear(vol_state_flags::DEPLOY)
                })
                .map(|vs| vs.vol_id())
                .collect();
            for vol_id in pending {
                let size_kib = vol_sizes.get(&vol_id).copied().ok_or(DmError::VolId)?;
                let bd_name = format!("{}_{:02}", res_name, vol_id);
                let bd = bd_mgr.create_blockdevice(&bd_name, vol_id, size_kib).await?;
                if let Some(vol_state) = assignment.volume_state_mut(vol_id) {
                    vol_state.set_blockdevice(&bd.name, &bd.path);
                    vol_state.set_cstate_flags(vol_state_flags::DEPLOY);
                }
            }
        }
        res_ctl.up(res_name).await?;
        assignment.set_cstate_flags(assg_flags::DEPLOY);
        if diskless {
            assignment.set_cstate_flags(assg_flags::DISKLESS);
        }
        changed = true;
    }

    // Per-volume attach/detach and volume-level undeploy.
    if assignment.cstate().is_set(assg_flags::DEPLOY) {
        let vol_ids = assignment.volume_state_ids();
        for vol_id in vol_ids {
            let Some(vol_state) = assignment.volume_state_mut(vol_id) else {
                continue;
            };
            let vts = vol_state.tstate();
            let vcs = vol_state.cstate();
            if vts.is_set(vol_state_flags::ATTACH)
                && vcs.is_clear(vol_state_flags::ATTACH)
                && vcs.is_set(vol_state_flags::DEPLOY)
            {
                let path = vol_state
                    .blockdevice()
                    .map(|bd| bd.path.clone())
                    .ok_or(DmError::Storage)?;
                res_ctl.attach(res_name, vol_id, &path).await?;
                vol_state.set_cstate_flags(vol_state_flags::ATTACH);
                changed = true;
            } else if vcs.is_set(vol_state_flags::ATTACH) && vts.is_clear(vol_state_flags::ATTACH)
            {
                res_ctl.detach(res_name, vol_id).await?;
                vol_state.clear_cstate_flags(vol_state_flags::ATTACH);
                changed = true;
            }
            let vcs = vol_state.cstate();
            if vcs.is_set(vol_state_flags::DEPLOY) && vts.is_clear(vol_state_flags::DEPLOY) {
                if let Some(bd) = vol_state.blockdevice().cloned() {
                    let bd = crate::storage::BlockDevice {
                        name: bd.name,
                        size_kib: 0,
                        path: bd.path,
                    };
                    bd_mgr.remove_blockdevice(&bd).await?;
                }
                vol_state.clear_blockdevice();
                vol_state.clear_cstate_flags(vol_state_flags::DEPLOY);
                changed = true;
            }
        }
    }

    // Connection management.
    let ts = assignment.tstate();
    let cs = assignment.cstate();
    if cs.is_set(assg_flags::DEPLOY) {
        if ts.is_set(assg_flags::RECONNECT) {
            if cs.is_set(assg_flags::CONNECT) {
                res_ctl.disconnect(res_name).await?;
                assignment.clear_cstate_flags(assg_flags::CONNECT);
            }
            assignment.clear_tstate_flags(assg_flags::RECONNECT);
            changed = true;
        }
        let ts = assignment.tstate();
        let cs = assignment.cstate();
        if ts.is_set(assg_flags::CONNECT) && cs.is_clear(assg_flags::CONNECT) {
            res_ctl
                .connect(res_name, ts.is_set(assg_flags::DISCARD))
                .await?;
            assignment.set_cstate_flags(assg_flags::CONNECT);
            // Discarding the local data is a one-shot request.
            assignment.clear_tstate_flags(assg_flags::DISCARD);
            changed = true;
        } else if cs.is_set(assg_flags::CONNECT) && ts.is_clear(assg_flags::CONNECT) {
            res_ctl.disconnect(res_name).await?;
            assignment.clear_cstate_flags(assg_flags::CONNECT);
            changed = true;
        }
        if assignment.tstate().is_set(assg_flags::OVERWRITE) {
            res_ctl.overwrite_peers(res_name).await?;
            assignment.clear_tstate_flags(assg_flags::OVERWRITE);
            changed = true;
        }
        if assignment.tstate().is_set(assg_flags::UPD_CON) {
            res_ctl.adjust(res_name).await?;
            assignment.clear_tstate_flags(assg_flags::UPD_CON);
            changed = true;
        }
    }

    // Undeploy: tear down connections, release storage, take the
    // resource down.
    let ts = assignment.tstate();
    let cs = assignment.cstate();
    if cs.is_set(assg_flags::DEPLOY) && ts.is_clear(assg_flags::DEPLOY) {
        if cs.is_set(assg_flags::CONNECT) {
            res_ctl.disconnect(res_name).await?;
            assignment.clear_cstate_flags(assg_flags::CONNECT);
        }
        res_ctl.down(res_name).await?;
        let vol_ids = assignment.volume_state_ids();
        for vol_id in vol_ids {
            if let Some(vol_state) = assignment.volume_state_mut(vol_id) {
                if let Some(bd) = vol_state.blockdevice().cloned() {
                    let bd = crate::storage::BlockDevice {
                        name: bd.name,
                        size_kib: 0,
                        path: bd.path,
                    };
                    bd_mgr.remove_blockdevice(&bd).await?;
                }
                vol_state.clear_blockdevice();
                vol_state.clear_cstate_flags(vol_state_flags::DEPLOY | vol_state_flags::ATTACH);
            }
        }
        assignment.clear_cstate_flags(
            assg_flags::DEPLOY | assg_flags::DISKLESS | assg_flags::CONNECT,
        );
        changed = true;
    }

    Ok(changed)
}

/// Bring every already-deployed local resource back up after a daemon
/// restart. Failures are logged and do not stop the pass.
pub async fn initial_up(graph: &ClusterState, node_name: &str, res_ctl: &dyn ResCtl) {
    for assignment in graph.assignments_of_node(node_name) {
        if !assignment.is_deployed() {
            continue;
        }
        let res_name = assignment.resource();
        if let Err(e) = res_ctl.up(res_name).await {
            warn!("initial up of {} failed: {}", res_name, e);
            continue;
        }
        if let Err(e) = res_ctl.adjust(res_name).await {
            warn!("initial adjust of {} failed: {}", res_name, e);
            continue;
        }
        info!("brought up {}", res_name);
    }
}

#[cfg(test)]
pub mod testutil {
    use super::*;
    use std::sync::Mutex;

    /// Records every invocation; optionally fails all of them.
    pub struct RecordingResCtl {
        pub calls: Mutex<Vec<String>>,
        pub fail: bool,
    }

    impl RecordingResCtl {
        pub fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail: false,
            }
        }

        pub fn failing() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail: true,
            }
        }

        pub fn recorded(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) -> DmResult<()> {
            self.calls.lock().unwrap().push(call);
            if self.fail {
                Err(DmError::Storage)
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl ResCtl for RecordingResCtl {
        async fn up(&self, res_name: &str) -> DmResult<()> {
            self.record(format!("up {}", res_name))
        }

        async fn down(&self, res_name: &str) -> DmResult<()> {
            self.record(format!("down {}", res_name))
        }

        async fn connect(&self, res_name: &str, discard: bool) -> DmResult<()> {
            self.record(format!("connect {} discard={}", res_name, discard))
        }

        async fn disconnect(&self, res_name: &str) -> DmResult<()> {
            self.record(format!("disconnect {}", res_name))
        }

        async fn attach(&self, res_name: &str, vol_id: u8, bd_path: &str) -> DmResult<()> {
            self.record(format!("attach {} {} {}", res_name, vol_id, bd_path))
        }

        async fn detach(&self, res_name: &str, vol_id: u8) -> DmResult<()> {
            self.record(format!("detach {} {}", res_name, vol_id))
        }

        async fn adjust(&self, res_name: &str) -> DmResult<()> {
            self.record(format!("adjust {}", res_name))
        }

        async fn overwrite_peers(&self, res_name: &str) -> DmResult<()> {
            self.record(format!("overwrite {}", res_name))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::RecordingResCtl;
    use super::*;
    use volmgr_proto::assignment::Assignment;
    use volmgr_proto::flags::FlagSet;
    use volmgr_proto::node::{AddressFamily, Node};
    use volmgr_proto::resource::{MinorNr, Resource, Volume};

    fn deploy_graph() -> ClusterState {
        let mut graph = ClusterState::new();
        graph
            .add_node(Node::new("alice", "10.0.0.1", AddressFamily::Ipv4).unwrap())
            .unwrap();
        let mut res = Resource::new("r0", 7000).unwrap();
        res.add_volume(Volume::new(0, 1024, MinorNr::new(100).unwrap()).unwrap())
            .unwrap();
        graph.add_resource(res).unwrap();
        graph
            .add_assignment(Assignment::new(
                "alice",
                "r0",
                0,
                FlagSet::empty(),
                FlagSet::from_bits(assg_flags::DEPLOY | assg_flags::CONNECT),
            ))
            .unwrap();
        graph.update_volume_states("r0");
        graph
    }

    #[tokio::test]
    async fn test_deploy_converges_and_is_idempotent() {
        let mut graph = deploy_graph();
        let mut bd_mgr = BlockDeviceManager::new("memory").unwrap();
        let res_ctl = RecordingResCtl::new();

        let changed = perform_changes(&mut graph, "alice", &mut bd_mgr, &res_ctl).await;
        assert!(changed);
        let assg = graph.assignment("alice", "r0").unwrap();
        assert!(assg.cstate().is_set(assg_flags::DEPLOY | assg_flags::CONNECT));
        let vol_state = assg.volume_state(0).unwrap();
        assert!(vol_state.cstate().is_set(vol_state_flags::DEPLOY | vol_state_flags::ATTACH));
        assert!(vol_state.blockdevice().is_some());
        assert!(bd_mgr.get_blockdevice("r0_00").await.is_some());
        let calls = res_ctl.recorded();
        assert!(calls.contains(&"up r0".to_string()));
        assert!(calls.iter().any(|c| c.starts_with("connect r0")));

        // No pending deltas: the second pass does nothing.
        let changed = perform_changes(&mut graph, "alice", &mut bd_mgr, &res_ctl).await;
        assert!(!changed);
        assert_eq!(res_ctl.recorded(), calls);
    }

    #[tokio::test]
    async fn test_undeploy_releases_storage() {
        let mut graph = deploy_graph();
        let mut bd_mgr = BlockDeviceManager::new("memory").unwrap();
        let res_ctl = RecordingResCtl::new();
        perform_changes(&mut graph, "alice", &mut bd_mgr, &res_ctl).await;

        graph.assignment_mut("alice", "r0").unwrap().undeploy();
        let changed = perform_changes(&mut graph, "alice", &mut bd_mgr, &res_ctl).await;
        assert!(changed);
        let assg = graph.assignment("alice", "r0").unwrap();
        assert!(assg.is_gone());
        assert!(bd_mgr.get_blockdevice("r0_00").await.is_none());
        let calls = res_ctl.recorded();
        assert!(calls.contains(&"down r0".to_string()));
    }

    #[tokio::test]
    async fn test_failure_records_rc_and_fail_count() {
        let mut graph = deploy_graph();
        let mut bd_mgr = BlockDeviceManager::new("memory").unwrap();
        let res_ctl = RecordingResCtl::failing();

        perform_changes(&mut graph, "alice", &mut bd_mgr, &res_ctl).await;
        let assg = graph.assignment("alice", "r0").unwrap();
        assert_eq!(assg.fail_count(), 1);
        assert_eq!(assg.rc(), DmError::Storage.to_code());
        // The failed action did not get its cstate bit.
        assert!(assg.cstate().is_clear(assg_flags::DEPLOY));
    }

    #[tokio::test]
    async fn test_reconnect_cycles_connection() {
        let mut graph = deploy_graph();
        let mut bd_mgr = BlockDeviceManager::new("memory").unwrap();
        let res_ctl = RecordingResCtl::new();
        perform_changes(&mut graph, "alice", &mut bd_mgr, &res_ctl).await;

        graph.assignment_mut("alice", "r0").unwrap().reconnect();
        perform_changes(&mut graph, "alice", &mut bd_mgr, &res_ctl).await;
        let assg = graph.assignment("alice", "r0").unwrap();
        assert!(assg.tstate().is_clear(assg_flags::RECONNECT));
        assert!(assg.cstate().is_set(assg_flags::CONNECT));
        let calls = res_ctl.recorded();
        assert!(calls.contains(&"disconnect r0".to_string()));
        assert_eq!(
            calls.iter().filter(|c| c.starts_with("connect r0")).count(),
            2
        );
    }
}
