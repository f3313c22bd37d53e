//! Deployment-selection plugins.
//!
//! Auto-deploy, auto-extend and auto-reduce delegate the choice of nodes
//! to a [`Deployer`]. Selection is pure: it ranks the candidates it is
//! given and never mutates the graph.

use tracing::warn;

use volmgr_proto::error::{DmError, DmResult};
use volmgr_proto::node::Node;

/// Node-selection contract for automatic deployment decisions.
pub trait Deployer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pick `count` nodes out of `candidates` to deploy `size_kib` onto.
    /// Fails with the node-count error when there are not enough candidates.
    fn deploy_select(
        &self,
        candidates: &[&Node],
        count: usize,
        size_kib: u64,
    ) -> DmResult<Vec<String>>;

    /// Pick `count` nodes out of `candidates` to withdraw a deployment from.
    fn undeploy_select(&self, candidates: &[&Node], count: usize) -> DmResult<Vec<String>>;
}

/// Resolve a configured deployer name, failing fast on an unknown one.
pub fn create_deployer(name: &str) -> DmResult<Box<dyn Deployer>> {
    match name {
        "balanced" => Ok(Box::new(BalancedDeployer)),
        _ => {
            warn!("unknown deployer plugin '{}'", name);
            Err(DmError::Plugin)
        }
    }
}

/// Spreads deployments by free pool space: deploy onto the nodes with the
/// most room, withdraw from the nodes with the least.
pub struct BalancedDeployer;

impl Deployer for BalancedDeployer {
    fn name(&self) -> &'static str {
        "balanced"
    }

    fn deploy_select(
        &self,
        candidates: &[&Node],
        count: usize,
        size_kib: u64,
    ) -> DmResult<Vec<String>> {
        if candidates.len() < count {
            return Err(DmError::NodeCount);
        }
        let mut ranked: Vec<&Node> = candidates
            .iter()
            .copied()
            .filter(|node| node.poolfree() < 0 || node.poolfree() as u64 >= size_kib)
            .collect();
        if ranked.len() < count {
            return Err(DmError::NoSpace);
        }
        // Unknown pool space (-1) ranks last among the eligible.
        ranked.sort_by_key(|node| (std::cmp::Reverse(node.poolfree()), node.name().to_string()));
        Ok(ranked
            .into_iter()
            .take(count)
            .map(|node| node.name().to_string())
            .collect())
    }

    fn undeploy_select(&self, candidates: &[&Node], count: usize) -> DmResult<Vec<String>> {
        if candidates.len() < count {
            return Err(DmError::NodeCount);
        }
        let mut ranked: Vec<&Node> = candidates.to_vec();
        ranked.sort_by_key(|node| (node.poolfree(), node.name().to_string()));
        Ok(ranked
            .into_iter()
            .take(count)
            .map(|node| node.name().to_string())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use volmgr_proto::node::AddressFamily;

    fn node(name: &str, poolfree: i64) -> Node {
        let mut node = Node::new(name, "10.0.0.1", AddressFamily::Ipv4).unwrap();
        node.set_pool_info(poolfree.max(0), poolfree);
        node
    }

    #[test]
    fn test_deploy_prefers_most_free_space() {
        let a = node("alice", 100);
        let b = node("bob", 300);
        let c = node("charlie", 200);
        let deployer = BalancedDeployer;
        let picked = deployer
            .deploy_select(&[&a, &b, &c], 2, 50)
            .unwrap();
        assert_eq!(picked, vec!["bob".to_string(), "charlie".to_string()]);
    }

    #[test]
    fn test_deploy_skips_full_nodes() {
        let a = node("alice", 10);
        let b = node("bob", 300);
        let deployer = BalancedDeployer;
        let err = deployer.deploy_select(&[&a, &b], 2, 50).unwrap_err();
        assert!(matches!(err, DmError::NoSpace));
        let picked = deployer.deploy_select(&[&a, &b], 1, 50).unwrap();
        assert_eq!(picked, vec!["bob".to_string()]);
    }

    #[test]
    fn test_undeploy_prefers_least_free_space() {
        let a = node("alice", 100);
        let b = node("bob", 300);
        let deployer = BalancedDeployer;
        let picked = deployer.undeploy_select(&[&a, &b], 1).unwrap();
        assert_eq!(picked, vec!["alice".to_string()]);
    }

    #[test]
    fn test_too_few_candidates() {
        let a = node("alice", 100);
        let deployer = BalancedDeployer;
        assert!(matches!(
            deployer.deploy_select(&[&a], 2, 10),
            Err(DmError::NodeCount)
        ));
    }
}
