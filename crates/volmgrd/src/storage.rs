//! Storage backend plugins.
//!
//! The reconciliation engine consumes block-device capabilities through the
//! [`StoragePlugin`] contract. Plugins are resolved by configured name
//! through a static registry; an unresolvable name is a startup failure.
//! All plugin faults are reported as the storage error code by the
//! [`BlockDeviceManager`], never escalated into the caller's control flow.

use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{debug, warn};

use volmgr_proto::error::{DmError, DmResult};
use volmgr_proto::node::Node;

use crate::config::ServerConf;

/// Pool capacity of the in-process memory plugin (16 GiB).
const MEMORY_POOL_SIZE_KIB: u64 = 16 * 1024 * 1024;

/// An allocated backing block device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    pub name: String,
    pub size_kib: u64,
    pub path: String,
}

/// Capability contract of a storage backend.
#[async_trait]
pub trait StoragePlugin: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get_blockdevice(&self, name: &str) -> Option<BlockDevice>;

    async fn create_blockdevice(
        &mut self,
        name: &str,
        vol_id: u8,
        size_kib: u64,
    ) -> DmResult<BlockDevice>;

    async fn remove_blockdevice(&mut self, bd: &BlockDevice) -> DmResult<()>;

    /// Activate the device so it can be attached.
    async fn up_blockdevice(&mut self, bd: &BlockDevice) -> DmResult<()>;

    async fn down_blockdevice(&mut self, bd: &BlockDevice) -> DmResult<()>;

    async fn create_snapshot(
        &mut self,
        name: &str,
        vol_id: u8,
        source: &BlockDevice,
    ) -> DmResult<BlockDevice>;

    async fn remove_snapshot(&mut self, bd: &BlockDevice) -> DmResult<()>;

    /// Refresh the node's pool size/free figures.
    async fn update_pool(&self, node: &mut Node) -> DmResult<()>;

    /// Re-read backend settings.
    async fn reconfigure(&mut self, conf: &ServerConf) -> DmResult<()>;
}

/// Resolve a configured plugin name. Fails fast with a plugin-load error so
/// the daemon refuses to start with a broken storage configuration.
pub fn create_storage_plugin(name: &str) -> DmResult<Box<dyn StoragePlugin>> {
    match name {
        "memory" => Ok(Box::new(MemoryStorage::new(MEMORY_POOL_SIZE_KIB))),
        _ => {
            warn!("unknown storage plugin '{}'", name);
            Err(DmError::Plugin)
        }
    }
}

/// Wraps the active plugin, logging every failure and reporting it
/// uniformly as the storage error code.
pub struct BlockDeviceManager {
    plugin: Box<dyn StoragePlugin>,
}

impl BlockDeviceManager {
    pub fn new(plugin_name: &str) -> DmResult<Self> {
        Ok(Self {
            plugin: create_storage_plugin(plugin_name)?,
        })
    }

    pub fn plugin_name(&self) -> &'static str {
        self.plugin.name()
    }

    pub async fn get_blockdevice(&self, name: &str) -> Option<BlockDevice> {
        self.plugin.get_blockdevice(name).await
    }

    pub async fn create_blockdevice(
        &mut self,
        name: &str,
        vol_id: u8,
        size_kib: u64,
    ) -> DmResult<BlockDevice> {
        self.plugin
            .create_blockdevice(name, vol_id, size_kib)
            .await
            .map_err(|e| {
                warn!("storage plugin failed to create blockdevice '{}': {}", name, e);
                DmError::Storage
            })
    }

    pub async fn remove_blockdevice(&mut self, bd: &BlockDevice) -> DmResult<()> {
        self.plugin.remove_blockdevice(bd).await.map_err(|e| {
            warn!("storage plugin failed to remove blockdevice '{}': {}", bd.name, e);
            DmError::Storage
        })
    }

    pub async fn up_blockdevice(&mut self, bd: &BlockDevice) -> DmResult<()> {
        self.plugin.up_blockdevice(bd).await.map_err(|e| {
            warn!("storage plugin failed to start blockdevice '{}': {}", bd.name, e);
            DmError::Storage
        })
    }

    pub async fn down_blockdevice(&mut self, bd: &BlockDevice) -> DmResult<()> {
        self.plugin.down_blockdevice(bd).await.map_err(|e| {
            warn!("storage plugin failed to stop blockdevice '{}': {}", bd.name, e);
            DmError::Storage
        })
    }

    pub async fn create_snapshot(
        &mut self,
        name: &str,
        vol_id: u8,
        source: &BlockDevice,
    ) -> DmResult<BlockDevice> {
        self.plugin
            .create_snapshot(name, vol_id, source)
            .await
            .map_err(|e| {
                warn!("storage plugin failed to create snapshot '{}': {}", name, e);
                DmError::Storage
            })
    }

    pub async fn remove_snapshot(&mut self, bd: &BlockDevice) -> DmResult<()> {
        self.plugin.remove_snapshot(bd).await.map_err(|e| {
            warn!("storage plugin failed to remove snapshot '{}': {}", bd.name, e);
            DmError::Storage
        })
    }

    pub async fn update_pool(&self, node: &mut Node) -> DmResult<()> {
        self.plugin.update_pool(node).await.map_err(|e| {
            warn!("storage plugin failed to update pool for '{}': {}", node.name(), e);
            DmError::Storage
        })
    }

    pub async fn reconfigure(&mut self, conf: &ServerConf) -> DmResult<()> {
        self.plugin.reconfigure(conf).await.map_err(|e| {
            warn!("storage plugin reconfiguration failed: {}", e);
            DmError::Storage
        })
    }
}

/// In-process allocator backed by a fixed-size simulated pool. Lets a
/// cluster be exercised end-to-end without LVM or device-mapper access.
pub struct MemoryStorage {
    pool_size_kib: u64,
    devices: HashMap<String, BlockDevice>,
    active: HashMap<String, bool>,
}

impl MemoryStorage {
    pub fn new(pool_size_kib: u64) -> Self {
        Self {
            pool_size_kib,
            devices: HashMap::new(),
            active: HashMap::new(),
        }
    }

    fn allocated_kib(&self) -> u64 {
        self.devices.values().map(|bd| bd.size_kib).sum()
    }

    fn free_kib(&self) -> u64 {
        self.pool_size_kib.saturating_sub(self.allocated_kib())
    }
}

#[async_trait]
impl StoragePlugin for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get_blockdevice(&self, name: &str) -> Option<BlockDevice> {
        self.devices.get(name).cloned()
    }

    async fn create_blockdevice(
        &mut self,
        name: &str,
        vol_id: u8,
        size_kib: u64,
    ) -> DmResult<BlockDevice> {
        if self.devices.contains_key(name) {
            return Err(DmError::Exists);
        }
        if size_kib > self.free_kib() {
            return Err(DmError::NoSpace);
        }
        let bd = BlockDevice {
            name: name.to_string(),
            size_kib,
            path: format!("/dev/volmgr/{}.{}", name, vol_id),
        };
        self.devices.insert(name.to_string(), bd.clone());
        self.active.insert(name.to_string(), false);
        debug!("memory storage: created {} ({} kiB)", bd.path, size_kib);
        Ok(bd)
    }

    async fn remove_blockdevice(&mut self, bd: &BlockDevice) -> DmResult<()> {
        self.active.remove(&bd.name);
        match self.devices.remove(&bd.name) {
            Some(_) => Ok(()),
            None => Err(DmError::NotFound),
        }
    }

    async fn up_blockdevice(&mut self, bd: &BlockDevice) -> DmResult<()> {
        match self.active.get_mut(&bd.name) {
            Some(state) => {
                *state = true;
                Ok(())
            }
            None => Err(DmError::NotFound),
        }
    }

    async fn down_blockdevice(&mut self, bd: &BlockDevice) -> DmResult<()> {
        match self.active.get_mut(&bd.name) {
            Some(state) => {
                *state = false;
                Ok(())
            }
            None => Err(DmError::NotFound),
        }
    }

    async fn create_snapshot(
        &mut self,
        name: &str,
        vol_id: u8,
        source: &BlockDevice,
    ) -> DmResult<BlockDevice> {
        if !self.devices.contains_key(&source.name) {
            return Err(DmError::NotFound);
        }
        self.create_blockdevice(name, vol_id, source.size_kib).await
    }

    async fn remove_snapshot(&mut self, bd: &BlockDevice) -> DmResult<()> {
        self.remove_blockdevice(bd).await
    }

    async fn update_pool(&self, node: &mut Node) -> DmResult<()> {
        node.set_pool_info(self.pool_size_kib as i64, self.free_kib() as i64);
        Ok(())
    }

    async fn reconfigure(&mut self, _conf: &ServerConf) -> DmResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use volmgr_proto::node::AddressFamily;

    #[tokio::test]
    async fn test_memory_allocation_and_pool() {
        let mut plugin = MemoryStorage::new(1000);
        let bd = plugin.create_blockdevice("r0_00", 0, 600).await.unwrap();
        assert_eq!(bd.size_kib, 600);
        assert!(plugin.get_blockdevice("r0_00").await.is_some());

        // Exceeding the remaining pool is refused.
        let err = plugin.create_blockdevice("r1_00", 0, 600).await.unwrap_err();
        assert!(matches!(err, DmError::NoSpace));

        let mut node = Node::new("alice", "10.0.0.1", AddressFamily::Ipv4).unwrap();
        plugin.update_pool(&mut node).await.unwrap();
        assert_eq!(node.poolsize(), 1000);
        assert_eq!(node.poolfree(), 400);

        plugin.remove_blockdevice(&bd).await.unwrap();
        assert!(plugin.get_blockdevice("r0_00").await.is_none());
    }

    #[tokio::test]
    async fn test_manager_maps_failures_to_storage_code() {
        let mut mgr = BlockDeviceManager::new("memory").unwrap();
        let ghost = BlockDevice {
            name: "ghost".to_string(),
            size_kib: 1,
            path: "/dev/volmgr/ghost.0".to_string(),
        };
        let err = mgr.remove_blockdevice(&ghost).await.unwrap_err();
        assert!(matches!(err, DmError::Storage));
    }

    #[test]
    fn test_unknown_plugin_rejected() {
        assert!(matches!(
            create_storage_plugin("antigravity").map(|_| ()),
            Err(DmError::Plugin)
        ));
    }
}
