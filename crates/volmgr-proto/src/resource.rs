/// Resources and their volumes.
///
/// A resource is one replicated device group: it owns up to
/// [`MAX_RES_VOLS`](crate::constants::MAX_RES_VOLS) volumes, a
/// cluster-unique network port for replication traffic, and a shared
/// secret. Volumes carry the cluster-unique device minor number.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::constants::{vol_flags, MAX_RES_VOLS, MINOR_NR_MAX};
use crate::error::{DmError, DmResult};
use crate::flags::FlagSet;
use crate::ident::check_res_name;

/// Checked device minor number (0..=0xFFFFF).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MinorNr(u32);

impl MinorNr {
    pub fn new(nr: u32) -> DmResult<Self> {
        if nr > MINOR_NR_MAX {
            return Err(DmError::MinorNr);
        }
        Ok(Self(nr))
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for MinorNr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One volume of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    id: u8,
    size_kib: u64,
    minor: MinorNr,
    state: FlagSet,
}

impl Volume {
    pub fn new(id: u8, size_kib: u64, minor: MinorNr) -> DmResult<Self> {
        if id > MAX_RES_VOLS {
            return Err(DmError::VolId);
        }
        if size_kib == 0 {
            return Err(DmError::VolSize);
        }
        Ok(Self {
            id,
            size_kib,
            minor,
            state: FlagSet::empty(),
        })
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn size_kib(&self) -> u64 {
        self.size_kib
    }

    pub fn minor(&self) -> MinorNr {
        self.minor
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

    /// Flag the volume for removal; cleanup finalizes once it is no longer
    /// deployed anywhere.
    pub fn remove(&mut self) {
        self.state.set(vol_flags::REMOVE);
    }
}

/// A replicated resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    name: String,
    port: u16,
    secret: String,
    state: FlagSet,
    volumes: BTreeMap<u8, Volume>,
}

impl Resource {
    /// Register a resource. Fails with a naming error if `name` violates
    /// the resource name constraints.
    pub fn new(name: &str, port: u16) -> DmResult<Self> {
        check_res_name(name)?;
        Ok(Self {
            name: name.to_string(),
            port,
            secret: String::new(),
            state: FlagSet::empty(),
            volumes: BTreeMap::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn set_secret(&mut self, secret: &str) {
        self.secret = secret.to_string();
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

    pub fn add_volume(&mut self, volume: Volume) -> DmResult<()> {
        if self.volumes.contains_key(&volume.id()) {
            return Err(DmError::Exists);
        }
        self.volumes.insert(volume.id(), volume);
        Ok(())
    }

    pub fn volume(&self, vol_id: u8) -> Option<&Volume> {
        self.volumes.get(&vol_id)
    }

    pub fn volume_mut(&mut self, vol_id: u8) -> Option<&mut Volume> {
        self.volumes.get_mut(&vol_id)
    }

    pub fn remove_volume(&mut self, vol_id: u8) -> Option<Volume> {
        self.volumes.remove(&vol_id)
    }

    /// Iterate volumes in ascending volume-id order.
    pub fn iter_volumes(&self) -> impl Iterator<Item = &Volume> {
        self.volumes.values()
    }

    pub fn iter_volumes_mut(&mut self) -> impl Iterator<Item = &mut Volume> {
        self.volumes.values_mut()
    }

    pub fn volume_count(&self) -> usize {
        self.volumes.len()
    }

    /// Sum of all volume sizes in kiB (deployment space requirement).
    pub fn size_sum_kib(&self) -> u64 {
        self.volumes.values().map(Volume::size_kib).sum()
    }

    /// Flag the resource for removal; cleanup finalizes once it has no
    /// assignments left.
    pub fn remove(&mut self) {
        self.state.set(crate::constants::res_flags::REMOVE);
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (port={}, volumes={})",
            self.name,
            self.port,
            self.volumes.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minor_check() {
        assert!(MinorNr::new(0).is_ok());
        assert!(MinorNr::new(MINOR_NR_MAX).is_ok());
        assert_eq!(MinorNr::new(MINOR_NR_MAX + 1), Err(DmError::MinorNr));
    }

    #[test]
    fn test_volume_checks() {
        let minor = MinorNr::new(100).unwrap();
        assert!(Volume::new(0, 1024, minor).is_ok());
        assert_eq!(Volume::new(0, 0, minor), Err(DmError::VolSize));
        assert_eq!(Volume::new(200, 1024, minor), Err(DmError::VolId));
    }

    #[test]
    fn test_resource_volume_ownership() {
        let mut res = Resource::new("r0", 7000).unwrap();
        let minor = MinorNr::new(100).unwrap();
        res.add_volume(Volume::new(1, 1024, minor).unwrap()).unwrap();
        res.add_volume(Volume::new(0, 2048, MinorNr::new(101).unwrap()).unwrap())
            .unwrap();
        assert_eq!(
            res.add_volume(Volume::new(0, 512, minor).unwrap()),
            Err(DmError::Exists)
        );
        // iteration is sorted by id
        let ids: Vec<u8> = res.iter_volumes().map(Volume::id).collect();
        assert_eq!(ids, vec![0, 1]);
        assert_eq!(res.size_sum_kib(), 3072);
    }

    #[test]
    fn test_resource_name_check() {
        assert_eq!(Resource::new("bad name", 7000), Err(DmError::InvalidName));
    }
}
