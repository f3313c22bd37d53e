//! Control-volume persistence.
//!
//! The whole cluster graph is stored in one binary file with a fixed
//! layout: an index region at [`IDX_OFFSET`] holding three big-endian
//! (offset, length) pairs, a SHA-1 digest of the three section payloads at
//! [`HASH_OFFSET`], and the JSON-encoded sections themselves starting at
//! [`DATA_OFFSET`], each padded with zeroes to the next block boundary.
//! The three sections are nodes, resources (with their volumes) and
//! assignments, the latter keyed `"node:resource"` and resolved against
//! the first two on load.
//!
//! The store offers no write locking. Read-only opens never conflict with
//! a writer elsewhere; exclusivity for writes is the transaction
//! discipline's job in the server layer.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tracing::{debug, error, warn};

use volmgr_proto::assignment::{Assignment, VolumeState};
use volmgr_proto::cluster::ClusterState;
use volmgr_proto::defaults::{STORE_OPEN_MAX_ATTEMPTS, STORE_OPEN_RETRY_BASE_MS};
use volmgr_proto::error::{DmError, DmResult};
use volmgr_proto::flags::FlagSet;
use volmgr_proto::node::{AddressFamily, Node};
use volmgr_proto::resource::{MinorNr, Resource, Volume};

/// Block size the data sections are aligned to.
pub const BLKSZ: u64 = 0x1000;
/// File offset of the index region.
pub const IDX_OFFSET: u64 = 0x1800;
/// File offset of the integrity hash.
pub const HASH_OFFSET: u64 = 0x1900;
/// File offset of the first data section.
pub const DATA_OFFSET: u64 = 0x2000;
/// Chunk size used when zero-filling up to the next block boundary.
const ZEROFILLSZ: usize = 0x400;

/// SHA-1 digest length in bytes.
pub const HASH_LEN: usize = 20;

const SECTION_COUNT: usize = 3;

/// Outcome flags of a [`ControlStore::load`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// At least one record failed to decode and was skipped.
    pub errors: bool,
    /// The stored digest did not match the digest of the payload read back.
    /// Non-fatal: signals that the store was written by a different or
    /// interrupted writer.
    pub hash_mismatch: bool,
}

// ─── Section records ────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct NodeRecord {
    addr: String,
    addr_family: String,
    state: FlagSet,
    poolsize: i64,
    poolfree: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct VolumeRecord {
    size_kib: u64,
    minor: u32,
    state: FlagSet,
}

#[derive(Debug, Serialize, Deserialize)]
struct ResourceRecord {
    port: u16,
    secret: String,
    state: FlagSet,
    volumes: BTreeMap<String, VolumeRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BlockDeviceRecord {
    name: String,
    path: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct VolumeStateRecord {
    cstate: FlagSet,
    tstate: FlagSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    blockdevice: Option<BlockDeviceRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AssignmentRecord {
    node: String,
    resource: String,
    node_id: u32,
    cstate: FlagSet,
    tstate: FlagSet,
    rc: u32,
    fail_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    blockdevice: Option<BlockDeviceRecord>,
    vol_states: BTreeMap<String, VolumeStateRecord>,
}

// ─── Store handle ───────────────────────────────────────────────────────────

/// Open handle onto the control-volume store file.
pub struct ControlStore {
    path: PathBuf,
    file: File,
    writable: bool,
}

impl ControlStore {
    /// Open the store, retrying transient not-found errors with a short
    /// randomized backoff. The control device may still be coming up when
    /// the daemon starts.
    pub async fn open(path: &Path, writable: bool) -> DmResult<Self> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match OpenOptions::new().read(true).write(writable).open(path) {
                Ok(file) => {
                    debug!(
                        "opened control store {} ({})",
                        path.display(),
                        if writable { "writable" } else { "read-only" }
                    );
                    return Ok(Self {
                        path: path.to_path_buf(),
                        file,
                        writable,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    if attempt >= STORE_OPEN_MAX_ATTEMPTS {
                        error!(
                            "control store {} not found after {} attempts",
                            path.display(),
                            attempt
                        );
                        return Err(DmError::Persistence);
                    }
                    let jitter_ms = rand::thread_rng().gen_range(0..1000);
                    warn!(
                        "control store {} not found, retrying (attempt {}/{})",
                        path.display(),
                        attempt,
                        STORE_OPEN_MAX_ATTEMPTS
                    );
                    tokio::time::sleep(Duration::from_millis(
                        STORE_OPEN_RETRY_BASE_MS + jitter_ms,
                    ))
                    .await;
                }
                Err(e) => {
                    error!("cannot open control store {}: {}", path.display(), e);
                    return Err(DmError::Persistence);
                }
            }
        }
    }

    /// Format an empty store at `path`, creating the file if necessary.
    pub fn create(path: &Path) -> DmResult<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let mut store = Self {
            path: path.to_path_buf(),
            file,
            writable: true,
        };
        store.save(&ClusterState::new())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Serialize the graph into the three sections and persist them. The
    /// index is written only after all section payloads are on disk, so a
    /// crash mid-save leaves the old index intact.
    pub fn save(&mut self, cstate: &ClusterState) -> DmResult<()> {
        if !self.writable {
            return Err(DmError::Persistence);
        }
        let sections = encode_sections(cstate)?;

        let mut hasher = Sha1::new();
        let mut index = [(0u64, 0u64); SECTION_COUNT];
        let mut offset = DATA_OFFSET;
        for (nr, payload) in sections.iter().enumerate() {
            hasher.update(payload);
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.write_all(payload)?;
            index[nr] = (offset, payload.len() as u64);
            offset = self.zero_fill(offset + payload.len() as u64)?;
        }

        let digest = hasher.finalize();
        self.file.seek(SeekFrom::Start(HASH_OFFSET))?;
        self.file.write_all(&digest)?;

        self.file.seek(SeekFrom::Start(IDX_OFFSET))?;
        for (start, length) in index {
            self.file.write_all(&start.to_be_bytes())?;
            self.file.write_all(&length.to_be_bytes())?;
        }
        self.file.sync_data()?;
        debug!("saved control store {} ({:x?})", self.path.display(), index);
        Ok(())
    }

    /// Read the store back into a fresh graph. Records that fail to decode
    /// are skipped; assignments are resolved last since they reference
    /// nodes and resources by name. A digest mismatch is reported, not
    /// fatal.
    pub fn load(&mut self) -> DmResult<(ClusterState, LoadReport)> {
        let index = self.read_index()?;
        let mut report = LoadReport::default();

        let file_len = self.file.metadata()?.len();
        let mut payloads = Vec::with_capacity(SECTION_COUNT);
        let mut hasher = Sha1::new();
        for (start, length) in index {
            // The index is untrusted input; a corrupted entry must not
            // drive the allocation below.
            if start < DATA_OFFSET || start.checked_add(length).map_or(true, |end| end > file_len) {
                warn!(
                    "control store {} index entry out of bounds ({}+{})",
                    self.path.display(),
                    start,
                    length
                );
                return Err(DmError::Persistence);
            }
            let mut payload = vec![0u8; length as usize];
            self.file.seek(SeekFrom::Start(start))?;
            self.file.read_exact(&mut payload)?;
            hasher.update(&payload);
            payloads.push(payload);
        }

        let computed: [u8; HASH_LEN] = hasher.finalize().into();
        let stored = self.get_stored_hash()?;
        if stored != computed {
            warn!(
                "control store {} hash mismatch (stored {}, computed {})",
                self.path.display(),
                hash_hex(&stored),
                hash_hex(&computed)
            );
            report.hash_mismatch = true;
        }

        let mut graph = ClusterState::new();
        decode_nodes(&payloads[0], &mut graph, &mut report);
        decode_resources(&payloads[1], &mut graph, &mut report);
        decode_assignments(&payloads[2], &mut graph, &mut report);
        if report.errors {
            warn!("control store {} loaded with errors", self.path.display());
        }
        Ok((graph, report))
    }

    /// Read the persisted digest without loading the graph. Used by the
    /// transaction discipline to detect modification by another cluster
    /// member.
    pub fn get_stored_hash(&mut self) -> DmResult<[u8; HASH_LEN]> {
        let mut stored = [0u8; HASH_LEN];
        self.file.seek(SeekFrom::Start(HASH_OFFSET))?;
        self.file.read_exact(&mut stored)?;
        Ok(stored)
    }

    fn read_index(&mut self) -> DmResult<[(u64, u64); SECTION_COUNT]> {
        let mut raw = [0u8; SECTION_COUNT * 16];
        self.file.seek(SeekFrom::Start(IDX_OFFSET))?;
        self.file.read_exact(&mut raw)?;
        let mut index = [(0u64, 0u64); SECTION_COUNT];
        for (nr, pair) in raw.chunks_exact(16).enumerate() {
            let start = u64::from_be_bytes(pair[..8].try_into().map_err(|_| DmError::Persistence)?);
            let length =
                u64::from_be_bytes(pair[8..].try_into().map_err(|_| DmError::Persistence)?);
            index[nr] = (start, length);
        }
        Ok(index)
    }

    /// Pad from `pos` up to the next block boundary with zero chunks and
    /// return the aligned position.
    fn zero_fill(&mut self, pos: u64) -> DmResult<u64> {
        let aligned = pos.div_ceil(BLKSZ) * BLKSZ;
        let mut remaining = (aligned - pos) as usize;
        let chunk = [0u8; ZEROFILLSZ];
        self.file.seek(SeekFrom::Start(pos))?;
        while remaining > 0 {
            let n = remaining.min(ZEROFILLSZ);
            self.file.write_all(&chunk[..n])?;
            remaining -= n;
        }
        Ok(aligned)
    }
}

/// Render a digest as lowercase hex.
pub fn hash_hex(digest: &[u8]) -> String {
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

// ─── Encoding ───────────────────────────────────────────────────────────────

fn encode_sections(cstate: &ClusterState) -> DmResult<[Vec<u8>; SECTION_COUNT]> {
    let nodes: BTreeMap<String, NodeRecord> = cstate
        .iter_nodes()
        .map(|node| {
            (
                node.name().to_string(),
                NodeRecord {
                    addr: node.addr().to_string(),
                    addr_family: node.addr_family().label().to_string(),
                    state: node.state(),
                    poolsize: node.poolsize(),
                    poolfree: node.poolfree(),
                },
            )
        })
        .collect();

    let resources: BTreeMap<String, ResourceRecord> = cstate
        .iter_resources()
        .map(|res| {
            let volumes = res
                .iter_volumes()
                .map(|vol| {
                    (
                        vol.id().to_string(),
                        VolumeRecord {
                            size_kib: vol.size_kib(),
                            minor: vol.minor().value(),
                            state: vol.state(),
                        },
                    )
                })
                .collect();
            (
                res.name().to_string(),
                ResourceRecord {
                    port: res.port(),
                    secret: res.secret().to_string(),
                    state: res.state(),
                    volumes,
                },
            )
        })
        .collect();

    let assignments: BTreeMap<String, AssignmentRecord> = cstate
        .iter_assignments()
        .map(|assg| {
            let vol_states = assg
                .iter_volume_states()
                .map(|vs| {
                    (
                        vs.vol_id().to_string(),
                        VolumeStateRecord {
                            cstate: vs.cstate(),
                            tstate: vs.tstate(),
                            blockdevice: vs.blockdevice().map(|bd| BlockDeviceRecord {
                                name: bd.name.clone(),
                                path: bd.path.clone(),
                            }),
                        },
                    )
                })
                .collect();
            (
                format!("{}:{}", assg.node(), assg.resource()),
                AssignmentRecord {
                    node: assg.node().to_string(),
                    resource: assg.resource().to_string(),
                    node_id: assg.node_id(),
                    cstate: assg.cstate(),
                    tstate: assg.tstate(),
                    rc: assg.rc(),
                    fail_count: assg.fail_count(),
                    blockdevice: assg.blockdevice().map(|bd| BlockDeviceRecord {
                        name: bd.name.clone(),
                        path: bd.path.clone(),
                    }),
                    vol_states,
                },
            )
        })
        .collect();

    Ok([
        serde_json::to_vec(&nodes).map_err(|_| DmError::Persistence)?,
        serde_json::to_vec(&resources).map_err(|_| DmError::Persistence)?,
        serde_json::to_vec(&assignments).map_err(|_| DmError::Persistence)?,
    ])
}

// ─── Decoding ───────────────────────────────────────────────────────────────

/// Parse a section into name-keyed raw values, tolerating a completely
/// unreadable section by reporting it and yielding nothing.
fn parse_section(payload: &[u8], report: &mut LoadReport) -> BTreeMap<String, serde_json::Value> {
    match serde_json::from_slice(payload) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("unreadable store section: {}", e);
            report.errors = true;
            BTreeMap::new()
        }
    }
}

fn decode_nodes(payload: &[u8], graph: &mut ClusterState, report: &mut LoadReport) {
    for (name, value) in parse_section(payload, report) {
        let restored = serde_json::from_value::<NodeRecord>(value)
            .map_err(|_| DmError::Persistence)
            .and_then(|rec| {
                let family = AddressFamily::from_label(&rec.addr_family)?;
                let mut node = Node::new(&name, &rec.addr, family)?;
                node.restore_state(rec.state);
                node.set_pool_info(rec.poolsize, rec.poolfree);
                graph.add_node(node)
            });
        if let Err(e) = restored {
            warn!("skipping unreadable node record '{}': {}", name, e);
            report.errors = true;
        }
    }
}

fn decode_resources(payload: &[u8], graph: &mut ClusterState, report: &mut LoadReport) {
    for (name, value) in parse_section(payload, report) {
        let restored = serde_json::from_value::<ResourceRecord>(value)
            .map_err(|_| DmError::Persistence)
            .and_then(|rec| {
                let mut res = Resource::new(&name, rec.port)?;
                res.set_secret(&rec.secret);
                res.restore_state(rec.state);
                for (vol_id, vol_rec) in rec.volumes {
                    let vol_id: u8 = vol_id.parse().map_err(|_| DmError::VolId)?;
                    let minor = MinorNr::new(vol_rec.minor)?;
                    let mut vol = Volume::new(vol_id, vol_rec.size_kib, minor)?;
                    vol.restore_state(vol_rec.state);
                    res.add_volume(vol)?;
                }
                graph.add_resource(res)
            });
        if let Err(e) = restored {
            warn!("skipping unreadable resource record '{}': {}", name, e);
            report.errors = true;
        }
    }
}

fn decode_assignments(payload: &[u8], graph: &mut ClusterState, report: &mut LoadReport) {
    for (key, value) in parse_section(payload, report) {
        let restored = serde_json::from_value::<AssignmentRecord>(value)
            .map_err(|_| DmError::Persistence)
            .and_then(|rec| {
                let mut assg =
                    Assignment::new(&rec.node, &rec.resource, rec.node_id, rec.cstate, rec.tstate);
                assg.restore_counters(rec.rc, rec.fail_count);
                if let Some(bd) = &rec.blockdevice {
                    assg.set_blockdevice(&bd.name, &bd.path);
                }
                for (vol_id, vs_rec) in rec.vol_states {
                    let vol_id: u8 = vol_id.parse().map_err(|_| DmError::VolId)?;
                    let mut vol_state = VolumeState::new(vol_id);
                    vol_state.restore_states(vs_rec.cstate, vs_rec.tstate);
                    if let Some(bd) = &vs_rec.blockdevice {
                        vol_state.set_blockdevice(&bd.name, &bd.path);
                    }
                    assg.add_volume_state(vol_state);
                }
                graph.add_assignment(assg)
            });
        if let Err(e) = restored {
            warn!("skipping unreadable assignment record '{}': {}", key, e);
            report.errors = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use volmgr_proto::constants::assg_flags;

    fn temp_store(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("volmgr-store-{}-{}.bin", name, std::process::id()))
    }

    fn sample_graph() -> ClusterState {
        let mut graph = ClusterState::new();
        graph
            .add_node(Node::new("alice", "10.0.0.1", AddressFamily::Ipv4).unwrap())
            .unwrap();
        graph
            .add_node(Node::new("bob", "fd00::2", AddressFamily::Ipv6).unwrap())
            .unwrap();
        let mut res = Resource::new("r0", 7000).unwrap();
        res.set_secret("s3cr3t");
        res.add_volume(Volume::new(0, 1048576, MinorNr::new(100).unwrap()).unwrap())
            .unwrap();
        res.add_volume(Volume::new(1, 2048, MinorNr::new(101).unwrap()).unwrap())
            .unwrap();
        graph.add_resource(res).unwrap();
        let mut assg = Assignment::new(
            "alice",
            "r0",
            0,
            FlagSet::empty(),
            FlagSet::from_bits(assg_flags::DEPLOY | assg_flags::CONNECT),
        );
        assg.set_blockdevice("r0", "/dev/drbd100");
        let mut vol_state = VolumeState::new(0);
        vol_state.deploy();
        vol_state.attach();
        assg.add_volume_state(vol_state);
        graph.add_assignment(assg).unwrap();
        graph
    }

    #[tokio::test]
    async fn test_round_trip() {
        let path = temp_store("roundtrip");
        ControlStore::create(&path).unwrap();
        let graph = sample_graph();

        let mut store = ControlStore::open(&path, true).await.unwrap();
        store.save(&graph).unwrap();
        let (loaded, report) = store.load().unwrap();

        assert!(!report.errors);
        assert!(!report.hash_mismatch);
        let alice = loaded.node("alice").unwrap();
        assert_eq!(alice.addr(), "10.0.0.1");
        assert_eq!(loaded.node("bob").unwrap().addr_family(), AddressFamily::Ipv6);
        let res = loaded.resource("r0").unwrap();
        assert_eq!(res.port(), 7000);
        assert_eq!(res.secret(), "s3cr3t");
        assert_eq!(res.volume(1).unwrap().minor().value(), 101);
        let assg = loaded.assignment("alice", "r0").unwrap();
        assert_eq!(assg.node_id(), 0);
        assert!(assg.tstate().is_set(assg_flags::DEPLOY | assg_flags::CONNECT));
        assert_eq!(assg.blockdevice().unwrap().path, "/dev/drbd100");
        assert!(assg.volume_state(0).unwrap().tstate().bits() != 0);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_corruption_detected() {
        let path = temp_store("corrupt");
        ControlStore::create(&path).unwrap();
        {
            let mut store = ControlStore::open(&path, true).await.unwrap();
            store.save(&sample_graph()).unwrap();
        }
        // Flip one byte inside the first data section.
        {
            let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
            let mut byte = [0u8; 1];
            file.seek(SeekFrom::Start(DATA_OFFSET + 2)).unwrap();
            file.read_exact(&mut byte).unwrap();
            byte[0] ^= 0xff;
            file.seek(SeekFrom::Start(DATA_OFFSET + 2)).unwrap();
            file.write_all(&byte).unwrap();
        }
        let mut store = ControlStore::open(&path, false).await.unwrap();
        let (_, report) = store.load().unwrap();
        assert!(report.hash_mismatch);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_oversized_index_entry_rejected() {
        let path = temp_store("badindex");
        ControlStore::create(&path).unwrap();
        {
            let mut store = ControlStore::open(&path, true).await.unwrap();
            store.save(&sample_graph()).unwrap();
        }
        // Claim a section length far past the end of the file.
        {
            let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(IDX_OFFSET + 8)).unwrap();
            file.write_all(&u64::MAX.to_be_bytes()).unwrap();
        }
        let mut store = ControlStore::open(&path, false).await.unwrap();
        let err = store.load().unwrap_err();
        assert!(matches!(err, DmError::Persistence));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_save_changes_stored_hash() {
        let path = temp_store("hashes");
        ControlStore::create(&path).unwrap();
        let mut store = ControlStore::open(&path, true).await.unwrap();
        let empty_hash = store.get_stored_hash().unwrap();
        store.save(&sample_graph()).unwrap();
        let full_hash = store.get_stored_hash().unwrap();
        assert_ne!(empty_hash, full_hash);

        // Saving the identical graph is deterministic.
        store.save(&sample_graph()).unwrap();
        assert_eq!(store.get_stored_hash().unwrap(), full_hash);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_partial_load_skips_bad_records() {
        let payload = br#"{
            "good": {"addr": "10.0.0.1", "addr_family": "ipv4",
                     "state": 0, "poolsize": -1, "poolfree": -1},
            "bad": {"addr": "10.0.0.2", "addr_family": "carrier-pigeon",
                    "state": 0, "poolsize": -1, "poolfree": -1}
        }"#;
        let mut graph = ClusterState::new();
        let mut report = LoadReport::default();
        decode_nodes(payload, &mut graph, &mut report);
        assert!(report.errors);
        assert!(graph.node("good").is_some());
        assert!(graph.node("bad").is_none());
    }

    #[test]
    fn test_assignment_without_endpoints_skipped() {
        let payload = br#"{
            "ghost:r9": {"node": "ghost", "resource": "r9", "node_id": 0,
                         "cstate": 0, "tstate": 0, "rc": 0, "fail_count": 0,
                         "vol_states": {}}
        }"#;
        let mut graph = ClusterState::new();
        let mut report = LoadReport::default();
        decode_assignments(payload, &mut graph, &mut report);
        assert!(report.errors);
        assert_eq!(graph.iter_assignments().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_missing_store_fails_after_retries() {
        let path = temp_store("missing");
        let _ = std::fs::remove_file(&path);
        let result = ControlStore::open(&path, false).await;
        assert!(matches!(result, Err(DmError::Persistence)));
    }

    #[test]
    fn test_hash_hex() {
        assert_eq!(hash_hex(&[0x00, 0xab, 0xff]), "00abff");
    }
}
