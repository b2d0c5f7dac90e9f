//! On-disk checkpoint format.
//!
//! ```text
//! <checkpoint_dir>/
//!   step_00000100/
//!     params.shard-00000-of-00008.bin
//!     ...
//!     opt.shard-00000-of-00008.bin
//!     ...
//!     MANIFEST.json      written last; its presence marks the step durable
//! ```
//!
//! Every distinct block of a sharded array is stored once, in the shard file
//! of the first device (row-major) that holds it. The manifest records the
//! layout of every leaf and a SHA-256 of every shard file.

use super::CheckpointRecord;
use crate::error::{Error, Result};
use crate::mesh::{Device, Mesh, MeshAxis};
use crate::optim::{Moments, OptimizerState};
use crate::params::{AdaptedLinear, ParamLeaf, ParamNode, ParameterTree, LORA_A_SUFFIX, LORA_B_SUFFIX};
use crate::sharding::{PartitionSpec, Shardable, ShardedArray};
use crate::tensor::DType;
use crate::training::StepMetrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const MANIFEST_FILE: &str = "MANIFEST.json";
pub const FORMAT_VERSION: u32 = 1;

const STEP_DIR_PREFIX: &str = "step_";
const MOMENT_M: &str = "@m";
const MOMENT_V: &str = "@v";

/// Directory name for `step`.
pub fn step_dir_name(step: u64) -> String {
    format!("{}{:08}", STEP_DIR_PREFIX, step)
}

/// Step encoded in a checkpoint directory name.
pub fn parse_step_dir(name: &str) -> Option<u64> {
    name.strip_prefix(STEP_DIR_PREFIX)?.parse().ok()
}

fn shard_file_name(kind: &str, index: usize, count: usize) -> String {
    format!("{}.shard-{:05}-of-{:05}.bin", kind, index, count)
}

/// How a parameter node is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    Dense,
    Adapted { rank: usize, scaling: f32, merged: bool },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub path: String,
    #[serde(flatten)]
    pub kind: NodeKind,
}

/// Layout of one stored leaf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafEntry {
    pub path: String,
    pub shape: Vec<usize>,
    pub spec: PartitionSpec,
    pub parts: Vec<usize>,
    pub dtype: DType,
    pub trainable: bool,
    pub allow_padding: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub bytes: u64,
    pub sha256: String,
}

/// Terminal commit marker of a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub step: u64,
    pub epoch: u64,
    pub timestamp: DateTime<Utc>,
    pub config_hash: String,
    pub mesh: Vec<MeshAxis>,
    pub nodes: Vec<NodeEntry>,
    pub leaves: Vec<LeafEntry>,
    pub optimizer_step: u64,
    /// Leaves with optimizer moments
    pub optimizer_leaves: Vec<String>,
    pub files: Vec<FileEntry>,
    #[serde(default)]
    pub metrics: Option<StepMetrics>,
}

impl Manifest {
    /// Whether any node carries adapters.
    pub fn has_adapters(&self) -> bool {
        self.nodes.iter().any(|n| matches!(n.kind, NodeKind::Adapted { .. }))
    }

    /// Rank of the stored adapters, if any.
    pub fn adapter_rank(&self) -> Option<usize> {
        self.nodes.iter().find_map(|n| match n.kind {
            NodeKind::Adapted { rank, .. } => Some(rank),
            NodeKind::Dense => None,
        })
    }

    pub fn mesh_description(&self) -> String {
        let parts: Vec<String> = self.mesh.iter().map(|a| format!("{}={}", a.name, a.size)).collect();
        format!("[{}]", parts.join(", "))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredBlock {
    tensor: String,
    index: Vec<usize>,
    data: Vec<f32>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ShardFile {
    blocks: Vec<StoredBlock>,
}

/// Assigns each distinct block of an array to the first device holding it.
fn primary_devices(array: &ShardedArray, mesh: &Mesh) -> Result<HashMap<Vec<usize>, usize>> {
    let mut owners = HashMap::new();
    for (linear, (_device, coords)) in mesh.placements().enumerate() {
        let index = array.block_index_for(mesh, &coords)?;
        owners.entry(index).or_insert(linear);
    }
    Ok(owners)
}

fn distribute(
    files: &mut [ShardFile],
    name: &str,
    array: &ShardedArray,
    mesh: &Mesh,
) -> Result<()> {
    let owners = primary_devices(array, mesh)?;
    for (index, data) in array.blocks() {
        let owner = owners.get(index).copied().ok_or_else(|| {
            Error::sharding(format!("block {:?} of '{}' has no device on mesh {}", index, name, mesh))
        })?;
        files[owner].blocks.push(StoredBlock {
            tensor: name.to_string(),
            index: index.to_vec(),
            data: data.to_vec(),
        });
    }
    Ok(())
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(unix)]
fn sync_dir(path: &Path) -> Result<()> {
    File::open(path)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_path: &Path) -> Result<()> {
    Ok(())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write `record` below `root`. Blocking; returns the step directory.
///
/// The manifest is written to a temporary name, synced and renamed into
/// place only after every shard file is durable.
pub fn write_checkpoint(root: &Path, record: &CheckpointRecord) -> Result<PathBuf> {
    let step_dir = root.join(step_dir_name(record.step));
    if step_dir.join(MANIFEST_FILE).exists() {
        warn!("Checkpoint for step {} already durable, not rewriting", record.step);
        return Ok(step_dir);
    }
    if step_dir.exists() {
        fs::remove_dir_all(&step_dir)?;
    }
    fs::create_dir_all(&step_dir)?;

    let mesh = &record.mesh;
    let n = mesh.size();
    let mut param_files: Vec<ShardFile> = (0..n).map(|_| ShardFile::default()).collect();
    let mut opt_files: Vec<ShardFile> = (0..n).map(|_| ShardFile::default()).collect();

    let mut nodes = Vec::new();
    for (path, node) in record.params.nodes() {
        let kind = match node {
            ParamNode::Dense(_) => NodeKind::Dense,
            ParamNode::Adapted(adapted) => NodeKind::Adapted {
                rank: adapted.rank(),
                scaling: adapted.scaling,
                merged: adapted.merged,
            },
        };
        nodes.push(NodeEntry {
            path: path.clone(),
            kind,
        });
    }

    let mut leaves = Vec::new();
    for (path, leaf) in record.params.leaves() {
        distribute(&mut param_files, &path, &leaf.array, mesh)?;
        leaves.push(LeafEntry {
            path,
            shape: leaf.shape().to_vec(),
            spec: leaf.partition_spec().clone(),
            parts: leaf.array.parts().to_vec(),
            dtype: leaf.dtype,
            trainable: leaf.trainable,
            allow_padding: leaf.allow_padding,
        });
    }

    for (path, moments) in &record.opt_state.moments {
        distribute(&mut opt_files, &format!("{}{}", path, MOMENT_M), &moments.m, mesh)?;
        distribute(&mut opt_files, &format!("{}{}", path, MOMENT_V), &moments.v, mesh)?;
    }

    let mut files = Vec::with_capacity(2 * n);
    for (kind, shards) in [("params", &param_files), ("opt", &opt_files)] {
        for (k, shard) in shards.iter().enumerate() {
            let name = shard_file_name(kind, k, n);
            let bytes = bincode::serialize(shard)?;
            write_synced(&step_dir.join(&name), &bytes)?;
            files.push(FileEntry {
                name,
                bytes: bytes.len() as u64,
                sha256: sha256_hex(&bytes),
            });
        }
    }

    let manifest = Manifest {
        format_version: FORMAT_VERSION,
        step: record.step,
        epoch: record.epoch,
        timestamp: record.timestamp,
        config_hash: record.config_hash.clone(),
        mesh: mesh.axes().to_vec(),
        nodes,
        leaves,
        optimizer_step: record.opt_state.step,
        optimizer_leaves: record.opt_state.moments.keys().cloned().collect(),
        files,
        metrics: record.metrics.clone(),
    };

    let tmp = step_dir.join(format!("{}.tmp", MANIFEST_FILE));
    write_synced(&tmp, &serde_json::to_vec_pretty(&manifest)?)?;
    fs::rename(&tmp, step_dir.join(MANIFEST_FILE))?;
    sync_dir(&step_dir)?;
    sync_dir(root)?;

    debug!("Wrote {} shard files for step {}", manifest.files.len(), record.step);
    Ok(step_dir)
}

/// A checkpoint as stored, before resharding to the current mesh.
#[derive(Debug, Clone)]
pub struct StoredCheckpoint {
    pub manifest: Manifest,
    pub params: ParameterTree,
    pub opt_state: OptimizerState,
}

/// Read the manifest of a step directory.
pub fn read_manifest(step_dir: &Path) -> Result<Manifest> {
    let path = step_dir.join(MANIFEST_FILE);
    let bytes = fs::read(&path).map_err(|e| {
        Error::CheckpointNotFound(format!("{}: {}", path.display(), e))
    })?;
    let manifest: Manifest = serde_json::from_slice(&bytes)
        .map_err(|e| Error::corrupt(format!("{}: unreadable manifest: {}", path.display(), e)))?;
    if manifest.format_version != FORMAT_VERSION {
        return Err(Error::corrupt(format!(
            "{}: unsupported format version {}",
            path.display(),
            manifest.format_version
        )));
    }
    Ok(manifest)
}

/// Load and validate every shard of a durable checkpoint.
pub fn read_checkpoint(step_dir: &Path) -> Result<StoredCheckpoint> {
    let manifest = read_manifest(step_dir)?;

    let mut blocks: BTreeMap<String, Vec<(Vec<usize>, Vec<f32>)>> = BTreeMap::new();
    for entry in &manifest.files {
        let path = step_dir.join(&entry.name);
        let bytes = fs::read(&path)
            .map_err(|e| Error::corrupt(format!("{}: {}", path.display(), e)))?;
        if bytes.len() as u64 != entry.bytes || sha256_hex(&bytes) != entry.sha256 {
            return Err(Error::corrupt(format!("{}: checksum mismatch", path.display())));
        }
        let shard: ShardFile = bincode::deserialize(&bytes)
            .map_err(|e| Error::corrupt(format!("{}: {}", path.display(), e)))?;
        for block in shard.blocks {
            blocks.entry(block.tensor).or_default().push((block.index, block.data));
        }
    }

    let mut leaves: HashMap<String, ParamLeaf> = HashMap::new();
    let mut layouts: HashMap<&str, &LeafEntry> = HashMap::new();
    for entry in &manifest.leaves {
        let stored = blocks.remove(&entry.path).unwrap_or_default();
        let array = rebuild(entry, stored, &entry.path)?;
        leaves.insert(
            entry.path.clone(),
            ParamLeaf {
                array,
                dtype: entry.dtype,
                trainable: entry.trainable,
                allow_padding: entry.allow_padding,
            },
        );
        layouts.insert(entry.path.as_str(), entry);
    }

    let mut params = ParameterTree::new();
    for node in &manifest.nodes {
        let mut take = |path: &str| {
            leaves
                .remove(path)
                .ok_or_else(|| Error::corrupt(format!("manifest lists node '{}' without leaf '{}'", node.path, path)))
        };
        let built = match node.kind {
            NodeKind::Dense => ParamNode::Dense(take(&node.path)?),
            NodeKind::Adapted { rank, scaling, merged } => {
                let adapted = AdaptedLinear {
                    base: take(&node.path)?,
                    lora_a: take(&format!("{}{}", node.path, LORA_A_SUFFIX))?,
                    lora_b: take(&format!("{}{}", node.path, LORA_B_SUFFIX))?,
                    scaling,
                    merged,
                };
                if adapted.rank() != rank {
                    return Err(Error::corrupt(format!(
                        "adapter '{}' has rank {}, manifest says {}",
                        node.path,
                        adapted.rank(),
                        rank
                    )));
                }
                ParamNode::Adapted(adapted)
            }
        };
        params.insert(node.path.clone(), built);
    }
    if let Some(orphan) = leaves.keys().next() {
        return Err(Error::corrupt(format!("leaf '{}' belongs to no node", orphan)));
    }

    let mut moments = BTreeMap::new();
    for path in &manifest.optimizer_leaves {
        let layout = layouts
            .get(path.as_str())
            .ok_or_else(|| Error::corrupt(format!("optimizer state for unknown leaf '{}'", path)))?;
        let m_name = format!("{}{}", path, MOMENT_M);
        let v_name = format!("{}{}", path, MOMENT_V);
        let m = rebuild(layout, blocks.remove(&m_name).unwrap_or_default(), &m_name)?;
        let v = rebuild(layout, blocks.remove(&v_name).unwrap_or_default(), &v_name)?;
        moments.insert(path.clone(), Moments { m, v });
    }
    let opt_state = OptimizerState {
        step: manifest.optimizer_step,
        moments,
    };
    opt_state
        .check_matches(&params)
        .map_err(|e| Error::corrupt(e.to_string()))?;

    Ok(StoredCheckpoint {
        manifest,
        params,
        opt_state,
    })
}

fn rebuild(entry: &LeafEntry, blocks: Vec<(Vec<usize>, Vec<f32>)>, name: &str) -> Result<ShardedArray> {
    ShardedArray::from_blocks(entry.shape.clone(), entry.spec.clone(), entry.parts.clone(), blocks)
        .map_err(|e| Error::corrupt(format!("tensor '{}': {}", name, e)))
}

/// A durable checkpoint on disk.
#[derive(Debug, Clone)]
pub struct CheckpointInfo {
    pub step: u64,
    pub path: PathBuf,
    /// `None` when the manifest exists but cannot be parsed
    pub manifest: Option<Manifest>,
}

/// Step directories below `root`, with whether each has a manifest.
fn step_dirs(root: &Path) -> Result<Vec<(u64, PathBuf, bool)>> {
    let mut dirs = Vec::new();
    if !root.exists() {
        return Ok(dirs);
    }
    for entry in fs::read_dir(root)? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        let Some(step) = path.file_name().and_then(|n| n.to_str()).and_then(parse_step_dir) else {
            continue;
        };
        let durable = path.join(MANIFEST_FILE).is_file();
        dirs.push((step, path, durable));
    }
    dirs.sort_by_key(|(step, _, _)| *step);
    Ok(dirs)
}

/// Durable checkpoints sorted by step.
pub fn list_checkpoints(root: &Path) -> Result<Vec<CheckpointInfo>> {
    Ok(step_dirs(root)?
        .into_iter()
        .filter(|(_, _, durable)| *durable)
        .map(|(step, path, _)| {
            let manifest = read_manifest(&path).ok();
            CheckpointInfo { step, path, manifest }
        })
        .collect())
}

/// Remove step directories that never received a manifest.
pub fn remove_incomplete(root: &Path) -> Result<Vec<u64>> {
    let mut removed = Vec::new();
    for (step, path, durable) in step_dirs(root)? {
        if durable {
            continue;
        }
        warn!("Removing incomplete checkpoint at {}", path.display());
        fs::remove_dir_all(&path)?;
        removed.push(step);
    }
    Ok(removed)
}

/// Delete the oldest durable checkpoints so that at most `max_to_keep` remain.
pub fn apply_retention(root: &Path, max_to_keep: usize) -> Result<Vec<u64>> {
    let durable: Vec<(u64, PathBuf)> = step_dirs(root)?
        .into_iter()
        .filter(|(_, _, durable)| *durable)
        .map(|(step, path, _)| (step, path))
        .collect();
    let keep = max_to_keep.max(1);
    if durable.len() <= keep {
        return Ok(Vec::new());
    }
    let excess = durable.len() - keep;
    let mut removed = Vec::with_capacity(excess);
    for (step, path) in durable.into_iter().take(excess) {
        fs::remove_dir_all(&path)?;
        info!("Removed checkpoint for step {} (retention)", step);
        removed.push(step);
    }
    Ok(removed)
}

/// Device whose shard file holds block `index` of `array`.
pub fn primary_device(array: &ShardedArray, mesh: &Mesh, index: &[usize]) -> Result<Option<Device>> {
    let owners = primary_devices(array, mesh)?;
    Ok(owners
        .get(index)
        .and_then(|&linear| mesh.devices().get(linear).copied()))
}
