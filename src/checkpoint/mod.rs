//! Crash-consistent, retention-bounded persistence of training state.

use crate::error::{Error, Result};
use crate::mesh::Mesh;
use crate::optim::OptimizerState;
use crate::params::ParameterTree;
use crate::sharding::ShardingRules;
use crate::training::StepMetrics;
use chrono::{DateTime, Utc};
use std::path::Path;
use tracing::{info, warn};

pub mod layout;
pub mod manager;

pub use layout::{
    apply_retention, list_checkpoints, read_checkpoint, remove_incomplete, write_checkpoint,
    CheckpointInfo, Manifest, MANIFEST_FILE,
};
pub use manager::CheckpointManager;

/// Immutable snapshot handed to the checkpoint manager.
#[derive(Debug, Clone)]
pub struct CheckpointRecord {
    pub step: u64,
    pub epoch: u64,
    pub params: ParameterTree,
    pub opt_state: OptimizerState,
    /// Mesh the snapshot is laid out on
    pub mesh: Mesh,
    pub timestamp: DateTime<Utc>,
    pub config_hash: String,
    pub metrics: Option<StepMetrics>,
}

/// Training state rebuilt from disk and placed on the current mesh.
#[derive(Debug, Clone)]
pub struct RestoredCheckpoint {
    pub step: u64,
    pub epoch: u64,
    pub params: ParameterTree,
    pub opt_state: OptimizerState,
    pub manifest: Manifest,
}

/// Load `step` (or the latest durable step) from `root` and reshard it onto
/// `mesh` with `rules`.
///
/// Incomplete step directories are garbage-collected first, so a crash during
/// a write falls back to the previous durable checkpoint.
pub fn restore_from(
    root: &Path,
    step: Option<u64>,
    mesh: &Mesh,
    rules: &ShardingRules,
) -> Result<RestoredCheckpoint> {
    if !root.exists() {
        return Err(Error::CheckpointNotFound(format!(
            "checkpoint directory {} does not exist",
            root.display()
        )));
    }
    remove_incomplete(root)?;

    let checkpoints = list_checkpoints(root)?;
    let info = match step {
        Some(step) => checkpoints.iter().find(|c| c.step == step).ok_or_else(|| {
            Error::CheckpointNotFound(format!("no checkpoint for step {} in {}", step, root.display()))
        })?,
        None => checkpoints.last().ok_or_else(|| {
            Error::CheckpointNotFound(format!("no durable checkpoint in {}", root.display()))
        })?,
    };

    let stored = read_checkpoint(&info.path)?;
    let manifest = stored.manifest;
    let stored_topology = manifest.mesh_description();
    if manifest.mesh != mesh.axes() {
        info!(
            "Resharding checkpoint for step {} from mesh {} to {}",
            manifest.step, stored_topology, mesh
        );
    }

    let params = stored.params.reshard(mesh, rules)?;
    params.validate_on(mesh)?;
    let opt_state = stored.opt_state.reshard(&params, mesh)?;

    info!(
        "Restored step {} (epoch {}) with {} parameters from {}",
        manifest.step,
        manifest.epoch,
        params.num_parameters(),
        info.path.display()
    );
    Ok(RestoredCheckpoint {
        step: manifest.step,
        epoch: manifest.epoch,
        params,
        opt_state,
        manifest,
    })
}

/// Log a warning when a checkpoint was written under another configuration.
/// Returns whether the hashes match.
pub fn check_config_hash(manifest: &Manifest, current: &str) -> bool {
    if manifest.config_hash == current {
        return true;
    }
    warn!(
        "Checkpoint for step {} was written with config {}, current config is {}",
        manifest.step,
        short_hash(&manifest.config_hash),
        short_hash(current)
    );
    false
}

fn short_hash(hash: &str) -> String {
    hash.chars().take(12).collect()
}
