//! Background checkpoint writer.
//!
//! Saves are handed to a single worker task that writes them strictly in
//! submission order, so at most one write is in flight. A failed write is
//! retried with backoff; once retries are exhausted the failure is stored and
//! returned from the next [`CheckpointManager::save`] or
//! [`CheckpointManager::wait_until_finished`].

use super::layout::{self, CheckpointInfo};
use super::{restore_from, CheckpointRecord, RestoredCheckpoint};
use crate::config::CheckpointerConfig;
use crate::error::{Error, Result};
use crate::mesh::Mesh;
use crate::sharding::ShardingRules;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Saves queued behind the one being written.
const QUEUE_DEPTH: usize = 1;
const BASE_BACKOFF_MS: u64 = 50;

enum WorkItem {
    Save(Box<CheckpointRecord>),
    Flush(oneshot::Sender<()>),
}

#[derive(Default)]
struct Shared {
    failure: Mutex<Option<String>>,
    last_durable: Mutex<Option<u64>>,
}

/// Manages checkpoint persistence for one run.
pub struct CheckpointManager {
    dir: PathBuf,
    config: CheckpointerConfig,
    sender: Option<mpsc::Sender<WorkItem>>,
    worker: Option<JoinHandle<()>>,
    shared: Arc<Shared>,
}

impl CheckpointManager {
    /// Create the checkpoint directory and, in async mode, start the worker.
    /// Must be called within a tokio runtime.
    pub fn new(config: &CheckpointerConfig) -> Result<Self> {
        let dir = config.checkpoint_dir.clone();
        std::fs::create_dir_all(&dir)?;

        let shared = Arc::new(Shared::default());
        let (sender, worker) = if config.enable_async_checkpointing {
            let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
            let handle = tokio::spawn(Self::worker(rx, dir.clone(), config.clone(), shared.clone()));
            (Some(tx), Some(handle))
        } else {
            (None, None)
        };

        Ok(Self {
            dir,
            config: config.clone(),
            sender,
            worker,
            shared,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    pub fn is_async(&self) -> bool {
        self.sender.is_some()
    }

    /// Most recent step this manager committed.
    pub fn last_durable_step(&self) -> Option<u64> {
        *self.shared.last_durable.lock()
    }

    fn take_failure(&self) -> Result<()> {
        match self.shared.failure.lock().clone() {
            Some(msg) => Err(Error::CheckpointWrite(msg)),
            None => Ok(()),
        }
    }

    /// Persist `record`. In async mode this returns once the record is
    /// queued; it only waits when a write is already queued behind the one
    /// in flight.
    pub async fn save(&self, record: CheckpointRecord) -> Result<()> {
        self.take_failure()?;
        match &self.sender {
            Some(sender) => sender
                .send(WorkItem::Save(Box::new(record)))
                .await
                .map_err(|_| Error::Internal("checkpoint worker stopped".to_string())),
            None => persist(&self.dir, &self.config, &self.shared, record).await,
        }
    }

    /// Wait for every queued save to become durable.
    pub async fn wait_until_finished(&self) -> Result<()> {
        if let Some(sender) = &self.sender {
            let (tx, rx) = oneshot::channel();
            sender
                .send(WorkItem::Flush(tx))
                .await
                .map_err(|_| Error::Internal("checkpoint worker stopped".to_string()))?;
            rx.await
                .map_err(|_| Error::Internal("checkpoint worker stopped".to_string()))?;
        }
        self.take_failure()
    }

    /// Flush pending saves and stop the worker.
    pub async fn close(mut self) -> Result<()> {
        let result = self.wait_until_finished().await;
        self.sender.take();
        if let Some(handle) = self.worker.take() {
            handle.await?;
        }
        result
    }

    /// Durable checkpoints sorted by step.
    pub async fn list_checkpoints(&self) -> Result<Vec<CheckpointInfo>> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || layout::list_checkpoints(&dir)).await?
    }

    /// Remove step directories without a manifest.
    pub async fn remove_incomplete(&self) -> Result<Vec<u64>> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || layout::remove_incomplete(&dir)).await?
    }

    /// Load `step` (or the latest) onto `mesh`.
    pub async fn restore(
        &self,
        step: Option<u64>,
        mesh: &Mesh,
        rules: &ShardingRules,
    ) -> Result<RestoredCheckpoint> {
        let dir = self.dir.clone();
        let mesh = mesh.clone();
        let rules = rules.clone();
        tokio::task::spawn_blocking(move || restore_from(&dir, step, &mesh, &rules)).await?
    }

    async fn worker(
        mut rx: mpsc::Receiver<WorkItem>,
        dir: PathBuf,
        config: CheckpointerConfig,
        shared: Arc<Shared>,
    ) {
        while let Some(item) = rx.recv().await {
            match item {
                WorkItem::Save(record) => {
                    if let Err(e) = persist(&dir, &config, &shared, *record).await {
                        *shared.failure.lock() = Some(e.to_string());
                    }
                }
                WorkItem::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
    }
}

/// Write one record with bounded retries, then apply retention.
async fn persist(
    dir: &Path,
    config: &CheckpointerConfig,
    shared: &Shared,
    record: CheckpointRecord,
) -> Result<()> {
    let step = record.step;
    // One initial write plus the configured retries
    let attempts = config.max_write_retries.saturating_add(1);
    let record = Arc::new(record);

    let mut attempt = 0;
    loop {
        attempt += 1;
        let root = dir.to_path_buf();
        let snapshot = record.clone();
        let written = tokio::task::spawn_blocking(move || layout::write_checkpoint(&root, &snapshot)).await?;
        match written {
            Ok(path) => {
                *shared.last_durable.lock() = Some(step);
                info!("Checkpoint saved: step {} at {}", step, path.display());

                let root = dir.to_path_buf();
                let keep = config.max_to_keep;
                match tokio::task::spawn_blocking(move || layout::apply_retention(&root, keep)).await? {
                    Ok(_) => {}
                    Err(e) => warn!("Failed to clean up old checkpoints: {}", e),
                }
                return Ok(());
            }
            Err(e) if attempt < attempts => {
                let backoff = Duration::from_millis(BASE_BACKOFF_MS << (attempt - 1).min(6));
                warn!(
                    "Checkpoint write for step {} failed (attempt {}/{}): {}; retrying in {:?}",
                    step, attempt, attempts, e, backoff
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => {
                error!("Checkpoint write for step {} failed after {} attempts: {}", step, attempts, e);
                return Err(Error::CheckpointWrite(format!("step {}: {}", step, e)));
            }
        }
    }
}

impl Drop for CheckpointManager {
    fn drop(&mut self) {
        // Closing the queue lets the worker finish what is already queued
        self.sender.take();
        if let Some(handle) = self.worker.take() {
            drop(handle);
        }
    }
}
