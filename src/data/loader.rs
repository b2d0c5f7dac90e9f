//! Epoch-shuffled batch loader with a bounded prefetch queue.

use super::collate::{collate, Batch, CollateOptions};
use super::Example;
use crate::config::DataConfig;
use crate::error::{Error, Result};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Where the loader is in the batch sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct LoaderPosition {
    pub epoch: u64,
    /// Batch index within the epoch
    pub offset: usize,
}

/// A batch tagged with its position.
#[derive(Debug, Clone)]
pub struct LoadedBatch {
    pub position: LoaderPosition,
    pub batch: Batch,
}

/// Produces train batches; every epoch uses its own seeded permutation and
/// drops the trailing partial batch.
#[derive(Debug, Clone)]
pub struct BatchLoader {
    examples: Arc<Vec<Example>>,
    batch_size: usize,
    options: CollateOptions,
    seed: u64,
    num_epochs: u64,
    prefetch: usize,
}

impl BatchLoader {
    pub fn new(examples: Vec<Example>, config: &DataConfig, num_epochs: u64) -> Result<Self> {
        if examples.len() < config.batch_size {
            return Err(Error::data(format!(
                "{} training examples cannot fill a batch of {}",
                examples.len(),
                config.batch_size
            )));
        }
        Ok(Self {
            examples: Arc::new(examples),
            batch_size: config.batch_size,
            options: CollateOptions::from(config),
            seed: config.seed,
            num_epochs,
            prefetch: config.num_workers.max(1),
        })
    }

    pub fn batches_per_epoch(&self) -> usize {
        self.examples.len() / self.batch_size
    }

    pub fn num_epochs(&self) -> u64 {
        self.num_epochs
    }

    /// Total batches over the epoch budget.
    pub fn total_batches(&self) -> u64 {
        self.batches_per_epoch() as u64 * self.num_epochs
    }

    /// Position after `consumed` batches.
    pub fn position_for_step(&self, consumed: u64) -> LoaderPosition {
        let per_epoch = self.batches_per_epoch() as u64;
        LoaderPosition {
            epoch: consumed / per_epoch,
            offset: (consumed % per_epoch) as usize,
        }
    }

    fn epoch_order(&self, epoch: u64) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.examples.len()).collect();
        let mut rng = ChaCha8Rng::seed_from_u64(epoch_seed(self.seed, epoch));
        order.shuffle(&mut rng);
        order
    }

    fn collate_slice(&self, order: &[usize], offset: usize) -> Result<Batch> {
        let rows: Vec<Example> = order[offset * self.batch_size..(offset + 1) * self.batch_size]
            .iter()
            .map(|&i| self.examples[i].clone())
            .collect();
        collate(&rows, &self.options)
    }

    /// Batch at `position`, computed without the prefetch queue.
    pub fn batch_at(&self, position: LoaderPosition) -> Result<Batch> {
        if position.offset >= self.batches_per_epoch() {
            return Err(Error::data(format!(
                "batch offset {} out of range for {} batches per epoch",
                position.offset,
                self.batches_per_epoch()
            )));
        }
        let order = self.epoch_order(position.epoch);
        self.collate_slice(&order, position.offset)
    }

    /// Start producing batches from `start` on a blocking thread. At most
    /// `num_workers` batches are buffered ahead of the consumer.
    pub fn spawn(&self, start: LoaderPosition) -> mpsc::Receiver<Result<LoadedBatch>> {
        let (tx, rx) = mpsc::channel(self.prefetch);
        let loader = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut offset = start.offset;
            for epoch in start.epoch..loader.num_epochs {
                let order = loader.epoch_order(epoch);
                while offset < loader.batches_per_epoch() {
                    let position = LoaderPosition { epoch, offset };
                    let item = loader
                        .collate_slice(&order, offset)
                        .map(|batch| LoadedBatch { position, batch });
                    if tx.blocking_send(item).is_err() {
                        debug!("Batch consumer went away at {:?}", position);
                        return;
                    }
                    offset += 1;
                }
                offset = 0;
            }
        });
        rx
    }
}

fn epoch_seed(seed: u64, epoch: u64) -> u64 {
    seed ^ epoch.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// Held-out batches in order, at most `max_batches` of them. The last batch
/// may be short.
pub fn eval_batches(examples: &[Example], config: &DataConfig, max_batches: Option<usize>) -> Result<Vec<Batch>> {
    let options = CollateOptions::from(config);
    examples
        .chunks(config.batch_size)
        .take(max_batches.unwrap_or(usize::MAX))
        .map(|chunk| collate(chunk, &options))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;

    fn data_config(batch_size: usize, num_workers: usize) -> DataConfig {
        let toml = format!(
            r#"
            [data_config]
            data_source = "unused"
            batch_size = {}
            max_seq_length = 4
            num_workers = {}

            [trainer_config]
            model_name = "tiny-causal-lm"
            num_tpus = 1

            [checkpointer_config]
            checkpoint_dir = "unused"
            "#,
            batch_size, num_workers
        );
        RunConfig::from_toml_str(&toml).unwrap().data_config
    }

    fn examples(n: u32) -> Vec<Example> {
        (0..n).map(|i| Example::new(vec![i], vec![i])).collect()
    }

    #[test]
    fn test_epochs_drop_partial_batch() {
        let loader = BatchLoader::new(examples(10), &data_config(4, 2), 3).unwrap();
        assert_eq!(loader.batches_per_epoch(), 2);
        assert_eq!(loader.total_batches(), 6);
        assert_eq!(loader.position_for_step(5), LoaderPosition { epoch: 2, offset: 1 });
        assert_ne!(loader.epoch_order(0), loader.epoch_order(1));
        assert!(loader.batch_at(LoaderPosition { epoch: 0, offset: 2 }).is_err());
        assert!(BatchLoader::new(examples(3), &data_config(4, 2), 1).is_err());
    }

    #[tokio::test]
    async fn test_prefetch_resumes_identically() {
        let loader = BatchLoader::new(examples(12), &data_config(2, 2), 2).unwrap();
        let mut rx = loader.spawn(LoaderPosition::default());
        let mut all = Vec::new();
        while let Some(item) = rx.recv().await {
            all.push(item.unwrap());
        }
        assert_eq!(all.len(), 12);

        let start = loader.position_for_step(7);
        let mut rx = loader.spawn(start);
        let mut resumed = Vec::new();
        while let Some(item) = rx.recv().await {
            resumed.push(item.unwrap());
        }
        assert_eq!(resumed.len(), 5);
        for (a, b) in all[7..].iter().zip(&resumed) {
            assert_eq!(a.position, b.position);
            assert_eq!(a.batch, b.batch);
        }
        assert_eq!(resumed[0].batch, loader.batch_at(start).unwrap());
    }

    #[test]
    fn test_eval_batches_keep_order() {
        let config = data_config(4, 1);
        let batches = eval_batches(&examples(10), &config, None).unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].batch_size(), 2);
        assert_eq!(batches[0].input_ids[1][0], 1);
        assert_eq!(eval_batches(&examples(10), &config, Some(1)).unwrap().len(), 1);
    }
}
