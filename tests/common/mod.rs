//! Shared fixtures for integration tests.
#![allow(dead_code)]

use meshtune_core::config::RunConfig;
use meshtune_core::data::{Example, InMemorySource};
use meshtune_core::mesh::DeviceSet;
use meshtune_core::training::Trainer;
use std::path::Path;

pub const MODEL: &str = "tiny-causal-lm:16x8";

/// Deterministic synthetic examples with token ids below 16.
pub fn examples(n: u32) -> Vec<Example> {
    (0..n)
        .map(|i| {
            Example::new(
                vec![i % 16, (i + 3) % 16],
                vec![(i * 7) % 16, (i + 1) % 16, (i + 5) % 16],
            )
        })
        .collect()
}

/// Knobs the tests vary.
#[derive(Debug, Clone)]
pub struct Setup {
    pub num_tpus: usize,
    pub mesh_shape: &'static str,
    pub num_steps: u64,
    pub num_epochs: u64,
    pub use_lora: bool,
    pub lora_rank: usize,
    pub save_interval: u64,
    pub max_to_keep: usize,
    pub restore: bool,
    pub async_save: bool,
    pub fallback: bool,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            num_tpus: 4,
            mesh_shape: "[1, 2, 2]",
            num_steps: 10,
            num_epochs: 50,
            use_lora: true,
            lora_rank: 2,
            save_interval: 100,
            max_to_keep: 3,
            restore: false,
            async_save: true,
            fallback: false,
        }
    }
}

impl Setup {
    pub fn config(&self, checkpoint_dir: &Path) -> RunConfig {
        let text = format!(
            r#"
            [data_config]
            data_source = "in-memory"
            batch_size = 4
            max_seq_length = 8
            num_workers = 2
            mask_prompt = true

            [trainer_config]
            model_name = "{model}"
            num_tpus = {num_tpus}
            mesh_shape = {mesh_shape}
            num_steps = {num_steps}
            num_epochs = {num_epochs}
            learning_rate = 0.01
            use_lora = {use_lora}
            lora_rank = {lora_rank}
            log_interval = 5
            eval_interval = 1000
            eval_max_batches = 2
            restore_checkpoint = {restore}

            [checkpointer_config]
            checkpoint_dir = "{dir}"
            save_interval_steps = {save_interval}
            max_to_keep = {max_to_keep}
            enable_async_checkpointing = {async_save}
            fallback_to_fresh_init = {fallback}
            "#,
            model = MODEL,
            num_tpus = self.num_tpus,
            mesh_shape = self.mesh_shape,
            num_steps = self.num_steps,
            num_epochs = self.num_epochs,
            use_lora = self.use_lora,
            lora_rank = self.lora_rank,
            restore = self.restore,
            dir = checkpoint_dir.display(),
            save_interval = self.save_interval,
            max_to_keep = self.max_to_keep,
            async_save = self.async_save,
            fallback = self.fallback,
        );
        RunConfig::from_toml_str(&text).unwrap()
    }

    pub async fn trainer(&self, checkpoint_dir: &Path) -> meshtune_core::Result<Trainer> {
        self.trainer_with(checkpoint_dir, examples(40)).await
    }

    pub async fn trainer_with(&self, checkpoint_dir: &Path, data: Vec<Example>) -> meshtune_core::Result<Trainer> {
        let config = self.config(checkpoint_dir);
        let source = InMemorySource::new(data);
        Trainer::with_source(config, &DeviceSet::local(self.num_tpus), &source).await
    }
}
