//! Run configuration for meshtune.
//!
//! A run is described by one structured document with three sections:
//! `data_config`, `trainer_config` and `checkpointer_config`. Sources are
//! applied in order of precedence, later ones overriding earlier ones:
//! 1. The configuration file (TOML, YAML or JSON, chosen by extension)
//! 2. Environment variables prefixed with `MESHTUNE__`, using `__` to
//!    separate nested keys, e.g. `MESHTUNE__TRAINER_CONFIG__NUM_STEPS=20`
//!
//! Unknown fields are rejected and missing required fields fail with a
//! [`Error::Config`] naming the field, before any compute starts.

use crate::error::{Error, Result};
use crate::sharding::ShardingRule;
use crate::tensor::DType;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Environment prefix for configuration overrides.
pub const ENV_PREFIX: &str = "MESHTUNE";

/// Complete configuration of a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub data_config: DataConfig,
    pub trainer_config: TrainerConfig,
    pub checkpointer_config: CheckpointerConfig,
}

/// Dataset and batching configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataConfig {
    /// Dataset source identifier (a JSONL file or a directory of `<split>.jsonl`)
    pub data_source: String,
    /// Optional cap on loaded examples
    #[serde(default)]
    pub max_examples: Option<usize>,
    #[serde(default = "default_split")]
    pub split: String,
    /// Fraction of examples held out for evaluation
    #[serde(default = "default_train_test_split")]
    pub train_test_split: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_seq_length")]
    pub max_seq_length: usize,
    /// Prefetch depth of the batch queue
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// Label value excluded from the loss
    #[serde(default = "default_ignore_index")]
    pub ignore_index: i64,
    #[serde(default)]
    pub mask_prompt: bool,
    #[serde(default)]
    pub pad_id: u32,
}

/// Model, mesh and optimization configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainerConfig {
    pub model_name: String,
    /// Precision of parameters at rest
    #[serde(default)]
    pub param_dtype: DType,
    /// Precision the loss and gradients are computed in
    #[serde(default, alias = "output_dtype")]
    pub compute_dtype: DType,

    #[serde(default = "default_num_epochs")]
    pub num_epochs: u64,
    /// Step budget; `None` trains until the epoch budget is exhausted
    #[serde(default)]
    pub num_steps: Option<u64>,

    /// Number of accelerators the mesh spans
    pub num_tpus: usize,
    /// Logical mesh shape; derived from `num_tpus` when omitted
    #[serde(default)]
    pub mesh_shape: Option<Vec<usize>>,
    #[serde(default = "default_mesh_axis_names")]
    pub mesh_axis_names: Vec<String>,
    /// Mesh axes the batch is split across
    #[serde(default = "default_data_parallel_axes")]
    pub data_parallel_axes: Vec<String>,
    /// Mesh axis large parameter matrices are split across
    #[serde(default = "default_model_axis")]
    pub model_axis: String,
    /// Explicit placements; leaves no rule matches use the default policy
    #[serde(default)]
    pub sharding_rules: Vec<ShardingRule>,

    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default)]
    pub max_grad_norm: Option<f64>,

    #[serde(default = "default_use_lora")]
    pub use_lora: bool,
    #[serde(default = "default_lora_rank")]
    pub lora_rank: usize,
    /// Adapter scaling numerator; the scaling is `lora_alpha / lora_rank`
    #[serde(default)]
    pub lora_alpha: Option<f32>,
    /// Layer path fragments to adapt; empty adapts every adaptable layer
    #[serde(default)]
    pub lora_target_modules: Vec<String>,

    #[serde(default = "default_log_interval")]
    pub log_interval: u64,
    #[serde(default = "default_eval_interval")]
    pub eval_interval: u64,
    #[serde(default)]
    pub eval_max_batches: Option<usize>,

    #[serde(default)]
    pub restore_checkpoint: bool,
    /// Step to restore; `None` restores the latest durable checkpoint
    #[serde(default)]
    pub restore_step: Option<u64>,

    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    /// Seed for parameter and adapter initialization
    #[serde(default = "default_seed")]
    pub seed: u64,
}

/// Checkpoint persistence configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointerConfig {
    pub checkpoint_dir: PathBuf,
    #[serde(default = "default_max_to_keep")]
    pub max_to_keep: usize,
    #[serde(default = "default_save_interval_steps")]
    pub save_interval_steps: u64,
    #[serde(default = "default_enable_async")]
    pub enable_async_checkpointing: bool,
    /// Retries after a failed checkpoint write before the failure is surfaced
    #[serde(default = "default_max_write_retries")]
    pub max_write_retries: u32,
    /// Start from fresh weights when restore finds nothing usable
    #[serde(default)]
    pub fallback_to_fresh_init: bool,
}

impl RunConfig {
    /// Load configuration from a file plus environment overrides and validate it.
    pub fn load(path: &Path) -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            );

        let config: RunConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate an inline TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: RunConfig = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check every cross-field invariant.
    pub fn validate(&self) -> Result<()> {
        self.data_config.validate()?;
        self.trainer_config.validate()?;
        self.checkpointer_config.validate()?;
        Ok(())
    }

    /// SHA-256 over the canonical JSON encoding, recorded with every checkpoint.
    pub fn config_hash(&self) -> Result<String> {
        // serde_json keeps struct field order, so the encoding is stable
        let encoded = serde_json::to_vec(self)?;
        let mut hasher = Sha256::new();
        hasher.update(&encoded);
        Ok(hex::encode(hasher.finalize()))
    }
}

impl DataConfig {
    pub fn validate(&self) -> Result<()> {
        if self.data_source.trim().is_empty() {
            return Err(Error::config("data_config.data_source must not be empty"));
        }
        if !(self.train_test_split > 0.0 && self.train_test_split < 1.0) {
            return Err(Error::config(format!(
                "data_config.train_test_split must be strictly between 0 and 1, got {}",
                self.train_test_split
            )));
        }
        if self.batch_size == 0 {
            return Err(Error::config("data_config.batch_size must be > 0"));
        }
        if self.max_seq_length == 0 {
            return Err(Error::config("data_config.max_seq_length must be > 0"));
        }
        if self.max_examples == Some(0) {
            return Err(Error::config("data_config.max_examples must be > 0 when set"));
        }
        Ok(())
    }
}

impl TrainerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.model_name.trim().is_empty() {
            return Err(Error::config("trainer_config.model_name must not be empty"));
        }
        if self.num_tpus == 0 {
            return Err(Error::config("trainer_config.num_tpus must be > 0"));
        }

        let shape = self.resolved_mesh_shape()?;
        if shape.iter().any(|&s| s == 0) {
            return Err(Error::config(format!(
                "trainer_config.mesh_shape entries must be positive, got {:?}",
                shape
            )));
        }
        let product: usize = shape.iter().product();
        if product != self.num_tpus {
            return Err(Error::config(format!(
                "trainer_config.mesh_shape {:?} spans {} devices but num_tpus is {}",
                shape, product, self.num_tpus
            )));
        }
        if shape.len() != self.mesh_axis_names.len() {
            return Err(Error::config(format!(
                "trainer_config.mesh_axis_names has {} names for a rank-{} mesh",
                self.mesh_axis_names.len(),
                shape.len()
            )));
        }
        for axis in &self.data_parallel_axes {
            if !self.mesh_axis_names.contains(axis) {
                return Err(Error::config(format!(
                    "data parallel axis '{}' is not a mesh axis",
                    axis
                )));
            }
        }
        if !self.mesh_axis_names.contains(&self.model_axis) {
            return Err(Error::config(format!(
                "model axis '{}' is not a mesh axis",
                self.model_axis
            )));
        }
        if self.data_parallel_axes.contains(&self.model_axis) {
            return Err(Error::config(format!(
                "model axis '{}' cannot also be a data parallel axis",
                self.model_axis
            )));
        }

        if self.num_epochs == 0 {
            return Err(Error::config("trainer_config.num_epochs must be > 0"));
        }
        if self.num_steps == Some(0) {
            return Err(Error::config("trainer_config.num_steps must be > 0 when set"));
        }
        if self.log_interval == 0 {
            return Err(Error::config("trainer_config.log_interval must be > 0"));
        }
        if self.eval_interval == 0 {
            return Err(Error::config("trainer_config.eval_interval must be > 0"));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(Error::config(format!(
                "trainer_config.learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if let Some(norm) = self.max_grad_norm {
            if !(norm.is_finite() && norm > 0.0) {
                return Err(Error::config("trainer_config.max_grad_norm must be positive"));
            }
        }
        if self.use_lora && self.lora_rank == 0 {
            return Err(Error::config(
                "trainer_config.lora_rank must be > 0 when use_lora is enabled",
            ));
        }
        Ok(())
    }

    /// Mesh shape from config, or the default layout for the accelerator count.
    pub fn resolved_mesh_shape(&self) -> Result<Vec<usize>> {
        if let Some(shape) = &self.mesh_shape {
            return Ok(shape.clone());
        }
        match self.num_tpus {
            1 => Ok(vec![1, 1, 1]),
            4 => Ok(vec![1, 2, 2]),
            8 => Ok(vec![2, 2, 2]),
            n => Err(Error::config(format!(
                "no default mesh shape for {} accelerators; set trainer_config.mesh_shape",
                n
            ))),
        }
    }

    /// Adapter rank in effect; zero when LoRA is disabled.
    pub fn effective_lora_rank(&self) -> usize {
        if self.use_lora {
            self.lora_rank
        } else {
            0
        }
    }
}

impl CheckpointerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_to_keep == 0 {
            return Err(Error::config("checkpointer_config.max_to_keep must be >= 1"));
        }
        if self.save_interval_steps == 0 {
            return Err(Error::config(
                "checkpointer_config.save_interval_steps must be > 0",
            ));
        }
        Ok(())
    }
}

fn default_split() -> String {
    "train".to_string()
}

fn default_train_test_split() -> f64 {
    0.15
}

fn default_seed() -> u64 {
    42
}

fn default_batch_size() -> usize {
    32
}

fn default_max_seq_length() -> usize {
    2048
}

fn default_num_workers() -> usize {
    num_cpus::get().clamp(1, 4)
}

fn default_ignore_index() -> i64 {
    -100
}

fn default_num_epochs() -> u64 {
    1
}

fn default_mesh_axis_names() -> Vec<String> {
    vec!["replica".to_string(), "data".to_string(), "model".to_string()]
}

fn default_data_parallel_axes() -> Vec<String> {
    vec!["replica".to_string(), "data".to_string()]
}

fn default_model_axis() -> String {
    "model".to_string()
}

fn default_learning_rate() -> f64 {
    1e-3
}

fn default_use_lora() -> bool {
    true
}

fn default_lora_rank() -> usize {
    4
}

fn default_log_interval() -> u64 {
    10
}

fn default_eval_interval() -> u64 {
    100
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("./runs")
}

fn default_max_to_keep() -> usize {
    3
}

fn default_save_interval_steps() -> u64 {
    100
}

fn default_enable_async() -> bool {
    true
}

fn default_max_write_retries() -> u32 {
    3
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [data_config]
        data_source = "data/alpaca"
        batch_size = 8
        max_seq_length = 64

        [trainer_config]
        model_name = "tiny-causal-lm"
        num_tpus = 8
        mesh_shape = [1, 2, 4]
        num_steps = 5
        use_lora = true
        lora_rank = 4

        [checkpointer_config]
        checkpoint_dir = "/tmp/ckpt"
    "#;

    #[test]
    fn test_config_defaults() {
        let config = RunConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.data_config.split, "train");
        assert_eq!(config.data_config.ignore_index, -100);
        assert!((config.data_config.train_test_split - 0.15).abs() < 1e-12);
        assert_eq!(config.trainer_config.param_dtype, DType::Float32);
        assert_eq!(config.trainer_config.mesh_axis_names.len(), 3);
        assert_eq!(config.trainer_config.log_interval, 10);
        assert_eq!(config.checkpointer_config.max_to_keep, 3);
        assert!(config.checkpointer_config.enable_async_checkpointing);
    }

    #[test]
    fn test_mesh_product_must_match_devices() {
        let bad = SAMPLE.replace("num_tpus = 8", "num_tpus = 4");
        let err = RunConfig::from_toml_str(&bad).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("num_tpus"));
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let bad = SAMPLE.replace("use_lora = true", "use_lora = true\nlora_ranks = 2");
        assert!(matches!(
            RunConfig::from_toml_str(&bad),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_missing_required_field_is_named() {
        let bad = SAMPLE.replace("model_name = \"tiny-causal-lm\"", "");
        let err = RunConfig::from_toml_str(&bad).unwrap_err();
        assert!(err.to_string().contains("model_name"));
    }

    #[test]
    fn test_output_dtype_alias() {
        let text = SAMPLE.replace("num_steps = 5", "num_steps = 5\noutput_dtype = \"bfloat16\"");
        let config = RunConfig::from_toml_str(&text).unwrap();
        assert_eq!(config.trainer_config.compute_dtype, DType::BFloat16);
    }

    #[test]
    fn test_default_mesh_from_device_count() {
        let text = SAMPLE.replace("mesh_shape = [1, 2, 4]", "");
        let config = RunConfig::from_toml_str(&text).unwrap();
        assert_eq!(
            config.trainer_config.resolved_mesh_shape().unwrap(),
            vec![2, 2, 2]
        );

        let text = text.replace("num_tpus = 8", "num_tpus = 6");
        assert!(RunConfig::from_toml_str(&text).is_err());
    }

    #[test]
    fn test_invariants() {
        let mut config = RunConfig::from_toml_str(SAMPLE).unwrap();
        config.data_config.train_test_split = 1.0;
        assert!(config.validate().is_err());

        let mut config = RunConfig::from_toml_str(SAMPLE).unwrap();
        config.trainer_config.eval_interval = 0;
        assert!(config.validate().is_err());

        let mut config = RunConfig::from_toml_str(SAMPLE).unwrap();
        config.trainer_config.lora_rank = 0;
        assert!(config.validate().is_err());
        config.trainer_config.use_lora = false;
        assert!(config.validate().is_ok());
        assert_eq!(config.trainer_config.effective_lora_rank(), 0);

        let mut config = RunConfig::from_toml_str(SAMPLE).unwrap();
        config.checkpointer_config.max_to_keep = 0;
        assert!(config.validate().is_err());

        let mut config = RunConfig::from_toml_str(SAMPLE).unwrap();
        config.trainer_config.data_parallel_axes = vec!["model".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_hash_tracks_content() {
        let a = RunConfig::from_toml_str(SAMPLE).unwrap();
        let mut b = a.clone();
        assert_eq!(a.config_hash().unwrap(), b.config_hash().unwrap());
        b.trainer_config.learning_rate = 5e-4;
        assert_ne!(a.config_hash().unwrap(), b.config_hash().unwrap());
        assert_eq!(a.config_hash().unwrap().len(), 64);
    }

    #[cfg(unix)]
    #[test]
    fn test_config_hash_reports_unencodable_config() {
        use std::os::unix::ffi::OsStrExt;
        let mut config = RunConfig::from_toml_str(SAMPLE).unwrap();
        config.trainer_config.base_dir = PathBuf::from(std::ffi::OsStr::from_bytes(b"runs/\xff"));
        assert!(matches!(config.config_hash(), Err(Error::Serialization(_))));
    }
}
