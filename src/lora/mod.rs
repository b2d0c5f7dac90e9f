//! Low-rank adaptation layered over a frozen base parameter tree.
//!
//! Adapted layers compute `y = W·x + B·(A·x)·scaling`. The adapter layer owns
//! three operations on a [`ParameterTree`](crate::params::ParameterTree):
//! - injection of `A` / `B` factors next to selected base weights
//! - gradient routing so only trainable leaves receive updates
//! - merge and unmerge of the low-rank delta into the base weight

use crate::config::TrainerConfig;
use crate::error::{Error, Result};
use crate::tensor::Tensor;
use rand::Rng;
use serde::{Deserialize, Serialize};

pub mod inject;
pub mod merge;

pub use inject::{effective_weights, inject_adapters, route_gradients};
pub use merge::{adapter_weights, into_dense, merge_adapters, merged_weights, unmerge_adapters, LoRAMerger};

/// Adapter configuration shared by injection and restore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoRAConfig {
    /// Low-rank dimension (r in the paper)
    pub rank: usize,

    /// Scaling numerator; effective scaling is `alpha / rank`
    pub alpha: f32,

    /// Layer path fragments to adapt; empty adapts every adaptable layer
    pub target_modules: Vec<String>,

    /// Initialization of the `A` factor; `B` always starts at zero
    pub init: InitStrategy,
}

impl LoRAConfig {
    pub fn new(rank: usize) -> Self {
        Self {
            rank,
            alpha: rank as f32,
            target_modules: Vec::new(),
            init: InitStrategy::Kaiming,
        }
    }

    /// Adapter configuration of a trainer, `None` when LoRA is disabled.
    pub fn from_trainer_config(config: &TrainerConfig) -> Option<Self> {
        if !config.use_lora {
            return None;
        }
        let rank = config.lora_rank;
        Some(Self {
            rank,
            alpha: config.lora_alpha.unwrap_or(rank as f32),
            target_modules: config.lora_target_modules.clone(),
            init: InitStrategy::Kaiming,
        })
    }

    pub fn scaling(&self) -> f32 {
        if self.rank == 0 {
            0.0
        } else {
            self.alpha / self.rank as f32
        }
    }

    /// Whether the layer at `path` is selected for adaptation.
    pub fn targets(&self, path: &str) -> bool {
        self.target_modules.is_empty() || self.target_modules.iter().any(|t| path.contains(t.as_str()))
    }
}

/// Initialization strategies for adapter factors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum InitStrategy {
    Zeros,
    Random { std: f32 },
    Xavier,
    /// Normal with std `sqrt(2 / fan_in)`
    Kaiming,
}

/// Initialize a `[rows, cols]` adapter factor; `cols` is the fan-in.
pub fn initialize_lora_weights<R: Rng + ?Sized>(
    shape: &[usize],
    strategy: InitStrategy,
    rng: &mut R,
) -> Tensor {
    let (fan_out, fan_in) = match shape {
        [rows, cols] => (*rows, *cols),
        _ => (1, 1),
    };
    match strategy {
        InitStrategy::Zeros => Tensor::zeros(shape),
        InitStrategy::Random { std } => Tensor::randn(shape, std, rng),
        InitStrategy::Xavier => {
            let std = (2.0 / (fan_in + fan_out) as f32).sqrt();
            Tensor::randn(shape, std, rng)
        }
        InitStrategy::Kaiming => {
            let std = (2.0 / fan_in.max(1) as f32).sqrt();
            Tensor::randn(shape, std, rng)
        }
    }
}

/// Validate an adapter rank against a `[out_features, in_features]` weight.
pub fn validate_lora_config(rank: usize, in_features: usize, out_features: usize) -> Result<()> {
    if in_features == 0 || out_features == 0 {
        return Err(Error::adapter("feature dimensions must be positive"));
    }
    if rank == 0 || rank > in_features.min(out_features) {
        return Err(Error::adapter(format!(
            "invalid rank {}: must be between 1 and min({}, {})",
            rank, in_features, out_features
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_validate_config() {
        assert!(validate_lora_config(16, 768, 768).is_ok());

        assert!(matches!(validate_lora_config(0, 768, 768), Err(Error::Adapter(_))));
        assert!(validate_lora_config(1000, 768, 768).is_err());

        assert!(validate_lora_config(16, 0, 768).is_err());
        assert!(validate_lora_config(16, 768, 0).is_err());
    }

    #[test]
    fn test_scaling_and_targets() {
        let mut config = LoRAConfig::new(8);
        assert_eq!(config.scaling(), 1.0);
        config.alpha = 16.0;
        assert_eq!(config.scaling(), 2.0);

        assert!(config.targets("layers.0.q_proj.weight"));
        config.target_modules = vec!["q_proj".into(), "v_proj".into()];
        assert!(config.targets("layers.0.q_proj.weight"));
        assert!(!config.targets("layers.0.o_proj.weight"));
    }

    #[test]
    fn test_init_strategies() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let zeros = initialize_lora_weights(&[4, 16], InitStrategy::Zeros, &mut rng);
        assert!(zeros.data().iter().all(|&x| x == 0.0));

        let kaiming = initialize_lora_weights(&[4, 16], InitStrategy::Kaiming, &mut rng);
        assert_eq!(kaiming.shape(), &[4, 16]);
        assert!(kaiming.data().iter().any(|&x| x != 0.0));
    }
}
