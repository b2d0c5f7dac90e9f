//! Base model collaborator: the forward/backward definition the training loop
//! drives, plus a registry resolving `model_name`.

use crate::data::Batch;
use crate::error::{Error, Result};
use crate::tensor::{DType, Tensor};
use rand::RngCore;
use std::collections::BTreeMap;
use std::sync::Arc;

pub mod tiny;

pub use tiny::TinyCausalLm;

/// Loss statistics of one forward pass, plus gradients when requested.
///
/// Loss and accuracy are reduced per sequence first (sum over counted
/// positions divided by that row's count) and then averaged over sequences,
/// so long responses do not outweigh short ones.
#[derive(Debug, Clone, Default)]
pub struct ModelOutput {
    /// Sum over sequences of each sequence's mean token loss
    pub sequence_loss_sum: f64,
    /// Sum over sequences of each sequence's token accuracy
    pub sequence_accuracy_sum: f64,
    /// Sequences with at least one counted position
    pub sequences: usize,
    /// Positions whose label is not the ignore index
    pub token_count: usize,
    /// Counted positions where the argmax matched the label
    pub correct: usize,
    /// Gradients of `sequence_loss_sum` with respect to each weight
    pub grads: BTreeMap<String, Tensor>,
}

impl ModelOutput {
    /// Mean over sequences of the per-sequence loss; zero when nothing was counted.
    pub fn mean_loss(&self) -> f64 {
        if self.sequences == 0 {
            0.0
        } else {
            self.sequence_loss_sum / self.sequences as f64
        }
    }

    pub fn accuracy(&self) -> f64 {
        if self.sequences == 0 {
            0.0
        } else {
            self.sequence_accuracy_sum / self.sequences as f64
        }
    }

    /// Factor turning `grads` into gradients of [`ModelOutput::mean_loss`].
    pub fn grad_scale(&self) -> f32 {
        1.0 / self.sequences.max(1) as f32
    }

    /// Accumulate another micro-batch into this one.
    pub fn accumulate(&mut self, other: ModelOutput) -> Result<()> {
        self.sequence_loss_sum += other.sequence_loss_sum;
        self.sequence_accuracy_sum += other.sequence_accuracy_sum;
        self.sequences += other.sequences;
        self.token_count += other.token_count;
        self.correct += other.correct;
        for (path, grad) in other.grads {
            match self.grads.remove(&path) {
                Some(existing) => {
                    self.grads.insert(path, existing.add(&grad)?);
                }
                None => {
                    self.grads.insert(path, grad);
                }
            }
        }
        Ok(())
    }
}

/// A causal language model the trainer can differentiate.
///
/// Weights are passed in explicitly, already in the compute dtype, so one
/// model instance serves every data-parallel group concurrently.
pub trait CausalModel: Send + Sync {
    fn name(&self) -> &str;

    fn vocab_size(&self) -> usize;

    /// Fresh pretrained-like weights keyed by parameter path.
    fn init_parameters(&self, rng: &mut dyn RngCore) -> BTreeMap<String, Tensor>;

    /// Paths of `[out, in]` linear weights adapters may wrap.
    fn adaptable_layers(&self) -> Vec<String>;

    /// Forward pass with masked next-token loss and accuracy.
    fn forward(&self, weights: &BTreeMap<String, Tensor>, batch: &Batch, dtype: DType) -> Result<ModelOutput>;

    /// Forward pass plus gradients of the summed per-sequence loss.
    fn forward_backward(
        &self,
        weights: &BTreeMap<String, Tensor>,
        batch: &Batch,
        dtype: DType,
    ) -> Result<ModelOutput>;
}

/// Resolve a model by name.
pub fn load_model(name: &str) -> Result<Arc<dyn CausalModel>> {
    let (family, dims) = match name.split_once(':') {
        Some((family, dims)) => (family, Some(dims)),
        None => (name, None),
    };
    match family {
        tiny::MODEL_NAME => {
            let model = match dims {
                None => TinyCausalLm::default(),
                Some(dims) => {
                    let (vocab, hidden) = parse_dims(dims).ok_or_else(|| {
                        Error::config(format!(
                            "invalid model dimensions '{}', expected <vocab>x<hidden>",
                            dims
                        ))
                    })?;
                    TinyCausalLm::new(vocab, hidden)?
                }
            };
            Ok(Arc::new(model))
        }
        _ => Err(Error::config(format!("unknown model '{}'", name))),
    }
}

fn parse_dims(dims: &str) -> Option<(usize, usize)> {
    let (vocab, hidden) = dims.split_once('x')?;
    Some((vocab.trim().parse().ok()?, hidden.trim().parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry() {
        let model = load_model("tiny-causal-lm").unwrap();
        assert_eq!(model.name(), "tiny-causal-lm");

        let model = load_model("tiny-causal-lm:128x32").unwrap();
        assert_eq!(model.vocab_size(), 128);

        assert!(matches!(load_model("meta-llama/Llama-3.2-1B"), Err(Error::Config(_))));
        assert!(matches!(load_model("tiny-causal-lm:big"), Err(Error::Config(_))));
        assert!(matches!(load_model("tiny-causal-lm:0x4"), Err(Error::Config(_))));
    }

    #[test]
    fn test_accumulate() {
        let mut total = ModelOutput::default();
        let mut grads = BTreeMap::new();
        grads.insert("w".to_string(), Tensor::new(vec![2], vec![1.0, 2.0]).unwrap());
        let part = ModelOutput {
            sequence_loss_sum: 3.0,
            sequence_accuracy_sum: 1.0,
            sequences: 2,
            token_count: 5,
            correct: 2,
            grads,
        };
        total.accumulate(part.clone()).unwrap();
        total.accumulate(part).unwrap();
        assert_eq!(total.token_count, 10);
        assert_eq!(total.sequences, 4);
        assert_eq!(total.mean_loss(), 1.5);
        assert_eq!(total.accuracy(), 0.5);
        assert_eq!(total.grad_scale(), 0.25);
        assert_eq!(total.grads["w"].data(), &[2.0, 4.0]);
    }
}
