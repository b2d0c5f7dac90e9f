//! Reference causal LM with analytic gradients.
//!
//! Per position `t`: `h = P·E[x_t]`, `z = L·h`, and the loss is the
//! cross-entropy of `softmax(z)` against the label at `t + 1`. `P` and `L`
//! are `[out, in]` linear weights and therefore adaptable.

use super::{CausalModel, ModelOutput};
use crate::data::Batch;
use crate::error::{Error, Result};
use crate::tensor::{DType, Tensor};
use rand::RngCore;
use std::collections::BTreeMap;

pub const MODEL_NAME: &str = "tiny-causal-lm";

pub const EMBED: &str = "embed.weight";
pub const PROJ: &str = "proj.weight";
pub const LM_HEAD: &str = "lm_head.weight";

const DEFAULT_VOCAB: usize = 64;
const DEFAULT_HIDDEN: usize = 16;

#[derive(Debug, Clone)]
pub struct TinyCausalLm {
    name: String,
    vocab: usize,
    hidden: usize,
}

impl Default for TinyCausalLm {
    fn default() -> Self {
        Self {
            name: MODEL_NAME.to_string(),
            vocab: DEFAULT_VOCAB,
            hidden: DEFAULT_HIDDEN,
        }
    }
}

struct Grads {
    embed: Vec<f64>,
    proj: Vec<f64>,
    head: Vec<f64>,
}

impl TinyCausalLm {
    pub fn new(vocab: usize, hidden: usize) -> Result<Self> {
        if vocab < 2 || hidden == 0 {
            return Err(Error::config(format!(
                "{} needs vocab >= 2 and hidden > 0, got {}x{}",
                MODEL_NAME, vocab, hidden
            )));
        }
        Ok(Self {
            name: format!("{}:{}x{}", MODEL_NAME, vocab, hidden),
            vocab,
            hidden,
        })
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden
    }

    fn weight<'a>(&self, weights: &'a BTreeMap<String, Tensor>, path: &str, shape: [usize; 2]) -> Result<&'a Tensor> {
        let w = weights
            .get(path)
            .ok_or_else(|| Error::Internal(format!("missing weight '{}'", path)))?;
        if w.shape() != shape {
            return Err(Error::Internal(format!(
                "weight '{}' has shape {:?}, expected {:?}",
                path,
                w.shape(),
                shape
            )));
        }
        Ok(w)
    }

    fn token(&self, id: i64) -> Result<usize> {
        if id < 0 || id as usize >= self.vocab {
            return Err(Error::data(format!(
                "token id {} outside vocabulary of {}",
                id, self.vocab
            )));
        }
        Ok(id as usize)
    }

    fn run(
        &self,
        weights: &BTreeMap<String, Tensor>,
        batch: &Batch,
        dtype: DType,
        with_grads: bool,
    ) -> Result<ModelOutput> {
        let (v, d) = (self.vocab, self.hidden);
        let embed = self.weight(weights, EMBED, [v, d])?;
        let proj = self.weight(weights, PROJ, [d, d])?;
        let head = self.weight(weights, LM_HEAD, [v, d])?;

        let mut out = ModelOutput::default();
        let mut grads = Grads {
            embed: vec![0.0; v * d],
            proj: vec![0.0; d * d],
            head: vec![0.0; v * d],
        };
        let mut h = vec![0.0f64; d];
        let mut z = vec![0.0f64; v];
        let mut dh = vec![0.0f64; d];

        for (row, ids) in batch.input_ids.iter().enumerate() {
            let labels = &batch.labels[row];
            let mask = &batch.attention_mask[row];
            let counted = |t: usize| labels[t + 1] != batch.ignore_index && mask[t];
            let positions = ids.len().saturating_sub(1);
            let row_count = (0..positions).filter(|&t| counted(t)).count();
            if row_count == 0 {
                continue;
            }
            // Every counted position of a row shares that row's 1/count weight
            let weight = 1.0 / row_count as f64;
            let mut row_loss = 0.0f64;
            let mut row_correct = 0usize;

            for t in 0..positions {
                if !counted(t) {
                    continue;
                }
                let label = labels[t + 1];
                let target = self.token(label)?;
                let x = self.token(ids[t] as i64)?;

                let e = embed.row(x);
                for (i, hi) in h.iter_mut().enumerate() {
                    *hi = proj.row(i).iter().zip(e).map(|(&p, &e)| p as f64 * e as f64).sum();
                }
                for (k, zk) in z.iter_mut().enumerate() {
                    let logit: f64 = head.row(k).iter().zip(&h).map(|(&l, &h)| l as f64 * h).sum();
                    *zk = round_logit(logit, dtype);
                }

                let max = z.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                let sum_exp: f64 = z.iter().map(|&zk| (zk - max).exp()).sum();
                let lse = max + sum_exp.ln();
                row_loss += lse - z[target];
                if argmax(&z) == target {
                    row_correct += 1;
                }

                if !with_grads {
                    continue;
                }
                dh.iter_mut().for_each(|x| *x = 0.0);
                for k in 0..v {
                    let mut dz = (z[k] - lse).exp();
                    if k == target {
                        dz -= 1.0;
                    }
                    dz *= weight;
                    let l_row = head.row(k);
                    for i in 0..d {
                        grads.head[k * d + i] += dz * h[i];
                        dh[i] += l_row[i] as f64 * dz;
                    }
                }
                for i in 0..d {
                    let p_row = proj.row(i);
                    for j in 0..d {
                        grads.proj[i * d + j] += dh[i] * e[j] as f64;
                        grads.embed[x * d + j] += p_row[j] as f64 * dh[i];
                    }
                }
            }

            out.sequence_loss_sum += row_loss * weight;
            out.sequence_accuracy_sum += row_correct as f64 * weight;
            out.sequences += 1;
            out.token_count += row_count;
            out.correct += row_correct;
        }

        if with_grads {
            out.grads.insert(EMBED.to_string(), to_tensor(&[v, d], grads.embed)?);
            out.grads.insert(PROJ.to_string(), to_tensor(&[d, d], grads.proj)?);
            out.grads.insert(LM_HEAD.to_string(), to_tensor(&[v, d], grads.head)?);
        }
        Ok(out)
    }
}

fn round_logit(x: f64, dtype: DType) -> f64 {
    match dtype {
        DType::Float32 => x,
        _ => dtype.round(x as f32) as f64,
    }
}

fn argmax(z: &[f64]) -> usize {
    let mut best = 0;
    for (k, &zk) in z.iter().enumerate() {
        if zk > z[best] {
            best = k;
        }
    }
    best
}

fn to_tensor(shape: &[usize], data: Vec<f64>) -> Result<Tensor> {
    Tensor::new(shape.to_vec(), data.into_iter().map(|x| x as f32).collect())
}

impl CausalModel for TinyCausalLm {
    fn name(&self) -> &str {
        &self.name
    }

    fn vocab_size(&self) -> usize {
        self.vocab
    }

    fn init_parameters(&self, rng: &mut dyn RngCore) -> BTreeMap<String, Tensor> {
        let (v, d) = (self.vocab, self.hidden);
        let std = 1.0 / (d as f32).sqrt();
        let mut params = BTreeMap::new();
        params.insert(EMBED.to_string(), Tensor::randn(&[v, d], 1.0, rng));
        params.insert(PROJ.to_string(), Tensor::randn(&[d, d], std, rng));
        params.insert(LM_HEAD.to_string(), Tensor::randn(&[v, d], std, rng));
        params
    }

    fn adaptable_layers(&self) -> Vec<String> {
        vec![LM_HEAD.to_string(), PROJ.to_string()]
    }

    fn forward(&self, weights: &BTreeMap<String, Tensor>, batch: &Batch, dtype: DType) -> Result<ModelOutput> {
        self.run(weights, batch, dtype, false)
    }

    fn forward_backward(
        &self,
        weights: &BTreeMap<String, Tensor>,
        batch: &Batch,
        dtype: DType,
    ) -> Result<ModelOutput> {
        self.run(weights, batch, dtype, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{collate, CollateOptions, Example};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn batch() -> Batch {
        let options = CollateOptions {
            max_seq_length: 5,
            pad_id: 0,
            ignore_index: -100,
            mask_prompt: true,
        };
        collate(
            &[Example::new(vec![1, 2], vec![3, 4]), Example::new(vec![0], vec![4, 1, 2, 3])],
            &options,
        )
        .unwrap()
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        let model = TinyCausalLm::new(5, 3).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let weights = model.init_parameters(&mut rng);
        let batch = batch();
        let out = model.forward_backward(&weights, &batch, DType::Float32).unwrap();
        assert_eq!(out.token_count, batch.num_target_tokens());

        let eps = 1e-3f32;
        for path in [EMBED, PROJ, LM_HEAD] {
            for idx in [0usize, 4, 7] {
                let mut plus = weights.clone();
                let mut minus = weights.clone();
                let (Some(p), Some(m)) = (plus.get_mut(path), minus.get_mut(path)) else {
                    panic!("missing {}", path);
                };
                p.data_mut()[idx] += eps;
                m.data_mut()[idx] -= eps;
                let lp = model.forward(&plus, &batch, DType::Float32).unwrap().sequence_loss_sum;
                let lm = model.forward(&minus, &batch, DType::Float32).unwrap().sequence_loss_sum;
                let numeric = (lp - lm) / (2.0 * eps as f64);
                let analytic = out.grads[path].data()[idx] as f64;
                assert!(
                    (numeric - analytic).abs() < 2e-3 + 1e-2 * analytic.abs(),
                    "{}[{}]: numeric {} analytic {}",
                    path,
                    idx,
                    numeric,
                    analytic
                );
            }
        }
    }

    #[test]
    fn test_forward_has_no_grads() {
        let model = TinyCausalLm::new(5, 3).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let weights = model.init_parameters(&mut rng);
        let out = model.forward(&weights, &batch(), DType::BFloat16).unwrap();
        assert!(out.grads.is_empty());
        assert!(out.sequence_loss_sum.is_finite() && out.sequence_loss_sum > 0.0);
        assert_eq!(out.sequences, 2);
        assert!(out.correct <= out.token_count);
    }

    #[test]
    fn test_out_of_vocab_token() {
        let model = TinyCausalLm::new(5, 3).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let weights = model.init_parameters(&mut rng);
        let options = CollateOptions {
            max_seq_length: 3,
            pad_id: 0,
            ignore_index: -100,
            mask_prompt: false,
        };
        let bad = collate(&[Example::new(vec![1], vec![9])], &options).unwrap();
        assert!(matches!(model.forward(&weights, &bad, DType::Float32), Err(Error::Data(_))));
    }

    #[test]
    fn test_loss_is_averaged_per_sequence() {
        let model = TinyCausalLm::new(5, 3).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let weights = model.init_parameters(&mut rng);
        let options = CollateOptions {
            max_seq_length: 8,
            pad_id: 0,
            ignore_index: -100,
            mask_prompt: true,
        };
        let short = Example::new(vec![1], vec![2]);
        let long = Example::new(vec![0], vec![4, 1, 2, 3, 4, 1]);
        let both = collate(&[short.clone(), long.clone()], &options).unwrap();

        let out = model.forward_backward(&weights, &both, DType::Float32).unwrap();
        let a = model.forward_backward(&weights, &collate(&[short], &options).unwrap(), DType::Float32).unwrap();
        let b = model.forward_backward(&weights, &collate(&[long], &options).unwrap(), DType::Float32).unwrap();
        assert_eq!((a.token_count, b.token_count), (1, 6));
        assert_eq!(out.sequences, 2);

        let per_sequence = (a.mean_loss() + b.mean_loss()) / 2.0;
        assert!((out.mean_loss() - per_sequence).abs() < 1e-9);
        let per_token = (a.sequence_loss_sum + b.sequence_loss_sum * 6.0) / 7.0;
        assert!((out.mean_loss() - per_token).abs() > 1e-6);
        assert!((out.accuracy() - (a.accuracy() + b.accuracy()) / 2.0).abs() < 1e-9);

        // Each row contributes its own mean gradient, halved for two rows
        for path in [EMBED, PROJ, LM_HEAD] {
            let expected = a.grads[path].add(&b.grads[path]).unwrap().scale(0.5);
            let actual = out.grads[path].scale(out.grad_scale());
            assert!(expected.max_abs_diff(&actual) < 1e-5, "{}", path);
        }
    }
}
