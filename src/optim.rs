//! Adam with decoupled weight decay over the trainable leaves of a
//! [`ParameterTree`].
//!
//! Moments live on the mesh with the same partition spec as their parameter
//! and are kept in f32 regardless of the parameter dtype. Updates are computed
//! on logical f32 values and cast back to the parameter dtype on write.

use crate::config::TrainerConfig;
use crate::error::{Error, Result};
use crate::mesh::Mesh;
use crate::params::ParameterTree;
use crate::sharding::{Shardable, ShardedArray};
use crate::tensor::Tensor;
use std::collections::BTreeMap;

/// First and second moment of one trainable leaf.
#[derive(Debug, Clone, PartialEq)]
pub struct Moments {
    pub m: ShardedArray,
    pub v: ShardedArray,
}

/// Per-trainable-leaf optimizer state, keyed by flattened leaf path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptimizerState {
    /// Number of updates applied
    pub step: u64,
    pub moments: BTreeMap<String, Moments>,
}

impl OptimizerState {
    /// Zero moments for every trainable leaf of `params`.
    pub fn zeros(params: &ParameterTree, mesh: &Mesh) -> Result<Self> {
        let mut moments = BTreeMap::new();
        for (path, leaf) in params.leaves() {
            if !leaf.trainable {
                continue;
            }
            let zeros = Tensor::zeros(leaf.shape());
            let spec = leaf.partition_spec().clone();
            let m = ShardedArray::from_logical(&zeros, mesh, spec.clone(), leaf.allow_padding)?;
            moments.insert(path, Moments { m: m.clone(), v: m });
        }
        Ok(Self { step: 0, moments })
    }

    /// The moment keys are exactly the trainable leaves, with matching shapes.
    pub fn check_matches(&self, params: &ParameterTree) -> Result<()> {
        let trainable = params.trainable_paths();
        if trainable.len() != self.moments.len() {
            return Err(Error::Internal(format!(
                "optimizer tracks {} leaves but {} are trainable",
                self.moments.len(),
                trainable.len()
            )));
        }
        for path in trainable {
            let (Some(moments), Some(leaf)) = (self.moments.get(&path), params.leaf(&path)) else {
                return Err(Error::Internal(format!("no optimizer state for '{}'", path)));
            };
            if moments.m.shape() != leaf.shape() || moments.v.shape() != leaf.shape() {
                return Err(Error::Internal(format!(
                    "optimizer state for '{}' has shape {:?}, parameter has {:?}",
                    path,
                    moments.m.shape(),
                    leaf.shape()
                )));
            }
        }
        Ok(())
    }

    /// Move every moment onto `mesh` with its parameter's current spec.
    pub fn reshard(&self, params: &ParameterTree, mesh: &Mesh) -> Result<Self> {
        let mut moments = BTreeMap::new();
        for (path, state) in &self.moments {
            let leaf = params
                .leaf(path)
                .ok_or_else(|| Error::Internal(format!("optimizer state for unknown leaf '{}'", path)))?;
            let spec = leaf.partition_spec().clone();
            moments.insert(
                path.clone(),
                Moments {
                    m: state.m.reshard(mesh, spec.clone(), leaf.allow_padding)?,
                    v: state.v.reshard(mesh, spec, leaf.allow_padding)?,
                },
            );
        }
        Ok(Self {
            step: self.step,
            moments,
        })
    }
}

/// Statistics of one update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpdateStats {
    /// Global gradient norm before clipping
    pub grad_norm: f64,
    pub clipped: bool,
}

/// Adam optimizer hyperparameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Adam {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
    pub max_grad_norm: Option<f64>,
}

impl Adam {
    pub fn new(lr: f64) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
            max_grad_norm: None,
        }
    }

    pub fn from_config(config: &TrainerConfig) -> Self {
        Self {
            weight_decay: config.weight_decay,
            max_grad_norm: config.max_grad_norm,
            ..Self::new(config.learning_rate)
        }
    }

    /// Apply one update to every trainable leaf.
    ///
    /// `grads` are mean gradients keyed by flattened leaf path; a trainable
    /// leaf without a gradient is updated with a zero gradient. Non-finite
    /// gradients fail with [`Error::NumericFailure`] before anything is
    /// written.
    pub fn apply(
        &self,
        params: &mut ParameterTree,
        state: &mut OptimizerState,
        grads: &BTreeMap<String, Tensor>,
        mesh: &Mesh,
        step: u64,
    ) -> Result<UpdateStats> {
        let mut norm_sq = 0.0f64;
        for (path, grad) in grads {
            if !grad.all_finite() {
                return Err(Error::numeric(step, format!("non-finite gradient for '{}'", path)));
            }
            norm_sq += grad.sum_of_squares();
        }
        let grad_norm = norm_sq.sqrt();
        if !grad_norm.is_finite() {
            return Err(Error::numeric(step, "gradient norm overflowed"));
        }

        let (clip, clipped) = match self.max_grad_norm {
            Some(max) if grad_norm > max => ((max / grad_norm) as f32, true),
            _ => (1.0f32, false),
        };

        state.step += 1;
        let t = state.step as i32;
        let bias1 = 1.0 - self.beta1.powi(t);
        let bias2 = 1.0 - self.beta2.powi(t);
        let (b1, b2) = (self.beta1 as f32, self.beta2 as f32);
        let (lr, eps, wd) = (self.lr as f32, self.epsilon as f32, self.weight_decay as f32);
        let (bias1, bias2) = (bias1 as f32, bias2 as f32);

        for path in params.trainable_paths() {
            let moments = state
                .moments
                .get_mut(&path)
                .ok_or_else(|| Error::Internal(format!("no optimizer state for '{}'", path)))?;
            let leaf = params
                .leaf_mut(&path)
                .ok_or_else(|| Error::Internal(format!("unknown leaf '{}'", path)))?;

            let mut value = leaf.value();
            let zeros;
            let grad = match grads.get(&path) {
                Some(g) => g,
                None => {
                    zeros = Tensor::zeros(leaf.shape());
                    &zeros
                }
            };
            let mut m = moments.m.gather();
            let mut v = moments.v.gather();

            for (((p, &g), m), v) in value
                .data_mut()
                .iter_mut()
                .zip(grad.data())
                .zip(m.data_mut())
                .zip(v.data_mut())
            {
                let g = g * clip;
                *m = b1 * *m + (1.0 - b1) * g;
                *v = b2 * *v + (1.0 - b2) * g * g;
                let m_hat = *m / bias1;
                let v_hat = *v / bias2;
                *p -= lr * (m_hat / (v_hat.sqrt() + eps) + wd * *p);
            }

            leaf.set_value(&value, mesh)?;
            let spec = leaf.partition_spec().clone();
            moments.m = ShardedArray::from_logical(&m, mesh, spec.clone(), leaf.allow_padding)?;
            moments.v = ShardedArray::from_logical(&v, mesh, spec, leaf.allow_padding)?;
        }

        Ok(UpdateStats { grad_norm, clipped })
    }
}
