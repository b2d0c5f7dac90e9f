//! Rule set that decides the partition spec of every parameter leaf.

use super::{PartitionSpec, ShardedArray};
use crate::config::TrainerConfig;
use crate::error::{Error, Result};
use crate::mesh::Mesh;
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};

/// Matrices smaller than this stay replicated under the default policy.
pub const DEFAULT_MIN_SHARD_ELEMENTS: usize = 1024;

/// Explicit placement for leaves whose path contains `pattern`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShardingRule {
    pub pattern: String,
    /// Mesh axis per dimension; `None` replicates that dimension
    pub spec: Vec<Option<String>>,
    /// Pad indivisible dimensions instead of failing
    #[serde(default)]
    pub allow_padding: bool,
}

/// Resolved placement of one leaf.
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub spec: PartitionSpec,
    pub allow_padding: bool,
}

/// Ordered rules plus the default policy for unmatched leaves.
#[derive(Debug, Clone)]
pub struct ShardingRules {
    rules: Vec<ShardingRule>,
    model_axis: String,
    data_axes: Vec<String>,
    min_shard_elements: usize,
}

impl ShardingRules {
    pub fn new(model_axis: impl Into<String>, data_axes: Vec<String>) -> Self {
        Self {
            rules: Vec::new(),
            model_axis: model_axis.into(),
            data_axes,
            min_shard_elements: DEFAULT_MIN_SHARD_ELEMENTS,
        }
    }

    pub fn from_config(config: &TrainerConfig) -> Self {
        let mut rules = Self::new(config.model_axis.clone(), config.data_parallel_axes.clone());
        rules.rules = config.sharding_rules.clone();
        rules
    }

    pub fn with_rule(mut self, rule: ShardingRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn with_min_shard_elements(mut self, min: usize) -> Self {
        self.min_shard_elements = min;
        self
    }

    pub fn model_axis(&self) -> &str {
        &self.model_axis
    }

    pub fn data_axes(&self) -> &[String] {
        &self.data_axes
    }

    /// Reject rules that reference unknown axes or split parameters along a
    /// data-parallel axis.
    pub fn validate(&self, mesh: &Mesh) -> Result<()> {
        for rule in &self.rules {
            for axis in rule.spec.iter().flatten() {
                if !mesh.has_axis(axis) {
                    return Err(Error::sharding(format!(
                        "rule '{}' references unknown mesh axis '{}'",
                        rule.pattern, axis
                    )));
                }
                if self.data_axes.contains(axis) {
                    return Err(Error::sharding(format!(
                        "rule '{}' shards parameters along data parallel axis '{}'",
                        rule.pattern, axis
                    )));
                }
            }
        }
        Ok(())
    }

    /// Placement for the leaf at `path` with logical `shape`.
    pub fn placement_for(&self, path: &str, shape: &[usize], mesh: &Mesh) -> Result<Placement> {
        if let Some(rule) = self.rules.iter().find(|r| path.contains(&r.pattern)) {
            let spec = PartitionSpec::new(rule.spec.clone());
            // Explicit rules fail fast instead of falling back
            spec.validate(shape, mesh, rule.allow_padding)?;
            return Ok(Placement {
                spec,
                allow_padding: rule.allow_padding,
            });
        }
        Ok(Placement {
            spec: self.default_spec(shape, mesh),
            allow_padding: false,
        })
    }

    /// Large matrices split their leading divisible dimension along the
    /// model axis; everything else is replicated.
    fn default_spec(&self, shape: &[usize], mesh: &Mesh) -> PartitionSpec {
        let rank = shape.len();
        let numel: usize = shape.iter().product();
        let Some(model) = mesh.axis_size(&self.model_axis) else {
            return PartitionSpec::replicated(rank);
        };
        if rank < 2 || numel < self.min_shard_elements || model == 1 {
            return PartitionSpec::replicated(rank);
        }
        for dim in 0..2 {
            if shape[dim] % model == 0 {
                return PartitionSpec::sharded(rank, dim, &self.model_axis);
            }
        }
        PartitionSpec::replicated(rank)
    }

    /// Shard `tensor` for the leaf at `path`.
    pub fn place(&self, path: &str, tensor: &Tensor, mesh: &Mesh) -> Result<ShardedArray> {
        let placement = self.placement_for(path, tensor.shape(), mesh)?;
        ShardedArray::from_logical(tensor, mesh, placement.spec, placement.allow_padding)
    }

    /// Specs for adapter factors of a base weight `[out, in]`: `B` `[out, r]`
    /// follows the output dimension, `A` `[r, in]` follows the input dimension.
    pub fn adapter_specs(base: &PartitionSpec) -> (PartitionSpec, PartitionSpec) {
        let out_axis = base.axis_for_dim(0).map(str::to_string);
        let in_axis = base.axis_for_dim(1).map(str::to_string);
        let a = PartitionSpec::new(vec![None, in_axis]);
        let b = PartitionSpec::new(vec![out_axis, None]);
        (a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::DeviceSet;

    fn mesh() -> Mesh {
        Mesh::new(&[1, 2, 4], &["replica", "data", "model"], &DeviceSet::local(8)).unwrap()
    }

    fn rules() -> ShardingRules {
        ShardingRules::new("model", vec!["replica".into(), "data".into()])
    }

    #[test]
    fn test_default_policy() {
        let mesh = mesh();
        let rules = rules();
        let p = rules.placement_for("proj.weight", &[64, 64], &mesh).unwrap();
        assert_eq!(p.spec, PartitionSpec::sharded(2, 0, "model"));

        let p = rules.placement_for("lm_head.weight", &[34, 64], &mesh).unwrap();
        assert_eq!(p.spec, PartitionSpec::sharded(2, 1, "model"));

        let p = rules.placement_for("norm.scale", &[4096], &mesh).unwrap();
        assert!(p.spec.is_replicated());

        let p = rules.placement_for("small.weight", &[8, 8], &mesh).unwrap();
        assert!(p.spec.is_replicated());

        let p = rules.placement_for("odd.weight", &[33, 35], &mesh).unwrap();
        assert!(p.spec.is_replicated());
    }

    #[test]
    fn test_explicit_rule_fails_fast() {
        let mesh = mesh();
        let rules = rules().with_rule(ShardingRule {
            pattern: "embed".into(),
            spec: vec![Some("model".into()), None],
            allow_padding: false,
        });
        assert!(matches!(
            rules.placement_for("embed.weight", &[30, 16], &mesh),
            Err(Error::Sharding(_))
        ));

        let padded = rules_with_padding();
        let p = padded.placement_for("embed.weight", &[30, 16], &mesh).unwrap();
        assert!(p.allow_padding);
    }

    fn rules_with_padding() -> ShardingRules {
        rules().with_rule(ShardingRule {
            pattern: "embed".into(),
            spec: vec![Some("model".into()), None],
            allow_padding: true,
        })
    }

    #[test]
    fn test_rules_may_not_use_data_axes() {
        let mesh = mesh();
        let rules = rules().with_rule(ShardingRule {
            pattern: "proj".into(),
            spec: vec![Some("data".into()), None],
            allow_padding: false,
        });
        assert!(rules.validate(&mesh).is_err());
        assert!(rules_with_padding().validate(&mesh).is_ok());
    }

    #[test]
    fn test_adapter_specs_follow_base() {
        let base = PartitionSpec::sharded(2, 0, "model");
        let (a, b) = ShardingRules::adapter_specs(&base);
        assert!(a.is_replicated());
        assert_eq!(b, PartitionSpec::sharded(2, 0, "model"));

        let base = PartitionSpec::sharded(2, 1, "model");
        let (a, b) = ShardingRules::adapter_specs(&base);
        assert_eq!(a, PartitionSpec::sharded(2, 1, "model"));
        assert!(b.is_replicated());
    }
}
