//! Adapter injection, effective weights and gradient routing.

use super::{initialize_lora_weights, validate_lora_config, LoRAConfig};
use crate::error::{Error, Result};
use crate::mesh::Mesh;
use crate::params::{AdaptedLinear, ParamLeaf, ParamNode, ParameterTree, LORA_A_SUFFIX, LORA_B_SUFFIX};
use crate::sharding::{Shardable, ShardingRules};
use crate::tensor::{DType, Tensor};
use rand::Rng;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Wrap the selected `layers` of `tree` with fresh adapters.
///
/// Every pre-existing leaf becomes frozen; only the new `A` / `B` factors are
/// trainable. `B` starts at zero, so the adapted tree computes exactly what
/// the base tree computes until the first update.
pub fn inject_adapters<R: Rng + ?Sized>(
    tree: &ParameterTree,
    layers: &[String],
    config: &LoRAConfig,
    mesh: &Mesh,
    rules: &ShardingRules,
    rng: &mut R,
) -> Result<ParameterTree> {
    let selected: Vec<&String> = layers.iter().filter(|l| config.targets(l)).collect();
    if selected.is_empty() {
        return Err(Error::adapter(format!(
            "no adaptable layer matches target modules {:?}",
            config.target_modules
        )));
    }

    let mut out = ParameterTree::new();
    for (path, node) in tree.nodes() {
        let node = match node {
            ParamNode::Adapted(_) if selected.contains(&path) => {
                return Err(Error::adapter(format!("layer '{}' is already adapted", path)));
            }
            ParamNode::Adapted(adapted) => {
                let mut adapted = adapted.clone();
                adapted.base.trainable = false;
                ParamNode::Adapted(adapted)
            }
            ParamNode::Dense(leaf) if selected.contains(&path) => {
                ParamNode::Adapted(wrap_leaf(path, leaf, config, mesh, rules, rng)?)
            }
            ParamNode::Dense(leaf) => {
                let mut leaf = leaf.clone();
                leaf.trainable = false;
                ParamNode::Dense(leaf)
            }
        };
        out.insert(path.clone(), node);
    }

    for layer in &selected {
        if tree.get(layer).is_none() {
            return Err(Error::adapter(format!("adaptable layer '{}' is not in the tree", layer)));
        }
    }

    info!(
        "Injected rank-{} adapters into {} layers ({} trainable of {} parameters)",
        config.rank,
        selected.len(),
        out.num_trainable(),
        out.num_parameters()
    );
    Ok(out)
}

fn wrap_leaf<R: Rng + ?Sized>(
    path: &str,
    base: &ParamLeaf,
    config: &LoRAConfig,
    mesh: &Mesh,
    rules: &ShardingRules,
    rng: &mut R,
) -> Result<AdaptedLinear> {
    let (out_features, in_features) = match base.shape() {
        [o, i] => (*o, *i),
        other => {
            return Err(Error::adapter(format!(
                "layer '{}' has shape {:?}; adapters wrap matrices only",
                path, other
            )))
        }
    };
    validate_lora_config(config.rank, in_features, out_features)?;

    let (a_spec, b_spec) = ShardingRules::adapter_specs(base.partition_spec());
    let a = initialize_lora_weights(&[config.rank, in_features], config.init, rng);
    let b = Tensor::zeros(&[out_features, config.rank]);

    let lora_a = ParamLeaf::place(&a, mesh, a_spec, base.allow_padding, base.dtype, true)?;
    let lora_b = ParamLeaf::place(&b, mesh, b_spec, base.allow_padding, base.dtype, true)?;
    debug!(
        "Adapter {}: A {} B {} (model axis '{}')",
        path,
        lora_a.partition_spec(),
        lora_b.partition_spec(),
        rules.model_axis()
    );

    let mut base = base.clone();
    base.trainable = false;
    Ok(AdaptedLinear {
        base,
        lora_a,
        lora_b,
        scaling: config.scaling(),
        merged: false,
    })
}

/// Low-rank delta `B·A·scaling` of an adapted layer.
pub(crate) fn delta(adapted: &AdaptedLinear) -> Result<Tensor> {
    let a = adapted.lora_a.value();
    let b = adapted.lora_b.value();
    Ok(b.matmul(&a)?.scale(adapted.scaling))
}

/// Weights the model computes with, keyed by model parameter path, in the
/// compute dtype.
pub fn effective_weights(tree: &ParameterTree, compute_dtype: DType) -> Result<BTreeMap<String, Tensor>> {
    let mut out = BTreeMap::new();
    for (path, node) in tree.nodes() {
        let weight = match node {
            ParamNode::Dense(leaf) => leaf.value(),
            ParamNode::Adapted(adapted) if adapted.merged => adapted.base.value(),
            ParamNode::Adapted(adapted) => adapted.base.value().add(&delta(adapted)?)?,
        };
        out.insert(path.clone(), weight.cast(compute_dtype));
    }
    Ok(out)
}

/// Map gradients with respect to effective weights onto trainable leaves.
///
/// For an adapted layer with weight gradient `G`:
/// `dA = scaling·Bᵀ·G` and `dB = scaling·G·Aᵀ`. Gradients of frozen leaves
/// are dropped, so the base model is never updated through this path.
pub fn route_gradients(
    tree: &ParameterTree,
    grads: BTreeMap<String, Tensor>,
) -> Result<BTreeMap<String, Tensor>> {
    let mut grads = grads;
    let mut routed = BTreeMap::new();
    for (path, node) in tree.nodes() {
        let Some(grad) = grads.remove(path) else {
            continue;
        };
        match node {
            ParamNode::Dense(leaf) => {
                if leaf.trainable {
                    routed.insert(path.clone(), grad);
                }
            }
            ParamNode::Adapted(adapted) => {
                if adapted.merged {
                    return Err(Error::adapter(format!(
                        "cannot route gradients through merged layer '{}'",
                        path
                    )));
                }
                let a = adapted.lora_a.value();
                let b = adapted.lora_b.value();
                if adapted.lora_a.trainable {
                    let grad_a = b.transpose()?.matmul(&grad)?.scale(adapted.scaling);
                    routed.insert(format!("{}{}", path, LORA_A_SUFFIX), grad_a);
                }
                if adapted.lora_b.trainable {
                    let grad_b = grad.matmul(&a.transpose()?)?.scale(adapted.scaling);
                    routed.insert(format!("{}{}", path, LORA_B_SUFFIX), grad_b);
                }
                if adapted.base.trainable {
                    routed.insert(path.clone(), grad);
                }
            }
        }
    }
    Ok(routed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::DeviceSet;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn setup() -> (Mesh, ShardingRules, ParameterTree) {
        let mesh = Mesh::new(&[1, 2, 2], &["replica", "data", "model"], &DeviceSet::local(4)).unwrap();
        let rules = ShardingRules::new("model", vec!["replica".into(), "data".into()])
            .with_min_shard_elements(16);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut tensors = BTreeMap::new();
        tensors.insert("proj.weight".to_string(), Tensor::randn(&[8, 6], 0.5, &mut rng));
        tensors.insert("norm.scale".to_string(), Tensor::randn(&[6], 0.5, &mut rng));
        let tree = ParameterTree::from_tensors(&tensors, &mesh, &rules, DType::Float32, true).unwrap();
        (mesh, rules, tree)
    }

    #[test]
    fn test_injection_is_a_noop_at_init() {
        let (mesh, rules, tree) = setup();
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let adapted = inject_adapters(
            &tree,
            &["proj.weight".to_string()],
            &LoRAConfig::new(2),
            &mesh,
            &rules,
            &mut rng,
        )
        .unwrap();

        assert!(adapted.has_adapters());
        assert_eq!(
            adapted.trainable_paths(),
            vec!["proj.weight.lora_a".to_string(), "proj.weight.lora_b".to_string()]
        );
        assert_eq!(adapted.leaf("proj.weight.lora_a").unwrap().shape(), &[2, 6]);
        assert_eq!(adapted.leaf("proj.weight.lora_b").unwrap().shape(), &[8, 2]);
        adapted.validate_on(&mesh).unwrap();

        let before = effective_weights(&tree, DType::Float32).unwrap();
        let after = effective_weights(&adapted, DType::Float32).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_rank_out_of_range() {
        let (mesh, rules, tree) = setup();
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let err = inject_adapters(
            &tree,
            &["proj.weight".to_string()],
            &LoRAConfig::new(7),
            &mesh,
            &rules,
            &mut rng,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Adapter(_)));
    }

    #[test]
    fn test_gradients_reach_adapters_only() {
        let (mesh, rules, tree) = setup();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut adapted = inject_adapters(
            &tree,
            &["proj.weight".to_string()],
            &LoRAConfig::new(2),
            &mesh,
            &rules,
            &mut rng,
        )
        .unwrap();
        // Give B a nonzero value so dA is nonzero too
        let b = Tensor::randn(&[8, 2], 0.1, &mut rng);
        adapted.leaf_mut("proj.weight.lora_b").unwrap().set_value(&b, &mesh).unwrap();

        let mut grads = BTreeMap::new();
        grads.insert("proj.weight".to_string(), Tensor::randn(&[8, 6], 1.0, &mut rng));
        grads.insert("norm.scale".to_string(), Tensor::randn(&[6], 1.0, &mut rng));

        let routed = route_gradients(&adapted, grads).unwrap();
        let keys: Vec<&String> = routed.keys().collect();
        assert_eq!(keys, vec!["proj.weight.lora_a", "proj.weight.lora_b"]);
        assert_eq!(routed["proj.weight.lora_a"].shape(), &[2, 6]);
        assert_eq!(routed["proj.weight.lora_b"].shape(), &[8, 2]);
        assert!(routed["proj.weight.lora_a"].data().iter().any(|&x| x != 0.0));
    }

    #[test]
    fn test_dense_tree_routes_everything() {
        let (_, _, tree) = setup();
        let mut grads = BTreeMap::new();
        grads.insert("proj.weight".to_string(), Tensor::zeros(&[8, 6]));
        grads.insert("norm.scale".to_string(), Tensor::zeros(&[6]));
        let routed = route_gradients(&tree, grads).unwrap();
        assert_eq!(routed.len(), 2);
    }
}
