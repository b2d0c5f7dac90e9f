//! Merging adapter deltas into base weights.

use super::inject::delta;
use crate::error::{Error, Result};
use crate::mesh::Mesh;
use crate::params::{ParamNode, ParameterTree, LORA_A_SUFFIX, LORA_B_SUFFIX};
use crate::tensor::Tensor;
use std::collections::BTreeMap;
use tracing::info;

/// Handles merging of adapters into dense weights
pub struct LoRAMerger;

impl LoRAMerger {
    /// Merge LoRA weights into base model weights
    pub fn merge_into_base(base: &Tensor, lora_a: &Tensor, lora_b: &Tensor, scaling: f32) -> Result<Tensor> {
        // W' = W + (B @ A) * scaling
        let delta = lora_b.matmul(lora_a)?.scale(scaling);
        base.add(&delta)
    }
}

/// Fold every adapter delta into its base weight in place.
///
/// Adapter factors are kept so the merge can be undone. Merging a tree that
/// already contains a merged layer is an error.
pub fn merge_adapters(tree: &mut ParameterTree, mesh: &Mesh) -> Result<usize> {
    if let Some((path, _)) = tree
        .nodes()
        .find(|(_, n)| matches!(n, ParamNode::Adapted(a) if a.merged))
    {
        return Err(Error::adapter(format!("already merged: layer '{}'", path)));
    }

    let mut merged = 0;
    for (_, node) in tree.nodes_mut() {
        if let ParamNode::Adapted(adapted) = node {
            let weight = adapted.base.value().add(&delta(adapted)?)?;
            adapted.base.set_value(&weight, mesh)?;
            adapted.merged = true;
            merged += 1;
        }
    }
    info!("Merged {} adapters into base weights", merged);
    Ok(merged)
}

/// Subtract every merged delta from its base weight again.
pub fn unmerge_adapters(tree: &mut ParameterTree, mesh: &Mesh) -> Result<usize> {
    let mut unmerged = 0;
    for (path, node) in tree.nodes_mut() {
        if let ParamNode::Adapted(adapted) = node {
            if !adapted.merged {
                return Err(Error::adapter(format!("layer '{}' is not merged", path)));
            }
            let weight = adapted.base.value().sub(&delta(adapted)?)?;
            adapted.base.set_value(&weight, mesh)?;
            adapted.merged = false;
            unmerged += 1;
        }
    }
    Ok(unmerged)
}

/// Dense export weights `W + B·A·scaling`, keyed by model parameter path.
pub fn merged_weights(tree: &ParameterTree) -> Result<BTreeMap<String, Tensor>> {
    let mut out = BTreeMap::new();
    for (path, node) in tree.nodes() {
        let weight = match node {
            ParamNode::Dense(leaf) => leaf.value(),
            ParamNode::Adapted(adapted) if adapted.merged => adapted.base.value(),
            ParamNode::Adapted(adapted) => LoRAMerger::merge_into_base(
                &adapted.base.value(),
                &adapted.lora_a.value(),
                &adapted.lora_b.value(),
                adapted.scaling,
            )?,
        };
        out.insert(path.clone(), weight);
    }
    Ok(out)
}

/// Adapter factors only, keyed by flattened leaf path.
pub fn adapter_weights(tree: &ParameterTree) -> BTreeMap<String, Tensor> {
    let mut out = BTreeMap::new();
    for (path, node) in tree.nodes() {
        if let ParamNode::Adapted(adapted) = node {
            out.insert(format!("{}{}", path, LORA_A_SUFFIX), adapted.lora_a.value());
            out.insert(format!("{}{}", path, LORA_B_SUFFIX), adapted.lora_b.value());
        }
    }
    out
}

/// Collapse every adapted layer into a dense, trainable leaf.
pub fn into_dense(tree: &ParameterTree, mesh: &Mesh) -> Result<ParameterTree> {
    let mut out = ParameterTree::new();
    for (path, node) in tree.nodes() {
        let leaf = match node {
            ParamNode::Dense(leaf) => {
                let mut leaf = leaf.clone();
                leaf.trainable = true;
                leaf
            }
            ParamNode::Adapted(adapted) => {
                let mut base = adapted.base.clone();
                if !adapted.merged {
                    let weight = base.value().add(&delta(adapted)?)?;
                    base.set_value(&weight, mesh)?;
                }
                base.trainable = true;
                base
            }
        };
        out.insert(path.clone(), ParamNode::Dense(leaf));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lora::{effective_weights, inject_adapters, LoRAConfig};
    use crate::mesh::DeviceSet;
    use crate::sharding::ShardingRules;
    use crate::tensor::DType;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn adapted_tree() -> (Mesh, ParameterTree) {
        let mesh = Mesh::new(&[1, 1, 2], &["replica", "data", "model"], &DeviceSet::local(2)).unwrap();
        let rules = ShardingRules::new("model", vec!["replica".into(), "data".into()])
            .with_min_shard_elements(1);
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let mut tensors = BTreeMap::new();
        tensors.insert("proj.weight".to_string(), Tensor::randn(&[4, 4], 0.5, &mut rng));
        let tree = ParameterTree::from_tensors(&tensors, &mesh, &rules, DType::Float32, true).unwrap();
        let mut tree = inject_adapters(
            &tree,
            &["proj.weight".to_string()],
            &LoRAConfig::new(2),
            &mesh,
            &rules,
            &mut rng,
        )
        .unwrap();
        let b = Tensor::randn(&[4, 2], 0.3, &mut rng);
        tree.leaf_mut("proj.weight.lora_b").unwrap().set_value(&b, &mesh).unwrap();
        (mesh, tree)
    }

    #[test]
    fn test_merge_into_base() {
        let base = Tensor::zeros(&[2, 2]);
        let a = Tensor::new(vec![1, 2], vec![1.0, 2.0]).unwrap();
        let b = Tensor::new(vec![2, 1], vec![1.0, -1.0]).unwrap();
        let merged = LoRAMerger::merge_into_base(&base, &a, &b, 0.5).unwrap();
        assert_eq!(merged.data(), &[0.5, 1.0, -0.5, -1.0]);
    }

    #[test]
    fn test_merge_twice_fails() {
        let (mesh, mut tree) = adapted_tree();
        assert_eq!(merge_adapters(&mut tree, &mesh).unwrap(), 1);
        let err = merge_adapters(&mut tree, &mesh).unwrap_err();
        assert!(matches!(err, Error::Adapter(ref m) if m.contains("already merged")));
    }

    #[test]
    fn test_merge_preserves_effective_weights() {
        let (mesh, mut tree) = adapted_tree();
        let before = effective_weights(&tree, DType::Float32).unwrap();
        let export = merged_weights(&tree).unwrap();
        merge_adapters(&mut tree, &mesh).unwrap();
        let after = effective_weights(&tree, DType::Float32).unwrap();
        assert!(before["proj.weight"].max_abs_diff(&after["proj.weight"]) < 1e-6);
        assert!(export["proj.weight"].max_abs_diff(&after["proj.weight"]) < 1e-6);

        let original = tree.clone();
        unmerge_adapters(&mut tree, &mesh).unwrap();
        merge_adapters(&mut tree, &mesh).unwrap();
        let again = effective_weights(&tree, DType::Float32).unwrap();
        assert!(again["proj.weight"].max_abs_diff(&effective_weights(&original, DType::Float32).unwrap()["proj.weight"]) < 1e-5);
    }

    #[test]
    fn test_into_dense_and_adapter_export() {
        let (mesh, tree) = adapted_tree();
        let factors = adapter_weights(&tree);
        assert_eq!(factors.len(), 2);

        let dense = into_dense(&tree, &mesh).unwrap();
        assert!(!dense.has_adapters());
        assert_eq!(dense.num_trainable(), 16);
        let expected = merged_weights(&tree).unwrap();
        assert!(dense.to_tensors()["proj.weight"].max_abs_diff(&expected["proj.weight"]) < 1e-6);
    }
}
