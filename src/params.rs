//! Keyed parameter tree.
//!
//! Every node is either a plain dense leaf or an adapted linear layer that
//! carries its frozen base weight together with low-rank factors. Leaf paths
//! of adapter factors are the node path with `.lora_a` / `.lora_b` appended.

use crate::error::{Error, Result};
use crate::mesh::Mesh;
use crate::sharding::{PartitionSpec, Shardable, ShardedArray, ShardingRules};
use crate::tensor::{DType, Tensor};
use std::collections::BTreeMap;

pub const LORA_A_SUFFIX: &str = ".lora_a";
pub const LORA_B_SUFFIX: &str = ".lora_b";

/// One array on the mesh with its precision and trainability.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamLeaf {
    pub array: ShardedArray,
    pub dtype: DType,
    pub trainable: bool,
    /// Whether the array was placed with padding
    pub allow_padding: bool,
}

impl ParamLeaf {
    /// Place `tensor`, rounded to `dtype`, according to `placement`.
    pub fn place(
        tensor: &Tensor,
        mesh: &Mesh,
        spec: PartitionSpec,
        allow_padding: bool,
        dtype: DType,
        trainable: bool,
    ) -> Result<Self> {
        let array = ShardedArray::from_logical(&tensor.cast(dtype), mesh, spec, allow_padding)?;
        Ok(Self {
            array,
            dtype,
            trainable,
            allow_padding,
        })
    }

    /// Logical values at rest.
    pub fn value(&self) -> Tensor {
        self.array.gather()
    }

    /// Replace the logical values, keeping spec and dtype.
    pub fn set_value(&mut self, tensor: &Tensor, mesh: &Mesh) -> Result<()> {
        self.array = ShardedArray::from_logical(
            &tensor.cast(self.dtype),
            mesh,
            self.array.partition_spec().clone(),
            self.allow_padding,
        )?;
        Ok(())
    }
}

impl Shardable for ParamLeaf {
    fn shape(&self) -> &[usize] {
        self.array.shape()
    }

    fn partition_spec(&self) -> &PartitionSpec {
        self.array.partition_spec()
    }

    fn reshard(&self, mesh: &Mesh, spec: PartitionSpec, allow_padding: bool) -> Result<Self> {
        Ok(Self {
            array: self.array.reshard(mesh, spec, allow_padding)?,
            dtype: self.dtype,
            trainable: self.trainable,
            allow_padding,
        })
    }
}

/// A linear layer `[out, in]` wrapped with low-rank factors.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptedLinear {
    pub base: ParamLeaf,
    /// `[rank, in]`
    pub lora_a: ParamLeaf,
    /// `[out, rank]`
    pub lora_b: ParamLeaf,
    pub scaling: f32,
    /// The base weight already contains `B·A·scaling`
    pub merged: bool,
}

impl AdaptedLinear {
    pub fn rank(&self) -> usize {
        self.lora_a.shape().first().copied().unwrap_or(0)
    }
}

/// Tagged node of the parameter tree.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamNode {
    Dense(ParamLeaf),
    Adapted(AdaptedLinear),
}

/// Hierarchical mapping from parameter path to node, ordered by path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterTree {
    nodes: BTreeMap<String, ParamNode>,
}

impl ParameterTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place every tensor of an unsharded tree on the mesh.
    pub fn from_tensors(
        tensors: &BTreeMap<String, Tensor>,
        mesh: &Mesh,
        rules: &ShardingRules,
        dtype: DType,
        trainable: bool,
    ) -> Result<Self> {
        let mut tree = Self::new();
        for (path, tensor) in tensors {
            let placement = rules.placement_for(path, tensor.shape(), mesh)?;
            let leaf = ParamLeaf::place(
                tensor,
                mesh,
                placement.spec,
                placement.allow_padding,
                dtype,
                trainable,
            )?;
            tree.insert(path.clone(), ParamNode::Dense(leaf));
        }
        Ok(tree)
    }

    pub fn insert(&mut self, path: String, node: ParamNode) -> Option<ParamNode> {
        self.nodes.insert(path, node)
    }

    pub fn get(&self, path: &str) -> Option<&ParamNode> {
        self.nodes.get(path)
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut ParamNode> {
        self.nodes.get_mut(path)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&String, &ParamNode)> {
        self.nodes.iter()
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = (&String, &mut ParamNode)> {
        self.nodes.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every leaf with its flattened path.
    pub fn leaves(&self) -> Vec<(String, &ParamLeaf)> {
        let mut out = Vec::new();
        for (path, node) in &self.nodes {
            match node {
                ParamNode::Dense(leaf) => out.push((path.clone(), leaf)),
                ParamNode::Adapted(adapted) => {
                    out.push((path.clone(), &adapted.base));
                    out.push((format!("{}{}", path, LORA_A_SUFFIX), &adapted.lora_a));
                    out.push((format!("{}{}", path, LORA_B_SUFFIX), &adapted.lora_b));
                }
            }
        }
        out
    }

    /// Leaf at a flattened path.
    pub fn leaf(&self, path: &str) -> Option<&ParamLeaf> {
        if let Some(node) = self.nodes.get(path) {
            return Some(match node {
                ParamNode::Dense(leaf) => leaf,
                ParamNode::Adapted(adapted) => &adapted.base,
            });
        }
        let (node_path, suffix) = split_leaf_path(path)?;
        match self.nodes.get(node_path)? {
            ParamNode::Adapted(adapted) if suffix == LORA_A_SUFFIX => Some(&adapted.lora_a),
            ParamNode::Adapted(adapted) if suffix == LORA_B_SUFFIX => Some(&adapted.lora_b),
            _ => None,
        }
    }

    pub fn leaf_mut(&mut self, path: &str) -> Option<&mut ParamLeaf> {
        if self.nodes.contains_key(path) {
            return match self.nodes.get_mut(path)? {
                ParamNode::Dense(leaf) => Some(leaf),
                ParamNode::Adapted(adapted) => Some(&mut adapted.base),
            };
        }
        let (node_path, suffix) = split_leaf_path(path)?;
        match self.nodes.get_mut(node_path)? {
            ParamNode::Adapted(adapted) => match suffix {
                s if s == LORA_A_SUFFIX => Some(&mut adapted.lora_a),
                s if s == LORA_B_SUFFIX => Some(&mut adapted.lora_b),
                _ => None,
            },
            ParamNode::Dense(_) => None,
        }
    }

    /// Flattened paths of trainable leaves, ordered.
    pub fn trainable_paths(&self) -> Vec<String> {
        self.leaves()
            .into_iter()
            .filter(|(_, leaf)| leaf.trainable)
            .map(|(path, _)| path)
            .collect()
    }

    pub fn num_parameters(&self) -> usize {
        self.leaves().iter().map(|(_, l)| l.array.numel()).sum()
    }

    pub fn num_trainable(&self) -> usize {
        self.leaves()
            .iter()
            .filter(|(_, l)| l.trainable)
            .map(|(_, l)| l.array.numel())
            .sum()
    }

    pub fn has_adapters(&self) -> bool {
        self.nodes
            .values()
            .any(|n| matches!(n, ParamNode::Adapted(_)))
    }

    /// Every leaf spec references only axes of `mesh`, with matching sizes.
    pub fn validate_on(&self, mesh: &Mesh) -> Result<()> {
        for (path, leaf) in self.leaves() {
            if !leaf.array.fits_mesh(mesh) {
                return Err(Error::sharding(format!(
                    "leaf '{}' with spec {} does not fit mesh {}",
                    path,
                    leaf.partition_spec(),
                    mesh
                )));
            }
        }
        Ok(())
    }

    /// Move every leaf onto `mesh` using the placements `rules` give.
    pub fn reshard(&self, mesh: &Mesh, rules: &ShardingRules) -> Result<Self> {
        let mut out = Self::new();
        for (path, node) in &self.nodes {
            let node = match node {
                ParamNode::Dense(leaf) => {
                    let placement = rules.placement_for(path, leaf.shape(), mesh)?;
                    ParamNode::Dense(leaf.reshard(mesh, placement.spec, placement.allow_padding)?)
                }
                ParamNode::Adapted(adapted) => {
                    let placement = rules.placement_for(path, adapted.base.shape(), mesh)?;
                    let (a_spec, b_spec) = ShardingRules::adapter_specs(&placement.spec);
                    ParamNode::Adapted(AdaptedLinear {
                        base: adapted.base.reshard(mesh, placement.spec, placement.allow_padding)?,
                        lora_a: adapted.lora_a.reshard(mesh, a_spec, placement.allow_padding)?,
                        lora_b: adapted.lora_b.reshard(mesh, b_spec, placement.allow_padding)?,
                        scaling: adapted.scaling,
                        merged: adapted.merged,
                    })
                }
            };
            out.insert(path.clone(), node);
        }
        Ok(out)
    }

    /// Logical values of every leaf, keyed by flattened path.
    pub fn to_tensors(&self) -> BTreeMap<String, Tensor> {
        self.leaves()
            .into_iter()
            .map(|(path, leaf)| (path, leaf.value()))
            .collect()
    }
}

fn split_leaf_path(path: &str) -> Option<(&str, &str)> {
    for suffix in [LORA_A_SUFFIX, LORA_B_SUFFIX] {
        if let Some(node) = path.strip_suffix(suffix) {
            return Some((node, suffix));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::DeviceSet;

    fn setup() -> (Mesh, ShardingRules) {
        let mesh = Mesh::new(&[1, 2, 4], &["replica", "data", "model"], &DeviceSet::local(8)).unwrap();
        let rules = ShardingRules::new("model", vec!["replica".into(), "data".into()])
            .with_min_shard_elements(16);
        (mesh, rules)
    }

    fn tensors() -> BTreeMap<String, Tensor> {
        let mut t = BTreeMap::new();
        t.insert("embed.weight".to_string(), Tensor::zeros(&[16, 8]));
        t.insert("norm.scale".to_string(), Tensor::zeros(&[8]));
        t
    }

    #[test]
    fn test_tree_placement() {
        let (mesh, rules) = setup();
        let tree = ParameterTree::from_tensors(&tensors(), &mesh, &rules, DType::BFloat16, true).unwrap();
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.num_parameters(), 16 * 8 + 8);
        assert_eq!(tree.num_trainable(), tree.num_parameters());
        assert!(!tree.has_adapters());
        tree.validate_on(&mesh).unwrap();

        let embed = tree.leaf("embed.weight").unwrap();
        assert_eq!(embed.partition_spec(), &PartitionSpec::sharded(2, 0, "model"));
        assert_eq!(embed.dtype, DType::BFloat16);
        assert!(tree.leaf("norm.scale").unwrap().partition_spec().is_replicated());
        assert!(tree.leaf("embed.weight.lora_a").is_none());
    }

    #[test]
    fn test_validate_on_other_mesh() {
        let (mesh, rules) = setup();
        let tree = ParameterTree::from_tensors(&tensors(), &mesh, &rules, DType::Float32, true).unwrap();
        let other = Mesh::new(&[2, 2, 2], &["replica", "data", "model"], &DeviceSet::local(8)).unwrap();
        assert!(tree.validate_on(&other).is_err());

        let moved = tree.reshard(&other, &rules).unwrap();
        moved.validate_on(&other).unwrap();
        assert_eq!(moved.to_tensors(), tree.to_tensors());
    }

    #[test]
    fn test_leaf_mut_reaches_adapter_factors() {
        use rand::SeedableRng;
        let (mesh, rules) = setup();
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(3);
        let dense = ParameterTree::from_tensors(&tensors(), &mesh, &rules, DType::Float32, true).unwrap();
        let mut tree = crate::lora::inject_adapters(
            &dense,
            &["embed.weight".to_string()],
            &crate::lora::LoRAConfig::new(2),
            &mesh,
            &rules,
            &mut rng,
        )
        .unwrap();

        let b = tree.leaf_mut("embed.weight.lora_b").unwrap();
        let ones = b.value().map(|_| 1.0);
        b.set_value(&ones, &mesh).unwrap();
        assert!(tree.leaf("embed.weight.lora_b").unwrap().value().data().iter().all(|&x| x == 1.0));

        assert!(tree.leaf_mut("embed.weight.lora_a").unwrap().trainable);
        assert!(!tree.leaf_mut("embed.weight").unwrap().trainable);
        assert!(tree.leaf_mut("norm.scale.lora_a").is_none());
        assert!(tree.leaf_mut("missing.lora_b").is_none());
    }
}
