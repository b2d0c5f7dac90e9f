//! Parameter sharding over a device mesh.
//!
//! A [`PartitionSpec`] assigns each tensor dimension to at most one mesh axis.
//! A [`ShardedArray`] holds the physical blocks produced by that assignment:
//! one block per distinct shard, shared by every device that replicates it.

pub mod rules;

use crate::error::{Error, Result};
use crate::mesh::{Device, Mesh};
use crate::tensor::{next_index, strides, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

pub use rules::{Placement, ShardingRule, ShardingRules};

/// Assignment of tensor dimensions to mesh axes; `None` replicates a dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionSpec(Vec<Option<String>>);

impl PartitionSpec {
    pub fn new(dims: Vec<Option<String>>) -> Self {
        Self(dims)
    }

    pub fn replicated(rank: usize) -> Self {
        Self(vec![None; rank])
    }

    /// Spec that splits dimension `dim` along `axis` and replicates the rest.
    pub fn sharded(rank: usize, dim: usize, axis: &str) -> Self {
        let mut dims = vec![None; rank];
        if dim < rank {
            dims[dim] = Some(axis.to_string());
        }
        Self(dims)
    }

    pub fn dims(&self) -> &[Option<String>] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn axis_for_dim(&self, dim: usize) -> Option<&str> {
        self.0.get(dim).and_then(|a| a.as_deref())
    }

    /// Mesh axes referenced by this spec.
    pub fn axes(&self) -> impl Iterator<Item = &str> {
        self.0.iter().filter_map(|a| a.as_deref())
    }

    pub fn is_replicated(&self) -> bool {
        self.0.iter().all(Option::is_none)
    }

    /// Check the spec against `shape` on `mesh` and return the number of
    /// parts each dimension is split into.
    pub fn validate(&self, shape: &[usize], mesh: &Mesh, allow_padding: bool) -> Result<Vec<usize>> {
        if self.rank() != shape.len() {
            return Err(Error::sharding(format!(
                "spec {} has rank {} but array shape {:?} has rank {}",
                self,
                self.rank(),
                shape,
                shape.len()
            )));
        }
        if shape.iter().any(|&d| d == 0) {
            return Err(Error::sharding(format!(
                "cannot shard array with empty dimension {:?}",
                shape
            )));
        }

        let mut used = HashSet::new();
        let mut parts = Vec::with_capacity(shape.len());
        for (dim, (axis, &size)) in self.0.iter().zip(shape).enumerate() {
            let Some(axis) = axis else {
                parts.push(1);
                continue;
            };
            let count = mesh.axis_size(axis).ok_or_else(|| {
                Error::sharding(format!("spec {} references unknown mesh axis '{}'", self, axis))
            })?;
            if !used.insert(axis.as_str()) {
                return Err(Error::sharding(format!(
                    "spec {} uses mesh axis '{}' more than once",
                    self, axis
                )));
            }
            if size % count != 0 && !allow_padding {
                return Err(Error::sharding(format!(
                    "dimension {} of size {} is not divisible by {} shards along '{}'",
                    dim, size, count, axis
                )));
            }
            parts.push(count);
        }
        Ok(parts)
    }
}

impl fmt::Display for PartitionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<&str> = self
            .0
            .iter()
            .map(|a| a.as_deref().unwrap_or("*"))
            .collect();
        write!(f, "P({})", dims.join(", "))
    }
}

/// Capability shared by everything that lives on the mesh.
pub trait Shardable: Sized {
    /// Logical (unsharded) shape.
    fn shape(&self) -> &[usize];

    fn partition_spec(&self) -> &PartitionSpec;

    /// Move to a new spec, possibly on a different mesh, preserving logical values.
    fn reshard(&self, mesh: &Mesh, spec: PartitionSpec, allow_padding: bool) -> Result<Self>;
}

/// The block of a sharded array one device holds.
#[derive(Debug, Clone, Copy)]
pub struct ShardView<'a> {
    pub index: &'a [usize],
    pub shape: &'a [usize],
    pub data: &'a [f32],
}

/// An array split into blocks according to a [`PartitionSpec`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardedArray {
    shape: Vec<usize>,
    spec: PartitionSpec,
    /// Number of parts along each dimension
    parts: Vec<usize>,
    /// Shape of every block, including padding
    block_shape: Vec<usize>,
    /// Block indices in row-major order over `parts`
    block_indices: Vec<Vec<usize>>,
    blocks: Vec<Vec<f32>>,
}

impl ShardedArray {
    /// Split a logical tensor according to `spec` on `mesh`.
    pub fn from_logical(
        tensor: &Tensor,
        mesh: &Mesh,
        spec: PartitionSpec,
        allow_padding: bool,
    ) -> Result<Self> {
        let shape = tensor.shape().to_vec();
        let parts = spec.validate(&shape, mesh, allow_padding)?;
        let block_shape: Vec<usize> = shape
            .iter()
            .zip(&parts)
            .map(|(&d, &p)| d.div_ceil(p))
            .collect();
        let logical_strides = strides(&shape);
        let block_numel: usize = block_shape.iter().product();
        let src = tensor.data();

        let mut block_indices = Vec::new();
        let mut blocks = Vec::new();
        let mut bidx = vec![0usize; shape.len()];
        loop {
            let mut data = Vec::with_capacity(block_numel);
            let mut local = vec![0usize; shape.len()];
            loop {
                let mut offset = 0;
                let mut inside = true;
                for d in 0..shape.len() {
                    let g = bidx[d] * block_shape[d] + local[d];
                    if g >= shape[d] {
                        inside = false;
                        break;
                    }
                    offset += g * logical_strides[d];
                }
                data.push(if inside { src[offset] } else { 0.0 });
                if !next_index(&mut local, &block_shape) {
                    break;
                }
            }
            block_indices.push(bidx.clone());
            blocks.push(data);
            if !next_index(&mut bidx, &parts) {
                break;
            }
        }

        Ok(Self {
            shape,
            spec,
            parts,
            block_shape,
            block_indices,
            blocks,
        })
    }

    /// Rebuild an array from stored blocks, validating their layout.
    pub fn from_blocks(
        shape: Vec<usize>,
        spec: PartitionSpec,
        parts: Vec<usize>,
        blocks: Vec<(Vec<usize>, Vec<f32>)>,
    ) -> Result<Self> {
        if spec.rank() != shape.len() || parts.len() != shape.len() {
            return Err(Error::sharding(format!(
                "layout rank mismatch: shape {:?}, spec {}, parts {:?}",
                shape, spec, parts
            )));
        }
        if parts.iter().any(|&p| p == 0) || shape.iter().any(|&d| d == 0) {
            return Err(Error::sharding(format!(
                "invalid layout: shape {:?}, parts {:?}",
                shape, parts
            )));
        }
        let block_shape: Vec<usize> = shape
            .iter()
            .zip(&parts)
            .map(|(&d, &p)| d.div_ceil(p))
            .collect();
        let block_numel: usize = block_shape.iter().product();
        let num_blocks: usize = parts.iter().product();

        let mut slots: Vec<Option<Vec<f32>>> = vec![None; num_blocks];
        for (index, data) in blocks {
            if index.len() != parts.len() || index.iter().zip(&parts).any(|(i, p)| i >= p) {
                return Err(Error::sharding(format!(
                    "block index {:?} outside of parts {:?}",
                    index, parts
                )));
            }
            if data.len() != block_numel {
                return Err(Error::sharding(format!(
                    "block {:?} has {} elements, expected {}",
                    index,
                    data.len(),
                    block_numel
                )));
            }
            let linear = index.iter().zip(&parts).fold(0, |acc, (i, p)| acc * p + i);
            if slots[linear].replace(data).is_some() {
                return Err(Error::sharding(format!("block {:?} appears more than once", index)));
            }
        }

        let mut block_indices = Vec::with_capacity(num_blocks);
        let mut out = Vec::with_capacity(num_blocks);
        let mut bidx = vec![0usize; parts.len()];
        for slot in slots {
            let data = slot.ok_or_else(|| {
                Error::sharding(format!("missing block {:?} for shape {:?}", bidx, shape))
            })?;
            block_indices.push(bidx.clone());
            out.push(data);
            next_index(&mut bidx, &parts);
        }

        Ok(Self {
            shape,
            spec,
            parts,
            block_shape,
            block_indices,
            blocks: out,
        })
    }

    /// Reassemble the logical tensor, dropping any padding.
    pub fn gather(&self) -> Tensor {
        let rank = self.shape.len();
        let logical_strides = strides(&self.shape);
        let mut out = vec![0.0f32; self.shape.iter().product()];
        for (bidx, data) in self.block_indices.iter().zip(&self.blocks) {
            let mut local = vec![0usize; rank];
            let mut pos = 0;
            loop {
                let mut offset = 0;
                let mut inside = true;
                for d in 0..rank {
                    let g = bidx[d] * self.block_shape[d] + local[d];
                    if g >= self.shape[d] {
                        inside = false;
                        break;
                    }
                    offset += g * logical_strides[d];
                }
                if inside {
                    out[offset] = data[pos];
                }
                pos += 1;
                if !next_index(&mut local, &self.block_shape) {
                    break;
                }
            }
        }
        Tensor::from_vec(self.shape.clone(), out)
    }

    pub fn parts(&self) -> &[usize] {
        &self.parts
    }

    pub fn block_shape(&self) -> &[usize] {
        &self.block_shape
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_padded(&self) -> bool {
        self.shape
            .iter()
            .zip(&self.parts)
            .any(|(&d, &p)| d % p != 0)
    }

    /// Blocks paired with their indices, row-major.
    pub fn blocks(&self) -> impl Iterator<Item = (&[usize], &[f32])> {
        self.block_indices
            .iter()
            .zip(&self.blocks)
            .map(|(i, b)| (i.as_slice(), b.as_slice()))
    }

    /// Index of the block a device at `coords` holds.
    pub fn block_index_for(&self, mesh: &Mesh, coords: &[usize]) -> Result<Vec<usize>> {
        self.spec
            .dims()
            .iter()
            .map(|axis| match axis {
                None => Ok(0),
                Some(name) => mesh
                    .axis_index(name)
                    .and_then(|d| coords.get(d).copied())
                    .ok_or_else(|| {
                        Error::sharding(format!("array is sharded over '{}' which is not in mesh {}", name, mesh))
                    }),
            })
            .collect()
    }

    /// The physical block held by `device`.
    pub fn shard_for_device(&self, mesh: &Mesh, device: Device) -> Result<ShardView<'_>> {
        let coords = mesh
            .coords_of(device)
            .ok_or_else(|| Error::sharding(format!("{} is not part of mesh {}", device, mesh)))?;
        let index = self.block_index_for(mesh, &coords)?;
        let linear = index
            .iter()
            .zip(&self.parts)
            .fold(0, |acc, (i, p)| acc * p + i);
        Ok(ShardView {
            index: &self.block_indices[linear],
            shape: &self.block_shape,
            data: &self.blocks[linear],
        })
    }

    /// True when every referenced axis exists in `mesh` with the recorded size.
    pub fn fits_mesh(&self, mesh: &Mesh) -> bool {
        self.spec
            .dims()
            .iter()
            .zip(&self.parts)
            .all(|(axis, &p)| match axis {
                None => p == 1,
                Some(name) => mesh.axis_size(name) == Some(p),
            })
    }
}

impl Shardable for ShardedArray {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn partition_spec(&self) -> &PartitionSpec {
        &self.spec
    }

    fn reshard(&self, mesh: &Mesh, spec: PartitionSpec, allow_padding: bool) -> Result<Self> {
        if spec == self.spec && self.fits_mesh(mesh) {
            return Ok(self.clone());
        }
        ShardedArray::from_logical(&self.gather(), mesh, spec, allow_padding)
    }
}
