//! Dense host tensors and the precision model used for parameters at rest
//! and for compute.

use crate::error::{Error, Result};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Numeric precision of a stored or computed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    #[default]
    Float32,
    BFloat16,
    Float16,
}

impl DType {
    /// Round an f32 to the precision of this dtype.
    pub fn round(self, x: f32) -> f32 {
        match self {
            DType::Float32 => x,
            DType::BFloat16 => half::bf16::from_f32(x).to_f32(),
            DType::Float16 => half::f16::from_f32(x).to_f32(),
        }
    }

    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::Float32 => 4,
            DType::BFloat16 | DType::Float16 => 2,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::Float32 => "float32",
            DType::BFloat16 => "bfloat16",
            DType::Float16 => "float16",
        };
        f.write_str(name)
    }
}

impl FromStr for DType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "float32" | "f32" => Ok(DType::Float32),
            "bfloat16" | "bf16" => Ok(DType::BFloat16),
            "float16" | "f16" => Ok(DType::Float16),
            other => Err(Error::config(format!("unknown dtype '{}'", other))),
        }
    }
}

/// Row-major dense f32 tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if numel != data.len() {
            return Err(Error::Internal(format!(
                "tensor shape {:?} needs {} elements, got {}",
                shape,
                numel,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// Build from data whose length the caller has already matched to `shape`.
    pub(crate) fn from_vec(shape: Vec<usize>, data: Vec<f32>) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), data.len());
        Self { shape, data }
    }

    pub fn zeros(shape: &[usize]) -> Self {
        let numel = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            data: vec![0.0; numel],
        }
    }

    /// Gaussian init with the given standard deviation.
    pub fn randn<R: Rng + ?Sized>(shape: &[usize], std: f32, rng: &mut R) -> Self {
        let numel: usize = shape.iter().product();
        let data = match Normal::new(0.0f32, std) {
            Ok(normal) => (0..numel).map(|_| normal.sample(rng)).collect(),
            // A zero or non-finite std degenerates to zeros
            Err(_) => vec![0.0; numel],
        };
        Self {
            shape: shape.to_vec(),
            data,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Rows and columns of a rank-2 tensor.
    pub fn dims2(&self) -> Result<(usize, usize)> {
        match self.shape.as_slice() {
            [r, c] => Ok((*r, *c)),
            other => Err(Error::Internal(format!(
                "expected a matrix, got shape {:?}",
                other
            ))),
        }
    }

    /// Row `i` of a rank-2 tensor.
    pub fn row(&self, i: usize) -> &[f32] {
        let cols = self.shape.get(1).copied().unwrap_or(1);
        &self.data[i * cols..(i + 1) * cols]
    }

    pub fn matmul(&self, other: &Tensor) -> Result<Tensor> {
        let (m, k) = self.dims2()?;
        let (k2, n) = other.dims2()?;
        if k != k2 {
            return Err(Error::Internal(format!(
                "matmul inner dimensions differ: {:?} x {:?}",
                self.shape, other.shape
            )));
        }
        let mut out = vec![0.0f32; m * n];
        for i in 0..m {
            let lhs = &self.data[i * k..(i + 1) * k];
            let dst = &mut out[i * n..(i + 1) * n];
            for (p, &a) in lhs.iter().enumerate() {
                if a == 0.0 {
                    continue;
                }
                let rhs = &other.data[p * n..(p + 1) * n];
                for (d, &b) in dst.iter_mut().zip(rhs) {
                    *d += a * b;
                }
            }
        }
        Tensor::new(vec![m, n], out)
    }

    pub fn transpose(&self) -> Result<Tensor> {
        let (r, c) = self.dims2()?;
        let mut out = vec![0.0f32; r * c];
        for i in 0..r {
            for j in 0..c {
                out[j * r + i] = self.data[i * c + j];
            }
        }
        Tensor::new(vec![c, r], out)
    }

    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        self.zip_with(other, |a, b| a + b)
    }

    pub fn sub(&self, other: &Tensor) -> Result<Tensor> {
        self.zip_with(other, |a, b| a - b)
    }

    pub fn scale(&self, factor: f32) -> Tensor {
        self.map(|x| x * factor)
    }

    pub fn map(&self, f: impl Fn(f32) -> f32) -> Tensor {
        Tensor {
            shape: self.shape.clone(),
            data: self.data.iter().map(|&x| f(x)).collect(),
        }
    }

    fn zip_with(&self, other: &Tensor, f: impl Fn(f32, f32) -> f32) -> Result<Tensor> {
        if self.shape != other.shape {
            return Err(Error::Internal(format!(
                "shape mismatch: {:?} vs {:?}",
                self.shape, other.shape
            )));
        }
        Ok(Tensor {
            shape: self.shape.clone(),
            data: self
                .data
                .iter()
                .zip(&other.data)
                .map(|(&a, &b)| f(a, b))
                .collect(),
        })
    }

    /// Round every element to `dtype` precision.
    pub fn cast(&self, dtype: DType) -> Tensor {
        match dtype {
            DType::Float32 => self.clone(),
            _ => self.map(|x| dtype.round(x)),
        }
    }

    pub fn sum_of_squares(&self) -> f64 {
        self.data.iter().map(|&x| (x as f64) * (x as f64)).sum()
    }

    pub fn all_finite(&self) -> bool {
        self.data.iter().all(|x| x.is_finite())
    }

    /// Largest elementwise absolute difference; infinite on shape mismatch.
    pub fn max_abs_diff(&self, other: &Tensor) -> f32 {
        if self.shape != other.shape {
            return f32::INFINITY;
        }
        self.data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f32::max)
    }
}

/// Row-major strides for `shape`.
pub(crate) fn strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// Advance a row-major multi-index; returns false after the last index.
pub(crate) fn next_index(index: &mut [usize], shape: &[usize]) -> bool {
    for d in (0..shape.len()).rev() {
        index[d] += 1;
        if index[d] < shape[d] {
            return true;
        }
        index[d] = 0;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_matmul_and_transpose() {
        let a = Tensor::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let b = Tensor::new(vec![3, 1], vec![1.0, 0.0, -1.0]).unwrap();
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.shape(), &[2, 1]);
        assert_eq!(c.data(), &[-2.0, -2.0]);

        let t = a.transpose().unwrap();
        assert_eq!(t.shape(), &[3, 2]);
        assert_eq!(t.data(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        assert!(a.matmul(&a).is_err());
    }

    #[test]
    fn test_dtype_rounding() {
        let x = 1.0 + 1.0 / 1024.0;
        assert_eq!(DType::Float32.round(x), x);
        assert_eq!(DType::Float16.round(x), x);
        assert_eq!(DType::BFloat16.round(x), 1.0);
        assert_eq!("bfloat16".parse::<DType>().unwrap(), DType::BFloat16);
        assert!("int8".parse::<DType>().is_err());
        assert_eq!(DType::Float16.to_string(), "float16");
    }

    #[test]
    fn test_randn_is_seeded() {
        let mut r1 = ChaCha8Rng::seed_from_u64(7);
        let mut r2 = ChaCha8Rng::seed_from_u64(7);
        let a = Tensor::randn(&[4, 4], 0.02, &mut r1);
        let b = Tensor::randn(&[4, 4], 0.02, &mut r2);
        assert_eq!(a, b);
        assert!(a.data().iter().any(|&x| x != 0.0));
    }

    #[test]
    fn test_next_index_walks_row_major() {
        let shape = [2, 2];
        let mut idx = vec![0, 0];
        let mut seen = vec![idx.clone()];
        while next_index(&mut idx, &shape) {
            seen.push(idx.clone());
        }
        assert_eq!(seen, vec![vec![0, 0], vec![0, 1], vec![1, 0], vec![1, 1]]);
        assert_eq!(strides(&[2, 3, 4]), vec![12, 4, 1]);
    }
}
