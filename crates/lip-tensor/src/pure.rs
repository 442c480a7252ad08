// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Dense row-major tensors and the error type shared by the whole stack.

use lip_config::determinism;
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand_distr::StandardNormal;
use std::sync::Arc;

/// Result alias used throughout the tensor and layer crates.
pub type PureResult<T> = Result<T, TensorError>;

/// Errors emitted by tensor utilities and layers.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum TensorError {
    /// A tensor constructor received an invalid shape.
    #[error("invalid tensor dimensions ({rows} x {cols}); both axes must be non-zero")]
    InvalidDimensions { rows: usize, cols: usize },
    /// Data provided to a constructor or operator does not match the tensor shape.
    #[error("data length mismatch: expected {expected}, got {got}")]
    DataLength { expected: usize, got: usize },
    /// An operator was asked to combine tensors of incompatible shapes.
    #[error("shape mismatch: left={left:?}, right={right:?} cannot be combined")]
    ShapeMismatch {
        left: (usize, usize),
        right: (usize, usize),
    },
    /// Gauss-Jordan elimination met a vanishing pivot.
    #[error("matrix {index} in the batch is singular (pivot magnitude {pivot:e})")]
    SingularMatrix { index: usize, pivot: f32 },
    /// Computation received an empty input which would otherwise trigger a panic.
    #[error("empty input passed to {0}")]
    EmptyInput(&'static str),
    /// Generic configuration violation.
    #[error("invalid value for {label}")]
    InvalidValue { label: &'static str },
    /// Numeric guard detected a non-finite value that would otherwise propagate NaNs.
    #[error("non-finite value {value} detected in {label}")]
    NonFiniteValue { label: &'static str, value: f32 },
    /// Attempted to load or update a parameter that was missing from the state dict.
    #[error("parameter '{name}' is missing from the state dict")]
    MissingParameter { name: String },
    /// Wrapper around I/O failures when persisting or restoring tensors.
    #[error("i/o failure: {message}")]
    IoError { message: String },
    /// Wrapper around serde failures when (de)serialising tensors.
    #[error("serialization failure: {message}")]
    SerializationError { message: String },
}

/// A simple 2D tensor backed by a reference-counted row-major buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    data: Arc<Vec<f32>>,
    rows: usize,
    cols: usize,
}

impl Tensor {
    fn seedable_rng(seed: Option<u64>, label: &str) -> StdRng {
        determinism::rng_from_optional(seed, label)
    }

    /// Create a tensor filled with zeros.
    pub fn zeros(rows: usize, cols: usize) -> PureResult<Self> {
        Self::from_vec(rows, cols, vec![0.0; rows * cols])
    }

    /// Create a tensor from raw data. The provided vector must match
    /// `rows * cols` elements.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        let expected = rows * cols;
        if expected != data.len() {
            return Err(TensorError::DataLength {
                expected,
                got: data.len(),
            });
        }
        Ok(Self {
            data: Arc::new(data),
            rows,
            cols,
        })
    }

    /// Construct a tensor by sampling a uniform distribution in `[min, max)`.
    ///
    /// When `seed` is provided the RNG becomes deterministic which makes tests
    /// reproducible. Otherwise the process determinism settings decide.
    pub fn random_uniform(
        rows: usize,
        cols: usize,
        min: f32,
        max: f32,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        let mut rng = Self::seedable_rng(seed, "lip-tensor/tensor/uniform");
        Self::random_uniform_with(rows, cols, min, max, &mut rng)
    }

    /// Uniform sampling driven by a caller-owned RNG.
    pub fn random_uniform_with(
        rows: usize,
        cols: usize,
        min: f32,
        max: f32,
        rng: &mut StdRng,
    ) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        if !(min < max) {
            return Err(TensorError::InvalidValue {
                label: "random_uniform_bounds",
            });
        }
        let distribution = Uniform::new(min, max);
        let data = (0..rows * cols).map(|_| distribution.sample(rng)).collect();
        Self::from_vec(rows, cols, data)
    }

    /// Construct a tensor by sampling a normal distribution with the provided
    /// mean and standard deviation.
    pub fn random_normal(
        rows: usize,
        cols: usize,
        mean: f32,
        std: f32,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        let mut rng = Self::seedable_rng(seed, "lip-tensor/tensor/normal");
        Self::random_normal_with(rows, cols, mean, std, &mut rng)
    }

    /// Normal sampling driven by a caller-owned RNG.
    pub fn random_normal_with(
        rows: usize,
        cols: usize,
        mean: f32,
        std: f32,
        rng: &mut StdRng,
    ) -> PureResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        if std <= 0.0 {
            return Err(TensorError::InvalidValue {
                label: "random_normal_std",
            });
        }
        let data = (0..rows * cols)
            .map(|_| {
                let sample: f64 = StandardNormal.sample(rng);
                mean + std * sample as f32
            })
            .collect();
        Self::from_vec(rows, cols, data)
    }

    /// Construct a tensor by applying a generator function to each coordinate.
    pub fn from_fn<F>(rows: usize, cols: usize, mut f: F) -> PureResult<Self>
    where
        F: FnMut(usize, usize) -> f32,
    {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        let mut data = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                data.push(f(r, c));
            }
        }
        Self::from_vec(rows, cols, data)
    }

    /// Returns the `(rows, cols)` pair of the tensor.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Total number of elements stored in the tensor.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Tensors always hold at least one element; kept for API symmetry.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Read-only access to the row-major buffer.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable access to the row-major buffer. Clones on write when shared.
    pub fn data_mut(&mut self) -> &mut [f32] {
        Arc::make_mut(&mut self.data).as_mut_slice()
    }

    /// Returns a single row as a slice.
    pub fn row(&self, index: usize) -> PureResult<&[f32]> {
        if index >= self.rows {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: (index, self.cols),
            });
        }
        Ok(&self.data[index * self.cols..(index + 1) * self.cols])
    }

    /// Matrix multiply (`self @ other`).
    pub fn matmul(&self, other: &Tensor) -> PureResult<Tensor> {
        if self.cols != other.rows {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        let (rows, inner, cols) = (self.rows, self.cols, other.cols);
        let mut out = vec![0.0f32; rows * cols];
        for r in 0..rows {
            let lhs = &self.data[r * inner..(r + 1) * inner];
            let dst = &mut out[r * cols..(r + 1) * cols];
            for (k, &a) in lhs.iter().enumerate() {
                if a == 0.0 {
                    continue;
                }
                let rhs = &other.data[k * cols..(k + 1) * cols];
                for (d, &b) in dst.iter_mut().zip(rhs.iter()) {
                    *d += a * b;
                }
            }
        }
        Tensor::from_vec(rows, cols, out)
    }

    /// Element-wise addition.
    pub fn add(&self, other: &Tensor) -> PureResult<Tensor> {
        self.zip_with(other, |a, b| a + b)
    }

    /// Element-wise subtraction.
    pub fn sub(&self, other: &Tensor) -> PureResult<Tensor> {
        self.zip_with(other, |a, b| a - b)
    }

    fn zip_with(&self, other: &Tensor, f: impl Fn(f32, f32) -> f32) -> PureResult<Tensor> {
        if self.shape() != other.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(&a, &b)| f(a, b))
            .collect();
        Tensor::from_vec(self.rows, self.cols, data)
    }

    /// Returns a new tensor where every element is scaled by `value`.
    pub fn scale(&self, value: f32) -> PureResult<Tensor> {
        self.map(|a| a * value)
    }

    /// Applies `f` to every element.
    pub fn map(&self, f: impl Fn(f32) -> f32) -> PureResult<Tensor> {
        let data = self.data.iter().map(|&a| f(a)).collect();
        Tensor::from_vec(self.rows, self.cols, data)
    }

    /// Add a scaled tensor to this tensor (`self += scale * other`).
    pub fn add_scaled(&mut self, other: &Tensor, scale: f32) -> PureResult<()> {
        if self.shape() != other.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        let data = Arc::make_mut(&mut self.data);
        for (a, b) in data.iter_mut().zip(other.data.iter()) {
            *a += scale * b;
        }
        Ok(())
    }

    /// Add the provided row vector to every row (`self[row] += bias`).
    pub fn add_row_inplace(&mut self, bias: &[f32]) -> PureResult<()> {
        if bias.len() != self.cols {
            return Err(TensorError::DataLength {
                expected: self.cols,
                got: bias.len(),
            });
        }
        let cols = self.cols;
        let data = Arc::make_mut(&mut self.data);
        for row in data.chunks_mut(cols) {
            for (value, b) in row.iter_mut().zip(bias.iter()) {
                *value += b;
            }
        }
        Ok(())
    }

    /// Adds `bias[c]` to every element of channel `c`, treating each row as
    /// `channels` contiguous planes.
    pub fn add_channel_bias_inplace(&mut self, bias: &[f32]) -> PureResult<()> {
        if bias.is_empty() || self.cols % bias.len() != 0 {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: (1, bias.len()),
            });
        }
        let plane = self.cols / bias.len();
        let data = Arc::make_mut(&mut self.data);
        for (idx, value) in data.iter_mut().enumerate() {
            let channel = (idx / plane) % bias.len();
            *value += bias[channel];
        }
        Ok(())
    }

    /// Sums every channel plane, returning one value per channel accumulated
    /// over the batch.
    pub fn sum_channels(&self, channels: usize) -> PureResult<Vec<f32>> {
        if channels == 0 || self.cols % channels != 0 {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: (1, channels),
            });
        }
        let plane = self.cols / channels;
        let mut sums = vec![0.0f32; channels];
        for (idx, value) in self.data.iter().enumerate() {
            sums[(idx / plane) % channels] += value;
        }
        Ok(sums)
    }

    /// Returns the transpose of the tensor.
    pub fn transpose(&self) -> Tensor {
        let mut data = vec![0.0f32; self.len()];
        for r in 0..self.rows {
            for c in 0..self.cols {
                data[c * self.rows + r] = self.data[r * self.cols + c];
            }
        }
        Tensor {
            data: Arc::new(data),
            rows: self.cols,
            cols: self.rows,
        }
    }

    /// Returns the sum over rows for each column.
    pub fn sum_axis0(&self) -> Vec<f32> {
        let mut sums = vec![0.0; self.cols];
        for row in self.data.chunks(self.cols) {
            for (s, v) in sums.iter_mut().zip(row.iter()) {
                *s += v;
            }
        }
        sums
    }

    /// Computes the squared L2 norm of the tensor.
    pub fn squared_l2_norm(&self) -> f32 {
        self.data.iter().map(|v| v * v).sum()
    }

    /// Frobenius norm of the tensor.
    pub fn l2_norm(&self) -> f32 {
        self.squared_l2_norm().sqrt()
    }

    /// Largest absolute element-wise difference to `other`.
    pub fn max_abs_diff(&self, other: &Tensor) -> PureResult<f32> {
        if self.shape() != other.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        Ok(self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matmul_matches_manual() {
        let a = Tensor::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let b = Tensor::from_vec(3, 2, vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0]).unwrap();
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.shape(), (2, 2));
        assert_eq!(c.data(), &[4.0, 5.0, 10.0, 11.0]);
    }

    #[test]
    fn transpose_swaps_axes() {
        let a = Tensor::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let t = a.transpose();
        assert_eq!(t.shape(), (3, 2));
        assert_eq!(t.data(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn channel_bias_broadcasts_over_planes() {
        let mut x = Tensor::zeros(2, 8).unwrap();
        x.add_channel_bias_inplace(&[1.0, -1.0]).unwrap();
        assert_eq!(&x.data()[..8], &[1.0, 1.0, 1.0, 1.0, -1.0, -1.0, -1.0, -1.0]);
        assert_eq!(x.sum_channels(2).unwrap(), vec![8.0, -8.0]);
    }

    #[test]
    fn rejects_zero_dimensions() {
        assert_eq!(
            Tensor::zeros(0, 3),
            Err(TensorError::InvalidDimensions { rows: 0, cols: 3 })
        );
    }

    #[test]
    fn data_mut_copies_shared_buffers() {
        let original = Tensor::from_vec(1, 3, vec![1.0, 2.0, 3.0]).unwrap();
        let mut copy = original.clone();
        copy.data_mut()[1] = 9.0;
        assert_eq!(original.data(), &[1.0, 2.0, 3.0]);
        assert_eq!(copy.data(), &[1.0, 9.0, 3.0]);
    }

    #[test]
    fn seeded_sampling_is_reproducible() {
        let a = Tensor::random_normal(3, 4, 0.0, 1.0, Some(9)).unwrap();
        let b = Tensor::random_normal(3, 4, 0.0, 1.0, Some(9)).unwrap();
        assert_eq!(a, b);
        let u = Tensor::random_uniform(2, 2, -0.5, 0.5, Some(1)).unwrap();
        assert!(u.data().iter().all(|v| (-0.5..0.5).contains(v)));
    }
}
