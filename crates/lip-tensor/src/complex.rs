// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Batched complex matrices.
//!
//! A [`ComplexStack`] stores `batch` matrices of identical shape in an
//! `ndarray::Array3<Complex32>` indexed as `(batch, row, col)`. Spectral layers
//! use one batch entry per frequency bin.

use crate::pure::{PureResult, Tensor, TensorError};
use nalgebra::DMatrix;
use ndarray::{s, Array3, ArrayView2, Axis};
use num_complex::Complex32;

/// Pivots with a magnitude below this threshold are treated as singular.
const PIVOT_EPS: f32 = 1e-12;

/// Stack of equally-shaped complex matrices.
#[derive(Clone, Debug, PartialEq)]
pub struct ComplexStack {
    data: Array3<Complex32>,
}

impl ComplexStack {
    fn check_dims(batch: usize, rows: usize, cols: usize) -> PureResult<()> {
        if batch == 0 {
            return Err(TensorError::EmptyInput("ComplexStack"));
        }
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        Ok(())
    }

    /// Stack of zero matrices.
    pub fn zeros(batch: usize, rows: usize, cols: usize) -> PureResult<Self> {
        Self::check_dims(batch, rows, cols)?;
        Ok(Self {
            data: Array3::zeros((batch, rows, cols)),
        })
    }

    /// Stack of identity matrices.
    pub fn identity(batch: usize, size: usize) -> PureResult<Self> {
        let mut stack = Self::zeros(batch, size, size)?;
        for mut matrix in stack.data.outer_iter_mut() {
            for i in 0..size {
                matrix[[i, i]] = Complex32::new(1.0, 0.0);
            }
        }
        Ok(stack)
    }

    /// Wraps an existing array.
    pub fn from_array(data: Array3<Complex32>) -> PureResult<Self> {
        let (batch, rows, cols) = data.dim();
        Self::check_dims(batch, rows, cols)?;
        Ok(Self { data })
    }

    /// Builds a stack from row-major data ordered `(batch, row, col)`.
    pub fn from_vec(
        batch: usize,
        rows: usize,
        cols: usize,
        data: Vec<Complex32>,
    ) -> PureResult<Self> {
        Self::check_dims(batch, rows, cols)?;
        let expected = batch * rows * cols;
        if data.len() != expected {
            return Err(TensorError::DataLength {
                expected,
                got: data.len(),
            });
        }
        let data = Array3::from_shape_vec((batch, rows, cols), data).map_err(|_| {
            TensorError::DataLength {
                expected,
                got: expected,
            }
        })?;
        Ok(Self { data })
    }

    /// Lifts a real matrix into a stack with a single entry.
    pub fn from_real(tensor: &Tensor) -> PureResult<Self> {
        let (rows, cols) = tensor.shape();
        let data = tensor
            .data()
            .iter()
            .map(|&v| Complex32::new(v, 0.0))
            .collect();
        Self::from_vec(1, rows, cols, data)
    }

    /// Real part of the matrix stored at `index`.
    pub fn real_matrix(&self, index: usize) -> PureResult<Tensor> {
        let (batch, rows, cols) = self.dims();
        if index >= batch {
            return Err(TensorError::ShapeMismatch {
                left: (batch, rows),
                right: (index, rows),
            });
        }
        let data = self
            .data
            .index_axis(Axis(0), index)
            .iter()
            .map(|z| z.re)
            .collect();
        Tensor::from_vec(rows, cols, data)
    }

    /// `(batch, rows, cols)`.
    pub fn dims(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    pub fn batch(&self) -> usize {
        self.data.dim().0
    }

    pub fn rows(&self) -> usize {
        self.data.dim().1
    }

    pub fn cols(&self) -> usize {
        self.data.dim().2
    }

    /// Shape of a single matrix in the stack.
    pub fn matrix_shape(&self) -> (usize, usize) {
        (self.rows(), self.cols())
    }

    pub fn array(&self) -> &Array3<Complex32> {
        &self.data
    }

    pub fn array_mut(&mut self) -> &mut Array3<Complex32> {
        &mut self.data
    }

    /// View of the matrix stored at `index`.
    pub fn matrix(&self, index: usize) -> ArrayView2<'_, Complex32> {
        self.data.index_axis(Axis(0), index)
    }

    fn ensure_same_dims(&self, other: &ComplexStack) -> PureResult<()> {
        if self.dims() != other.dims() {
            return Err(TensorError::ShapeMismatch {
                left: self.matrix_shape(),
                right: other.matrix_shape(),
            });
        }
        Ok(())
    }

    /// Batched matrix product `self[b] @ other[b]`.
    pub fn matmul(&self, other: &ComplexStack) -> PureResult<ComplexStack> {
        let (batch, rows, inner) = self.dims();
        let (other_batch, other_inner, cols) = other.dims();
        if batch != other_batch || inner != other_inner {
            return Err(TensorError::ShapeMismatch {
                left: (rows, inner),
                right: (other_inner, cols),
            });
        }
        let mut out = Array3::zeros((batch, rows, cols));
        for ((mut dst, lhs), rhs) in out
            .outer_iter_mut()
            .zip(self.data.outer_iter())
            .zip(other.data.outer_iter())
        {
            dst.assign(&lhs.dot(&rhs));
        }
        Ok(Self { data: out })
    }

    /// Conjugate transpose of every matrix.
    pub fn conj_transpose(&self) -> ComplexStack {
        let data = self
            .data
            .view()
            .permuted_axes([0, 2, 1])
            .as_standard_layout()
            .mapv(|z| z.conj());
        Self { data }
    }

    /// Plain transpose of every matrix (no conjugation).
    pub fn transpose(&self) -> ComplexStack {
        let data = self
            .data
            .view()
            .permuted_axes([0, 2, 1])
            .as_standard_layout()
            .into_owned();
        Self { data }
    }

    pub fn scale(&self, factor: f32) -> ComplexStack {
        Self {
            data: self.data.mapv(|z| z * factor),
        }
    }

    pub fn add(&self, other: &ComplexStack) -> PureResult<ComplexStack> {
        self.ensure_same_dims(other)?;
        Ok(Self {
            data: &self.data + &other.data,
        })
    }

    pub fn sub(&self, other: &ComplexStack) -> PureResult<ComplexStack> {
        self.ensure_same_dims(other)?;
        Ok(Self {
            data: &self.data - &other.data,
        })
    }

    /// `self += scale * other`.
    pub fn add_scaled(&mut self, other: &ComplexStack, scale: f32) -> PureResult<()> {
        self.ensure_same_dims(other)?;
        self.data
            .zip_mut_with(&other.data, |a, &b| *a = *a + b * scale);
        Ok(())
    }

    /// Frobenius norm over the whole stack.
    pub fn frobenius_norm(&self) -> f32 {
        self.data.iter().map(|z| z.norm_sqr()).sum::<f32>().sqrt()
    }

    /// `Re Σ conj(self) ⊙ other`, the real inner product of the stacks.
    pub fn real_inner(&self, other: &ComplexStack) -> PureResult<f32> {
        self.ensure_same_dims(other)?;
        Ok(self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a.re * b.re + a.im * b.im)
            .sum())
    }

    /// Splits every matrix after `at` rows. The lower part is `None` when
    /// `at == rows`.
    pub fn split_rows(&self, at: usize) -> PureResult<(ComplexStack, Option<ComplexStack>)> {
        let rows = self.rows();
        if at == 0 || at > rows {
            return Err(TensorError::ShapeMismatch {
                left: self.matrix_shape(),
                right: (at, self.cols()),
            });
        }
        let top = self.data.slice(s![.., ..at, ..]).to_owned();
        let bottom = if at < rows {
            Some(Self {
                data: self.data.slice(s![.., at.., ..]).to_owned(),
            })
        } else {
            None
        };
        Ok((Self { data: top }, bottom))
    }

    /// Concatenates two stacks along the row axis.
    pub fn cat_rows(top: &ComplexStack, bottom: &ComplexStack) -> PureResult<ComplexStack> {
        if top.batch() != bottom.batch() || top.cols() != bottom.cols() {
            return Err(TensorError::ShapeMismatch {
                left: top.matrix_shape(),
                right: bottom.matrix_shape(),
            });
        }
        let data = ndarray::concatenate(Axis(1), &[top.data.view(), bottom.data.view()])
            .map_err(|_| TensorError::ShapeMismatch {
                left: top.matrix_shape(),
                right: bottom.matrix_shape(),
            })?;
        Ok(Self { data })
    }

    /// Inverts every matrix through a partially pivoted LU factorisation.
    pub fn inverse(&self) -> PureResult<ComplexStack> {
        let (batch, rows, cols) = self.dims();
        if rows != cols {
            return Err(TensorError::ShapeMismatch {
                left: (rows, cols),
                right: (cols, rows),
            });
        }
        let mut out = Array3::zeros((batch, rows, cols));
        for (index, (matrix, mut dst)) in self
            .data
            .outer_iter()
            .zip(out.outer_iter_mut())
            .enumerate()
        {
            let inverse = invert_matrix(matrix, index)?;
            for ((r, c), value) in dst.indexed_iter_mut() {
                *value = inverse[(r, c)];
            }
        }
        Ok(Self { data: out })
    }
}

fn invert_matrix(matrix: ArrayView2<'_, Complex32>, index: usize) -> PureResult<DMatrix<Complex32>> {
    let n = matrix.nrows();
    let lu = DMatrix::from_fn(n, n, |r, c| matrix[[r, c]]).lu();
    let pivot = lu
        .u()
        .diagonal()
        .iter()
        .map(|value| value.norm())
        .fold(f32::INFINITY, f32::min);
    if !(pivot > PIVOT_EPS) {
        return Err(TensorError::SingularMatrix {
            index,
            pivot: pivot.max(0.0),
        });
    }
    lu.try_inverse().ok_or(TensorError::SingularMatrix { index, pivot })
}
