// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Real 2-D FFT pair for square planes backed by `rustfft`.
//!
//! Spectra are stored in the half-spectrum layout produced by `rfft2`:
//! `n` rows by `n / 2 + 1` columns, flattened row-major so bin `(p, m)` lives at
//! `p * (n / 2 + 1) + m`. Besides the forward and inverse transforms, the
//! adjoint of each transform is provided so layers can push gradients back
//! through the frequency domain.

use crate::pure::{PureResult, TensorError};
use num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use std::fmt;
use std::sync::Arc;

/// Planned forward/inverse transforms for `n x n` real planes.
#[derive(Clone)]
pub struct RealFft2 {
    n: usize,
    half: usize,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
}

impl fmt::Debug for RealFft2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealFft2")
            .field("n", &self.n)
            .field("half", &self.half)
            .finish()
    }
}

impl RealFft2 {
    /// Plans transforms for planes of side `n`.
    pub fn new(n: usize) -> PureResult<Self> {
        if n == 0 {
            return Err(TensorError::InvalidDimensions { rows: n, cols: n });
        }
        let mut planner = FftPlanner::<f32>::new();
        Ok(Self {
            n,
            half: n / 2 + 1,
            forward: planner.plan_fft_forward(n),
            inverse: planner.plan_fft_inverse(n),
        })
    }

    /// Side length of the spatial plane.
    pub fn size(&self) -> usize {
        self.n
    }

    /// Number of retained columns, `n / 2 + 1`.
    pub fn half(&self) -> usize {
        self.half
    }

    /// Number of frequency bins in the half spectrum.
    pub fn bins(&self) -> usize {
        self.n * self.half
    }

    /// `rfft2` of a `side x side` plane zero-padded to `n x n`.
    pub fn forward(&self, plane: &[f32], side: usize) -> PureResult<Vec<Complex32>> {
        self.check_side(plane.len(), side)?;
        let n = self.n;
        let mut buffer = vec![Complex32::new(0.0, 0.0); n * n];
        for r in 0..side {
            for c in 0..side {
                buffer[r * n + c] = Complex32::new(plane[r * side + c], 0.0);
            }
        }
        self.fft2_inplace(&mut buffer, false);
        Ok(self.crop_half(&buffer))
    }

    /// `irfft2` of a half spectrum, normalised by `1 / n²`.
    ///
    /// Matches the c2r convention: the imaginary parts of the DC column and,
    /// for even `n`, the Nyquist column are ignored.
    pub fn inverse(&self, spectrum: &[Complex32]) -> PureResult<Vec<f32>> {
        self.check_spectrum(spectrum.len())?;
        let (n, half) = (self.n, self.half);
        let mut columns = vec![Complex32::new(0.0, 0.0); n * half];
        // gather each retained column contiguously and transform along rows
        for p in 0..n {
            for m in 0..half {
                columns[m * n + p] = spectrum[p * half + m];
            }
        }
        self.inverse.process(&mut columns);

        let mut full = vec![Complex32::new(0.0, 0.0); n * n];
        for j in 0..n {
            let row = &mut full[j * n..(j + 1) * n];
            for m in 0..half {
                let z = columns[m * n + j];
                if self.is_edge_column(m) {
                    row[m] = Complex32::new(z.re, 0.0);
                } else {
                    row[m] = z;
                    row[n - m] = z.conj();
                }
            }
        }
        self.inverse.process(&mut full);
        let norm = 1.0 / (n * n) as f32;
        Ok(full.iter().map(|z| z.re * norm).collect())
    }

    /// Adjoint of [`RealFft2::inverse`]: maps a spatial gradient to the
    /// gradient of the half spectrum that produced it.
    pub fn inverse_adjoint(&self, grad: &[f32]) -> PureResult<Vec<Complex32>> {
        let n = self.n;
        let mut spectrum = self.forward(grad, n)?;
        let norm = 1.0 / (n * n) as f32;
        for (idx, value) in spectrum.iter_mut().enumerate() {
            let m = idx % self.half;
            let weight = if self.is_edge_column(m) { 1.0 } else { 2.0 };
            *value = *value * (weight * norm);
        }
        Ok(spectrum)
    }

    /// Adjoint of [`RealFft2::forward`]: maps a half-spectrum gradient to the
    /// gradient of the `side x side` plane.
    pub fn forward_adjoint(&self, grad: &[Complex32], side: usize) -> PureResult<Vec<f32>> {
        self.check_spectrum(grad.len())?;
        if side == 0 || side > self.n {
            return Err(TensorError::InvalidDimensions {
                rows: side,
                cols: self.n,
            });
        }
        let (n, half) = (self.n, self.half);
        let mut buffer = vec![Complex32::new(0.0, 0.0); n * n];
        for p in 0..n {
            buffer[p * n..p * n + half].copy_from_slice(&grad[p * half..(p + 1) * half]);
        }
        self.fft2_inplace(&mut buffer, true);
        let mut plane = Vec::with_capacity(side * side);
        for r in 0..side {
            for c in 0..side {
                plane.push(buffer[r * n + c].re);
            }
        }
        Ok(plane)
    }

    fn is_edge_column(&self, m: usize) -> bool {
        m == 0 || (self.n % 2 == 0 && m == self.n / 2)
    }

    fn check_side(&self, len: usize, side: usize) -> PureResult<()> {
        if side == 0 || side > self.n {
            return Err(TensorError::InvalidDimensions {
                rows: side,
                cols: self.n,
            });
        }
        if len != side * side {
            return Err(TensorError::DataLength {
                expected: side * side,
                got: len,
            });
        }
        Ok(())
    }

    fn check_spectrum(&self, len: usize) -> PureResult<()> {
        if len != self.bins() {
            return Err(TensorError::DataLength {
                expected: self.bins(),
                got: len,
            });
        }
        Ok(())
    }

    fn crop_half(&self, buffer: &[Complex32]) -> Vec<Complex32> {
        let (n, half) = (self.n, self.half);
        let mut out = Vec::with_capacity(n * half);
        for p in 0..n {
            out.extend_from_slice(&buffer[p * n..p * n + half]);
        }
        out
    }

    /// Unnormalised 2-D transform of an `n x n` row-major buffer.
    fn fft2_inplace(&self, buffer: &mut [Complex32], inverse: bool) {
        let n = self.n;
        let plan = if inverse { &self.inverse } else { &self.forward };
        plan.process(buffer);
        transpose_square(buffer, n);
        plan.process(buffer);
        transpose_square(buffer, n);
    }
}

fn transpose_square(buffer: &mut [Complex32], n: usize) {
    for r in 0..n {
        for c in (r + 1)..n {
            buffer.swap(r * n + c, c * n + r);
        }
    }
}
