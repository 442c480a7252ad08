// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Frequency-domain plumbing shared by the spectral layers and the frame
//! generator.
//!
//! Activations of shape `(batch, channels * n * n)` become stacks indexed
//! `(bin, channel, batch)`, and `(out, in * k * k)` kernels become stacks
//! indexed `(bin, out, in)`. Each embedding comes with its adjoint so the
//! reverse pass can walk the same path backwards.

use lip_tensor::{Complex32, ComplexStack, PureResult, RealFft2, Tensor, TensorError};
use ndarray::{s, Array3};
use std::f64::consts::PI;

/// Phase correction `exp(2πi·s·(p+q)/n)` over the half spectrum, with
/// `s = -(kernel - 1) / 2`, so a kernel anchored at the origin behaves like a
/// centred ("same") convolution.
pub fn shift_phases(n: usize, kernel: usize) -> Vec<Complex32> {
    let half = n / 2 + 1;
    let shift = -((kernel.max(1) as isize - 1) / 2);
    let mut phases = Vec::with_capacity(n * half);
    for p in 0..n {
        for q in 0..half {
            let turns = (shift * (p + q) as isize).rem_euclid(n as isize) as f64;
            let angle = 2.0 * PI * turns / n as f64;
            phases.push(Complex32::new(angle.cos() as f32, angle.sin() as f32));
        }
    }
    phases
}

/// Transforms planned for one spatial size and kernel size.
#[derive(Clone, Debug)]
pub struct SpectralPlan {
    fft: RealFft2,
    shift: Vec<Complex32>,
    kernel: usize,
}

impl SpectralPlan {
    pub fn new(n: usize, kernel: usize) -> PureResult<Self> {
        if kernel == 0 || kernel > n {
            return Err(TensorError::InvalidDimensions {
                rows: kernel,
                cols: n,
            });
        }
        Ok(Self {
            fft: RealFft2::new(n)?,
            shift: shift_phases(n, kernel),
            kernel,
        })
    }

    pub fn size(&self) -> usize {
        self.fft.size()
    }

    pub fn bins(&self) -> usize {
        self.fft.bins()
    }

    pub fn kernel(&self) -> usize {
        self.kernel
    }

    pub fn shift(&self) -> &[Complex32] {
        &self.shift
    }

    /// `shift ⊙ conj(rfft2(kernel))` for every `(out, in)` kernel pair.
    pub fn embed_kernel(&self, weight: &Tensor, out: usize, inner: usize) -> PureResult<ComplexStack> {
        let span = self.kernel * self.kernel;
        if weight.shape() != (out, inner * span) {
            return Err(TensorError::ShapeMismatch {
                left: weight.shape(),
                right: (out, inner * span),
            });
        }
        let mut data = Array3::zeros((self.bins(), out, inner));
        for o in 0..out {
            let row = weight.row(o)?;
            for i in 0..inner {
                let spectrum = self
                    .fft
                    .forward(&row[i * span..(i + 1) * span], self.kernel)?;
                for (f, (z, phase)) in spectrum.iter().zip(self.shift.iter()).enumerate() {
                    data[[f, o, i]] = phase * z.conj();
                }
            }
        }
        ComplexStack::from_array(data)
    }

    /// Adjoint of [`SpectralPlan::embed_kernel`], returning `(out, in * k * k)`.
    pub fn embed_kernel_adjoint(&self, grad: &ComplexStack) -> PureResult<Tensor> {
        let (bins, out, inner) = grad.dims();
        self.check_bins(bins)?;
        let span = self.kernel * self.kernel;
        let mut weight = Tensor::zeros(out, inner * span)?;
        {
            let data = weight.data_mut();
            for o in 0..out {
                for i in 0..inner {
                    let through_phase: Vec<Complex32> = grad
                        .array()
                        .slice(s![.., o, i])
                        .iter()
                        .zip(self.shift.iter())
                        .map(|(g, phase)| g.conj() * phase)
                        .collect();
                    let plane = self.fft.forward_adjoint(&through_phase, self.kernel)?;
                    let offset = o * inner * span + i * span;
                    data[offset..offset + span].copy_from_slice(&plane);
                }
            }
        }
        Ok(weight)
    }

    /// `rfft2` of every channel plane, as a `(bins, channels, batch)` stack.
    pub fn embed_activations(&self, input: &Tensor, channels: usize) -> PureResult<ComplexStack> {
        let n = self.size();
        let plane = n * n;
        let (batch, cols) = input.shape();
        if cols != channels * plane {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: (batch, channels * plane),
            });
        }
        let mut data = Array3::zeros((self.bins(), channels, batch));
        for b in 0..batch {
            let row = input.row(b)?;
            for c in 0..channels {
                let spectrum = self.fft.forward(&row[c * plane..(c + 1) * plane], n)?;
                for (dst, z) in data.slice_mut(s![.., c, b]).iter_mut().zip(spectrum) {
                    *dst = z;
                }
            }
        }
        ComplexStack::from_array(data)
    }

    /// Adjoint of [`SpectralPlan::embed_activations`].
    pub fn embed_activations_adjoint(&self, grad: &ComplexStack) -> PureResult<Tensor> {
        let n = self.size();
        let (bins, channels, batch) = grad.dims();
        self.check_bins(bins)?;
        self.collect_planes(channels, batch, |c, b| {
            let column = grad.array().slice(s![.., c, b]).to_vec();
            self.fft.forward_adjoint(&column, n)
        })
    }

    /// `irfft2` of a `(bins, channels, batch)` stack back to activations.
    pub fn synthesize(&self, spectrum: &ComplexStack) -> PureResult<Tensor> {
        let (bins, channels, batch) = spectrum.dims();
        self.check_bins(bins)?;
        self.collect_planes(channels, batch, |c, b| {
            let column = spectrum.array().slice(s![.., c, b]).to_vec();
            self.fft.inverse(&column)
        })
    }

    /// Adjoint of [`SpectralPlan::synthesize`].
    pub fn synthesize_adjoint(&self, grad: &Tensor, channels: usize) -> PureResult<ComplexStack> {
        let n = self.size();
        let plane = n * n;
        let (batch, cols) = grad.shape();
        if cols != channels * plane {
            return Err(TensorError::ShapeMismatch {
                left: grad.shape(),
                right: (batch, channels * plane),
            });
        }
        let mut data = Array3::zeros((self.bins(), channels, batch));
        for b in 0..batch {
            let row = grad.row(b)?;
            for c in 0..channels {
                let spectrum = self.fft.inverse_adjoint(&row[c * plane..(c + 1) * plane])?;
                for (dst, z) in data.slice_mut(s![.., c, b]).iter_mut().zip(spectrum) {
                    *dst = z;
                }
            }
        }
        ComplexStack::from_array(data)
    }

    fn collect_planes<F>(&self, channels: usize, batch: usize, mut plane_of: F) -> PureResult<Tensor>
    where
        F: FnMut(usize, usize) -> PureResult<Vec<f32>>,
    {
        let n = self.size();
        let plane = n * n;
        let mut out = Tensor::zeros(batch, channels * plane)?;
        {
            let data = out.data_mut();
            for b in 0..batch {
                for c in 0..channels {
                    let values = plane_of(c, b)?;
                    let offset = b * channels * plane + c * plane;
                    data[offset..offset + plane].copy_from_slice(&values);
                }
            }
        }
        Ok(out)
    }

    fn check_bins(&self, bins: usize) -> PureResult<()> {
        if bins != self.bins() {
            return Err(TensorError::DataLength {
                expected: self.bins(),
                got: bins,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_vanish_for_small_kernels() {
        let phases = shift_phases(4, 2);
        assert_eq!(phases.len(), 4 * 3);
        assert!(phases.iter().all(|z| (z.re - 1.0).abs() < 1e-6 && z.im.abs() < 1e-6));
    }

    #[test]
    fn phases_follow_centre_offset() {
        let n = 8;
        let phases = shift_phases(n, 3);
        // s = -1, so bin (p, q) rotates by -2π(p + q)/n
        let angle = -2.0 * std::f32::consts::PI * 3.0 / n as f32;
        let z = phases[1 * (n / 2 + 1) + 2];
        assert!((z.re - angle.cos()).abs() < 1e-5);
        assert!((z.im - angle.sin()).abs() < 1e-5);
    }

    #[test]
    fn centred_delta_kernel_embeds_to_identity() {
        let plan = SpectralPlan::new(6, 3).unwrap();
        let mut delta = vec![0.0; 9];
        delta[4] = 1.0;
        let weight = Tensor::from_vec(1, 9, delta).unwrap();
        let stack = plan.embed_kernel(&weight, 1, 1).unwrap();
        for z in stack.array().iter() {
            assert!((z.re - 1.0).abs() < 1e-5 && z.im.abs() < 1e-5, "{z}");
        }
    }

    #[test]
    fn plan_rejects_oversized_kernels() {
        assert!(matches!(
            SpectralPlan::new(2, 3),
            Err(TensorError::InvalidDimensions { .. })
        ));
    }

    #[test]
    fn synthesize_inverts_embedding() {
        let plan = SpectralPlan::new(4, 3).unwrap();
        let input = Tensor::from_fn(2, 2 * 16, |r, c| ((r * 7 + c * 3) % 5) as f32 - 2.0).unwrap();
        let spectrum = plan.embed_activations(&input, 2).unwrap();
        assert_eq!(spectrum.dims(), (12, 2, 2));
        let restored = plan.synthesize(&spectrum).unwrap();
        assert!(restored.max_abs_diff(&input).unwrap() < 1e-4);
    }

    #[test]
    fn kernel_adjoint_matches_inner_product() {
        let plan = SpectralPlan::new(5, 3).unwrap();
        let weight = Tensor::from_fn(2, 3 * 9, |r, c| ((r * 11 + c * 5) % 7) as f32 * 0.1 - 0.3)
            .unwrap();
        let grad_stack = plan
            .embed_kernel(
                &Tensor::from_fn(2, 3 * 9, |r, c| ((r + 2 * c) % 3) as f32 - 1.0).unwrap(),
                2,
                3,
            )
            .unwrap();
        let forward = plan.embed_kernel(&weight, 2, 3).unwrap();
        let lhs = forward.real_inner(&grad_stack).unwrap();
        let back = plan.embed_kernel_adjoint(&grad_stack).unwrap();
        let rhs: f32 = back
            .data()
            .iter()
            .zip(weight.data().iter())
            .map(|(a, b)| a * b)
            .sum();
        assert!((lhs - rhs).abs() < 1e-2 * (1.0 + lhs.abs()), "{lhs} vs {rhs}");
    }
}
