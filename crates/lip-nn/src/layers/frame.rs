// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Frame generator for the channel-changing endomorphism convolutions.
//!
//! A frame is an `(out, inner)` matrix (one per frequency bin in the spectral
//! variant) whose rows share the norm `√(inner/out)`, whose columns have unit
//! norm and whose larger Gram matrix is as close to diagonal as possible. It is
//! found by a short plain gradient descent and then frozen by the owning layer.

use super::fourier::SpectralPlan;
use super::fan_in_bound;
use lip_tensor::{Complex32, ComplexStack, PureResult, Tensor, TensorError};
use ndarray::Array3;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Inner optimisation schedule.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    pub steps: usize,
    pub learning_rate: f32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            steps: 100,
            learning_rate: 0.1,
        }
    }
}

/// Breakdown of the frame objective.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameLoss {
    pub total: f32,
    /// Mean squared deviation of row norms from `√(inner/out)`.
    pub row: f32,
    /// Mean squared deviation of column norms from one.
    pub col: f32,
    /// Mean squared magnitude of the strict upper Gram triangle.
    pub gram: f32,
}

/// Evaluates the frame objective on a `(bins, out, inner)` stack.
pub fn frame_loss(frame: &ComplexStack) -> PureResult<FrameLoss> {
    Ok(frame_loss_with_grad(frame)?.0)
}

/// Frame objective together with its gradient (`∂L/∂Re + i ∂L/∂Im`).
pub fn frame_loss_with_grad(frame: &ComplexStack) -> PureResult<(FrameLoss, ComplexStack)> {
    let h = frame.array();
    let (bins, out, inner) = h.dim();
    let mut grad = Array3::<Complex32>::zeros((bins, out, inner));
    let rows_dominate = out >= inner;
    let m = if rows_dominate { out } else { inner };
    let norm_weight = (m as f32 - 1.0) / 2.0;

    let target = (inner as f32 / out as f32).sqrt();
    let row_count = (bins * out) as f32;
    let mut row = 0.0f32;
    for f in 0..bins {
        for o in 0..out {
            let norm = (0..inner).map(|i| h[[f, o, i]].norm_sqr()).sum::<f32>().sqrt();
            row += (norm - target) * (norm - target);
            if norm > 0.0 {
                let coeff = norm_weight * 2.0 * (norm - target) / (row_count * norm);
                for i in 0..inner {
                    grad[[f, o, i]] += h[[f, o, i]] * coeff;
                }
            }
        }
    }
    row /= row_count;

    let col_count = (bins * inner) as f32;
    let mut col = 0.0f32;
    for f in 0..bins {
        for i in 0..inner {
            let norm = (0..out).map(|o| h[[f, o, i]].norm_sqr()).sum::<f32>().sqrt();
            col += (norm - 1.0) * (norm - 1.0);
            if norm > 0.0 {
                let coeff = norm_weight * 2.0 * (norm - 1.0) / (col_count * norm);
                for o in 0..out {
                    grad[[f, o, i]] += h[[f, o, i]] * coeff;
                }
            }
        }
    }
    col /= col_count;

    // a single row or column has no off-diagonal Gram entries
    let pairs = bins * m * (m - 1) / 2;
    let mut gram = 0.0f32;
    if pairs > 0 {
        let scale = 2.0 / pairs as f32;
        for f in 0..bins {
            for p in 0..m {
                for q in p + 1..m {
                    if rows_dominate {
                        let overlap: Complex32 =
                            (0..inner).map(|c| h[[f, p, c]].conj() * h[[f, q, c]]).sum();
                        gram += overlap.norm_sqr();
                        for c in 0..inner {
                            let (hp, hq) = (h[[f, p, c]], h[[f, q, c]]);
                            grad[[f, p, c]] += overlap.conj() * hq * scale;
                            grad[[f, q, c]] += overlap * hp * scale;
                        }
                    } else {
                        let overlap: Complex32 =
                            (0..out).map(|d| h[[f, d, p]].conj() * h[[f, d, q]]).sum();
                        gram += overlap.norm_sqr();
                        for d in 0..out {
                            let (hp, hq) = (h[[f, d, p]], h[[f, d, q]]);
                            grad[[f, d, p]] += overlap.conj() * hq * scale;
                            grad[[f, d, q]] += overlap * hp * scale;
                        }
                    }
                }
            }
        }
        gram /= pairs as f32;
    }

    let loss = FrameLoss {
        total: norm_weight * (row + col) + gram,
        row,
        col,
        gram,
    };
    if !loss.total.is_finite() {
        return Err(TensorError::NonFiniteValue {
            label: "frame_loss",
            value: loss.total,
        });
    }
    Ok((loss, ComplexStack::from_array(grad)?))
}

fn validate_channels(out: usize, inner: usize) -> PureResult<()> {
    if out == 0 || inner == 0 {
        return Err(TensorError::InvalidDimensions {
            rows: out,
            cols: inner,
        });
    }
    Ok(())
}

/// Frequency-domain frame: a learned `(out, inner, k, k)` kernel embedded
/// into the `n × n` half spectrum the same way the layer weights are.
pub fn spectral_frame(
    n: usize,
    kernel: usize,
    out: usize,
    inner: usize,
    config: &FrameConfig,
    rng: &mut StdRng,
) -> PureResult<ComplexStack> {
    validate_channels(out, inner)?;
    let plan = SpectralPlan::new(n, kernel)?;
    let bound = fan_in_bound(inner * kernel * kernel);
    let mut weight = Tensor::random_uniform_with(out, inner * kernel * kernel, -bound, bound, rng)?;
    for step in 0..config.steps {
        let frame = plan.embed_kernel(&weight, out, inner)?;
        let (loss, grad) = frame_loss_with_grad(&frame)?;
        if step == 0 {
            debug!(n, kernel, out, inner, loss = loss.total, "spectral frame search started");
        }
        let grad_weight = plan.embed_kernel_adjoint(&grad)?;
        weight.add_scaled(&grad_weight, -config.learning_rate)?;
    }
    let frame = plan.embed_kernel(&weight, out, inner)?;
    debug!(
        n,
        kernel,
        out,
        inner,
        loss = frame_loss(&frame)?.total,
        "spectral frame search finished"
    );
    Ok(frame)
}

/// Spatial frame: a learned `(out, inner)` matrix used as a 1×1 channel mix.
pub fn spatial_frame(
    out: usize,
    inner: usize,
    config: &FrameConfig,
    rng: &mut StdRng,
) -> PureResult<Tensor> {
    validate_channels(out, inner)?;
    let mut frame = Tensor::random_normal_with(out, inner, 0.0, 1.0, rng)?;
    for step in 0..config.steps {
        let (loss, grad) = frame_loss_with_grad(&ComplexStack::from_real(&frame)?)?;
        if step == 0 {
            debug!(out, inner, loss = loss.total, "spatial frame search started");
        }
        frame.add_scaled(&grad.real_matrix(0)?, -config.learning_rate)?;
    }
    debug!(
        out,
        inner,
        loss = frame_loss(&ComplexStack::from_real(&frame)?)?.total,
        "spatial frame search finished"
    );
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn orthonormal_square_frame_has_zero_loss() {
        let eye = Tensor::from_vec(2, 2, vec![1.0, 0.0, 0.0, 1.0]).unwrap();
        let loss = frame_loss(&ComplexStack::from_real(&eye).unwrap()).unwrap();
        assert!(loss.total.abs() < 1e-7);
    }

    #[test]
    fn loss_terms_follow_definition() {
        // rows (1, 1) and (1, 0): row norms √2 and 1, column norms √2 and 1
        let h = Tensor::from_vec(2, 2, vec![1.0, 1.0, 1.0, 0.0]).unwrap();
        let loss = frame_loss(&ComplexStack::from_real(&h).unwrap()).unwrap();
        let dev = (2.0f32.sqrt() - 1.0).powi(2) / 2.0;
        assert!((loss.row - dev).abs() < 1e-6);
        assert!((loss.col - dev).abs() < 1e-6);
        assert!((loss.gram - 1.0).abs() < 1e-6);
        assert!((loss.total - (0.5 * 2.0 * dev + 1.0)).abs() < 1e-6);
    }

    #[test]
    fn single_channel_frame_has_no_gram_term() {
        let h = Tensor::from_vec(1, 1, vec![2.0]).unwrap();
        let loss = frame_loss(&ComplexStack::from_real(&h).unwrap()).unwrap();
        assert_eq!(loss.gram, 0.0);
        assert_eq!(loss.total, 0.0);
    }

    #[test]
    fn gradient_matches_finite_differences() {
        for (out, inner) in [(3usize, 2usize), (2, 3)] {
            let mut rng = StdRng::seed_from_u64(21);
            let plan = SpectralPlan::new(3, 2).unwrap();
            let weight = Tensor::random_uniform_with(out, inner * 4, -0.5, 0.5, &mut rng).unwrap();
            let frame = plan.embed_kernel(&weight, out, inner).unwrap();
            let (_, grad) = frame_loss_with_grad(&frame).unwrap();
            let eps = 1e-2f32;
            for (f, o, i) in [(0, 0, 0), (2, out - 1, inner - 1), (4, 1, 1)] {
                for direction in [Complex32::new(1.0, 0.0), Complex32::new(0.0, 1.0)] {
                    let mut plus = frame.clone();
                    plus.array_mut()[[f, o, i]] += direction * eps;
                    let mut minus = frame.clone();
                    minus.array_mut()[[f, o, i]] -= direction * eps;
                    let numeric = (frame_loss(&plus).unwrap().total
                        - frame_loss(&minus).unwrap().total)
                        / (2.0 * eps);
                    let g = grad.array()[[f, o, i]];
                    let analytic = g.re * direction.re + g.im * direction.im;
                    assert!(
                        (numeric - analytic).abs() < 1e-2 * (1.0 + analytic.abs()),
                        "({out},{inner}) at ({f},{o},{i}): {numeric} vs {analytic}"
                    );
                }
            }
        }
    }

    #[test]
    fn spectral_search_reduces_loss() {
        let config = FrameConfig::default();
        let (n, kernel, out, inner) = (6, 3, 4, 2);
        let mut rng = StdRng::seed_from_u64(5);
        let plan = SpectralPlan::new(n, kernel).unwrap();
        let bound = fan_in_bound(inner * kernel * kernel);
        let start = Tensor::random_uniform_with(out, inner * 9, -bound, bound, &mut rng).unwrap();
        let initial = frame_loss(&plan.embed_kernel(&start, out, inner).unwrap())
            .unwrap()
            .total;
        let mut rng = StdRng::seed_from_u64(5);
        let frame = spectral_frame(n, kernel, out, inner, &config, &mut rng).unwrap();
        assert_eq!(frame.dims(), (n * (n / 2 + 1), out, inner));
        let fin = frame_loss(&frame).unwrap().total;
        assert!(fin < initial, "{fin} !< {initial}");
    }

    #[test]
    fn spatial_search_reduces_loss() {
        let config = FrameConfig::default();
        let mut rng = StdRng::seed_from_u64(9);
        let start = Tensor::random_normal_with(3, 5, 0.0, 1.0, &mut rng).unwrap();
        let initial = frame_loss(&ComplexStack::from_real(&start).unwrap())
            .unwrap()
            .total;
        let mut rng = StdRng::seed_from_u64(9);
        let frame = spatial_frame(3, 5, &config, &mut rng).unwrap();
        assert_eq!(frame.shape(), (3, 5));
        let fin = frame_loss(&ComplexStack::from_real(&frame).unwrap())
            .unwrap()
            .total;
        assert!(fin < initial, "{fin} !< {initial}");
    }

    #[test]
    fn config_deserialises_with_defaults() {
        let config: FrameConfig = serde_json::from_str(r#"{"steps": 10}"#).unwrap();
        assert_eq!(config.steps, 10);
        assert!((config.learning_rate - 0.1).abs() < 1e-9);
    }
}
