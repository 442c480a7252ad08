// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter};
use lip_tensor::{PureResult, Tensor, TensorError};

use super::spatial_side;

/// Pairwise sorting activation over channel halves: the first `channels / 2`
/// planes receive `max(a, b)` and the rest `min(a, b)`, where `a` and `b` are
/// the two channel halves of the input. Dense features are channels with a
/// `1 × 1` plane.
#[derive(Debug, Clone, Copy)]
pub struct GroupSort {
    channels: usize,
}

impl GroupSort {
    pub fn new(channels: usize) -> Self {
        Self { channels }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Column offset of the second channel half.
    fn half(&self, input: &Tensor) -> PureResult<usize> {
        let (rows, cols) = input.shape();
        let side = spatial_side(cols, self.channels)?;
        if self.channels % 2 != 0 {
            return Err(TensorError::ShapeMismatch {
                left: (rows, self.channels),
                right: (rows, self.channels + 1),
            });
        }
        Ok(self.channels / 2 * side * side)
    }
}

impl Module for GroupSort {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let half = self.half(input)?;
        let (rows, cols) = input.shape();
        let mut out = Tensor::zeros(rows, cols)?;
        {
            let src = input.data();
            let dst = out.data_mut();
            for r in 0..rows {
                let base = r * cols;
                for j in 0..half {
                    let (a, b) = (src[base + j], src[base + half + j]);
                    dst[base + j] = a.max(b);
                    dst[base + half + j] = a.min(b);
                }
            }
        }
        Ok(out)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let half = self.half(input)?;
        if input.shape() != grad_output.shape() {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: grad_output.shape(),
            });
        }
        let (rows, cols) = input.shape();
        let mut grad = Tensor::zeros(rows, cols)?;
        {
            let src = input.data();
            let go = grad_output.data();
            let dst = grad.data_mut();
            for r in 0..rows {
                let base = r * cols;
                for j in 0..half {
                    let (a, b) = (src[base + j], src[base + half + j]);
                    let (g_max, g_min) = (go[base + j], go[base + half + j]);
                    let (ga, gb) = if a > b {
                        (g_max, g_min)
                    } else if a < b {
                        (g_min, g_max)
                    } else {
                        // ties split evenly
                        let shared = 0.5 * (g_max + g_min);
                        (shared, shared)
                    };
                    dst[base + j] = ga;
                    dst[base + half + j] = gb;
                }
            }
        }
        Ok(grad)
    }

    fn visit_parameters(
        &self,
        _visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        _visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }
}
