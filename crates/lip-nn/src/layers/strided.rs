// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Convolution specification and the stride-2 adapter.
//!
//! Spectral and orthogonalised convolutions only exist at stride 1. The
//! [`StridedConv`] adapter emulates stride 2 by folding every 2×2 block into
//! the channel axis (space-to-depth) and running a stride-1 convolution with
//! four times the input channels and half the kernel.

use crate::module::{Module, Parameter};
use lip_tensor::{PureResult, Tensor, TensorError};
use serde::{Deserialize, Serialize};

use super::spatial_side;

/// Convolution constructor arguments shared by every stridable layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvSpec {
    pub name: String,
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: usize,
    pub bias: bool,
    pub seed: Option<u64>,
}

impl ConvSpec {
    pub fn new(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
    ) -> Self {
        Self {
            name: name.into(),
            in_channels,
            out_channels,
            kernel_size,
            stride: 1,
            padding: 0,
            bias: true,
            seed: None,
        }
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Rejects zero channel counts, kernels and strides.
    pub fn validate(&self) -> PureResult<()> {
        if self.in_channels == 0 || self.out_channels == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: self.out_channels,
                cols: self.in_channels,
            });
        }
        if self.kernel_size == 0 || self.stride == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: self.kernel_size,
                cols: self.stride,
            });
        }
        Ok(())
    }

    /// Weight and bias parameter names derived from the layer name.
    pub(crate) fn param_name(&self, suffix: &str) -> String {
        format!("{}::{suffix}", self.name)
    }

    /// The spec the inner stride-1 module is built from, and whether the
    /// space-to-depth rearrangement is needed.
    pub fn striding_variant(&self) -> (ConvSpec, bool) {
        let mut inner = self.clone();
        if self.stride == 2 {
            let kernel = (self.kernel_size / 2).max(1);
            inner.stride = 1;
            inner.in_channels = self.in_channels * 4;
            inner.kernel_size = kernel;
            inner.padding = kernel / 2;
            (inner, true)
        } else {
            inner.padding = self.kernel_size / 2;
            (inner, false)
        }
    }
}

/// Convolutions that can be built from a [`ConvSpec`] and wrapped by
/// [`StridedConv`].
pub trait StridableConv: Module + Sized {
    fn from_spec(spec: &ConvSpec) -> PureResult<Self>;
}

/// `out[b, c*4 + k1*2 + k2, i, j] = in[b, c, 2i + k1, 2j + k2]`.
pub fn space_to_depth(input: &Tensor, channels: usize) -> PureResult<Tensor> {
    let (batch, cols) = input.shape();
    let n = spatial_side(cols, channels)?;
    if n % 2 != 0 {
        return Err(TensorError::ShapeMismatch {
            left: (n, n),
            right: (n + 1, n + 1),
        });
    }
    let h = n / 2;
    let mut out = Tensor::zeros(batch, cols)?;
    {
        let src = input.data();
        let dst = out.data_mut();
        for b in 0..batch {
            let base = b * cols;
            for c in 0..channels {
                for k1 in 0..2 {
                    for k2 in 0..2 {
                        let oc = c * 4 + k1 * 2 + k2;
                        for i in 0..h {
                            for j in 0..h {
                                dst[base + oc * h * h + i * h + j] =
                                    src[base + c * n * n + (2 * i + k1) * n + 2 * j + k2];
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(out)
}

/// Inverse of [`space_to_depth`]; `channels` is the channel count before folding.
pub fn depth_to_space(input: &Tensor, channels: usize) -> PureResult<Tensor> {
    let (batch, cols) = input.shape();
    let h = spatial_side(cols, channels * 4)?;
    let n = 2 * h;
    let mut out = Tensor::zeros(batch, cols)?;
    {
        let src = input.data();
        let dst = out.data_mut();
        for b in 0..batch {
            let base = b * cols;
            for c in 0..channels {
                for k1 in 0..2 {
                    for k2 in 0..2 {
                        let oc = c * 4 + k1 * 2 + k2;
                        for i in 0..h {
                            for j in 0..h {
                                dst[base + c * n * n + (2 * i + k1) * n + 2 * j + k2] =
                                    src[base + oc * h * h + i * h + j];
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(out)
}

/// Wraps a stride-1 convolution so that it honours the requested stride.
#[derive(Debug)]
pub struct StridedConv<C> {
    inner: C,
    spec: ConvSpec,
    inner_spec: ConvSpec,
    striding: bool,
}

impl<C: StridableConv> StridedConv<C> {
    pub fn new(spec: ConvSpec) -> PureResult<Self> {
        spec.validate()?;
        let (inner_spec, striding) = spec.striding_variant();
        let inner = C::from_spec(&inner_spec)?;
        Ok(Self {
            inner,
            spec,
            inner_spec,
            striding,
        })
    }
}

impl<C> StridedConv<C> {
    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// The spec the layer was requested with.
    pub fn spec(&self) -> &ConvSpec {
        &self.spec
    }

    pub fn inner_spec(&self) -> &ConvSpec {
        &self.inner_spec
    }

    pub fn is_striding(&self) -> bool {
        self.striding
    }
}

impl<C: StridableConv> Module for StridedConv<C> {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        if self.striding {
            let folded = space_to_depth(input, self.spec.in_channels)?;
            self.inner.forward(&folded)
        } else {
            self.inner.forward(input)
        }
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        if self.striding {
            let folded = space_to_depth(input, self.spec.in_channels)?;
            let grad = self.inner.backward(&folded, grad_output)?;
            depth_to_space(&grad, self.spec.in_channels)
        } else {
            self.inner.backward(input, grad_output)
        }
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.inner.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.inner.visit_parameters_mut(visitor)
    }

    fn apply_step(&mut self, lr: f32) -> PureResult<()> {
        self.inner.apply_step(lr)
    }

    fn load_state_dict(
        &mut self,
        state: &std::collections::HashMap<String, Tensor>,
    ) -> PureResult<()> {
        self.inner.load_state_dict(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride_two_folds_channels_and_halves_kernel() {
        let spec = ConvSpec::new("s", 4, 8, 3).with_stride(2).with_padding(1);
        let (inner, striding) = spec.striding_variant();
        assert!(striding);
        assert_eq!(inner.in_channels, 16);
        assert_eq!(inner.kernel_size, 1);
        assert_eq!(inner.padding, 0);
        assert_eq!(inner.stride, 1);
        assert_eq!(inner.out_channels, 8);
    }

    #[test]
    fn stride_one_only_pads() {
        let spec = ConvSpec::new("s", 3, 5, 5).with_padding(7);
        let (inner, striding) = spec.striding_variant();
        assert!(!striding);
        assert_eq!(inner.padding, 2);
        assert_eq!(inner.in_channels, 3);
        assert_eq!(inner.kernel_size, 5);
    }

    #[test]
    fn space_to_depth_places_pixels() {
        // one channel, 4x4 plane holding its own flat index
        let input = Tensor::from_fn(1, 16, |_, c| c as f32).unwrap();
        let folded = space_to_depth(&input, 1).unwrap();
        let data = folded.data();
        // channel k1*2+k2 holds in[2i+k1, 2j+k2]
        assert_eq!(&data[0..4], &[0.0, 2.0, 8.0, 10.0]);
        assert_eq!(&data[4..8], &[1.0, 3.0, 9.0, 11.0]);
        assert_eq!(&data[8..12], &[4.0, 6.0, 12.0, 14.0]);
        assert_eq!(&data[12..16], &[5.0, 7.0, 13.0, 15.0]);
        let restored = depth_to_space(&folded, 1).unwrap();
        assert_eq!(restored, input);
    }

    #[test]
    fn space_to_depth_rejects_odd_sides() {
        let input = Tensor::zeros(1, 2 * 9).unwrap();
        assert!(matches!(
            space_to_depth(&input, 2),
            Err(TensorError::ShapeMismatch { .. })
        ));
    }
}
