// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter};
use lip_config::determinism::rng_from_optional;
use lip_tensor::{PureResult, Tensor, TensorError};

use super::strided::{ConvSpec, StridableConv};
use super::{fan_in_bound, spatial_side};

/// Square convolution geometry on `(batch, channels * n * n)` activations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConvGeometry {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
}

impl ConvGeometry {
    pub fn from_spec(spec: &ConvSpec) -> Self {
        Self {
            in_channels: spec.in_channels,
            out_channels: spec.out_channels,
            kernel: spec.kernel_size,
            stride: spec.stride,
            padding: spec.padding,
        }
    }

    /// Number of weight columns, `in * k * k`.
    pub fn span(&self) -> usize {
        self.in_channels * self.kernel * self.kernel
    }

    pub fn output_side(&self, n: usize) -> PureResult<usize> {
        let padded = n + 2 * self.padding;
        if padded < self.kernel || self.stride == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: padded,
                cols: self.kernel,
            });
        }
        Ok((padded - self.kernel) / self.stride + 1)
    }

    fn source_index(&self, out_idx: usize, k: usize, n: usize) -> Option<usize> {
        let pos = (out_idx * self.stride + k) as isize - self.padding as isize;
        if pos < 0 || pos >= n as isize {
            None
        } else {
            Some(pos as usize)
        }
    }

    fn im2col(&self, input: &Tensor, n: usize, out_side: usize) -> PureResult<Tensor> {
        let (batch, cols) = input.shape();
        let span = self.span();
        let spatial = out_side * out_side;
        let mut columns = Tensor::zeros(batch * spatial, span)?;
        {
            let input_data = input.data();
            let column_data = columns.data_mut();
            for b in 0..batch {
                let row = &input_data[b * cols..(b + 1) * cols];
                for oh in 0..out_side {
                    for ow in 0..out_side {
                        let offset = (b * spatial + oh * out_side + ow) * span;
                        let mut col_idx = 0;
                        for ic in 0..self.in_channels {
                            let channel_offset = ic * n * n;
                            for kh in 0..self.kernel {
                                for kw in 0..self.kernel {
                                    column_data[offset + col_idx] = match (
                                        self.source_index(oh, kh, n),
                                        self.source_index(ow, kw, n),
                                    ) {
                                        (Some(ih), Some(iw)) => row[channel_offset + ih * n + iw],
                                        _ => 0.0,
                                    };
                                    col_idx += 1;
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(columns)
    }

    fn col2im(&self, columns: &Tensor, batch: usize, n: usize, out_side: usize) -> PureResult<Tensor> {
        let span = self.span();
        let spatial = out_side * out_side;
        if columns.shape() != (batch * spatial, span) {
            return Err(TensorError::ShapeMismatch {
                left: columns.shape(),
                right: (batch * spatial, span),
            });
        }
        let cols = self.in_channels * n * n;
        let mut output = Tensor::zeros(batch, cols)?;
        {
            let column_data = columns.data();
            let output_data = output.data_mut();
            for b in 0..batch {
                let grad_in_row = &mut output_data[b * cols..(b + 1) * cols];
                for oh in 0..out_side {
                    for ow in 0..out_side {
                        let row_index = b * spatial + oh * out_side + ow;
                        let column_row = &column_data[row_index * span..(row_index + 1) * span];
                        let mut col_idx = 0;
                        for ic in 0..self.in_channels {
                            let channel_offset = ic * n * n;
                            for kh in 0..self.kernel {
                                for kw in 0..self.kernel {
                                    if let (Some(ih), Some(iw)) =
                                        (self.source_index(oh, kh, n), self.source_index(ow, kw, n))
                                    {
                                        grad_in_row[channel_offset + ih * n + iw] +=
                                            column_row[col_idx];
                                    }
                                    col_idx += 1;
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(output)
    }

    /// `(batch, out * spatial)` to `(batch * spatial, out)`.
    fn to_matrix(&self, tensor: &Tensor, spatial: usize) -> PureResult<Tensor> {
        let (batch, cols) = tensor.shape();
        let out = self.out_channels;
        let mut matrix = Tensor::zeros(batch * spatial, out)?;
        {
            let src = tensor.data();
            let dst = matrix.data_mut();
            for b in 0..batch {
                for oc in 0..out {
                    for s in 0..spatial {
                        dst[(b * spatial + s) * out + oc] = src[b * cols + oc * spatial + s];
                    }
                }
            }
        }
        Ok(matrix)
    }

    /// Inverse of [`ConvGeometry::to_matrix`].
    fn from_matrix(&self, matrix: &Tensor, batch: usize, spatial: usize) -> PureResult<Tensor> {
        let out = self.out_channels;
        let cols = out * spatial;
        let mut tensor = Tensor::zeros(batch, cols)?;
        {
            let src = matrix.data();
            let dst = tensor.data_mut();
            for b in 0..batch {
                for oc in 0..out {
                    for s in 0..spatial {
                        dst[b * cols + oc * spatial + s] = src[(b * spatial + s) * out + oc];
                    }
                }
            }
        }
        Ok(tensor)
    }

    fn check_weight(&self, weight: &Tensor) -> PureResult<()> {
        if weight.shape() != (self.out_channels, self.span()) {
            return Err(TensorError::ShapeMismatch {
                left: weight.shape(),
                right: (self.out_channels, self.span()),
            });
        }
        Ok(())
    }
}

/// Convolves `input` with an `(out, in * k * k)` weight.
pub fn conv2d_forward(
    geometry: &ConvGeometry,
    input: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
) -> PureResult<Tensor> {
    geometry.check_weight(weight)?;
    let (batch, cols) = input.shape();
    let n = spatial_side(cols, geometry.in_channels)?;
    let out_side = geometry.output_side(n)?;
    let patches = geometry.im2col(input, n, out_side)?;
    let mut output = patches.matmul(&weight.transpose())?;
    if let Some(bias) = bias {
        output.add_row_inplace(bias.data())?;
    }
    geometry.from_matrix(&output, batch, out_side * out_side)
}

/// Gradients of a convolution with respect to its input, weight and bias.
#[derive(Debug, Clone)]
pub struct ConvGradients {
    pub input: Tensor,
    pub weight: Tensor,
    pub bias: Tensor,
}

pub fn conv2d_backward(
    geometry: &ConvGeometry,
    input: &Tensor,
    weight: &Tensor,
    grad_output: &Tensor,
) -> PureResult<ConvGradients> {
    geometry.check_weight(weight)?;
    let (batch, cols) = input.shape();
    let n = spatial_side(cols, geometry.in_channels)?;
    let out_side = geometry.output_side(n)?;
    let spatial = out_side * out_side;
    if grad_output.shape() != (batch, geometry.out_channels * spatial) {
        return Err(TensorError::ShapeMismatch {
            left: grad_output.shape(),
            right: (batch, geometry.out_channels * spatial),
        });
    }
    let patches = geometry.im2col(input, n, out_side)?;
    let grad_matrix = geometry.to_matrix(grad_output, spatial)?;
    let grad_weight = grad_matrix.transpose().matmul(&patches)?;
    let grad_bias = Tensor::from_vec(1, geometry.out_channels, grad_matrix.sum_axis0())?;
    let grad_patches = grad_matrix.matmul(weight)?;
    let grad_input = geometry.col2im(&grad_patches, batch, n, out_side)?;
    Ok(ConvGradients {
        input: grad_input,
        weight: grad_weight,
        bias: grad_bias,
    })
}

/// Two-dimensional convolution over square `(batch, channels * n * n)` tensors.
#[derive(Debug)]
pub struct Conv2d {
    weight: Parameter,
    bias: Option<Parameter>,
    geometry: ConvGeometry,
}

impl Conv2d {
    pub fn new(spec: &ConvSpec) -> PureResult<Self> {
        spec.validate()?;
        let geometry = ConvGeometry::from_spec(spec);
        let bound = fan_in_bound(geometry.span());
        let mut rng = rng_from_optional(spec.seed, "lip-nn/conv2d/init");
        let weight = Tensor::random_uniform_with(
            geometry.out_channels,
            geometry.span(),
            -bound,
            bound,
            &mut rng,
        )?;
        let bias = if spec.bias {
            let values =
                Tensor::random_uniform_with(1, geometry.out_channels, -bound, bound, &mut rng)?;
            Some(Parameter::new(spec.param_name("bias"), values))
        } else {
            None
        };
        Ok(Self {
            weight: Parameter::new(spec.param_name("weight"), weight),
            bias,
            geometry,
        })
    }

    pub fn geometry(&self) -> &ConvGeometry {
        &self.geometry
    }

    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Parameter> {
        self.bias.as_ref()
    }
}

impl StridableConv for Conv2d {
    fn from_spec(spec: &ConvSpec) -> PureResult<Self> {
        Conv2d::new(spec)
    }
}

impl Module for Conv2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        conv2d_forward(
            &self.geometry,
            input,
            self.weight.value(),
            self.bias.as_ref().map(Parameter::value),
        )
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let grads = conv2d_backward(&self.geometry, input, self.weight.value(), grad_output)?;
        self.weight.accumulate_euclidean(&grads.weight)?;
        if let Some(bias) = self.bias.as_mut() {
            bias.accumulate_euclidean(&grads.bias)?;
        }
        Ok(grads.input)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight)?;
        if let Some(bias) = &self.bias {
            visitor(bias)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight)?;
        if let Some(bias) = self.bias.as_mut() {
            visitor(bias)?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PlainPadding {
    None,
    /// Wrap one row and one column onto the bottom/right edge.
    CircularTail,
    /// One zero on every side.
    Zero,
}

/// Unconstrained baseline convolution with kernel-dependent padding.
#[derive(Debug)]
pub struct PlainConv {
    conv: Conv2d,
    padding: PlainPadding,
}

impl PlainConv {
    pub fn new(spec: &ConvSpec) -> PureResult<Self> {
        let padding = match spec.kernel_size {
            1 => PlainPadding::None,
            2 => PlainPadding::CircularTail,
            _ => PlainPadding::Zero,
        };
        let conv = Conv2d::new(&spec.clone().with_padding(0))?;
        Ok(Self { conv, padding })
    }

    pub fn conv(&self) -> &Conv2d {
        &self.conv
    }

    fn channels(&self) -> usize {
        self.conv.geometry.in_channels
    }

    fn pad(&self, input: &Tensor) -> PureResult<Tensor> {
        let (batch, cols) = input.shape();
        let channels = self.channels();
        let n = spatial_side(cols, channels)?;
        let (m, offset) = match self.padding {
            PlainPadding::None => return Ok(input.clone()),
            PlainPadding::CircularTail => (n + 1, 0),
            PlainPadding::Zero => (n + 2, 1),
        };
        let mut padded = Tensor::zeros(batch, channels * m * m)?;
        {
            let src = input.data();
            let dst = padded.data_mut();
            for b in 0..batch {
                for c in 0..channels {
                    let src_base = b * cols + c * n * n;
                    let dst_base = b * channels * m * m + c * m * m;
                    for i in 0..m {
                        for j in 0..m {
                            let source = match self.padding {
                                PlainPadding::CircularTail => Some((i % n, j % n)),
                                _ => (i >= offset && j >= offset && i - offset < n && j - offset < n)
                                    .then(|| (i - offset, j - offset)),
                            };
                            if let Some((si, sj)) = source {
                                dst[dst_base + i * m + j] = src[src_base + si * n + sj];
                            }
                        }
                    }
                }
            }
        }
        Ok(padded)
    }

    /// Adjoint of [`PlainConv::pad`]: folds the padded gradient back onto the input.
    fn unpad(&self, grad: &Tensor, n: usize) -> PureResult<Tensor> {
        let (batch, _) = grad.shape();
        let channels = self.channels();
        let (m, offset) = match self.padding {
            PlainPadding::None => return Ok(grad.clone()),
            PlainPadding::CircularTail => (n + 1, 0),
            PlainPadding::Zero => (n + 2, 1),
        };
        let mut out = Tensor::zeros(batch, channels * n * n)?;
        {
            let src = grad.data();
            let dst = out.data_mut();
            for b in 0..batch {
                for c in 0..channels {
                    let src_base = b * channels * m * m + c * m * m;
                    let dst_base = b * channels * n * n + c * n * n;
                    for i in 0..m {
                        for j in 0..m {
                            let target = match self.padding {
                                PlainPadding::CircularTail => Some((i % n, j % n)),
                                _ => (i >= offset && j >= offset && i - offset < n && j - offset < n)
                                    .then(|| (i - offset, j - offset)),
                            };
                            if let Some((ti, tj)) = target {
                                dst[dst_base + ti * n + tj] += src[src_base + i * m + j];
                            }
                        }
                    }
                }
            }
        }
        Ok(out)
    }
}

impl Module for PlainConv {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.conv.forward(&self.pad(input)?)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let n = spatial_side(input.shape().1, self.channels())?;
        let padded = self.pad(input)?;
        let grad = self.conv.backward(&padded, grad_output)?;
        self.unpad(&grad, n)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.conv.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.conv.visit_parameters_mut(visitor)
    }
}
