// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Reshaped-kernel Lipschitz convolutions.
//!
//! Both layers constrain the `(out, in * k * k)` reshaped kernel and then run
//! an ordinary convolution. For a `k × k` kernel the operator norm of the
//! convolution is at most `k` times the spectral norm of the reshaped kernel,
//! so both divide by `k` as well.

use crate::module::{Module, Parameter};
use lip_config::determinism::rng_from_optional;
use lip_tensor::{PureResult, Tensor, TensorError};
use rand::distributions::{Distribution, Uniform};
use std::cell::RefCell;

use super::conv::{conv2d_backward, conv2d_forward, ConvGeometry};
use super::fan_in_bound;
use super::strided::{ConvSpec, StridableConv};

const POWER_ITERATIONS: usize = 10;
const BJORCK_ITERATIONS: usize = 20;
const NORM_EPS: f32 = 1e-12;

fn normalise(values: &mut [f32]) {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt().max(NORM_EPS);
    for value in values {
        *value /= norm;
    }
}

fn frobenius_inner(a: &Tensor, b: &Tensor) -> f32 {
    a.data().iter().zip(b.data().iter()).map(|(x, y)| x * y).sum()
}

/// Weight and bias of a reshaped-kernel layer.
#[derive(Debug)]
struct KernelParams {
    weight: Parameter,
    bias: Option<Parameter>,
    geometry: ConvGeometry,
}

impl KernelParams {
    fn new(spec: &ConvSpec, label: &str) -> PureResult<Self> {
        spec.validate()?;
        let geometry = ConvGeometry::from_spec(spec);
        let bound = fan_in_bound(geometry.span());
        let mut rng = rng_from_optional(spec.seed, label);
        let weight =
            Tensor::random_uniform_with(geometry.out_channels, geometry.span(), -bound, bound, &mut rng)?;
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

    fn forward(&self, input: &Tensor, effective: &Tensor) -> PureResult<Tensor> {
        conv2d_forward(
            &self.geometry,
            input,
            effective,
            self.bias.as_ref().map(Parameter::value),
        )
    }

    /// Runs the convolution backward and returns `(∂L/∂input, ∂L/∂effective)`,
    /// accumulating the bias gradient.
    fn backward(
        &mut self,
        input: &Tensor,
        effective: &Tensor,
        grad_output: &Tensor,
    ) -> PureResult<(Tensor, Tensor)> {
        let grads = conv2d_backward(&self.geometry, input, effective, grad_output)?;
        if let Some(bias) = self.bias.as_mut() {
            bias.accumulate_euclidean(&grads.bias)?;
        }
        Ok((grads.input, grads.weight))
    }

    fn visit(&self, visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>) -> PureResult<()> {
        visitor(&self.weight)?;
        if let Some(bias) = &self.bias {
            visitor(bias)?;
        }
        Ok(())
    }

    fn visit_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight)?;
        if let Some(bias) = self.bias.as_mut() {
            visitor(bias)?;
        }
        Ok(())
    }

    fn kernel_scale(&self) -> f32 {
        1.0 / self.geometry.kernel as f32
    }
}

/// Result of a power-iteration estimate of the largest singular value.
#[derive(Debug, Clone)]
struct SpectralEstimate {
    sigma: f32,
    u: Vec<f32>,
    v: Vec<f32>,
}

/// One-sided spectral normalisation of the reshaped kernel.
#[derive(Debug)]
pub struct Ossn {
    params: KernelParams,
    u: RefCell<Vec<f32>>,
}

impl Ossn {
    pub fn new(spec: &ConvSpec) -> PureResult<Self> {
        let params = KernelParams::new(spec, "lip-nn/ossn/init")?;
        let mut rng = rng_from_optional(spec.seed.map(|seed| seed.wrapping_add(1)), "lip-nn/ossn/u");
        let dist = Uniform::new(-1.0f32, 1.0);
        let mut u: Vec<f32> = (0..params.geometry.out_channels)
            .map(|_| dist.sample(&mut rng))
            .collect();
        normalise(&mut u);
        Ok(Self {
            params,
            u: RefCell::new(u),
        })
    }

    pub fn weight(&self) -> &Parameter {
        &self.params.weight
    }

    /// Refines the persistent left singular vector and returns the estimate.
    fn estimate(&self) -> PureResult<SpectralEstimate> {
        let weight = self.params.weight.value();
        let (rows, cols) = weight.shape();
        let data = weight.data();
        let mut u = self.u.borrow_mut();
        let mut v = vec![0.0f32; cols];
        for _ in 0..POWER_ITERATIONS {
            v.iter_mut().for_each(|value| *value = 0.0);
            for r in 0..rows {
                for c in 0..cols {
                    v[c] += data[r * cols + c] * u[r];
                }
            }
            normalise(&mut v);
            for r in 0..rows {
                u[r] = (0..cols).map(|c| data[r * cols + c] * v[c]).sum();
            }
            normalise(&mut u);
        }
        let sigma: f32 = (0..rows)
            .map(|r| u[r] * (0..cols).map(|c| data[r * cols + c] * v[c]).sum::<f32>())
            .sum();
        if !(sigma.is_finite() && sigma > 0.0) {
            return Err(TensorError::NonFiniteValue {
                label: "ossn_sigma",
                value: sigma,
            });
        }
        Ok(SpectralEstimate {
            sigma,
            u: u.to_vec(),
            v,
        })
    }

    /// Largest singular value of the reshaped kernel.
    pub fn spectral_norm(&self) -> PureResult<f32> {
        Ok(self.estimate()?.sigma)
    }

    fn effective(&self, estimate: &SpectralEstimate) -> PureResult<Tensor> {
        self.params
            .weight
            .value()
            .scale(self.params.kernel_scale() / estimate.sigma)
    }
}

impl StridableConv for Ossn {
    fn from_spec(spec: &ConvSpec) -> PureResult<Self> {
        Ossn::new(spec)
    }
}

impl Module for Ossn {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let estimate = self.estimate()?;
        self.params.forward(input, &self.effective(&estimate)?)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let estimate = self.estimate()?;
        let effective = self.effective(&estimate)?;
        let (grad_input, grad_effective) = self.params.backward(input, &effective, grad_output)?;
        let scale = self.params.kernel_scale() / estimate.sigma;
        let weight = self.params.weight.value().clone();
        // W_eff = W·k⁻¹/σ with dσ = uᵀ dW v
        let coupling = frobenius_inner(&grad_effective, &weight) * scale / estimate.sigma;
        let (rows, cols) = weight.shape();
        let grad_weight = Tensor::from_fn(rows, cols, |r, c| {
            grad_effective.data()[r * cols + c] * scale - coupling * estimate.u[r] * estimate.v[c]
        })?;
        self.params.weight.accumulate_euclidean(&grad_weight)?;
        Ok(grad_input)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.params.visit(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.params.visit_mut(visitor)
    }
}

/// Reshaped kernel orthogonalisation through Björck iterations.
#[derive(Debug)]
pub struct Rko {
    params: KernelParams,
}

impl Rko {
    pub fn new(spec: &ConvSpec) -> PureResult<Self> {
        Ok(Self {
            params: KernelParams::new(spec, "lip-nn/rko/init")?,
        })
    }

    pub fn weight(&self) -> &Parameter {
        &self.params.weight
    }

    /// Björck iterates starting from the Frobenius-normalised kernel; the last
    /// entry is the orthonormalised kernel.
    fn iterates(&self) -> PureResult<(f32, Vec<Tensor>)> {
        let weight = self.params.weight.value();
        let norm = weight.l2_norm();
        if !(norm.is_finite() && norm > 0.0) {
            return Err(TensorError::NonFiniteValue {
                label: "rko_weight_norm",
                value: norm,
            });
        }
        let mut iterates = Vec::with_capacity(BJORCK_ITERATIONS + 1);
        iterates.push(weight.scale(1.0 / norm)?);
        for _ in 0..BJORCK_ITERATIONS {
            let current = &iterates[iterates.len() - 1];
            let cubic = current.matmul(&current.transpose())?.matmul(current)?;
            let mut next = current.scale(1.5)?;
            next.add_scaled(&cubic, -0.5)?;
            iterates.push(next);
        }
        Ok((norm, iterates))
    }

    /// The orthonormalised reshaped kernel, before the `1/k` scaling.
    pub fn orthogonal_kernel(&self) -> PureResult<Tensor> {
        let (_, mut iterates) = self.iterates()?;
        iterates.pop().ok_or(TensorError::EmptyInput("rko_iterates"))
    }

    fn effective(&self, iterates: &[Tensor]) -> PureResult<Tensor> {
        iterates
            .last()
            .ok_or(TensorError::EmptyInput("rko_iterates"))?
            .scale(self.params.kernel_scale())
    }
}

impl StridableConv for Rko {
    fn from_spec(spec: &ConvSpec) -> PureResult<Self> {
        Rko::new(spec)
    }
}

impl Module for Rko {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let (_, iterates) = self.iterates()?;
        self.params.forward(input, &self.effective(&iterates)?)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let (norm, iterates) = self.iterates()?;
        let effective = self.effective(&iterates)?;
        let (grad_input, grad_effective) = self.params.backward(input, &effective, grad_output)?;
        let mut grad = grad_effective.scale(self.params.kernel_scale())?;
        for current in iterates[..BJORCK_ITERATIONS].iter().rev() {
            let wt = current.transpose();
            let gt = grad.transpose();
            let mut next = grad.scale(1.5)?;
            next.add_scaled(&grad.matmul(&wt)?.matmul(current)?, -0.5)?;
            next.add_scaled(&current.matmul(&gt)?.matmul(current)?, -0.5)?;
            next.add_scaled(&current.matmul(&wt)?.matmul(&grad)?, -0.5)?;
            grad = next;
        }
        let weight = self.params.weight.value().clone();
        let projection = frobenius_inner(&grad, &weight);
        let mut grad_weight = grad.scale(1.0 / norm)?;
        grad_weight.add_scaled(&weight, -projection / (norm * norm * norm))?;
        self.params.weight.accumulate_euclidean(&grad_weight)?;
        Ok(grad_input)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.params.visit(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.params.visit_mut(visitor)
    }
}
