// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{load_parameters, Module, Parameter};
use lip_config::determinism::rng_from_optional;
use lip_tensor::{PureResult, Tensor, TensorError};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use tracing::debug;

use super::cayley::{cayley_real, cayley_real_backward, CayleyMode};
use super::fan_in_bound;

/// Fully-connected layer whose weight is the Cayley transform of a free
/// parameter, so the map has orthonormal rows or columns.
#[derive(Debug)]
pub struct CayleyLinear {
    name: String,
    weight: Parameter,
    bias: Option<Parameter>,
    alpha: Parameter,
    train: Cell<bool>,
    cached: RefCell<Option<Tensor>>,
}

impl CayleyLinear {
    pub fn new(
        name: impl Into<String>,
        input_dim: usize,
        output_dim: usize,
        bias: bool,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        if input_dim == 0 || output_dim == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: input_dim,
                cols: output_dim,
            });
        }
        let name = name.into();
        let placeholder = Tensor::zeros(output_dim, input_dim)?;
        let mut layer = Self {
            weight: Parameter::new(format!("{name}::weight"), placeholder),
            bias: if bias {
                Some(Parameter::new(
                    format!("{name}::bias"),
                    Tensor::zeros(1, output_dim)?,
                ))
            } else {
                None
            },
            alpha: Parameter::new(format!("{name}::alpha"), Tensor::zeros(1, 1)?),
            train: Cell::new(true),
            cached: RefCell::new(None),
            name,
        };
        layer.reset_parameters(seed)?;
        Ok(layer)
    }

    /// Redraws weight and bias from `U(-1/√in, 1/√in)` and resets
    /// `alpha` to the weight norm.
    pub fn reset_parameters(&mut self, seed: Option<u64>) -> PureResult<()> {
        let (output_dim, input_dim) = self.weight.value().shape();
        let bound = fan_in_bound(input_dim);
        let mut rng = rng_from_optional(seed, "lip-nn/cayley_linear/init");
        let weight = Tensor::random_uniform_with(output_dim, input_dim, -bound, bound, &mut rng)?;
        self.weight.load_value(&weight)?;
        if let Some(bias) = self.bias.as_mut() {
            let values = Tensor::random_uniform_with(1, output_dim, -bound, bound, &mut rng)?;
            bias.load_value(&values)?;
        }
        self.alpha
            .load_value(&Tensor::from_vec(1, 1, vec![weight.l2_norm()])?)?;
        self.invalidate();
        Ok(())
    }

    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Parameter> {
        self.bias.as_ref()
    }

    pub fn alpha(&self) -> f32 {
        self.alpha.value().data()[0]
    }

    pub fn is_training(&self) -> bool {
        self.train.get()
    }

    /// Switches between training (recompute `Q` every call) and evaluation
    /// (compute once, then reuse).
    pub fn set_training(&self, training: bool) {
        self.train.set(training);
        if training {
            self.invalidate();
        }
    }

    pub fn train(&self) {
        self.set_training(true);
    }

    pub fn eval(&self) {
        self.set_training(false);
    }

    /// Whether an evaluation-mode `Q` is currently cached.
    pub fn has_cached_weight(&self) -> bool {
        self.cached.borrow().is_some()
    }

    fn invalidate(&self) {
        self.cached.borrow_mut().take();
    }

    fn scaled_weight(&self) -> PureResult<(Tensor, f32)> {
        let weight = self.weight.value();
        let norm = weight.l2_norm();
        if !(norm.is_finite() && norm > 0.0) {
            return Err(TensorError::NonFiniteValue {
                label: "cayley_linear_weight_norm",
                value: norm,
            });
        }
        Ok((weight.scale(self.alpha() / norm)?, norm))
    }

    /// The orthogonal `(out, in)` matrix applied by the layer.
    pub fn orthogonal_weight(&self) -> PureResult<Tensor> {
        if !self.train.get() {
            if let Some(q) = self.cached.borrow().as_ref() {
                return Ok(q.clone());
            }
        }
        let (scaled, _) = self.scaled_weight()?;
        let q = cayley_real(&scaled, CayleyMode::Rectangular)?;
        if !self.train.get() {
            debug!(layer = %self.name, "cached evaluation weight");
            *self.cached.borrow_mut() = Some(q.clone());
        }
        Ok(q)
    }

    fn check_input(&self, input: &Tensor) -> PureResult<()> {
        let (output_dim, input_dim) = self.weight.value().shape();
        if input.shape().1 != input_dim {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: (input_dim, output_dim),
            });
        }
        Ok(())
    }
}

impl Module for CayleyLinear {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.check_input(input)?;
        let q = self.orthogonal_weight()?;
        let mut out = input.matmul(&q.transpose())?;
        if let Some(bias) = &self.bias {
            out.add_row_inplace(bias.value().data())?;
        }
        Ok(out)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        self.check_input(input)?;
        let output_dim = self.weight.value().shape().0;
        if grad_output.shape() != (input.shape().0, output_dim) {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: (input.shape().0, output_dim),
            });
        }
        let (scaled, norm) = self.scaled_weight()?;
        let q = cayley_real(&scaled, CayleyMode::Rectangular)?;
        let grad_q = grad_output.transpose().matmul(input)?;
        let grad_scaled = cayley_real_backward(&scaled, CayleyMode::Rectangular, &grad_q)?;

        let alpha = self.alpha();
        let weight = self.weight.value().clone();
        let projection: f32 = grad_scaled
            .data()
            .iter()
            .zip(weight.data().iter())
            .map(|(g, w)| g * w)
            .sum();
        let mut grad_weight = grad_scaled.scale(alpha / norm)?;
        grad_weight.add_scaled(&weight, -alpha * projection / (norm * norm * norm))?;
        self.weight.accumulate_euclidean(&grad_weight)?;
        self.alpha
            .accumulate_euclidean(&Tensor::from_vec(1, 1, vec![projection / norm])?)?;
        if let Some(bias) = self.bias.as_mut() {
            let summed = grad_output.sum_axis0();
            bias.accumulate_euclidean(&Tensor::from_vec(1, summed.len(), summed)?)?;
        }
        grad_output.matmul(&q)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight)?;
        if let Some(bias) = &self.bias {
            visitor(bias)?;
        }
        visitor(&self.alpha)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight)?;
        if let Some(bias) = self.bias.as_mut() {
            visitor(bias)?;
        }
        visitor(&mut self.alpha)
    }

    fn apply_step(&mut self, lr: f32) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| param.apply_step(lr))?;
        self.invalidate();
        Ok(())
    }

    fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> PureResult<()> {
        load_parameters(self, state)?;
        self.invalidate();
        Ok(())
    }
}
