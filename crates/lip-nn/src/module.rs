// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use lip_tensor::{PureResult, Tensor, TensorError};
use std::collections::HashMap;

/// Trainable parameter with a Euclidean gradient accumulator.
#[derive(Clone)]
pub struct Parameter {
    name: String,
    value: Tensor,
    gradient: Option<Tensor>,
}

impl core::fmt::Debug for Parameter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let (rows, cols) = self.value.shape();
        write!(
            f,
            "Parameter(name={},shape=({},{}),has_grad={})",
            self.name,
            rows,
            cols,
            self.gradient.is_some()
        )
    }
}

impl Parameter {
    /// Creates a new parameter with the provided tensor value.
    pub fn new(name: impl Into<String>, value: Tensor) -> Self {
        Self {
            name: name.into(),
            value,
            gradient: None,
        }
    }

    /// Returns the identifier assigned to the parameter.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Provides an immutable view into the underlying tensor value.
    pub fn value(&self) -> &Tensor {
        &self.value
    }

    /// Provides a mutable view into the underlying tensor value.
    pub fn value_mut(&mut self) -> &mut Tensor {
        &mut self.value
    }

    /// Returns the currently accumulated gradient.
    pub fn gradient(&self) -> Option<&Tensor> {
        self.gradient.as_ref()
    }

    fn assert_shape(&self, tensor: &Tensor) -> PureResult<()> {
        if self.value.shape() != tensor.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.value.shape(),
                right: tensor.shape(),
            });
        }
        Ok(())
    }

    /// Accumulates a Euclidean gradient update.
    pub fn accumulate_euclidean(&mut self, update: &Tensor) -> PureResult<()> {
        self.assert_shape(update)?;
        match self.gradient.as_mut() {
            Some(existing) => existing.add_scaled(update, 1.0)?,
            None => {
                self.gradient = Some(update.clone());
            }
        }
        Ok(())
    }

    /// Clears the accumulated gradient.
    pub fn zero_gradient(&mut self) {
        if let Some(grad) = self.gradient.as_mut() {
            for value in grad.data_mut() {
                *value = 0.0;
            }
        }
    }

    /// Plain SGD step: `value -= lr * gradient`, then clears the gradient.
    pub fn apply_step(&mut self, lr: f32) -> PureResult<()> {
        if let Some(grad) = self.gradient.as_mut() {
            self.value.add_scaled(grad, -lr)?;
            for value in grad.data_mut() {
                *value = 0.0;
            }
        }
        Ok(())
    }

    /// Returns the squared L2 norm of the accumulated gradient.
    pub fn accumulators_norm_sq(&self) -> f64 {
        self.gradient
            .as_ref()
            .map(|grad| {
                grad.data()
                    .iter()
                    .map(|&value| {
                        let v = value as f64;
                        v * v
                    })
                    .sum::<f64>()
            })
            .unwrap_or(0.0)
    }

    /// Replaces the parameter value with the provided tensor.
    pub fn load_value(&mut self, value: &Tensor) -> PureResult<()> {
        self.assert_shape(value)?;
        self.value = value.clone();
        Ok(())
    }
}

/// Module trait modelled on `nn.Module`, with an explicit reverse pass.
///
/// `backward` receives the layer input together with `∂L/∂output` and returns
/// `∂L/∂input`, accumulating `∂L/∂θ` into every parameter on the way.
pub trait Module {
    /// Runs a forward pass.
    fn forward(&self, input: &Tensor) -> PureResult<Tensor>;

    /// Propagates a gradient backwards. Implementations should populate the
    /// relevant parameter accumulators before returning the gradient with
    /// respect to `input`.
    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor>;

    /// Visits immutable parameters.
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()>;

    /// Visits mutable parameters.
    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()>;

    /// Applies an SGD update to every parameter.
    fn apply_step(&mut self, lr: f32) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| param.apply_step(lr))
    }

    /// Clears accumulators across every parameter.
    fn zero_accumulators(&mut self) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| {
            param.zero_gradient();
            Ok(())
        })
    }

    /// Captures a copy of every parameter tensor keyed by its canonical name.
    fn state_dict(&self) -> PureResult<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        self.visit_parameters(&mut |param| {
            state.insert(param.name().to_string(), param.value().clone());
            Ok(())
        })?;
        Ok(state)
    }

    /// Restores parameters from a state dictionary produced by [`Module::state_dict`].
    fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> PureResult<()> {
        load_parameters(self, state)
    }
}

/// Loads every visited parameter from `state`, failing on the first missing name.
pub fn load_parameters<M: Module + ?Sized>(
    module: &mut M,
    state: &HashMap<String, Tensor>,
) -> PureResult<()> {
    module.visit_parameters_mut(&mut |param| {
        let Some(value) = state.get(param.name()) else {
            return Err(TensorError::MissingParameter {
                name: param.name().to_string(),
            });
        };
        param.load_value(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_accumulates_and_steps() {
        let mut param = Parameter::new("w", Tensor::from_vec(1, 2, vec![1.0, 2.0]).unwrap());
        let grad = Tensor::from_vec(1, 2, vec![0.5, -1.0]).unwrap();
        param.accumulate_euclidean(&grad).unwrap();
        param.accumulate_euclidean(&grad).unwrap();
        assert_eq!(param.gradient().unwrap().data(), &[1.0, -2.0]);
        assert!((param.accumulators_norm_sq() - 5.0).abs() < 1e-9);
        param.apply_step(0.1).unwrap();
        assert_eq!(param.value().data(), &[0.9, 2.2]);
        assert_eq!(param.accumulators_norm_sq(), 0.0);
    }

    #[test]
    fn parameter_rejects_mismatched_updates() {
        let mut param = Parameter::new("w", Tensor::zeros(2, 2).unwrap());
        let wrong = Tensor::zeros(1, 4).unwrap();
        assert!(matches!(
            param.accumulate_euclidean(&wrong),
            Err(TensorError::ShapeMismatch { .. })
        ));
        assert!(param.load_value(&wrong).is_err());
    }
}
