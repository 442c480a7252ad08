// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::Parameter;
use lip_tensor::{PureResult, Tensor, TensorError};
use std::collections::HashMap;

/// Learned convex combination `s·x + (1 - s)·y` with `s = sigmoid(alpha)`.
///
/// It consumes two inputs, so it exposes a pair API instead of [`crate::Module`].
#[derive(Debug)]
pub struct ConvexCombo {
    alpha: Parameter,
}

fn sigmoid(value: f32) -> f32 {
    1.0 / (1.0 + (-value).exp())
}

impl ConvexCombo {
    pub fn new(name: impl Into<String>) -> PureResult<Self> {
        let name = name.into();
        Ok(Self {
            alpha: Parameter::new(format!("{name}::alpha"), Tensor::from_vec(1, 1, vec![0.5])?),
        })
    }

    pub fn alpha(&self) -> &Parameter {
        &self.alpha
    }

    /// Mixing weight applied to the first input.
    pub fn mix(&self) -> f32 {
        sigmoid(self.alpha.value().data()[0])
    }

    fn check(x: &Tensor, y: &Tensor) -> PureResult<()> {
        if x.shape() != y.shape() {
            return Err(TensorError::ShapeMismatch {
                left: x.shape(),
                right: y.shape(),
            });
        }
        Ok(())
    }

    pub fn forward(&self, x: &Tensor, y: &Tensor) -> PureResult<Tensor> {
        Self::check(x, y)?;
        let s = self.mix();
        let mut out = x.scale(s)?;
        out.add_scaled(y, 1.0 - s)?;
        Ok(out)
    }

    /// Returns `(∂L/∂x, ∂L/∂y)` and accumulates `∂L/∂alpha`.
    pub fn backward(
        &mut self,
        x: &Tensor,
        y: &Tensor,
        grad_output: &Tensor,
    ) -> PureResult<(Tensor, Tensor)> {
        Self::check(x, y)?;
        Self::check(x, grad_output)?;
        let s = self.mix();
        let grad_alpha: f32 = grad_output
            .data()
            .iter()
            .zip(x.data().iter().zip(y.data().iter()))
            .map(|(g, (a, b))| g * (a - b))
            .sum::<f32>()
            * s
            * (1.0 - s);
        self.alpha
            .accumulate_euclidean(&Tensor::from_vec(1, 1, vec![grad_alpha])?)?;
        Ok((grad_output.scale(s)?, grad_output.scale(1.0 - s)?))
    }

    pub fn apply_step(&mut self, lr: f32) -> PureResult<()> {
        self.alpha.apply_step(lr)
    }

    pub fn zero_accumulators(&mut self) {
        self.alpha.zero_gradient();
    }

    pub fn state_dict(&self) -> HashMap<String, Tensor> {
        HashMap::from([(self.alpha.name().to_string(), self.alpha.value().clone())])
    }

    pub fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> PureResult<()> {
        let value = state
            .get(self.alpha.name())
            .ok_or_else(|| TensorError::MissingParameter {
                name: self.alpha.name().to_string(),
            })?;
        self.alpha.load_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combining_a_tensor_with_itself_is_identity() {
        let combo = ConvexCombo::new("mix").unwrap();
        let x = Tensor::random_uniform(2, 5, -3.0, 3.0, Some(2)).unwrap();
        let out = combo.forward(&x, &x).unwrap();
        assert!(out.max_abs_diff(&x).unwrap() < 1e-6);
    }

    #[test]
    fn initial_mix_is_sigmoid_of_half() {
        let combo = ConvexCombo::new("mix").unwrap();
        assert!((combo.mix() - 0.622_459_3).abs() < 1e-6);
    }

    #[test]
    fn backward_splits_gradient_and_trains_alpha() {
        let mut combo = ConvexCombo::new("mix").unwrap();
        let x = Tensor::from_vec(1, 2, vec![1.0, 1.0]).unwrap();
        let y = Tensor::from_vec(1, 2, vec![0.0, 0.0]).unwrap();
        let grad = Tensor::from_vec(1, 2, vec![1.0, 1.0]).unwrap();
        let (gx, gy) = combo.backward(&x, &y, &grad).unwrap();
        let s = combo.mix();
        assert!((gx.data()[0] - s).abs() < 1e-6);
        assert!((gy.data()[1] - (1.0 - s)).abs() < 1e-6);
        let expected = 2.0 * s * (1.0 - s);
        assert!((combo.alpha().gradient().unwrap().data()[0] - expected).abs() < 1e-6);
        combo.apply_step(1.0).unwrap();
        assert!(combo.mix() < s);
    }

    #[test]
    fn state_round_trips() {
        let mut combo = ConvexCombo::new("mix").unwrap();
        let mut state = combo.state_dict();
        state.insert("mix::alpha".into(), Tensor::from_vec(1, 1, vec![-1.0]).unwrap());
        combo.load_state_dict(&state).unwrap();
        assert!((combo.mix() - sigmoid(-1.0)).abs() < 1e-6);
        assert!(combo.load_state_dict(&HashMap::new()).is_err());
    }
}
