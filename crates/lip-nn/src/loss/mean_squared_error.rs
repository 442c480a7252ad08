// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::Loss;
use lip_tensor::{PureResult, Tensor, TensorError};

/// Mean squared error with mean reduction over every element.
#[derive(Debug, Default, Clone, Copy)]
pub struct MeanSquaredError;

impl MeanSquaredError {
    pub fn new() -> Self {
        Self
    }

    fn check(prediction: &Tensor, target: &Tensor) -> PureResult<()> {
        if prediction.shape() != target.shape() {
            return Err(TensorError::ShapeMismatch {
                left: prediction.shape(),
                right: target.shape(),
            });
        }
        Ok(())
    }
}

impl Loss for MeanSquaredError {
    fn forward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        Self::check(prediction, target)?;
        let sum: f32 = prediction
            .data()
            .iter()
            .zip(target.data().iter())
            .map(|(pred, tgt)| (pred - tgt) * (pred - tgt))
            .sum();
        Tensor::from_vec(1, 1, vec![sum / prediction.len() as f32])
    }

    fn backward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        Self::check(prediction, target)?;
        let (rows, cols) = prediction.shape();
        let inv = 2.0f32 / (rows * cols) as f32;
        let data = prediction
            .data()
            .iter()
            .zip(target.data().iter())
            .map(|(pred, tgt)| (pred - tgt) * inv)
            .collect();
        Tensor::from_vec(rows, cols, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mse_forward_backward() {
        let mut loss = MeanSquaredError::new();
        let prediction = Tensor::from_vec(1, 3, vec![0.5, -0.5, 1.0]).unwrap();
        let target = Tensor::from_vec(1, 3, vec![0.0, 0.0, 1.5]).unwrap();
        let value = loss.forward(&prediction, &target).unwrap();
        assert!((value.data()[0] - 0.25).abs() < 1e-6);

        let grad = loss.backward(&prediction, &target).unwrap();
        assert_eq!(grad.data().len(), 3);
        assert!(grad.data()[0] > 0.0);
        assert!(grad.data()[1] < 0.0);
        assert!((grad.data()[2] + 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn mse_rejects_mismatched_shapes() {
        let mut loss = MeanSquaredError::new();
        let a = Tensor::zeros(1, 2).unwrap();
        let b = Tensor::zeros(2, 1).unwrap();
        assert!(loss.forward(&a, &b).is_err());
    }
}
