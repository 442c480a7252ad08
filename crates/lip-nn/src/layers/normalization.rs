// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::module::{Module, Parameter};
use lip_tensor::{PureResult, Tensor, TensorError};

/// Fixed per-channel standardisation `(x - mu) / std`, or `x - mu` without `std`.
#[derive(Debug, Clone)]
pub struct Normalize {
    mean: Vec<f32>,
    std: Option<Vec<f32>>,
}

impl Normalize {
    pub fn new(mean: Vec<f32>, std: Option<Vec<f32>>) -> PureResult<Self> {
        if mean.is_empty() {
            return Err(TensorError::EmptyInput("normalize_mean"));
        }
        if let Some(std) = &std {
            if std.len() != mean.len() {
                return Err(TensorError::DataLength {
                    expected: mean.len(),
                    got: std.len(),
                });
            }
            if std.iter().any(|&s| !(s.is_finite() && s != 0.0)) {
                return Err(TensorError::InvalidValue {
                    label: "normalize_std",
                });
            }
        }
        Ok(Self { mean, std })
    }

    pub fn channels(&self) -> usize {
        self.mean.len()
    }

    fn plane(&self, tensor: &Tensor) -> PureResult<usize> {
        let cols = tensor.shape().1;
        if cols % self.channels() != 0 {
            return Err(TensorError::ShapeMismatch {
                left: tensor.shape(),
                right: (tensor.shape().0, self.channels()),
            });
        }
        Ok(cols / self.channels())
    }

    fn scale_for(&self, channel: usize) -> f32 {
        self.std.as_ref().map_or(1.0, |std| 1.0 / std[channel])
    }
}

impl Module for Normalize {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let plane = self.plane(input)?;
        let channels = self.channels();
        let mut out = input.clone();
        for (idx, value) in out.data_mut().iter_mut().enumerate() {
            let c = (idx / plane) % channels;
            *value = (*value - self.mean[c]) * self.scale_for(c);
        }
        Ok(out)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        if input.shape() != grad_output.shape() {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: grad_output.shape(),
            });
        }
        let plane = self.plane(grad_output)?;
        let channels = self.channels();
        let mut grad = grad_output.clone();
        if self.std.is_some() {
            for (idx, value) in grad.data_mut().iter_mut().enumerate() {
                *value *= self.scale_for((idx / plane) % channels);
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standardises_each_channel() {
        let norm = Normalize::new(vec![1.0, -1.0], Some(vec![2.0, 0.5])).unwrap();
        let input = Tensor::from_vec(1, 4, vec![3.0, 5.0, -1.0, 0.0]).unwrap();
        let output = norm.forward(&input).unwrap();
        assert_eq!(output.data(), &[1.0, 2.0, 0.0, 2.0]);
    }

    #[test]
    fn mean_only_shifts() {
        let mut norm = Normalize::new(vec![0.5], None).unwrap();
        let input = Tensor::from_vec(2, 2, vec![1.0, 0.5, 0.0, 2.0]).unwrap();
        let output = norm.forward(&input).unwrap();
        assert_eq!(output.data(), &[0.5, 0.0, -0.5, 1.5]);
        let grad = Tensor::from_vec(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(norm.backward(&input, &grad).unwrap(), grad);
    }

    #[test]
    fn rejects_zero_std_and_bad_channels() {
        assert!(Normalize::new(vec![0.0], Some(vec![0.0])).is_err());
        assert!(Normalize::new(vec![0.0, 1.0], Some(vec![1.0])).is_err());
        let norm = Normalize::new(vec![0.0, 0.0, 0.0], None).unwrap();
        assert!(norm.forward(&Tensor::zeros(1, 4).unwrap()).is_err());
    }
}
