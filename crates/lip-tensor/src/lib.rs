// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Tensor substrate for the Lipschitz layer stack.
//!
//! [`Tensor`] is a row-major `f32` matrix. Four dimensional activations are
//! flattened to `(batch, channels * height * width)`. [`ComplexStack`] holds a
//! batch of complex matrices (one per frequency bin) and [`RealFft2`] moves
//! square planes between the spatial and the half-spectrum domain.

pub mod complex;
pub mod fft;
pub mod pure;

pub use complex::ComplexStack;
pub use fft::RealFft2;
pub use num_complex::Complex32;
pub use pure::{PureResult, Tensor, TensorError};
