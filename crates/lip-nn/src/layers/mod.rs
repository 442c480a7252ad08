// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

pub mod activation;
pub mod cayley;
pub mod combo;
pub mod conv;
pub mod fourier;
pub mod frame;
pub mod linear;
pub mod lipschitz;
pub mod normalization;
pub mod spectral;
pub mod strided;

pub use activation::GroupSort;
pub use cayley::CayleyMode;
pub use combo::ConvexCombo;
pub use conv::{Conv2d, PlainConv};
pub use frame::{FrameConfig, FrameLoss};
pub use linear::CayleyLinear;
pub use lipschitz::{Ossn, Rko};
pub use normalization::Normalize;
pub use spectral::{CayleyConv, CayleyConvEd, CayleyConvEd2};
pub use strided::{ConvSpec, StridableConv, StridedConv};

use lip_tensor::{PureResult, TensorError};

/// Recovers the side `n` of square `channels × n × n` activations stored in
/// `cols` columns.
pub(crate) fn spatial_side(cols: usize, channels: usize) -> PureResult<usize> {
    let mismatch = TensorError::ShapeMismatch {
        left: (1, cols),
        right: (channels, cols.checked_div(channels).unwrap_or(0)),
    };
    if channels == 0 || cols % channels != 0 {
        return Err(mismatch);
    }
    let plane = cols / channels;
    let side = (plane as f64).sqrt().round() as usize;
    if side == 0 || side * side != plane {
        return Err(mismatch);
    }
    Ok(side)
}

/// Default uniform init bound `1/sqrt(fan_in)`.
pub(crate) fn fan_in_bound(fan_in: usize) -> f32 {
    1.0 / (fan_in.max(1) as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spatial_side_accepts_square_planes() {
        assert_eq!(spatial_side(3 * 16, 3).unwrap(), 4);
        assert_eq!(spatial_side(1, 1).unwrap(), 1);
    }

    #[test]
    fn spatial_side_rejects_bad_layouts() {
        assert!(spatial_side(12, 0).is_err());
        assert!(spatial_side(13, 3).is_err());
        assert!(spatial_side(3 * 12, 3).is_err());
        assert!(spatial_side(0, 3).is_err());
    }
}
