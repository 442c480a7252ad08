// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Lipschitz-constrained layers built on the Cayley transform.
//!
//! Convolutions are orthogonalised per frequency bin of a real 2-D FFT
//! ([`CayleyConv`], [`CayleyConvEd`], [`CayleyConvEd2`]) while
//! [`CayleyLinear`] applies the transform to a dense weight directly. The
//! remaining layers ([`Ossn`], [`Rko`], [`PlainConv`], [`GroupSort`],
//! [`ConvexCombo`], [`Normalize`]) complete a 1-Lipschitz network toolbox.
//! Stride two is emulated through [`StridedConv`].

pub mod io;
pub mod layers;
pub mod loss;
pub mod module;

pub use io::{
    load_bincode, load_json, load_state_dict_bincode, load_state_dict_json, save_bincode,
    save_json, save_state_dict_bincode, save_state_dict_json,
};
pub use layers::{
    CayleyConv, CayleyConvEd, CayleyConvEd2, CayleyLinear, CayleyMode, Conv2d, ConvSpec,
    ConvexCombo, FrameConfig, FrameLoss, GroupSort, Normalize, Ossn, PlainConv, Rko,
    StridableConv, StridedConv,
};
pub use loss::{Loss, MeanSquaredError};
pub use module::{load_parameters, Module, Parameter};

pub use lip_tensor::{PureResult, Tensor, TensorError};
