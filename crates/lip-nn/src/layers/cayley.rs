// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Cayley transform on batches of complex matrices.
//!
//! The square transform maps a skew-Hermitian generator `A = W - Wᴴ` to the
//! unitary matrix `(I + A)⁻¹(I - A)`. The rectangular transform stacks
//! `U = W[..in]` on top of `V = W[in..]`, builds `A = U - Uᴴ + VᴴV` and returns
//! `[(I + A)⁻¹(I - A); -2V(I + A)⁻¹]`, whose columns are orthonormal.
//!
//! Gradients follow the `G = ∂L/∂Re + i ∂L/∂Im` convention so that
//! `dL = Re Σ conj(G) dZ` for every complex quantity `Z`.

use lip_tensor::{ComplexStack, PureResult, Tensor, TensorError};
use serde::{Deserialize, Serialize};

/// Which Cayley transform to apply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CayleyMode {
    /// Rows ≥ columns yields orthonormal columns; wider inputs are handled
    /// through the transposition duality.
    Rectangular,
    /// Square inputs only, yields a unitary matrix.
    Endomorphism,
}

struct Generator {
    eye: ComplexStack,
    a: ComplexStack,
    m_inv: ComplexStack,
    lower: Option<ComplexStack>,
}

impl Generator {
    fn square(w: &ComplexStack) -> PureResult<Self> {
        let (batch, rows, cols) = w.dims();
        if rows != cols {
            return Err(TensorError::ShapeMismatch {
                left: (rows, cols),
                right: (cols, cols),
            });
        }
        let a = w.sub(&w.conj_transpose())?;
        Self::finish(batch, cols, a, None)
    }

    fn tall(w: &ComplexStack) -> PureResult<Self> {
        let (batch, _, cols) = w.dims();
        let (upper, lower) = w.split_rows(cols)?;
        let mut a = upper.sub(&upper.conj_transpose())?;
        if let Some(v) = &lower {
            a = a.add(&v.conj_transpose().matmul(v)?)?;
        }
        Self::finish(batch, cols, a, lower)
    }

    fn finish(
        batch: usize,
        size: usize,
        a: ComplexStack,
        lower: Option<ComplexStack>,
    ) -> PureResult<Self> {
        let eye = ComplexStack::identity(batch, size)?;
        let m_inv = eye.add(&a)?.inverse()?;
        Ok(Self {
            eye,
            a,
            m_inv,
            lower,
        })
    }

    fn upper(&self) -> PureResult<ComplexStack> {
        self.m_inv.matmul(&self.eye.sub(&self.a)?)
    }

    fn transform(&self) -> PureResult<ComplexStack> {
        let upper = self.upper()?;
        match &self.lower {
            None => Ok(upper),
            Some(v) => ComplexStack::cat_rows(&upper, &v.matmul(&self.m_inv)?.scale(-2.0)),
        }
    }

    /// Gradient with respect to the generator `A` contributed by the upper
    /// block `(I + A)⁻¹(I - A)`.
    fn upper_grad(&self, grad_upper: &ComplexStack) -> PureResult<ComplexStack> {
        let q_plus_i = self.upper()?.add(&self.eye)?;
        Ok(self
            .m_inv
            .conj_transpose()
            .matmul(grad_upper)?
            .matmul(&q_plus_i.conj_transpose())?
            .scale(-1.0))
    }
}

/// Applies the Cayley transform to every matrix of the stack.
pub fn cayley(w: &ComplexStack, mode: CayleyMode) -> PureResult<ComplexStack> {
    match mode {
        CayleyMode::Endomorphism => Generator::square(w)?.transform(),
        CayleyMode::Rectangular => {
            let (_, rows, cols) = w.dims();
            if cols > rows {
                return Ok(cayley(&w.transpose(), mode)?.transpose());
            }
            Generator::tall(w)?.transform()
        }
    }
}

/// Reverse-mode gradient of [`cayley`]: maps `∂L/∂Q` to `∂L/∂W`.
pub fn cayley_backward(
    w: &ComplexStack,
    mode: CayleyMode,
    grad_q: &ComplexStack,
) -> PureResult<ComplexStack> {
    let (batch, rows, cols) = w.dims();
    if mode == CayleyMode::Rectangular && cols > rows {
        return Ok(cayley_backward(&w.transpose(), mode, &grad_q.transpose())?.transpose());
    }
    if grad_q.dims() != (batch, rows, cols) {
        return Err(TensorError::ShapeMismatch {
            left: grad_q.matrix_shape(),
            right: (rows, cols),
        });
    }
    match mode {
        CayleyMode::Endomorphism => {
            let generator = Generator::square(w)?;
            let grad_a = generator.upper_grad(grad_q)?;
            grad_a.sub(&grad_a.conj_transpose())
        }
        CayleyMode::Rectangular => {
            let generator = Generator::tall(w)?;
            let (grad_upper, grad_lower) = grad_q.split_rows(cols)?;
            let mut grad_a = generator.upper_grad(&grad_upper)?;
            let (Some(v), Some(g2)) = (&generator.lower, &grad_lower) else {
                return grad_a.sub(&grad_a.conj_transpose());
            };
            let m_inv_h = generator.m_inv.conj_transpose();
            let through_lower = m_inv_h
                .matmul(&v.conj_transpose())?
                .matmul(g2)?
                .matmul(&m_inv_h)?
                .scale(2.0);
            grad_a = grad_a.add(&through_lower)?;
            let grad_u = grad_a.sub(&grad_a.conj_transpose())?;
            let sym = grad_a.add(&grad_a.conj_transpose())?;
            let grad_v = g2
                .matmul(&m_inv_h)?
                .scale(-2.0)
                .add(&v.matmul(&sym)?)?;
            ComplexStack::cat_rows(&grad_u, &grad_v)
        }
    }
}

/// Cayley transform of a single real matrix.
pub fn cayley_real(w: &Tensor, mode: CayleyMode) -> PureResult<Tensor> {
    cayley(&ComplexStack::from_real(w)?, mode)?.real_matrix(0)
}

/// Gradient of [`cayley_real`] with respect to its real input.
pub fn cayley_real_backward(w: &Tensor, mode: CayleyMode, grad_q: &Tensor) -> PureResult<Tensor> {
    let grad = cayley_backward(
        &ComplexStack::from_real(w)?,
        mode,
        &ComplexStack::from_real(grad_q)?,
    )?;
    grad.real_matrix(0)
}
