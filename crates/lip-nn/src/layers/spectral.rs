// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Cayley convolutions evaluated per frequency bin.
//!
//! All three layers share one spectral core: activations and the kernel move to
//! the half spectrum, the per-bin weight stack is rescaled to norm `alpha`, the
//! Cayley transform turns every bin into an orthogonal (or unitary) matrix, and
//! the product goes back through `irfft2`. The endomorphism variants add a
//! frozen frame `H` to change the channel count.

use crate::module::{load_parameters, Module, Parameter};
use lip_config::determinism::rng_from_optional;
use lip_tensor::{ComplexStack, PureResult, Tensor, TensorError};
use rand::rngs::StdRng;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, warn};

use super::cayley::{cayley, cayley_backward, CayleyMode};
use super::fourier::SpectralPlan;
use super::frame::{spatial_frame, spectral_frame, FrameConfig};
use super::strided::{ConvSpec, StridableConv};
use super::{fan_in_bound, spatial_side};

/// Offset applied to the layer seed when seeding the frame search.
const FRAME_SEED_OFFSET: u64 = 0x9E37_79B9_7F4A_7C15;

/// Intermediates of one spectral forward pass, reused by the reverse pass.
struct SpectralPass {
    plan: Rc<SpectralPlan>,
    activations: ComplexStack,
    spectrum: ComplexStack,
    norm: f32,
    alpha: f32,
    scaled: ComplexStack,
    q: ComplexStack,
}

#[derive(Debug)]
struct SpectralCore {
    name: String,
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    mode: CayleyMode,
    weight: Parameter,
    alpha: RefCell<Option<Parameter>>,
    plan: RefCell<Option<Rc<SpectralPlan>>>,
}

impl SpectralCore {
    fn new(
        spec: &ConvSpec,
        in_channels: usize,
        out_channels: usize,
        mode: CayleyMode,
        rng: &mut StdRng,
    ) -> PureResult<Self> {
        let kernel = spec.kernel_size;
        let span = in_channels * kernel * kernel;
        let bound = fan_in_bound(span);
        let weight = Tensor::random_uniform_with(out_channels, span, -bound, bound, rng)?;
        Ok(Self {
            name: spec.name.clone(),
            in_channels,
            out_channels,
            kernel,
            mode,
            weight: Parameter::new(spec.param_name("weight"), weight),
            alpha: RefCell::new(None),
            plan: RefCell::new(None),
        })
    }

    fn alpha_name(&self) -> String {
        format!("{}::alpha", self.name)
    }

    fn side(&self, input: &Tensor) -> PureResult<usize> {
        spatial_side(input.shape().1, self.in_channels)
    }

    fn plan(&self, n: usize) -> PureResult<Rc<SpectralPlan>> {
        let mut slot = self.plan.borrow_mut();
        if let Some(plan) = slot.as_ref().filter(|plan| plan.size() == n) {
            return Ok(Rc::clone(plan));
        }
        let previous = slot.as_ref().map(|plan| plan.size());
        let plan = Rc::new(SpectralPlan::new(n, self.kernel)?);
        debug!(layer = %self.name, n, ?previous, "spectral plan rebuilt");
        *slot = Some(Rc::clone(&plan));
        Ok(plan)
    }

    fn cached_size(&self) -> Option<usize> {
        self.plan.borrow().as_ref().map(|plan| plan.size())
    }

    fn alpha_value(&self) -> Option<f32> {
        self.alpha
            .borrow()
            .as_ref()
            .map(|alpha| alpha.value().data()[0])
    }

    fn alpha_or_init(&self, norm: f32) -> PureResult<f32> {
        if let Some(value) = self.alpha_value() {
            return Ok(value);
        }
        let param = Parameter::new(self.alpha_name(), Tensor::from_vec(1, 1, vec![norm])?);
        debug!(layer = %self.name, alpha = norm, "alpha initialised from spectral norm");
        *self.alpha.borrow_mut() = Some(param);
        Ok(norm)
    }

    fn pass(&self, input: &Tensor) -> PureResult<SpectralPass> {
        let n = self.side(input)?;
        let plan = self.plan(n)?;
        let activations = plan.embed_activations(input, self.in_channels)?;
        let spectrum = plan.embed_kernel(self.weight.value(), self.out_channels, self.in_channels)?;
        let norm = spectrum.frobenius_norm();
        if !(norm.is_finite() && norm > 0.0) {
            return Err(TensorError::NonFiniteValue {
                label: "spectral_weight_norm",
                value: norm,
            });
        }
        let alpha = self.alpha_or_init(norm)?;
        let scaled = spectrum.scale(alpha / norm);
        let q = cayley(&scaled, self.mode)?;
        Ok(SpectralPass {
            plan,
            activations,
            spectrum,
            norm,
            alpha,
            scaled,
            q,
        })
    }

    fn check_grad(&self, input: &Tensor, grad_output: &Tensor, channels: usize) -> PureResult<()> {
        let n = self.side(input)?;
        let expected = (input.shape().0, channels * n * n);
        if grad_output.shape() != expected {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: expected,
            });
        }
        Ok(())
    }

    /// Pushes `∂L/∂Q` through the Cayley transform, the `alpha` rescaling and
    /// the kernel embedding, accumulating into `weight` and `alpha`.
    fn accumulate(&mut self, pass: &SpectralPass, grad_q: &ComplexStack) -> PureResult<()> {
        let grad_scaled = cayley_backward(&pass.scaled, self.mode, grad_q)?;
        let projection = grad_scaled.real_inner(&pass.spectrum)?;
        let norm = pass.norm;
        let mut grad_spectrum = grad_scaled.scale(pass.alpha / norm);
        grad_spectrum.add_scaled(&pass.spectrum, -pass.alpha * projection / (norm * norm * norm))?;
        let grad_weight = pass.plan.embed_kernel_adjoint(&grad_spectrum)?;
        self.weight.accumulate_euclidean(&grad_weight)?;
        if let Some(alpha) = self.alpha.get_mut().as_mut() {
            alpha.accumulate_euclidean(&Tensor::from_vec(1, 1, vec![projection / norm])?)?;
        }
        Ok(())
    }

    fn visit(&self, visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>) -> PureResult<()> {
        visitor(&self.weight)?;
        if let Some(alpha) = self.alpha.borrow().as_ref() {
            visitor(alpha)?;
        }
        Ok(())
    }

    fn visit_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight)?;
        if let Some(alpha) = self.alpha.get_mut().as_mut() {
            visitor(alpha)?;
        }
        Ok(())
    }

    /// Mirrors the checkpoint: `alpha` exists afterwards iff the state carries it.
    fn restore_alpha(&mut self, state: &HashMap<String, Tensor>) -> PureResult<()> {
        let name = self.alpha_name();
        let slot = self.alpha.get_mut();
        match (state.get(&name), slot.as_mut()) {
            (Some(value), Some(alpha)) => alpha.load_value(value)?,
            (Some(value), None) => {
                if value.shape() != (1, 1) {
                    return Err(TensorError::ShapeMismatch {
                        left: value.shape(),
                        right: (1, 1),
                    });
                }
                *slot = Some(Parameter::new(name, value.clone()));
            }
            (None, _) => *slot = None,
        }
        Ok(())
    }
}

fn bias_parameter(
    spec: &ConvSpec,
    out_channels: usize,
    bound: f32,
    rng: &mut StdRng,
) -> PureResult<Parameter> {
    let values = Tensor::random_uniform_with(1, out_channels, -bound, bound, rng)?;
    Ok(Parameter::new(spec.param_name("bias"), values))
}

fn bias_gradient(grad_output: &Tensor, channels: usize) -> PureResult<Tensor> {
    Tensor::from_vec(1, channels, grad_output.sum_channels(channels)?)
}

/// Norm-preserving convolution: a rectangular Cayley transform per frequency.
#[derive(Debug)]
pub struct CayleyConv {
    core: SpectralCore,
    bias: Option<Parameter>,
}

impl CayleyConv {
    pub fn new(spec: &ConvSpec) -> PureResult<Self> {
        spec.validate()?;
        let mut rng = rng_from_optional(spec.seed, "lip-nn/cayley_conv/init");
        let core = SpectralCore::new(
            spec,
            spec.in_channels,
            spec.out_channels,
            CayleyMode::Rectangular,
            &mut rng,
        )?;
        let bias = if spec.bias {
            let bound = fan_in_bound(spec.in_channels * spec.kernel_size * spec.kernel_size);
            Some(bias_parameter(spec, spec.out_channels, bound, &mut rng)?)
        } else {
            None
        };
        Ok(Self { core, bias })
    }

    pub fn weight(&self) -> &Parameter {
        &self.core.weight
    }

    pub fn bias(&self) -> Option<&Parameter> {
        self.bias.as_ref()
    }

    /// `alpha` once the first forward pass has created it.
    pub fn alpha(&self) -> Option<f32> {
        self.core.alpha_value()
    }

    /// Spatial size the cached spectral plan was built for.
    pub fn cached_size(&self) -> Option<usize> {
        self.core.cached_size()
    }
}

impl StridableConv for CayleyConv {
    fn from_spec(spec: &ConvSpec) -> PureResult<Self> {
        CayleyConv::new(spec)
    }
}

impl Module for CayleyConv {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let pass = self.core.pass(input)?;
        let mut output = pass.plan.synthesize(&pass.q.matmul(&pass.activations)?)?;
        if let Some(bias) = &self.bias {
            output.add_channel_bias_inplace(bias.value().data())?;
        }
        Ok(output)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let out = self.core.out_channels;
        self.core.check_grad(input, grad_output, out)?;
        let pass = self.core.pass(input)?;
        let grad_y = pass.plan.synthesize_adjoint(grad_output, out)?;
        let grad_x = pass.q.conj_transpose().matmul(&grad_y)?;
        let grad_q = grad_y.matmul(&pass.activations.conj_transpose())?;
        self.core.accumulate(&pass, &grad_q)?;
        if let Some(bias) = self.bias.as_mut() {
            bias.accumulate_euclidean(&bias_gradient(grad_output, out)?)?;
        }
        pass.plan.embed_activations_adjoint(&grad_x)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.core.visit(visitor)?;
        if let Some(bias) = &self.bias {
            visitor(bias)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.core.visit_mut(visitor)?;
        if let Some(bias) = self.bias.as_mut() {
            visitor(bias)?;
        }
        Ok(())
    }

    fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> PureResult<()> {
        self.core.restore_alpha(state)?;
        load_parameters(self, state)
    }
}

/// Frame cache keyed by `(n, out, internal)`.
type SpectralFrameSlot = Option<((usize, usize, usize), Rc<ComplexStack>)>;

/// Endomorphism Cayley convolution followed by a frozen spectral frame that
/// maps the internal channels to `out_channels`.
#[derive(Debug)]
pub struct CayleyConvEd {
    core: SpectralCore,
    bias: Parameter,
    out_channels: usize,
    frame_config: FrameConfig,
    frame: RefCell<SpectralFrameSlot>,
    frame_rng: RefCell<StdRng>,
}

impl CayleyConvEd {
    pub fn new(spec: &ConvSpec) -> PureResult<Self> {
        spec.validate()?;
        let channels = spec.in_channels;
        let mut rng = rng_from_optional(spec.seed, "lip-nn/cayley_conv_ed/init");
        let core = SpectralCore::new(spec, channels, channels, CayleyMode::Endomorphism, &mut rng)?;
        let frame_rng = rng_from_optional(
            spec.seed.map(|seed| seed ^ FRAME_SEED_OFFSET),
            "lip-nn/cayley_conv_ed/frame",
        );
        Ok(Self {
            core,
            bias: Parameter::new(spec.param_name("bias"), Tensor::zeros(1, spec.out_channels)?),
            out_channels: spec.out_channels,
            frame_config: FrameConfig::default(),
            frame: RefCell::new(None),
            frame_rng: RefCell::new(frame_rng),
        })
    }

    pub fn with_frame_config(mut self, config: FrameConfig) -> Self {
        self.frame_config = config;
        self
    }

    pub fn weight(&self) -> &Parameter {
        &self.core.weight
    }

    pub fn bias(&self) -> &Parameter {
        &self.bias
    }

    pub fn alpha(&self) -> Option<f32> {
        self.core.alpha_value()
    }

    pub fn cached_size(&self) -> Option<usize> {
        self.core.cached_size()
    }

    /// The frozen frame, once generated.
    pub fn frame(&self) -> Option<Rc<ComplexStack>> {
        self.frame.borrow().as_ref().map(|(_, frame)| Rc::clone(frame))
    }

    fn frame_for(&self, n: usize) -> PureResult<Rc<ComplexStack>> {
        let key = (n, self.out_channels, self.core.in_channels);
        let mut slot = self.frame.borrow_mut();
        match slot.as_ref() {
            Some((cached, frame)) if *cached == key => return Ok(Rc::clone(frame)),
            Some((cached, _)) => {
                warn!(layer = %self.core.name, ?cached, ?key, "regenerating spectral frame for a new shape")
            }
            None => debug!(layer = %self.core.name, ?key, "generating spectral frame"),
        }
        let frame = Rc::new(spectral_frame(
            n,
            self.core.kernel,
            self.out_channels,
            self.core.in_channels,
            &self.frame_config,
            &mut self.frame_rng.borrow_mut(),
        )?);
        *slot = Some((key, Rc::clone(&frame)));
        Ok(frame)
    }
}

impl StridableConv for CayleyConvEd {
    fn from_spec(spec: &ConvSpec) -> PureResult<Self> {
        CayleyConvEd::new(spec)
    }
}

impl Module for CayleyConvEd {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let pass = self.core.pass(input)?;
        let frame = self.frame_for(pass.plan.size())?;
        let mixed = frame.matmul(&pass.q.matmul(&pass.activations)?)?;
        let mut output = pass.plan.synthesize(&mixed)?;
        output.add_channel_bias_inplace(self.bias.value().data())?;
        Ok(output)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        self.core.check_grad(input, grad_output, self.out_channels)?;
        let pass = self.core.pass(input)?;
        let frame = self.frame_for(pass.plan.size())?;
        let grad_y = pass.plan.synthesize_adjoint(grad_output, self.out_channels)?;
        let grad_qx = frame.conj_transpose().matmul(&grad_y)?;
        let grad_x = pass.q.conj_transpose().matmul(&grad_qx)?;
        let grad_q = grad_qx.matmul(&pass.activations.conj_transpose())?;
        self.core.accumulate(&pass, &grad_q)?;
        self.bias
            .accumulate_euclidean(&bias_gradient(grad_output, self.out_channels)?)?;
        pass.plan.embed_activations_adjoint(&grad_x)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.core.visit(visitor)?;
        visitor(&self.bias)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.core.visit_mut(visitor)?;
        visitor(&mut self.bias)
    }

    fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> PureResult<()> {
        self.core.restore_alpha(state)?;
        load_parameters(self, state)
    }
}

/// Spatial frame cache keyed by `(out, internal)`.
type SpatialFrameSlot = Option<((usize, usize), Rc<Tensor>)>;

/// Endomorphism Cayley convolution followed by a frozen 1×1 channel mix.
#[derive(Debug)]
pub struct CayleyConvEd2 {
    core: SpectralCore,
    bias: Parameter,
    out_channels: usize,
    frame_config: FrameConfig,
    frame: RefCell<SpatialFrameSlot>,
    frame_rng: RefCell<StdRng>,
}

impl CayleyConvEd2 {
    pub fn new(spec: &ConvSpec) -> PureResult<Self> {
        spec.validate()?;
        let channels = spec.in_channels;
        let mut rng = rng_from_optional(spec.seed, "lip-nn/cayley_conv_ed2/init");
        let core = SpectralCore::new(spec, channels, channels, CayleyMode::Endomorphism, &mut rng)?;
        let frame_rng = rng_from_optional(
            spec.seed.map(|seed| seed ^ FRAME_SEED_OFFSET),
            "lip-nn/cayley_conv_ed2/frame",
        );
        Ok(Self {
            core,
            bias: Parameter::new(spec.param_name("bias"), Tensor::zeros(1, spec.out_channels)?),
            out_channels: spec.out_channels,
            frame_config: FrameConfig::default(),
            frame: RefCell::new(None),
            frame_rng: RefCell::new(frame_rng),
        })
    }

    pub fn with_frame_config(mut self, config: FrameConfig) -> Self {
        self.frame_config = config;
        self
    }

    pub fn weight(&self) -> &Parameter {
        &self.core.weight
    }

    pub fn bias(&self) -> &Parameter {
        &self.bias
    }

    pub fn alpha(&self) -> Option<f32> {
        self.core.alpha_value()
    }

    pub fn frame(&self) -> Option<Rc<Tensor>> {
        self.frame.borrow().as_ref().map(|(_, frame)| Rc::clone(frame))
    }

    fn frame_for(&self) -> PureResult<Rc<Tensor>> {
        let key = (self.out_channels, self.core.in_channels);
        let mut slot = self.frame.borrow_mut();
        match slot.as_ref() {
            Some((cached, frame)) if *cached == key => return Ok(Rc::clone(frame)),
            Some((cached, _)) => {
                warn!(layer = %self.core.name, ?cached, ?key, "regenerating spatial frame for a new shape")
            }
            None => debug!(layer = %self.core.name, ?key, "generating spatial frame"),
        }
        let frame = Rc::new(spatial_frame(
            self.out_channels,
            self.core.in_channels,
            &self.frame_config,
            &mut self.frame_rng.borrow_mut(),
        )?);
        *slot = Some((key, Rc::clone(&frame)));
        Ok(frame)
    }
}

/// `y[b, o] = Σ_c mix[o, c] · x[b, c]` over whole channel planes.
fn channel_mix(mix: &Tensor, input: &Tensor, channels: usize) -> PureResult<Tensor> {
    let (batch, cols) = input.shape();
    let (out, inner) = mix.shape();
    if inner != channels || cols % channels != 0 {
        return Err(TensorError::ShapeMismatch {
            left: mix.shape(),
            right: (out, channels),
        });
    }
    let plane = cols / channels;
    let mut output = Tensor::zeros(batch, out * plane)?;
    {
        let data = output.data_mut();
        for b in 0..batch {
            let planes = Tensor::from_vec(channels, plane, input.row(b)?.to_vec())?;
            let mixed = mix.matmul(&planes)?;
            data[b * out * plane..(b + 1) * out * plane].copy_from_slice(mixed.data());
        }
    }
    Ok(output)
}

impl StridableConv for CayleyConvEd2 {
    fn from_spec(spec: &ConvSpec) -> PureResult<Self> {
        CayleyConvEd2::new(spec)
    }
}

impl Module for CayleyConvEd2 {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let pass = self.core.pass(input)?;
        let rotated = pass.plan.synthesize(&pass.q.matmul(&pass.activations)?)?;
        let frame = self.frame_for()?;
        let mut output = channel_mix(&frame, &rotated, self.core.in_channels)?;
        output.add_channel_bias_inplace(self.bias.value().data())?;
        Ok(output)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        self.core.check_grad(input, grad_output, self.out_channels)?;
        let pass = self.core.pass(input)?;
        let frame = self.frame_for()?;
        let grad_rotated = channel_mix(&frame.transpose(), grad_output, self.out_channels)?;
        let grad_y = pass.plan.synthesize_adjoint(&grad_rotated, self.core.in_channels)?;
        let grad_x = pass.q.conj_transpose().matmul(&grad_y)?;
        let grad_q = grad_y.matmul(&pass.activations.conj_transpose())?;
        self.core.accumulate(&pass, &grad_q)?;
        self.bias
            .accumulate_euclidean(&bias_gradient(grad_output, self.out_channels)?)?;
        pass.plan.embed_activations_adjoint(&grad_x)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.core.visit(visitor)?;
        visitor(&self.bias)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.core.visit_mut(visitor)?;
        visitor(&mut self.bias)
    }

    fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> PureResult<()> {
        self.core.restore_alpha(state)?;
        load_parameters(self, state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(in_channels: usize, out_channels: usize, kernel: usize) -> ConvSpec {
        ConvSpec::new("spectral", in_channels, out_channels, kernel).with_seed(17)
    }

    #[test]
    fn zero_input_returns_bias() {
        let conv = CayleyConv::new(&spec(4, 4, 3)).unwrap();
        let output = conv.forward(&Tensor::zeros(1, 4 * 64).unwrap()).unwrap();
        assert_eq!(output.shape(), (1, 4 * 64));
        let bias = conv.bias().unwrap().value().data().to_vec();
        for (idx, value) in output.data().iter().enumerate() {
            assert!((value - bias[idx / 64]).abs() < 1e-5);
        }
    }

    #[test]
    fn alpha_is_created_once() {
        let conv = CayleyConv::new(&spec(2, 3, 3)).unwrap();
        assert!(conv.alpha().is_none());
        assert_eq!(conv.state_dict().unwrap().len(), 2);
        let input = Tensor::random_uniform(2, 2 * 16, -1.0, 1.0, Some(1)).unwrap();
        conv.forward(&input).unwrap();
        let alpha = conv.alpha().unwrap();
        assert!(alpha > 0.0);
        let larger = Tensor::random_uniform(1, 2 * 36, -1.0, 1.0, Some(2)).unwrap();
        conv.forward(&larger).unwrap();
        assert_eq!(conv.alpha(), Some(alpha));
        assert!(conv.state_dict().unwrap().contains_key("spectral::alpha"));
    }

    #[test]
    fn plan_follows_input_size() {
        let conv = CayleyConv::new(&spec(1, 1, 3)).unwrap();
        assert_eq!(conv.cached_size(), None);
        conv.forward(&Tensor::zeros(1, 16).unwrap()).unwrap();
        assert_eq!(conv.cached_size(), Some(4));
        let output = conv.forward(&Tensor::zeros(2, 25).unwrap()).unwrap();
        assert_eq!(output.shape(), (2, 25));
        assert_eq!(conv.cached_size(), Some(5));
    }

    #[test]
    fn rejects_non_square_inputs() {
        let conv = CayleyConv::new(&spec(2, 2, 1)).unwrap();
        assert!(matches!(
            conv.forward(&Tensor::zeros(1, 2 * 12).unwrap()),
            Err(TensorError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn striding_halves_ed_kernels_once() {
        use crate::layers::strided::StridedConv;

        let ed = StridedConv::<CayleyConvEd>::new(spec(2, 3, 5).with_stride(2)).unwrap();
        assert_eq!(ed.inner_spec().kernel_size, 2);
        assert_eq!(ed.inner().weight().value().shape(), (8, 8 * 2 * 2));

        let ed2 = StridedConv::<CayleyConvEd2>::new(spec(2, 3, 5).with_stride(2)).unwrap();
        assert_eq!(ed2.inner_spec().kernel_size, 2);
        assert_eq!(ed2.inner().weight().value().shape(), (8, 8 * 2 * 2));
    }

    #[test]
    fn rejects_kernels_wider_than_input() {
        let conv = CayleyConv::new(&spec(1, 1, 5)).unwrap();
        assert!(matches!(
            conv.forward(&Tensor::zeros(1, 9).unwrap()),
            Err(TensorError::InvalidDimensions { .. })
        ));
    }

    #[test]
    fn square_layer_never_expands_norm() {
        let conv = CayleyConv::new(&spec(3, 3, 3).with_bias(false)).unwrap();
        let input = Tensor::random_uniform(2, 3 * 25, -1.0, 1.0, Some(3)).unwrap();
        let output = conv.forward(&input).unwrap();
        let ratio = output.l2_norm() / input.l2_norm();
        assert!(ratio <= 1.0 + 1e-4, "{ratio}");
    }

    #[test]
    fn ed_maps_channels_through_frame() {
        let config = FrameConfig {
            steps: 5,
            learning_rate: 0.1,
        };
        let conv = CayleyConvEd::new(&spec(2, 4, 3)).unwrap().with_frame_config(config);
        assert!(conv.frame().is_none());
        let input = Tensor::random_uniform(3, 2 * 16, -1.0, 1.0, Some(4)).unwrap();
        let output = conv.forward(&input).unwrap();
        assert_eq!(output.shape(), (3, 4 * 16));
        let frame = conv.frame().unwrap();
        assert_eq!(frame.dims(), (4 * 3, 4, 2));
        // same size reuses the frame
        conv.forward(&input).unwrap();
        assert!(Rc::ptr_eq(&frame, &conv.frame().unwrap()));
        // a new size regenerates it
        conv.forward(&Tensor::zeros(1, 2 * 36).unwrap()).unwrap();
        assert_eq!(conv.frame().unwrap().dims(), (6 * 4, 4, 2));
    }

    #[test]
    fn ed2_mixes_channels_spatially() {
        let config = FrameConfig {
            steps: 5,
            learning_rate: 0.1,
        };
        let conv = CayleyConvEd2::new(&spec(3, 2, 3)).unwrap().with_frame_config(config);
        let input = Tensor::random_uniform(2, 3 * 16, -1.0, 1.0, Some(6)).unwrap();
        let output = conv.forward(&input).unwrap();
        assert_eq!(output.shape(), (2, 2 * 16));
        assert_eq!(conv.frame().unwrap().shape(), (2, 3));
        assert_eq!(conv.bias().value().data(), &[0.0, 0.0]);
    }

    #[test]
    fn channel_mix_matches_manual_sum() {
        let mix = Tensor::from_vec(1, 2, vec![2.0, -1.0]).unwrap();
        let input = Tensor::from_vec(1, 4, vec![1.0, 2.0, 3.0, 5.0]).unwrap();
        let output = channel_mix(&mix, &input, 2).unwrap();
        assert_eq!(output.data(), &[-1.0, -1.0]);
    }

    #[test]
    fn load_state_dict_materialises_alpha() {
        let trained = CayleyConv::new(&spec(2, 2, 3)).unwrap();
        trained
            .forward(&Tensor::random_uniform(1, 2 * 16, -1.0, 1.0, Some(7)).unwrap())
            .unwrap();
        let state = trained.state_dict().unwrap();
        let mut fresh = CayleyConv::new(&spec(2, 2, 3).with_seed(99)).unwrap();
        fresh.load_state_dict(&state).unwrap();
        assert_eq!(fresh.alpha(), trained.alpha());
        assert_eq!(fresh.state_dict().unwrap(), state);
    }
}
