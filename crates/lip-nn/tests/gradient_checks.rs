// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::collections::HashMap;

use lip_nn::{
    CayleyConv, CayleyConvEd, CayleyConvEd2, CayleyLinear, ConvSpec, FrameConfig, Module, Ossn,
    PlainConv, Rko, StridedConv, Tensor,
};

const EPS: f32 = 5e-3;

fn probe_loss<M: Module>(layer: &M, input: &Tensor, probe: &Tensor) -> f32 {
    let output = layer.forward(input).unwrap();
    output
        .data()
        .iter()
        .zip(probe.data().iter())
        .map(|(a, b)| a * b)
        .sum()
}

fn assert_close(label: &str, numeric: f32, analytic: f32) {
    assert!(
        (numeric - analytic).abs() <= 2e-2 * (1.0 + numeric.abs()),
        "{label}: numeric {numeric} vs analytic {analytic}"
    );
}

fn perturb<M: Module>(layer: &mut M, name: &str, index: usize, delta: f32) {
    layer
        .visit_parameters_mut(&mut |param| {
            if param.name() == name {
                param.value_mut().data_mut()[index] += delta;
            }
            Ok(())
        })
        .unwrap();
}

/// Compares `backward` against central differences of `<forward(x), probe>`
/// for the input and for a few entries of every parameter.
fn check_gradients<M: Module>(layer: &mut M, input: &Tensor, out_cols: usize) {
    let batch = input.shape().0;
    let probe = Tensor::random_uniform(batch, out_cols, -1.0, 1.0, Some(77)).unwrap();
    layer.forward(input).unwrap();
    layer.zero_accumulators().unwrap();
    let grad_input = layer.backward(input, &probe).unwrap();

    let mut grads: HashMap<String, Tensor> = HashMap::new();
    layer
        .visit_parameters(&mut |param| {
            let grad = param.gradient().cloned().unwrap_or_else(|| {
                let (rows, cols) = param.value().shape();
                Tensor::zeros(rows, cols).unwrap()
            });
            grads.insert(param.name().to_string(), grad);
            Ok(())
        })
        .unwrap();
    assert!(!grads.is_empty());

    for (name, grad) in &grads {
        let len = grad.len();
        for index in [0, len / 2, len - 1] {
            perturb(layer, name, index, EPS);
            let up = probe_loss(layer, input, &probe);
            perturb(layer, name, index, -2.0 * EPS);
            let down = probe_loss(layer, input, &probe);
            perturb(layer, name, index, EPS);
            let numeric = (up - down) / (2.0 * EPS);
            assert_close(&format!("{name}[{index}]"), numeric, grad.data()[index]);
        }
    }

    let len = input.len();
    for index in [1, len / 3, len - 2] {
        let mut up = input.clone();
        up.data_mut()[index] += EPS;
        let mut down = input.clone();
        down.data_mut()[index] -= EPS;
        let numeric =
            (probe_loss(layer, &up, &probe) - probe_loss(layer, &down, &probe)) / (2.0 * EPS);
        assert_close(&format!("input[{index}]"), numeric, grad_input.data()[index]);
    }
}

fn small_frames() -> FrameConfig {
    FrameConfig {
        steps: 5,
        learning_rate: 0.1,
    }
}

#[test]
fn cayley_conv_gradients() {
    let spec = ConvSpec::new("conv", 2, 3, 3).with_seed(1);
    let mut layer = CayleyConv::new(&spec).unwrap();
    let input = Tensor::random_uniform(2, 2 * 16, -1.0, 1.0, Some(2)).unwrap();
    check_gradients(&mut layer, &input, 3 * 16);
}

#[test]
fn cayley_conv_even_kernel_gradients() {
    let spec = ConvSpec::new("conv", 3, 2, 2).with_seed(4);
    let mut layer = CayleyConv::new(&spec).unwrap();
    let input = Tensor::random_uniform(1, 3 * 25, -1.0, 1.0, Some(3)).unwrap();
    check_gradients(&mut layer, &input, 2 * 25);
}

#[test]
fn cayley_conv_ed_gradients() {
    let spec = ConvSpec::new("ed", 2, 3, 3).with_seed(5);
    let mut layer = CayleyConvEd::new(&spec)
        .unwrap()
        .with_frame_config(small_frames());
    let input = Tensor::random_uniform(2, 2 * 16, -1.0, 1.0, Some(6)).unwrap();
    check_gradients(&mut layer, &input, 3 * 16);
}

#[test]
fn cayley_conv_ed2_gradients() {
    let spec = ConvSpec::new("ed2", 3, 2, 3).with_seed(7);
    let mut layer = CayleyConvEd2::new(&spec)
        .unwrap()
        .with_frame_config(small_frames());
    let input = Tensor::random_uniform(2, 3 * 16, -1.0, 1.0, Some(8)).unwrap();
    check_gradients(&mut layer, &input, 2 * 16);
}

#[test]
fn cayley_linear_gradients() {
    for (inp, out) in [(5usize, 3usize), (3, 5), (4, 4)] {
        let mut layer = CayleyLinear::new("fc", inp, out, true, Some(9)).unwrap();
        let input = Tensor::random_uniform(3, inp, -1.0, 1.0, Some(10)).unwrap();
        check_gradients(&mut layer, &input, out);
    }
}

#[test]
fn strided_conv_gradients() {
    let spec = ConvSpec::new("down", 2, 3, 3).with_stride(2).with_seed(11);
    let mut layer = StridedConv::<CayleyConv>::new(spec).unwrap();
    let input = Tensor::random_uniform(1, 2 * 36, -1.0, 1.0, Some(12)).unwrap();
    check_gradients(&mut layer, &input, 3 * 9);
}

#[test]
fn reshaped_kernel_gradients() {
    let spec = ConvSpec::new("ossn", 2, 3, 3).with_padding(1).with_seed(13);
    let mut ossn = Ossn::new(&spec).unwrap();
    let input = Tensor::random_uniform(2, 2 * 16, -1.0, 1.0, Some(14)).unwrap();
    check_gradients(&mut ossn, &input, 3 * 16);

    let spec = ConvSpec::new("rko", 2, 3, 3).with_padding(1).with_seed(15);
    let mut rko = Rko::new(&spec).unwrap();
    check_gradients(&mut rko, &input, 3 * 16);
}

#[test]
fn plain_conv_gradients() {
    for kernel in [1usize, 2, 3] {
        let spec = ConvSpec::new("plain", 2, 2, kernel).with_seed(16);
        let mut layer = PlainConv::new(&spec).unwrap();
        let input = Tensor::random_uniform(2, 2 * 16, -1.0, 1.0, Some(17)).unwrap();
        check_gradients(&mut layer, &input, 2 * 16);
    }
}
