// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use lip_nn::{
    load_bincode, load_json, save_bincode, save_json, CayleyConv, CayleyConvEd2, CayleyLinear,
    ConvSpec, GroupSort, Loss, MeanSquaredError, Module, StridedConv, Tensor,
};
use tempfile::tempdir;

fn mse(prediction: &Tensor, target: &Tensor) -> f32 {
    MeanSquaredError::new().forward(prediction, target).unwrap().data()[0]
}

#[test]
fn sgd_steps_reduce_the_loss_of_a_small_network() {
    let mut conv = CayleyConv::new(&ConvSpec::new("conv", 2, 4, 3).with_seed(1)).unwrap();
    let mut act = GroupSort::new(4);
    let mut head = CayleyLinear::new("head", 4 * 16, 3, true, Some(2)).unwrap();
    let mut loss = MeanSquaredError::new();

    let input = Tensor::random_uniform(4, 2 * 16, -1.0, 1.0, Some(3)).unwrap();
    let target = Tensor::random_uniform(4, 3, -0.5, 0.5, Some(4)).unwrap();

    let mut history = Vec::new();
    for _ in 0..15 {
        let h1 = conv.forward(&input).unwrap();
        let h2 = act.forward(&h1).unwrap();
        let out = head.forward(&h2).unwrap();
        history.push(mse(&out, &target));

        let grad = loss.backward(&out, &target).unwrap();
        let grad = head.backward(&h2, &grad).unwrap();
        let grad = act.backward(&h1, &grad).unwrap();
        conv.backward(&input, &grad).unwrap();

        conv.apply_step(0.05).unwrap();
        head.apply_step(0.05).unwrap();
        conv.zero_accumulators().unwrap();
        head.zero_accumulators().unwrap();
    }
    let first = history[0];
    let last = history[history.len() - 1];
    assert!(last < first, "loss went from {first} to {last}");
}

#[test]
fn json_checkpoint_restores_alpha_and_outputs() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("conv.json");
    let spec = ConvSpec::new("conv", 3, 3, 3).with_seed(5);
    let trained = CayleyConv::new(&spec).unwrap();
    let input = Tensor::random_uniform(2, 3 * 64, -1.0, 1.0, Some(6)).unwrap();
    let expected = trained.forward(&input).unwrap();
    let alpha = trained.alpha().unwrap();
    save_json(&trained, &path).unwrap();

    let mut fresh = CayleyConv::new(&spec.clone().with_seed(50)).unwrap();
    assert!(fresh.alpha().is_none());
    load_json(&mut fresh, &path).unwrap();
    assert_eq!(fresh.alpha(), Some(alpha));
    let restored = fresh.forward(&input).unwrap();
    assert!(restored.max_abs_diff(&expected).unwrap() < 1e-5);
}

#[test]
fn checkpoint_without_alpha_resets_it() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("untouched.bin");
    let spec = ConvSpec::new("conv", 2, 2, 3).with_seed(7);
    let untouched = CayleyConv::new(&spec).unwrap();
    save_bincode(&untouched, &path).unwrap();

    let mut used = CayleyConv::new(&spec).unwrap();
    used.forward(&Tensor::random_uniform(1, 2 * 16, -1.0, 1.0, Some(8)).unwrap())
        .unwrap();
    assert!(used.alpha().is_some());
    load_bincode(&mut used, &path).unwrap();
    assert!(used.alpha().is_none());
}

#[test]
fn strided_and_framed_layers_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("stack.bin");
    let spec = ConvSpec::new("ed2", 2, 3, 4).with_stride(2).with_seed(9);
    let layer = StridedConv::<CayleyConvEd2>::new(spec.clone()).unwrap();
    let input = Tensor::random_uniform(1, 2 * 36, -1.0, 1.0, Some(10)).unwrap();
    layer.forward(&input).unwrap();
    save_bincode(&layer, &path).unwrap();

    let mut restored = StridedConv::<CayleyConvEd2>::new(spec.with_seed(90)).unwrap();
    load_bincode(&mut restored, &path).unwrap();
    assert_eq!(restored.inner().alpha(), layer.inner().alpha());
    assert_eq!(
        restored.state_dict().unwrap().len(),
        layer.state_dict().unwrap().len()
    );
}

#[test]
fn eval_mode_reuses_the_orthogonal_weight() {
    let layer = CayleyLinear::new("fc", 6, 4, false, Some(11)).unwrap();
    let input = Tensor::random_uniform(2, 6, -1.0, 1.0, Some(12)).unwrap();
    assert!(layer.is_training());
    layer.eval();
    assert!(!layer.is_training());
    let first = layer.forward(&input).unwrap();
    assert!(layer.has_cached_weight());
    let second = layer.forward(&input).unwrap();
    assert_eq!(first.data(), second.data());
    layer.train();
    assert!(layer.is_training());
    assert!(!layer.has_cached_weight());
}
