// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Checkpoint persistence for anything implementing [`Module`].
//!
//! Snapshots are keyed by parameter name, so lazily created parameters (the
//! spectral `alpha`) round-trip as soon as they exist.

use crate::module::Module;
use lip_tensor::{PureResult, Tensor, TensorError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredTensor {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl StoredTensor {
    fn from_tensor(tensor: &Tensor) -> StoredTensor {
        let (rows, cols) = tensor.shape();
        StoredTensor {
            rows,
            cols,
            data: tensor.data().to_vec(),
        }
    }

    fn into_tensor(self) -> PureResult<Tensor> {
        Tensor::from_vec(self.rows, self.cols, self.data)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ModuleSnapshot {
    parameters: HashMap<String, StoredTensor>,
}

fn snapshot_from_state(state: &HashMap<String, Tensor>) -> ModuleSnapshot {
    let parameters = state
        .iter()
        .map(|(name, tensor)| (name.clone(), StoredTensor::from_tensor(tensor)))
        .collect();
    ModuleSnapshot { parameters }
}

fn from_snapshot(snapshot: ModuleSnapshot) -> PureResult<HashMap<String, Tensor>> {
    let mut state = HashMap::with_capacity(snapshot.parameters.len());
    for (name, tensor) in snapshot.parameters {
        state.insert(name, tensor.into_tensor()?);
    }
    Ok(state)
}

fn io_error(err: std::io::Error) -> TensorError {
    TensorError::IoError {
        message: err.to_string(),
    }
}

fn serde_error(err: impl ToString) -> TensorError {
    TensorError::SerializationError {
        message: err.to_string(),
    }
}

/// Writes the module parameters as pretty-printed JSON.
pub fn save_json<M: Module + ?Sized, P: AsRef<Path>>(module: &M, path: P) -> PureResult<()> {
    save_state_dict_json(&module.state_dict()?, path)
}

/// Restores module parameters from a JSON checkpoint.
pub fn load_json<M: Module + ?Sized, P: AsRef<Path>>(module: &mut M, path: P) -> PureResult<()> {
    let state = load_state_dict_json(path)?;
    module.load_state_dict(&state)
}

pub fn save_state_dict_json<P: AsRef<Path>>(
    state: &HashMap<String, Tensor>,
    path: P,
) -> PureResult<()> {
    let snapshot = snapshot_from_state(state);
    let file = File::create(path.as_ref()).map_err(io_error)?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, &snapshot).map_err(serde_error)?;
    Ok(())
}

pub fn load_state_dict_json<P: AsRef<Path>>(path: P) -> PureResult<HashMap<String, Tensor>> {
    let file = File::open(path.as_ref()).map_err(io_error)?;
    let reader = BufReader::new(file);
    let snapshot: ModuleSnapshot = serde_json::from_reader(reader).map_err(serde_error)?;
    from_snapshot(snapshot)
}

/// Writes the module parameters in the compact bincode format.
pub fn save_bincode<M: Module + ?Sized, P: AsRef<Path>>(module: &M, path: P) -> PureResult<()> {
    save_state_dict_bincode(&module.state_dict()?, path)
}

/// Restores module parameters from a bincode checkpoint.
pub fn load_bincode<M: Module + ?Sized, P: AsRef<Path>>(
    module: &mut M,
    path: P,
) -> PureResult<()> {
    let state = load_state_dict_bincode(path)?;
    module.load_state_dict(&state)
}

pub fn save_state_dict_bincode<P: AsRef<Path>>(
    state: &HashMap<String, Tensor>,
    path: P,
) -> PureResult<()> {
    let snapshot = snapshot_from_state(state);
    let file = File::create(path.as_ref()).map_err(io_error)?;
    let writer = BufWriter::new(file);
    bincode::serialize_into(writer, &snapshot).map_err(serde_error)?;
    Ok(())
}

pub fn load_state_dict_bincode<P: AsRef<Path>>(path: P) -> PureResult<HashMap<String, Tensor>> {
    let file = File::open(path.as_ref()).map_err(io_error)?;
    let reader = BufReader::new(file);
    let snapshot: ModuleSnapshot = bincode::deserialize_from(reader).map_err(serde_error)?;
    from_snapshot(snapshot)
}
