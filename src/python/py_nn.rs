//! Weight export for visualisation.

use std::collections::BTreeMap;

use numpy::{PyArray1, PyArrayDyn, PyArrayMethods};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

use crate::training::{Checkpoint, DirectoryStore};

use super::py_core::checkpoint_err;

/// Every tensor of a checkpoint as a numpy array of its stored shape.
pub(crate) fn tensors_to_numpy<'py>(
    py: Python<'py>,
    checkpoint: &Checkpoint,
) -> PyResult<BTreeMap<String, Bound<'py, PyArrayDyn<f64>>>> {
    checkpoint
        .tensors
        .iter()
        .map(|(name, tensor)| {
            let array = PyArray1::from_slice_bound(py, &tensor.data)
                .reshape(tensor.shape.clone())
                .map_err(|e| PyValueError::new_err(format!("{name}: {e}")))?;
            Ok((name.clone(), array))
        })
        .collect()
}

/// Load the checkpoint folder at `path` and return its tensors.
#[pyfunction]
pub fn agent_weights<'py>(
    py: Python<'py>,
    path: &str,
) -> PyResult<BTreeMap<String, Bound<'py, PyArrayDyn<f64>>>> {
    let checkpoint = DirectoryStore::read_path(path).map_err(checkpoint_err)?;
    tensors_to_numpy(py, &checkpoint)
}
