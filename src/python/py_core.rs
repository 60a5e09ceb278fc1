//! Wire-type conversions and error mapping for Python.

use pyo3::exceptions::{PyIOError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;

use crate::core::{CheckpointError, ConfigError, ServiceError, TickRecord};

/// A unit record as sent by the transport: a dict with `unit_id`, `state`
/// and `last_action_reward` keys.
#[derive(FromPyObject)]
#[pyo3(from_item_all)]
pub struct RecordDict {
    pub unit_id: i64,
    pub state: Vec<f64>,
    pub last_action_reward: f64,
}

impl From<RecordDict> for TickRecord {
    fn from(record: RecordDict) -> Self {
        TickRecord::new(record.unit_id, record.state, record.last_action_reward)
    }
}

/// Python wrapper for TickRecord, for callers that build records in Python.
#[pyclass(name = "TickRecord")]
#[derive(Clone, Debug)]
pub struct PyTickRecord(pub TickRecord);

#[pymethods]
impl PyTickRecord {
    #[new]
    #[pyo3(signature = (unit_id, state, last_action_reward = 0.0))]
    fn new(unit_id: i64, state: Vec<f64>, last_action_reward: f64) -> Self {
        Self(TickRecord::new(unit_id, state, last_action_reward))
    }

    #[getter]
    fn unit_id(&self) -> i64 {
        self.0.unit_id
    }

    #[getter]
    fn state(&self) -> Vec<f64> {
        self.0.state.clone()
    }

    #[getter]
    fn last_action_reward(&self) -> f64 {
        self.0.last_action_reward
    }

    fn is_terminal(&self) -> bool {
        self.0.state.is_empty()
    }

    fn __repr__(&self) -> String {
        format!(
            "TickRecord(unit_id={}, features={}, reward={})",
            self.0.unit_id,
            self.0.state.len(),
            self.0.last_action_reward
        )
    }
}

/// Either form the transport may pass for one record.
#[derive(FromPyObject)]
pub enum AnyRecord {
    Wrapped(PyTickRecord),
    Dict(RecordDict),
}

impl From<AnyRecord> for TickRecord {
    fn from(record: AnyRecord) -> Self {
        match record {
            AnyRecord::Wrapped(r) => r.0,
            AnyRecord::Dict(d) => d.into(),
        }
    }
}

pub(crate) fn service_err(err: ServiceError) -> PyErr {
    match err {
        ServiceError::Protocol(e) => PyValueError::new_err(e.to_string()),
        ServiceError::Config(e) => config_err(e),
        ServiceError::Checkpoint(e) => checkpoint_err(e),
        e @ (ServiceError::ShuttingDown | ServiceError::Poisoned) => {
            PyRuntimeError::new_err(e.to_string())
        }
    }
}

pub(crate) fn checkpoint_err(err: CheckpointError) -> PyErr {
    match err {
        CheckpointError::Io(e) => PyIOError::new_err(e.to_string()),
        e => PyValueError::new_err(e.to_string()),
    }
}

pub(crate) fn config_err(err: ConfigError) -> PyErr {
    PyValueError::new_err(err.to_string())
}
