//! Training service bindings for Python.

use std::sync::Arc;

use numpy::PyArrayDyn;
use pyo3::prelude::*;
use std::collections::BTreeMap;

use crate::agents::{load_agent, AgentConfig};
use crate::core::{MatchResult, ServiceError, TickRecord, TickRequest, TickResponse};
use crate::protocol::TrainingService;
use crate::training::{
    Checkpoint, CheckpointStore, DirectoryStore, EvaluationSession, SelfPlayConfig,
    SelfPlaySession, SessionConfig, SessionControl, SingleAgentSession,
};

use super::py_core::{checkpoint_err, config_err, service_err, AnyRecord};
use super::py_nn::tensors_to_numpy;

#[derive(Clone)]
enum ServiceHandle {
    Single(TrainingService<SingleAgentSession>),
    SelfPlay(TrainingService<SelfPlaySession>),
    Evaluation(TrainingService<EvaluationSession>),
}

impl ServiceHandle {
    fn tick(&self, request: &TickRequest) -> Result<TickResponse, ServiceError> {
        match self {
            ServiceHandle::Single(s) => s.tick(request),
            ServiceHandle::SelfPlay(s) => s.tick(request),
            ServiceHandle::Evaluation(s) => s.tick(request),
        }
    }

    fn match_result(&self, result: MatchResult) -> Result<SessionControl, ServiceError> {
        match self {
            ServiceHandle::Single(s) => s.match_result(result),
            ServiceHandle::SelfPlay(s) => s.match_result(result),
            ServiceHandle::Evaluation(s) => s.match_result(result),
        }
    }

    fn shutdown(&self) -> Result<(), ServiceError> {
        match self {
            ServiceHandle::Single(s) => s.shutdown(),
            ServiceHandle::SelfPlay(s) => s.shutdown(),
            ServiceHandle::Evaluation(s) => s.shutdown(),
        }
    }

    fn is_stopped(&self) -> bool {
        match self {
            ServiceHandle::Single(s) => s.is_stopped(),
            ServiceHandle::SelfPlay(s) => s.is_stopped(),
            ServiceHandle::Evaluation(s) => s.is_stopped(),
        }
    }

    /// Snapshot of the learning agent.
    fn snapshot(&self) -> Result<Checkpoint, ServiceError> {
        let checkpoint = match self {
            ServiceHandle::Single(s) => s.with_session(|s| s.agent().save())?,
            ServiceHandle::SelfPlay(s) => s.with_session(|s| s.learner().save())?,
            ServiceHandle::Evaluation(s) => s.with_session(|s| s.agent().save())?,
        };
        Ok(checkpoint?)
    }
}

fn open_store(checkpoint_dir: &str) -> PyResult<Arc<dyn CheckpointStore>> {
    Ok(Arc::new(DirectoryStore::open(checkpoint_dir).map_err(checkpoint_err)?))
}

/// Python handle on a running training or evaluation session.
#[pyclass(name = "TrainingService")]
pub struct PyTrainingService {
    inner: ServiceHandle,
}

#[pymethods]
impl PyTrainingService {
    /// One learner against the environment's scripted enemy.
    ///
    /// # Arguments
    /// - agent_config: JSON agent config, e.g. `{"agent": "q_table", "bins": 7}`
    /// - checkpoint_dir: root folder; snapshots go to `<dir>/agents/<timestamp>`
    /// - checkpoint_every_ticks: periodic save interval (default: 20000)
    /// - max_iterations: stop after this many training ticks (default: never)
    #[staticmethod]
    #[pyo3(signature = (agent_config, checkpoint_dir, checkpoint_every_ticks = 20_000, max_iterations = None))]
    fn single_agent(
        agent_config: &str,
        checkpoint_dir: &str,
        checkpoint_every_ticks: u64,
        max_iterations: Option<u64>,
    ) -> PyResult<Self> {
        let agent = AgentConfig::from_json_str(agent_config).map_err(config_err)?;
        let mut config = SessionConfig::default().with_checkpoint_every(checkpoint_every_ticks);
        config.max_iterations = max_iterations;
        let session = SingleAgentSession::from_config(&agent, open_store(checkpoint_dir)?, config)
            .map_err(service_err)?;
        Ok(Self {
            inner: ServiceHandle::Single(TrainingService::new(session)),
        })
    }

    /// The learner (player 0) against snapshots of itself (player 1).
    #[staticmethod]
    #[pyo3(signature = (agent_config, checkpoint_dir, past_play_ratio = 0.2, max_iterations = None, seed = 7))]
    fn self_play(
        agent_config: &str,
        checkpoint_dir: &str,
        past_play_ratio: f64,
        max_iterations: Option<u64>,
        seed: u64,
    ) -> PyResult<Self> {
        let agent = AgentConfig::from_json_str(agent_config).map_err(config_err)?;
        let mut config = SelfPlayConfig::default()
            .with_past_play_ratio(past_play_ratio)
            .with_seed(seed);
        config.max_iterations = max_iterations;
        let session = SelfPlaySession::from_config(&agent, open_store(checkpoint_dir)?, config)
            .map_err(service_err)?;
        Ok(Self {
            inner: ServiceHandle::SelfPlay(TrainingService::new(session)),
        })
    }

    /// Play `matches` games with a saved agent, without learning.
    #[staticmethod]
    #[pyo3(signature = (checkpoint_path, matches = 100))]
    fn evaluate(checkpoint_path: &str, matches: u64) -> PyResult<Self> {
        let checkpoint = DirectoryStore::read_path(checkpoint_path).map_err(checkpoint_err)?;
        let agent = load_agent(&checkpoint).map_err(checkpoint_err)?;
        Ok(Self {
            inner: ServiceHandle::Evaluation(TrainingService::new(EvaluationSession::new(
                agent, matches,
            ))),
        })
    }

    /// Handle one tick. Returns one action per record, or `None` when the
    /// tick ended the episode.
    fn env_callback(
        &self,
        py: Python<'_>,
        player_id: i32,
        records: Vec<AnyRecord>,
    ) -> PyResult<Option<Vec<usize>>> {
        let request = TickRequest::new(
            player_id,
            records.into_iter().map(TickRecord::from).collect(),
        );
        let inner = self.inner.clone();
        let response = py
            .allow_threads(move || inner.tick(&request))
            .map_err(service_err)?;
        Ok(response.actions().map(|a| a.to_vec()))
    }

    /// Report a finished match. Returns `True` when training should stop.
    fn winner_callback(&self, player_id: i32, winner: i32) -> PyResult<bool> {
        let control = self
            .inner
            .match_result(MatchResult::new(player_id, winner))
            .map_err(service_err)?;
        Ok(control == SessionControl::Stop)
    }

    /// Wait for the current tick, then write pending checkpoints.
    fn shutdown(&self, py: Python<'_>) -> PyResult<()> {
        let inner = self.inner.clone();
        py.allow_threads(move || inner.shutdown()).map_err(service_err)
    }

    #[getter]
    fn stopped(&self) -> bool {
        self.inner.is_stopped()
    }

    /// The learning agent's tensors, keyed by name.
    fn weights<'py>(
        &self,
        py: Python<'py>,
    ) -> PyResult<BTreeMap<String, Bound<'py, PyArrayDyn<f64>>>> {
        let checkpoint = self.inner.snapshot().map_err(service_err)?;
        tensors_to_numpy(py, &checkpoint)
    }

    fn __repr__(&self) -> String {
        let kind = match &self.inner {
            ServiceHandle::Single(_) => "single_agent",
            ServiceHandle::SelfPlay(_) => "self_play",
            ServiceHandle::Evaluation(_) => "evaluate",
        };
        format!("TrainingService(kind={kind}, stopped={})", self.inner.is_stopped())
    }
}
