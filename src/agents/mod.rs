//! Learning agents.
//!
//! Every algorithm implements [`Agent`], the capability interface the
//! [`EpisodeProtocol`](crate::protocol::EpisodeProtocol) drives:
//!
//! - **QTableAgent**: dense discretized value table, epsilon-greedy or
//!   count-based optimistic exploration, optional reward sharing
//! - **CrossEntropyAgent**: population of sampled networks, elite refit
//! - **PolicyGradientAgent**: two-layer softmax policy trained with REINFORCE
//! - **RandomAgent**: uniform baseline
//!
//! Agents are built from an [`AgentConfig`] (usually parsed from JSON) or
//! rebuilt from a [`Checkpoint`] with [`load_agent`].
//!
//! ```
//! use sepia_rl::agents::{build_agent, AgentConfig, AgentKind};
//!
//! let config = AgentConfig::from_json_str(r#"{"agent": "random", "actions": 5}"#).unwrap();
//! let agent = build_agent(&config).unwrap();
//! assert_eq!(agent.kind(), AgentKind::Random);
//! ```

pub mod cross_entropy;
pub mod policy_gradient;
pub mod q_table;
pub mod random;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::{ActionList, CheckpointError, ConfigError, ProtocolError};
use crate::nn::{NormalizerConfig, OnlineNormalizer};
use crate::protocol::UnitStep;
use crate::training::Checkpoint;

pub use cross_entropy::{CrossEntropyAgent, CrossEntropyConfig};
pub use policy_gradient::{PolicyGradientAgent, PolicyGradientConfig};
pub use q_table::{CountExploration, QTableAgent, QTableConfig};
pub use random::{RandomAgent, RandomConfig};

/// Which algorithm an agent or checkpoint belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    QTable,
    CrossEntropy,
    PolicyGradient,
    Random,
}

impl AgentKind {
    pub fn name(self) -> &'static str {
        match self {
            AgentKind::QTable => "q_table",
            AgentKind::CrossEntropy => "cross_entropy",
            AgentKind::PolicyGradient => "policy_gradient",
            AgentKind::Random => "random",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A learning algorithm driven one tick at a time.
///
/// The protocol guarantees that batches are non-empty, free of duplicate
/// units and sized to [`Agent::feature_count`]; agents still validate what
/// only they can check (e.g. table bin ranges).
pub trait Agent: Send {
    fn kind(&self) -> AgentKind;

    /// Expected state length, or `None` if any length is accepted.
    fn feature_count(&self) -> Option<usize>;

    /// Choose one action per unit, learning from the rewards just reported.
    ///
    /// Must return exactly `batch.len()` actions in batch order and must not
    /// mutate any state when it returns an error.
    fn step(&mut self, batch: &[UnitStep<'_>]) -> Result<ActionList, ProtocolError>;

    /// Consume the terminal tick's rewards and close the episode.
    fn on_episode_end(&mut self, batch: &[UnitStep<'_>]) -> Result<(), ProtocolError>;

    /// In eval mode an agent acts but never learns.
    fn set_eval_mode(&mut self, eval: bool);

    fn is_eval_mode(&self) -> bool;

    /// Snapshot the full learnable state.
    fn save(&self) -> Result<Checkpoint, CheckpointError>;

    /// Replace the learnable state from a checkpoint.
    ///
    /// Either everything is restored or nothing is.
    fn load(&mut self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    /// Training ticks processed.
    fn iterations(&self) -> u64;

    /// Completed population sweeps or gradient updates.
    fn epochs(&self) -> u64 {
        0
    }

    /// Whether the last episode boundary crossed a save point.
    fn wants_checkpoint(&self) -> bool {
        false
    }
}

/// Agent hyper-parameters, tagged by algorithm.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "agent", rename_all = "snake_case")]
pub enum AgentConfig {
    QTable(QTableConfig),
    CrossEntropy(CrossEntropyConfig),
    PolicyGradient(PolicyGradientConfig),
    Random(RandomConfig),
}

impl AgentConfig {
    /// Parse a run config such as `{"agent": "q_table", "team_spirit": 0.5}`.
    ///
    /// Fields left out take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn kind(&self) -> AgentKind {
        match self {
            AgentConfig::QTable(_) => AgentKind::QTable,
            AgentConfig::CrossEntropy(_) => AgentKind::CrossEntropy,
            AgentConfig::PolicyGradient(_) => AgentKind::PolicyGradient,
            AgentConfig::Random(_) => AgentKind::Random,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            AgentConfig::QTable(c) => c.validate(),
            AgentConfig::CrossEntropy(c) => c.validate(),
            AgentConfig::PolicyGradient(c) => c.validate(),
            AgentConfig::Random(c) => c.validate(),
        }
    }
}

/// Build a fresh agent.
pub fn build_agent(config: &AgentConfig) -> Result<Box<dyn Agent>, ConfigError> {
    Ok(match config {
        AgentConfig::QTable(c) => Box::new(QTableAgent::new(c.clone())?),
        AgentConfig::CrossEntropy(c) => Box::new(CrossEntropyAgent::new(c.clone())?),
        AgentConfig::PolicyGradient(c) => Box::new(PolicyGradientAgent::new(c.clone())?),
        AgentConfig::Random(c) => Box::new(RandomAgent::try_new(c.clone())?),
    })
}

/// Rebuild whichever agent produced `checkpoint`.
pub fn load_agent(checkpoint: &Checkpoint) -> Result<Box<dyn Agent>, CheckpointError> {
    let mut agent: Box<dyn Agent> = match checkpoint.kind() {
        AgentKind::QTable => Box::new(QTableAgent::new(checkpoint.config()?)?),
        AgentKind::CrossEntropy => Box::new(CrossEntropyAgent::new(checkpoint.config()?)?),
        AgentKind::PolicyGradient => Box::new(PolicyGradientAgent::new(checkpoint.config()?)?),
        AgentKind::Random => Box::new(RandomAgent::try_new(checkpoint.config()?)?),
    };
    agent.load(checkpoint)?;
    Ok(agent)
}

pub(crate) fn check_range(
    field: &'static str,
    value: f64,
    range: &'static str,
    ok: bool,
) -> Result<(), ConfigError> {
    if ok && value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange { field, range, value })
    }
}

pub(crate) fn check_nonzero(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        Err(ConfigError::Zero { field })
    } else {
        Ok(())
    }
}

pub(crate) fn save_normalizer(checkpoint: &mut Checkpoint, normalizer: &OnlineNormalizer) {
    checkpoint.insert_vector("normalizer_mean", normalizer.mean().to_vec());
    checkpoint.insert_vector("normalizer_var", normalizer.variance());
    checkpoint.insert_vector(
        "normalizer_count",
        normalizer.count().iter().map(|&n| n as f64).collect(),
    );
}

pub(crate) fn load_normalizer(
    checkpoint: &Checkpoint,
    config: NormalizerConfig,
    features: usize,
) -> Result<OnlineNormalizer, CheckpointError> {
    let mean = checkpoint.vector("normalizer_mean", features)?;
    let variance = checkpoint.vector("normalizer_var", features)?;
    let count = checkpoint
        .vector("normalizer_count", features)?
        .into_iter()
        .map(|n| n.max(0.0) as u64)
        .collect();
    OnlineNormalizer::from_moments(config, mean, variance, count).ok_or_else(|| {
        CheckpointError::ShapeMismatch {
            name: "normalizer".to_string(),
            expected: vec![features],
            actual: Vec::new(),
        }
    })
}
