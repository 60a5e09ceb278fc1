//! Uniform random baseline.

use serde::{Deserialize, Serialize};

use super::{check_nonzero, Agent, AgentKind};
use crate::core::{ActionList, AgentRng, CheckpointError, ConfigError, ProtocolError};
use crate::protocol::UnitStep;
use crate::training::Checkpoint;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RandomConfig {
    pub actions: usize,
    pub seed: u64,
}

impl Default for RandomConfig {
    fn default() -> Self {
        Self { actions: 5, seed: 42 }
    }
}

impl RandomConfig {
    pub fn with_actions(mut self, actions: usize) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_nonzero("actions", self.actions)
    }
}

/// Picks every unit's action uniformly at random. Never learns.
#[derive(Clone, Debug)]
pub struct RandomAgent {
    config: RandomConfig,
    rng: AgentRng,
    eval_mode: bool,
    iterations: u64,
}

impl RandomAgent {
    /// Create a new agent. A zero action count falls back to one action.
    pub fn new(mut config: RandomConfig) -> Self {
        config.actions = config.actions.max(1);
        Self {
            rng: AgentRng::new(config.seed),
            config,
            eval_mode: false,
            iterations: 0,
        }
    }

    pub fn try_new(config: RandomConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::new(config))
    }
}

impl Agent for RandomAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Random
    }

    fn feature_count(&self) -> Option<usize> {
        None
    }

    fn step(&mut self, batch: &[UnitStep<'_>]) -> Result<ActionList, ProtocolError> {
        if !self.eval_mode {
            self.iterations += 1;
        }
        Ok(batch
            .iter()
            .map(|_| self.rng.gen_range_usize(0..self.config.actions))
            .collect())
    }

    fn on_episode_end(&mut self, _batch: &[UnitStep<'_>]) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn set_eval_mode(&mut self, eval: bool) {
        self.eval_mode = eval;
    }

    fn is_eval_mode(&self) -> bool {
        self.eval_mode
    }

    fn save(&self) -> Result<Checkpoint, CheckpointError> {
        Ok(Checkpoint::new(AgentKind::Random, &self.config)?.with_counters(self.iterations, 0))
    }

    fn load(&mut self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        checkpoint.expect_kind(AgentKind::Random)?;
        let config: RandomConfig = checkpoint.config()?;
        config.validate()?;
        self.rng = AgentRng::new(config.seed);
        self.config = config;
        self.iterations = checkpoint.meta.iterations;
        Ok(())
    }

    fn iterations(&self) -> u64 {
        self.iterations
    }
}
