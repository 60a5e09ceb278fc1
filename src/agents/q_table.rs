//! Tabular Q-learning over discretized features.
//!
//! The table is dense: `bins^features` rows of `actions` values, indexed
//! row-major over the feature vector. Each tick, once a unit's reward and new
//! state are known, the unit's previous `(state, action)` cell moves toward
//! the Bellman target:
//!
//! ```text
//! r'     = r + team_spirit * (mean_r - r)
//! target = r' + discount * max_a Q[s', a]      (0 future on the terminal tick)
//! Q[s,a] += learning_rate * (target - Q[s,a])
//! ```
//!
//! Exploration is epsilon-greedy with geometric decay, or, when
//! [`CountExploration`] is configured, greedy over a table in which rarely
//! tried actions are replaced by an optimistic value.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{debug, info};

use super::{check_nonzero, check_range, Agent, AgentKind};
use crate::core::{ActionList, AgentRng, CheckpointError, ConfigError, ProtocolError};
use crate::nn::argmax;
use crate::protocol::{mean_reward, UnitStep};
use crate::training::{Checkpoint, Tensor};

/// Count-based optimism settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CountExploration {
    /// Actions tried fewer times than this in a state look optimistic.
    pub visit_threshold: u32,
    /// Value substituted for under-visited actions.
    pub optimistic_value: f64,
    /// Visit count every cell is set to when entering eval mode.
    pub eval_visit_count: u32,
}

impl Default for CountExploration {
    fn default() -> Self {
        Self {
            visit_threshold: 3,
            optimistic_value: 2.5,
            eval_visit_count: 10,
        }
    }
}

/// Q-table hyper-parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QTableConfig {
    /// Discrete values per feature; features must be integers in `0..bins`.
    pub bins: usize,
    pub features: usize,
    pub actions: usize,
    pub learning_rate: f64,
    pub discount: f64,
    /// Current random-action probability. Saved checkpoints carry the decayed value.
    pub epsilon: f64,
    pub epsilon_decay: f64,
    pub min_epsilon: f64,
    /// Share of the batch-mean reward blended into each unit's reward, in `[0, 1]`.
    pub team_spirit: f64,
    /// Replaces epsilon-greedy selection when set.
    pub exploration: Option<CountExploration>,
    pub seed: u64,
}

impl Default for QTableConfig {
    fn default() -> Self {
        Self {
            bins: 7,
            features: 6,
            actions: 5,
            learning_rate: 0.05,
            discount: 0.95,
            epsilon: 1.0,
            epsilon_decay: 0.99995,
            min_epsilon: 0.05,
            team_spirit: 0.0,
            exploration: None,
            seed: 42,
        }
    }
}

impl QTableConfig {
    pub fn with_bins(mut self, bins: usize) -> Self {
        self.bins = bins;
        self
    }

    pub fn with_features(mut self, features: usize) -> Self {
        self.features = features;
        self
    }

    pub fn with_actions(mut self, actions: usize) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn with_discount(mut self, discount: f64) -> Self {
        self.discount = discount;
        self
    }

    pub fn with_epsilon(mut self, epsilon: f64, decay: f64, min: f64) -> Self {
        self.epsilon = epsilon;
        self.epsilon_decay = decay;
        self.min_epsilon = min;
        self
    }

    pub fn with_team_spirit(mut self, team_spirit: f64) -> Self {
        self.team_spirit = team_spirit;
        self
    }

    pub fn with_exploration(mut self, exploration: CountExploration) -> Self {
        self.exploration = Some(exploration);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Number of discretized states.
    pub fn state_count(&self) -> Option<usize> {
        let exponent = u32::try_from(self.features).ok()?;
        self.bins.checked_pow(exponent)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_nonzero("bins", self.bins)?;
        check_nonzero("features", self.features)?;
        check_nonzero("actions", self.actions)?;
        let lr = self.learning_rate;
        check_range("learning_rate", lr, "(0, 1]", lr > 0.0 && lr <= 1.0)?;
        let d = self.discount;
        check_range("discount", d, "[0, 1]", (0.0..=1.0).contains(&d))?;
        let e = self.epsilon;
        check_range("epsilon", e, "[0, 1]", (0.0..=1.0).contains(&e))?;
        let decay = self.epsilon_decay;
        check_range("epsilon_decay", decay, "(0, 1]", decay > 0.0 && decay <= 1.0)?;
        let min = self.min_epsilon;
        check_range("min_epsilon", min, "[0, 1]", (0.0..=1.0).contains(&min))?;
        let t = self.team_spirit;
        check_range("team_spirit", t, "[0, 1]", (0.0..=1.0).contains(&t))?;

        let too_large = ConfigError::TableTooLarge {
            bins: self.bins,
            features: self.features,
            actions: self.actions,
        };
        self.state_count()
            .and_then(|states| states.checked_mul(self.actions))
            .map(|_| ())
            .ok_or(too_large)
    }
}

/// Tabular Q-learning agent.
#[derive(Clone, Debug)]
pub struct QTableAgent {
    config: QTableConfig,
    table: Vec<f64>,
    /// Per-cell update counts; empty unless count exploration is on.
    visits: Vec<u32>,
    epsilon: f64,
    /// Last `(state row, action)` per unit this episode.
    last: FxHashMap<i64, (usize, usize)>,
    rng: AgentRng,
    eval_mode: bool,
    iterations: u64,
    episode_reward: f64,
}

impl QTableAgent {
    pub fn new(config: QTableConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let cells = config.state_count().unwrap_or_default() * config.actions;
        let visits = if config.exploration.is_some() {
            vec![0; cells]
        } else {
            Vec::new()
        };
        Ok(Self {
            table: vec![0.0; cells],
            visits,
            epsilon: config.epsilon,
            last: FxHashMap::default(),
            rng: AgentRng::new(config.seed),
            eval_mode: false,
            iterations: 0,
            episode_reward: 0.0,
            config,
        })
    }

    pub fn config(&self) -> &QTableConfig {
        &self.config
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Values of every action in state row `state`.
    pub fn row(&self, state: usize) -> &[f64] {
        let a = self.config.actions;
        &self.table[state * a..(state + 1) * a]
    }

    /// Value of one cell.
    pub fn value(&self, state: usize, action: usize) -> f64 {
        self.table[state * self.config.actions + action]
    }

    pub fn visits(&self, state: usize, action: usize) -> Option<u32> {
        self.visits.get(state * self.config.actions + action).copied()
    }

    /// Row index of a discretized feature vector.
    pub fn state_index(&self, unit_id: i64, state: &[f64]) -> Result<usize, ProtocolError> {
        if state.len() != self.config.features {
            return Err(ProtocolError::FeatureCount {
                unit_id,
                expected: self.config.features,
                actual: state.len(),
            });
        }
        let bins = self.config.bins;
        let mut index = 0usize;
        for (feature, &value) in state.iter().enumerate() {
            let in_range = value.is_finite() && value.fract() == 0.0 && value >= 0.0 && value < bins as f64;
            if !in_range {
                return Err(ProtocolError::StateOutOfRange {
                    unit_id,
                    feature,
                    value,
                    bins,
                });
            }
            index = index * bins + value as usize;
        }
        Ok(index)
    }

    fn greedy(&self, state: usize) -> usize {
        argmax(self.row(state))
    }

    fn select_action(&mut self, state: usize) -> usize {
        if self.eval_mode {
            return self.greedy(state);
        }
        match &self.config.exploration {
            Some(exploration) => {
                let a = self.config.actions;
                let threshold = exploration.visit_threshold;
                let optimistic = exploration.optimistic_value;
                let values: SmallVec<[f64; 8]> = (0..a)
                    .map(|action| {
                        let cell = state * a + action;
                        if self.visits[cell] < threshold {
                            optimistic
                        } else {
                            self.table[cell]
                        }
                    })
                    .collect();
                argmax(&values)
            }
            None => {
                if self.rng.gen_f64() < self.epsilon {
                    self.rng.gen_range_usize(0..self.config.actions)
                } else {
                    self.greedy(state)
                }
            }
        }
    }

    /// Bellman update of the cell a unit left last tick.
    fn update(&mut self, cell: usize, reward: f64, max_future: f64) {
        let target = reward + self.config.discount * max_future;
        let current = self.table[cell];
        self.table[cell] = current + self.config.learning_rate * (target - current);
        if let Some(count) = self.visits.get_mut(cell) {
            *count = count.saturating_add(1);
        }
    }

    fn shared_reward(&self, reward: f64, mean: f64) -> f64 {
        reward + self.config.team_spirit * (mean - reward)
    }

    fn previous_cell(&self, unit_id: i64) -> Result<usize, ProtocolError> {
        self.last
            .get(&unit_id)
            .map(|&(state, action)| state * self.config.actions + action)
            .ok_or(ProtocolError::UnknownUnit { unit_id })
    }

    fn decay_epsilon(&mut self) {
        if self.epsilon > self.config.min_epsilon {
            self.epsilon = (self.epsilon * self.config.epsilon_decay).max(self.config.min_epsilon);
        }
    }
}

impl Agent for QTableAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::QTable
    }

    fn feature_count(&self) -> Option<usize> {
        Some(self.config.features)
    }

    fn step(&mut self, batch: &[UnitStep<'_>]) -> Result<ActionList, ProtocolError> {
        // Resolve everything first so a bad record leaves the table untouched.
        let mut rows: SmallVec<[usize; 8]> = SmallVec::with_capacity(batch.len());
        let mut previous: SmallVec<[Option<usize>; 8]> = SmallVec::with_capacity(batch.len());
        for unit in batch {
            rows.push(self.state_index(unit.unit_id, unit.state)?);
            let prev = if self.eval_mode || unit.is_first() {
                None
            } else {
                Some(self.previous_cell(unit.unit_id)?)
            };
            previous.push(prev);
        }

        if !self.eval_mode {
            self.iterations += 1;
            let mean = mean_reward(batch);
            self.episode_reward += batch.iter().map(|u| u.reward).sum::<f64>();
            for ((unit, &row), prev) in batch.iter().zip(&rows).zip(&previous) {
                if let Some(cell) = *prev {
                    let max_future = self.row(row).iter().copied().fold(f64::NEG_INFINITY, f64::max);
                    let reward = self.shared_reward(unit.reward, mean);
                    self.update(cell, reward, max_future);
                }
            }
        }

        let mut actions = ActionList::with_capacity(batch.len());
        for (unit, &row) in batch.iter().zip(&rows) {
            let action = self.select_action(row);
            if !self.eval_mode {
                self.last.insert(unit.unit_id, (row, action));
            }
            actions.push(action);
        }

        if !self.eval_mode {
            self.decay_epsilon();
        }
        Ok(actions)
    }

    fn on_episode_end(&mut self, batch: &[UnitStep<'_>]) -> Result<(), ProtocolError> {
        if self.eval_mode {
            self.last.clear();
            return Ok(());
        }

        let cells = batch
            .iter()
            .map(|unit| self.previous_cell(unit.unit_id))
            .collect::<Result<SmallVec<[usize; 8]>, _>>()?;

        self.iterations += 1;
        let mean = mean_reward(batch);
        for (unit, &cell) in batch.iter().zip(&cells) {
            let reward = self.shared_reward(unit.reward, mean);
            self.update(cell, reward, 0.0);
        }
        self.decay_epsilon();

        self.episode_reward += batch.iter().map(|u| u.reward).sum::<f64>();
        debug!(
            total_reward = self.episode_reward,
            epsilon = self.epsilon,
            iterations = self.iterations,
            "q-table episode finished"
        );
        self.episode_reward = 0.0;
        self.last.clear();
        Ok(())
    }

    fn set_eval_mode(&mut self, eval: bool) {
        self.eval_mode = eval;
        self.last.clear();
        if eval {
            if let Some(exploration) = &self.config.exploration {
                let count = exploration.eval_visit_count;
                self.visits.iter_mut().for_each(|v| *v = count);
            }
        }
    }

    fn is_eval_mode(&self) -> bool {
        self.eval_mode
    }

    fn save(&self) -> Result<Checkpoint, CheckpointError> {
        let mut config = self.config.clone();
        config.epsilon = self.epsilon;

        let rows = self.config.state_count().unwrap_or_default();
        let mut checkpoint = Checkpoint::new(AgentKind::QTable, &config)?
            .with_counters(self.iterations, 0)
            .with_rng(self.rng.state());
        checkpoint.insert(
            "q_table",
            Tensor {
                shape: vec![rows, self.config.actions],
                data: self.table.clone(),
            },
        );
        if !self.visits.is_empty() {
            checkpoint.insert(
                "visits",
                Tensor {
                    shape: vec![rows, self.config.actions],
                    data: self.visits.iter().map(|&v| f64::from(v)).collect(),
                },
            );
        }
        Ok(checkpoint)
    }

    fn load(&mut self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        checkpoint.expect_kind(AgentKind::QTable)?;
        let config: QTableConfig = checkpoint.config()?;
        config.validate()?;

        let rows = self.config.state_count().unwrap_or_default();
        let shape = [rows, self.config.actions];
        let stored_rows = config.state_count().unwrap_or_default();
        if [stored_rows, config.actions] != shape {
            return Err(CheckpointError::ShapeMismatch {
                name: "q_table".to_string(),
                expected: shape.to_vec(),
                actual: vec![stored_rows, config.actions],
            });
        }

        let table = checkpoint.tensor("q_table", &shape)?.data.clone();
        let visits = if config.exploration.is_some() {
            checkpoint
                .tensor("visits", &shape)?
                .data
                .iter()
                .map(|&v| v.max(0.0) as u32)
                .collect()
        } else {
            Vec::new()
        };

        self.table = table;
        self.visits = visits;
        self.epsilon = config.epsilon;
        self.config = config;
        if let Some(state) = &checkpoint.meta.rng {
            self.rng = AgentRng::from_state(state);
        }
        self.iterations = checkpoint.meta.iterations;
        self.last.clear();
        info!(iterations = self.iterations, epsilon = self.epsilon, "q-table restored");
        Ok(())
    }

    fn iterations(&self) -> u64 {
        self.iterations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TickRecord;
    use crate::protocol::UnitPhase;
    use proptest::prelude::*;

    fn small() -> QTableConfig {
        QTableConfig::default()
            .with_bins(3)
            .with_features(2)
            .with_actions(2)
            .with_learning_rate(0.5)
            .with_discount(0.9)
    }

    fn steps(records: &[TickRecord], phase: UnitPhase) -> Vec<UnitStep<'_>> {
        records.iter().map(|r| UnitStep::new(r, phase)).collect()
    }

    #[test]
    fn test_state_index_row_major() {
        let agent = QTableAgent::new(small()).unwrap();
        assert_eq!(agent.state_index(0, &[0.0, 0.0]), Ok(0));
        assert_eq!(agent.state_index(0, &[1.0, 2.0]), Ok(5));
        assert_eq!(agent.state_index(0, &[2.0, 2.0]), Ok(8));
    }

    #[test]
    fn test_state_index_rejects_out_of_range() {
        let agent = QTableAgent::new(small()).unwrap();
        assert!(matches!(
            agent.state_index(4, &[3.0, 0.0]),
            Err(ProtocolError::StateOutOfRange { unit_id: 4, feature: 0, .. })
        ));
        assert!(matches!(
            agent.state_index(4, &[0.0, 0.5]),
            Err(ProtocolError::StateOutOfRange { feature: 1, .. })
        ));
        assert!(matches!(
            agent.state_index(4, &[0.0, -1.0]),
            Err(ProtocolError::StateOutOfRange { .. })
        ));
    }

    #[test]
    fn test_first_step_does_not_update() {
        let mut agent = QTableAgent::new(small()).unwrap();
        let records = [TickRecord::new(1, vec![1.0, 1.0], 10.0)];
        agent.step(&steps(&records, UnitPhase::AwaitingFirstAction)).unwrap();
        assert!(agent.table.iter().all(|v| *v == 0.0));
        assert_eq!(agent.iterations(), 1);
    }

    #[test]
    fn test_bellman_update_then_terminal() {
        let mut agent = QTableAgent::new(small().with_epsilon(0.0, 1.0, 0.0)).unwrap();

        let first = [TickRecord::new(1, vec![0.0, 0.0], 0.0)];
        let a0 = agent.step(&steps(&first, UnitPhase::AwaitingFirstAction)).unwrap()[0];

        // Seed the next state's row so max_future is non-zero.
        let next_row = agent.state_index(1, &[0.0, 1.0]).unwrap();
        agent.table[next_row * 2 + 1] = 2.0;

        let second = [TickRecord::new(1, vec![0.0, 1.0], 1.0)];
        let a1 = agent.step(&steps(&second, UnitPhase::Stepping)).unwrap()[0];
        // 0 + 0.5 * (1 + 0.9 * 2 - 0)
        assert!((agent.value(0, a0) - 1.4).abs() < 1e-12);
        assert_eq!(a1, 1);

        let terminal = [TickRecord::terminal(1, -1.0)];
        agent.on_episode_end(&steps(&terminal, UnitPhase::Stepping)).unwrap();
        // 2 + 0.5 * (-1 - 2)
        assert!((agent.value(next_row, 1) - 0.5).abs() < 1e-12);
        assert!(agent.last.is_empty());
    }

    #[test]
    fn test_team_spirit_blends_rewards() {
        let config = small().with_team_spirit(1.0).with_epsilon(0.0, 1.0, 0.0);
        let mut agent = QTableAgent::new(config).unwrap();
        let first = [TickRecord::new(1, vec![0.0, 0.0], 0.0), TickRecord::new(2, vec![1.0, 0.0], 0.0)];
        agent.step(&steps(&first, UnitPhase::AwaitingFirstAction)).unwrap();

        let terminal = [TickRecord::terminal(1, 4.0), TickRecord::terminal(2, 0.0)];
        agent.on_episode_end(&steps(&terminal, UnitPhase::Stepping)).unwrap();

        // Both units receive the batch mean of 2.0.
        assert!((agent.value(0, 0) - 1.0).abs() < 1e-12);
        assert!((agent.value(3, 0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_epsilon_decays_to_floor() {
        let config = small().with_epsilon(1.0, 0.5, 0.2);
        let mut agent = QTableAgent::new(config).unwrap();
        let records = [TickRecord::new(1, vec![0.0, 0.0], 0.0)];
        agent.step(&steps(&records, UnitPhase::AwaitingFirstAction)).unwrap();
        assert_eq!(agent.epsilon(), 0.5);
        for _ in 0..5 {
            agent.step(&steps(&records, UnitPhase::Stepping)).unwrap();
        }
        assert_eq!(agent.epsilon(), 0.2);
    }

    #[test]
    fn test_unknown_unit_leaves_table_untouched() {
        let mut agent = QTableAgent::new(small()).unwrap();
        let records = [TickRecord::new(9, vec![0.0, 0.0], 1.0)];
        let err = agent.step(&steps(&records, UnitPhase::Stepping)).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownUnit { unit_id: 9 });
        assert_eq!(agent.iterations(), 0);
    }

    #[test]
    fn test_count_exploration_tries_every_action() {
        let config = small().with_exploration(CountExploration {
            visit_threshold: 1,
            optimistic_value: 10.0,
            eval_visit_count: 5,
        });
        let mut agent = QTableAgent::new(config).unwrap();
        let state = vec![0.0, 0.0];

        let records = [TickRecord::new(1, state.clone(), 0.0)];
        let first = agent.step(&steps(&records, UnitPhase::AwaitingFirstAction)).unwrap()[0];
        let second = agent.step(&steps(&records, UnitPhase::Stepping)).unwrap()[0];
        assert_eq!(first, 0);
        assert_eq!(second, 1, "under-visited action should be tried next");

        agent.set_eval_mode(true);
        assert_eq!(agent.visits(0, 1), Some(5));
    }

    #[test]
    fn test_eval_mode_is_greedy_and_frozen() {
        let mut agent = QTableAgent::new(small()).unwrap();
        agent.table[1] = 3.0;
        agent.set_eval_mode(true);

        let records = [TickRecord::new(1, vec![0.0, 0.0], 5.0)];
        for phase in [UnitPhase::AwaitingFirstAction, UnitPhase::Stepping] {
            assert_eq!(agent.step(&steps(&records, phase)).unwrap()[0], 1);
        }
        agent.on_episode_end(&steps(&[TickRecord::terminal(1, 5.0)], UnitPhase::Stepping)).unwrap();
        assert_eq!(agent.iterations(), 0);
        assert_eq!(agent.table[1], 3.0);
    }

    #[test]
    fn test_save_load_round_trip() {
        let mut agent = QTableAgent::new(small().with_epsilon(1.0, 0.5, 0.0)).unwrap();
        let records = [TickRecord::new(1, vec![2.0, 1.0], 0.0)];
        agent.step(&steps(&records, UnitPhase::AwaitingFirstAction)).unwrap();
        agent.on_episode_end(&steps(&[TickRecord::terminal(1, 1.0)], UnitPhase::Stepping)).unwrap();

        let checkpoint = agent.save().unwrap();
        let mut restored = QTableAgent::new(small()).unwrap();
        restored.load(&checkpoint).unwrap();

        assert_eq!(restored.table, agent.table);
        assert_eq!(restored.epsilon(), agent.epsilon());
        assert_eq!(restored.iterations(), 2);
    }

    #[test]
    fn test_load_rejects_other_shape() {
        let agent = QTableAgent::new(small()).unwrap();
        let checkpoint = agent.save().unwrap();
        let mut other = QTableAgent::new(small().with_bins(4)).unwrap();
        assert!(matches!(other.load(&checkpoint), Err(CheckpointError::ShapeMismatch { .. })));
        assert!(other.table.iter().all(|v| *v == 0.0));
    }

    proptest! {
        #[test]
        fn prop_update_never_overshoots(
            start in -10.0f64..10.0,
            reward in -10.0f64..10.0,
            lr in 0.01f64..0.99,
        ) {
            let mut agent = QTableAgent::new(small().with_learning_rate(lr)).unwrap();
            agent.table[0] = start;
            agent.update(0, reward, 0.0);
            let after = agent.table[0];

            let (lo, hi) = if start <= reward { (start, reward) } else { (reward, start) };
            prop_assert!(after >= lo - 1e-12 && after <= hi + 1e-12);
            prop_assert!((reward - after).abs() <= (reward - start).abs() + 1e-12);
        }
    }
}
