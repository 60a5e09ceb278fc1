//! Cross-entropy method over linear policy networks.
//!
//! A Gaussian with per-weight mean and standard deviation is kept for every
//! layer. Each epoch samples `population_size` networks from it and plays
//! them one at a time for `trials_per_member` episodes. A member's fitness is
//! the summed reward of all its units plus an entropy bonus on its action
//! distributions. When the whole population has played, the top
//! `elite_fraction` are refit into a new mean and standard deviation, with a
//! small noise floor added to the latter that shrinks as epochs pass.
//!
//! In eval mode every member is the mean network, so play is deterministic
//! up to action sampling.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{check_nonzero, check_range, load_normalizer, save_normalizer, Agent, AgentKind};
use crate::core::{ActionList, AgentRng, CheckpointError, ConfigError, ProtocolError};
use crate::nn::{
    elementwise_mean, elementwise_std, entropy_bits, sample_index, softmax, Matrix, NormalizerConfig,
    OnlineNormalizer,
};
use crate::protocol::UnitStep;
use crate::training::Checkpoint;

/// Cross-entropy hyper-parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossEntropyConfig {
    pub population_size: usize,
    /// Share of the population kept to refit the distribution, in `(0, 1]`.
    pub elite_fraction: f64,
    /// Episodes each member plays per epoch.
    pub trials_per_member: usize,
    /// Layer widths from input to output; at least two entries.
    pub layers: Vec<usize>,
    /// Weight of the entropy (bits) bonus added to fitness per decision.
    pub entropy_weight: f64,
    pub initial_std: f64,
    /// Noise added to the refit std, before decay.
    pub std_noise: f64,
    /// Per-epoch reduction of `std_noise`.
    pub std_noise_decay: f64,
    pub save_every_epochs: u64,
    pub normalizer: NormalizerConfig,
    pub seed: u64,
}

impl Default for CrossEntropyConfig {
    fn default() -> Self {
        Self {
            population_size: 100,
            elite_fraction: 0.2,
            trials_per_member: 1,
            layers: vec![16, 8, 5],
            entropy_weight: 0.01,
            initial_std: 0.7,
            std_noise: 0.01,
            std_noise_decay: 5e-5,
            save_every_epochs: 15,
            normalizer: NormalizerConfig::default(),
            seed: 42,
        }
    }
}

impl CrossEntropyConfig {
    pub fn with_population_size(mut self, size: usize) -> Self {
        self.population_size = size;
        self
    }

    pub fn with_elite_fraction(mut self, fraction: f64) -> Self {
        self.elite_fraction = fraction;
        self
    }

    pub fn with_trials_per_member(mut self, trials: usize) -> Self {
        self.trials_per_member = trials;
        self
    }

    pub fn with_layers(mut self, layers: Vec<usize>) -> Self {
        self.layers = layers;
        self
    }

    pub fn with_entropy_weight(mut self, weight: f64) -> Self {
        self.entropy_weight = weight;
        self
    }

    pub fn with_initial_std(mut self, std: f64) -> Self {
        self.initial_std = std;
        self
    }

    pub fn with_std_noise(mut self, noise: f64, decay: f64) -> Self {
        self.std_noise = noise;
        self.std_noise_decay = decay;
        self
    }

    pub fn with_save_every_epochs(mut self, epochs: u64) -> Self {
        self.save_every_epochs = epochs;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Number of members refit each epoch; always at least one.
    pub fn elite_count(&self) -> usize {
        ((self.population_size as f64 * self.elite_fraction) as usize).max(1)
    }

    /// Std floor added after refitting at `epoch`.
    pub fn noise_floor(&self, epoch: u64) -> f64 {
        (self.std_noise - self.std_noise_decay * epoch as f64).max(0.0)
    }

    /// `(out, in)` shape of every weight layer.
    pub fn layer_shapes(&self) -> Vec<[usize; 2]> {
        self.layers.windows(2).map(|w| [w[1], w[0]]).collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_nonzero("population_size", self.population_size)?;
        check_nonzero("trials_per_member", self.trials_per_member)?;
        if self.layers.len() < 2 {
            return Err(ConfigError::Layers {
                min: 2,
                actual: self.layers.len(),
            });
        }
        for &width in &self.layers {
            check_nonzero("layers", width)?;
        }
        let f = self.elite_fraction;
        check_range("elite_fraction", f, "(0, 1]", f > 0.0 && f <= 1.0)?;
        let w = self.entropy_weight;
        check_range("entropy_weight", w, "[0, inf)", w >= 0.0)?;
        let s = self.initial_std;
        check_range("initial_std", s, "[0, inf)", s >= 0.0)?;
        let n = self.std_noise;
        check_range("std_noise", n, "[0, inf)", n >= 0.0)?;
        let d = self.std_noise_decay;
        check_range("std_noise_decay", d, "[0, inf)", d >= 0.0)?;
        self.normalizer.validate()
    }
}

/// Indices of the `count` fittest members, best first.
///
/// Ties keep population order, so an all-equal population yields the first
/// `count` members.
pub fn elite_indices(fitness: &[f64], count: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..fitness.len()).collect();
    order.sort_by(|&a, &b| fitness[b].total_cmp(&fitness[a]));
    order.truncate(count);
    order
}

fn forward_layers(layers: &[Matrix], input: Vec<f64>) -> Vec<f64> {
    layers.iter().fold(input, |x, w| w.mul_vec(&x))
}

/// Population-based policy search agent.
#[derive(Clone, Debug)]
pub struct CrossEntropyAgent {
    config: CrossEntropyConfig,
    mean: Vec<Matrix>,
    std: Vec<Matrix>,
    /// `population[member][layer]`.
    population: Vec<Vec<Matrix>>,
    fitness: Vec<f64>,
    active: usize,
    trial: usize,
    normalizer: OnlineNormalizer,
    /// Raw observations seen since the last episode boundary.
    observations: Vec<Vec<f64>>,
    rng: AgentRng,
    eval_mode: bool,
    iterations: u64,
    epochs: u64,
    should_save: bool,
}

impl CrossEntropyAgent {
    pub fn new(config: CrossEntropyConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let shapes = config.layer_shapes();
        let mean = shapes.iter().map(|&[r, c]| Matrix::zeros(r, c)).collect();
        let std = shapes
            .iter()
            .map(|&[r, c]| Matrix::filled(r, c, config.initial_std))
            .collect();
        let normalizer = OnlineNormalizer::new(config.layers[0], config.normalizer.clone());

        let mut agent = Self {
            mean,
            std,
            population: Vec::new(),
            fitness: vec![0.0; config.population_size],
            active: 0,
            trial: 0,
            normalizer,
            observations: Vec::new(),
            rng: AgentRng::new(config.seed),
            eval_mode: false,
            iterations: 0,
            epochs: 0,
            should_save: false,
            config,
        };
        agent.resample_population();
        Ok(agent)
    }

    pub fn config(&self) -> &CrossEntropyConfig {
        &self.config
    }

    /// Per-layer mean of the search distribution.
    pub fn mean(&self) -> &[Matrix] {
        &self.mean
    }

    /// Per-layer std of the search distribution.
    pub fn std(&self) -> &[Matrix] {
        &self.std
    }

    /// Weights of one population member.
    pub fn member(&self, index: usize) -> Option<&[Matrix]> {
        self.population.get(index).map(Vec::as_slice)
    }

    /// Accumulated fitness of every member this epoch.
    pub fn fitness(&self) -> &[f64] {
        &self.fitness
    }

    /// The member currently playing.
    pub fn active_member(&self) -> usize {
        self.active
    }

    pub fn normalizer(&self) -> &OnlineNormalizer {
        &self.normalizer
    }

    fn resample_population(&mut self) {
        let eval = self.eval_mode;
        let mut population = Vec::with_capacity(self.config.population_size);
        for _ in 0..self.config.population_size {
            let member = self
                .mean
                .iter()
                .zip(&self.std)
                .map(|(mean, std)| {
                    if eval {
                        mean.clone()
                    } else {
                        Matrix::sample_normal(mean, std, &mut self.rng)
                    }
                })
                .collect();
            population.push(member);
        }
        self.population = population;
    }

    /// Refit the distribution to the elite members and start a new epoch.
    fn finish_epoch(&mut self) {
        self.epochs += 1;
        self.should_save = self.config.save_every_epochs > 0 && self.epochs % self.config.save_every_epochs == 0;

        let elite = elite_indices(&self.fitness, self.config.elite_count());
        let floor = self.config.noise_floor(self.epochs);
        let best = elite.first().map(|&i| self.fitness[i]).unwrap_or_default();

        for layer in 0..self.mean.len() {
            let members: Vec<&Matrix> = elite.iter().map(|&i| &self.population[i][layer]).collect();
            if let Some(mean) = elementwise_mean(&members) {
                let mut std = elementwise_std(&members, &mean);
                std.as_mut_slice().iter_mut().for_each(|s| *s += floor);
                self.mean[layer] = mean;
                self.std[layer] = std;
            }
        }

        info!(
            epoch = self.epochs,
            best_fitness = best,
            elite = elite.len(),
            noise_floor = floor,
            "cross-entropy epoch complete"
        );

        self.resample_population();
        self.fitness.iter_mut().for_each(|f| *f = 0.0);
        self.active = 0;
    }
}

impl Agent for CrossEntropyAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::CrossEntropy
    }

    fn feature_count(&self) -> Option<usize> {
        self.config.layers.first().copied()
    }

    fn step(&mut self, batch: &[UnitStep<'_>]) -> Result<ActionList, ProtocolError> {
        let mut actions = ActionList::with_capacity(batch.len());
        let mut bonus = 0.0;
        for unit in batch {
            let input = self.normalizer.normalize(unit.state);
            let logits = forward_layers(&self.population[self.active], input);
            let probs = softmax(&logits);
            bonus += entropy_bits(&probs) * self.config.entropy_weight;
            actions.push(sample_index(&probs, &mut self.rng));
        }

        if !self.eval_mode {
            self.iterations += 1;
            let reward: f64 = batch.iter().map(|u| u.reward).sum();
            self.fitness[self.active] += reward + bonus;
            self.observations.extend(batch.iter().map(|u| u.state.to_vec()));
        }
        Ok(actions)
    }

    fn on_episode_end(&mut self, batch: &[UnitStep<'_>]) -> Result<(), ProtocolError> {
        self.should_save = false;
        if self.eval_mode {
            return Ok(());
        }

        self.iterations += 1;
        self.fitness[self.active] += batch.iter().map(|u| u.reward).sum::<f64>();

        self.normalizer
            .record_batch(self.observations.iter().map(Vec::as_slice));
        self.observations.clear();

        self.trial += 1;
        if self.trial < self.config.trials_per_member {
            return Ok(());
        }
        debug!(
            member = self.active,
            fitness = self.fitness[self.active],
            "population member evaluated"
        );
        self.trial = 0;
        self.active += 1;
        if self.active == self.config.population_size {
            self.finish_epoch();
        }
        Ok(())
    }

    fn set_eval_mode(&mut self, eval: bool) {
        if self.eval_mode == eval {
            return;
        }
        self.eval_mode = eval;
        self.observations.clear();
        self.resample_population();
    }

    fn is_eval_mode(&self) -> bool {
        self.eval_mode
    }

    fn save(&self) -> Result<Checkpoint, CheckpointError> {
        let mut checkpoint = Checkpoint::new(AgentKind::CrossEntropy, &self.config)?
            .with_counters(self.iterations, self.epochs)
            .with_rng(self.rng.state());
        for (i, (mean, std)) in self.mean.iter().zip(&self.std).enumerate() {
            checkpoint.insert_matrix(format!("mean_{i}"), mean);
            checkpoint.insert_matrix(format!("std_{i}"), std);
        }
        save_normalizer(&mut checkpoint, &self.normalizer);
        Ok(checkpoint)
    }

    fn load(&mut self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        checkpoint.expect_kind(AgentKind::CrossEntropy)?;
        let config: CrossEntropyConfig = checkpoint.config()?;
        config.validate()?;

        let shapes = self.config.layer_shapes();
        if config.layer_shapes() != shapes {
            return Err(CheckpointError::ShapeMismatch {
                name: "layers".to_string(),
                expected: self.config.layers.clone(),
                actual: config.layers.clone(),
            });
        }

        let mut mean = Vec::with_capacity(shapes.len());
        let mut std = Vec::with_capacity(shapes.len());
        for (i, &[rows, cols]) in shapes.iter().enumerate() {
            mean.push(checkpoint.matrix(&format!("mean_{i}"), rows, cols)?);
            std.push(checkpoint.matrix(&format!("std_{i}"), rows, cols)?);
        }
        let normalizer = load_normalizer(checkpoint, config.normalizer.clone(), config.layers[0])?;

        self.mean = mean;
        self.std = std;
        self.normalizer = normalizer;
        self.fitness = vec![0.0; config.population_size];
        self.config = config;
        if let Some(state) = &checkpoint.meta.rng {
            self.rng = AgentRng::from_state(state);
        }
        self.iterations = checkpoint.meta.iterations;
        self.epochs = checkpoint.meta.epochs;
        self.active = 0;
        self.trial = 0;
        self.observations.clear();
        self.should_save = false;
        self.resample_population();
        info!(epochs = self.epochs, "cross-entropy agent restored");
        Ok(())
    }

    fn iterations(&self) -> u64 {
        self.iterations
    }

    fn epochs(&self) -> u64 {
        self.epochs
    }

    fn wants_checkpoint(&self) -> bool {
        self.should_save
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TickRecord;
    use crate::protocol::UnitPhase;

    fn tiny() -> CrossEntropyConfig {
        CrossEntropyConfig::default()
            .with_population_size(5)
            .with_elite_fraction(0.4)
            .with_layers(vec![3, 2])
            .with_entropy_weight(0.0)
    }

    fn play_episode(agent: &mut CrossEntropyAgent, final_reward: f64) {
        let live = [TickRecord::new(1, vec![0.5, -0.5, 1.0], 0.0)];
        let batch: Vec<_> = live.iter().map(|r| UnitStep::new(r, UnitPhase::AwaitingFirstAction)).collect();
        agent.step(&batch).unwrap();
        let terminal = [TickRecord::terminal(1, final_reward)];
        let batch: Vec<_> = terminal.iter().map(|r| UnitStep::new(r, UnitPhase::Stepping)).collect();
        agent.on_episode_end(&batch).unwrap();
    }

    #[test]
    fn test_elite_indices_stable_ties() {
        assert_eq!(elite_indices(&[5.0, 3.0, 1.0, 4.0, 2.0], 2), vec![0, 3]);
        assert_eq!(elite_indices(&[1.0, 1.0, 1.0], 2), vec![0, 1]);
    }

    #[test]
    fn test_elite_count_floor() {
        let config = CrossEntropyConfig::default().with_population_size(3).with_elite_fraction(0.1);
        assert_eq!(config.elite_count(), 1);
        assert_eq!(CrossEntropyConfig::default().elite_count(), 20);
    }

    #[test]
    fn test_noise_floor_decays_to_zero() {
        let config = CrossEntropyConfig::default();
        assert!((config.noise_floor(0) - 0.01).abs() < 1e-15);
        assert!((config.noise_floor(100) - 0.005).abs() < 1e-12);
        assert_eq!(config.noise_floor(1_000), 0.0);
    }

    #[test]
    fn test_fitness_accumulates_to_active_member() {
        let mut agent = CrossEntropyAgent::new(tiny()).unwrap();
        play_episode(&mut agent, 2.5);
        assert_eq!(agent.fitness()[0], 2.5);
        assert_eq!(agent.active_member(), 1);
    }

    #[test]
    fn test_epoch_refits_to_elite() {
        let mut agent = CrossEntropyAgent::new(tiny().with_std_noise(0.0, 0.0)).unwrap();
        let best = agent.member(0).unwrap()[0].clone();
        let second = agent.member(3).unwrap()[0].clone();

        for reward in [5.0, 3.0, 1.0, 4.0, 2.0] {
            play_episode(&mut agent, reward);
        }

        let expected = elementwise_mean(&[&best, &second]).unwrap();
        assert_eq!(agent.mean()[0], expected);
        assert_eq!(agent.epochs(), 1);
        assert_eq!(agent.active_member(), 0);
        assert!(agent.fitness().iter().all(|f| *f == 0.0));
    }

    #[test]
    fn test_normalizer_records_at_episode_end() {
        let mut agent = CrossEntropyAgent::new(tiny()).unwrap();
        play_episode(&mut agent, 0.0);
        assert_eq!(agent.normalizer().count(), &[1, 1, 1]);
    }

    #[test]
    fn test_eval_mode_population_is_mean() {
        let mut agent = CrossEntropyAgent::new(tiny()).unwrap();
        agent.set_eval_mode(true);
        for i in 0..5 {
            assert_eq!(agent.member(i).unwrap(), agent.mean());
        }
        play_episode(&mut agent, 9.0);
        assert_eq!(agent.iterations(), 0);
        assert_eq!(agent.active_member(), 0);

        agent.set_eval_mode(false);
        assert_ne!(agent.member(0).unwrap(), agent.mean());
    }

    #[test]
    fn test_save_request_at_epoch_boundary() {
        let mut agent = CrossEntropyAgent::new(
            tiny().with_population_size(1).with_save_every_epochs(2),
        )
        .unwrap();
        play_episode(&mut agent, 0.0);
        assert!(!agent.wants_checkpoint());
        play_episode(&mut agent, 0.0);
        assert!(agent.wants_checkpoint());
        play_episode(&mut agent, 0.0);
        assert!(!agent.wants_checkpoint());
    }

    #[test]
    fn test_save_load_round_trip() {
        let mut agent = CrossEntropyAgent::new(tiny()).unwrap();
        for _ in 0..5 {
            play_episode(&mut agent, 1.0);
        }
        let checkpoint = agent.save().unwrap();

        let mut restored = CrossEntropyAgent::new(tiny().with_seed(7)).unwrap();
        restored.load(&checkpoint).unwrap();
        assert_eq!(restored.mean(), agent.mean());
        assert_eq!(restored.std(), agent.std());
        assert_eq!(restored.epochs(), 1);
        assert_eq!(restored.normalizer().mean(), agent.normalizer().mean());
    }

    #[test]
    fn test_load_rejects_other_layers() {
        let agent = CrossEntropyAgent::new(tiny()).unwrap();
        let checkpoint = agent.save().unwrap();
        let mut other = CrossEntropyAgent::new(tiny().with_layers(vec![3, 4, 2])).unwrap();
        assert!(matches!(other.load(&checkpoint), Err(CheckpointError::ShapeMismatch { .. })));
    }
}
