//! REINFORCE over a two-layer softmax policy.
//!
//! Every tick each unit's normalized state goes through
//! `softmax(W2 · W1 · x)` and an action is sampled. The activations are kept
//! per unit until the episode ends; then each unit's rewards are appended to
//! the mini-batch followed by an episode boundary, so discounting never runs
//! across units or episodes.
//!
//! Every `mini_batch_size` episodes the mini-batch is discounted, its returns
//! normalized and the closed-form gradient accumulated. Every `batch_size`
//! episodes the accumulated gradient is applied with a learning rate that
//! decays geometrically per update.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{check_nonzero, check_range, load_normalizer, save_normalizer, Agent, AgentKind};
use crate::core::{ActionList, AgentRng, CheckpointError, ConfigError, ProtocolError};
use crate::nn::{
    discount_rewards, forward, normalize_advantages, policy_gradients, sample_index, Gradients, Matrix,
    NormalizerConfig, OnlineNormalizer, PolicySample, RewardSignal,
};
use crate::protocol::UnitStep;
use crate::training::{Checkpoint, Tensor};

/// Policy-gradient hyper-parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyGradientConfig {
    /// `[inputs, hidden, actions]`.
    pub layers: Vec<usize>,
    pub discount: f64,
    pub learning_rate: f64,
    /// Multiplier applied to the learning rate after each update.
    pub learning_rate_decay: f64,
    /// Episodes per gradient computation.
    pub mini_batch_size: usize,
    /// Episodes per weight update; a multiple of `mini_batch_size`.
    pub batch_size: usize,
    pub entropy_weight: f64,
    pub save_every_updates: u64,
    pub normalizer: NormalizerConfig,
    pub seed: u64,
}

impl Default for PolicyGradientConfig {
    fn default() -> Self {
        Self {
            layers: vec![17, 8, 5],
            discount: 0.95,
            learning_rate: 0.01,
            learning_rate_decay: 0.999,
            mini_batch_size: 1,
            batch_size: 10,
            entropy_weight: 0.01,
            save_every_updates: 15,
            normalizer: NormalizerConfig::default(),
            seed: 42,
        }
    }
}

impl PolicyGradientConfig {
    pub fn with_layers(mut self, inputs: usize, hidden: usize, actions: usize) -> Self {
        self.layers = vec![inputs, hidden, actions];
        self
    }

    pub fn with_discount(mut self, discount: f64) -> Self {
        self.discount = discount;
        self
    }

    pub fn with_learning_rate(mut self, learning_rate: f64, decay: f64) -> Self {
        self.learning_rate = learning_rate;
        self.learning_rate_decay = decay;
        self
    }

    pub fn with_batches(mut self, mini_batch_size: usize, batch_size: usize) -> Self {
        self.mini_batch_size = mini_batch_size;
        self.batch_size = batch_size;
        self
    }

    pub fn with_entropy_weight(mut self, weight: f64) -> Self {
        self.entropy_weight = weight;
        self
    }

    pub fn with_save_every_updates(mut self, updates: u64) -> Self {
        self.save_every_updates = updates;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Shapes of `W1` and `W2`.
    pub fn shapes(&self) -> ([usize; 2], [usize; 2]) {
        match self.layers.as_slice() {
            [inputs, hidden, actions] => ([*hidden, *inputs], [*actions, *hidden]),
            _ => ([0, 0], [0, 0]),
        }
    }

    /// Learning rate for the update following `updates` earlier ones.
    pub fn learning_rate_at(&self, updates: u64) -> f64 {
        let exponent = i32::try_from(updates).unwrap_or(i32::MAX);
        self.learning_rate * self.learning_rate_decay.powi(exponent)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.layers.len() != 3 {
            return Err(ConfigError::LayerCount {
                expected: 3,
                actual: self.layers.len(),
            });
        }
        for &width in &self.layers {
            check_nonzero("layers", width)?;
        }
        check_nonzero("mini_batch_size", self.mini_batch_size)?;
        check_nonzero("batch_size", self.batch_size)?;
        if self.batch_size % self.mini_batch_size != 0 {
            return Err(ConfigError::BatchMultiple {
                batch_size: self.batch_size,
                mini_batch_size: self.mini_batch_size,
            });
        }
        let d = self.discount;
        check_range("discount", d, "[0, 1]", (0.0..=1.0).contains(&d))?;
        let lr = self.learning_rate;
        check_range("learning_rate", lr, "(0, inf)", lr > 0.0)?;
        let decay = self.learning_rate_decay;
        check_range("learning_rate_decay", decay, "(0, 1]", decay > 0.0 && decay <= 1.0)?;
        let w = self.entropy_weight;
        check_range("entropy_weight", w, "[0, inf)", w >= 0.0)?;
        self.normalizer.validate()
    }
}

/// Per-unit trace of one episode.
#[derive(Clone, Debug, Default)]
struct UnitTrace {
    inputs: Vec<Vec<f64>>,
    hiddens: Vec<Vec<f64>>,
    probs: Vec<Vec<f64>>,
    actions: Vec<usize>,
    /// `rewards[i]` is the reward for `actions[i]`.
    rewards: Vec<f64>,
}

/// REINFORCE agent with a hand-derived backward pass.
#[derive(Clone, Debug)]
pub struct PolicyGradientAgent {
    config: PolicyGradientConfig,
    w1: Matrix,
    w2: Matrix,
    normalizer: OnlineNormalizer,
    /// Ordered by unit id so batches are assembled deterministically.
    traces: BTreeMap<i64, UnitTrace>,
    observations: Vec<Vec<f64>>,
    /// Decisions of the current mini-batch, advantage not yet filled in.
    pending: Vec<PolicySample>,
    signals: Vec<RewardSignal>,
    grad: Gradients,
    episodes: u64,
    updates: u64,
    rng: AgentRng,
    eval_mode: bool,
    iterations: u64,
    should_save: bool,
}

impl PolicyGradientAgent {
    pub fn new(config: PolicyGradientConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut rng = AgentRng::new(config.seed);
        let ([h, i], [a, _]) = config.shapes();
        let w1 = Matrix::xavier(h, i, &mut rng);
        let w2 = Matrix::xavier(a, h, &mut rng);
        Ok(Self {
            grad: Gradients::zeros(w1.shape(), w2.shape()),
            w1,
            w2,
            normalizer: OnlineNormalizer::new(i, config.normalizer.clone()),
            traces: BTreeMap::new(),
            observations: Vec::new(),
            pending: Vec::new(),
            signals: Vec::new(),
            episodes: 0,
            updates: 0,
            rng,
            eval_mode: false,
            iterations: 0,
            should_save: false,
            config,
        })
    }

    pub fn config(&self) -> &PolicyGradientConfig {
        &self.config
    }

    /// Input-to-hidden weights.
    pub fn w1(&self) -> &Matrix {
        &self.w1
    }

    /// Hidden-to-output weights.
    pub fn w2(&self) -> &Matrix {
        &self.w2
    }

    /// Gradient accumulated since the last update.
    pub fn accumulated_gradient(&self) -> &Gradients {
        &self.grad
    }

    pub fn normalizer(&self) -> &OnlineNormalizer {
        &self.normalizer
    }

    /// Weight updates applied so far.
    pub fn updates(&self) -> u64 {
        self.updates
    }

    /// Action distribution for a raw state.
    pub fn action_probabilities(&self, state: &[f64]) -> Vec<f64> {
        forward(&self.w1, &self.w2, &self.normalizer.normalize(state)).probs
    }

    /// Move each unit's finished trace into the mini-batch.
    fn close_traces(&mut self) {
        let traces = std::mem::take(&mut self.traces);
        for (_, mut trace) in traces {
            // A unit that died before the end never got a final reward.
            trace.rewards.resize(trace.actions.len(), 0.0);
            for (((input, hidden), probs), action) in trace
                .inputs
                .into_iter()
                .zip(trace.hiddens)
                .zip(trace.probs)
                .zip(trace.actions)
            {
                self.pending.push(PolicySample {
                    input,
                    hidden,
                    probs,
                    action,
                    advantage: 0.0,
                });
            }
            self.signals
                .extend(trace.rewards.into_iter().map(RewardSignal::Reward));
            self.signals.push(RewardSignal::Boundary);
        }
    }

    /// Turn the mini-batch into gradient and add it to the buffer.
    fn accumulate_mini_batch(&mut self) {
        let mut advantages = discount_rewards(&self.signals, self.config.discount);
        normalize_advantages(&mut advantages);
        for (sample, advantage) in self.pending.iter_mut().zip(advantages) {
            sample.advantage = advantage;
        }
        if !self.pending.is_empty() {
            let grads = policy_gradients(&self.w1, &self.w2, &self.pending, self.config.entropy_weight);
            self.grad.accumulate(&grads);
        }
        debug!(
            samples = self.pending.len(),
            episodes = self.episodes,
            "policy gradient accumulated"
        );
        self.pending.clear();
        self.signals.clear();
    }

    /// Store the decisions of an unfinished mini-batch. Rewards are kept raw;
    /// each segment length marks the rewards before one boundary.
    fn save_mini_batch(&self, checkpoint: &mut Checkpoint) {
        let ([h, i], [a, _]) = self.config.shapes();
        let n = self.pending.len();
        let (mut inputs, mut hiddens, mut probs) = (
            Vec::with_capacity(n * i),
            Vec::with_capacity(n * h),
            Vec::with_capacity(n * a),
        );
        for sample in &self.pending {
            inputs.extend_from_slice(&sample.input);
            hiddens.extend_from_slice(&sample.hidden);
            probs.extend_from_slice(&sample.probs);
        }

        let mut rewards = Vec::with_capacity(n);
        let mut segments = Vec::new();
        let mut run = 0usize;
        for signal in &self.signals {
            match *signal {
                RewardSignal::Reward(r) => {
                    rewards.push(r);
                    run += 1;
                }
                RewardSignal::Boundary => {
                    segments.push(run as f64);
                    run = 0;
                }
            }
        }

        checkpoint.insert_vector("mini_batch_counts", vec![n as f64, segments.len() as f64]);
        checkpoint.insert("mini_batch_inputs", Tensor { shape: vec![n, i], data: inputs });
        checkpoint.insert("mini_batch_hiddens", Tensor { shape: vec![n, h], data: hiddens });
        checkpoint.insert("mini_batch_probs", Tensor { shape: vec![n, a], data: probs });
        checkpoint.insert_vector(
            "mini_batch_actions",
            self.pending.iter().map(|s| s.action as f64).collect(),
        );
        checkpoint.insert_vector("mini_batch_rewards", rewards);
        checkpoint.insert_vector("mini_batch_segments", segments);
    }

    fn apply_update(&mut self) {
        let lr = self.config.learning_rate_at(self.updates);
        self.w1.add_scaled(-lr, &self.grad.w1);
        self.w2.add_scaled(-lr, &self.grad.w2);
        self.grad.clear();
        self.updates += 1;
        self.should_save =
            self.config.save_every_updates > 0 && self.updates % self.config.save_every_updates == 0;
        info!(
            update = self.updates,
            learning_rate = lr,
            episodes = self.episodes,
            "policy weights updated"
        );
    }
}

/// Rebuild an unfinished mini-batch written by `save_mini_batch`.
fn load_mini_batch(
    checkpoint: &Checkpoint,
    config: &PolicyGradientConfig,
) -> Result<(Vec<PolicySample>, Vec<RewardSignal>), CheckpointError> {
    let ([h, i], [a, _]) = config.shapes();
    let counts = checkpoint.vector("mini_batch_counts", 2)?;
    let (n, k) = (counts[0].max(0.0) as usize, counts[1].max(0.0) as usize);

    let inputs = &checkpoint.tensor("mini_batch_inputs", &[n, i])?.data;
    let hiddens = &checkpoint.tensor("mini_batch_hiddens", &[n, h])?.data;
    let probs = &checkpoint.tensor("mini_batch_probs", &[n, a])?.data;
    let actions = checkpoint.vector("mini_batch_actions", n)?;
    let rewards = checkpoint.vector("mini_batch_rewards", n)?;
    let segments = checkpoint.vector("mini_batch_segments", k)?;

    let mut samples = Vec::with_capacity(n);
    for (row, &action) in actions.iter().enumerate() {
        if !(action >= 0.0 && (action as usize) < a && action.fract() == 0.0) {
            return Err(CheckpointError::Inconsistent {
                name: "mini_batch_actions".to_string(),
                reason: format!("action {action} outside 0..{a}"),
            });
        }
        samples.push(PolicySample {
            input: inputs[row * i..(row + 1) * i].to_vec(),
            hidden: hiddens[row * h..(row + 1) * h].to_vec(),
            probs: probs[row * a..(row + 1) * a].to_vec(),
            action: action as usize,
            advantage: 0.0,
        });
    }

    let lengths: Vec<usize> = segments.iter().map(|&len| len.max(0.0) as usize).collect();
    let total: usize = lengths.iter().sum();
    if total != n {
        return Err(CheckpointError::Inconsistent {
            name: "mini_batch_segments".to_string(),
            reason: format!("segments cover {total} rewards, mini-batch holds {n}"),
        });
    }
    let mut signals = Vec::with_capacity(n + k);
    let mut rewards = rewards.into_iter();
    for len in lengths {
        signals.extend(rewards.by_ref().take(len).map(RewardSignal::Reward));
        signals.push(RewardSignal::Boundary);
    }
    Ok((samples, signals))
}

impl Agent for PolicyGradientAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::PolicyGradient
    }

    fn feature_count(&self) -> Option<usize> {
        self.config.layers.first().copied()
    }

    fn step(&mut self, batch: &[UnitStep<'_>]) -> Result<ActionList, ProtocolError> {
        let mut actions = ActionList::with_capacity(batch.len());
        for unit in batch {
            let input = self.normalizer.normalize(unit.state);
            let pass = forward(&self.w1, &self.w2, &input);
            let action = sample_index(&pass.probs, &mut self.rng);
            actions.push(action);

            if self.eval_mode {
                continue;
            }
            let trace = self.traces.entry(unit.unit_id).or_default();
            if !unit.is_first() && trace.rewards.len() < trace.actions.len() {
                trace.rewards.push(unit.reward);
            }
            trace.inputs.push(input);
            trace.hiddens.push(pass.hidden);
            trace.probs.push(pass.probs);
            trace.actions.push(action);
        }

        if !self.eval_mode {
            self.iterations += 1;
            self.observations.extend(batch.iter().map(|u| u.state.to_vec()));
        }
        Ok(actions)
    }

    fn on_episode_end(&mut self, batch: &[UnitStep<'_>]) -> Result<(), ProtocolError> {
        self.should_save = false;
        if self.eval_mode {
            self.traces.clear();
            return Ok(());
        }

        self.iterations += 1;
        for unit in batch {
            if let Some(trace) = self.traces.get_mut(&unit.unit_id) {
                if trace.rewards.len() < trace.actions.len() {
                    trace.rewards.push(unit.reward);
                }
            }
        }
        self.close_traces();

        self.normalizer
            .record_batch(self.observations.iter().map(Vec::as_slice));
        self.observations.clear();

        self.episodes += 1;
        if self.episodes % self.config.mini_batch_size as u64 == 0 {
            self.accumulate_mini_batch();
        }
        if self.episodes % self.config.batch_size as u64 == 0 {
            self.apply_update();
        }
        Ok(())
    }

    fn set_eval_mode(&mut self, eval: bool) {
        self.eval_mode = eval;
        self.traces.clear();
        self.observations.clear();
    }

    fn is_eval_mode(&self) -> bool {
        self.eval_mode
    }

    fn save(&self) -> Result<Checkpoint, CheckpointError> {
        let mut checkpoint = Checkpoint::new(AgentKind::PolicyGradient, &self.config)?
            .with_counters(self.iterations, self.updates)
            .with_rng(self.rng.state());
        checkpoint.insert_matrix("w1", &self.w1);
        checkpoint.insert_matrix("w2", &self.w2);
        checkpoint.insert_matrix("grad_w1", &self.grad.w1);
        checkpoint.insert_matrix("grad_w2", &self.grad.w2);
        checkpoint.insert_vector("episodes", vec![self.episodes as f64]);
        save_normalizer(&mut checkpoint, &self.normalizer);
        self.save_mini_batch(&mut checkpoint);
        Ok(checkpoint)
    }

    fn load(&mut self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        checkpoint.expect_kind(AgentKind::PolicyGradient)?;
        let config: PolicyGradientConfig = checkpoint.config()?;
        config.validate()?;

        let (s1, s2) = self.config.shapes();
        if config.shapes() != (s1, s2) {
            return Err(CheckpointError::ShapeMismatch {
                name: "layers".to_string(),
                expected: self.config.layers.clone(),
                actual: config.layers.clone(),
            });
        }

        let w1 = checkpoint.matrix("w1", s1[0], s1[1])?;
        let w2 = checkpoint.matrix("w2", s2[0], s2[1])?;
        let grad = Gradients {
            w1: checkpoint.matrix("grad_w1", s1[0], s1[1])?,
            w2: checkpoint.matrix("grad_w2", s2[0], s2[1])?,
        };
        let episodes = checkpoint
            .vector("episodes", 1)?
            .first()
            .map(|&e| e.max(0.0) as u64)
            .unwrap_or_default();
        let normalizer = load_normalizer(checkpoint, config.normalizer.clone(), s1[1])?;
        let (pending, signals) = load_mini_batch(checkpoint, &config)?;

        self.w1 = w1;
        self.w2 = w2;
        self.grad = grad;
        self.normalizer = normalizer;
        self.episodes = episodes;
        self.config = config;
        if let Some(state) = &checkpoint.meta.rng {
            self.rng = AgentRng::from_state(state);
        }
        self.iterations = checkpoint.meta.iterations;
        self.updates = checkpoint.meta.epochs;
        self.traces.clear();
        self.observations.clear();
        self.pending = pending;
        self.signals = signals;
        self.should_save = false;
        info!(updates = self.updates, "policy gradient agent restored");
        Ok(())
    }

    fn iterations(&self) -> u64 {
        self.iterations
    }

    fn epochs(&self) -> u64 {
        self.updates
    }

    fn wants_checkpoint(&self) -> bool {
        self.should_save
    }
}
