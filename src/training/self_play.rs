//! Self-play against frozen snapshots of the learner.
//!
//! Side 0 is the learner. Side 1 is a copy of the learner loaded from a
//! checkpoint in the [`OpponentPool`], always in evaluation mode. Both sides
//! share one tick stream, so the session routes each request by player id.
//!
//! ## Schedule
//!
//! Counted in learner match results:
//!
//! - game 1 and every `snapshot_every` games: snapshot the learner into the pool
//! - every `rotate_every` games: pick a new opponent
//!
//! A new opponent is swapped in at the start of its next episode, never
//! mid-episode.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::checkpoint::{CheckpointId, CheckpointStore, CheckpointWriter};
use super::opponent_pool::{OpponentPool, OpponentSelection};
use super::session::{player_from_wire, ResultLatch, SessionControl, TrainingSession};
use super::stats::WinStats;
use crate::agents::{build_agent, check_nonzero, check_range, load_agent, Agent, AgentConfig};
use crate::core::{
    AgentRng, ConfigError, MatchOutcome, MatchResult, PlayerId, PlayerMap, ServiceError, TickRequest,
    TickResponse,
};
use crate::protocol::EpisodeProtocol;

/// Configuration for self-play.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfPlayConfig {
    /// Probability of facing a historical opponent instead of the latest.
    pub past_play_ratio: f64,

    /// Step size for lowering an opponent's quality after a learner win.
    pub quality_learning_rate: f64,

    /// Snapshot the learner every this many games.
    pub snapshot_every: u64,

    /// Choose a new opponent every this many games.
    pub rotate_every: u64,

    /// Stop once the learner has processed this many training ticks.
    pub max_iterations: Option<u64>,

    /// Log and reset the win rate every this many learner ticks.
    pub win_rate_every_ticks: u64,

    /// Seed for opponent selection.
    pub seed: u64,
}

impl Default for SelfPlayConfig {
    fn default() -> Self {
        Self {
            past_play_ratio: 0.2,
            quality_learning_rate: 0.01,
            snapshot_every: 200,
            rotate_every: 15,
            max_iterations: None,
            win_rate_every_ticks: 10_000,
            seed: 7,
        }
    }
}

impl SelfPlayConfig {
    /// Create a new self-play config.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_past_play_ratio(mut self, ratio: f64) -> Self {
        self.past_play_ratio = ratio;
        self
    }

    pub fn with_quality_learning_rate(mut self, lr: f64) -> Self {
        self.quality_learning_rate = lr;
        self
    }

    pub fn with_snapshot_every(mut self, games: u64) -> Self {
        self.snapshot_every = games;
        self
    }

    pub fn with_rotate_every(mut self, games: u64) -> Self {
        self.rotate_every = games;
        self
    }

    pub fn with_max_iterations(mut self, iterations: u64) -> Self {
        self.max_iterations = Some(iterations);
        self
    }

    pub fn with_win_rate_every(mut self, ticks: u64) -> Self {
        self.win_rate_every_ticks = ticks;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let ratio = self.past_play_ratio;
        check_range("past_play_ratio", ratio, "[0, 1]", (0.0..=1.0).contains(&ratio))?;
        let lr = self.quality_learning_rate;
        check_range("quality_learning_rate", lr, "[0, inf)", lr >= 0.0)?;
        check_nonzero("snapshot_every", self.snapshot_every as usize)?;
        check_nonzero("rotate_every", self.rotate_every as usize)
    }
}

/// Learner vs. pool opponent over one tick stream.
pub struct SelfPlaySession {
    config: SelfPlayConfig,
    learner: EpisodeProtocol,
    opponent: EpisodeProtocol,
    pending_opponent: Option<Box<dyn Agent>>,
    pool: OpponentPool,
    writer: CheckpointWriter,
    rng: AgentRng,
    stats: WinStats,
    games: u64,
    learner_ticks: u64,
    learner_reported: ResultLatch,
    stop_votes: PlayerMap<bool>,
}

impl SelfPlaySession {
    /// Start self-play with `learner`; the first opponent is a frozen copy of it.
    pub fn new(
        learner: Box<dyn Agent>,
        writer: CheckpointWriter,
        config: SelfPlayConfig,
    ) -> Result<Self, ServiceError> {
        config.validate()?;
        let mut opponent = load_agent(&learner.save()?)?;
        opponent.set_eval_mode(true);
        Ok(Self {
            pool: OpponentPool::new(config.past_play_ratio, config.quality_learning_rate),
            rng: AgentRng::new(config.seed),
            learner: EpisodeProtocol::new(learner),
            opponent: EpisodeProtocol::new(opponent),
            pending_opponent: None,
            writer,
            stats: WinStats::new(2),
            games: 0,
            learner_ticks: 0,
            learner_reported: ResultLatch::default(),
            stop_votes: PlayerMap::with_value(2, false),
            config,
        })
    }

    /// Build the learner from its config and start a background writer.
    pub fn from_config(
        agent: &AgentConfig,
        store: Arc<dyn CheckpointStore>,
        config: SelfPlayConfig,
    ) -> Result<Self, ServiceError> {
        let learner = build_agent(agent)?;
        let writer = CheckpointWriter::spawn(store)?;
        Self::new(learner, writer, config)
    }

    pub fn config(&self) -> &SelfPlayConfig {
        &self.config
    }

    pub fn learner(&self) -> &dyn Agent {
        self.learner.agent()
    }

    pub fn opponent(&self) -> &dyn Agent {
        self.opponent.agent()
    }

    pub fn pool(&self) -> &OpponentPool {
        &self.pool
    }

    pub fn stats(&self) -> &WinStats {
        &self.stats
    }

    /// Learner match results received so far.
    pub fn games(&self) -> u64 {
        self.games
    }

    /// Whether a newly selected opponent is waiting for the next episode.
    pub fn has_pending_opponent(&self) -> bool {
        self.pending_opponent.is_some()
    }

    pub fn writer(&self) -> &CheckpointWriter {
        &self.writer
    }

    /// Save the learner and add it to the pool.
    pub fn snapshot(&mut self) -> Result<CheckpointId, ServiceError> {
        let checkpoint = self.learner.agent().save()?;
        let id = self.writer.submit(checkpoint)?;
        let index = self.pool.push(id.clone());
        info!(checkpoint = %id, index, games = self.games, "learner snapshot added to pool");
        Ok(id)
    }

    /// Choose the next opponent and queue it for the next episode.
    pub fn rotate_opponent(&mut self) -> Result<Option<OpponentSelection>, ServiceError> {
        let Some(selection) = self.pool.select(&mut self.rng) else {
            return Ok(None);
        };
        let Some(entry) = self.pool.get(selection.index()) else {
            return Ok(None);
        };
        let checkpoint = self.writer.load(&entry.checkpoint)?;
        let mut agent = load_agent(&checkpoint)?;
        agent.set_eval_mode(true);
        debug!(?selection, quality = entry.quality, "next opponent selected");
        self.pending_opponent = Some(agent);
        Ok(Some(selection))
    }

    fn budget_exhausted(&self) -> bool {
        self.config
            .max_iterations
            .is_some_and(|max| self.learner.agent().iterations() > max)
    }

    /// Returns `false` when this episode's result was already counted.
    fn record_learner_result(&mut self, outcome: MatchOutcome) -> Result<bool, ServiceError> {
        let episode = self.learner.episodes();
        if !self.learner_reported.accept(episode) {
            debug!(episode, "duplicate learner result ignored");
            return Ok(false);
        }
        self.games += 1;
        self.stats.record(outcome);
        self.pool.record_result(outcome.is_win_for(PlayerId::LEARNER));

        if self.games == 1 || self.games % self.config.snapshot_every == 0 {
            self.snapshot()?;
        }
        if self.games % self.config.rotate_every == 0 {
            self.rotate_opponent()?;
        }
        Ok(true)
    }

    fn log_win_rate(&mut self) {
        let every = self.config.win_rate_every_ticks;
        if every == 0 || self.learner_ticks % every != 0 {
            return;
        }
        if let Some(rate) = self.stats.win_rate(PlayerId::LEARNER) {
            info!(
                ticks = self.learner_ticks,
                games = self.stats.games(),
                pool = self.pool.len(),
                win_rate = rate,
                "self-play win rate"
            );
        }
        self.stats.reset();
    }
}

impl TrainingSession for SelfPlaySession {
    fn on_tick(&mut self, request: &TickRequest) -> Result<TickResponse, ServiceError> {
        let player = player_from_wire(request.player_id, 2)?;
        if player == PlayerId::LEARNER {
            let response = self.learner.step(&request.records)?;
            self.learner_ticks += 1;
            self.log_win_rate();
            return Ok(response);
        }

        if !self.opponent.in_episode() {
            if let Some(agent) = self.pending_opponent.take() {
                self.opponent.replace_agent(agent);
            }
        }
        Ok(self.opponent.step(&request.records)?)
    }

    fn on_match_result(&mut self, result: MatchResult) -> Result<SessionControl, ServiceError> {
        let player = player_from_wire(result.player_id, 2)?;
        let outcome = result.outcome()?;
        let fresh = if player == PlayerId::LEARNER {
            self.record_learner_result(outcome)?
        } else {
            true
        };

        // Both sides must report past the budget before the session stops.
        if fresh && self.budget_exhausted() {
            self.stop_votes[player] = true;
        }
        if self.stop_votes.values().all(|&voted| voted) {
            info!(
                iterations = self.learner.agent().iterations(),
                games = self.games,
                "self-play budget reached"
            );
            return Ok(SessionControl::Stop);
        }
        Ok(SessionControl::Continue)
    }

    fn shutdown(&mut self) -> Result<(), ServiceError> {
        self.snapshot()?;
        self.writer.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for SelfPlaySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfPlaySession")
            .field("games", &self.games)
            .field("pool", &self.pool.len())
            .field("learner", &self.learner)
            .field("opponent", &self.opponent)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{RandomAgent, RandomConfig};
    use crate::core::TickRecord;
    use crate::training::MemoryStore;

    fn session(config: SelfPlayConfig) -> (SelfPlaySession, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let writer = CheckpointWriter::spawn(store.clone()).unwrap();
        let learner = Box::new(RandomAgent::new(RandomConfig::default()));
        (SelfPlaySession::new(learner, writer, config).unwrap(), store)
    }

    fn tick(player_id: i32, unit_id: i64) -> TickRequest {
        TickRequest::new(player_id, vec![TickRecord::new(unit_id, vec![0.0; 2], 0.0)])
    }

    fn end(player_id: i32, unit_id: i64) -> TickRequest {
        TickRequest::new(player_id, vec![TickRecord::terminal(unit_id, 0.0)])
    }

    /// One learner episode followed by both sides' reports.
    fn play_match(s: &mut SelfPlaySession, winner: i32) -> SessionControl {
        s.on_tick(&tick(0, 1)).unwrap();
        s.on_tick(&end(0, 1)).unwrap();
        s.on_match_result(MatchResult::new(0, winner)).unwrap();
        s.on_match_result(MatchResult::new(1, winner)).unwrap()
    }

    #[test]
    fn test_config_validation() {
        assert!(SelfPlayConfig::default().validate().is_ok());
        assert!(SelfPlayConfig::default().with_past_play_ratio(1.5).validate().is_err());
        assert!(SelfPlayConfig::default().with_rotate_every(0).validate().is_err());
    }

    #[test]
    fn test_opponent_is_frozen() {
        let (s, _) = session(SelfPlayConfig::default());
        assert!(s.opponent().is_eval_mode());
        assert!(!s.learner().is_eval_mode());
    }

    #[test]
    fn test_routes_by_player() {
        let (mut s, _) = session(SelfPlayConfig::default());
        s.on_tick(&tick(0, 1)).unwrap();
        s.on_tick(&tick(1, 9)).unwrap();
        assert_eq!(s.learner().iterations(), 1);
        assert_eq!(s.opponent().iterations(), 0);
        assert!(s.on_tick(&tick(2, 1)).is_err());
    }

    #[test]
    fn test_snapshot_schedule() {
        let config = SelfPlayConfig::default()
            .with_snapshot_every(3)
            .with_rotate_every(100);
        let (mut s, store) = session(config);

        for _ in 0..7 {
            play_match(&mut s, 0);
        }
        s.writer().flush().unwrap();
        // Games 1, 3 and 6.
        assert_eq!(s.pool().len(), 3);
        assert_eq!(store.len(), 3);
        assert_eq!(s.games(), 7);
    }

    #[test]
    fn test_rotation_waits_for_episode_boundary() {
        let config = SelfPlayConfig::default()
            .with_past_play_ratio(0.0)
            .with_rotate_every(2);
        let (mut s, _) = session(config);

        s.on_tick(&tick(1, 5)).unwrap();
        play_match(&mut s, 1);
        play_match(&mut s, 1);
        assert!(s.has_pending_opponent());
        assert_eq!(s.pool().current(), Some(OpponentSelection::Latest(0)));

        // Opponent is mid-episode: no swap yet.
        s.on_tick(&tick(1, 5)).unwrap();
        assert!(s.has_pending_opponent());

        assert!(s.on_tick(&end(1, 5)).unwrap().is_no_action());
        s.on_tick(&tick(1, 5)).unwrap();
        assert!(!s.has_pending_opponent());
        assert!(s.opponent().is_eval_mode());
    }

    #[test]
    fn test_stops_on_second_report_past_budget() {
        let (mut s, _) = session(SelfPlayConfig::default().with_max_iterations(1));
        // One learner tick: budget not yet exceeded.
        assert_eq!(play_match(&mut s, 0), SessionControl::Continue);
        s.on_tick(&tick(0, 1)).unwrap();
        s.on_tick(&end(0, 1)).unwrap();
        assert_eq!(
            s.on_match_result(MatchResult::new(0, 0)).unwrap(),
            SessionControl::Continue
        );
        assert_eq!(
            s.on_match_result(MatchResult::new(1, 0)).unwrap(),
            SessionControl::Stop
        );
    }

    #[test]
    fn test_repeated_learner_report_does_not_stop_alone() {
        let (mut s, _) = session(SelfPlayConfig::default().with_max_iterations(0));
        s.on_tick(&tick(0, 1)).unwrap();
        s.on_tick(&end(0, 1)).unwrap();

        for _ in 0..3 {
            assert_eq!(
                s.on_match_result(MatchResult::new(0, 0)).unwrap(),
                SessionControl::Continue
            );
        }
        assert_eq!(
            s.on_match_result(MatchResult::new(1, 0)).unwrap(),
            SessionControl::Stop
        );
        assert_eq!(s.games(), 1);
    }

    #[test]
    fn test_opponent_report_alone_does_not_stop() {
        let (mut s, _) = session(SelfPlayConfig::default().with_max_iterations(0));
        s.on_tick(&tick(0, 1)).unwrap();
        s.on_tick(&end(0, 1)).unwrap();

        for _ in 0..2 {
            assert_eq!(
                s.on_match_result(MatchResult::new(1, 0)).unwrap(),
                SessionControl::Continue
            );
        }
        assert_eq!(
            s.on_match_result(MatchResult::new(0, 0)).unwrap(),
            SessionControl::Stop
        );
    }

    #[test]
    fn test_duplicate_learner_result_is_ignored() {
        let (mut s, _) = session(SelfPlayConfig::default());
        play_match(&mut s, 0);
        s.on_match_result(MatchResult::new(0, 0)).unwrap();
        assert_eq!(s.games(), 1);
        assert_eq!(s.stats().games(), 1);
    }

    #[test]
    fn test_shutdown_snapshots_learner() {
        let (mut s, store) = session(SelfPlayConfig::default());
        s.shutdown().unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(s.pool().len(), 1);
    }
}
