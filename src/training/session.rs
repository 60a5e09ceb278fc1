//! Training sessions: what happens between the transport and the agents.
//!
//! A session owns one or more [`EpisodeProtocol`]s and decides when to
//! checkpoint, when to log progress and when to stop. The transport only
//! ever sees [`TrainingSession`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::checkpoint::{CheckpointId, CheckpointStore, CheckpointWriter};
use super::stats::{RewardLog, WinStats};
use crate::agents::{build_agent, Agent, AgentConfig};
use crate::core::{MatchResult, PlayerId, ProtocolError, ServiceError, TickRequest, TickResponse};
use crate::protocol::EpisodeProtocol;

/// Whether the transport should keep feeding matches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionControl {
    Continue,
    Stop,
}

/// A training or evaluation run driven by transport callbacks.
pub trait TrainingSession: Send {
    /// Route one tick to the right agent.
    fn on_tick(&mut self, request: &TickRequest) -> Result<TickResponse, ServiceError>;

    /// Handle an end-of-match notification.
    fn on_match_result(&mut self, result: MatchResult) -> Result<SessionControl, ServiceError>;

    /// Persist whatever is pending. Called once, after the last tick.
    fn shutdown(&mut self) -> Result<(), ServiceError>;
}

/// Decode a wire player id, rejecting sides this session does not serve.
pub(crate) fn player_from_wire(raw: i32, player_count: usize) -> Result<PlayerId, ProtocolError> {
    PlayerId::from_wire(raw, player_count).ok_or(ProtocolError::UnknownPlayer { player_id: raw })
}

/// Remembers the last episode a side reported, so a repeated delivery of the
/// same match result is counted once.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct ResultLatch(Option<u64>);

impl ResultLatch {
    /// `true` the first time a result for `episode` arrives.
    pub(crate) fn accept(&mut self, episode: u64) -> bool {
        if self.0 == Some(episode) {
            return false;
        }
        self.0 = Some(episode);
        true
    }
}

/// Settings shared by single-agent runs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Save the agent every this many ticks. 0 disables periodic saves.
    pub checkpoint_every_ticks: u64,
    /// Stop once the agent has processed this many training ticks.
    pub max_iterations: Option<u64>,
    /// Log and reset the win rate every this many ticks. 0 disables it.
    pub win_rate_every_ticks: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            checkpoint_every_ticks: 20_000,
            max_iterations: None,
            win_rate_every_ticks: 10_000,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_checkpoint_every(mut self, ticks: u64) -> Self {
        self.checkpoint_every_ticks = ticks;
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
}

/// One learning agent against the environment's scripted enemy.
pub struct SingleAgentSession {
    config: SessionConfig,
    protocol: EpisodeProtocol,
    writer: CheckpointWriter,
    stats: WinStats,
    rewards: RewardLog,
    ticks: u64,
    last_checkpoint: Option<CheckpointId>,
    reported: ResultLatch,
}

impl SingleAgentSession {
    pub fn new(agent: Box<dyn Agent>, writer: CheckpointWriter, config: SessionConfig) -> Self {
        Self {
            config,
            protocol: EpisodeProtocol::new(agent),
            writer,
            stats: WinStats::new(2),
            rewards: RewardLog::new(),
            ticks: 0,
            last_checkpoint: None,
            reported: ResultLatch::default(),
        }
    }

    /// Build the agent from its config and start a background writer.
    pub fn from_config(
        agent: &AgentConfig,
        store: Arc<dyn CheckpointStore>,
        config: SessionConfig,
    ) -> Result<Self, ServiceError> {
        let agent = build_agent(agent)?;
        let writer = CheckpointWriter::spawn(store)?;
        Ok(Self::new(agent, writer, config))
    }

    pub fn agent(&self) -> &dyn Agent {
        self.protocol.agent()
    }

    pub fn protocol(&self) -> &EpisodeProtocol {
        &self.protocol
    }

    pub fn stats(&self) -> &WinStats {
        &self.stats
    }

    pub fn rewards(&self) -> &RewardLog {
        &self.rewards
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn writer(&self) -> &CheckpointWriter {
        &self.writer
    }

    /// Id of the most recently submitted checkpoint.
    pub fn last_checkpoint(&self) -> Option<&CheckpointId> {
        self.last_checkpoint.as_ref()
    }

    /// Snapshot the agent and hand it to the writer.
    pub fn checkpoint(&mut self) -> Result<CheckpointId, ServiceError> {
        let snapshot = self.protocol.agent().save()?;
        let id = self.writer.submit(snapshot)?;
        info!(
            checkpoint = %id,
            iterations = self.protocol.agent().iterations(),
            "checkpoint submitted"
        );
        self.last_checkpoint = Some(id.clone());
        Ok(id)
    }

    fn budget_exhausted(&self) -> bool {
        self.config
            .max_iterations
            .is_some_and(|max| self.protocol.agent().iterations() > max)
    }
}

impl TrainingSession for SingleAgentSession {
    fn on_tick(&mut self, request: &TickRequest) -> Result<TickResponse, ServiceError> {
        player_from_wire(request.player_id, 1)?;
        let response = self.protocol.step(&request.records)?;
        self.rewards
            .add(request.records.iter().map(|r| r.last_action_reward).sum());
        self.ticks += 1;

        if response.is_no_action() {
            let total = self.rewards.finish_episode();
            debug!(episode = self.protocol.episodes(), total, "episode reward");
            if self.protocol.agent().wants_checkpoint() {
                self.checkpoint()?;
            }
        }
        if self.config.checkpoint_every_ticks > 0
            && self.ticks % self.config.checkpoint_every_ticks == 0
        {
            self.checkpoint()?;
        }
        if self.config.win_rate_every_ticks > 0 && self.ticks % self.config.win_rate_every_ticks == 0 {
            if let Some(rate) = self.stats.win_rate(PlayerId::LEARNER) {
                info!(ticks = self.ticks, games = self.stats.games(), win_rate = rate, "win rate");
            }
            self.stats.reset();
        }
        Ok(response)
    }

    fn on_match_result(&mut self, result: MatchResult) -> Result<SessionControl, ServiceError> {
        player_from_wire(result.player_id, 1)?;
        let outcome = result.outcome()?;
        let episode = self.protocol.episodes();
        if self.reported.accept(episode) {
            self.stats.record(outcome);
        } else {
            debug!(episode, "duplicate match result ignored");
        }
        if self.budget_exhausted() {
            info!(iterations = self.protocol.agent().iterations(), "iteration budget reached");
            return Ok(SessionControl::Stop);
        }
        Ok(SessionControl::Continue)
    }

    fn shutdown(&mut self) -> Result<(), ServiceError> {
        if !self.protocol.agent().is_eval_mode() {
            self.checkpoint()?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for SingleAgentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleAgentSession")
            .field("protocol", &self.protocol)
            .field("ticks", &self.ticks)
            .field("last_checkpoint", &self.last_checkpoint)
            .finish_non_exhaustive()
    }
}

/// A frozen agent playing a fixed number of matches.
pub struct EvaluationSession {
    protocol: EpisodeProtocol,
    stats: WinStats,
    matches: u64,
    reported: ResultLatch,
}

impl EvaluationSession {
    /// Put `agent` in evaluation mode and play `matches` games.
    pub fn new(mut agent: Box<dyn Agent>, matches: u64) -> Self {
        agent.set_eval_mode(true);
        Self {
            protocol: EpisodeProtocol::new(agent),
            stats: WinStats::new(2),
            matches,
            reported: ResultLatch::default(),
        }
    }

    pub fn agent(&self) -> &dyn Agent {
        self.protocol.agent()
    }

    pub fn stats(&self) -> &WinStats {
        &self.stats
    }
}

impl TrainingSession for EvaluationSession {
    fn on_tick(&mut self, request: &TickRequest) -> Result<TickResponse, ServiceError> {
        player_from_wire(request.player_id, 1)?;
        Ok(self.protocol.step(&request.records)?)
    }

    fn on_match_result(&mut self, result: MatchResult) -> Result<SessionControl, ServiceError> {
        player_from_wire(result.player_id, 1)?;
        let outcome = result.outcome()?;
        let episode = self.protocol.episodes();
        if self.reported.accept(episode) {
            self.stats.record(outcome);
        } else {
            debug!(episode, "duplicate match result ignored");
        }
        if self.stats.games() >= self.matches {
            return Ok(SessionControl::Stop);
        }
        Ok(SessionControl::Continue)
    }

    fn shutdown(&mut self) -> Result<(), ServiceError> {
        info!(
            games = self.stats.games(),
            wins = self.stats.wins(PlayerId::LEARNER),
            draws = self.stats.draws(),
            "evaluation finished"
        );
        Ok(())
    }
}
