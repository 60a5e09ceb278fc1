//! Per-tick episode state machine.
//!
//! Episodes are never announced: the only signal is a tick whose first record
//! carries an empty state. [`EpisodeProtocol`] infers the boundaries from the
//! stream, tracks which units have already acted, validates each batch and
//! forwards it to the agent.
//!
//! ```text
//!  unit unseen ──step──▶ AwaitingFirstAction ──act──▶ Stepping ──┐
//!                                                       ▲        │ step
//!                                                       └────────┘
//!  terminal tick ──▶ on_episode_end(all units) ──▶ every unit back to unseen
//! ```

use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use tracing::debug;

use crate::agents::Agent;
use crate::core::{ProtocolError, TickRecord, TickResponse};

/// Where a unit is in the current episode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UnitPhase {
    /// No action recorded yet; there is no transition to learn from.
    AwaitingFirstAction,
    /// The unit acted last tick; its reward closes that transition.
    Stepping,
}

/// A validated record handed to an agent.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UnitStep<'a> {
    pub unit_id: i64,
    /// Empty on the terminal tick.
    pub state: &'a [f64],
    /// Reward for the unit's previous action.
    pub reward: f64,
    pub phase: UnitPhase,
}

impl<'a> UnitStep<'a> {
    pub fn new(record: &'a TickRecord, phase: UnitPhase) -> Self {
        Self {
            unit_id: record.unit_id,
            state: &record.state,
            reward: record.last_action_reward,
            phase,
        }
    }

    #[must_use]
    pub fn is_first(&self) -> bool {
        self.phase == UnitPhase::AwaitingFirstAction
    }
}

/// Mean reward over a batch, the reference point for reward sharing.
pub fn mean_reward(batch: &[UnitStep<'_>]) -> f64 {
    if batch.is_empty() {
        return 0.0;
    }
    batch.iter().map(|s| s.reward).sum::<f64>() / batch.len() as f64
}

/// Drives one agent through a stream of ticks.
pub struct EpisodeProtocol {
    agent: Box<dyn Agent>,
    acted: FxHashSet<i64>,
    episodes: u64,
}

impl EpisodeProtocol {
    pub fn new(agent: Box<dyn Agent>) -> Self {
        Self {
            agent,
            acted: FxHashSet::default(),
            episodes: 0,
        }
    }

    pub fn agent(&self) -> &dyn Agent {
        self.agent.as_ref()
    }

    pub fn agent_mut(&mut self) -> &mut dyn Agent {
        self.agent.as_mut()
    }

    /// Swap in a different agent. Per-unit bookkeeping starts over.
    pub fn replace_agent(&mut self, agent: Box<dyn Agent>) -> Box<dyn Agent> {
        self.acted.clear();
        std::mem::replace(&mut self.agent, agent)
    }

    pub fn into_agent(self) -> Box<dyn Agent> {
        self.agent
    }

    /// Completed episodes.
    pub fn episodes(&self) -> u64 {
        self.episodes
    }

    /// Whether any unit has acted since the last boundary.
    pub fn in_episode(&self) -> bool {
        !self.acted.is_empty()
    }

    pub fn phase_of(&self, unit_id: i64) -> UnitPhase {
        if self.acted.contains(&unit_id) {
            UnitPhase::Stepping
        } else {
            UnitPhase::AwaitingFirstAction
        }
    }

    /// Process one tick.
    ///
    /// Returns one action per record, in record order, or
    /// [`TickResponse::NoAction`] when the tick ends the episode. A failed
    /// call leaves both the protocol and the agent untouched.
    pub fn step(&mut self, records: &[TickRecord]) -> Result<TickResponse, ProtocolError> {
        if records.is_empty() {
            return Err(ProtocolError::EmptyBatch);
        }

        let mut ids = FxHashSet::default();
        for record in records {
            if !ids.insert(record.unit_id) {
                return Err(ProtocolError::DuplicateUnit {
                    unit_id: record.unit_id,
                });
            }
        }

        if records[0].state.is_empty() {
            return self.finish_episode(records);
        }

        let expected = self.agent.feature_count();
        let mut batch: SmallVec<[UnitStep<'_>; 8]> = SmallVec::with_capacity(records.len());
        for record in records {
            if let Some(expected) = expected {
                if record.state.len() != expected {
                    return Err(ProtocolError::FeatureCount {
                        unit_id: record.unit_id,
                        expected,
                        actual: record.state.len(),
                    });
                }
            }
            batch.push(UnitStep::new(record, self.phase_of(record.unit_id)));
        }

        let actions = self.agent.step(&batch)?;
        debug_assert_eq!(actions.len(), records.len());

        self.acted.extend(records.iter().map(|r| r.unit_id));
        Ok(TickResponse::Actions(actions))
    }

    fn finish_episode(&mut self, records: &[TickRecord]) -> Result<TickResponse, ProtocolError> {
        let mut batch: SmallVec<[UnitStep<'_>; 8]> = SmallVec::with_capacity(records.len());
        for record in records {
            if !self.acted.contains(&record.unit_id) {
                return Err(ProtocolError::UnknownUnit {
                    unit_id: record.unit_id,
                });
            }
            batch.push(UnitStep::new(record, UnitPhase::Stepping));
        }

        self.agent.on_episode_end(&batch)?;

        self.acted.clear();
        self.episodes += 1;
        debug!(
            episode = self.episodes,
            agent = %self.agent.kind(),
            total_reward = batch.iter().map(|s| s.reward).sum::<f64>(),
            "episode finished"
        );
        Ok(TickResponse::NoAction)
    }
}

impl std::fmt::Debug for EpisodeProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpisodeProtocol")
            .field("agent", &self.agent.kind())
            .field("acted", &self.acted.len())
            .field("episodes", &self.episodes)
            .finish()
    }
}
