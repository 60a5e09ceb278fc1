//! # sepia-rl
//!
//! An online learning core for multi-unit combat simulations. A transport
//! forwards one tick at a time; the core answers with one action per unit and
//! learns from the rewards that come back.
//!
//! ## Design Principles
//!
//! 1. **Episodes are inferred**: the stream never announces a new episode.
//!    The only boundary signal is a tick whose first record has an empty
//!    state; [`protocol::EpisodeProtocol`] turns that into per-unit phases.
//!
//! 2. **One capability interface**: every algorithm implements
//!    [`agents::Agent`]. Sessions, checkpoints and self-play never look
//!    inside a concrete agent.
//!
//! 3. **Pure numerics**: gradients, discounting and normalization are free
//!    functions over explicit arguments, testable on their own.
//!
//! 4. **Serialized updates, asynchronous saves**: ticks are applied one at a
//!    time under a single lock; checkpoints are snapshotted in memory and
//!    written by a background thread.
//!
//! ## Modules
//!
//! - `core`: sides, RNG, tick wire types, errors
//! - `nn`: matrices, softmax/entropy, manual backprop, online normalizer
//! - `agents`: Q-table, cross-entropy, policy gradient and random agents
//! - `protocol`: episode state machine and the thread-safe service handle
//! - `training`: checkpoints, sessions, self-play and the opponent pool
//! - `python`: PyO3 bindings (feature `python`)

pub mod agents;
pub mod core;
pub mod nn;
pub mod protocol;
pub mod training;

#[cfg(feature = "python")]
pub mod python;

// Re-export commonly used types
pub use crate::core::{
    ActionList, AgentRng, AgentRngState, CheckpointError, ConfigError, MatchOutcome, MatchResult,
    PlayerId, PlayerMap, ProtocolError, ServiceError, TickRecord, TickRequest, TickResponse,
};

pub use crate::agents::{
    build_agent, load_agent, Agent, AgentConfig, AgentKind, CrossEntropyAgent, CrossEntropyConfig,
    PolicyGradientAgent, PolicyGradientConfig, QTableAgent, QTableConfig, RandomAgent, RandomConfig,
};

pub use crate::nn::{Matrix, NormalizerConfig, OnlineNormalizer};

pub use crate::protocol::{EpisodeProtocol, TrainingService, UnitPhase, UnitStep};

pub use crate::training::{
    Checkpoint, CheckpointId, CheckpointStore, CheckpointWriter, DirectoryStore, EvaluationSession,
    MemoryStore, OpponentPool, SelfPlayConfig, SelfPlaySession, SessionConfig, SessionControl,
    SingleAgentSession, TrainingSession,
};
