//! Core types: sides, RNG, tick wire types and errors.
//!
//! Everything here is algorithm-agnostic. Agents, the episode protocol and
//! the training sessions all build on these.

pub mod error;
pub mod player;
pub mod rng;
pub mod tick;

pub use error::{CheckpointError, ConfigError, ProtocolError, ServiceError};
pub use player::{PlayerId, PlayerMap};
pub use rng::{AgentRng, AgentRngState};
pub use tick::{ActionList, MatchOutcome, MatchResult, TickRecord, TickRequest, TickResponse};
