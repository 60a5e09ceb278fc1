//! Error types for the learning core.
//!
//! Protocol violations and checkpoint mismatches are fatal to the call that
//! produced them and propagate upstream. Numerical degeneracy is never an
//! error; it is absorbed by the floors in [`crate::nn::math`].

use thiserror::Error;

/// A malformed tick batch or match notification.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    /// A tick request carried no unit records.
    #[error("tick batch contains no unit records")]
    EmptyBatch,

    /// The same unit appeared twice in one tick.
    #[error("unit {unit_id} appears more than once in the tick batch")]
    DuplicateUnit { unit_id: i64 },

    /// A state vector does not match the declared feature count.
    #[error("unit {unit_id} reported {actual} features, expected {expected}")]
    FeatureCount {
        unit_id: i64,
        expected: usize,
        actual: usize,
    },

    /// A terminal update referenced a unit that never acted this episode.
    #[error("unit {unit_id} has no recorded action in the current episode")]
    UnknownUnit { unit_id: i64 },

    /// A discretized feature fell outside the table's bins.
    #[error("unit {unit_id} feature {feature} = {value} is outside 0..{bins}")]
    StateOutOfRange {
        unit_id: i64,
        feature: usize,
        value: f64,
        bins: usize,
    },

    /// A request named a side this session does not serve.
    #[error("unknown player id {player_id}")]
    UnknownPlayer { player_id: i32 },

    /// A match notification carried a winner code outside the known set.
    #[error("invalid winner code {winner}")]
    InvalidWinner { winner: i32 },
}

/// Failure while writing, reading or applying a checkpoint.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint config error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("checkpoint payload error: {0}")]
    Bincode(#[from] bincode::Error),

    /// A tensor required by the agent is absent from the payload.
    #[error("checkpoint is missing tensor '{name}'")]
    MissingTensor { name: String },

    /// A tensor's shape differs from what the agent's config declares.
    #[error("tensor '{name}' has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Tensors that are individually well-shaped disagree with each other.
    #[error("tensor '{name}' is inconsistent: {reason}")]
    Inconsistent { name: String, reason: String },

    /// The checkpoint belongs to another agent variant.
    #[error("checkpoint holds a {actual} agent, expected {expected}")]
    AgentMismatch { expected: String, actual: String },

    /// The stored hyper-parameters are invalid.
    #[error("invalid checkpoint config: {0}")]
    Config(#[from] ConfigError),

    /// No checkpoint is stored under the requested id.
    #[error("no checkpoint stored under '{id}'")]
    NotFound { id: String },

    /// The background writer has shut down.
    #[error("checkpoint writer is closed")]
    WriterClosed,
}

/// Invalid hyper-parameters.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{field} must be in {range}, got {value}")]
    OutOfRange {
        field: &'static str,
        range: &'static str,
        value: f64,
    },

    #[error("{field} must be non-zero")]
    Zero { field: &'static str },

    #[error("batch_size {batch_size} is not a multiple of mini_batch_size {mini_batch_size}")]
    BatchMultiple {
        batch_size: usize,
        mini_batch_size: usize,
    },

    #[error("network needs at least {min} layer sizes, got {actual}")]
    Layers { min: usize, actual: usize },

    #[error("network needs exactly {expected} layer sizes, got {actual}")]
    LayerCount { expected: usize, actual: usize },

    /// The dense value table would not fit in the address space.
    #[error("value table of {bins}^{features} states x {actions} actions is too large")]
    TableTooLarge {
        bins: usize,
        features: usize,
        actions: usize,
    },

    #[error("could not parse agent config: {0}")]
    Parse(String),
}

/// Failure surfaced to the transport by [`crate::protocol::TrainingService`].
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Shutdown has been requested; no new ticks are accepted.
    #[error("training service is shutting down")]
    ShuttingDown,

    /// A previous call panicked while holding the core.
    #[error("training core lock was poisoned")]
    Poisoned,
}
