//! Training runs around the agents: checkpoints, sessions and self-play.
//!
//! ## Overview
//!
//! - **Checkpoint**: config JSON plus named tensors, written by a background
//!   [`CheckpointWriter`] into a [`CheckpointStore`]
//! - **SingleAgentSession**: one learner against the environment's enemy
//! - **EvaluationSession**: a frozen agent playing a fixed number of matches
//! - **SelfPlaySession**: the learner against snapshots from an [`OpponentPool`]
//!
//! ## Usage
//!
//! ```
//! use std::sync::Arc;
//! use sepia_rl::agents::AgentConfig;
//! use sepia_rl::core::{TickRecord, TickRequest};
//! use sepia_rl::training::{MemoryStore, SelfPlayConfig, SelfPlaySession, TrainingSession};
//!
//! let agent = AgentConfig::from_json_str(r#"{"agent": "random"}"#).unwrap();
//! let store = Arc::new(MemoryStore::new());
//! let mut session = SelfPlaySession::from_config(&agent, store, SelfPlayConfig::default()).unwrap();
//!
//! let request = TickRequest::new(0, vec![TickRecord::new(1, vec![0.0; 4], 0.0)]);
//! let response = session.on_tick(&request).unwrap();
//! assert_eq!(response.actions().map(|a| a.len()), Some(1));
//! ```

pub mod checkpoint;
pub mod opponent_pool;
pub mod self_play;
pub mod session;
pub mod stats;

pub use checkpoint::{
    Checkpoint, CheckpointId, CheckpointMeta, CheckpointStore, CheckpointWriter, DirectoryStore,
    MemoryStore, Tensor,
};
pub use opponent_pool::{OpponentPool, OpponentSelection, PoolEntry};
pub use self_play::{SelfPlayConfig, SelfPlaySession};
pub use session::{EvaluationSession, SessionConfig, SessionControl, SingleAgentSession, TrainingSession};
pub use stats::{RewardLog, WinStats};
