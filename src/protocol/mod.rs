//! The tick-level contract with the simulation transport.
//!
//! - [`EpisodeProtocol`]: infers episode boundaries and per-unit phases from
//!   the tick stream and drives one [`Agent`](crate::agents::Agent)
//! - [`TrainingService`]: serialized, shutdown-aware access to a training
//!   session, shared across transport threads

pub mod episode;
pub mod service;

pub use episode::{mean_reward, EpisodeProtocol, UnitPhase, UnitStep};
pub use service::TrainingService;
