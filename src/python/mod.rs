//! Python bindings for the sepia-rl learning core.
//!
//! The simulation transport lives in Python; it forwards every tick and
//! match result to a [`PyTrainingService`].
//!
//! # Quick Start
//!
//! ```python
//! import sepia_rl
//!
//! service = sepia_rl.TrainingService.self_play(
//!     '{"agent": "policy_gradient", "layers": [17, 8, 5]}',
//!     checkpoint_dir="runs",
//! )
//!
//! def env_callback(player_id, records):
//!     # records: [{"unit_id": 3, "state": [...], "last_action_reward": 0.1}, ...]
//!     return service.env_callback(player_id, records)  # list[int] or None
//!
//! def winner_callback(player_id, winner):
//!     if service.winner_callback(player_id, winner):
//!         stop_simulation()
//!
//! weights = service.weights()  # {"w1": ndarray, "w2": ndarray, ...}
//! service.shutdown()
//! ```

use pyo3::prelude::*;

mod py_core;
mod py_nn;
mod py_training;

pub use py_core::*;
pub use py_nn::*;
pub use py_training::*;

/// sepia_rl: online learning agents for multi-unit combat simulations.
#[pymodule]
fn sepia_rl(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyTickRecord>()?;
    m.add_class::<PyTrainingService>()?;
    m.add_function(wrap_pyfunction!(agent_weights, m)?)?;
    Ok(())
}
