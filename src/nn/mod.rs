//! Small dense networks and the numerics around them.
//!
//! ## Overview
//!
//! - **Matrix**: row-major `f64` matrix with the handful of products the
//!   policy networks need
//! - **Math**: stable softmax, entropy, argmax and sampling helpers
//! - **Backprop**: closed-form gradients of the two-layer softmax policy,
//!   written as pure functions so they can be checked numerically
//! - **Normalizer**: running per-feature mean/variance used to scale inputs
//!
//! ## Usage
//!
//! ```
//! use sepia_rl::core::AgentRng;
//! use sepia_rl::nn::{forward, Matrix};
//!
//! let mut rng = AgentRng::new(0);
//! let w1 = Matrix::xavier(8, 17, &mut rng);
//! let w2 = Matrix::xavier(5, 8, &mut rng);
//!
//! let pass = forward(&w1, &w2, &[0.0; 17]);
//! assert!((pass.probs.iter().sum::<f64>() - 1.0).abs() < 1e-9);
//! ```

pub mod backprop;
pub mod math;
pub mod matrix;
pub mod normalizer;

pub use backprop::{
    discount_rewards, entropy_logit_gradient, forward, normalize_advantages, policy_gradients,
    policy_loss, ForwardPass, Gradients, PolicySample, RewardSignal,
};
pub use math::{argmax, entropy, entropy_bits, one_hot, sample_index, softmax, PROB_FLOOR};
pub use matrix::{elementwise_mean, elementwise_std, Matrix};
pub use normalizer::{NormalizerConfig, OnlineNormalizer, VARIANCE_FLOOR};
