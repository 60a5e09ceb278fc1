//! Seeded randomness for exploration, population sampling and weight init.
//!
//! Every agent owns one [`AgentRng`]. Its position in the stream is part of
//! the checkpoint, so a reloaded agent keeps drawing where the saved one
//! stopped.
//!
//! ```
//! use sepia_rl::core::AgentRng;
//!
//! let mut rng = AgentRng::new(42);
//! rng.gen_f64();
//!
//! let saved = rng.state();
//! let mut resumed = AgentRng::from_state(&saved);
//! assert_eq!(rng.gen_range_usize(0..1000), resumed.gen_range_usize(0..1000));
//! ```

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// ChaCha8 stream owned by a single agent.
#[derive(Clone, Debug)]
pub struct AgentRng {
    inner: ChaCha8Rng,
    seed: u64,
}

impl AgentRng {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            inner: ChaCha8Rng::seed_from_u64(seed),
            seed,
        }
    }

    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Uniform sample in `[0, 1)`.
    pub fn gen_f64(&mut self) -> f64 {
        self.inner.gen::<f64>()
    }

    pub fn gen_range_usize(&mut self, range: std::ops::Range<usize>) -> usize {
        self.inner.gen_range(range)
    }

    /// Draw from `Normal(mean, std)`.
    ///
    /// A zero or non-finite `std` returns `mean` exactly, so a collapsed
    /// distribution keeps producing its mean.
    pub fn normal(&mut self, mean: f64, std: f64) -> f64 {
        if !(std > 0.0) || !std.is_finite() {
            return mean;
        }
        Normal::new(mean, std).map_or(mean, |dist| dist.sample(&mut self.inner))
    }

    /// Index drawn in proportion to `weights`, skipping non-positive and
    /// non-finite entries. `None` when nothing has positive weight.
    pub fn choose_weighted(&mut self, weights: &[f64]) -> Option<usize> {
        let usable = |w: f64| w.is_finite() && w > 0.0;
        let total: f64 = weights.iter().copied().filter(|&w| usable(w)).sum();
        if total <= 0.0 {
            return None;
        }

        let mut remaining = self.gen_f64() * total;
        let mut chosen = None;
        for (index, &weight) in weights.iter().enumerate() {
            if !usable(weight) {
                continue;
            }
            chosen = Some(index);
            remaining -= weight;
            if remaining <= 0.0 {
                break;
            }
        }
        // Rounding can leave a sliver of `remaining`; the last usable index absorbs it.
        chosen
    }

    #[must_use]
    pub fn state(&self) -> AgentRngState {
        AgentRngState {
            seed: self.seed,
            word_pos: self.inner.get_word_pos(),
        }
    }

    #[must_use]
    pub fn from_state(state: &AgentRngState) -> Self {
        let mut inner = ChaCha8Rng::seed_from_u64(state.seed);
        inner.set_word_pos(state.word_pos);
        Self {
            inner,
            seed: state.seed,
        }
    }
}

/// Stream position stored in checkpoint metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRngState {
    pub seed: u64,
    /// ChaCha8 word position
    pub word_pos: u128,
}
