//! Historical snapshots of the learner, kept as self-play opponents.
//!
//! Each entry carries a quality score. Most of the time the learner faces its
//! latest snapshot; otherwise a historical one is drawn from
//! `softmax(quality)` over every entry but the latest. Beating a historical
//! opponent lowers its quality by `lr / (N * p)`, where `p` is its softmax
//! probability over the whole pool, so opponents that are both likely to be
//! picked and easy to beat fade fastest.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::checkpoint::CheckpointId;
use crate::core::AgentRng;
use crate::nn::{sample_index, softmax};

/// One stored opponent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoolEntry {
    pub checkpoint: CheckpointId,
    pub quality: f64,
}

/// Which entry the learner is facing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpponentSelection {
    /// The most recent snapshot at selection time.
    Latest(usize),
    /// An older snapshot drawn by quality.
    Historical(usize),
}

impl OpponentSelection {
    pub fn index(self) -> usize {
        match self {
            OpponentSelection::Latest(i) | OpponentSelection::Historical(i) => i,
        }
    }
}

/// Quality-weighted pool of past checkpoints.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OpponentPool {
    past_play_ratio: f64,
    learning_rate: f64,
    entries: Vec<PoolEntry>,
    current: Option<OpponentSelection>,
}

impl OpponentPool {
    pub fn new(past_play_ratio: f64, learning_rate: f64) -> Self {
        Self {
            past_play_ratio,
            learning_rate,
            entries: Vec::new(),
            current: None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[PoolEntry] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&PoolEntry> {
        self.entries.get(index)
    }

    pub fn qualities(&self) -> Vec<f64> {
        self.entries.iter().map(|e| e.quality).collect()
    }

    /// The opponent chosen by the last [`OpponentPool::select`].
    pub fn current(&self) -> Option<OpponentSelection> {
        self.current
    }

    /// Add a snapshot. It starts at the best quality in the pool, or 1.0.
    pub fn push(&mut self, checkpoint: CheckpointId) -> usize {
        let quality = self
            .entries
            .iter()
            .map(|e| e.quality)
            .reduce(f64::max)
            .unwrap_or(1.0);
        self.entries.push(PoolEntry { checkpoint, quality });
        self.entries.len() - 1
    }

    /// Probability of drawing each historical entry, excluding the latest.
    pub fn historical_probabilities(&self) -> Vec<f64> {
        match self.entries.split_last() {
            Some((_, past)) if !past.is_empty() => {
                softmax(&past.iter().map(|e| e.quality).collect::<Vec<_>>())
            }
            _ => Vec::new(),
        }
    }

    /// Pick the next opponent. Returns `None` for an empty pool.
    pub fn select(&mut self, rng: &mut AgentRng) -> Option<OpponentSelection> {
        let latest = self.entries.len().checked_sub(1)?;
        let selection = if latest == 0 || rng.gen_f64() >= self.past_play_ratio {
            OpponentSelection::Latest(latest)
        } else {
            OpponentSelection::Historical(sample_index(&self.historical_probabilities(), rng))
        };
        self.current = Some(selection);
        Some(selection)
    }

    /// Apply a finished match against the current opponent.
    ///
    /// Only a learner win against a historical opponent changes anything;
    /// the new quality is returned in that case.
    pub fn record_result(&mut self, learner_won: bool) -> Option<f64> {
        let Some(OpponentSelection::Historical(index)) = self.current else {
            return None;
        };
        if !learner_won || index >= self.entries.len() {
            return None;
        }
        let probs = softmax(&self.qualities());
        let n = self.entries.len() as f64;
        let p = probs[index].max(crate::nn::PROB_FLOOR);
        let entry = &mut self.entries[index];
        entry.quality -= self.learning_rate / (n * p);
        debug!(index, quality = entry.quality, "opponent quality lowered");
        Some(entry.quality)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(n: usize, ratio: f64) -> OpponentPool {
        let mut pool = OpponentPool::new(ratio, 0.01);
        for i in 0..n {
            pool.push(CheckpointId::new(format!("snap-{i}")));
        }
        pool
    }

    #[test]
    fn test_empty_pool_selects_nothing() {
        let mut pool = OpponentPool::new(0.5, 0.01);
        assert_eq!(pool.select(&mut AgentRng::new(0)), None);
    }

    #[test]
    fn test_new_entries_start_at_max_quality() {
        let mut pool = pool_with(1, 0.2);
        assert_eq!(pool.qualities(), vec![1.0]);
        pool.entries[0].quality = 3.0;
        pool.push(CheckpointId::new("b"));
        pool.entries[0].quality = 0.5;
        pool.push(CheckpointId::new("c"));
        assert_eq!(pool.qualities(), vec![0.5, 3.0, 3.0]);
    }

    #[test]
    fn test_zero_ratio_always_latest() {
        let mut pool = pool_with(5, 0.0);
        let mut rng = AgentRng::new(1);
        for _ in 0..100 {
            assert_eq!(pool.select(&mut rng), Some(OpponentSelection::Latest(4)));
        }
    }

    #[test]
    fn test_full_ratio_never_latest() {
        let mut pool = pool_with(4, 1.0);
        let mut rng = AgentRng::new(2);
        for _ in 0..100 {
            match pool.select(&mut rng) {
                Some(OpponentSelection::Historical(i)) => assert!(i < 3),
                other => panic!("unexpected selection {other:?}"),
            }
        }
    }

    #[test]
    fn test_single_entry_is_latest() {
        let mut pool = pool_with(1, 1.0);
        assert_eq!(pool.select(&mut AgentRng::new(3)), Some(OpponentSelection::Latest(0)));
    }

    #[test]
    fn test_quality_update_only_on_historical_win() {
        let mut pool = pool_with(4, 1.0);
        pool.current = Some(OpponentSelection::Historical(1));

        assert_eq!(pool.record_result(false), None);
        let q = pool.record_result(true).unwrap();
        // Equal qualities: p = 1/4, N = 4, so the step is exactly lr.
        assert!((q - 0.99).abs() < 1e-12);

        pool.current = Some(OpponentSelection::Latest(3));
        assert_eq!(pool.record_result(true), None);
        assert_eq!(pool.qualities()[3], 1.0);
    }

    #[test]
    fn test_historical_probabilities_exclude_latest() {
        let pool = pool_with(3, 0.2);
        assert_eq!(pool.historical_probabilities(), vec![0.5, 0.5]);
        assert!(pool_with(1, 0.2).historical_probabilities().is_empty());
    }
}
