//! Match and reward bookkeeping.

use serde::{Deserialize, Serialize};

use crate::core::{MatchOutcome, PlayerId, PlayerMap};

/// Wins per side plus draws.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WinStats {
    wins: PlayerMap<u64>,
    draws: u64,
}

impl WinStats {
    pub fn new(player_count: usize) -> Self {
        Self {
            wins: PlayerMap::with_value(player_count, 0),
            draws: 0,
        }
    }

    pub fn record(&mut self, outcome: MatchOutcome) {
        match outcome {
            MatchOutcome::Winner(player) => {
                if let Some(wins) = self.wins.get_mut(player) {
                    *wins += 1;
                }
            }
            MatchOutcome::Draw => self.draws += 1,
        }
    }

    pub fn wins(&self, player: PlayerId) -> u64 {
        self.wins.get(player).copied().unwrap_or_default()
    }

    pub fn draws(&self) -> u64 {
        self.draws
    }

    /// Total matches recorded.
    pub fn games(&self) -> u64 {
        self.wins.values().sum::<u64>() + self.draws
    }

    /// Fraction of recorded games `player` won, `None` before any game.
    pub fn win_rate(&self, player: PlayerId) -> Option<f64> {
        let games = self.games();
        (games > 0).then(|| self.wins(player) as f64 / games as f64)
    }

    pub fn reset(&mut self) {
        self.wins.fill(0);
        self.draws = 0;
    }
}

/// Total reward per finished episode.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RewardLog {
    current: f64,
    totals: Vec<f64>,
}

impl RewardLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add rewards earned in the running episode.
    pub fn add(&mut self, reward: f64) {
        self.current += reward;
    }

    /// Close the running episode and return its total.
    pub fn finish_episode(&mut self) -> f64 {
        let total = std::mem::take(&mut self.current);
        self.totals.push(total);
        total
    }

    pub fn totals(&self) -> &[f64] {
        &self.totals
    }

    pub fn last(&self) -> Option<f64> {
        self.totals.last().copied()
    }

    /// Mean of the last `n` episode totals.
    pub fn recent_mean(&self, n: usize) -> Option<f64> {
        let start = self.totals.len().saturating_sub(n);
        let recent = &self.totals[start..];
        (!recent.is_empty()).then(|| recent.iter().sum::<f64>() / recent.len() as f64)
    }
}
