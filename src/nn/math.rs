//! Numeric helpers shared by the policy agents.
//!
//! All functions guard against degenerate inputs: logits are shifted before
//! exponentiation and probabilities are floored before taking logs, so a
//! single-point-mass distribution never produces NaN or infinity.

use crate::core::AgentRng;

/// Smallest probability fed to a logarithm.
pub const PROB_FLOOR: f64 = 1e-12;

/// Softmax over `logits`.
///
/// Invariant to adding a constant to every logit.
pub fn softmax(logits: &[f64]) -> Vec<f64> {
    if logits.is_empty() {
        return Vec::new();
    }
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let max = if max.is_finite() { max } else { 0.0 };
    let exps: Vec<f64> = logits.iter().map(|&z| (z - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    if !(sum > 0.0) || !sum.is_finite() {
        let uniform = 1.0 / logits.len() as f64;
        return vec![uniform; logits.len()];
    }
    exps.into_iter().map(|e| e / sum).collect()
}

/// Shannon entropy in nats.
pub fn entropy(probs: &[f64]) -> f64 {
    -probs
        .iter()
        .map(|&p| p * p.max(PROB_FLOOR).ln())
        .sum::<f64>()
}

/// Shannon entropy in bits, used for the population fitness bonus.
pub fn entropy_bits(probs: &[f64]) -> f64 {
    entropy(probs) / std::f64::consts::LN_2
}

/// Index of the largest value; ties resolve to the first index.
///
/// Returns `0` for an empty slice.
pub fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate().skip(1) {
        if v > values[best] {
            best = i;
        }
    }
    best
}

/// Sample an index proportionally to `probs`, falling back to argmax when
/// the distribution carries no mass.
pub fn sample_index(probs: &[f64], rng: &mut AgentRng) -> usize {
    rng.choose_weighted(probs).unwrap_or_else(|| argmax(probs))
}

/// One-hot encoding of `index` over `len` entries.
pub fn one_hot(index: usize, len: usize) -> Vec<f64> {
    let mut v = vec![0.0; len];
    if let Some(slot) = v.get_mut(index) {
        *slot = 1.0;
    }
    v
}

/// Mean and population standard deviation.
pub fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}
