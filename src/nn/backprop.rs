//! Closed-form gradients for the two-layer softmax policy.
//!
//! The network is `hidden = W1 · x`, `logits = W2 · hidden`,
//! `probs = softmax(logits)`. For one sample with advantage `A`, taken action
//! `a` and entropy weight `β`, the minimised loss is
//!
//! ```text
//! L = -A · ln probs[a] - β · H(probs)
//! ```
//!
//! whose gradient with respect to the logits is
//! `δ = A · (probs - onehot(a)) + β · probs ⊙ (ln probs + H)`.
//! The weight gradients are then `δ ⊗ hidden` for `W2` and
//! `(W2ᵀ δ) ⊗ x` for `W1`, summed over the batch.
//!
//! Everything here is a pure function over explicit matrices so it can be
//! checked against finite differences independently of any agent.

use serde::{Deserialize, Serialize};

use super::math::{entropy, mean_std, one_hot, softmax, PROB_FLOOR};
use super::matrix::Matrix;

/// Below this standard deviation advantages are only centred, not scaled.
pub const ADVANTAGE_STD_FLOOR: f64 = 1e-8;

/// Intermediate values of one forward pass.
#[derive(Clone, Debug, PartialEq)]
pub struct ForwardPass {
    pub hidden: Vec<f64>,
    pub logits: Vec<f64>,
    pub probs: Vec<f64>,
}

/// Run `input` through both layers.
pub fn forward(w1: &Matrix, w2: &Matrix, input: &[f64]) -> ForwardPass {
    let hidden = w1.mul_vec(input);
    let logits = w2.mul_vec(&hidden);
    let probs = softmax(&logits);
    ForwardPass {
        hidden,
        logits,
        probs,
    }
}

/// One entry of a reward stream that may pack several episodes.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum RewardSignal {
    /// Reward earned by one action.
    Reward(f64),
    /// End of an episode; the discounted sum restarts here.
    Boundary,
}

/// Discount a reward stream backwards with factor `gamma`.
///
/// The running sum resets at every [`RewardSignal::Boundary`], so packed
/// episodes never leak return into one another. The output holds one value
/// per `Reward` entry, in stream order.
pub fn discount_rewards(signals: &[RewardSignal], gamma: f64) -> Vec<f64> {
    let count = signals
        .iter()
        .filter(|s| matches!(s, RewardSignal::Reward(_)))
        .count();
    let mut out = vec![0.0; count];
    let mut slot = count;
    let mut running = 0.0;

    for signal in signals.iter().rev() {
        match *signal {
            RewardSignal::Boundary => running = 0.0,
            RewardSignal::Reward(r) => {
                running = running * gamma + r;
                slot -= 1;
                out[slot] = running;
            }
        }
    }
    out
}

/// Rescale to zero mean and unit variance in place.
///
/// A batch with (near) zero spread is only centred.
pub fn normalize_advantages(values: &mut [f64]) {
    let (mean, std) = mean_std(values);
    if std > ADVANTAGE_STD_FLOOR {
        values.iter_mut().for_each(|v| *v = (*v - mean) / std);
    } else {
        values.iter_mut().for_each(|v| *v -= mean);
    }
}

/// Jacobian of softmax with respect to its logits, `p_i (δ_ij - p_j)`.
#[cfg(test)]
fn softmax_jacobian(probs: &[f64]) -> Matrix {
    Matrix::from_fn(probs.len(), probs.len(), |i, j| {
        if i == j {
            probs[i] * (1.0 - probs[i])
        } else {
            -probs[i] * probs[j]
        }
    })
}

/// Gradient of the entropy (nats) of `softmax(z)` with respect to `z`.
pub fn entropy_logit_gradient(probs: &[f64]) -> Vec<f64> {
    let h = entropy(probs);
    probs
        .iter()
        .map(|&p| -p * (p.max(PROB_FLOOR).ln() + h))
        .collect()
}

/// Loss gradient with respect to the logits for one sample.
pub fn logit_gradient(probs: &[f64], action: usize, advantage: f64, entropy_weight: f64) -> Vec<f64> {
    let target = one_hot(action, probs.len());
    let entropy_grad = entropy_logit_gradient(probs);
    probs
        .iter()
        .zip(&target)
        .zip(&entropy_grad)
        .map(|((&p, &y), &dh)| advantage * (p - y) - entropy_weight * dh)
        .collect()
}

/// `Σ δᵢ ⊗ hᵢ`: gradient of the output layer.
pub fn output_layer_gradient(deltas: &[Vec<f64>], hiddens: &[Vec<f64>], shape: [usize; 2]) -> Matrix {
    let mut grad = Matrix::zeros(shape[0], shape[1]);
    for (delta, hidden) in deltas.iter().zip(hiddens) {
        grad.add_outer(1.0, delta, hidden);
    }
    grad
}

/// `Σ (W2ᵀ δᵢ) ⊗ xᵢ`: gradient of the input layer.
pub fn hidden_layer_gradient(w2: &Matrix, deltas: &[Vec<f64>], inputs: &[Vec<f64>], shape: [usize; 2]) -> Matrix {
    let mut grad = Matrix::zeros(shape[0], shape[1]);
    for (delta, input) in deltas.iter().zip(inputs) {
        let d_hidden = w2.transpose_mul_vec(delta);
        grad.add_outer(1.0, &d_hidden, input);
    }
    grad
}

/// One recorded decision, ready for the backward pass.
#[derive(Clone, Debug, PartialEq)]
pub struct PolicySample {
    pub input: Vec<f64>,
    pub hidden: Vec<f64>,
    pub probs: Vec<f64>,
    pub action: usize,
    pub advantage: f64,
}

/// Weight gradients of both layers.
#[derive(Clone, Debug, PartialEq)]
pub struct Gradients {
    pub w1: Matrix,
    pub w2: Matrix,
}

impl Gradients {
    /// Zero gradients for the given layer shapes.
    pub fn zeros(w1_shape: [usize; 2], w2_shape: [usize; 2]) -> Self {
        Self {
            w1: Matrix::zeros(w1_shape[0], w1_shape[1]),
            w2: Matrix::zeros(w2_shape[0], w2_shape[1]),
        }
    }

    /// Add another gradient into this one.
    pub fn accumulate(&mut self, other: &Gradients) {
        self.w1.add_scaled(1.0, &other.w1);
        self.w2.add_scaled(1.0, &other.w2);
    }

    pub fn clear(&mut self) {
        self.w1.fill_zero();
        self.w2.fill_zero();
    }
}

/// Gradients of the summed batch loss with respect to `W1` and `W2`.
///
/// Uses the activations stored in each sample rather than recomputing them.
pub fn policy_gradients(w1: &Matrix, w2: &Matrix, batch: &[PolicySample], entropy_weight: f64) -> Gradients {
    let deltas: Vec<Vec<f64>> = batch
        .iter()
        .map(|s| logit_gradient(&s.probs, s.action, s.advantage, entropy_weight))
        .collect();
    let hiddens: Vec<Vec<f64>> = batch.iter().map(|s| s.hidden.clone()).collect();
    let inputs: Vec<Vec<f64>> = batch.iter().map(|s| s.input.clone()).collect();

    Gradients {
        w1: hidden_layer_gradient(w2, &deltas, &inputs, w1.shape()),
        w2: output_layer_gradient(&deltas, &hiddens, w2.shape()),
    }
}

/// Summed batch loss, recomputing the forward pass from the weights.
pub fn policy_loss(w1: &Matrix, w2: &Matrix, batch: &[PolicySample], entropy_weight: f64) -> f64 {
    batch
        .iter()
        .map(|s| {
            let pass = forward(w1, w2, &s.input);
            let p = pass.probs[s.action].max(PROB_FLOOR);
            -s.advantage * p.ln() - entropy_weight * entropy(&pass.probs)
        })
        .sum()
}
