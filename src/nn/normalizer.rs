//! Running per-feature mean and variance for observation scaling.
//!
//! Each feature keeps its own sample count so that the "missing" sentinel a
//! dead unit reports can be skipped for that feature alone without biasing
//! the others.

use serde::{Deserialize, Serialize};

use crate::core::ConfigError;

/// Smallest variance used as a divisor.
pub const VARIANCE_FLOOR: f64 = 1e-8;

/// Normalizer settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NormalizerConfig {
    /// Normalized values are clamped to `[-clip, clip]`.
    pub clip: f64,
    /// Feature value meaning "no reading" (e.g. a dead unit's slot).
    pub missing_value: f64,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            clip: 5.0,
            missing_value: -1_000_000.0,
        }
    }
}

impl NormalizerConfig {
    pub fn with_clip(mut self, clip: f64) -> Self {
        self.clip = clip;
        self
    }

    pub fn with_missing_value(mut self, missing_value: f64) -> Self {
        self.missing_value = missing_value;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.clip > 0.0) || !self.clip.is_finite() {
            return Err(ConfigError::OutOfRange {
                field: "clip",
                range: "(0, inf)",
                value: self.clip,
            });
        }
        Ok(())
    }
}

/// Welford accumulator per feature.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OnlineNormalizer {
    config: NormalizerConfig,
    mean: Vec<f64>,
    m2: Vec<f64>,
    count: Vec<u64>,
}

impl OnlineNormalizer {
    /// Fresh normalizer for `features` inputs.
    pub fn new(features: usize, config: NormalizerConfig) -> Self {
        Self {
            config,
            mean: vec![0.0; features],
            m2: vec![0.0; features],
            count: vec![0; features],
        }
    }

    /// Rebuild from persisted moments.
    ///
    /// Returns `None` when the three vectors disagree in length.
    pub fn from_moments(
        config: NormalizerConfig,
        mean: Vec<f64>,
        variance: Vec<f64>,
        count: Vec<u64>,
    ) -> Option<Self> {
        if mean.len() != variance.len() || mean.len() != count.len() {
            return None;
        }
        let m2 = variance.iter().zip(&count).map(|(v, &n)| v * n as f64).collect();
        Some(Self {
            config,
            mean,
            m2,
            count,
        })
    }

    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    /// Number of features tracked.
    pub fn features(&self) -> usize {
        self.mean.len()
    }

    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    /// Per-feature sample counts. Only ever grows, except through a load.
    pub fn count(&self) -> &[u64] {
        &self.count
    }

    /// Population variance per feature; `1.0` for a feature never observed.
    pub fn variance(&self) -> Vec<f64> {
        self.m2
            .iter()
            .zip(&self.count)
            .map(|(&m2, &n)| if n == 0 { 1.0 } else { m2 / n as f64 })
            .collect()
    }

    fn is_missing(&self, value: f64) -> bool {
        value == self.config.missing_value || !value.is_finite()
    }

    /// Fold one observation into the running moments.
    pub fn record(&mut self, observation: &[f64]) {
        for (i, &x) in observation.iter().enumerate().take(self.mean.len()) {
            if self.is_missing(x) {
                continue;
            }
            self.count[i] += 1;
            let delta = x - self.mean[i];
            self.mean[i] += delta / self.count[i] as f64;
            self.m2[i] += delta * (x - self.mean[i]);
        }
    }

    /// Fold a batch of observations.
    pub fn record_batch<'a>(&mut self, observations: impl IntoIterator<Item = &'a [f64]>) {
        for obs in observations {
            self.record(obs);
        }
    }

    /// Scale one observation to roughly zero mean and unit variance.
    ///
    /// Missing values map to `0` and every output is clipped.
    pub fn normalize(&self, observation: &[f64]) -> Vec<f64> {
        let clip = self.config.clip;
        observation
            .iter()
            .enumerate()
            .map(|(i, &x)| {
                if self.is_missing(x) {
                    return 0.0;
                }
                let (mean, var) = match (self.mean.get(i), self.count.get(i)) {
                    (Some(&mean), Some(&n)) if n > 0 => (mean, self.m2[i] / n as f64),
                    (Some(&mean), _) => (mean, 1.0),
                    _ => (0.0, 1.0),
                };
                ((x - mean) / var.max(VARIANCE_FLOOR).sqrt()).clamp(-clip, clip)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_identical_observations_have_zero_variance() {
        let mut norm = OnlineNormalizer::new(3, NormalizerConfig::default());
        for _ in 0..50 {
            norm.record(&[2.5, -1.0, 0.0]);
        }
        assert_eq!(norm.mean(), &[2.5, -1.0, 0.0]);
        assert!(norm.variance().iter().all(|v| v.abs() < 1e-12));

        let out = norm.normalize(&[2.5, -1.0, 0.0]);
        assert!(out.iter().all(|v| v.is_finite() && v.abs() < 1e-6));
    }

    #[test]
    fn test_missing_value_leaves_feature_untouched() {
        let config = NormalizerConfig::default();
        let missing = config.missing_value;
        let mut norm = OnlineNormalizer::new(2, config);
        norm.record(&[1.0, 4.0]);
        norm.record(&[3.0, 6.0]);
        let mean_before = norm.mean()[1];
        let var_before = norm.variance()[1];

        norm.record(&[5.0, missing]);

        assert_eq!(norm.mean()[1], mean_before);
        assert_eq!(norm.variance()[1], var_before);
        assert_eq!(norm.count(), &[3, 2]);
        assert_eq!(norm.mean()[0], 3.0);
    }

    #[test]
    fn test_normalize_missing_and_clip() {
        let mut norm = OnlineNormalizer::new(2, NormalizerConfig::default().with_clip(2.0));
        norm.record(&[0.0, 0.0]);
        norm.record(&[2.0, 2.0]);

        let out = norm.normalize(&[100.0, -1_000_000.0]);
        assert_eq!(out, vec![2.0, 0.0]);
    }

    #[test]
    fn test_unobserved_feature_uses_unit_variance() {
        let norm = OnlineNormalizer::new(2, NormalizerConfig::default());
        assert_eq!(norm.variance(), vec![1.0, 1.0]);
        assert_eq!(norm.normalize(&[0.5, -0.5]), vec![0.5, -0.5]);
    }

    #[test]
    fn test_from_moments_round_trip() {
        let mut norm = OnlineNormalizer::new(2, NormalizerConfig::default());
        norm.record_batch([&[1.0, 2.0][..], &[3.0, 8.0][..]]);

        let restored = OnlineNormalizer::from_moments(
            norm.config().clone(),
            norm.mean().to_vec(),
            norm.variance(),
            norm.count().to_vec(),
        )
        .unwrap();
        let a = restored.normalize(&[2.0, 5.0]);
        let b = norm.normalize(&[2.0, 5.0]);
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-12);
        }

        assert!(OnlineNormalizer::from_moments(NormalizerConfig::default(), vec![0.0], vec![], vec![]).is_none());
    }

    proptest! {
        #[test]
        fn prop_constant_stream_is_identity_mean(value in -1000.0f64..1000.0, n in 1usize..40) {
            let mut norm = OnlineNormalizer::new(1, NormalizerConfig::default());
            for _ in 0..n {
                norm.record(&[value]);
            }
            prop_assert!((norm.mean()[0] - value).abs() < 1e-9);
            prop_assert!(norm.variance()[0].abs() < 1e-6);
        }
    }
}
