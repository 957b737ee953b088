//! Decay Learner
//!
//! Learns a per-`semantic_key` exponential decay rate from observed
//! (age, helpful) outcome samples. Residual relevance after `t` days is
//! `initial · exp(-rate · t)`.

use std::collections::HashMap;

/// Rates are clamped to this range after every gradient step
const RATE_MIN: f64 = 1e-4;
const RATE_MAX: f64 = 2.0;

/// Learns decay rates from outcome signals across semantic categories
pub struct DecayLearner {
    learning_rate: f64,
    prior_decay_rate: f64,
    decay_rates: HashMap<String, f64>,
    /// Buffered `(age_days, was_helpful)` observations per key
    observations: HashMap<String, Vec<(f64, bool)>>,
}

impl DecayLearner {
    pub fn new(learning_rate: f64) -> Self {
        Self::with_prior(learning_rate, 1e-2)
    }

    pub fn with_prior(learning_rate: f64, prior_decay_rate: f64) -> Self {
        Self {
            learning_rate,
            prior_decay_rate,
            decay_rates: HashMap::new(),
            observations: HashMap::new(),
        }
    }

    /// Learned rate for the key, or the prior when nothing was observed yet
    pub fn predict_decay_rate(&self, semantic_key: &str) -> f64 {
        self.decay_rates
            .get(semantic_key)
            .copied()
            .unwrap_or(self.prior_decay_rate)
    }

    /// `initial_importance · exp(-rate · max(age, 0))`
    pub fn predict_relevance(
        &self,
        semantic_key: &str,
        age_days: f64,
        initial_importance: f64,
    ) -> f64 {
        let rate = self.predict_decay_rate(semantic_key);
        initial_importance * (-rate * age_days.max(0.0)).exp()
    }

    /// Buffer an observation for the next `learn` pass
    pub fn record_outcome(&mut self, semantic_key: &str, age_days: f64, was_helpful: bool) {
        self.observations
            .entry(semantic_key.to_string())
            .or_default()
            .push((age_days.max(0.0), was_helpful));
    }

    /// Run one gradient pass per buffered observation, MSE between
    /// `exp(-rate · age)` and the target `{1 helpful, 0 otherwise}`,
    /// clamping rates to `[1e-4, 2.0]`. Clears the buffers.
    pub fn learn(&mut self) {
        let drained: Vec<(String, Vec<(f64, bool)>)> = self.observations.drain().collect();
        for (semantic_key, samples) in drained {
            if samples.is_empty() {
                continue;
            }
            let mut rate = self.predict_decay_rate(&semantic_key);
            for (age_days, was_helpful) in samples {
                let target = if was_helpful { 1.0 } else { 0.0 };
                let predicted = (-rate * age_days).exp();
                let gradient = 2.0 * (predicted - target) * (-age_days * predicted);
                rate -= self.learning_rate * gradient;
                rate = rate.clamp(RATE_MIN, RATE_MAX);
            }
            self.decay_rates.insert(semantic_key, rate);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prior_rate_before_learning() {
        let learner = DecayLearner::new(1e-2);
        assert_eq!(learner.predict_decay_rate("anything"), 1e-2);
    }

    #[test]
    fn test_relevance_decreases_with_age() {
        let learner = DecayLearner::new(1e-2);
        let fresh = learner.predict_relevance("key", 0.0, 0.9);
        let aged = learner.predict_relevance("key", 30.0, 0.9);
        assert!((fresh - 0.9).abs() < 1e-9);
        assert!(aged < fresh);
        // Negative ages clamp to zero
        assert_eq!(learner.predict_relevance("key", -5.0, 0.9), fresh);
    }

    #[test]
    fn test_unhelpful_old_memories_raise_rate() {
        let mut learner = DecayLearner::new(5e-2);
        let before = learner.predict_decay_rate("topic");
        for _ in 0..20 {
            learner.record_outcome("topic", 10.0, false);
        }
        learner.learn();
        assert!(learner.predict_decay_rate("topic") > before);
    }

    #[test]
    fn test_helpful_old_memories_lower_rate() {
        let mut learner = DecayLearner::new(5e-2);
        // Push the rate up first, then observe helpful outcomes
        for _ in 0..20 {
            learner.record_outcome("topic", 10.0, false);
        }
        learner.learn();
        let raised = learner.predict_decay_rate("topic");
        for _ in 0..40 {
            learner.record_outcome("topic", 10.0, true);
        }
        learner.learn();
        assert!(learner.predict_decay_rate("topic") < raised);
    }

    #[test]
    fn test_rate_stays_clamped() {
        let mut learner = DecayLearner::new(10.0);
        for _ in 0..100 {
            learner.record_outcome("hot", 5.0, false);
        }
        learner.learn();
        let rate = learner.predict_decay_rate("hot");
        assert!((1e-4..=2.0).contains(&rate));
    }
}
