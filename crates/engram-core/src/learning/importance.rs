//! Importance Model
//!
//! Predicts storage importance in [0, 1] from the semantic embedding.
//! Topology: D → 256 ReLU → dropout(0.1) → 128 ReLU → dropout(0.1) → 1
//! sigmoid, trained with binary cross-entropy under Adam.

use crate::error::{EngineError, Result};
use crate::learning::nn::FeedForwardNet;

const HIDDEN_ONE: usize = 256;
const HIDDEN_TWO: usize = 128;
const DROPOUT: f32 = 0.1;
const INIT_SEED: u64 = 0x1A2B_3C4D_5E6F_7081;

/// Neural network that predicts storage importance from semantic embeddings
pub struct ImportanceModel {
    net: FeedForwardNet,
}

impl ImportanceModel {
    pub fn new(embedding_dim: usize, learning_rate: f32) -> Self {
        Self {
            net: FeedForwardNet::new(
                &[embedding_dim, HIDDEN_ONE, HIDDEN_TWO, 1],
                DROPOUT,
                learning_rate,
                INIT_SEED,
            ),
        }
    }

    /// Predicted importance in [0, 1]; dropout is disabled for inference
    pub fn predict(&self, embedding: &[f32]) -> f64 {
        self.net.predict(embedding) as f64
    }

    /// Train on parallel embeddings/outcomes. Outcomes are signed signals in
    /// [-1, 1] and map to targets `clamp01((o + 1) / 2)`. Returns the batch
    /// loss (>= 0).
    pub fn train_batch(&mut self, embeddings: &[Vec<f32>], outcomes: &[f64]) -> Result<f64> {
        if embeddings.is_empty() {
            return Err(EngineError::Validation(
                "embeddings batch must not be empty".into(),
            ));
        }
        if embeddings.len() != outcomes.len() {
            return Err(EngineError::Validation(
                "embeddings and outcomes must have the same length".into(),
            ));
        }
        let targets: Vec<f32> = outcomes
            .iter()
            .map(|outcome| (((outcome + 1.0) / 2.0).clamp(0.0, 1.0)) as f32)
            .collect();
        Ok(self.net.train_batch(embeddings, &targets) as f64)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn embedding(seed: usize, dim: usize) -> Vec<f32> {
        (0..dim).map(|i| ((i * 31 + seed) as f32).sin()).collect()
    }

    #[test]
    fn test_fresh_models_agree() {
        let a = ImportanceModel::new(16, 1e-3);
        let b = ImportanceModel::new(16, 1e-3);
        let input = embedding(3, 16);
        assert_eq!(a.predict(&input), b.predict(&input));
    }

    #[test]
    fn test_predict_in_unit_interval() {
        let model = ImportanceModel::new(16, 1e-3);
        for seed in 0..5 {
            let score = model.predict(&embedding(seed, 16));
            assert!((0.0..=1.0).contains(&score));
        }
    }

    #[test]
    fn test_train_batch_validates_input() {
        let mut model = ImportanceModel::new(8, 1e-3);
        assert!(model.train_batch(&[], &[]).is_err());
        assert!(
            model
                .train_batch(&[embedding(0, 8)], &[1.0, -1.0])
                .is_err()
        );
    }

    #[test]
    fn test_training_moves_predictions_toward_outcomes() {
        let mut model = ImportanceModel::new(8, 1e-2);
        let good = embedding(1, 8);
        let bad = embedding(9, 8);
        for _ in 0..150 {
            model
                .train_batch(&[good.clone(), bad.clone()], &[1.0, -1.0])
                .unwrap();
        }
        assert!(model.predict(&good) > model.predict(&bad));
    }
}
