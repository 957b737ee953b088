//! Stage 2: Storage Decisioning
//!
//! Combines the learned importance prediction with a deterministic
//! bootstrap prior, assigns a decay policy from the decay learner, selects
//! a retention tier against the configured confidence priors, and flags
//! clusters for compression.

use std::collections::HashMap;

use chrono::Utc;

use crate::learning::{DecayLearner, ImportanceModel};
use crate::model::{MemorySnapshot, ProcessedEvent, StorageDecision, StorageTier};

// Bootstrap prior weights and rates
const ALPHA: f64 = 0.4;
const BETA: f64 = 0.3;
const GAMMA: f64 = 0.3;
const RECENCY_LAMBDA: f64 = 0.1;
const FREQUENCY_LAMBDA: f64 = 0.3;

/// Weight on the learned model vs the bootstrap prior
const MODEL_WEIGHT: f64 = 0.85;
const PRIOR_WEIGHT: f64 = 0.15;

/// Deterministic cold-start relevance prior
pub fn bootstrap_relevance_score(
    recency_days: f64,
    frequency_count: i64,
    entity_ref_count: i64,
) -> f64 {
    let recency = (-RECENCY_LAMBDA * recency_days.max(0.0)).exp();
    let frequency = 1.0 - (-FREQUENCY_LAMBDA * frequency_count.max(0) as f64).exp();
    let entity_importance = (entity_ref_count.max(0) as f64 / 10.0).min(1.0);
    ALPHA * recency + BETA * frequency + GAMMA * entity_importance
}

/// Confidence score plus the decision trace fed into observability
#[derive(Debug, Clone)]
pub struct ScoreResult {
    pub confidence: f64,
    pub trace: HashMap<String, f64>,
}

/// Learned scorer with a deterministic bootstrap prior for cold-start stability
pub struct LearnedRelevanceScorer;

impl LearnedRelevanceScorer {
    pub fn score(
        importance_model: &ImportanceModel,
        processed: &ProcessedEvent,
        snapshot: &MemorySnapshot,
    ) -> ScoreResult {
        let model_confidence = importance_model.predict(&processed.semantic_embedding);
        let recency_days =
            ((Utc::now() - processed.timestamp).num_milliseconds() as f64 / 86_400_000.0).max(0.0);
        let prior_confidence = bootstrap_relevance_score(
            recency_days,
            snapshot.similar_recent_count,
            snapshot.entity_reference_count,
        );
        let confidence =
            (MODEL_WEIGHT * model_confidence + PRIOR_WEIGHT * prior_confidence).clamp(0.0, 1.0);
        let mut trace = HashMap::new();
        trace.insert("model_confidence".to_string(), model_confidence);
        trace.insert("prior_confidence".to_string(), prior_confidence);
        trace.insert("recency_days".to_string(), recency_days);
        trace.insert(
            "similar_recent_count".to_string(),
            snapshot.similar_recent_count as f64,
        );
        trace.insert(
            "entity_reference_count".to_string(),
            snapshot.entity_reference_count as f64,
        );
        ScoreResult { confidence, trace }
    }
}

/// Assign decay from learned rates and expose half-life metadata
pub struct DecayPolicyAssigner;

impl DecayPolicyAssigner {
    /// `(rate, half_life_days)`; half-life is infinite for a zero rate
    pub fn assign(decay_learner: &DecayLearner, semantic_key: &str) -> (f64, f64) {
        let rate = decay_learner.predict_decay_rate(semantic_key);
        let half_life = if rate > 0.0 {
            std::f64::consts::LN_2 / rate
        } else {
            f64::INFINITY
        };
        (rate, half_life)
    }
}

/// Stage 2 decision logic with learned scoring and decay assignment
pub struct DecisionLogic {
    persistent_threshold: f64,
    ephemeral_threshold: f64,
    compression_min_count: usize,
}

impl DecisionLogic {
    pub fn new(
        persistent_threshold: f64,
        ephemeral_threshold: f64,
        compression_min_count: usize,
    ) -> Self {
        Self {
            persistent_threshold,
            ephemeral_threshold,
            compression_min_count,
        }
    }

    pub fn decide(
        &self,
        importance_model: &ImportanceModel,
        decay_learner: &DecayLearner,
        processed: &ProcessedEvent,
        snapshot: &MemorySnapshot,
    ) -> StorageDecision {
        let score = LearnedRelevanceScorer::score(importance_model, processed, snapshot);
        let (decay_rate, decay_half_life) =
            DecayPolicyAssigner::assign(decay_learner, &processed.semantic_key);
        let (storage_tier, store) = if score.confidence >= self.persistent_threshold {
            (StorageTier::Persistent, true)
        } else if score.confidence >= self.ephemeral_threshold {
            (StorageTier::Ephemeral, true)
        } else {
            (StorageTier::Discard, false)
        };
        StorageDecision {
            store,
            storage_tier,
            confidence: score.confidence,
            decay_rate,
            decay_half_life,
            should_compress: (snapshot.similar_recent_count as usize + 1)
                >= self.compression_min_count,
            rationale: "learned importance prediction".to_string(),
            trace: score.trace,
            is_compressed: false,
            original_count: 1,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::to_unit_vector;
    use crate::model::ContextMap;

    fn processed(dim: usize) -> ProcessedEvent {
        let embedding = to_unit_vector((0..dim).map(|i| (i as f32).sin()).collect());
        ProcessedEvent {
            event_id: "event".to_string(),
            timestamp: Utc::now(),
            entity_id: "alice".to_string(),
            event_type: "user_question".to_string(),
            description: "desc".to_string(),
            entity_references: vec!["alice".to_string()],
            embedding: embedding.clone(),
            semantic_embedding: embedding,
            intent: "user_question".to_string(),
            semantic_key: "key".to_string(),
            semantic_summary: "desc".to_string(),
            context: ContextMap::new(),
        }
    }

    fn snapshot(similar: i64, refs: i64) -> MemorySnapshot {
        MemorySnapshot {
            total_memories: 10,
            entity_reference_count: refs,
            similar_recent_count: similar,
            generated_at: Utc::now(),
        }
    }

    #[test]
    fn test_bootstrap_prior_shape() {
        // Fresh, frequent, well-referenced events score near the maximum
        let high = bootstrap_relevance_score(0.0, 20, 20);
        assert!(high > 0.9);
        // Stale, novel, unreferenced events score ALPHA-decayed only
        let low = bootstrap_relevance_score(60.0, 0, 0);
        assert!(low < 0.05);
        // Negative counts clamp
        assert!(bootstrap_relevance_score(0.0, -5, -5) > 0.0);
    }

    #[test]
    fn test_tier_thresholds() {
        let logic = DecisionLogic::new(0.6, 0.3, 5);
        let importance = ImportanceModel::new(8, 1e-3);
        let decay = DecayLearner::new(1e-2);
        let decision = logic.decide(&importance, &decay, &processed(8), &snapshot(0, 0));
        match decision.storage_tier {
            StorageTier::Persistent => assert!(decision.confidence >= 0.6 && decision.store),
            StorageTier::Ephemeral => assert!(decision.confidence >= 0.3 && decision.store),
            StorageTier::Discard => assert!(decision.confidence < 0.3 && !decision.store),
        }
        assert!(decision.trace.contains_key("model_confidence"));
        assert!(decision.trace.contains_key("prior_confidence"));
    }

    #[test]
    fn test_should_compress_predicate() {
        let logic = DecisionLogic::new(0.6, 0.3, 5);
        let importance = ImportanceModel::new(8, 1e-3);
        let decay = DecayLearner::new(1e-2);
        let below = logic.decide(&importance, &decay, &processed(8), &snapshot(3, 0));
        assert!(!below.should_compress);
        let at = logic.decide(&importance, &decay, &processed(8), &snapshot(4, 0));
        assert!(at.should_compress);
    }

    #[test]
    fn test_decay_policy_half_life() {
        let decay = DecayLearner::new(1e-2);
        let (rate, half_life) = DecayPolicyAssigner::assign(&decay, "unseen");
        assert!(rate > 0.0);
        assert!((half_life - std::f64::consts::LN_2 / rate).abs() < 1e-9);
    }
}
