//! Retrieval Ranker
//!
//! Orders candidate memories by predicted helpfulness for a query. Scores
//! come from a learned 8-feature model once enough labeled feedback has
//! accumulated; before that a fixed heuristic blend carries retrieval, and
//! after warm-up the model is blended 0.8/0.2 with the heuristic.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::encoding::cosine_similarity;
use crate::learning::nn::FeedForwardNet;
use crate::model::{MemoryRecord, RetrievedMemory};

const FEATURE_DIM: usize = 8;
const HIDDEN: usize = 32;
const INIT_SEED: u64 = 0x9E37_79B9_7F4A_7C15;

/// Intent priors applied as a multiplicative feature. Assistant intents are
/// deprioritized; inferred and stated user knowledge is boosted.
const INTENT_PRIORS: &[(&str, f32)] = &[
    ("preference_stated", 1.28),
    ("learning_progress", 1.22),
    ("user_profile", 1.30),
    ("user_fact", 1.24),
    ("user_question", 1.06),
    ("inferred_learning_pattern", 1.26),
    ("inferred_preference", 1.32),
    ("inferred_user_fact", 1.34),
    ("inferred_user_fact_conflict", 1.36),
    ("assistant_response", 0.50),
    ("assistant_message", 0.55),
];

/// Learned retrieval ranker with similarity fallback before warm-up
pub struct RetrievalRanker {
    net: FeedForwardNet,
    min_training_samples: usize,
    training_batch_size: usize,
    training_samples: usize,
    feature_buffer: Vec<Vec<f32>>,
    label_buffer: Vec<f32>,
}

impl RetrievalRanker {
    pub fn new(
        learning_rate: f32,
        min_training_samples: usize,
        training_batch_size: usize,
    ) -> Self {
        Self {
            // Constrained non-decreasing in feature 0 (semantic similarity),
            // so the warm 0.8/0.2 blend keeps the heuristic's guarantee that
            // raising similarity never lowers the score
            net: FeedForwardNet::new(&[FEATURE_DIM, HIDDEN, 1], 0.0, learning_rate, INIT_SEED)
                .with_monotone_input(0),
            min_training_samples,
            training_batch_size: training_batch_size.max(1),
            training_samples: 0,
            feature_buffer: Vec::new(),
            label_buffer: Vec::new(),
        }
    }

    /// Whether enough labeled samples have been consumed to trust the model
    pub fn is_trained(&self) -> bool {
        self.training_samples >= self.min_training_samples
    }

    /// Rank candidates descending by score. Ties keep the candidate order
    /// handed in (the preselect stage's insertion order).
    pub fn rank(
        &self,
        query_embedding: &[f32],
        candidates: &[MemoryRecord],
        now: DateTime<Utc>,
    ) -> Vec<RetrievedMemory> {
        if candidates.is_empty() {
            return Vec::new();
        }
        let mut ranked: Vec<RetrievedMemory> = candidates
            .iter()
            .map(|memory| {
                let features = self.feature_vector(query_embedding, memory, now);
                RetrievedMemory {
                    memory: memory.clone(),
                    rank_score: self.score(&features) as f64,
                }
            })
            .collect();
        // Stable sort: equal scores preserve preselect order
        ranked.sort_by(|a, b| {
            b.rank_score
                .partial_cmp(&a.rank_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        ranked
    }

    /// Buffer labeled feature rows for every candidate; once the buffer
    /// reaches the batch size, run one training pass and return its loss.
    pub fn learn_from_feedback(
        &mut self,
        query_embedding: &[f32],
        candidates: &[MemoryRecord],
        helpful_memory_ids: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> Option<f64> {
        if candidates.is_empty() {
            return None;
        }
        for memory in candidates {
            let features = self.feature_vector(query_embedding, memory, now);
            let label = if helpful_memory_ids.contains(&memory.memory_id) {
                1.0
            } else {
                0.0
            };
            self.feature_buffer.push(features);
            self.label_buffer.push(label);
        }
        if self.feature_buffer.len() < self.training_batch_size {
            return None;
        }
        let loss = self.net.train_batch(&self.feature_buffer, &self.label_buffer) as f64;
        self.training_samples += self.feature_buffer.len();
        self.feature_buffer.clear();
        self.label_buffer.clear();
        Some(loss)
    }

    fn score(&self, features: &[f32]) -> f32 {
        let heuristic = Self::fallback_score(features);
        if !self.is_trained() {
            return heuristic;
        }
        let model = self.net.predict(features);
        (0.8 * model + 0.2 * heuristic).clamp(0.0, 1.0)
    }

    /// 8-feature vector for a (query, memory) pair
    fn feature_vector(
        &self,
        query_embedding: &[f32],
        memory: &MemoryRecord,
        now: DateTime<Utc>,
    ) -> Vec<f32> {
        let semantic_similarity =
            safe_similarity(query_embedding, &memory.semantic_embedding, 0.0);
        let raw_similarity =
            safe_similarity(query_embedding, &memory.raw_embedding, semantic_similarity);
        let age_days = memory.age_days(now) as f32;
        let summary_words = word_count(&memory.summary);
        let content_words = word_count(&memory.content);
        vec![
            semantic_similarity,
            raw_similarity,
            (-0.03 * age_days).exp(),
            clamp01(((memory.retrieval_count.max(0) as f32) + 1.0).ln() / 4.0),
            (memory.avg_outcome_signal as f32 + 1.0) / 2.0,
            clamp01(memory.latest_importance as f32),
            length_penalty(summary_words, content_words),
            intent_prior(&memory.intent),
        ]
    }

    /// Heuristic fallback: weighted sum of the rescaled first six features,
    /// multiplied by the length penalty and intent prior, clamped to [0, 1]
    fn fallback_score(features: &[f32]) -> f32 {
        let semantic_signal = (features[0] + 1.0) / 2.0;
        let raw_signal = (features[1] + 1.0) / 2.0;
        let base_score = 0.41 * semantic_signal
            + 0.09 * raw_signal
            + 0.05 * features[2]
            + 0.05 * features[3]
            + 0.09 * features[4]
            + 0.31 * features[5];
        clamp01(base_score * features[6] * features[7])
    }
}

fn safe_similarity(query: &[f32], candidate: &[f32], fallback: f32) -> f32 {
    if candidate.is_empty() || candidate.len() != query.len() {
        return fallback;
    }
    cosine_similarity(query, candidate)
}

fn intent_prior(intent: &str) -> f32 {
    let normalized = intent.trim().to_lowercase();
    if normalized.is_empty() {
        return 1.0;
    }
    if let Some((_, prior)) = INTENT_PRIORS.iter().find(|(name, _)| *name == normalized) {
        return *prior;
    }
    if normalized.starts_with("assistant_") {
        return 0.5;
    }
    1.0
}

/// 1.0 minus up to 0.30 for long summaries (> 20 words, linear to +160)
/// and up to 0.35 for long content (> 96 words, linear to +320), floor 0.35
fn length_penalty(summary_words: usize, content_words: usize) -> f32 {
    let mut penalty = 1.0;
    if summary_words > 20 {
        penalty -= ((summary_words - 20) as f32 / 160.0).min(0.30);
    }
    if content_words > 96 {
        penalty -= ((content_words - 96) as f32 / 320.0).min(0.35);
    }
    penalty.max(0.35)
}

fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

fn clamp01(value: f32) -> f32 {
    value.clamp(0.0, 1.0)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::to_unit_vector;
    use crate::model::StorageTier;

    fn record(id: &str, intent: &str, embedding: Vec<f32>) -> MemoryRecord {
        let now = Utc::now();
        let embedding = to_unit_vector(embedding);
        MemoryRecord {
            memory_id: id.to_string(),
            account_key: "default".to_string(),
            event_id: format!("event-{id}"),
            content: "short content".to_string(),
            summary: "short summary".to_string(),
            intent: intent.to_string(),
            entities: vec!["alice".to_string()],
            relationships: vec![],
            raw_embedding: embedding.clone(),
            semantic_embedding: embedding,
            semantic_key: "key".to_string(),
            created_at: now,
            updated_at: now,
            retrieval_count: 0,
            avg_outcome_signal: 0.0,
            outcome_count: 0,
            storage_tier: StorageTier::Persistent,
            latest_importance: 0.5,
            is_compressed: false,
            original_count: 1,
            decay_half_life_days: None,
        }
    }

    #[test]
    fn test_closer_candidates_rank_first() {
        let ranker = RetrievalRanker::new(1e-3, 100, 64);
        let query = to_unit_vector(vec![1.0, 0.0, 0.0]);
        let near = record("near", "user_question", vec![0.95, 0.05, 0.0]);
        let far = record("far", "user_question", vec![0.0, 1.0, 0.0]);
        let ranked = ranker.rank(&query, &[far, near], Utc::now());
        assert_eq!(ranked[0].memory.memory_id, "near");
        assert!(ranked[0].rank_score > ranked[1].rank_score);
    }

    #[test]
    fn test_assistant_intent_deprioritized() {
        let ranker = RetrievalRanker::new(1e-3, 100, 64);
        let query = to_unit_vector(vec![1.0, 0.0, 0.0]);
        let embedding = vec![1.0, 0.0, 0.0];
        let assistant = record("assistant", "assistant_response", embedding.clone());
        let user = record("user", "user_question", embedding);
        let ranked = ranker.rank(&query, &[assistant, user], Utc::now());
        assert_eq!(ranked[0].memory.memory_id, "user");
    }

    #[test]
    fn test_ties_keep_candidate_order() {
        let ranker = RetrievalRanker::new(1e-3, 100, 64);
        let query = to_unit_vector(vec![1.0, 0.0]);
        let first = record("first", "user_question", vec![1.0, 0.0]);
        let second = record("second", "user_question", vec![1.0, 0.0]);
        let ranked = ranker.rank(&query, &[first, second], Utc::now());
        assert_eq!(ranked[0].memory.memory_id, "first");
        assert_eq!(ranked[1].memory.memory_id, "second");
    }

    #[test]
    fn test_score_monotone_in_semantic_similarity() {
        // Heuristic mode: raising feature 0 never lowers the score
        let mut low = vec![0.1_f32, 0.1, 0.8, 0.2, 0.5, 0.5, 1.0, 1.0];
        let mut score_prev = RetrievalRanker::fallback_score(&low);
        for step in 1..=8 {
            low[0] = 0.1 + step as f32 * 0.1;
            let score = RetrievalRanker::fallback_score(&low);
            assert!(score >= score_prev);
            score_prev = score;
        }
    }

    #[test]
    fn test_blended_score_monotone_in_semantic_similarity() {
        // Warm the ranker with labels that reward the LESS similar
        // candidate, the worst case for the constrained model, then check
        // the blended score still never drops as similarity rises
        let mut ranker = RetrievalRanker::new(5e-2, 8, 4);
        let query = to_unit_vector(vec![1.0, 0.0]);
        let training = vec![
            record("near", "user_question", vec![1.0, 0.0]),
            record("far", "user_question", vec![0.0, 1.0]),
        ];
        let helpful: HashSet<String> = ["far".to_string()].into_iter().collect();
        for _ in 0..4 {
            ranker.learn_from_feedback(&query, &training, &helpful, Utc::now());
        }
        assert!(ranker.is_trained());

        // Candidates identical except semantic similarity: raw embeddings
        // are pinned to the same vector so feature 1 stays constant
        let now = Utc::now();
        let raw = to_unit_vector(vec![0.0, 1.0]);
        let candidates: Vec<MemoryRecord> = (0..=10)
            .map(|step| {
                let angle = std::f32::consts::FRAC_PI_2 * (1.0 - step as f32 / 10.0);
                let mut memory =
                    record(&format!("c{step}"), "user_question", vec![angle.cos(), angle.sin()]);
                memory.raw_embedding = raw.clone();
                memory.created_at = now;
                memory
            })
            .collect();
        let ranked = ranker.rank(&query, &candidates, now);
        let score_of = |id: &str| {
            ranked
                .iter()
                .find(|item| item.memory.memory_id == id)
                .map(|item| item.rank_score)
                .unwrap()
        };
        // c0 is orthogonal to the query, c10 is aligned; scores must be
        // non-decreasing along the sweep
        let mut previous = score_of("c0");
        for step in 1..=10 {
            let score = score_of(&format!("c{step}"));
            assert!(
                score >= previous,
                "blended score dropped from {previous} to {score} at step {step}"
            );
            previous = score;
        }
    }

    #[test]
    fn test_warm_up_threshold() {
        let mut ranker = RetrievalRanker::new(1e-3, 8, 4);
        assert!(!ranker.is_trained());
        let query = to_unit_vector(vec![1.0, 0.0]);
        let helpful: HashSet<String> = ["a".to_string()].into_iter().collect();
        let candidates = vec![
            record("a", "user_question", vec![1.0, 0.0]),
            record("b", "user_question", vec![0.0, 1.0]),
        ];
        // 2 samples per call; batch size 4 trains every second call
        let mut trained_losses = 0;
        for _ in 0..4 {
            if ranker
                .learn_from_feedback(&query, &candidates, &helpful, Utc::now())
                .is_some()
            {
                trained_losses += 1;
            }
        }
        assert_eq!(trained_losses, 2);
        assert!(ranker.is_trained());
    }

    #[test]
    fn test_length_penalty_floor() {
        assert_eq!(length_penalty(10, 50), 1.0);
        assert!(length_penalty(500, 5000) >= 0.35);
        assert!(length_penalty(40, 96) < 1.0);
    }

    #[test]
    fn test_intent_prior_table() {
        assert_eq!(intent_prior("preference_stated"), 1.28);
        assert_eq!(intent_prior("assistant_response"), 0.50);
        assert_eq!(intent_prior("assistant_anything_else"), 0.5);
        assert_eq!(intent_prior("unknown_intent"), 1.0);
        assert_eq!(intent_prior(""), 1.0);
    }
}
