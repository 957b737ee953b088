//! Learning Loop
//!
//! Routes one feedback record into every learner: the importance model
//! trains on each memory's embedding with the signed signal, the decay
//! learner buffers (age, helpful) samples and runs a gradient pass, the
//! per-memory outcome aggregate is updated through the supplied callback,
//! and the ranker consumes the labeled candidate set.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::learning::{DecayLearner, ImportanceModel, RetrievalRanker};
use crate::model::{MemoryRecord, OutcomeFeedback};

/// Losses reported by one feedback application
#[derive(Debug, Clone, Copy, Default)]
pub struct FeedbackOutcome {
    pub rank_loss: Option<f64>,
    /// Mean importance loss across the ranked memories
    pub importance_loss: Option<f64>,
}

/// Continuous learning loop fed by retrieval outcomes
pub struct LearningLoop;

impl LearningLoop {
    /// Apply one feedback record. `update_outcome` receives
    /// `(memory_id, signed_signal)` for the storage-side running mean.
    pub fn record_feedback(
        feedback: &OutcomeFeedback,
        query_embedding: &[f32],
        memories: &[MemoryRecord],
        now: DateTime<Utc>,
        importance: &mut ImportanceModel,
        decay: &mut DecayLearner,
        ranker: &mut RetrievalRanker,
        mut update_outcome: impl FnMut(&str, f64),
    ) -> FeedbackOutcome {
        let helpful_ids: HashSet<String> = feedback.helpful_memory_ids.iter().cloned().collect();

        let mut losses: Vec<f64> = Vec::with_capacity(memories.len());
        for memory in memories {
            let age_days = memory.age_days(now);
            let was_helpful = helpful_ids.contains(&memory.memory_id);
            let signal = if was_helpful {
                feedback.outcome_signal
            } else {
                -feedback.outcome_signal.abs()
            };
            match importance.train_batch(
                std::slice::from_ref(&memory.semantic_embedding),
                &[signal],
            ) {
                Ok(loss) => losses.push(loss),
                Err(error) => debug!(memory_id = %memory.memory_id, %error, "importance update skipped"),
            }
            decay.record_outcome(&memory.semantic_key, age_days, was_helpful);
            update_outcome(&memory.memory_id, signal);
        }
        decay.learn();

        let rank_loss = ranker.learn_from_feedback(query_embedding, memories, &helpful_ids, now);
        let importance_loss = if losses.is_empty() {
            None
        } else {
            Some(losses.iter().sum::<f64>() / losses.len() as f64)
        };

        debug!(
            ranked_count = memories.len(),
            helpful_count = helpful_ids.len(),
            rank_loss = ?rank_loss,
            importance_loss = ?importance_loss,
            "learning feedback applied"
        );
        FeedbackOutcome {
            rank_loss,
            importance_loss,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
