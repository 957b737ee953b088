//! Adaptive Personalization
//!
//! Watches stored memories and feedback for recurring per-entity patterns
//! and synthesizes inferred memories from them. Three inference families
//! run off stored observations (repeat-topic clusters, recurring failures,
//! progress accumulation) and a fourth runs off feedback (explanation-style
//! preference). Every candidate carries provenance relationships and a
//! dedup signature; signatures refuse to re-emit inside the refresh window
//! and supersede stale inferred memories beyond it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tracing::warn;

use crate::encoding::cosine_similarity;
use crate::model::{intent_is_assistant, MemoryRecord};
use crate::storage::StorageManager;

const TOPIC_CLUSTER_SOURCE_INTENTS: &[&str] = &[
    "user_question",
    "user_attempt",
    "assessment_result",
    "learning_progress",
];
const FAILURE_SOURCE_INTENTS: &[&str] = &["user_question", "user_attempt", "assessment_result"];
const PROGRESS_SOURCE_INTENTS: &[&str] = &["user_attempt", "assessment_result", "learning_progress"];

const FAILURE_TERMS: &[&str] = &[
    "bug", "bugs", "confused", "confusing", "error", "errors", "exception", "exceptions",
    "failing", "fails", "failed", "failure", "incorrect", "mistake", "mistakes", "stuck",
    "struggle", "struggles", "wrong",
];
const PROGRESS_TERMS: &[&str] = &[
    "advanced", "complete", "completed", "correct", "correctly", "improved", "improving",
    "learned", "mastered", "passed", "progress", "solved", "understands",
];

/// Supporting memories quoted in provenance, at most
const MAX_DERIVED_FROM: usize = 8;

/// Per-style supporting-id history kept per entity
const MAX_SUPPORTING_IDS: usize = 16;

// ============================================================================
// CANDIDATES
// ============================================================================

/// An inferred memory the orchestrator should store
#[derive(Debug, Clone)]
pub struct InferredMemoryCandidate {
    pub entity_id: String,
    /// Intent of the resulting memory (e.g. `inferred_preference`)
    pub event_type: String,
    pub content: String,
    pub summary: String,
    pub confidence: f64,
    /// Provenance: `inferred:true`, `inference_type:…`, `signature:…`,
    /// and one `derived_from:<memory_id>` per supporting memory
    pub relationships: Vec<String>,
    pub inference_type: String,
    pub signature: String,
    /// Stale inferred memories the orchestrator must delete after storing
    pub supersedes_memory_ids: Vec<String>,
}

#[derive(Debug, Default, Clone)]
struct PreferenceState {
    concise_score: f64,
    detailed_score: f64,
    updates: usize,
    last_emitted: Option<String>,
    concise_supporting_ids: Vec<String>,
    detailed_supporting_ids: Vec<String>,
}

struct SignatureReservation {
    signature: String,
    supersedes_memory_ids: Vec<String>,
}

/// Personalization tunables, normalized on construction
#[derive(Debug, Clone)]
pub struct PersonalizationConfig {
    pub enabled: bool,
    pub repeat_threshold: usize,
    pub similarity_threshold: f64,
    pub window_days: i64,
    pub min_feedback_events: usize,
    pub preference_margin: f64,
    pub inferred_ttl_days: i64,
    pub inferred_refresh_days: i64,
}

// ============================================================================
// ENGINE
// ============================================================================

/// Derive adaptive user-profile memories from repeated patterns and feedback
pub struct AdaptivePersonalizationEngine {
    storage: Arc<StorageManager>,
    config: PersonalizationConfig,
    /// `(account, signature) → last emitted`
    emitted_signatures: Mutex<HashMap<(String, String), DateTime<Utc>>>,
    /// `(account, entity) → running preference state`
    preference_state: Mutex<HashMap<(String, String), PreferenceState>>,
}

impl AdaptivePersonalizationEngine {
    pub fn new(storage: Arc<StorageManager>, config: PersonalizationConfig) -> Self {
        let config = PersonalizationConfig {
            enabled: config.enabled,
            repeat_threshold: config.repeat_threshold.max(2),
            similarity_threshold: config.similarity_threshold.clamp(0.0, 1.0),
            window_days: config.window_days.max(1),
            min_feedback_events: config.min_feedback_events.max(1),
            preference_margin: config.preference_margin.max(0.1),
            inferred_ttl_days: config.inferred_ttl_days.max(1),
            inferred_refresh_days: config.inferred_refresh_days.max(0),
        };
        Self {
            storage,
            config,
            emitted_signatures: Mutex::new(HashMap::new()),
            preference_state: Mutex::new(HashMap::new()),
        }
    }

    /// React to a freshly stored memory; returns inferred candidates to store
    pub fn observe_memory(
        &self,
        memory: &MemoryRecord,
        account_key: Option<&str>,
    ) -> Vec<InferredMemoryCandidate> {
        if !self.config.enabled {
            return Vec::new();
        }
        let intent = memory.intent.trim().to_lowercase();
        if intent.starts_with("inferred_") || is_inferred_memory(memory) {
            return Vec::new();
        }
        let Some(entity_id) = memory.primary_entity().map(str::to_string) else {
            return Vec::new();
        };

        let mut candidates = Vec::new();
        if TOPIC_CLUSTER_SOURCE_INTENTS.contains(&intent.as_str()) {
            if let Some(candidate) = self.infer_repeat_topic_cluster(memory, &entity_id, account_key)
            {
                candidates.push(candidate);
            }
        }
        if FAILURE_SOURCE_INTENTS.contains(&intent.as_str()) {
            if let Some(candidate) = self.infer_recurring_failure(memory, &entity_id, account_key) {
                candidates.push(candidate);
            }
        }
        if PROGRESS_SOURCE_INTENTS.contains(&intent.as_str()) {
            if let Some(candidate) = self.infer_progress_accumulation(memory, &entity_id, account_key)
            {
                candidates.push(candidate);
            }
        }
        candidates
    }

    /// React to feedback on ranked memories; may infer a style preference
    pub fn observe_feedback(
        &self,
        ranked_memories: &[MemoryRecord],
        helpful_memory_ids: &HashSet<String>,
        outcome_signal: f64,
        account_key: Option<&str>,
    ) -> Vec<InferredMemoryCandidate> {
        if !self.config.enabled {
            return Vec::new();
        }
        let mut candidates = Vec::new();
        let mut emitted_for_entity: HashSet<String> = HashSet::new();
        for memory in ranked_memories {
            if !intent_is_assistant(&memory.intent) {
                continue;
            }
            if !helpful_memory_ids.contains(&memory.memory_id) || outcome_signal <= 0.0 {
                continue;
            }
            let Some(entity_id) = memory.primary_entity().map(str::to_string) else {
                continue;
            };
            if emitted_for_entity.contains(&entity_id) {
                continue;
            }
            let style = style_bucket(memory);
            if let Some(candidate) = self.update_preference_state(
                &entity_id,
                style,
                outcome_signal.abs(),
                &memory.memory_id,
                account_key,
            ) {
                candidates.push(candidate);
                emitted_for_entity.insert(entity_id);
            }
        }
        candidates
    }

    /// Inferred memories past their TTL, ready for pruning
    pub fn expired_inferred_memory_ids(&self, account_key: Option<&str>) -> Vec<String> {
        if !self.config.enabled {
            return Vec::new();
        }
        let cutoff = Utc::now() - Duration::days(self.config.inferred_ttl_days);
        match self.storage.list_memories(None, account_key) {
            Ok(memories) => memories
                .into_iter()
                .filter(|memory| is_inferred_memory(memory) && memory.created_at < cutoff)
                .map(|memory| memory.memory_id)
                .collect(),
            Err(error) => {
                warn!(%error, "personalization ttl scan failed");
                Vec::new()
            }
        }
    }

    /// Forget registry stamps for deleted memories so signatures can re-emit
    pub fn notify_memories_deleted(&self, memories: &[MemoryRecord]) {
        if memories.is_empty() {
            return;
        }
        let mut signatures: HashSet<String> = HashSet::new();
        for memory in memories {
            for relation in &memory.relationships {
                if let Some(signature) = relation.trim().strip_prefix("signature:") {
                    signatures.insert(signature.to_string());
                }
            }
        }
        if signatures.is_empty() {
            return;
        }
        if let Ok(mut registry) = self.emitted_signatures.lock() {
            registry.retain(|(_, signature), _| !signatures.contains(signature));
        }
    }

    // ------------------------------------------------------------------
    // Inference families
    // ------------------------------------------------------------------

    fn infer_repeat_topic_cluster(
        &self,
        memory: &MemoryRecord,
        entity_id: &str,
        account_key: Option<&str>,
    ) -> Option<InferredMemoryCandidate> {
        let since = Utc::now() - Duration::days(self.config.window_days);
        let history = match self.storage.fetch_by_entity_and_intent(
            entity_id,
            &memory.intent.trim().to_lowercase(),
            Some(since),
            account_key,
        ) {
            Ok(history) => history,
            Err(error) => {
                warn!(%error, "personalization history fetch failed");
                return None;
            }
        };
        let history: Vec<MemoryRecord> = history
            .into_iter()
            .filter(|item| !is_inferred_memory(item))
            .collect();
        if history.len() < self.config.repeat_threshold {
            return None;
        }

        let (cluster, average_similarity) =
            self.topic_cluster(memory, &history, self.config.similarity_threshold);
        if cluster.len() < self.config.repeat_threshold {
            return None;
        }

        let topic_summary = representative_summary(&cluster);
        let reservation = self.reserve_signature(
            entity_id,
            "repeat_question_cluster",
            &topic_summary,
            account_key,
        )?;

        let confidence = (0.58
            + 0.08 * (cluster.len() - self.config.repeat_threshold) as f64
            + 0.18 * average_similarity)
            .min(0.96);
        let supporting_ids: Vec<String> = cluster
            .iter()
            .take(MAX_DERIVED_FROM)
            .map(|item| item.memory_id.clone())
            .collect();
        let summary = format!("{entity_id} repeatedly asks about {topic_summary}");
        let content = format!(
            "Inferred learning pattern: {entity_id} repeatedly asks about {topic_summary}. \
             Prioritize concise, step-by-step reinforcement and verify understanding before \
             moving to more advanced material."
        );
        Some(self.build_candidate(
            entity_id,
            "inferred_learning_pattern",
            "repeat_question_cluster",
            format!("{entity_id}->pattern:repeat_question_cluster"),
            summary,
            content,
            confidence,
            supporting_ids,
            reservation,
        ))
    }

    fn infer_recurring_failure(
        &self,
        memory: &MemoryRecord,
        entity_id: &str,
        account_key: Option<&str>,
    ) -> Option<InferredMemoryCandidate> {
        if !has_failure_signal(memory) {
            return None;
        }
        let history: Vec<MemoryRecord> = self
            .recent_entity_memories(entity_id, FAILURE_SOURCE_INTENTS, account_key)
            .into_iter()
            .filter(has_failure_signal_ref)
            .collect();
        if history.len() < self.config.repeat_threshold {
            return None;
        }

        let (cluster, average_similarity) =
            self.topic_cluster(memory, &history, self.relaxed_similarity_threshold());
        let cluster: Vec<MemoryRecord> =
            cluster.into_iter().filter(has_failure_signal_ref).collect();
        if cluster.len() < self.config.repeat_threshold {
            return None;
        }

        let topic_summary = representative_summary(&cluster);
        let reservation = self.reserve_signature(
            entity_id,
            "recurring_failure_pattern",
            &topic_summary,
            account_key,
        )?;

        let confidence = (0.6
            + 0.07 * (cluster.len() - self.config.repeat_threshold) as f64
            + 0.16 * average_similarity)
            .min(0.97);
        let supporting_ids: Vec<String> = cluster
            .iter()
            .take(MAX_DERIVED_FROM)
            .map(|item| item.memory_id.clone())
            .collect();
        let summary = format!("{entity_id} repeatedly struggles with {topic_summary}");
        let content = format!(
            "Inferred learning pattern: {entity_id} repeatedly struggles with {topic_summary}. \
             Prioritize targeted remediation, isolate the failing concept, and verify mastery \
             with progressively harder practice checks."
        );
        Some(self.build_candidate(
            entity_id,
            "inferred_learning_pattern",
            "recurring_failure_pattern",
            format!("{entity_id}->pattern:recurring_failure"),
            summary,
            content,
            confidence,
            supporting_ids,
            reservation,
        ))
    }

    fn infer_progress_accumulation(
        &self,
        memory: &MemoryRecord,
        entity_id: &str,
        account_key: Option<&str>,
    ) -> Option<InferredMemoryCandidate> {
        if !has_progress_signal(memory) {
            return None;
        }
        let history: Vec<MemoryRecord> = self
            .recent_entity_memories(entity_id, PROGRESS_SOURCE_INTENTS, account_key)
            .into_iter()
            .filter(has_progress_signal_ref)
            .collect();
        if history.len() < self.config.repeat_threshold {
            return None;
        }

        let (cluster, average_similarity) =
            self.topic_cluster(memory, &history, self.relaxed_similarity_threshold());
        let cluster: Vec<MemoryRecord> =
            cluster.into_iter().filter(has_progress_signal_ref).collect();
        if cluster.len() < self.config.repeat_threshold {
            return None;
        }

        let topic_summary = representative_summary(&cluster);
        let reservation = self.reserve_signature(
            entity_id,
            "progress_accumulation",
            &topic_summary,
            account_key,
        )?;

        let confidence = (0.58
            + 0.06 * (cluster.len() - self.config.repeat_threshold) as f64
            + 0.18 * average_similarity)
            .min(0.95);
        let supporting_ids: Vec<String> = cluster
            .iter()
            .take(MAX_DERIVED_FROM)
            .map(|item| item.memory_id.clone())
            .collect();
        let summary = format!("{entity_id} progressed in {topic_summary}");
        let content = format!(
            "Inferred progress: {entity_id} has progressed in {topic_summary}. Adjust tutoring \
             to the next challenge tier and reduce beginner-level repetition."
        );
        Some(self.build_candidate(
            entity_id,
            "learning_progress",
            "progress_accumulation",
            format!("{entity_id}->progress:accumulated_mastery"),
            summary,
            content,
            confidence,
            supporting_ids,
            reservation,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn build_candidate(
        &self,
        entity_id: &str,
        event_type: &str,
        inference_type: &str,
        pattern_relation: String,
        summary: String,
        content: String,
        confidence: f64,
        supporting_ids: Vec<String>,
        reservation: SignatureReservation,
    ) -> InferredMemoryCandidate {
        let mut relationships = vec![
            pattern_relation,
            "inferred:true".to_string(),
            format!("inference_type:{inference_type}"),
            format!("signature:{}", reservation.signature),
        ];
        relationships.extend(
            supporting_ids
                .iter()
                .map(|memory_id| format!("derived_from:{memory_id}")),
        );
        InferredMemoryCandidate {
            entity_id: entity_id.to_string(),
            event_type: event_type.to_string(),
            content,
            summary,
            confidence,
            relationships,
            inference_type: inference_type.to_string(),
            signature: reservation.signature,
            supersedes_memory_ids: reservation.supersedes_memory_ids,
        }
    }

    // ------------------------------------------------------------------
    // Preference inference
    // ------------------------------------------------------------------

    fn update_preference_state(
        &self,
        entity_id: &str,
        style: &'static str,
        signal: f64,
        source_memory_id: &str,
        account_key: Option<&str>,
    ) -> Option<InferredMemoryCandidate> {
        let account = account_key.unwrap_or("default").to_string();
        let delta = signal.max(0.1);
        let (margin, preferred_style, supporting_ids) = {
            let mut states = self.preference_state.lock().ok()?;
            let state = states
                .entry((account.clone(), entity_id.to_string()))
                .or_default();
            if style == "concise" {
                state.concise_score += delta;
                append_unique_limited(&mut state.concise_supporting_ids, source_memory_id);
            } else {
                state.detailed_score += delta;
                append_unique_limited(&mut state.detailed_supporting_ids, source_memory_id);
            }
            state.updates += 1;

            if state.updates < self.config.min_feedback_events {
                return None;
            }
            let margin = state.concise_score - state.detailed_score;
            if margin.abs() < self.config.preference_margin {
                return None;
            }
            let mut preferred = if margin > 0.0 { "concise" } else { "detailed" };
            // A narrowly-learned preference yields to an explicit one
            if let Some(explicit) = self.explicit_style_preference(entity_id, account_key) {
                if explicit != preferred && margin.abs() < self.config.preference_margin * 4.0 {
                    preferred = explicit;
                }
            }
            if state.last_emitted.as_deref() == Some(preferred) {
                return None;
            }
            state.last_emitted = Some(preferred.to_string());
            let supporting = if preferred == "concise" {
                state.concise_supporting_ids.clone()
            } else {
                state.detailed_supporting_ids.clone()
            };
            (margin, preferred, supporting)
        };

        let mut derived_from_ids: Vec<String> = supporting_ids
            .iter()
            .rev()
            .take(MAX_DERIVED_FROM)
            .rev()
            .cloned()
            .collect();
        if derived_from_ids.is_empty() {
            derived_from_ids.push(source_memory_id.to_string());
        }

        let confidence = (0.62 + (margin.abs() / 8.0).min(0.3)).min(0.95);
        let signature = signature(entity_id, "feedback_preference_shift", preferred_style);
        let (summary, content) = if preferred_style == "concise" {
            (
                format!("{entity_id} prefers concise explanations"),
                format!(
                    "Inferred preference: {entity_id} responds better to concise explanations. \
                     Keep responses short, concrete, and step-by-step."
                ),
            )
        } else {
            (
                format!("{entity_id} prefers detailed explanations"),
                format!(
                    "Inferred preference: {entity_id} responds better to detailed explanations. \
                     Include fuller context, rationale, and worked examples."
                ),
            )
        };
        let mut relationships = vec![
            format!("{entity_id}->preference:explanation_style={preferred_style}"),
            "inferred:true".to_string(),
            "inference_type:feedback_preference_shift".to_string(),
            format!("signature:{signature}"),
        ];
        relationships.extend(
            derived_from_ids
                .iter()
                .map(|memory_id| format!("derived_from:{memory_id}")),
        );
        if let Ok(mut registry) = self.emitted_signatures.lock() {
            registry.insert((account, signature.clone()), Utc::now());
        }
        Some(InferredMemoryCandidate {
            entity_id: entity_id.to_string(),
            event_type: "inferred_preference".to_string(),
            content,
            summary,
            confidence,
            relationships,
            inference_type: "feedback_preference_shift".to_string(),
            signature,
            supersedes_memory_ids: Vec::new(),
        })
    }

    fn explicit_style_preference(
        &self,
        entity_id: &str,
        account_key: Option<&str>,
    ) -> Option<&'static str> {
        let mut memories = match self.storage.list_memories(None, account_key) {
            Ok(memories) => memories,
            Err(error) => {
                warn!(%error, "personalization preference scan failed");
                return None;
            }
        };
        memories.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        for memory in memories {
            if !memory.entities.iter().any(|entity| entity == entity_id) {
                continue;
            }
            let intent = memory.intent.trim().to_lowercase();
            if !matches!(intent.as_str(), "preference_stated" | "user_profile" | "user_fact") {
                continue;
            }
            let text = format!("{} {}", memory.summary, memory.content).to_lowercase();
            if let Some(style) = style_preference_from_text(&text) {
                return Some(style);
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Signatures
    // ------------------------------------------------------------------

    fn reserve_signature(
        &self,
        entity_id: &str,
        inference_type: &str,
        topic_summary: &str,
        account_key: Option<&str>,
    ) -> Option<SignatureReservation> {
        let now = Utc::now();
        let refresh_window = Duration::days(self.config.inferred_refresh_days);
        let signature = signature(entity_id, inference_type, topic_summary);
        let account = account_key.unwrap_or("default").to_string();
        let registry_key = (account, signature.clone());

        {
            let registry = self.emitted_signatures.lock().ok()?;
            if let Some(last_emitted) = registry.get(&registry_key) {
                if now - *last_emitted < refresh_window {
                    return None;
                }
            }
        }

        let existing = self.signature_memories_in_storage(entity_id, &signature, account_key);
        let supersedes = if existing.is_empty() {
            Vec::new()
        } else {
            let freshest = existing
                .iter()
                .map(|memory| memory.created_at)
                .max()
                .unwrap_or(now);
            if now - freshest < refresh_window {
                if let Ok(mut registry) = self.emitted_signatures.lock() {
                    registry.insert(registry_key, now);
                }
                return None;
            }
            existing.into_iter().map(|memory| memory.memory_id).collect()
        };

        if let Ok(mut registry) = self.emitted_signatures.lock() {
            registry.insert(registry_key, now);
        }
        Some(SignatureReservation {
            signature,
            supersedes_memory_ids: supersedes,
        })
    }

    fn signature_memories_in_storage(
        &self,
        entity_id: &str,
        signature: &str,
        account_key: Option<&str>,
    ) -> Vec<MemoryRecord> {
        let marker = format!("signature:{signature}");
        match self.storage.list_memories(None, account_key) {
            Ok(memories) => memories
                .into_iter()
                .filter(|memory| {
                    memory.entities.iter().any(|entity| entity == entity_id)
                        && memory.relationships.iter().any(|relation| relation == &marker)
                })
                .collect(),
            Err(error) => {
                warn!(%error, "personalization signature scan failed");
                Vec::new()
            }
        }
    }

    // ------------------------------------------------------------------
    // Clustering
    // ------------------------------------------------------------------

    fn recent_entity_memories(
        &self,
        entity_id: &str,
        intents: &[&str],
        account_key: Option<&str>,
    ) -> Vec<MemoryRecord> {
        let since = Utc::now() - Duration::days(self.config.window_days);
        match self.storage.list_memories(None, account_key) {
            Ok(memories) => memories
                .into_iter()
                .filter(|memory| {
                    memory.entities.iter().any(|entity| entity == entity_id)
                        && memory.created_at >= since
                        && intents.contains(&memory.intent.trim().to_lowercase().as_str())
                        && !is_inferred_memory(memory)
                })
                .collect(),
            Err(error) => {
                warn!(%error, "personalization entity scan failed");
                Vec::new()
            }
        }
    }

    /// Members of `candidates` similar to the anchor, sorted by similarity,
    /// plus the cluster's average similarity
    fn topic_cluster(
        &self,
        anchor: &MemoryRecord,
        candidates: &[MemoryRecord],
        min_similarity: f64,
    ) -> (Vec<MemoryRecord>, f64) {
        let threshold = min_similarity.clamp(0.0, 1.0);
        let mut scored: Vec<(MemoryRecord, f64)> = candidates
            .iter()
            .filter_map(|candidate| {
                let similarity = semantic_similarity(anchor, candidate);
                if similarity >= threshold {
                    Some((candidate.clone(), similarity))
                } else {
                    None
                }
            })
            .collect();
        if scored.is_empty() {
            return (Vec::new(), 0.0);
        }
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let average = scored.iter().map(|(_, s)| s).sum::<f64>() / scored.len() as f64;
        (scored.into_iter().map(|(memory, _)| memory).collect(), average)
    }

    fn relaxed_similarity_threshold(&self) -> f64 {
        (self.config.similarity_threshold * 0.12).max(0.1)
    }
}

// ============================================================================
// FREE HELPERS
// ============================================================================

/// Inferred either by intent prefix or by provenance relationships
pub fn is_inferred_memory(memory: &MemoryRecord) -> bool {
    if memory.intent.trim().to_lowercase().starts_with("inferred_") {
        return true;
    }
    memory.relationships.iter().any(|relation| {
        let normalized = relation.trim().to_lowercase();
        normalized == "inferred:true"
            || normalized.starts_with("inference_type:")
            || normalized.starts_with("signature:")
    })
}

fn signature(entity_id: &str, inference_type: &str, topic_summary: &str) -> String {
    let normalized_topic = topic_summary
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    format!("{entity_id}|{inference_type}|{normalized_topic}")
}

fn tokens(memory: &MemoryRecord) -> HashSet<String> {
    let text = format!("{} {}", memory.summary, memory.content).to_lowercase();
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

fn has_failure_signal(memory: &MemoryRecord) -> bool {
    let tokens = tokens(memory);
    !tokens.is_empty() && FAILURE_TERMS.iter().any(|term| tokens.contains(*term))
}

fn has_failure_signal_ref(memory: &MemoryRecord) -> bool {
    has_failure_signal(memory)
}

fn has_progress_signal(memory: &MemoryRecord) -> bool {
    let tokens = tokens(memory);
    if tokens.is_empty() || FAILURE_TERMS.iter().any(|term| tokens.contains(*term)) {
        return false;
    }
    PROGRESS_TERMS.iter().any(|term| tokens.contains(*term))
}

fn has_progress_signal_ref(memory: &MemoryRecord) -> bool {
    has_progress_signal(memory)
}

fn lexical_similarity(anchor: &MemoryRecord, candidate: &MemoryRecord) -> f64 {
    let anchor_tokens = tokens(anchor);
    let candidate_tokens = tokens(candidate);
    if anchor_tokens.is_empty() || candidate_tokens.is_empty() {
        return 0.0;
    }
    let intersection = anchor_tokens.intersection(&candidate_tokens).count();
    let union = anchor_tokens.union(&candidate_tokens).count();
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

/// Max of vector cosine and lexical Jaccard; identical semantic keys count
/// as 1.0 when the vectors are unusable
fn semantic_similarity(anchor: &MemoryRecord, candidate: &MemoryRecord) -> f64 {
    let lexical = lexical_similarity(anchor, candidate);
    if !anchor.semantic_embedding.is_empty()
        && anchor.semantic_embedding.len() == candidate.semantic_embedding.len()
    {
        let vector =
            cosine_similarity(&anchor.semantic_embedding, &candidate.semantic_embedding) as f64;
        return vector.max(lexical);
    }
    if anchor.semantic_key == candidate.semantic_key {
        return 1.0;
    }
    lexical
}

/// Most frequent cleaned summary in the cluster (ties prefer longer text),
/// clipped to 140 chars
fn representative_summary(cluster: &[MemoryRecord]) -> String {
    let mut counts: HashMap<String, (usize, String)> = HashMap::new();
    for memory in cluster {
        let cleaned = memory.summary.split_whitespace().collect::<Vec<_>>().join(" ");
        if cleaned.is_empty() {
            continue;
        }
        let entry = counts
            .entry(cleaned.to_lowercase())
            .or_insert((0, cleaned.clone()));
        entry.0 += 1;
    }
    if counts.is_empty() {
        return "current learning topic".to_string();
    }
    let mut ranked: Vec<(usize, String)> = counts.into_values().collect();
    ranked.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.len().cmp(&a.1.len())));
    let selected = &ranked[0].1;
    if selected.chars().count() <= 140 {
        return selected.clone();
    }
    let clipped: String = selected.chars().take(137).collect();
    format!("{}...", clipped.trim_end())
}

fn append_unique_limited(values: &mut Vec<String>, value: &str) {
    let normalized = value.trim();
    if normalized.is_empty() {
        return;
    }
    values.retain(|existing| existing != normalized);
    values.push(normalized.to_string());
    if values.len() > MAX_SUPPORTING_IDS {
        let excess = values.len() - MAX_SUPPORTING_IDS;
        values.drain(..excess);
    }
}

fn style_preference_from_text(text: &str) -> Option<&'static str> {
    let concise_markers = ["concise", "short", "brief", "compact"];
    let detailed_markers = ["detailed", "fuller context", "step-by-step", "in-depth"];
    let has_concise = concise_markers.iter().any(|marker| text.contains(marker));
    let has_detailed = detailed_markers.iter().any(|marker| text.contains(marker));
    if has_detailed && !has_concise {
        return Some("detailed");
    }
    if has_concise && !has_detailed {
        return Some("concise");
    }
    None
}

/// Bucket an assistant response into concise vs detailed by length markers,
/// word count, and sentence count
fn style_bucket(memory: &MemoryRecord) -> &'static str {
    let mut text = memory.content.trim().to_lowercase();
    let summary_text = memory.summary.trim().to_lowercase();
    if text.is_empty() {
        text = summary_text.clone();
    }
    let detail_markers = [
        "fuller context",
        "worked examples",
        "postmortem",
        "regression tests",
        "step-by-step",
    ];
    if detail_markers.iter().any(|marker| text.contains(marker)) {
        return "detailed";
    }
    let word_count = text.split_whitespace().count();
    let sentence_count =
        text.matches('.').count() + text.matches('!').count() + text.matches('?').count();
    if word_count <= 32 && sentence_count <= 2 {
        return "concise";
    }
    if word_count >= 36 || sentence_count >= 3 {
        return "detailed";
    }
    let summary_markers = ["fuller context", "worked examples", "regression tests"];
    if summary_markers.iter().any(|marker| summary_text.contains(marker)) {
        return "detailed";
    }
    "concise"
}

// ============================================================================
// TESTS
// ============================================================================
