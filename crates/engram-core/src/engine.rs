//! Decision Engine Orchestrator
//!
//! Composes the pipeline in dependency order (storage, learned models,
//! encoder, decision logic, vector index, personalization) and drives
//! ingest, retrieval, and feedback. Owns the per-tenant caches (entity
//! reference counts, entity→memory ids, recent `(entity, intent)` event
//! timestamps) plus the engine metrics counters; no component reaches back
//! into the orchestrator.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{info, warn};

use crate::compression::CompressionPlanner;
use crate::config::EngineConfig;
use crate::decision::{DecayPolicyAssigner, DecisionLogic};
use crate::encoding::{EmbeddingProvider, SemanticEncoder, SemanticProvider};
use crate::error::{EngineError, Result};
use crate::learning::{DecayLearner, ImportanceModel, LearningLoop, RetrievalRanker};
use crate::model::{
    intent_is_assistant, ContextMap, EncodedEvent, Event, MemoryRecord, MemorySnapshot,
    OutcomeFeedback, ProcessedEvent, RawEvent, RetrievedMemory, SemanticUnderstanding,
    StorageDecision, StorageTier,
};
use crate::personalization::{
    AdaptivePersonalizationEngine, InferredMemoryCandidate, PersonalizationConfig,
};
use crate::search::VectorStore;
use crate::storage::{StorageManager, StorageOptions};

/// Decay assigned to inferred memories (half-life 90 days)
const INFERRED_DECAY_RATE: f64 = 1.0 / 90.0;

// ============================================================================
// REQUEST / RESULT TYPES
// ============================================================================

/// A retrieval request with optional tenant-visible filters
#[derive(Debug, Clone)]
pub struct RetrieveRequest {
    pub query: String,
    pub limit: usize,
    pub entity_id: Option<String>,
    pub event_type: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl RetrieveRequest {
    pub fn new(query: impl Into<String>, limit: usize) -> Self {
        Self {
            query: query.into(),
            limit,
            entity_id: None,
            event_type: None,
            start_time: None,
            end_time: None,
        }
    }
}

/// Ranked, capped retrieval result
#[derive(Debug, Clone)]
pub struct RetrieveOutcome {
    pub memories: Vec<RetrievedMemory>,
    /// Candidate pool size after filtering, before ranking caps
    pub total_candidates: usize,
}

/// Losses reported back from one feedback application
#[derive(Debug, Clone, Copy, Default)]
pub struct FeedbackResult {
    pub rank_loss: Option<f64>,
    pub importance_loss: Option<f64>,
}

// ============================================================================
// CACHES & METRICS
// ============================================================================

#[derive(Default)]
struct TenantCaches {
    /// account → live memory count
    total_memories: HashMap<String, i64>,
    /// (account, entity) → reference count across live memories
    entity_refs: HashMap<(String, String), i64>,
    /// (account, entity) → memory ids
    entity_memory_ids: HashMap<(String, String), BTreeSet<String>>,
    /// (account, entity, intent) → event timestamps inside the rolling
    /// window. Event history, not live memories: compression replacements
    /// and deletions do not rewrite it; entries only age out.
    recent_key_timestamps: HashMap<(String, String, String), Vec<DateTime<Utc>>>,
}

#[derive(Default)]
struct EngineMetrics {
    events_received: f64,
    events_stored: f64,
    events_discarded: f64,
    compression_events: f64,
    feedback_events: f64,
    inferred_memories_created: f64,
    ops_since_flush: u64,
}

// ============================================================================
// ENGINE
// ============================================================================

/// Main orchestrator for encoding, storing, retrieving, and learning
pub struct DecisionEngine {
    config: EngineConfig,
    encoder: SemanticEncoder,
    importance: Mutex<ImportanceModel>,
    decay: Mutex<DecayLearner>,
    ranker: Mutex<RetrievalRanker>,
    storage: Arc<StorageManager>,
    vector_store: VectorStore,
    decision_logic: DecisionLogic,
    compression_planner: CompressionPlanner,
    personalization: AdaptivePersonalizationEngine,
    caches: Mutex<TenantCaches>,
    metrics: Mutex<EngineMetrics>,
    last_lifecycle_check: Mutex<Option<DateTime<Utc>>>,
    persist_vector_index: bool,
}

impl DecisionEngine {
    /// Build an engine with the provider named by `ENGRAM_EMBEDDING_PROVIDER`
    /// (the deterministic hash provider when unset) and context-based
    /// semantic understanding
    pub fn new(config: EngineConfig) -> Result<Self> {
        let provider_name = std::env::var("ENGRAM_EMBEDDING_PROVIDER").ok();
        let embedding_provider = crate::encoding::embedding_provider_from_name(
            provider_name.as_deref(),
            config.embedding_dim,
        )?;
        Self::with_providers(
            config,
            embedding_provider,
            Box::new(crate::encoding::ContextSemanticProvider),
        )
    }

    /// Build an engine with explicit provider bindings
    pub fn with_providers(
        config: EngineConfig,
        embedding_provider: Box<dyn EmbeddingProvider>,
        semantic_provider: Box<dyn SemanticProvider>,
    ) -> Result<Self> {
        config.validate()?;

        let storage = Arc::new(StorageManager::new(
            &config.sqlite_path,
            StorageOptions {
                max_content_chars: config.max_content_chars,
                assistant_max_content_chars: config.assistant_max_content_chars,
                store_raw_embedding: config.store_raw_embedding,
                write_retry_attempts: config.write_retry_attempts,
            },
        )?);

        let persist_vector_index = config.sqlite_path != ":memory:";
        let index_path = if persist_vector_index {
            PathBuf::from(&config.sqlite_path).with_extension("idx")
        } else {
            PathBuf::from("runtime_vector_index.idx")
        };
        let vector_store = VectorStore::new(config.embedding_dim, index_path);
        if persist_vector_index {
            if let Err(error) = vector_store.load() {
                warn!(%error, "vector index side-file ignored");
            }
        }

        let encoder = SemanticEncoder::new(
            embedding_provider,
            semantic_provider,
            config.embedding_dim,
        );
        let personalization = AdaptivePersonalizationEngine::new(
            storage.clone(),
            PersonalizationConfig {
                enabled: config.enable_adaptive_personalization,
                repeat_threshold: config.personalization_repeat_threshold,
                similarity_threshold: config.personalization_similarity_threshold,
                window_days: config.personalization_window_days,
                min_feedback_events: config.personalization_min_feedback_events,
                preference_margin: config.personalization_preference_margin,
                inferred_ttl_days: config.personalization_inferred_ttl_days,
                inferred_refresh_days: config.personalization_inferred_refresh_days,
            },
        );

        let engine = Self {
            importance: Mutex::new(ImportanceModel::new(
                config.embedding_dim,
                config.importance_learning_rate,
            )),
            decay: Mutex::new(DecayLearner::new(config.decay_learning_rate)),
            ranker: Mutex::new(RetrievalRanker::new(
                config.ranker_learning_rate,
                config.ranker_min_training_samples,
                config.ranker_training_batch_size,
            )),
            decision_logic: DecisionLogic::new(
                config.persistent_confidence_prior,
                config.ephemeral_confidence_prior,
                config.compression_min_count,
            ),
            compression_planner: CompressionPlanner::new(
                config.compression_min_count,
                config.compression_window_days,
                config.compression_max_items_in_summary,
            ),
            personalization,
            encoder,
            storage,
            vector_store,
            caches: Mutex::new(TenantCaches::default()),
            metrics: Mutex::new(EngineMetrics::default()),
            last_lifecycle_check: Mutex::new(None),
            persist_vector_index,
            config,
        };
        engine.warm_caches_from_storage()?;
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn storage(&self) -> &StorageManager {
        &self.storage
    }

    // ------------------------------------------------------------------
    // Stage 1: input
    // ------------------------------------------------------------------

    /// Validate and semantically encode an external event
    pub fn process_input(&self, event: &Event) -> Result<ProcessedEvent> {
        lock_recover(&self.metrics).events_received += 1.0;
        self.process_event_internal(event)
    }

    /// Encoding without the received-events counter; compression
    /// replacements and inferred candidates re-enter through here
    fn process_event_internal(&self, event: &Event) -> Result<ProcessedEvent> {
        if event.description.trim().is_empty() {
            return Err(EngineError::Validation(
                "event description cannot be empty".into(),
            ));
        }
        let raw_event = to_raw_event(event);
        let encoded = self.encoder.encode_event(&raw_event)?;
        let mut entity_references = vec![event.entity_id.clone()];
        for entity in &encoded.understanding.entities {
            if !entity_references.contains(entity) {
                entity_references.push(entity.clone());
            }
        }
        Ok(ProcessedEvent {
            event_id: raw_event.event_id,
            timestamp: raw_event.timestamp,
            entity_id: event.entity_id.clone(),
            event_type: event.event_type.clone(),
            description: event.description.trim().to_string(),
            entity_references,
            embedding: encoded.raw_embedding,
            semantic_embedding: encoded.semantic_embedding,
            intent: encoded.understanding.intent.clone(),
            semantic_key: encoded.semantic_key,
            semantic_summary: encoded.understanding.summary.clone(),
            context: event.metadata.clone(),
        })
    }

    /// Encode a retrieval query
    pub fn encode_query(&self, query: &str) -> Result<Vec<f32>> {
        Ok(self.encoder.encode_query(query)?)
    }

    // ------------------------------------------------------------------
    // Stage 2: decision
    // ------------------------------------------------------------------

    pub fn make_storage_decision(
        &self,
        processed: &ProcessedEvent,
        account_key: &str,
    ) -> StorageDecision {
        let snapshot = self.memory_snapshot(processed, account_key);
        let importance = lock_recover(&self.importance);
        let decay = lock_recover(&self.decay);
        self.decision_logic
            .decide(&importance, &decay, processed, &snapshot)
    }

    /// Persist a stored decision; returns `None` for discards
    pub fn store_memory(
        &self,
        processed: &ProcessedEvent,
        decision: &StorageDecision,
        account_key: &str,
    ) -> Result<Option<MemoryRecord>> {
        if !decision.store {
            {
                let mut metrics = lock_recover(&self.metrics);
                metrics.events_discarded += 1.0;
            }
            self.schedule_metrics_flush();
            return Ok(None);
        }

        let stored = self.store_core_memory(processed, decision, account_key)?;
        self.register_memory(&stored, true);
        lock_recover(&self.metrics).events_stored += 1.0;

        let candidates = self
            .personalization
            .observe_memory(&stored, Some(account_key));
        self.store_inferred_candidates(candidates, account_key);

        if decision.should_compress {
            if let Err(error) = self.maybe_compress_cluster(processed, account_key) {
                warn!(%error, entity_id = %processed.entity_id, "compression pass failed");
            }
        }

        self.run_lifecycle_maintenance();
        self.schedule_metrics_flush();
        Ok(Some(stored))
    }

    /// Encode, decide, and store one event
    pub fn ingest(
        &self,
        event: &Event,
        account_key: &str,
    ) -> Result<(StorageDecision, Option<MemoryRecord>)> {
        let processed = self.process_input(event)?;
        let mut decision = self.make_storage_decision(&processed, account_key);
        let stored = self.store_memory(&processed, &decision, account_key)?;
        if let Some(record) = &stored {
            info!(
                memory_id = %record.memory_id,
                confidence = decision.confidence,
                tier = %decision.storage_tier,
                "memory stored"
            );
        } else {
            info!(
                event_id = %processed.event_id,
                confidence = decision.confidence,
                "memory discarded"
            );
        }
        decision.trace.insert(
            "stored".to_string(),
            if stored.is_some() { 1.0 } else { 0.0 },
        );
        Ok((decision, stored))
    }

    // ------------------------------------------------------------------
    // Stage 3: retrieval
    // ------------------------------------------------------------------

    pub fn retrieve(
        &self,
        request: &RetrieveRequest,
        account_key: &str,
    ) -> Result<RetrieveOutcome> {
        if request.query.trim().is_empty() {
            return Err(EngineError::Validation("query cannot be empty".into()));
        }
        if request.limit == 0 {
            return Err(EngineError::Validation("limit must be >= 1".into()));
        }
        let query_embedding = self.encoder.encode_query(&request.query)?;
        let pool_size = std::cmp::max(80, request.limit * 12);

        let preselected = self.preselect(&query_embedding, request, account_key, pool_size)?;
        let mut candidates = apply_filters(preselected, request);
        candidates =
            self.ensure_non_assistant_candidates(candidates, request, account_key, pool_size)?;
        let total_candidates = candidates.len();

        let ranked = {
            let ranker = lock_recover(&self.ranker);
            ranker.rank(&query_embedding, &candidates, Utc::now())
        };
        let selected = self.select_with_intent_caps(ranked, request.limit);
        for item in &selected {
            if let Err(error) = self
                .storage
                .update_retrieval(&item.memory.memory_id, Some(account_key))
            {
                warn!(%error, memory_id = %item.memory.memory_id, "retrieval count update failed");
            }
        }
        info!(query = %request.query, returned = selected.len(), "memory retrieved");
        Ok(RetrieveOutcome {
            memories: selected,
            total_candidates,
        })
    }

    fn preselect(
        &self,
        query_embedding: &[f32],
        request: &RetrieveRequest,
        account_key: &str,
        pool_size: usize,
    ) -> Result<Vec<MemoryRecord>> {
        if let Some(entity_id) = &request.entity_id {
            let entity_ids = self.memory_ids_for_entity(account_key, entity_id);
            let preselected = self.storage.fetch_by_ids(&entity_ids, Some(account_key))?;
            if !preselected.is_empty() {
                return Ok(preselected);
            }
        }
        let hits = self.vector_store.search(query_embedding, pool_size);
        let hit_ids: Vec<String> = hits.into_iter().map(|hit| hit.memory_id).collect();
        let preselected = self.storage.fetch_by_ids(&hit_ids, Some(account_key))?;
        if !preselected.is_empty() {
            return Ok(preselected);
        }
        Ok(self
            .storage
            .search_candidates(query_embedding, pool_size, Some(account_key))?)
    }

    /// Backfill non-assistant memories until the cap can be satisfied
    fn ensure_non_assistant_candidates(
        &self,
        candidates: Vec<MemoryRecord>,
        request: &RetrieveRequest,
        account_key: &str,
        pool_size: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let top_k = request.limit;
        let required_non_assistant = top_k.saturating_sub(self.assistant_cap(top_k));
        let mut current_non_assistant = candidates
            .iter()
            .filter(|memory| !memory.is_assistant_intent())
            .count();
        if current_non_assistant >= required_non_assistant {
            return Ok(candidates);
        }

        let fallback_limit = std::cmp::max(pool_size, top_k * 8);
        let fallback_pool = apply_filters(
            self.storage
                .list_memories(Some(fallback_limit), Some(account_key))?,
            request,
        );
        let mut seen: HashSet<String> = candidates
            .iter()
            .map(|memory| memory.memory_id.clone())
            .collect();
        let mut enriched = candidates;
        for memory in fallback_pool {
            if seen.contains(&memory.memory_id) || memory.is_assistant_intent() {
                continue;
            }
            seen.insert(memory.memory_id.clone());
            enriched.push(memory);
            current_non_assistant += 1;
            if current_non_assistant >= required_non_assistant {
                break;
            }
        }
        Ok(enriched)
    }

    /// Admit ranked items while assistant intents stay within the cap;
    /// deferred assistant items fill any remaining slots at the end.
    fn select_with_intent_caps(
        &self,
        ranked: Vec<RetrievedMemory>,
        top_k: usize,
    ) -> Vec<RetrievedMemory> {
        if top_k == 0 {
            return Vec::new();
        }
        let assistant_cap = self.assistant_cap(top_k);
        let mut selected = Vec::with_capacity(top_k);
        let mut deferred = Vec::new();
        let mut assistant_count = 0usize;
        for item in ranked {
            let is_assistant = intent_is_assistant(&item.memory.intent);
            if is_assistant && assistant_count >= assistant_cap {
                deferred.push(item);
                continue;
            }
            if is_assistant {
                assistant_count += 1;
            }
            selected.push(item);
            if selected.len() >= top_k {
                return selected;
            }
        }
        for item in deferred {
            if selected.len() >= top_k {
                break;
            }
            selected.push(item);
        }
        selected
    }

    fn assistant_cap(&self, top_k: usize) -> usize {
        let share = self.config.assistant_response_max_share.clamp(0.0, 1.0);
        std::cmp::min(top_k, (top_k as f64 * share) as usize)
    }

    // ------------------------------------------------------------------
    // Stage 4: learning
    // ------------------------------------------------------------------

    pub fn record_feedback(
        &self,
        feedback: &OutcomeFeedback,
        account_key: &str,
    ) -> Result<FeedbackResult> {
        if !(-1.0..=1.0).contains(&feedback.outcome_signal) {
            return Err(EngineError::Validation(
                "outcome_signal must be between -1.0 and 1.0".into(),
            ));
        }
        let query_embedding = self.encoder.encode_query(&feedback.query)?;
        let memories = self
            .storage
            .fetch_by_ids(&feedback.ranked_memory_ids, Some(account_key))?;
        lock_recover(&self.metrics).feedback_events += 1.0;

        let outcome = {
            let mut importance = lock_recover(&self.importance);
            let mut decay = lock_recover(&self.decay);
            let mut ranker = lock_recover(&self.ranker);
            LearningLoop::record_feedback(
                feedback,
                &query_embedding,
                &memories,
                Utc::now(),
                &mut importance,
                &mut decay,
                &mut ranker,
                |memory_id, signal| {
                    if let Err(error) =
                        self.storage.update_outcome(memory_id, signal, Some(account_key))
                    {
                        warn!(%error, memory_id, "outcome update failed");
                    }
                },
            )
        };

        let helpful: HashSet<String> = feedback.helpful_memory_ids.iter().cloned().collect();
        let candidates = self.personalization.observe_feedback(
            &memories,
            &helpful,
            feedback.outcome_signal,
            Some(account_key),
        );
        self.store_inferred_candidates(candidates, account_key);
        self.schedule_metrics_flush();
        Ok(FeedbackResult {
            rank_loss: outcome.rank_loss,
            importance_loss: outcome.importance_loss,
        })
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn memory_count(&self, account_key: Option<&str>) -> Result<i64> {
        Ok(self.storage.count_memories(account_key)?)
    }

    pub fn fetch_memories(
        &self,
        memory_ids: &[String],
        account_key: &str,
    ) -> Result<Vec<MemoryRecord>> {
        Ok(self.storage.fetch_by_ids(memory_ids, Some(account_key))?)
    }

    /// Memory ids referencing the entity, sorted
    pub fn memory_ids_for_entity(&self, account_key: &str, entity_id: &str) -> Vec<String> {
        let caches = lock_recover(&self.caches);
        caches
            .entity_memory_ids
            .get(&(account_key.to_string(), entity_id.to_string()))
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Tenant memories with the learned half-life attached
    pub fn list_memories(
        &self,
        limit: Option<usize>,
        account_key: Option<&str>,
    ) -> Result<Vec<MemoryRecord>> {
        let mut records = self.storage.list_memories(limit, account_key)?;
        let decay = lock_recover(&self.decay);
        for record in &mut records {
            let (rate, half_life) = DecayPolicyAssigner::assign(&decay, &record.semantic_key);
            record.decay_half_life_days = if rate > 0.0 { Some(half_life) } else { None };
        }
        Ok(records)
    }

    /// Decayed residual relevance for a memory right now
    pub fn estimate_memory_relevance(&self, memory: &MemoryRecord) -> f64 {
        let decay = lock_recover(&self.decay);
        decay.predict_relevance(
            &memory.semantic_key,
            memory.age_days(Utc::now()),
            memory.latest_importance,
        )
    }

    /// Engine metrics counters, for status surfaces and tests
    pub fn metrics_snapshot(&self) -> HashMap<String, f64> {
        let metrics = lock_recover(&self.metrics);
        HashMap::from([
            ("events_received".to_string(), metrics.events_received),
            ("events_stored".to_string(), metrics.events_stored),
            ("events_discarded".to_string(), metrics.events_discarded),
            ("compression_events".to_string(), metrics.compression_events),
            ("feedback_events".to_string(), metrics.feedback_events),
            (
                "inferred_memories_created".to_string(),
                metrics.inferred_memories_created,
            ),
        ])
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Background maintenance entry point: TTL pruning plus a metrics flush
    pub fn run_maintenance(&self) {
        let pruned = self.prune_expired_inferred();
        if pruned > 0 {
            info!(pruned, "expired inferred memories pruned");
        }
        self.write_metrics();
    }

    /// Delete inferred memories past their TTL across all tenants.
    /// Returns how many were removed.
    pub fn prune_expired_inferred(&self) -> usize {
        let expired = self.personalization.expired_inferred_memory_ids(None);
        if expired.is_empty() {
            return 0;
        }
        let records = match self.storage.fetch_by_ids(&expired, None) {
            Ok(records) => records,
            Err(error) => {
                warn!(%error, "ttl prune fetch failed");
                return 0;
            }
        };
        if let Err(error) = self.storage.delete_memories(&expired, None) {
            warn!(%error, "ttl prune delete failed");
            return 0;
        }
        self.vector_store.remove_many(&expired);
        for record in &records {
            self.unregister_memory(record);
        }
        self.personalization.notify_memories_deleted(&records);
        records.len()
    }

    /// Flush metrics and persist the vector index side-file
    pub fn close(&self) {
        self.write_metrics();
        if self.persist_vector_index {
            if let Err(error) = self.vector_store.save() {
                warn!(%error, "vector index save failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn store_core_memory(
        &self,
        processed: &ProcessedEvent,
        decision: &StorageDecision,
        account_key: &str,
    ) -> Result<MemoryRecord> {
        let encoded = to_encoded_event(processed);
        let stored = self.storage.store(&encoded, decision, account_key)?;
        self.vector_store
            .add(&stored.memory_id, &stored.semantic_embedding);
        Ok(stored)
    }

    fn maybe_compress_cluster(
        &self,
        processed: &ProcessedEvent,
        account_key: &str,
    ) -> Result<()> {
        let since = self.compression_planner.window_start(Utc::now());
        let candidates = self.storage.fetch_by_entity_and_intent(
            &processed.entity_id,
            &processed.intent,
            Some(since),
            Some(account_key),
        )?;
        let plan = self.compression_planner.plan(processed, &candidates);
        if !plan.should_compress {
            return Ok(());
        }

        // Replace the originals before inserting the summary: either the
        // whole replacement lands or the originals stay intact.
        self.storage
            .delete_memories(&plan.memory_ids_to_replace, Some(account_key))?;
        self.vector_store.remove_many(&plan.memory_ids_to_replace);
        for memory in &candidates {
            self.unregister_memory(memory);
        }
        self.personalization.notify_memories_deleted(&candidates);

        let mut metadata = ContextMap::new();
        metadata.insert("summary".into(), json!(plan.summary_text));
        metadata.insert("intent".into(), json!(processed.intent));
        metadata.insert("entities".into(), json!([processed.entity_id]));
        metadata.insert("compressed".into(), json!(true));
        metadata.insert("compressed_original_count".into(), json!(plan.original_count));
        let compressed_event = Event {
            timestamp: processed.timestamp,
            entity_id: processed.entity_id.clone(),
            event_type: processed.event_type.clone(),
            description: plan.summary_text.clone(),
            metadata,
        };
        let compressed_processed = self.process_event_internal(&compressed_event)?;

        let confidence_seed = processed
            .context
            .get("importance")
            .and_then(|value| value.as_f64())
            .unwrap_or(0.8);
        let compressed_decision = StorageDecision {
            store: true,
            storage_tier: StorageTier::Persistent,
            confidence: confidence_seed.max(0.8),
            decay_rate: 1.0 / plan.original_count.max(1) as f64,
            decay_half_life: plan.original_count as f64,
            should_compress: false,
            rationale: "compression-replacement".to_string(),
            trace: HashMap::new(),
            is_compressed: true,
            original_count: plan.original_count,
        };
        let compressed_record =
            self.store_core_memory(&compressed_processed, &compressed_decision, account_key)?;
        // The replacement is not a new event at the key; only the entity
        // caches learn about it
        self.register_memory(&compressed_record, false);
        lock_recover(&self.metrics).compression_events += 1.0;
        warn!(
            entity_id = %processed.entity_id,
            intent = %processed.intent,
            original_count = plan.original_count,
            "compression triggered"
        );
        Ok(())
    }

    fn store_inferred_candidates(
        &self,
        candidates: Vec<InferredMemoryCandidate>,
        account_key: &str,
    ) {
        for candidate in candidates {
            if let Err(error) = self.store_inferred_candidate(&candidate, account_key) {
                warn!(
                    %error,
                    entity_id = %candidate.entity_id,
                    inference_type = %candidate.inference_type,
                    "inferred memory store failed"
                );
            }
        }
    }

    fn store_inferred_candidate(
        &self,
        candidate: &InferredMemoryCandidate,
        account_key: &str,
    ) -> Result<()> {
        let mut metadata = ContextMap::new();
        metadata.insert("summary".into(), json!(candidate.summary));
        metadata.insert("intent".into(), json!(candidate.event_type));
        metadata.insert("entities".into(), json!([candidate.entity_id]));
        metadata.insert("relationships".into(), json!(candidate.relationships));
        metadata.insert("inferred".into(), json!(true));
        metadata.insert("inference_type".into(), json!(candidate.inference_type));
        let event = Event {
            timestamp: Utc::now(),
            entity_id: candidate.entity_id.clone(),
            event_type: candidate.event_type.clone(),
            description: candidate.content.clone(),
            metadata,
        };
        let processed = self.process_event_internal(&event)?;
        let decision = StorageDecision {
            store: true,
            storage_tier: StorageTier::Persistent,
            confidence: candidate.confidence.clamp(0.5, 0.99),
            decay_rate: INFERRED_DECAY_RATE,
            decay_half_life: 90.0,
            should_compress: false,
            rationale: "adaptive_personalization_inference".to_string(),
            trace: HashMap::new(),
            is_compressed: false,
            original_count: 1,
        };
        let stored = self.store_core_memory(&processed, &decision, account_key)?;
        self.register_memory(&stored, false);
        {
            let mut metrics = lock_recover(&self.metrics);
            metrics.events_stored += 1.0;
            metrics.inferred_memories_created += 1.0;
        }

        // A fresh inference supersedes its stale predecessors
        if !candidate.supersedes_memory_ids.is_empty() {
            let superseded = self
                .storage
                .fetch_by_ids(&candidate.supersedes_memory_ids, Some(account_key))?;
            self.storage
                .delete_memories(&candidate.supersedes_memory_ids, Some(account_key))?;
            self.vector_store.remove_many(&candidate.supersedes_memory_ids);
            for record in &superseded {
                self.unregister_memory(record);
            }
        }
        info!(
            entity_id = %candidate.entity_id,
            event_type = %candidate.event_type,
            confidence = candidate.confidence,
            memory_id = %stored.memory_id,
            "adaptive inferred memory stored"
        );
        Ok(())
    }

    /// Lazy TTL sweep, throttled by the lifecycle interval
    fn run_lifecycle_maintenance(&self) {
        let interval = self.config.personalization_lifecycle_check_interval_seconds;
        let now = Utc::now();
        {
            let mut last = lock_recover(&self.last_lifecycle_check);
            if let Some(previous) = *last {
                if interval > 0 && now - previous < Duration::seconds(interval) {
                    return;
                }
            }
            *last = Some(now);
        }
        self.prune_expired_inferred();
    }

    fn memory_snapshot(&self, processed: &ProcessedEvent, account_key: &str) -> MemorySnapshot {
        let window_start = self.compression_planner.window_start(processed.timestamp);
        let mut caches = lock_recover(&self.caches);
        let total = caches
            .total_memories
            .get(account_key)
            .copied()
            .unwrap_or(0);
        let refs = caches
            .entity_refs
            .get(&(account_key.to_string(), processed.entity_id.clone()))
            .copied()
            .unwrap_or(0);
        let key = (
            account_key.to_string(),
            processed.entity_id.clone(),
            processed.intent.clone(),
        );
        let similar_recent = match caches.recent_key_timestamps.get_mut(&key) {
            Some(timestamps) => {
                timestamps.retain(|timestamp| *timestamp >= window_start);
                timestamps.len() as i64
            }
            None => 0,
        };
        MemorySnapshot {
            total_memories: total,
            entity_reference_count: refs,
            similar_recent_count: similar_recent,
            generated_at: Utc::now(),
        }
    }

    fn register_memory(&self, memory: &MemoryRecord, record_event_timestamp: bool) {
        let mut caches = lock_recover(&self.caches);
        let account = memory.account_key.clone();
        *caches.total_memories.entry(account.clone()).or_insert(0) += 1;
        let unique: BTreeSet<&String> = memory.entities.iter().collect();
        for entity in unique {
            *caches
                .entity_refs
                .entry((account.clone(), entity.clone()))
                .or_insert(0) += 1;
            caches
                .entity_memory_ids
                .entry((account.clone(), entity.clone()))
                .or_default()
                .insert(memory.memory_id.clone());
        }
        if record_event_timestamp {
            let primary = memory.primary_entity().unwrap_or("").to_string();
            caches
                .recent_key_timestamps
                .entry((account, primary, memory.intent.clone()))
                .or_default()
                .push(memory.created_at);
        }
    }

    fn unregister_memory(&self, memory: &MemoryRecord) {
        let mut caches = lock_recover(&self.caches);
        let account = memory.account_key.clone();
        if let Some(total) = caches.total_memories.get_mut(&account) {
            *total = (*total - 1).max(0);
        }
        let unique: BTreeSet<&String> = memory.entities.iter().collect();
        for entity in unique {
            let key = (account.clone(), entity.clone());
            if let Some(refs) = caches.entity_refs.get_mut(&key) {
                *refs = (*refs - 1).max(0);
            }
            if let Some(ids) = caches.entity_memory_ids.get_mut(&key) {
                ids.remove(&memory.memory_id);
                if ids.is_empty() {
                    caches.entity_memory_ids.remove(&key);
                }
            }
        }
    }

    fn warm_caches_from_storage(&self) -> Result<()> {
        for record in self.storage.list_memories(None, None)? {
            self.vector_store
                .add(&record.memory_id, &record.semantic_embedding);
            self.register_memory(&record, !record.is_compressed);
        }
        Ok(())
    }

    fn schedule_metrics_flush(&self) {
        let should_flush = {
            let mut metrics = lock_recover(&self.metrics);
            metrics.ops_since_flush += 1;
            if metrics.ops_since_flush >= self.config.metrics_flush_interval {
                metrics.ops_since_flush = 0;
                true
            } else {
                false
            }
        };
        if should_flush {
            self.write_metrics();
        }
    }

    fn write_metrics(&self) {
        let (payload, path) = {
            let metrics = lock_recover(&self.metrics);
            let storage_ratio = if metrics.events_received > 0.0 {
                metrics.events_stored / metrics.events_received
            } else {
                0.0
            };
            (
                json!({
                    "generated_at": Utc::now().to_rfc3339(),
                    "metrics": {
                        "events_received": metrics.events_received,
                        "events_stored": metrics.events_stored,
                        "events_discarded": metrics.events_discarded,
                        "compression_events": metrics.compression_events,
                        "feedback_events": metrics.feedback_events,
                        "inferred_memories_created": metrics.inferred_memories_created,
                    },
                    "storage_ratio": storage_ratio,
                }),
                self.config.metrics_path.clone(),
            )
        };
        if path.is_empty() {
            return;
        }
        if let Err(error) = std::fs::write(&path, payload.to_string()) {
            warn!(%error, path, "metrics flush failed");
        }
    }
}

// ============================================================================
// EVENT CONVERSION
// ============================================================================

fn to_raw_event(event: &Event) -> RawEvent {
    let summary = event
        .metadata
        .get("summary")
        .and_then(|value| value.as_str())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default_summary(&event.description, &event.event_type));

    let mut entities = vec![json!(event.entity_id)];
    if let Some(serde_json::Value::Array(extra)) = event.metadata.get("entities") {
        entities.extend(extra.iter().cloned());
    }
    let relationships = event
        .metadata
        .get("relationships")
        .cloned()
        .unwrap_or_else(|| json!([]));

    let mut context = event.metadata.clone();
    context.insert("summary".into(), json!(summary));
    context.insert(
        "intent".into(),
        event
            .metadata
            .get("intent")
            .cloned()
            .unwrap_or_else(|| json!(event.event_type)),
    );
    context.insert("entities".into(), serde_json::Value::Array(entities));
    context.insert("relationships".into(), relationships);
    context.insert("event_type".into(), json!(event.event_type));

    RawEvent::new(event.timestamp, event.description.trim(), context)
}

fn to_encoded_event(processed: &ProcessedEvent) -> EncodedEvent {
    let relationships: Vec<String> = processed
        .context
        .get("relationships")
        .and_then(|value| value.as_array())
        .map(|items| {
            items
                .iter()
                .map(|item| match item {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect()
        })
        .unwrap_or_default();
    let mut context = processed.context.clone();
    context.insert("summary".into(), json!(processed.semantic_summary));
    context.insert("intent".into(), json!(processed.intent));
    context.insert("entities".into(), json!(processed.entity_references));
    context.insert("event_type".into(), json!(processed.event_type));
    EncodedEvent {
        event: RawEvent {
            event_id: processed.event_id.clone(),
            timestamp: processed.timestamp,
            content: processed.description.clone(),
            context,
        },
        raw_embedding: processed.embedding.clone(),
        semantic_embedding: processed.semantic_embedding.clone(),
        understanding: SemanticUnderstanding {
            summary: processed.semantic_summary.clone(),
            entities: processed.entity_references.clone(),
            relationships,
            intent: processed.intent.clone(),
        },
        semantic_key: processed.semantic_key.clone(),
    }
}

/// First sentence of the description, at most 32 words and 220 chars.
/// Assistant responses drop a leading `assistant response:` label.
fn default_summary(description: &str, event_type: &str) -> String {
    let mut normalized = description.split_whitespace().collect::<Vec<_>>().join(" ");
    if event_type.trim().eq_ignore_ascii_case("assistant_response") {
        const LABEL: &str = "assistant response:";
        if normalized.len() >= LABEL.len()
            && normalized[..LABEL.len()].eq_ignore_ascii_case(LABEL)
        {
            normalized = normalized[LABEL.len()..].trim_start().to_string();
        }
    }
    if normalized.is_empty() {
        return String::new();
    }
    let first_sentence = first_sentence(&normalized);
    let mut candidate = first_sentence.trim().to_string();
    let words: Vec<&str> = candidate.split_whitespace().collect();
    if words.len() > 32 {
        candidate = format!(
            "{}...",
            words[..32].join(" ").trim_end_matches(['.', ',', ';', ':'])
        );
    }
    if candidate.chars().count() > 220 {
        let clipped: String = candidate.chars().take(217).collect();
        candidate = format!("{}...", clipped.trim_end());
    }
    candidate
}

/// Text up to the first sentence-ending punctuation followed by whitespace
/// (so decimals like `3.14` do not split)
fn first_sentence(text: &str) -> &str {
    let bytes = text.as_bytes();
    for (index, byte) in bytes.iter().enumerate() {
        if matches!(byte, b'.' | b'!' | b'?')
            && bytes
                .get(index + 1)
                .is_none_or(|next| next.is_ascii_whitespace())
        {
            return &text[..=index];
        }
    }
    text
}

fn apply_filters(records: Vec<MemoryRecord>, request: &RetrieveRequest) -> Vec<MemoryRecord> {
    records
        .into_iter()
        .filter(|record| {
            if let Some(entity_id) = &request.entity_id {
                if !record.entities.iter().any(|entity| entity == entity_id) {
                    return false;
                }
            }
            if let Some(event_type) = &request.event_type {
                if &record.intent != event_type {
                    return false;
                }
            }
            if let Some(start) = request.start_time {
                if record.created_at < start {
                    return false;
                }
            }
            if let Some(end) = request.end_time {
                if record.created_at > end {
                    return false;
                }
            }
            true
        })
        .collect()
}

fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// TESTS
// ============================================================================
