//! Core Data Model
//!
//! The record types that flow through the pipeline: external events,
//! encoded events, persisted memories, storage decisions, and feedback.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Free-form context/metadata mapping attached to events
pub type ContextMap = HashMap<String, serde_json::Value>;

// ============================================================================
// STORAGE TIER
// ============================================================================

/// Retention tier assigned by the storage decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageTier {
    /// Long-lived memory, ranked with full priors
    Persistent,
    /// Short-lived memory, kept but expected to decay quickly
    #[default]
    Ephemeral,
    /// Not stored at all
    Discard,
}

impl StorageTier {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageTier::Persistent => "persistent",
            StorageTier::Ephemeral => "ephemeral",
            StorageTier::Discard => "discard",
        }
    }

    /// Parse from string name; unknown values discard
    pub fn parse_name(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "persistent" => StorageTier::Persistent,
            "ephemeral" => StorageTier::Ephemeral,
            _ => StorageTier::Discard,
        }
    }
}

impl std::fmt::Display for StorageTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// External event shape accepted by the stage-based API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Event timestamp, defaults to now at construction
    pub timestamp: DateTime<Utc>,
    /// Primary entity the event is about
    pub entity_id: String,
    /// Event class, doubles as the default intent
    pub event_type: String,
    /// Raw event text
    pub description: String,
    /// Recognized keys: `summary`, `intent`, `entities`, `relationships`
    #[serde(default)]
    pub metadata: ContextMap,
}

impl Event {
    /// Create an event stamped with the current time
    pub fn new(
        entity_id: impl Into<String>,
        event_type: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            entity_id: entity_id.into(),
            event_type: event_type.into(),
            description: description.into(),
            metadata: ContextMap::new(),
        }
    }

    /// Attach a metadata key
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Normalized input record fed to the semantic encoder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    /// Unique event id (UUID v4)
    pub event_id: String,
    /// UTC timestamp
    pub timestamp: DateTime<Utc>,
    /// Non-empty text content
    pub content: String,
    /// Free-form context mapping
    #[serde(default)]
    pub context: ContextMap,
}

impl RawEvent {
    /// Create a raw event with a fresh id
    pub fn new(timestamp: DateTime<Utc>, content: impl Into<String>, context: ContextMap) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            timestamp,
            content: content.into(),
            context,
        }
    }
}

// ============================================================================
// SEMANTIC UNDERSTANDING
// ============================================================================

/// Structured understanding extracted from a raw event
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SemanticUnderstanding {
    pub summary: String,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub relationships: Vec<String>,
    pub intent: String,
}

/// Event plus embeddings, understanding, and the derived semantic key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodedEvent {
    pub event: RawEvent,
    /// Unit-norm embedding of the raw content
    pub raw_embedding: Vec<f32>,
    /// Unit-norm embedding of the semantic template text
    pub semantic_embedding: Vec<f32>,
    pub understanding: SemanticUnderstanding,
    /// Hex digest identifying the topic cluster
    pub semantic_key: String,
}

/// Stage 1 output: validated and semantically encoded event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub entity_id: String,
    pub event_type: String,
    pub description: String,
    /// Deduplicated entity references, primary entity first
    pub entity_references: Vec<String>,
    pub embedding: Vec<f32>,
    pub semantic_embedding: Vec<f32>,
    pub intent: String,
    pub semantic_key: String,
    pub semantic_summary: String,
    #[serde(default)]
    pub context: ContextMap,
}

// ============================================================================
// DECISIONS
// ============================================================================

/// Current memory state for decision-time feature context
#[derive(Debug, Clone)]
pub struct MemorySnapshot {
    pub total_memories: i64,
    pub entity_reference_count: i64,
    pub similar_recent_count: i64,
    pub generated_at: DateTime<Utc>,
}

/// Stage 2 output: learned storage decision and metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageDecision {
    pub store: bool,
    pub storage_tier: StorageTier,
    pub confidence: f64,
    pub decay_rate: f64,
    /// `ln 2 / rate`; infinite when the rate is zero
    pub decay_half_life: f64,
    #[serde(default)]
    pub should_compress: bool,
    pub rationale: String,
    #[serde(default)]
    pub trace: HashMap<String, f64>,
    /// Set by the compression path when this decision writes a replacement
    #[serde(default)]
    pub is_compressed: bool,
    #[serde(default = "default_original_count")]
    pub original_count: i64,
}

fn default_original_count() -> i64 {
    1
}

// ============================================================================
// MEMORY RECORD
// ============================================================================

/// A persisted memory with its learning aggregates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub memory_id: String,
    /// Tenant scope; empty input normalizes to `"default"`
    pub account_key: String,
    pub event_id: String,
    /// Truncated/compacted text (see StorageManager)
    pub content: String,
    pub summary: String,
    pub intent: String,
    pub entities: Vec<String>,
    pub relationships: Vec<String>,
    /// Unit vector; reuses the semantic embedding when raw was not stored
    pub raw_embedding: Vec<f32>,
    pub semantic_embedding: Vec<f32>,
    pub semantic_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub retrieval_count: i64,
    /// Running mean of signed feedback signals, in [-1, 1]
    pub avg_outcome_signal: f64,
    pub outcome_count: i64,
    pub storage_tier: StorageTier,
    /// Last model confidence at storage or compression time
    pub latest_importance: f64,
    pub is_compressed: bool,
    pub original_count: i64,
    /// Computed on read from the decay learner; not persisted
    #[serde(default)]
    pub decay_half_life_days: Option<f64>,
}

impl MemoryRecord {
    /// First non-blank entity, if any
    pub fn primary_entity(&self) -> Option<&str> {
        self.entities
            .iter()
            .map(|entity| entity.trim())
            .find(|entity| !entity.is_empty())
    }

    /// Whether the intent belongs to the assistant family
    pub fn is_assistant_intent(&self) -> bool {
        intent_is_assistant(&self.intent)
    }

    /// Age relative to `now`, clamped at zero
    pub fn age_days(&self, now: DateTime<Utc>) -> f64 {
        ((now - self.created_at).num_milliseconds() as f64 / 86_400_000.0).max(0.0)
    }
}

/// Whether an intent string belongs to the assistant family
pub fn intent_is_assistant(intent: &str) -> bool {
    intent.trim().to_lowercase().starts_with("assistant_")
}

/// A ranked retrieval hit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedMemory {
    pub memory: MemoryRecord,
    pub rank_score: f64,
}

// ============================================================================
// FEEDBACK
// ============================================================================

/// Outcome feedback on a set of previously ranked memories
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeFeedback {
    pub query: String,
    pub ranked_memory_ids: Vec<String>,
    pub helpful_memory_ids: Vec<String>,
    /// Signed signal strength in [-1, 1]
    pub outcome_signal: f64,
}

impl OutcomeFeedback {
    /// Feedback on a single memory, the common API path
    pub fn single(memory_id: &str, helpful: bool, outcome_signal: f64) -> Self {
        Self {
            query: format!("memory:{memory_id}"),
            ranked_memory_ids: vec![memory_id.to_string()],
            helpful_memory_ids: if helpful {
                vec![memory_id.to_string()]
            } else {
                Vec::new()
            },
            outcome_signal,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
