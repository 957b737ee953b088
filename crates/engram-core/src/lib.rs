//! # Engram Core
//!
//! Adaptive memory engine for AI agents. Ingests conversational and event
//! records, decides what to persist at which tier, compresses repetitive
//! clusters, ranks retrieval candidates with a learned scorer, and feeds
//! outcome feedback back into the relevance, decay, and ranking models.
//!
//! Pipeline stages:
//!
//! - **Stage 1, input**: semantic encoding into raw + semantic embeddings,
//!   intent classification, content normalization ([`encoding`])
//! - **Stage 2, decision**: learned importance scoring, tier selection,
//!   repetitive-cluster compression ([`decision`], [`compression`])
//! - **Stage 3, retrieval**: vector preselection, learned ranker with a
//!   heuristic fallback, assistant-intent caps ([`search`], [`learning`])
//! - **Stage 4, learning**: outcome-driven updates to the importance model,
//!   decay learner, and ranker ([`learning`])
//!
//! On top of the pipeline sits the [`personalization`] engine, which watches
//! stored memories and feedback for recurring patterns and synthesizes
//! `inferred_*` memories with full provenance, and the [`quota`] ledger,
//! which enforces per-account budgets and idempotent writes.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use engram_core::{DecisionEngine, EngineConfig, Event};
//!
//! let engine = DecisionEngine::new(EngineConfig::default())?;
//!
//! let event = Event::new("alice", "user_question", "How do Python for-loops work?");
//! let (decision, stored) = engine.ingest(&event, "tenant-a")?;
//!
//! let results = engine.retrieve(
//!     &engram_core::RetrieveRequest::new("python loops", 5),
//!     "tenant-a",
//! )?;
//! ```

// ============================================================================
// MODULES
// ============================================================================

pub mod compression;
pub mod config;
pub mod decision;
pub mod encoding;
pub mod engine;
pub mod error;
pub mod learning;
pub mod model;
pub mod personalization;
pub mod quota;
pub mod search;
pub mod storage;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

pub use compression::{CompressionPlan, CompressionPlanner};
pub use config::EngineConfig;
pub use decision::{DecayPolicyAssigner, DecisionLogic, LearnedRelevanceScorer};
pub use encoding::{
    embedding_provider_from_name, ContextSemanticProvider, DeterministicEmbeddingProvider,
    EmbeddingProvider, SemanticEncoder, SemanticProvider,
};
pub use engine::{DecisionEngine, FeedbackResult, RetrieveOutcome, RetrieveRequest};
pub use error::{EncodingError, EngineError};
pub use learning::{DecayLearner, ImportanceModel, LearningLoop, RetrievalRanker};
pub use model::{
    intent_is_assistant, ContextMap, EncodedEvent, Event, MemoryRecord, MemorySnapshot,
    OutcomeFeedback, ProcessedEvent, RawEvent, RetrievedMemory, SemanticUnderstanding,
    StorageDecision, StorageTier,
};
pub use personalization::{AdaptivePersonalizationEngine, InferredMemoryCandidate};
pub use quota::{
    IdempotencyOutcome, QuotaError, QuotaKind, QuotaLedger, QuotaLimits, RateLimitSnapshot,
    StoredReplay, UsageSnapshot,
};
pub use search::{VectorHit, VectorStore};
pub use storage::{StorageError, StorageManager};
