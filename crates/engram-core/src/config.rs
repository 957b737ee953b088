//! Engine Configuration
//!
//! Every tunable the engine reads lives in [`EngineConfig`]. Values come
//! from explicit construction or from `ENGRAM_*` environment variables via
//! [`EngineConfig::from_env`]; out-of-range values fail at load time rather
//! than surfacing as runtime misbehavior.

use crate::error::EngineError;

/// Runtime configuration for the memory decision engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Embedding dimension D shared by every vector in a deployment
    pub embedding_dim: usize,
    /// SQLite database path (`:memory:` for ephemeral engines)
    pub sqlite_path: String,
    /// Content limit for non-assistant intents
    pub max_content_chars: usize,
    /// Content limit for `assistant_*` intents
    pub assistant_max_content_chars: usize,
    /// Persist the raw-text embedding alongside the semantic one
    pub store_raw_embedding: bool,
    /// Ceiling on assistant-intent items in a retrieval result, as a share of k
    pub assistant_response_max_share: f64,

    /// Master switch for the adaptive personalization engine
    pub enable_adaptive_personalization: bool,
    /// Cluster size required before a pattern is inferred
    pub personalization_repeat_threshold: usize,
    /// Cosine similarity floor for topic clustering
    pub personalization_similarity_threshold: f64,
    /// Lookback window for pattern detection
    pub personalization_window_days: i64,
    /// Feedback events required before a preference can be inferred
    pub personalization_min_feedback_events: usize,
    /// Score margin between styles required to emit a preference
    pub personalization_preference_margin: f64,
    /// Age at which inferred memories are pruned
    pub personalization_inferred_ttl_days: i64,
    /// Window during which a signature refuses to re-emit
    pub personalization_inferred_refresh_days: i64,
    /// Minimum seconds between lazy lifecycle (TTL) sweeps
    pub personalization_lifecycle_check_interval_seconds: i64,

    // Cold-start priors used before enough feedback is available.
    /// Confidence at or above which a memory lands in the persistent tier
    pub persistent_confidence_prior: f64,
    /// Confidence at or above which a memory lands in the ephemeral tier
    pub ephemeral_confidence_prior: f64,

    /// Adam learning rate for the importance model
    pub importance_learning_rate: f32,
    /// Adam learning rate for the retrieval ranker
    pub ranker_learning_rate: f32,
    /// Gradient step size for the decay learner
    pub decay_learning_rate: f64,

    /// Labeled samples required before the ranker leaves heuristic mode
    pub ranker_min_training_samples: usize,
    /// Buffered samples that trigger one ranker training pass
    pub ranker_training_batch_size: usize,

    /// Cluster size that triggers compression
    pub compression_min_count: usize,
    /// Rolling window for cluster detection
    pub compression_window_days: i64,
    /// Maximum original summaries quoted in a replacement record
    pub compression_max_items_in_summary: usize,

    /// Path for the JSON metrics snapshot
    pub metrics_path: String,
    /// Operations between metrics flushes
    pub metrics_flush_interval: u64,

    /// Retries for retryable row-lock failures on write
    pub write_retry_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 384,
            sqlite_path: "engram.db".to_string(),
            max_content_chars: 4000,
            assistant_max_content_chars: 900,
            store_raw_embedding: false,
            assistant_response_max_share: 0.25,
            enable_adaptive_personalization: true,
            personalization_repeat_threshold: 3,
            personalization_similarity_threshold: 0.82,
            personalization_window_days: 30,
            personalization_min_feedback_events: 4,
            personalization_preference_margin: 2.0,
            personalization_inferred_ttl_days: 45,
            personalization_inferred_refresh_days: 14,
            personalization_lifecycle_check_interval_seconds: 30,
            persistent_confidence_prior: 0.60,
            ephemeral_confidence_prior: 0.30,
            importance_learning_rate: 1e-3,
            ranker_learning_rate: 1e-3,
            decay_learning_rate: 1e-2,
            ranker_min_training_samples: 100,
            ranker_training_batch_size: 64,
            compression_min_count: 5,
            compression_window_days: 7,
            compression_max_items_in_summary: 20,
            metrics_path: "metrics.json".to_string(),
            metrics_flush_interval: 50,
            write_retry_attempts: 5,
        }
    }
}

impl EngineConfig {
    /// Build configuration from `ENGRAM_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self, EngineError> {
        let defaults = Self::default();
        let config = Self {
            embedding_dim: env_usize("ENGRAM_EMBEDDING_DIM", defaults.embedding_dim),
            sqlite_path: env_string("ENGRAM_SQLITE_PATH", &defaults.sqlite_path),
            max_content_chars: env_usize("ENGRAM_MAX_CONTENT_CHARS", defaults.max_content_chars),
            assistant_max_content_chars: env_usize(
                "ENGRAM_ASSISTANT_MAX_CONTENT_CHARS",
                defaults.assistant_max_content_chars,
            ),
            store_raw_embedding: env_bool("ENGRAM_STORE_RAW_EMBEDDING", false),
            assistant_response_max_share: env_f64(
                "ENGRAM_ASSISTANT_RESPONSE_MAX_SHARE",
                defaults.assistant_response_max_share,
            ),
            enable_adaptive_personalization: env_bool(
                "ENGRAM_ENABLE_ADAPTIVE_PERSONALIZATION",
                true,
            ),
            personalization_repeat_threshold: env_usize(
                "ENGRAM_PERSONALIZATION_REPEAT_THRESHOLD",
                defaults.personalization_repeat_threshold,
            ),
            personalization_similarity_threshold: env_f64(
                "ENGRAM_PERSONALIZATION_SIMILARITY_THRESHOLD",
                defaults.personalization_similarity_threshold,
            ),
            personalization_window_days: env_i64(
                "ENGRAM_PERSONALIZATION_WINDOW_DAYS",
                defaults.personalization_window_days,
            ),
            personalization_min_feedback_events: env_usize(
                "ENGRAM_PERSONALIZATION_MIN_FEEDBACK_EVENTS",
                defaults.personalization_min_feedback_events,
            ),
            personalization_preference_margin: env_f64(
                "ENGRAM_PERSONALIZATION_PREFERENCE_MARGIN",
                defaults.personalization_preference_margin,
            ),
            personalization_inferred_ttl_days: env_i64(
                "ENGRAM_PERSONALIZATION_INFERRED_TTL_DAYS",
                defaults.personalization_inferred_ttl_days,
            ),
            personalization_inferred_refresh_days: env_i64(
                "ENGRAM_PERSONALIZATION_INFERRED_REFRESH_DAYS",
                defaults.personalization_inferred_refresh_days,
            ),
            personalization_lifecycle_check_interval_seconds: env_i64(
                "ENGRAM_PERSONALIZATION_LIFECYCLE_CHECK_INTERVAL_SECONDS",
                defaults.personalization_lifecycle_check_interval_seconds,
            ),
            persistent_confidence_prior: env_f64(
                "ENGRAM_PERSISTENT_CONFIDENCE_PRIOR",
                defaults.persistent_confidence_prior,
            ),
            ephemeral_confidence_prior: env_f64(
                "ENGRAM_EPHEMERAL_CONFIDENCE_PRIOR",
                defaults.ephemeral_confidence_prior,
            ),
            importance_learning_rate: env_f32(
                "ENGRAM_IMPORTANCE_LEARNING_RATE",
                defaults.importance_learning_rate,
            ),
            ranker_learning_rate: env_f32(
                "ENGRAM_RANKER_LEARNING_RATE",
                defaults.ranker_learning_rate,
            ),
            decay_learning_rate: env_f64(
                "ENGRAM_DECAY_LEARNING_RATE",
                defaults.decay_learning_rate,
            ),
            ranker_min_training_samples: env_usize(
                "ENGRAM_RANKER_MIN_TRAINING_SAMPLES",
                defaults.ranker_min_training_samples,
            ),
            ranker_training_batch_size: env_usize(
                "ENGRAM_RANKER_TRAINING_BATCH_SIZE",
                defaults.ranker_training_batch_size,
            ),
            compression_min_count: env_usize(
                "ENGRAM_COMPRESSION_MIN_COUNT",
                defaults.compression_min_count,
            ),
            compression_window_days: env_i64(
                "ENGRAM_COMPRESSION_WINDOW_DAYS",
                defaults.compression_window_days,
            ),
            compression_max_items_in_summary: env_usize(
                "ENGRAM_COMPRESSION_MAX_ITEMS_IN_SUMMARY",
                defaults.compression_max_items_in_summary,
            ),
            metrics_path: env_string("ENGRAM_METRICS_PATH", &defaults.metrics_path),
            metrics_flush_interval: env_u64(
                "ENGRAM_METRICS_FLUSH_INTERVAL",
                defaults.metrics_flush_interval,
            ),
            write_retry_attempts: env_u32(
                "ENGRAM_WRITE_RETRY_ATTEMPTS",
                defaults.write_retry_attempts,
            ),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject out-of-range tunables. Called by `from_env`; explicit
    /// constructions should call it before handing the config to the engine.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.embedding_dim == 0 {
            return Err(EngineError::Config(
                "embedding_dim must be positive".into(),
            ));
        }
        if self.max_content_chars == 0 || self.assistant_max_content_chars == 0 {
            return Err(EngineError::Config(
                "content limits must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.persistent_confidence_prior)
            || !(0.0..=1.0).contains(&self.ephemeral_confidence_prior)
        {
            return Err(EngineError::Config(
                "confidence priors must be in [0.0, 1.0]".into(),
            ));
        }
        if !(self.assistant_response_max_share > 0.0 && self.assistant_response_max_share <= 1.0) {
            return Err(EngineError::Config(
                "assistant_response_max_share must be in (0.0, 1.0]".into(),
            ));
        }
        if self.personalization_repeat_threshold < 2 {
            return Err(EngineError::Config(
                "personalization_repeat_threshold must be >= 2".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.personalization_similarity_threshold) {
            return Err(EngineError::Config(
                "personalization_similarity_threshold must be in [0.0, 1.0]".into(),
            ));
        }
        if self.personalization_window_days <= 0
            || self.personalization_min_feedback_events == 0
            || self.personalization_inferred_ttl_days <= 0
        {
            return Err(EngineError::Config(
                "personalization tunables must be positive".into(),
            ));
        }
        if self.personalization_inferred_refresh_days < 0 {
            return Err(EngineError::Config(
                "personalization_inferred_refresh_days must be >= 0".into(),
            ));
        }
        if self.personalization_lifecycle_check_interval_seconds < 0 {
            return Err(EngineError::Config(
                "personalization_lifecycle_check_interval_seconds must be >= 0".into(),
            ));
        }
        if self.personalization_preference_margin <= 0.0 {
            return Err(EngineError::Config(
                "personalization_preference_margin must be > 0".into(),
            ));
        }
        if self.compression_min_count < 2 {
            return Err(EngineError::Config(
                "compression_min_count must be >= 2".into(),
            ));
        }
        if self.compression_window_days <= 0 || self.compression_max_items_in_summary == 0 {
            return Err(EngineError::Config(
                "compression tunables must be positive".into(),
            ));
        }
        if self.write_retry_attempts == 0 {
            return Err(EngineError::Config(
                "write_retry_attempts must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// ENV HELPERS
// ============================================================================

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

fn env_i64(name: &str, default: i64) -> i64 {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

fn env_f32(name: &str, default: f32) -> f32 {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_zero_embedding_dim_rejected() {
        let config = EngineConfig {
            embedding_dim: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_assistant_share_bounds() {
        let config = EngineConfig {
            assistant_response_max_share: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            assistant_response_max_share: 1.0,
            ..Default::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn test_repeat_threshold_floor() {
        let config = EngineConfig {
            personalization_repeat_threshold: 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
