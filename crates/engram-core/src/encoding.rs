//! Stage 1: Semantic Encoding
//!
//! Providers turn event text into dense unit-norm vectors and structured
//! understanding; the [`SemanticEncoder`] combines both into an
//! [`EncodedEvent`] with a deterministic semantic key.
//!
//! The deterministic hash provider is always available and is the default
//! for offline and test use. A local ONNX model (fastembed) can be swapped
//! in behind the `embeddings` feature.

use sha2::{Digest, Sha256};

use crate::error::EncodingError;
use crate::model::{ContextMap, EncodedEvent, RawEvent, SemanticUnderstanding};

/// Maximum content characters fed into the semantic template
const MAX_SEMANTIC_CONTENT_CHARS: usize = 800;

/// Maximum summary characters in the template and the key source
const MAX_SEMANTIC_SUMMARY_CHARS: usize = 280;

// ============================================================================
// VECTOR MATH
// ============================================================================

/// Scale a vector to unit length; zero vectors pass through unchanged
pub fn to_unit_vector(mut values: Vec<f32>) -> Vec<f32> {
    let norm = values.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut values {
            *x /= norm;
        }
    }
    values
}

/// Cosine similarity between two vectors of the same dimension
pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    if left.len() != right.len() || left.is_empty() {
        return 0.0;
    }
    let dot: f32 = left.iter().zip(right.iter()).map(|(a, b)| a * b).sum();
    let left_norm = left.iter().map(|x| x * x).sum::<f32>().sqrt();
    let right_norm = right.iter().map(|x| x * x).sum::<f32>().sqrt();
    if left_norm == 0.0 || right_norm == 0.0 {
        return 0.0;
    }
    dot / (left_norm * right_norm)
}

// ============================================================================
// PROVIDER TRAITS
// ============================================================================

/// Capability: produce a dense embedding for input text
pub trait EmbeddingProvider: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EncodingError>;
}

/// Capability: produce structured understanding for a raw event
pub trait SemanticProvider: Send + Sync {
    fn understand(&self, event: &RawEvent) -> SemanticUnderstanding;
}

// ============================================================================
// DETERMINISTIC PROVIDER
// ============================================================================

/// Local deterministic embedding provider for tests and offline development.
///
/// Not a semantic model. It only guarantees stable unit vectors: the same
/// text maps to the same vector on every process and platform.
#[derive(Debug, Clone)]
pub struct DeterministicEmbeddingProvider {
    embedding_dim: usize,
}

impl DeterministicEmbeddingProvider {
    pub fn new(embedding_dim: usize) -> Self {
        Self { embedding_dim }
    }
}

impl EmbeddingProvider for DeterministicEmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EncodingError> {
        let seed = Sha256::digest(text.as_bytes());
        let mut values = Vec::with_capacity(self.embedding_dim);
        let mut counter: u64 = 0;
        while values.len() < self.embedding_dim {
            let mut hasher = Sha256::new();
            hasher.update(seed);
            hasher.update(counter.to_le_bytes());
            let block = hasher.finalize();
            for chunk in block.chunks_exact(4) {
                if values.len() >= self.embedding_dim {
                    break;
                }
                let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                // Map to [-1, 1]
                values.push((word as f64 / u32::MAX as f64 * 2.0 - 1.0) as f32);
            }
            counter += 1;
        }
        Ok(to_unit_vector(values))
    }
}

// ============================================================================
// CONTEXT SEMANTIC PROVIDER
// ============================================================================

/// Semantic provider that reads structured context off the event itself.
///
/// This is the production default: upstream callers (or fixtures) supply
/// `summary`/`intent`/`entities`/`relationships` in the event context.
#[derive(Debug, Clone, Default)]
pub struct ContextSemanticProvider;

impl SemanticProvider for ContextSemanticProvider {
    fn understand(&self, event: &RawEvent) -> SemanticUnderstanding {
        SemanticUnderstanding {
            summary: context_string(&event.context, "summary")
                .unwrap_or_else(|| event.content.clone()),
            entities: context_string_list(&event.context, "entities"),
            relationships: context_string_list(&event.context, "relationships"),
            intent: context_string(&event.context, "intent").unwrap_or_else(|| "unknown".into()),
        }
    }
}

fn context_string(context: &ContextMap, key: &str) -> Option<String> {
    context.get(key).map(|value| match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

fn context_string_list(context: &ContextMap, key: &str) -> Vec<String> {
    match context.get(key) {
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        _ => Vec::new(),
    }
}

// ============================================================================
// FASTEMBED PROVIDER (optional)
// ============================================================================

/// Embedding provider backed by a local fastembed ONNX model
#[cfg(feature = "embeddings")]
pub struct FastembedEmbeddingProvider {
    model: std::sync::Mutex<fastembed::TextEmbedding>,
    embedding_dim: usize,
}

#[cfg(feature = "embeddings")]
impl FastembedEmbeddingProvider {
    /// Load the default model; downloads on first use
    pub fn new(embedding_dim: usize) -> Result<Self, EncodingError> {
        let options = fastembed::InitOptions::new(fastembed::EmbeddingModel::AllMiniLML6V2);
        let model = fastembed::TextEmbedding::try_new(options)
            .map_err(|e| EncodingError::Provider(e.to_string()))?;
        Ok(Self {
            model: std::sync::Mutex::new(model),
            embedding_dim,
        })
    }
}

#[cfg(feature = "embeddings")]
impl EmbeddingProvider for FastembedEmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EncodingError> {
        let mut model = self
            .model
            .lock()
            .map_err(|_| EncodingError::Provider("embedding model lock poisoned".into()))?;
        let mut batches = model
            .embed(vec![text.to_string()], None)
            .map_err(|e| EncodingError::Provider(e.to_string()))?;
        let mut vector = batches
            .pop()
            .ok_or_else(|| EncodingError::Provider("empty embedding batch".into()))?;
        vector.truncate(self.embedding_dim);
        Ok(to_unit_vector(vector))
    }
}

// ============================================================================
// PROVIDER SELECTION
// ============================================================================

/// Resolve an embedding provider by name. `None` and `"deterministic"`
/// select the hash provider; `"fastembed"` selects the local ONNX model
/// when the `embeddings` feature is compiled in.
pub fn embedding_provider_from_name(
    name: Option<&str>,
    embedding_dim: usize,
) -> Result<Box<dyn EmbeddingProvider>, EncodingError> {
    match name.map(|value| value.trim().to_lowercase()).as_deref() {
        None | Some("") | Some("deterministic") => {
            Ok(Box::new(DeterministicEmbeddingProvider::new(embedding_dim)))
        }
        #[cfg(feature = "embeddings")]
        Some("fastembed") => Ok(Box::new(FastembedEmbeddingProvider::new(embedding_dim)?)),
        Some(other) => Err(EncodingError::Provider(format!(
            "unknown embedding provider: {other}"
        ))),
    }
}

// ============================================================================
// SEMANTIC ENCODER
// ============================================================================

/// Combine embeddings and semantic understanding into encoded events
pub struct SemanticEncoder {
    embedding_provider: Box<dyn EmbeddingProvider>,
    semantic_provider: Box<dyn SemanticProvider>,
    embedding_dim: usize,
}

impl SemanticEncoder {
    pub fn new(
        embedding_provider: Box<dyn EmbeddingProvider>,
        semantic_provider: Box<dyn SemanticProvider>,
        embedding_dim: usize,
    ) -> Self {
        Self {
            embedding_provider,
            semantic_provider,
            embedding_dim,
        }
    }

    /// Encoder with the deterministic hash provider and context understanding
    pub fn deterministic(embedding_dim: usize) -> Self {
        Self::new(
            Box::new(DeterministicEmbeddingProvider::new(embedding_dim)),
            Box::new(ContextSemanticProvider),
            embedding_dim,
        )
    }

    /// Encode a raw event into embeddings, understanding, and a semantic key
    pub fn encode_event(&self, event: &RawEvent) -> Result<EncodedEvent, EncodingError> {
        if event.content.trim().is_empty() {
            return Err(EncodingError::EmptyContent);
        }
        let understanding = self.semantic_provider.understand(event);
        let raw_embedding = self.checked_embed(&event.content)?;
        let semantic_text = Self::build_semantic_text(event, &understanding);
        let semantic_embedding = self.checked_embed(&semantic_text)?;
        let semantic_key = Self::semantic_key(&understanding);
        Ok(EncodedEvent {
            event: event.clone(),
            raw_embedding,
            semantic_embedding,
            understanding,
            semantic_key,
        })
    }

    /// Encode a retrieval query into a unit vector
    pub fn encode_query(&self, query: &str) -> Result<Vec<f32>, EncodingError> {
        if query.trim().is_empty() {
            return Err(EncodingError::EmptyContent);
        }
        self.checked_embed(query)
    }

    fn checked_embed(&self, text: &str) -> Result<Vec<f32>, EncodingError> {
        let vector = self.embedding_provider.embed(text)?;
        if vector.len() != self.embedding_dim {
            return Err(EncodingError::DimensionMismatch {
                expected: self.embedding_dim,
                got: vector.len(),
            });
        }
        if vector.iter().any(|value| !value.is_finite()) {
            return Err(EncodingError::NonFiniteEmbedding);
        }
        Ok(vector)
    }

    fn build_semantic_text(event: &RawEvent, understanding: &SemanticUnderstanding) -> String {
        let summary = clip_text(&understanding.summary, MAX_SEMANTIC_SUMMARY_CHARS);
        let content = clip_text(&event.content, MAX_SEMANTIC_CONTENT_CHARS);
        format!(
            "{summary}\nintent:{}\nentities:{}\nrelationships:{}\ncontent:{content}",
            understanding.intent,
            understanding.entities.join(","),
            understanding.relationships.join(","),
        )
    }

    /// Hex digest over lowercased intent, clipped summary, and sorted
    /// lowercased entities. Stable across processes for identical inputs.
    pub fn semantic_key(understanding: &SemanticUnderstanding) -> String {
        let summary_key = clip_text(&understanding.summary, MAX_SEMANTIC_SUMMARY_CHARS);
        let mut entities: Vec<String> = understanding
            .entities
            .iter()
            .map(|entity| entity.to_lowercase())
            .collect();
        entities.sort();
        let key_source = format!(
            "{}|{}|{}",
            understanding.intent.to_lowercase(),
            summary_key.to_lowercase(),
            entities.join(","),
        );
        let digest = Sha256::digest(key_source.as_bytes());
        digest.iter().map(|byte| format!("{byte:02x}")).collect()
    }
}

/// Whitespace-normalize and clip to `max_chars`, ending clipped text with `...`
pub fn clip_text(value: &str, max_chars: usize) -> String {
    let normalized = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.chars().count() <= max_chars {
        return normalized;
    }
    if max_chars <= 3 {
        return normalized.chars().take(max_chars).collect();
    }
    let cut: String = normalized.chars().take(max_chars - 3).collect();
    format!("{}...", cut.trim_end())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event_with_context(content: &str, intent: &str, entities: &[&str]) -> RawEvent {
        let mut context = ContextMap::new();
        context.insert("intent".into(), serde_json::json!(intent));
        context.insert("entities".into(), serde_json::json!(entities));
        context.insert("summary".into(), serde_json::json!(content));
        RawEvent::new(Utc::now(), content, context)
    }

    #[test]
    fn test_deterministic_embedding_is_stable_and_unit_norm() {
        let provider = DeterministicEmbeddingProvider::new(64);
        let a = provider.embed("hello world").unwrap();
        let b = provider.embed("hello world").unwrap();
        assert_eq!(a, b);
        let norm = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-3);

        let c = provider.embed("different text").unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_semantic_key_ignores_entity_order_and_case() {
        let left = SemanticUnderstanding {
            summary: "loops in python".into(),
            entities: vec!["Alice".into(), "python".into()],
            relationships: vec![],
            intent: "user_question".into(),
        };
        let right = SemanticUnderstanding {
            summary: "loops  in   python".into(),
            entities: vec!["PYTHON".into(), "alice".into()],
            relationships: vec![],
            intent: "User_Question".into(),
        };
        assert_eq!(
            SemanticEncoder::semantic_key(&left),
            SemanticEncoder::semantic_key(&right)
        );
    }

    #[test]
    fn test_encode_event_rejects_empty_content() {
        let encoder = SemanticEncoder::deterministic(32);
        let event = RawEvent::new(Utc::now(), "   ", ContextMap::new());
        assert!(matches!(
            encoder.encode_event(&event),
            Err(EncodingError::EmptyContent)
        ));
    }

    #[test]
    fn test_encode_event_repeatable() {
        let encoder = SemanticEncoder::deterministic(32);
        let event = event_with_context("User asked about loops", "user_question", &["alice"]);
        let first = encoder.encode_event(&event).unwrap();
        let second = encoder.encode_event(&event).unwrap();
        assert_eq!(first.semantic_key, second.semantic_key);
        assert_eq!(first.semantic_embedding, second.semantic_embedding);
        assert_eq!(first.raw_embedding, second.raw_embedding);
    }

    #[test]
    fn test_dimension_mismatch_detected() {
        struct BadProvider;
        impl EmbeddingProvider for BadProvider {
            fn embed(&self, _text: &str) -> Result<Vec<f32>, EncodingError> {
                Ok(vec![1.0; 8])
            }
        }
        let encoder =
            SemanticEncoder::new(Box::new(BadProvider), Box::new(ContextSemanticProvider), 16);
        let event = event_with_context("content", "user_question", &[]);
        assert!(matches!(
            encoder.encode_event(&event),
            Err(EncodingError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_clip_text() {
        assert_eq!(clip_text("a  b\n c", 100), "a b c");
        let clipped = clip_text(&"word ".repeat(100), 20);
        assert!(clipped.chars().count() <= 20);
        assert!(clipped.ends_with("..."));
    }

    #[test]
    fn test_provider_selection() {
        assert!(embedding_provider_from_name(None, 16).is_ok());
        assert!(embedding_provider_from_name(Some("deterministic"), 16).is_ok());
        assert!(matches!(
            embedding_provider_from_name(Some("quantum"), 16),
            Err(EncodingError::Provider(_))
        ));
    }

    #[test]
    fn test_cosine_similarity_bounds() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
        assert_eq!(cosine_similarity(&a, &[1.0]), 0.0);
    }
}
