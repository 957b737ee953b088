//! End-to-end test harness
//!
//! Builds a disk-backed service in a tempdir, issues bearer tokens, and
//! pokes at the underlying database for journeys that need to move time
//! (TTL expiry, signature refresh windows).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Duration, Utc};
use engram_core::EngineConfig;
use engram_server::config::ApiConfig;
use engram_server::service::{ApiService, FeedbackRequest, IngestRequest};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;

/// A tempdir-backed service plus its configuration knobs
pub struct TestHarness {
    pub dir: tempfile::TempDir,
    pub service: Arc<ApiService>,
    engine_config: EngineConfig,
    api_config: ApiConfig,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with(|_| {}, |_| {})
    }

    pub fn with(
        tune_engine: impl FnOnce(&mut EngineConfig),
        tune_api: impl FnOnce(&mut ApiConfig),
    ) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut engine_config = EngineConfig {
            embedding_dim: 32,
            sqlite_path: dir.path().join("engram.db").to_string_lossy().into_owned(),
            metrics_path: dir
                .path()
                .join("metrics.json")
                .to_string_lossy()
                .into_owned(),
            ..Default::default()
        };
        tune_engine(&mut engine_config);
        let mut api_config = ApiConfig::default();
        tune_api(&mut api_config);
        let service = Arc::new(
            ApiService::new(api_config.clone(), engine_config.clone()).expect("service"),
        );
        Self {
            dir,
            service,
            engine_config,
            api_config,
        }
    }

    /// Recreate the service over the same database, as a process restart
    /// would: fresh in-memory registries, caches warmed from storage.
    pub fn restart(&mut self) {
        self.service = Arc::new(
            ApiService::new(self.api_config.clone(), self.engine_config.clone())
                .expect("service restart"),
        );
    }

    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.engine_config.sqlite_path)
    }

    /// Signed bearer token for the account
    pub fn token(&self, subject: &str) -> String {
        let now = Utc::now().timestamp();
        let claims = json!({
            "sub": subject,
            "iss": self.api_config.jwt_issuer,
            "aud": self.api_config.jwt_audience,
            "iat": now,
            "exp": now + 3600,
            "scopes": ["memories:read", "memories:write"],
        });
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.api_config.jwt_secret.as_bytes()),
        )
        .expect("jwt encode")
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Ingest payload with intent metadata and a single entity
pub fn event(content: &str, intent: &str, entity: &str) -> IngestRequest {
    let mut metadata = engram_core::ContextMap::new();
    metadata.insert("intent".into(), json!(intent));
    metadata.insert("entities".into(), json!([entity]));
    IngestRequest {
        content: content.to_string(),
        event_type: Some(intent.to_string()),
        metadata: Some(metadata),
        entity_id: Some(entity.to_string()),
    }
}

/// Positive single-memory feedback payload
pub fn helpful_feedback(memory_id: &str) -> FeedbackRequest {
    FeedbackRequest {
        memory_id: memory_id.to_string(),
        helpful: true,
        outcome_value: Some(1.0),
    }
}

/// Rewrite a memory's timestamps, moving it `days` into the past
pub fn backdate_memory(db_path: &Path, memory_id: &str, days: i64) {
    let conn = rusqlite::Connection::open(db_path).expect("open db");
    let past = (Utc::now() - Duration::days(days)).to_rfc3339();
    let changed = conn
        .execute(
            "UPDATE memories SET created_at = ?1, updated_at = ?1 WHERE memory_id = ?2",
            rusqlite::params![past, memory_id],
        )
        .expect("backdate");
    assert_eq!(changed, 1, "memory {memory_id} not found for backdating");
}
