//! API Service Layer
//!
//! Maps API contract payloads onto engine operations and wraps every
//! mutating call in the quota/idempotency envelope: payloads validate
//! before any side effect, the idempotency reservation and quota debit
//! commit together, and completed responses replay byte-identically.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Datelike, Utc};
use engram_core::{
    ContextMap, DecisionEngine, EngineConfig, Event, IdempotencyOutcome, MemoryRecord,
    OutcomeFeedback, QuotaKind, QuotaLedger, QuotaLimits, RateLimitSnapshot, RetrieveRequest,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::auth::{self, AuthContext};
use crate::config::ApiConfig;
use crate::error::ApiError;

/// Idempotency keys longer than this are rejected outright
const MAX_IDEMPOTENCY_KEY_CHARS: usize = 128;

// ============================================================================
// CONTRACT PAYLOADS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRequest {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ContextMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestResponse {
    pub memory_id: String,
    pub stored: bool,
    pub importance_score: f64,
    pub decision_reason: String,
    pub encoded_at: DateTime<Utc>,
    pub latency_ms: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestBatchRequest {
    pub events: Vec<IngestRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestBatchResponse {
    pub items: Vec<IngestResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryPayload {
    pub memory_id: String,
    pub content: String,
    pub rank_position: usize,
    pub rank_score: f64,
    pub importance_score: f64,
    pub timestamp: DateTime<Utc>,
    pub metadata: serde_json::Value,
    pub relevance_explanation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieveResponse {
    pub memories: Vec<MemoryPayload>,
    pub total_candidates: usize,
    pub query_execution_time_ms: f64,
    pub applied_filters: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRequest {
    pub memory_id: String,
    pub helpful: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome_value: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackResponse {
    pub recorded: bool,
    pub memory_id: String,
    pub learning_impact: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedbackBatchRequest {
    pub feedback: Vec<FeedbackRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackBatchResponse {
    pub items: Vec<FeedbackResponse>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountQuota {
    pub events_per_day: i64,
    pub queries_per_day: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events_per_month: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queries_per_month: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountUsage {
    pub events_ingested_this_month: i64,
    pub queries_this_month: i64,
    pub storage_usage_mb: f64,
    pub quota: AccountQuota,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub connected: bool,
    pub api_version: String,
    pub account_usage: AccountUsage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_ingestion: Option<DateTime<Utc>>,
    pub uptime_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: String,
    pub storage: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthValidationResponse {
    pub valid: bool,
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaginatedMemoriesResponse {
    pub data: Vec<MemoryPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    pub has_more: bool,
}

/// Retrieval query parameters
#[derive(Debug, Clone, Deserialize)]
pub struct RetrieveParams {
    pub query: String,
    #[serde(default = "default_retrieve_limit")]
    pub limit: usize,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
}

fn default_retrieve_limit() -> usize {
    10
}

// ============================================================================
// SERVICE
// ============================================================================

#[derive(Default)]
struct ApiMetrics {
    ingest_requests_total: f64,
    retrieve_requests_total: f64,
    feedback_requests_total: f64,
    ingest_latency_ms_sum: f64,
    retrieve_latency_ms_sum: f64,
    feedback_latency_ms_sum: f64,
}

/// Bridges the HTTP contract to the memory engine
pub struct ApiService {
    config: ApiConfig,
    engine: DecisionEngine,
    ledger: QuotaLedger,
    /// Per-account request timestamps inside the last sliding minute
    minute_window: Mutex<HashMap<String, VecDeque<i64>>>,
    latest_ingestion: Mutex<Option<DateTime<Utc>>>,
    metrics: Mutex<ApiMetrics>,
    started_at: DateTime<Utc>,
}

impl ApiService {
    pub fn new(config: ApiConfig, engine_config: EngineConfig) -> Result<Self, ApiError> {
        config
            .validate()
            .map_err(|error| ApiError::Server(error.to_string()))?;
        let ledger = QuotaLedger::new(
            &engine_config.sqlite_path,
            QuotaLimits {
                events_per_day: config.events_per_day,
                queries_per_day: config.queries_per_day,
                events_per_month: config.events_per_month,
                queries_per_month: config.queries_per_month,
            },
        )
        .map_err(|error| ApiError::Server(error.to_string()))?;
        let engine = DecisionEngine::new(engine_config)
            .map_err(|error| ApiError::Server(error.to_string()))?;
        Ok(Self {
            config,
            engine,
            ledger,
            minute_window: Mutex::new(HashMap::new()),
            latest_ingestion: Mutex::new(None),
            metrics: Mutex::new(ApiMetrics::default()),
            started_at: Utc::now(),
        })
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    pub fn engine(&self) -> &DecisionEngine {
        &self.engine
    }

    pub fn ledger(&self) -> &QuotaLedger {
        &self.ledger
    }

    // ------------------------------------------------------------------
    // Auth + rate limiting
    // ------------------------------------------------------------------

    pub fn authenticate(&self, bearer: Option<&str>) -> Result<AuthContext, ApiError> {
        auth::authenticate(bearer, &self.config, &self.ledger)
    }

    /// Per-minute sliding window, checked before any quota debit.
    /// Exceedance has no side effects.
    pub fn check_minute_window(&self, account_key: &str) -> Result<(), ApiError> {
        let now = Utc::now().timestamp();
        let mut windows = self
            .minute_window
            .lock()
            .map_err(|_| ApiError::Server("minute window lock poisoned".into()))?;
        let window = windows.entry(account_key.to_string()).or_default();
        while window.front().is_some_and(|entry| now - entry >= 60) {
            window.pop_front();
        }
        if window.len() >= self.config.per_minute_limit {
            let oldest = window.front().copied().unwrap_or(now);
            let reset_epoch = oldest + 60;
            return Err(ApiError::RateLimited {
                snapshot: RateLimitSnapshot {
                    limit: self.config.per_minute_limit as i64,
                    remaining: 0,
                    reset_epoch,
                },
                retry_after_seconds: (reset_epoch - now).max(1),
            });
        }
        window.push_back(now);
        Ok(())
    }

    pub fn consume_event_quota(
        &self,
        account_key: &str,
        amount: i64,
    ) -> Result<RateLimitSnapshot, ApiError> {
        Ok(self.ledger.consume(account_key, QuotaKind::Event, amount)?)
    }

    pub fn consume_query_quota(
        &self,
        account_key: &str,
        amount: i64,
    ) -> Result<RateLimitSnapshot, ApiError> {
        Ok(self.ledger.consume(account_key, QuotaKind::Query, amount)?)
    }

    // ------------------------------------------------------------------
    // Ingest
    // ------------------------------------------------------------------

    pub fn validate_ingest(&self, request: &IngestRequest) -> Result<(), ApiError> {
        let content = request.content.trim();
        if content.is_empty() {
            return Err(ApiError::Validation("content cannot be empty".into()));
        }
        if content.chars().count() > self.config.max_ingest_content_chars {
            return Err(ApiError::Validation(format!(
                "content exceeds {} characters",
                self.config.max_ingest_content_chars
            )));
        }
        Ok(())
    }

    pub fn ingest(
        &self,
        account_key: &str,
        request: &IngestRequest,
    ) -> Result<IngestResponse, ApiError> {
        self.validate_ingest(request)?;
        let start = Instant::now();
        let event = Event {
            timestamp: Utc::now(),
            entity_id: request
                .entity_id
                .clone()
                .unwrap_or_else(|| self.config.default_entity_id.clone()),
            event_type: request
                .event_type
                .clone()
                .unwrap_or_else(|| self.config.default_event_type.clone()),
            description: request.content.clone(),
            metadata: request.metadata.clone().unwrap_or_default(),
        };
        let (decision, stored) = self.engine.ingest(&event, account_key)?;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        let (memory_id, encoded_at) = match &stored {
            Some(record) => (record.memory_id.clone(), record.created_at),
            None => (format!("mem_{}", uuid_compact()), event.timestamp),
        };
        let decision_reason = if decision.store {
            decision.rationale.clone()
        } else {
            format!("Discarded by policy: {}", decision.rationale)
        };

        {
            let mut latest = self
                .latest_ingestion
                .lock()
                .map_err(|_| ApiError::Server("ingestion lock poisoned".into()))?;
            *latest = Some(Utc::now());
        }
        {
            let mut metrics = lock_metrics(&self.metrics)?;
            metrics.ingest_requests_total += 1.0;
            metrics.ingest_latency_ms_sum += latency_ms;
        }
        info!(
            account = account_key,
            memory_id = %memory_id,
            stored = decision.store,
            "ingest"
        );
        Ok(IngestResponse {
            memory_id,
            stored: decision.store,
            importance_score: decision.confidence.clamp(0.0, 1.0),
            decision_reason,
            encoded_at,
            latency_ms,
        })
    }

    pub fn ingest_batch(
        &self,
        account_key: &str,
        requests: &[IngestRequest],
    ) -> Result<IngestBatchResponse, ApiError> {
        let mut items = Vec::with_capacity(requests.len());
        for request in requests {
            items.push(self.ingest(account_key, request)?);
        }
        Ok(IngestBatchResponse { items })
    }

    pub fn validate_batch_size(&self, len: usize) -> Result<(), ApiError> {
        if len == 0 {
            return Err(ApiError::Validation("batch cannot be empty".into()));
        }
        if len > self.config.max_batch_items {
            return Err(ApiError::Validation(format!(
                "batch exceeds {} items",
                self.config.max_batch_items
            )));
        }
        Ok(())
    }

    /// Ingest under the idempotency envelope
    pub fn ingest_with_envelope(
        &self,
        account_key: &str,
        request: IngestRequest,
        idempotency_key: Option<&str>,
    ) -> Result<(IngestResponse, RateLimitSnapshot, bool), ApiError> {
        self.validate_ingest(&request)?;
        let payload = serde_json::to_value(&request)
            .map_err(|error| ApiError::Server(error.to_string()))?;
        self.execute_write(account_key, "ingest", idempotency_key, payload, 1, 201, || {
            self.ingest(account_key, &request)
        })
    }

    pub fn ingest_batch_with_envelope(
        &self,
        account_key: &str,
        request: IngestBatchRequest,
        idempotency_key: Option<&str>,
    ) -> Result<(IngestBatchResponse, RateLimitSnapshot, bool), ApiError> {
        self.validate_batch_size(request.events.len())?;
        for item in &request.events {
            self.validate_ingest(item)?;
        }
        let payload = serde_json::to_value(&request.events)
            .map_err(|error| ApiError::Server(error.to_string()))?;
        let amount = request.events.len() as i64;
        self.execute_write(
            account_key,
            "ingest_batch",
            idempotency_key,
            payload,
            amount,
            200,
            || self.ingest_batch(account_key, &request.events),
        )
    }

    // ------------------------------------------------------------------
    // Retrieve
    // ------------------------------------------------------------------

    pub fn validate_retrieve(&self, params: &RetrieveParams) -> Result<(), ApiError> {
        if params.query.trim().is_empty() {
            return Err(ApiError::Validation("query cannot be empty".into()));
        }
        if params.query.chars().count() > self.config.max_query_chars {
            return Err(ApiError::Validation(format!(
                "query exceeds {} characters",
                self.config.max_query_chars
            )));
        }
        if !(1..=100).contains(&params.limit) {
            return Err(ApiError::Validation(
                "limit must be between 1 and 100".into(),
            ));
        }
        if let (Some(start), Some(end)) = (params.start_time, params.end_time) {
            if end < start {
                return Err(ApiError::Validation(
                    "time range end must be >= start".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn retrieve(
        &self,
        account_key: &str,
        params: &RetrieveParams,
    ) -> Result<RetrieveResponse, ApiError> {
        self.validate_retrieve(params)?;
        let start = Instant::now();
        let request = RetrieveRequest {
            query: params.query.clone(),
            limit: params.limit,
            entity_id: params.entity_id.clone(),
            event_type: params.event_type.clone(),
            start_time: params.start_time,
            end_time: params.end_time,
        };
        let outcome = self.engine.retrieve(&request, account_key)?;
        let query_execution_time_ms = start.elapsed().as_secs_f64() * 1000.0;

        let memories = outcome
            .memories
            .iter()
            .enumerate()
            .map(|(index, item)| as_memory_payload(&item.memory, index + 1, item.rank_score))
            .collect();

        let mut applied_filters = HashMap::new();
        if let Some(entity_id) = &params.entity_id {
            applied_filters.insert("entity_id".to_string(), entity_id.clone());
        }
        if let Some(event_type) = &params.event_type {
            applied_filters.insert("event_type".to_string(), event_type.clone());
        }
        if let Some(start_time) = params.start_time {
            applied_filters.insert("start_time".to_string(), start_time.to_rfc3339());
        }
        if let Some(end_time) = params.end_time {
            applied_filters.insert("end_time".to_string(), end_time.to_rfc3339());
        }

        {
            let mut metrics = lock_metrics(&self.metrics)?;
            metrics.retrieve_requests_total += 1.0;
            metrics.retrieve_latency_ms_sum += query_execution_time_ms;
        }
        info!(
            account = account_key,
            returned = outcome.memories.len(),
            "retrieve"
        );
        Ok(RetrieveResponse {
            memories,
            total_candidates: outcome.total_candidates,
            query_execution_time_ms,
            applied_filters,
        })
    }

    // ------------------------------------------------------------------
    // Feedback
    // ------------------------------------------------------------------

    pub fn validate_feedback(&self, request: &FeedbackRequest) -> Result<(), ApiError> {
        if request.memory_id.trim().is_empty() {
            return Err(ApiError::Validation("memory_id cannot be empty".into()));
        }
        if let Some(value) = request.outcome_value {
            if !(-1.0..=1.0).contains(&value) {
                return Err(ApiError::Validation(
                    "outcome_value must be between -1.0 and 1.0".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn feedback(
        &self,
        account_key: &str,
        request: &FeedbackRequest,
    ) -> Result<FeedbackResponse, ApiError> {
        self.validate_feedback(request)?;
        let start = Instant::now();
        let existing = self
            .engine
            .fetch_memories(std::slice::from_ref(&request.memory_id), account_key)?;
        if existing.is_empty() {
            return Err(ApiError::NotFound(format!(
                "memory_id {} was not found",
                request.memory_id
            )));
        }

        let outcome_signal = request
            .outcome_value
            .unwrap_or(if request.helpful { 1.0 } else { -1.0 });
        let feedback =
            OutcomeFeedback::single(&request.memory_id, request.helpful, outcome_signal);
        self.engine.record_feedback(&feedback, account_key)?;

        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        {
            let mut metrics = lock_metrics(&self.metrics)?;
            metrics.feedback_requests_total += 1.0;
            metrics.feedback_latency_ms_sum += latency_ms;
        }
        let learning_impact = if request.helpful {
            "Positive signal recorded. This will improve ranking for similar queries."
        } else {
            "Negative signal recorded. This helps suppress low-value memories."
        };
        info!(account = account_key, memory_id = %request.memory_id, "feedback");
        Ok(FeedbackResponse {
            recorded: true,
            memory_id: request.memory_id.clone(),
            learning_impact: learning_impact.to_string(),
            updated_at: Utc::now(),
        })
    }

    pub fn feedback_batch(
        &self,
        account_key: &str,
        requests: &[FeedbackRequest],
    ) -> Result<FeedbackBatchResponse, ApiError> {
        let mut items = Vec::with_capacity(requests.len());
        for request in requests {
            items.push(self.feedback(account_key, request)?);
        }
        Ok(FeedbackBatchResponse { items })
    }

    pub fn feedback_with_envelope(
        &self,
        account_key: &str,
        request: FeedbackRequest,
        idempotency_key: Option<&str>,
    ) -> Result<(FeedbackResponse, RateLimitSnapshot, bool), ApiError> {
        self.validate_feedback(&request)?;
        let payload = serde_json::to_value(&request)
            .map_err(|error| ApiError::Server(error.to_string()))?;
        self.execute_write(
            account_key,
            "feedback",
            idempotency_key,
            payload,
            1,
            200,
            || self.feedback(account_key, &request),
        )
    }

    pub fn feedback_batch_with_envelope(
        &self,
        account_key: &str,
        request: FeedbackBatchRequest,
        idempotency_key: Option<&str>,
    ) -> Result<(FeedbackBatchResponse, RateLimitSnapshot, bool), ApiError> {
        self.validate_batch_size(request.feedback.len())?;
        for item in &request.feedback {
            self.validate_feedback(item)?;
        }
        let payload = serde_json::to_value(&request.feedback)
            .map_err(|error| ApiError::Server(error.to_string()))?;
        let amount = request.feedback.len() as i64;
        self.execute_write(
            account_key,
            "feedback_batch",
            idempotency_key,
            payload,
            amount,
            200,
            || self.feedback_batch(account_key, &request.feedback),
        )
    }

    // ------------------------------------------------------------------
    // Status, health, metrics, memories
    // ------------------------------------------------------------------

    pub fn status(&self, account_key: &str) -> Result<StatusResponse, ApiError> {
        let now = Utc::now();
        let usage = self.ledger.read_usage(account_key)?;
        let (events_month, queries_month) = usage
            .filter(|row| row.month_year == now.year() && row.month_value == now.month())
            .map(|row| (row.events_month, row.queries_month))
            .unwrap_or((0, 0));
        let latest_ingestion = *self
            .latest_ingestion
            .lock()
            .map_err(|_| ApiError::Server("ingestion lock poisoned".into()))?;
        Ok(StatusResponse {
            connected: true,
            api_version: self.config.api_version.clone(),
            account_usage: AccountUsage {
                events_ingested_this_month: events_month,
                queries_this_month: queries_month,
                storage_usage_mb: self.engine.storage().storage_usage_mb(),
                quota: AccountQuota {
                    events_per_day: self.config.events_per_day,
                    queries_per_day: self.config.queries_per_day,
                    events_per_month: self.config.events_per_month,
                    queries_per_month: self.config.queries_per_month,
                },
            },
            latest_ingestion,
            uptime_percent: self.config.uptime_percent,
        })
    }

    pub fn health(&self) -> HealthResponse {
        match self.engine.memory_count(None) {
            Ok(_) => HealthResponse {
                status: "ok",
                version: self.config.api_version.clone(),
                storage: "ok",
                detail: None,
            },
            Err(error) => HealthResponse {
                status: "degraded",
                version: self.config.api_version.clone(),
                storage: "error",
                detail: Some(error.to_string()),
            },
        }
    }

    pub fn validate_token(&self, auth: &AuthContext) -> AuthValidationResponse {
        AuthValidationResponse {
            valid: true,
            scopes: auth.scopes.clone(),
        }
    }

    /// Prometheus text exposition
    pub fn metrics_text(&self) -> Result<String, ApiError> {
        let metrics = lock_metrics(&self.metrics)?;
        let uptime = (Utc::now() - self.started_at).num_milliseconds() as f64 / 1000.0;
        Ok(format!(
            "# HELP engram_ingest_requests_total Total ingest requests.\n\
             # TYPE engram_ingest_requests_total counter\n\
             engram_ingest_requests_total {:.0}\n\
             # HELP engram_retrieve_requests_total Total retrieve requests.\n\
             # TYPE engram_retrieve_requests_total counter\n\
             engram_retrieve_requests_total {:.0}\n\
             # HELP engram_feedback_requests_total Total feedback requests.\n\
             # TYPE engram_feedback_requests_total counter\n\
             engram_feedback_requests_total {:.0}\n\
             # HELP engram_ingest_latency_ms_sum Cumulative ingest latency.\n\
             # TYPE engram_ingest_latency_ms_sum gauge\n\
             engram_ingest_latency_ms_sum {:.3}\n\
             # HELP engram_retrieve_latency_ms_sum Cumulative retrieve latency.\n\
             # TYPE engram_retrieve_latency_ms_sum gauge\n\
             engram_retrieve_latency_ms_sum {:.3}\n\
             # HELP engram_feedback_latency_ms_sum Cumulative feedback latency.\n\
             # TYPE engram_feedback_latency_ms_sum gauge\n\
             engram_feedback_latency_ms_sum {:.3}\n\
             # HELP engram_uptime_seconds Process uptime in seconds.\n\
             # TYPE engram_uptime_seconds gauge\n\
             engram_uptime_seconds {:.3}\n",
            metrics.ingest_requests_total,
            metrics.retrieve_requests_total,
            metrics.feedback_requests_total,
            metrics.ingest_latency_ms_sum,
            metrics.retrieve_latency_ms_sum,
            metrics.feedback_latency_ms_sum,
            uptime,
        ))
    }

    /// Newest-first tenant memories with a numeric-offset cursor
    pub fn list_memories(
        &self,
        account_key: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<PaginatedMemoriesResponse, ApiError> {
        if !(1..=100).contains(&limit) {
            return Err(ApiError::Validation(
                "limit must be between 1 and 100".into(),
            ));
        }
        let offset = cursor
            .and_then(|raw| raw.parse::<usize>().ok())
            .unwrap_or(0);
        let mut records = self.engine.list_memories(None, Some(account_key))?;
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = records.len();
        let data = records
            .into_iter()
            .skip(offset)
            .take(limit)
            .enumerate()
            .map(|(index, record)| {
                let importance = record.latest_importance;
                as_memory_payload(&record, offset + index + 1, importance)
            })
            .collect();
        let next_offset = offset + limit;
        let has_more = next_offset < total;
        Ok(PaginatedMemoriesResponse {
            data,
            cursor: has_more.then(|| next_offset.to_string()),
            has_more,
        })
    }

    // ------------------------------------------------------------------
    // Envelope
    // ------------------------------------------------------------------

    /// Run a mutating operation under quota + idempotency. Returns the
    /// response, the rate-limit snapshot, and whether it was replayed.
    fn execute_write<T>(
        &self,
        account_key: &str,
        operation: &str,
        idempotency_key: Option<&str>,
        payload: serde_json::Value,
        quota_amount: i64,
        status_code: u16,
        execute: impl FnOnce() -> Result<T, ApiError>,
    ) -> Result<(T, RateLimitSnapshot, bool), ApiError>
    where
        T: Serialize + DeserializeOwned,
    {
        let Some(raw_key) = idempotency_key else {
            let snapshot = self.ledger.consume(account_key, QuotaKind::Event, quota_amount)?;
            return Ok((execute()?, snapshot, false));
        };
        let key = normalize_idempotency_key(raw_key)?;
        let request_hash = engram_core::quota::payload_hash(&payload);

        match self.ledger.begin_idempotent(
            account_key,
            operation,
            &key,
            &request_hash,
            QuotaKind::Event,
            quota_amount,
        )? {
            IdempotencyOutcome::Replay(replay) => {
                let response: T = serde_json::from_value(replay.response)
                    .map_err(|error| ApiError::Server(error.to_string()))?;
                Ok((response, replay.snapshot, true))
            }
            IdempotencyOutcome::Fresh(snapshot) => {
                let result = match execute() {
                    Ok(result) => result,
                    Err(error) => {
                        // Drop the pending reservation so a retry can run
                        let _ = self
                            .ledger
                            .release_idempotent(account_key, operation, &key, &request_hash);
                        return Err(error);
                    }
                };
                let response_json = serde_json::to_value(&result)
                    .map_err(|error| ApiError::Server(error.to_string()))?;
                self.ledger.complete_idempotent(
                    account_key,
                    operation,
                    &key,
                    &request_hash,
                    &response_json,
                    status_code,
                    snapshot,
                )?;
                Ok((result, snapshot, false))
            }
        }
    }
}

fn normalize_idempotency_key(raw: &str) -> Result<String, ApiError> {
    let key = raw.trim();
    if key.is_empty() {
        return Err(ApiError::Validation(
            "Idempotency-Key header cannot be empty".into(),
        ));
    }
    if key.chars().count() > MAX_IDEMPOTENCY_KEY_CHARS {
        return Err(ApiError::Validation(format!(
            "Idempotency-Key header cannot exceed {MAX_IDEMPOTENCY_KEY_CHARS} characters"
        )));
    }
    Ok(key.to_string())
}

fn as_memory_payload(record: &MemoryRecord, rank_position: usize, rank_score: f64) -> MemoryPayload {
    MemoryPayload {
        memory_id: record.memory_id.clone(),
        content: record.content.clone(),
        rank_position,
        rank_score: rank_score.clamp(0.0, 1.0),
        importance_score: record.latest_importance.clamp(0.0, 1.0),
        timestamp: record.created_at,
        metadata: json!({
            "summary": record.summary,
            "intent": record.intent,
            "entities": record.entities,
            "relationships": record.relationships,
            "storage_tier": record.storage_tier.as_str(),
        }),
        relevance_explanation: "Ranked by semantic similarity + learned relevance model."
            .to_string(),
    }
}

fn lock_metrics(metrics: &Mutex<ApiMetrics>) -> Result<std::sync::MutexGuard<'_, ApiMetrics>, ApiError> {
    metrics
        .lock()
        .map_err(|_| ApiError::Server("metrics lock poisoned".into()))
}

fn uuid_compact() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

// ============================================================================
// TESTS
// ============================================================================
