//! HTTP Routes
//!
//! Axum router for the /v1 surface. Bearer auth is resolved per handler;
//! the per-minute window runs before any quota debit; every mutating
//! response carries the rate-limit headers, and idempotent replays are
//! marked with `X-Idempotency-Replayed: true`.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use engram_core::RateLimitSnapshot;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};

use crate::auth::AuthContext;
use crate::error::ApiError;
use crate::service::{
    ApiService, FeedbackBatchRequest, FeedbackRequest, IngestBatchRequest, IngestRequest,
    RetrieveParams,
};

/// Shared router state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ApiService>,
    /// Bounded maintenance channel; request paths enqueue without awaiting
    pub maintenance: mpsc::Sender<()>,
}

/// Build the /v1 router
pub fn router(state: AppState) -> Router {
    let cors = if state.service.config().cors_allow_origins.is_empty() {
        CorsLayer::new()
    } else if state
        .service
        .config()
        .cors_allow_origins
        .iter()
        .any(|origin| origin == "*")
    {
        CorsLayer::new().allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> = state
            .service
            .config()
            .cors_allow_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(origins)
    };

    Router::new()
        .route("/v1/ingest", post(ingest))
        .route("/v1/ingest/batch", post(ingest_batch))
        .route("/v1/retrieve", get(retrieve))
        .route("/v1/feedback", post(feedback))
        .route("/v1/feedback/batch", post(feedback_batch))
        .route("/v1/status", get(status))
        .route("/v1/health", get(health))
        .route("/v1/metrics", get(metrics))
        .route("/v1/auth/validate", post(auth_validate))
        .route("/v1/memories", get(list_memories))
        .layer(tower::ServiceBuilder::new().layer(cors))
        .with_state(state)
}

// ============================================================================
// HANDLERS
// ============================================================================

async fn ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<IngestRequest>,
) -> Result<Response, ApiError> {
    let auth = authorize(&state, &headers)?;
    let idempotency_key = idempotency_key(&headers);
    let (response, snapshot, replayed) = state.service.ingest_with_envelope(
        &auth.subject,
        payload,
        idempotency_key.as_deref(),
    )?;
    enqueue_maintenance(&state);
    Ok(with_rate_headers(
        StatusCode::CREATED,
        snapshot,
        replayed,
        response,
    ))
}

async fn ingest_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<IngestBatchRequest>,
) -> Result<Response, ApiError> {
    let auth = authorize(&state, &headers)?;
    let idempotency_key = idempotency_key(&headers);
    let (response, snapshot, replayed) = state.service.ingest_batch_with_envelope(
        &auth.subject,
        payload,
        idempotency_key.as_deref(),
    )?;
    enqueue_maintenance(&state);
    Ok(with_rate_headers(StatusCode::OK, snapshot, replayed, response))
}

async fn retrieve(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<RetrieveParams>,
) -> Result<Response, ApiError> {
    let auth = authorize(&state, &headers)?;
    state.service.validate_retrieve(&params)?;
    let snapshot = state.service.consume_query_quota(&auth.subject, 1)?;
    let response = state.service.retrieve(&auth.subject, &params)?;
    Ok(with_rate_headers(StatusCode::OK, snapshot, false, response))
}

async fn feedback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<FeedbackRequest>,
) -> Result<Response, ApiError> {
    let auth = authorize(&state, &headers)?;
    let idempotency_key = idempotency_key(&headers);
    let (response, snapshot, replayed) = state.service.feedback_with_envelope(
        &auth.subject,
        payload,
        idempotency_key.as_deref(),
    )?;
    Ok(with_rate_headers(StatusCode::OK, snapshot, replayed, response))
}

async fn feedback_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<FeedbackBatchRequest>,
) -> Result<Response, ApiError> {
    let auth = authorize(&state, &headers)?;
    let idempotency_key = idempotency_key(&headers);
    let (response, snapshot, replayed) = state.service.feedback_batch_with_envelope(
        &auth.subject,
        payload,
        idempotency_key.as_deref(),
    )?;
    Ok(with_rate_headers(StatusCode::OK, snapshot, replayed, response))
}

async fn status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let auth = authorize(&state, &headers)?;
    let response = state.service.status(&auth.subject)?;
    Ok(Json(response).into_response())
}

async fn health(State(state): State<AppState>) -> Response {
    Json(state.service.health()).into_response()
}

async fn metrics(State(state): State<AppState>) -> Result<Response, ApiError> {
    let text = state.service.metrics_text()?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        text,
    )
        .into_response())
}

async fn auth_validate(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let auth = authorize(&state, &headers)?;
    Ok(Json(state.service.validate_token(&auth)).into_response())
}

#[derive(Debug, Deserialize)]
struct ListMemoriesParams {
    #[serde(default = "default_list_limit")]
    limit: usize,
    #[serde(default)]
    cursor: Option<String>,
}

fn default_list_limit() -> usize {
    100
}

async fn list_memories(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListMemoriesParams>,
) -> Result<Response, ApiError> {
    let auth = authorize(&state, &headers)?;
    let snapshot = state.service.consume_query_quota(&auth.subject, 1)?;
    let response =
        state
            .service
            .list_memories(&auth.subject, params.limit, params.cursor.as_deref())?;
    Ok(with_rate_headers(StatusCode::OK, snapshot, false, response))
}

// ============================================================================
// HELPERS
// ============================================================================

/// Bearer auth followed by the per-minute sliding window
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<AuthContext, ApiError> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    let auth = state.service.authenticate(bearer)?;
    state.service.check_minute_window(&auth.subject)?;
    Ok(auth)
}

fn idempotency_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Idempotency-Key")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn enqueue_maintenance(state: &AppState) {
    // Full queue means a sweep is already scheduled
    let _ = state.maintenance.try_send(());
}

fn with_rate_headers<T: Serialize>(
    status: StatusCode,
    snapshot: RateLimitSnapshot,
    replayed: bool,
    body: T,
) -> Response {
    let mut response = (status, Json(body)).into_response();
    let headers = response.headers_mut();
    headers.insert("X-RateLimit-Limit", int_header(snapshot.limit));
    headers.insert("X-RateLimit-Remaining", int_header(snapshot.remaining));
    headers.insert("X-RateLimit-Reset", int_header(snapshot.reset_epoch));
    if replayed {
        headers.insert("X-Idempotency-Replayed", HeaderValue::from_static("true"));
    }
    response
}

fn int_header(value: i64) -> HeaderValue {
    HeaderValue::from_str(&value.to_string())
        .unwrap_or_else(|_| HeaderValue::from_static("0"))
}
