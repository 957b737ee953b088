//! API Error Taxonomy
//!
//! Stable error meanings mapped onto HTTP status codes. Validation and auth
//! failures surface before any side effect; rate limits carry the reset
//! hint; everything unexpected collapses to a logged 500.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use engram_core::{EncodingError, EngineError, QuotaError, RateLimitSnapshot};
use serde_json::json;
use tracing::error;

/// API error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Malformed input; never retried
    #[error("validation error: {0}")]
    Validation(String),
    /// Missing/invalid/expired bearer
    #[error("authentication failed: {0}")]
    Auth(String),
    /// Authenticated but lacking a required scope
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// Unknown memory id
    #[error("not found: {0}")]
    NotFound(String),
    /// Idempotency key conflict
    #[error("conflict: {0}")]
    Conflict(String),
    /// Quota or per-minute cap exceeded
    #[error("rate limit exceeded")]
    RateLimited {
        snapshot: RateLimitSnapshot,
        retry_after_seconds: i64,
    },
    /// Unexpected failure; logged with context
    #[error("internal error: {0}")]
    Server(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Auth(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Server(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation_error",
            ApiError::Auth(_) => "auth_error",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::NotFound(_) => "not_found",
            ApiError::Conflict(_) => "idempotency_conflict",
            ApiError::RateLimited { .. } => "rate_limit_error",
            ApiError::Server(_) => "server_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Server(detail) = &self {
            error!(detail, "request failed");
        }
        let status = self.status();
        let mut body = json!({
            "error": {
                "type": self.kind(),
                "message": self.to_string(),
            }
        });
        if let ApiError::RateLimited {
            retry_after_seconds,
            ..
        } = &self
        {
            body["error"]["retry_after"] = json!(retry_after_seconds);
        }
        let mut response = (status, Json(body)).into_response();
        if let ApiError::RateLimited {
            snapshot,
            retry_after_seconds,
        } = &self
        {
            let headers = response.headers_mut();
            headers.insert("X-RateLimit-Limit", header_value(snapshot.limit));
            headers.insert("X-RateLimit-Remaining", header_value(snapshot.remaining));
            headers.insert("X-RateLimit-Reset", header_value(snapshot.reset_epoch));
            headers.insert("Retry-After", header_value(*retry_after_seconds));
        }
        response
    }
}

fn header_value(value: i64) -> HeaderValue {
    HeaderValue::from_str(&value.to_string())
        .unwrap_or_else(|_| HeaderValue::from_static("0"))
}

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::Validation(message) => ApiError::Validation(message),
            EngineError::MemoryNotFound(memory_id) => ApiError::NotFound(memory_id),
            EngineError::Encoding(EncodingError::EmptyContent) => {
                ApiError::Validation("content cannot be empty".into())
            }
            other => ApiError::Server(other.to_string()),
        }
    }
}

impl From<QuotaError> for ApiError {
    fn from(error: QuotaError) -> Self {
        match error {
            QuotaError::RateLimited {
                snapshot,
                retry_after_seconds,
            } => ApiError::RateLimited {
                snapshot,
                retry_after_seconds,
            },
            QuotaError::IdempotencyConflict(message) => ApiError::Conflict(message),
            other => ApiError::Server(other.to_string()),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
