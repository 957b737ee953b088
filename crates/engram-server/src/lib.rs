//! Engram REST Server
//!
//! HTTP surface over the engram memory engine: ingest, retrieve, feedback
//! (plus batch variants), status, health, metrics, token validation, and
//! paginated memory listing. Every request except health and metrics
//! carries a bearer token, a signed JWT or an opaque API key, and every
//! mutating request runs through the per-account quota and idempotency
//! envelope.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod service;

pub use auth::AuthContext;
pub use config::ApiConfig;
pub use error::ApiError;
pub use service::ApiService;
