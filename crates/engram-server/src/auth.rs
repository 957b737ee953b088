//! Bearer Authentication
//!
//! Tokens are either signed JWTs (`sub`/`iss`/`aud`/`iat`/`exp` required,
//! optional `scopes`) or opaque API keys whose sha256 digest is checked
//! against the keys table. The JWT subject (or the key's account) becomes
//! the tenant for everything downstream.

use engram_core::QuotaLedger;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::config::ApiConfig;
use crate::error::ApiError;

/// Validated authentication context
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Tenant/account key
    pub subject: String,
    pub scopes: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    scopes: Option<serde_json::Value>,
    #[serde(default)]
    scope: Option<String>,
}

/// Resolve a bearer token into an auth context
pub fn authenticate(
    bearer: Option<&str>,
    config: &ApiConfig,
    ledger: &QuotaLedger,
) -> Result<AuthContext, ApiError> {
    let token = bearer
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| ApiError::Auth("missing bearer token".into()))?;

    // JWTs have exactly two dots; anything else is an opaque API key
    let context = if token.bytes().filter(|byte| *byte == b'.').count() == 2 {
        validate_jwt(token, config)?
    } else {
        validate_api_key(token, ledger)?
    };

    if let Some(required) = &config.jwt_required_scope {
        if !context.scopes.iter().any(|scope| scope == required) {
            return Err(ApiError::Forbidden(format!(
                "token missing required scope: {required}"
            )));
        }
    }
    Ok(context)
}

fn validate_jwt(token: &str, config: &ApiConfig) -> Result<AuthContext, ApiError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_audience(&[config.jwt_audience.clone()]);
    validation.set_issuer(&[config.jwt_issuer.clone()]);
    validation.set_required_spec_claims(&["exp", "iat", "sub", "iss", "aud"]);

    let decoded = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.jwt_secret.as_bytes()),
        &validation,
    )
    .map_err(|error| match error.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
            ApiError::Auth("jwt token expired".into())
        }
        other => ApiError::Auth(format!("invalid jwt token: {other:?}")),
    })?;

    let subject = decoded.claims.sub.trim().to_string();
    if subject.is_empty() {
        return Err(ApiError::Auth("jwt token missing subject".into()));
    }
    Ok(AuthContext {
        subject,
        scopes: parse_scopes(&decoded.claims),
    })
}

fn validate_api_key(token: &str, ledger: &QuotaLedger) -> Result<AuthContext, ApiError> {
    let identity = ledger
        .verify_api_key(token)
        .map_err(|error| ApiError::Server(error.to_string()))?
        .ok_or_else(|| ApiError::Auth("unknown api key".into()))?;
    Ok(AuthContext {
        subject: identity.account_key,
        scopes: identity.scopes,
    })
}

/// `scopes` may be a list or a space-separated string; `scope` is the
/// space-separated fallback claim
fn parse_scopes(claims: &Claims) -> Vec<String> {
    match &claims.scopes {
        Some(serde_json::Value::Array(items)) => {
            return items
                .iter()
                .filter_map(|item| item.as_str())
                .map(str::trim)
                .filter(|scope| !scope.is_empty())
                .map(str::to_string)
                .collect();
        }
        Some(serde_json::Value::String(joined)) => {
            return joined.split_whitespace().map(str::to_string).collect();
        }
        _ => {}
    }
    claims
        .scope
        .as_deref()
        .map(|joined| joined.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

// ============================================================================
// TESTS
// ============================================================================
