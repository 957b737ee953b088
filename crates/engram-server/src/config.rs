//! API Server Configuration

use engram_core::EngineError;

const DEV_JWT_SECRET: &str = "engram-dev-secret-change-me";

/// Runtime settings for the REST server
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub api_version: String,
    pub bind_host: String,
    pub bind_port: u16,
    /// Entity assigned to ingests that carry none
    pub default_entity_id: String,
    /// Event type assigned to ingests that carry none
    pub default_event_type: String,

    pub events_per_day: i64,
    pub queries_per_day: i64,
    pub events_per_month: Option<i64>,
    pub queries_per_month: Option<i64>,
    /// Per-account sliding-window request cap
    pub per_minute_limit: usize,

    pub max_ingest_content_chars: usize,
    pub max_query_chars: usize,
    pub max_batch_items: usize,
    pub uptime_percent: f64,
    pub environment: String,

    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub jwt_audience: String,
    pub jwt_required_scope: Option<String>,

    pub cors_allow_origins: Vec<String>,
    /// Background maintenance cadence
    pub maintenance_interval_seconds: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            api_version: "1.0.0".to_string(),
            bind_host: "127.0.0.1".to_string(),
            bind_port: 8700,
            default_entity_id: "global".to_string(),
            default_event_type: "generic_event".to_string(),
            events_per_day: 100,
            queries_per_day: 500,
            events_per_month: None,
            queries_per_month: None,
            per_minute_limit: 1000,
            max_ingest_content_chars: 20_000,
            max_query_chars: 2_000,
            max_batch_items: 100,
            uptime_percent: 99.9,
            environment: "development".to_string(),
            jwt_secret: DEV_JWT_SECRET.to_string(),
            jwt_issuer: "engram".to_string(),
            jwt_audience: "engram-api".to_string(),
            jwt_required_scope: None,
            cors_allow_origins: Vec::new(),
            maintenance_interval_seconds: 30,
        }
    }
}

impl ApiConfig {
    /// Build from `ENGRAM_API_*` environment variables
    pub fn from_env() -> Result<Self, EngineError> {
        let defaults = Self::default();
        let config = Self {
            api_version: env_string("ENGRAM_API_VERSION", &defaults.api_version),
            bind_host: env_string("ENGRAM_API_HOST", &defaults.bind_host),
            bind_port: env_parse("ENGRAM_API_PORT", defaults.bind_port),
            default_entity_id: env_string("ENGRAM_DEFAULT_ENTITY_ID", &defaults.default_entity_id),
            default_event_type: env_string(
                "ENGRAM_DEFAULT_EVENT_TYPE",
                &defaults.default_event_type,
            ),
            events_per_day: env_parse("ENGRAM_RATE_LIMIT_EVENTS_PER_DAY", defaults.events_per_day),
            queries_per_day: env_parse(
                "ENGRAM_RATE_LIMIT_QUERIES_PER_DAY",
                defaults.queries_per_day,
            ),
            events_per_month: env_optional_parse("ENGRAM_RATE_LIMIT_EVENTS_PER_MONTH"),
            queries_per_month: env_optional_parse("ENGRAM_RATE_LIMIT_QUERIES_PER_MONTH"),
            per_minute_limit: env_parse("ENGRAM_RATE_LIMIT_PER_MINUTE", defaults.per_minute_limit),
            max_ingest_content_chars: env_parse(
                "ENGRAM_MAX_INGEST_CONTENT_CHARS",
                defaults.max_ingest_content_chars,
            ),
            max_query_chars: env_parse("ENGRAM_MAX_QUERY_CHARS", defaults.max_query_chars),
            max_batch_items: env_parse("ENGRAM_MAX_BATCH_ITEMS", defaults.max_batch_items),
            uptime_percent: env_parse("ENGRAM_UPTIME_PERCENT", defaults.uptime_percent),
            environment: env_string("ENGRAM_ENV", &defaults.environment)
                .trim()
                .to_lowercase(),
            jwt_secret: env_string("ENGRAM_JWT_SECRET", &defaults.jwt_secret),
            jwt_issuer: env_string("ENGRAM_JWT_ISSUER", &defaults.jwt_issuer),
            jwt_audience: env_string("ENGRAM_JWT_AUDIENCE", &defaults.jwt_audience),
            jwt_required_scope: env_optional_string("ENGRAM_JWT_REQUIRED_SCOPE"),
            cors_allow_origins: env_csv("ENGRAM_CORS_ALLOW_ORIGINS"),
            maintenance_interval_seconds: env_parse(
                "ENGRAM_MAINTENANCE_INTERVAL_SECONDS",
                defaults.maintenance_interval_seconds,
            ),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.jwt_secret.trim().is_empty() {
            return Err(EngineError::Config("jwt_secret cannot be empty".into()));
        }
        if matches!(self.environment.as_str(), "prod" | "production")
            && self.jwt_secret == DEV_JWT_SECRET
        {
            return Err(EngineError::Config(
                "ENGRAM_JWT_SECRET must be set to a non-default value in production".into(),
            ));
        }
        if self.events_per_day <= 0 || self.queries_per_day <= 0 {
            return Err(EngineError::Config(
                "daily quota limits must be positive".into(),
            ));
        }
        if self.per_minute_limit == 0
            || self.max_ingest_content_chars == 0
            || self.max_query_chars == 0
            || self.max_batch_items == 0
        {
            return Err(EngineError::Config(
                "limit values must be positive integers".into(),
            ));
        }
        Ok(())
    }
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_optional_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

fn env_optional_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|raw| raw.trim().parse().ok())
}

fn env_csv(name: &str) -> Vec<String> {
    std::env::var(name)
        .map(|raw| {
            raw.split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

// ============================================================================
// TESTS
// ============================================================================
