//! Per-Account Quotas and Idempotent Writes
//!
//! The ledger owns the `api_account_usage`, `api_idempotency`, and
//! `api_keys` tables. Every debit runs inside an IMMEDIATE transaction
//! (SQLite's write lock is the row-lock equivalent here), so the quota
//! check, the debit, and the idempotency reservation commit atomically:
//! no debit is ever observed without being committed, and for a given
//! `(account, operation, key)` at most one execution persists a response.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use rusqlite::{params, Connection, TransactionBehavior};
use sha2::{Digest, Sha256};

use crate::storage::apply_migrations;

// ============================================================================
// TYPES
// ============================================================================

/// Which budget a request debits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaKind {
    Event,
    Query,
}

/// Rate-limit view returned with every debit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSnapshot {
    pub limit: i64,
    pub remaining: i64,
    /// Epoch seconds when the daily window resets (next UTC midnight)
    pub reset_epoch: i64,
}

/// Daily/monthly budgets; monthly limits are optional
#[derive(Debug, Clone, Copy)]
pub struct QuotaLimits {
    pub events_per_day: i64,
    pub queries_per_day: i64,
    pub events_per_month: Option<i64>,
    pub queries_per_month: Option<i64>,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            events_per_day: 100,
            queries_per_day: 500,
            events_per_month: None,
            queries_per_month: None,
        }
    }
}

/// Raw usage counters for one account
#[derive(Debug, Clone)]
pub struct UsageSnapshot {
    pub day_bucket: NaiveDate,
    pub month_year: i32,
    pub month_value: u32,
    pub events_today: i64,
    pub queries_today: i64,
    pub events_month: i64,
    pub queries_month: i64,
}

/// A previously stored idempotent response
#[derive(Debug, Clone)]
pub struct StoredReplay {
    pub response: serde_json::Value,
    pub snapshot: RateLimitSnapshot,
    pub status_code: u16,
}

/// Outcome of reserving an idempotency slot
#[derive(Debug, Clone)]
pub enum IdempotencyOutcome {
    /// Reservation made and quota debited; execute the operation
    Fresh(RateLimitSnapshot),
    /// A completed execution exists; replay its stored response
    Replay(StoredReplay),
}

/// Identity resolved from an opaque API key
#[derive(Debug, Clone)]
pub struct ApiKeyIdentity {
    pub account_key: String,
    pub scopes: Vec<String>,
}

/// Ledger error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    /// Budget exhausted; carries the reset hint
    #[error("rate limit exceeded")]
    RateLimited {
        snapshot: RateLimitSnapshot,
        retry_after_seconds: i64,
    },
    /// Key reused with a different payload, or reservation still in flight
    #[error("idempotency conflict: {0}")]
    IdempotencyConflict(String),
    /// Non-positive debit amount
    #[error("quota amount must be > 0, got {0}")]
    InvalidAmount(i64),
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// Stored payload failed to parse
    #[error("malformed stored payload: {0}")]
    Codec(String),
    /// Connection lock poisoned
    #[error("ledger lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, QuotaError>;

// ============================================================================
// LEDGER
// ============================================================================

/// Quota and idempotency ledger over the shared SQLite database
pub struct QuotaLedger {
    conn: Mutex<Connection>,
    limits: QuotaLimits,
}

impl QuotaLedger {
    pub fn new(db_path: impl AsRef<Path>, limits: QuotaLimits) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 30000;",
        )?;
        apply_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            limits,
        })
    }

    pub fn limits(&self) -> QuotaLimits {
        self.limits
    }

    /// Debit `amount` from the account's budget; errors with `RateLimited`
    /// and leaves the counters untouched when the budget would overflow.
    pub fn consume(
        &self,
        account_key: &str,
        kind: QuotaKind,
        amount: i64,
    ) -> Result<RateLimitSnapshot> {
        let mut guard = self.conn.lock().map_err(|_| QuotaError::LockPoisoned)?;
        let tx = guard.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let snapshot = consume_in_tx(&tx, account_key, kind, amount, Utc::now(), &self.limits)?;
        tx.commit()?;
        Ok(snapshot)
    }

    /// Current counters for the account, if any request was ever made
    pub fn read_usage(&self, account_key: &str) -> Result<Option<UsageSnapshot>> {
        let guard = self.conn.lock().map_err(|_| QuotaError::LockPoisoned)?;
        let row = guard
            .query_row(
                "SELECT day_bucket, month_year, month_value, events_today, queries_today,
                        events_month, queries_month
                 FROM api_account_usage WHERE account_key = ?1",
                params![account_key],
                |row| {
                    Ok(UsageSnapshot {
                        day_bucket: NaiveDate::parse_from_str(
                            &row.get::<_, String>(0)?,
                            "%Y-%m-%d",
                        )
                        .unwrap_or_else(|_| Utc::now().date_naive()),
                        month_year: row.get(1)?,
                        month_value: row.get::<_, i64>(2)? as u32,
                        events_today: row.get(3)?,
                        queries_today: row.get(4)?,
                        events_month: row.get(5)?,
                        queries_month: row.get(6)?,
                    })
                },
            )
            .map(Some)
            .or_else(|error| match error {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(row)
    }

    /// Reserve `(account, operation, key)` and debit quota in one
    /// transaction. A completed prior execution returns its replay; a
    /// pending one, or a payload-hash mismatch, conflicts.
    pub fn begin_idempotent(
        &self,
        account_key: &str,
        operation: &str,
        idempotency_key: &str,
        request_hash: &str,
        kind: QuotaKind,
        amount: i64,
    ) -> Result<IdempotencyOutcome> {
        let mut guard = self.conn.lock().map_err(|_| QuotaError::LockPoisoned)?;
        let tx = guard.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now();

        let existing: Option<(String, Option<String>, Option<i64>)> = tx
            .query_row(
                "SELECT request_hash, response_json, status_code FROM api_idempotency
                 WHERE account_key = ?1 AND operation = ?2 AND idempotency_key = ?3",
                params![account_key, operation, idempotency_key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map(Some)
            .or_else(|error| match error {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        if let Some((stored_hash, response_json, status_code)) = existing {
            if stored_hash != request_hash {
                return Err(QuotaError::IdempotencyConflict(
                    "idempotency key reused with a different payload".into(),
                ));
            }
            let (Some(response_json), Some(status_code)) = (response_json, status_code) else {
                return Err(QuotaError::IdempotencyConflict(
                    "request with this idempotency key is still in progress".into(),
                ));
            };
            let replay = parse_replay(&response_json, status_code as u16)?;
            return Ok(IdempotencyOutcome::Replay(replay));
        }

        tx.execute(
            "INSERT INTO api_idempotency (
                account_key, operation, idempotency_key, request_hash,
                response_json, status_code, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, NULL, NULL, ?5, ?5)",
            params![
                account_key,
                operation,
                idempotency_key,
                request_hash,
                now.to_rfc3339()
            ],
        )?;
        // A quota failure rolls the reservation back with the transaction
        let snapshot = consume_in_tx(&tx, account_key, kind, amount, now, &self.limits)?;
        tx.commit()?;
        Ok(IdempotencyOutcome::Fresh(snapshot))
    }

    /// Store the response against a fresh reservation
    pub fn complete_idempotent(
        &self,
        account_key: &str,
        operation: &str,
        idempotency_key: &str,
        request_hash: &str,
        response: &serde_json::Value,
        status_code: u16,
        snapshot: RateLimitSnapshot,
    ) -> Result<()> {
        let payload = serde_json::json!({
            "response": response,
            "rate_limit": {
                "limit": snapshot.limit,
                "remaining": snapshot.remaining,
                "reset_epoch": snapshot.reset_epoch,
            },
        });
        let payload_json =
            serde_json::to_string(&payload).map_err(|e| QuotaError::Codec(e.to_string()))?;
        let guard = self.conn.lock().map_err(|_| QuotaError::LockPoisoned)?;
        guard.execute(
            "UPDATE api_idempotency
             SET response_json = ?1, status_code = ?2, updated_at = ?3
             WHERE account_key = ?4 AND operation = ?5 AND idempotency_key = ?6
               AND request_hash = ?7 AND response_json IS NULL",
            params![
                payload_json,
                status_code as i64,
                Utc::now().to_rfc3339(),
                account_key,
                operation,
                idempotency_key,
                request_hash
            ],
        )?;
        Ok(())
    }

    /// Drop a pending reservation after a failed execution so a retry can
    /// run. Completed reservations are left untouched.
    pub fn release_idempotent(
        &self,
        account_key: &str,
        operation: &str,
        idempotency_key: &str,
        request_hash: &str,
    ) -> Result<()> {
        let guard = self.conn.lock().map_err(|_| QuotaError::LockPoisoned)?;
        guard.execute(
            "DELETE FROM api_idempotency
             WHERE account_key = ?1 AND operation = ?2 AND idempotency_key = ?3
               AND request_hash = ?4 AND response_json IS NULL",
            params![account_key, operation, idempotency_key, request_hash],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // API keys
    // ------------------------------------------------------------------

    /// Register an opaque API key; only its digest is stored
    pub fn register_api_key(
        &self,
        account_key: &str,
        name: &str,
        token: &str,
        scopes: &[String],
    ) -> Result<String> {
        let key_id = uuid::Uuid::new_v4().to_string();
        let scopes_json =
            serde_json::to_string(scopes).map_err(|e| QuotaError::Codec(e.to_string()))?;
        let guard = self.conn.lock().map_err(|_| QuotaError::LockPoisoned)?;
        guard.execute(
            "INSERT INTO api_keys (key_id, account_key, name, key_digest, scopes_json,
                                   status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'active', ?6)",
            params![
                key_id,
                account_key,
                name,
                token_digest(token),
                scopes_json,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(key_id)
    }

    /// Resolve an opaque token to its account, touching `last_used_at`
    pub fn verify_api_key(&self, token: &str) -> Result<Option<ApiKeyIdentity>> {
        let digest = token_digest(token);
        let guard = self.conn.lock().map_err(|_| QuotaError::LockPoisoned)?;
        let found: Option<(String, String, String)> = guard
            .query_row(
                "SELECT key_id, account_key, scopes_json FROM api_keys
                 WHERE key_digest = ?1 AND status = 'active'",
                params![digest],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map(Some)
            .or_else(|error| match error {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        let Some((key_id, account_key, scopes_json)) = found else {
            return Ok(None);
        };
        guard.execute(
            "UPDATE api_keys SET last_used_at = ?1 WHERE key_id = ?2",
            params![Utc::now().to_rfc3339(), key_id],
        )?;
        let scopes: Vec<String> = serde_json::from_str(&scopes_json).unwrap_or_default();
        Ok(Some(ApiKeyIdentity {
            account_key,
            scopes,
        }))
    }
}

// ============================================================================
// INTERNALS
// ============================================================================

fn consume_in_tx(
    tx: &rusqlite::Transaction<'_>,
    account_key: &str,
    kind: QuotaKind,
    amount: i64,
    now: DateTime<Utc>,
    limits: &QuotaLimits,
) -> Result<RateLimitSnapshot> {
    if amount <= 0 {
        return Err(QuotaError::InvalidAmount(amount));
    }
    let today = now.date_naive();
    let row: Option<UsageSnapshot> = tx
        .query_row(
            "SELECT day_bucket, month_year, month_value, events_today, queries_today,
                    events_month, queries_month
             FROM api_account_usage WHERE account_key = ?1",
            params![account_key],
            |row| {
                Ok(UsageSnapshot {
                    day_bucket: NaiveDate::parse_from_str(&row.get::<_, String>(0)?, "%Y-%m-%d")
                        .unwrap_or(today),
                    month_year: row.get(1)?,
                    month_value: row.get::<_, i64>(2)? as u32,
                    events_today: row.get(3)?,
                    queries_today: row.get(4)?,
                    events_month: row.get(5)?,
                    queries_month: row.get(6)?,
                })
            },
        )
        .map(Some)
        .or_else(|error| match error {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;

    let mut usage = row.unwrap_or(UsageSnapshot {
        day_bucket: today,
        month_year: now.year(),
        month_value: now.month(),
        events_today: 0,
        queries_today: 0,
        events_month: 0,
        queries_month: 0,
    });

    // Lazy rollover on first use of a new day/month
    if usage.day_bucket != today {
        usage.day_bucket = today;
        usage.events_today = 0;
        usage.queries_today = 0;
    }
    if usage.month_year != now.year() || usage.month_value != now.month() {
        usage.month_year = now.year();
        usage.month_value = now.month();
        usage.events_month = 0;
        usage.queries_month = 0;
    }

    let (daily_limit, daily_used, monthly_limit, monthly_used) = match kind {
        QuotaKind::Event => (
            limits.events_per_day,
            usage.events_today,
            limits.events_per_month,
            usage.events_month,
        ),
        QuotaKind::Query => (
            limits.queries_per_day,
            usage.queries_today,
            limits.queries_per_month,
            usage.queries_month,
        ),
    };

    let reset_epoch = next_day_reset_epoch(now);
    let over_daily = daily_used + amount > daily_limit;
    let over_monthly = monthly_limit.is_some_and(|limit| monthly_used + amount > limit);
    if over_daily || over_monthly {
        let snapshot = RateLimitSnapshot {
            limit: daily_limit,
            remaining: (daily_limit - daily_used).max(0),
            reset_epoch,
        };
        return Err(QuotaError::RateLimited {
            snapshot,
            retry_after_seconds: (reset_epoch - now.timestamp()).max(1),
        });
    }

    match kind {
        QuotaKind::Event => {
            usage.events_today += amount;
            usage.events_month += amount;
        }
        QuotaKind::Query => {
            usage.queries_today += amount;
            usage.queries_month += amount;
        }
    }

    tx.execute(
        "INSERT INTO api_account_usage (
            account_key, day_bucket, month_year, month_value,
            events_today, queries_today, events_month, queries_month, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(account_key) DO UPDATE SET
            day_bucket = excluded.day_bucket,
            month_year = excluded.month_year,
            month_value = excluded.month_value,
            events_today = excluded.events_today,
            queries_today = excluded.queries_today,
            events_month = excluded.events_month,
            queries_month = excluded.queries_month,
            updated_at = excluded.updated_at",
        params![
            account_key,
            usage.day_bucket.format("%Y-%m-%d").to_string(),
            usage.month_year,
            usage.month_value as i64,
            usage.events_today,
            usage.queries_today,
            usage.events_month,
            usage.queries_month,
            now.to_rfc3339()
        ],
    )?;

    let remaining = match kind {
        QuotaKind::Event => (daily_limit - usage.events_today).max(0),
        QuotaKind::Query => (daily_limit - usage.queries_today).max(0),
    };
    Ok(RateLimitSnapshot {
        limit: daily_limit,
        remaining,
        reset_epoch,
    })
}

fn parse_replay(response_json: &str, status_code: u16) -> Result<StoredReplay> {
    let parsed: serde_json::Value =
        serde_json::from_str(response_json).map_err(|e| QuotaError::Codec(e.to_string()))?;
    let response = parsed
        .get("response")
        .cloned()
        .ok_or_else(|| QuotaError::Codec("stored idempotency response is malformed".into()))?;
    let rate_limit = parsed.get("rate_limit");
    let snapshot = RateLimitSnapshot {
        limit: read_i64(rate_limit, "limit"),
        remaining: read_i64(rate_limit, "remaining"),
        reset_epoch: read_i64(rate_limit, "reset_epoch"),
    };
    Ok(StoredReplay {
        response,
        snapshot,
        status_code,
    })
}

fn read_i64(value: Option<&serde_json::Value>, key: &str) -> i64 {
    value
        .and_then(|v| v.get(key))
        .and_then(|v| v.as_i64())
        .unwrap_or(0)
        .max(0)
}

/// Next UTC midnight after `now`, as epoch seconds
pub fn next_day_reset_epoch(now: DateTime<Utc>) -> i64 {
    let midnight = Utc.from_utc_datetime(&now.date_naive().and_time(chrono::NaiveTime::MIN));
    midnight.timestamp() + 86_400
}

/// Canonical sha256 hex digest of a JSON payload. `serde_json` maps are
/// key-sorted, so identical payloads hash identically regardless of the
/// caller's field order.
pub fn payload_hash(payload: &serde_json::Value) -> String {
    let canonical = serde_json::to_string(payload).unwrap_or_default();
    let digest = Sha256::digest(canonical.as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn token_digest(token: &str) -> String {
    let digest = Sha256::digest(token.trim().as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger(events_per_day: i64) -> (QuotaLedger, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = QuotaLedger::new(
            dir.path().join("state.db"),
            QuotaLimits {
                events_per_day,
                queries_per_day: 500,
                events_per_month: None,
                queries_per_month: None,
            },
        )
        .unwrap();
        (ledger, dir)
    }

    #[test]
    fn test_debits_are_monotonic() {
        let (ledger, _dir) = ledger(10);
        for expected_remaining in (0..10).rev() {
            let snapshot = ledger.consume("acct", QuotaKind::Event, 1).unwrap();
            assert_eq!(snapshot.remaining, expected_remaining);
        }
        let usage = ledger.read_usage("acct").unwrap().unwrap();
        assert_eq!(usage.events_today, 10);
        assert_eq!(usage.events_month, 10);
    }

    #[test]
    fn test_exhausted_quota_leaves_counters_untouched() {
        let (ledger, _dir) = ledger(2);
        ledger.consume("acct", QuotaKind::Event, 2).unwrap();
        let error = ledger.consume("acct", QuotaKind::Event, 1).unwrap_err();
        match error {
            QuotaError::RateLimited {
                snapshot,
                retry_after_seconds,
            } => {
                assert_eq!(snapshot.remaining, 0);
                assert!(retry_after_seconds >= 1);
            }
            other => panic!("unexpected error: {other}"),
        }
        let usage = ledger.read_usage("acct").unwrap().unwrap();
        assert_eq!(usage.events_today, 2);
    }

    #[test]
    fn test_quota_is_per_account_and_per_kind() {
        let (ledger, _dir) = ledger(1);
        ledger.consume("a", QuotaKind::Event, 1).unwrap();
        // Different account has its own budget
        ledger.consume("b", QuotaKind::Event, 1).unwrap();
        // Query budget is separate from events
        ledger.consume("a", QuotaKind::Query, 1).unwrap();
        assert!(ledger.consume("a", QuotaKind::Event, 1).is_err());
    }

    #[test]
    fn test_idempotent_execute_and_replay() {
        let (ledger, _dir) = ledger(10);
        let payload = serde_json::json!({"content": "hello"});
        let hash = payload_hash(&payload);

        let outcome = ledger
            .begin_idempotent("acct", "ingest", "key-1", &hash, QuotaKind::Event, 1)
            .unwrap();
        let snapshot = match outcome {
            IdempotencyOutcome::Fresh(snapshot) => snapshot,
            IdempotencyOutcome::Replay(_) => panic!("expected fresh reservation"),
        };
        let response = serde_json::json!({"memory_id": "m-1", "stored": true});
        ledger
            .complete_idempotent("acct", "ingest", "key-1", &hash, &response, 201, snapshot)
            .unwrap();

        match ledger
            .begin_idempotent("acct", "ingest", "key-1", &hash, QuotaKind::Event, 1)
            .unwrap()
        {
            IdempotencyOutcome::Replay(replay) => {
                assert_eq!(replay.response, response);
                assert_eq!(replay.status_code, 201);
            }
            IdempotencyOutcome::Fresh(_) => panic!("expected replay"),
        }
        // Replay did not consume additional quota
        let usage = ledger.read_usage("acct").unwrap().unwrap();
        assert_eq!(usage.events_today, 1);
    }

    #[test]
    fn test_payload_mismatch_conflicts_without_side_effects() {
        let (ledger, _dir) = ledger(10);
        let hash = payload_hash(&serde_json::json!({"content": "one"}));
        let outcome = ledger
            .begin_idempotent("acct", "ingest", "key-1", &hash, QuotaKind::Event, 1)
            .unwrap();
        let snapshot = match outcome {
            IdempotencyOutcome::Fresh(snapshot) => snapshot,
            IdempotencyOutcome::Replay(_) => panic!("expected fresh"),
        };
        ledger
            .complete_idempotent(
                "acct",
                "ingest",
                "key-1",
                &hash,
                &serde_json::json!({}),
                201,
                snapshot,
            )
            .unwrap();

        let other_hash = payload_hash(&serde_json::json!({"content": "two"}));
        let error = ledger
            .begin_idempotent("acct", "ingest", "key-1", &other_hash, QuotaKind::Event, 1)
            .unwrap_err();
        assert!(matches!(error, QuotaError::IdempotencyConflict(_)));
        let usage = ledger.read_usage("acct").unwrap().unwrap();
        assert_eq!(usage.events_today, 1);
    }

    #[test]
    fn test_in_flight_reservation_conflicts() {
        let (ledger, _dir) = ledger(10);
        let hash = payload_hash(&serde_json::json!({"content": "one"}));
        ledger
            .begin_idempotent("acct", "ingest", "key-1", &hash, QuotaKind::Event, 1)
            .unwrap();
        // Same key while pending: conflict
        let error = ledger
            .begin_idempotent("acct", "ingest", "key-1", &hash, QuotaKind::Event, 1)
            .unwrap_err();
        assert!(matches!(error, QuotaError::IdempotencyConflict(_)));
        // Release lets the retry through
        ledger
            .release_idempotent("acct", "ingest", "key-1", &hash)
            .unwrap();
        ledger
            .begin_idempotent("acct", "ingest", "key-1", &hash, QuotaKind::Event, 1)
            .unwrap();
    }

    #[test]
    fn test_rate_limited_reservation_rolls_back() {
        let (ledger, _dir) = ledger(1);
        ledger.consume("acct", QuotaKind::Event, 1).unwrap();
        let hash = payload_hash(&serde_json::json!({"content": "x"}));
        let error = ledger
            .begin_idempotent("acct", "ingest", "key-1", &hash, QuotaKind::Event, 1)
            .unwrap_err();
        assert!(matches!(error, QuotaError::RateLimited { .. }));
        // The reservation was rolled back with the failed debit, so a later
        // retry (after quota reset) would be treated as fresh, not in-flight.
        let guard_error = ledger
            .begin_idempotent("acct", "ingest", "key-1", &hash, QuotaKind::Event, 1)
            .unwrap_err();
        assert!(matches!(guard_error, QuotaError::RateLimited { .. }));
    }

    #[test]
    fn test_api_key_roundtrip() {
        let (ledger, _dir) = ledger(10);
        ledger
            .register_api_key("acct-7", "ci", "sk-test-token", &["memories:write".into()])
            .unwrap();
        let identity = ledger.verify_api_key("sk-test-token").unwrap().unwrap();
        assert_eq!(identity.account_key, "acct-7");
        assert_eq!(identity.scopes, vec!["memories:write".to_string()]);
        assert!(ledger.verify_api_key("sk-wrong").unwrap().is_none());
    }

    #[test]
    fn test_payload_hash_is_field_order_independent() {
        let a: serde_json::Value = serde_json::from_str(r#"{"a": 1, "b": 2}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"b": 2, "a": 1}"#).unwrap();
        assert_eq!(payload_hash(&a), payload_hash(&b));
    }
}
