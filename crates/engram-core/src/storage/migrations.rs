//! Database Migrations
//!
//! Schema migration definitions for the storage layer.

/// Migration definitions
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Memories table with tenant scoping and learning aggregates",
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        description: "Per-account usage counters and idempotency reservations",
        up: MIGRATION_V2_UP,
    },
    Migration {
        version: 3,
        description: "Opaque API keys checked by digest",
        up: MIGRATION_V3_UP,
    },
];

/// A database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number
    pub version: u32,
    /// Description
    pub description: &'static str,
    /// SQL to apply
    pub up: &'static str,
}

/// V1: Memories
const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS memories (
    memory_id TEXT PRIMARY KEY,
    account_key TEXT NOT NULL DEFAULT 'default',
    event_id TEXT NOT NULL,
    content TEXT NOT NULL,
    summary TEXT NOT NULL,
    intent TEXT NOT NULL,
    entities_json TEXT NOT NULL,
    relationships_json TEXT NOT NULL,
    raw_embedding TEXT NOT NULL,
    semantic_embedding TEXT NOT NULL,
    semantic_key TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    retrieval_count INTEGER NOT NULL DEFAULT 0,
    avg_outcome_signal REAL NOT NULL DEFAULT 0.0,
    outcome_count INTEGER NOT NULL DEFAULT 0,
    storage_tier TEXT NOT NULL,
    latest_importance REAL NOT NULL,
    is_compressed INTEGER NOT NULL DEFAULT 0,
    original_count INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_memories_account ON memories(account_key);
CREATE INDEX IF NOT EXISTS idx_memories_semantic_key ON memories(semantic_key);
CREATE INDEX IF NOT EXISTS idx_memories_intent ON memories(intent);
CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(created_at);

INSERT INTO schema_version (version, applied_at) VALUES (1, datetime('now'));
"#;

/// V2: API state, quota counters and idempotency reservations
const MIGRATION_V2_UP: &str = r#"
CREATE TABLE IF NOT EXISTS api_account_usage (
    account_key TEXT PRIMARY KEY,
    day_bucket TEXT NOT NULL,
    month_year INTEGER NOT NULL,
    month_value INTEGER NOT NULL,
    events_today INTEGER NOT NULL DEFAULT 0,
    queries_today INTEGER NOT NULL DEFAULT 0,
    events_month INTEGER NOT NULL DEFAULT 0,
    queries_month INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS api_idempotency (
    account_key TEXT NOT NULL,
    operation TEXT NOT NULL,
    idempotency_key TEXT NOT NULL,
    request_hash TEXT NOT NULL,
    response_json TEXT,
    status_code INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (account_key, operation, idempotency_key)
);

UPDATE schema_version SET version = 2, applied_at = datetime('now');
"#;

/// V3: Opaque API keys, stored as sha256 digests only
const MIGRATION_V3_UP: &str = r#"
CREATE TABLE IF NOT EXISTS api_keys (
    key_id TEXT PRIMARY KEY,
    account_key TEXT NOT NULL,
    name TEXT NOT NULL,
    key_digest TEXT NOT NULL UNIQUE,
    scopes_json TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL DEFAULT 'active',
    created_at TEXT NOT NULL,
    last_used_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_api_keys_account ON api_keys(account_key);

UPDATE schema_version SET version = 3, applied_at = datetime('now');
"#;

/// Get current schema version from database
pub fn get_current_version(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .or(Ok(0))
}

/// Apply pending migrations
pub fn apply_migrations(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL,
            applied_at TEXT NOT NULL
        );",
    )?;
    let current_version = get_current_version(conn)?;
    let mut applied = 0;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                "Applying migration v{}: {}",
                migration.version,
                migration.description
            );
            conn.execute_batch(migration.up)?;
            applied += 1;
        }
    }

    Ok(applied)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_apply_once() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let applied = apply_migrations(&conn).unwrap();
        assert_eq!(applied as usize, MIGRATIONS.len());
        assert_eq!(
            get_current_version(&conn).unwrap(),
            MIGRATIONS.last().unwrap().version
        );

        // Re-applying is a no-op
        assert_eq!(apply_migrations(&conn).unwrap(), 0);
    }

    #[test]
    fn test_versions_are_strictly_increasing() {
        let mut previous = 0;
        for migration in MIGRATIONS {
            assert!(migration.version > previous);
            previous = migration.version;
        }
    }
}
