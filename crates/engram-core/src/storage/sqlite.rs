//! SQLite Storage Manager
//!
//! Tenant-scoped persistence of memory records. Writes go through a single
//! writer connection with retry-on-contention; reads use a separate reader
//! connection when the database lives on disk. Content is normalized before
//! write: assistant responses are compacted (sentence-level dedup) and all
//! content is truncated per-intent with a visible omission marker.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection};
use uuid::Uuid;

use super::codec::{decode_vector, encode_vector};
use super::{apply_migrations, Result, StorageError};
use crate::encoding::cosine_similarity;
use crate::model::{EncodedEvent, MemoryRecord, StorageDecision, StorageTier};

const SELECT_COLUMNS: &str = "memory_id, account_key, event_id, content, summary, intent, \
     entities_json, relationships_json, raw_embedding, semantic_embedding, semantic_key, \
     created_at, updated_at, retrieval_count, avg_outcome_signal, outcome_count, \
     storage_tier, latest_importance, is_compressed, original_count";

/// Content-normalization and retry tunables for the storage manager
#[derive(Debug, Clone)]
pub struct StorageOptions {
    pub max_content_chars: usize,
    pub assistant_max_content_chars: usize,
    pub store_raw_embedding: bool,
    pub write_retry_attempts: u32,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            max_content_chars: 4000,
            assistant_max_content_chars: 900,
            store_raw_embedding: false,
            write_retry_attempts: 5,
        }
    }
}

/// SQLite-backed memory storage with embedding-based candidate search
pub struct StorageManager {
    writer: Mutex<Connection>,
    /// Absent for in-memory databases, which must share one connection
    reader: Option<Mutex<Connection>>,
    db_path: PathBuf,
    options: StorageOptions,
}

impl StorageManager {
    pub fn new(db_path: impl AsRef<Path>, options: StorageOptions) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let in_memory = path.as_os_str() == ":memory:";
        if !in_memory {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        let writer = Connection::open(&path)?;
        Self::configure_connection(&writer)?;
        apply_migrations(&writer)?;

        let reader = if in_memory {
            None
        } else {
            let conn = Connection::open(&path)?;
            Self::configure_connection(&conn)?;
            Some(Mutex::new(conn))
        };

        Ok(Self {
            writer: Mutex::new(writer),
            reader,
            db_path: path,
            options,
        })
    }

    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 30000;
             PRAGMA foreign_keys = ON;",
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Persist an encoded event under the decision's tier and confidence
    pub fn store(
        &self,
        encoded: &EncodedEvent,
        decision: &StorageDecision,
        account_key: &str,
    ) -> Result<MemoryRecord> {
        let account_key = normalize_account_key(account_key);
        let now = Utc::now();
        let intent = encoded.understanding.intent.clone();
        let content = self.normalize_content(&encoded.event.content, &intent);
        let raw_embedding = if self.options.store_raw_embedding {
            encoded.raw_embedding.clone()
        } else {
            Vec::new()
        };
        let record = MemoryRecord {
            memory_id: Uuid::new_v4().to_string(),
            account_key: account_key.clone(),
            event_id: encoded.event.event_id.clone(),
            content,
            summary: encoded.understanding.summary.clone(),
            intent,
            entities: encoded.understanding.entities.clone(),
            relationships: encoded.understanding.relationships.clone(),
            raw_embedding: if raw_embedding.is_empty() {
                encoded.semantic_embedding.clone()
            } else {
                raw_embedding.clone()
            },
            semantic_embedding: encoded.semantic_embedding.clone(),
            semantic_key: encoded.semantic_key.clone(),
            created_at: now,
            updated_at: now,
            retrieval_count: 0,
            avg_outcome_signal: 0.0,
            outcome_count: 0,
            storage_tier: decision.storage_tier,
            latest_importance: decision.confidence,
            is_compressed: decision.is_compressed,
            original_count: decision.original_count,
            decay_half_life_days: None,
        };

        self.execute_write(|conn| {
            conn.execute(
                "INSERT INTO memories (
                    memory_id, account_key, event_id, content, summary, intent,
                    entities_json, relationships_json, raw_embedding, semantic_embedding,
                    semantic_key, created_at, updated_at, retrieval_count,
                    avg_outcome_signal, outcome_count, storage_tier, latest_importance,
                    is_compressed, original_count
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                          ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
                params![
                    record.memory_id,
                    record.account_key,
                    record.event_id,
                    record.content,
                    record.summary,
                    record.intent,
                    dumps_compact(&record.entities),
                    dumps_compact(&record.relationships),
                    encode_vector(&raw_embedding),
                    encode_vector(&record.semantic_embedding),
                    record.semantic_key,
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                    record.retrieval_count,
                    record.avg_outcome_signal,
                    record.outcome_count,
                    record.storage_tier.as_str(),
                    record.latest_importance,
                    record.is_compressed as i64,
                    record.original_count,
                ],
            )?;
            Ok(())
        })?;
        Ok(record)
    }

    /// Increment the retrieval counter and touch `updated_at`
    pub fn update_retrieval(&self, memory_id: &str, account_key: Option<&str>) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let memory_id = memory_id.to_string();
        let account = account_key.map(normalize_account_key);
        self.execute_write(move |conn| {
            match &account {
                Some(account_key) => conn.execute(
                    "UPDATE memories
                     SET retrieval_count = retrieval_count + 1, updated_at = ?1
                     WHERE memory_id = ?2 AND account_key = ?3",
                    params![now, memory_id, account_key],
                )?,
                None => conn.execute(
                    "UPDATE memories
                     SET retrieval_count = retrieval_count + 1, updated_at = ?1
                     WHERE memory_id = ?2",
                    params![now, memory_id],
                )?,
            };
            Ok(())
        })
    }

    /// Fold a signed outcome signal into the running mean. Returns whether
    /// the memory existed.
    pub fn update_outcome(
        &self,
        memory_id: &str,
        outcome_signal: f64,
        account_key: Option<&str>,
    ) -> Result<bool> {
        let memory_id = memory_id.to_string();
        let account = account_key.map(normalize_account_key);
        self.execute_write(move |conn| {
            let row: Option<(f64, i64)> = match &account {
                Some(account_key) => conn
                    .query_row(
                        "SELECT avg_outcome_signal, outcome_count FROM memories
                         WHERE memory_id = ?1 AND account_key = ?2",
                        params![memory_id, account_key],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .map(Some)
                    .or_else(not_found_to_none)?,
                None => conn
                    .query_row(
                        "SELECT avg_outcome_signal, outcome_count FROM memories
                         WHERE memory_id = ?1",
                        params![memory_id],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .map(Some)
                    .or_else(not_found_to_none)?,
            };
            let Some((avg, count)) = row else {
                return Ok(false);
            };
            let new_count = count + 1;
            let new_avg = (avg * count as f64 + outcome_signal) / new_count as f64;
            conn.execute(
                "UPDATE memories
                 SET avg_outcome_signal = ?1, outcome_count = ?2, updated_at = ?3
                 WHERE memory_id = ?4",
                params![new_avg, new_count, Utc::now().to_rfc3339(), memory_id],
            )?;
            Ok(true)
        })
    }

    /// Delete a batch of memories, optionally tenant-scoped
    pub fn delete_memories(&self, memory_ids: &[String], account_key: Option<&str>) -> Result<()> {
        if memory_ids.is_empty() {
            return Ok(());
        }
        let ids = memory_ids.to_vec();
        let account = account_key.map(normalize_account_key);
        self.execute_write(move |conn| {
            let placeholders = placeholders(ids.len());
            match &account {
                Some(account_key) => {
                    let sql = format!(
                        "DELETE FROM memories WHERE account_key = ?1 AND memory_id IN ({placeholders})"
                    );
                    let mut values: Vec<String> = vec![account_key.clone()];
                    values.extend(ids.iter().cloned());
                    conn.execute(&sql, params_from_iter(values.iter()))?;
                }
                None => {
                    let sql = format!("DELETE FROM memories WHERE memory_id IN ({placeholders})");
                    conn.execute(&sql, params_from_iter(ids.iter()))?;
                }
            }
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn count_memories(&self, account_key: Option<&str>) -> Result<i64> {
        let guard = self.read_conn()?;
        let count = match account_key.map(normalize_account_key) {
            Some(account) => guard.query_row(
                "SELECT COUNT(*) FROM memories WHERE account_key = ?1",
                params![account],
                |row| row.get(0),
            )?,
            None => guard.query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))?,
        };
        Ok(count)
    }

    pub fn list_memories(
        &self,
        limit: Option<usize>,
        account_key: Option<&str>,
    ) -> Result<Vec<MemoryRecord>> {
        let guard = self.read_conn()?;
        let mut sql = format!("SELECT {SELECT_COLUMNS} FROM memories");
        let account = account_key.map(normalize_account_key);
        if account.is_some() {
            sql.push_str(" WHERE account_key = ?1");
        }
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        let mut stmt = guard.prepare(&sql)?;
        let rows = match &account {
            Some(account_key) => stmt.query_map(params![account_key], row_to_memory)?,
            None => stmt.query_map([], row_to_memory)?,
        };
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StorageError::from)
    }

    /// Distinct tenant keys present in storage
    pub fn list_account_keys(&self) -> Result<Vec<String>> {
        let guard = self.read_conn()?;
        let mut stmt = guard.prepare("SELECT DISTINCT account_key FROM memories")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StorageError::from)
    }

    pub fn fetch_by_ids(
        &self,
        memory_ids: &[String],
        account_key: Option<&str>,
    ) -> Result<Vec<MemoryRecord>> {
        if memory_ids.is_empty() {
            return Ok(Vec::new());
        }
        let guard = self.read_conn()?;
        let placeholders = placeholders(memory_ids.len());
        let account = account_key.map(normalize_account_key);
        let fetched = match &account {
            Some(account_key) => {
                let sql = format!(
                    "SELECT {SELECT_COLUMNS} FROM memories
                     WHERE account_key = ?1 AND memory_id IN ({placeholders})"
                );
                let mut values: Vec<String> = vec![account_key.clone()];
                values.extend(memory_ids.iter().cloned());
                let mut stmt = guard.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(values.iter()), row_to_memory)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let sql = format!(
                    "SELECT {SELECT_COLUMNS} FROM memories WHERE memory_id IN ({placeholders})"
                );
                let mut stmt = guard.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(memory_ids.iter()), row_to_memory)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        // Preserve the caller's id order; SQL IN gives no ordering guarantee
        let mut by_id: std::collections::HashMap<String, MemoryRecord> = fetched
            .into_iter()
            .map(|record| (record.memory_id.clone(), record))
            .collect();
        Ok(memory_ids
            .iter()
            .filter_map(|memory_id| by_id.remove(memory_id))
            .collect())
    }

    /// Memories matching the intent whose entity list contains the entity
    pub fn fetch_by_entity_and_intent(
        &self,
        entity_id: &str,
        intent: &str,
        since: Option<DateTime<Utc>>,
        account_key: Option<&str>,
    ) -> Result<Vec<MemoryRecord>> {
        let guard = self.read_conn()?;
        let mut sql = format!("SELECT {SELECT_COLUMNS} FROM memories WHERE intent = ?1");
        let mut values: Vec<String> = vec![intent.to_string()];
        if let Some(account) = account_key.map(normalize_account_key) {
            values.push(account);
            sql.push_str(&format!(" AND account_key = ?{}", values.len()));
        }
        if let Some(since) = since {
            values.push(since.to_rfc3339());
            sql.push_str(&format!(" AND created_at >= ?{}", values.len()));
        }
        let mut stmt = guard.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), row_to_memory)?;
        let records = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records
            .into_iter()
            .filter(|record| record.entities.iter().any(|entity| entity == entity_id))
            .collect())
    }

    /// In-process cosine scan used when the vector index has no answer
    pub fn search_candidates(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        account_key: Option<&str>,
    ) -> Result<Vec<MemoryRecord>> {
        let memories = self.list_memories(None, account_key)?;
        let mut scored: Vec<(MemoryRecord, f32)> = memories
            .into_iter()
            .filter(|memory| memory.semantic_embedding.len() == query_embedding.len())
            .map(|memory| {
                let score = cosine_similarity(query_embedding, &memory.semantic_embedding);
                (memory, score)
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored.into_iter().map(|(memory, _)| memory).collect())
    }

    /// Database file size in MB; zero for in-memory databases
    pub fn storage_usage_mb(&self) -> f64 {
        if self.db_path.as_os_str() == ":memory:" {
            return 0.0;
        }
        std::fs::metadata(&self.db_path)
            .map(|meta| meta.len() as f64 / (1024.0 * 1024.0))
            .unwrap_or(0.0)
    }

    /// Path of the backing database
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn read_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        let lock = self.reader.as_ref().unwrap_or(&self.writer);
        lock.lock().map_err(|_| StorageError::LockPoisoned)
    }

    /// Run a write op on the writer connection, retrying retryable lock
    /// failures with exponential backoff.
    fn execute_write<T>(&self, operation: impl Fn(&Connection) -> Result<T>) -> Result<T> {
        let attempts = self.options.write_retry_attempts.max(1);
        for attempt in 0..attempts {
            let guard = self.writer.lock().map_err(|_| StorageError::LockPoisoned)?;
            match operation(&guard) {
                Ok(value) => return Ok(value),
                Err(error) if is_retryable(&error) && attempt + 1 < attempts => {
                    drop(guard);
                    std::thread::sleep(Duration::from_millis(10 << attempt));
                }
                Err(error) => return Err(error),
            }
        }
        Err(StorageError::ContentionExhausted { attempts })
    }

    /// Compact (assistant intents) then truncate content per intent limits
    fn normalize_content(&self, content: &str, intent: &str) -> String {
        let assistant = intent.trim().to_lowercase().starts_with("assistant_");
        let normalized = if assistant {
            compact_assistant_content(content)
        } else {
            content.to_string()
        };
        let limit = if assistant {
            self.options.assistant_max_content_chars
        } else {
            self.options.max_content_chars
        };
        truncate_content(&normalized, limit)
    }
}

fn not_found_to_none<T>(error: rusqlite::Error) -> rusqlite::Result<Option<T>> {
    match error {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(other),
    }
}

fn is_retryable(error: &StorageError) -> bool {
    match error {
        StorageError::Database(rusqlite::Error::SqliteFailure(failure, _)) => matches!(
            failure.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}

fn placeholders(count: usize) -> String {
    (0..count).map(|_| "?").collect::<Vec<_>>().join(", ")
}

fn normalize_account_key(account_key: &str) -> String {
    let normalized = account_key.trim();
    if normalized.is_empty() {
        "default".to_string()
    } else {
        normalized.to_string()
    }
}

fn dumps_compact(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

/// Cut content at the limit with a visible marker recording omitted chars
fn truncate_content(content: &str, limit: usize) -> String {
    let total = content.chars().count();
    if total <= limit {
        return content.to_string();
    }
    if limit <= 64 {
        return content.chars().take(limit).collect();
    }
    let omitted = total - limit;
    let kept: String = content.chars().take(limit - 48).collect();
    format!(
        "{}\n\n...[truncated {omitted} chars for storage efficiency]",
        kept.trim_end()
    )
}

/// Whitespace-normalize and deduplicate repeated sentences in assistant
/// output. Only rewrites when the dedup removes a meaningful amount of text
/// (>= 80 chars or >= 2 repeated segments).
fn compact_assistant_content(content: &str) -> String {
    let normalized = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() {
        return normalized;
    }
    let sentences = split_sentences(&normalized);
    if sentences.len() <= 1 {
        return normalized;
    }

    let mut unique: Vec<&str> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut duplicates = 0usize;
    for sentence in &sentences {
        let key = sentence.to_lowercase();
        if seen.contains(&key) {
            duplicates += 1;
            continue;
        }
        seen.insert(key);
        unique.push(sentence);
    }
    if duplicates == 0 {
        return normalized;
    }
    let compacted = unique.join(" ");
    let removed = normalized.chars().count().saturating_sub(compacted.chars().count());
    if removed < 80 && duplicates < 2 {
        return normalized;
    }
    format!("{compacted} [assistant content compacted: removed {duplicates} repeated segments]")
}

/// Split on sentence-ending punctuation followed by whitespace
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let bytes = text.as_bytes();
    let mut start = 0usize;
    let mut index = 0usize;
    while index < bytes.len() {
        let byte = bytes[index];
        if (byte == b'.' || byte == b'!' || byte == b'?')
            && index + 1 < bytes.len()
            && bytes[index + 1].is_ascii_whitespace()
        {
            let sentence = text[start..=index].trim();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            start = index + 1;
        }
        index += 1;
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

fn row_to_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryRecord> {
    let semantic_embedding = decode_vector(&row.get::<_, String>(9)?);
    let mut raw_embedding = decode_vector(&row.get::<_, String>(8)?);
    if raw_embedding.is_empty() || raw_embedding.len() != semantic_embedding.len() {
        raw_embedding = semantic_embedding.clone();
    }
    let entities: Vec<String> =
        serde_json::from_str(&row.get::<_, String>(6)?).unwrap_or_default();
    let relationships: Vec<String> =
        serde_json::from_str(&row.get::<_, String>(7)?).unwrap_or_default();
    Ok(MemoryRecord {
        memory_id: row.get(0)?,
        account_key: row.get(1)?,
        event_id: row.get(2)?,
        content: row.get(3)?,
        summary: row.get(4)?,
        intent: row.get(5)?,
        entities,
        relationships,
        raw_embedding,
        semantic_embedding,
        semantic_key: row.get(10)?,
        created_at: parse_timestamp(&row.get::<_, String>(11)?),
        updated_at: parse_timestamp(&row.get::<_, String>(12)?),
        retrieval_count: row.get(13)?,
        avg_outcome_signal: row.get(14)?,
        outcome_count: row.get(15)?,
        storage_tier: StorageTier::parse_name(&row.get::<_, String>(16)?),
        latest_importance: row.get(17)?,
        is_compressed: row.get::<_, i64>(18)? != 0,
        original_count: row.get(19)?,
        decay_half_life_days: None,
    })
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::SemanticEncoder;
    use crate::model::{ContextMap, RawEvent};

    fn manager() -> StorageManager {
        StorageManager::new(":memory:", StorageOptions::default()).unwrap()
    }

    fn encoded(content: &str, intent: &str, entities: &[&str]) -> EncodedEvent {
        let encoder = SemanticEncoder::deterministic(16);
        let mut context = ContextMap::new();
        context.insert("intent".into(), serde_json::json!(intent));
        context.insert("entities".into(), serde_json::json!(entities));
        context.insert("summary".into(), serde_json::json!(content));
        let event = RawEvent::new(Utc::now(), content, context);
        encoder.encode_event(&event).unwrap()
    }

    fn store_decision() -> StorageDecision {
        StorageDecision {
            store: true,
            storage_tier: StorageTier::Persistent,
            confidence: 0.8,
            decay_rate: 0.01,
            decay_half_life: 69.3,
            should_compress: false,
            rationale: "test".into(),
            trace: Default::default(),
            is_compressed: false,
            original_count: 1,
        }
    }

    #[test]
    fn test_store_and_fetch_roundtrip() {
        let storage = manager();
        let record = storage
            .store(&encoded("alice asked about loops", "user_question", &["alice"]), &store_decision(), "tenant-a")
            .unwrap();
        let fetched = storage
            .fetch_by_ids(&[record.memory_id.clone()], Some("tenant-a"))
            .unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].account_key, "tenant-a");
        assert_eq!(fetched[0].semantic_key, record.semantic_key);
        // Raw embedding falls back to semantic when not stored
        assert_eq!(fetched[0].raw_embedding, fetched[0].semantic_embedding);
    }

    #[test]
    fn test_tenant_isolation() {
        let storage = manager();
        let record = storage
            .store(&encoded("a-only", "user_fact", &["alice"]), &store_decision(), "tenant-a")
            .unwrap();
        storage
            .store(&encoded("b-only", "user_fact", &["bob"]), &store_decision(), "tenant-b")
            .unwrap();

        assert_eq!(storage.count_memories(Some("tenant-a")).unwrap(), 1);
        assert_eq!(storage.count_memories(Some("tenant-b")).unwrap(), 1);
        assert_eq!(storage.count_memories(None).unwrap(), 2);
        assert!(storage
            .fetch_by_ids(&[record.memory_id.clone()], Some("tenant-b"))
            .unwrap()
            .is_empty());
        let listed = storage.list_memories(None, Some("tenant-b")).unwrap();
        assert!(listed.iter().all(|memory| memory.account_key == "tenant-b"));
    }

    #[test]
    fn test_empty_account_normalizes_to_default() {
        let storage = manager();
        let record = storage
            .store(&encoded("content", "user_fact", &[]), &store_decision(), "  ")
            .unwrap();
        assert_eq!(record.account_key, "default");
        assert_eq!(storage.count_memories(Some("default")).unwrap(), 1);
    }

    #[test]
    fn test_outcome_running_mean() {
        let storage = manager();
        let record = storage
            .store(&encoded("content", "user_fact", &[]), &store_decision(), "t")
            .unwrap();
        assert!(storage.update_outcome(&record.memory_id, 1.0, Some("t")).unwrap());
        assert!(storage.update_outcome(&record.memory_id, -1.0, Some("t")).unwrap());
        assert!(storage.update_outcome(&record.memory_id, 1.0, Some("t")).unwrap());
        let fetched = storage
            .fetch_by_ids(&[record.memory_id.clone()], Some("t"))
            .unwrap();
        assert_eq!(fetched[0].outcome_count, 3);
        assert!((fetched[0].avg_outcome_signal - (1.0 / 3.0)).abs() < 1e-9);
        assert!(!storage.update_outcome("missing", 1.0, Some("t")).unwrap());
    }

    #[test]
    fn test_truncation_marker() {
        let long = "x".repeat(5000);
        let truncated = truncate_content(&long, 4000);
        assert!(truncated.contains("...[truncated 1000 chars for storage efficiency]"));
        assert_eq!(truncate_content("short", 4000), "short");
        // Tiny limits cut without a marker
        assert_eq!(truncate_content(&long, 10).len(), 10);
    }

    #[test]
    fn test_assistant_compaction_removes_repeats() {
        let repeated =
            "Use a for loop here. Use a for loop here. Use a for loop here. Then return the sum. \
             Then return the sum. Always check bounds before indexing into the collection please."
                .to_string();
        let compacted = compact_assistant_content(&repeated);
        assert!(compacted.contains("[assistant content compacted: removed 3 repeated segments]"));
        assert!(compacted.matches("Use a for loop here.").count() == 1);
    }

    #[test]
    fn test_assistant_compaction_skips_small_wins() {
        let text = "One. One.";
        // A single short duplicate is left alone
        assert_eq!(compact_assistant_content(text), "One. One.");
        let unique = "First sentence. Second sentence.";
        assert_eq!(compact_assistant_content(unique), unique);
    }

    #[test]
    fn test_fetch_by_entity_and_intent_window() {
        let storage = manager();
        storage
            .store(&encoded("q1", "user_question", &["alice"]), &store_decision(), "t")
            .unwrap();
        storage
            .store(&encoded("q2", "user_question", &["alice"]), &store_decision(), "t")
            .unwrap();
        storage
            .store(&encoded("other", "user_question", &["bob"]), &store_decision(), "t")
            .unwrap();

        let hits = storage
            .fetch_by_entity_and_intent(
                "alice",
                "user_question",
                Some(Utc::now() - chrono::Duration::days(1)),
                Some("t"),
            )
            .unwrap();
        assert_eq!(hits.len(), 2);

        let future = storage
            .fetch_by_entity_and_intent(
                "alice",
                "user_question",
                Some(Utc::now() + chrono::Duration::days(1)),
                Some("t"),
            )
            .unwrap();
        assert!(future.is_empty());
    }

    #[test]
    fn test_search_candidates_orders_by_similarity() {
        let storage = manager();
        let near = storage
            .store(&encoded("python loops question", "user_question", &["alice"]), &store_decision(), "t")
            .unwrap();
        storage
            .store(&encoded("completely unrelated cooking recipe", "user_fact", &["bob"]), &store_decision(), "t")
            .unwrap();

        let hits = storage
            .search_candidates(&near.semantic_embedding, 1, Some("t"))
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].memory_id, near.memory_id);
    }

    #[test]
    fn test_delete_memories_scoped() {
        let storage = manager();
        let record = storage
            .store(&encoded("content", "user_fact", &[]), &store_decision(), "t")
            .unwrap();
        // Wrong tenant deletes nothing
        storage
            .delete_memories(&[record.memory_id.clone()], Some("other"))
            .unwrap();
        assert_eq!(storage.count_memories(Some("t")).unwrap(), 1);
        storage
            .delete_memories(&[record.memory_id.clone()], Some("t"))
            .unwrap();
        assert_eq!(storage.count_memories(Some("t")).unwrap(), 0);
    }

    #[test]
    fn test_fetch_preserves_requested_order() {
        let storage = manager();
        let first = storage
            .store(&encoded("first", "user_fact", &[]), &store_decision(), "t")
            .unwrap();
        let second = storage
            .store(&encoded("second", "user_fact", &[]), &store_decision(), "t")
            .unwrap();
        let fetched = storage
            .fetch_by_ids(
                &[second.memory_id.clone(), first.memory_id.clone()],
                Some("t"),
            )
            .unwrap();
        assert_eq!(fetched[0].memory_id, second.memory_id);
        assert_eq!(fetched[1].memory_id, first.memory_id);
    }
}
