//! Relational Storage
//!
//! Tenant-scoped persistence of memories over SQLite, with versioned
//! migrations and a compact float16 codec for embedding columns.

mod codec;
mod migrations;
mod sqlite;

pub use codec::{decode_vector, encode_vector};
pub use migrations::{apply_migrations, get_current_version, MIGRATIONS};
pub use sqlite::{StorageManager, StorageOptions};

/// Storage error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed persisted payload
    #[error("codec error: {0}")]
    Codec(String),
    /// A lock guarding a connection was poisoned
    #[error("storage lock poisoned")]
    LockPoisoned,
    /// Retryable contention that survived every retry attempt
    #[error("storage contention persisted after {attempts} attempts")]
    ContentionExhausted { attempts: u32 },
}

/// Storage result type
pub type Result<T> = std::result::Result<T, StorageError>;
