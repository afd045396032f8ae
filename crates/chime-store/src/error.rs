//! Error types for the SQLite store.

use chime_scheduler::{StoreError, TaskId};
use thiserror::Error;

/// Errors raised by [`crate::SqliteTaskStore`].
#[derive(Debug, Error)]
pub enum SqliteStoreError {
    /// SQLite error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A task with this uuid already exists.
    #[error("task already exists: {0}")]
    Duplicate(String),

    /// No task with this id.
    #[error("task not found: {0}")]
    NotFound(TaskId),

    /// A previous holder of the connection panicked.
    #[error("database connection poisoned")]
    Poisoned,

    /// The blocking worker running a query failed.
    #[error("database worker failed: {0}")]
    Worker(String),
}

impl From<SqliteStoreError> for StoreError {
    fn from(err: SqliteStoreError) -> Self {
        match err {
            SqliteStoreError::Duplicate(uuid) => StoreError::Duplicate(uuid),
            SqliteStoreError::NotFound(id) => StoreError::NotFound(id),
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}
