//! Error types for the local store.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the local store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Underlying SQLite error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Schema migration failed.
    #[error("migration to version {version} failed: {message}")]
    Migration {
        /// Target schema version.
        version: i32,
        /// Failure detail.
        message: String,
    },

    /// A row referenced by id does not exist.
    #[error("{table} row {id} not found")]
    RowNotFound {
        /// Table name.
        table: &'static str,
        /// Row id.
        id: i64,
    },

    /// Stored JSON could not be decoded.
    #[error("corrupt stored value: {0}")]
    Corrupt(String),
}
