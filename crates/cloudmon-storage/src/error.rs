/// Errors that can occur within the storage layer.
///
/// # Examples
///
/// ```rust
/// use cloudmon_storage::error::StorageError;
///
/// let err = StorageError::InvalidRecord("duplicate aws resource id x".to_string());
/// assert!(err.to_string().starts_with("Storage:"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A record batch violated the snapshot invariants and nothing was written.
    #[error("Storage: invalid record batch: {0}")]
    InvalidRecord(String),

    /// An underlying SQLite error.
    #[error("Storage: SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Record (de)serialization failure on the `record_json` column.
    #[error("Storage: JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage: {0}")]
    Other(String),
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Other(e.to_string())
    }
}

/// Convenience `Result` alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
