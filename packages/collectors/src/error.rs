//! Typed errors for the collectors library.
//!
//! Uses `thiserror` for library errors (not `anyhow`) so the job engine can
//! tell adapter failures apart from storage failures.

use thiserror::Error;

/// Errors raised by source adapters while authenticating or collecting.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Credentials were rejected or missing
    #[error("authentication failed for {source_name}: {reason}")]
    Authentication { source_name: String, reason: String },

    /// The upstream platform returned an error mid-collection
    #[error("collection failed: {0}")]
    Collection(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Upstream rate limit hit
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// The adapter does not implement the requested capability
    #[error("{source_name} does not support {operation}")]
    Unsupported {
        source_name: String,
        operation: &'static str,
    },
}

impl SourceError {
    /// Wrap any displayable failure as a collection error.
    pub fn collection(message: impl Into<String>) -> Self {
        SourceError::Collection(message.into().into())
    }
}

/// Errors raised by storage adapters.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The batch could not be written; nothing from it was committed
    #[error("save failed: {0}")]
    Save(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Reading items back failed
    #[error("query failed: {0}")]
    Query(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The storage was used after `close`
    #[error("storage {0} is closed")]
    Closed(String),
}

/// Result type alias for source operations.
pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// Result type alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        StorageError::Save(Box::new(e))
    }
}
