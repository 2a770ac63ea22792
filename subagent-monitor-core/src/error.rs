//! Error types for subagent-monitor-core

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the subagent-monitor-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Registry lock could not be acquired within the configured bound
    #[error("timed out after {waited_ms}ms waiting for lock {}", path.display())]
    LockTimeout { path: PathBuf, waited_ms: u64 },

    /// Invocation record not found in the persistence layer
    #[error("invocation record not found: {0}")]
    InvocationNotFound(i64),
}

/// Result type alias for subagent-monitor-core
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_timeout_names_path_and_wait() {
        let err = Error::LockTimeout {
            path: PathBuf::from("/tmp/registry.json.lock"),
            waited_ms: 250,
        };
        assert_eq!(
            err.to_string(),
            "timed out after 250ms waiting for lock /tmp/registry.json.lock"
        );
    }

    #[test]
    fn test_storage_errors_convert() {
        let err: Error = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, Error::Database(_)));
        let err: Error = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
        assert!(matches!(err, Error::Json(_)));
    }
}
