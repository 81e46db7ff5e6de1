use thiserror::Error;

/// Errors from execution store operations (used by trait definitions in businessflow-core).
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("database connection error: {0}")]
    Connection(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Whether retrying the same write may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Connection(_) => true,
            StorageError::Query(msg) => {
                let msg = msg.to_ascii_lowercase();
                msg.contains("locked") || msg.contains("busy") || msg.contains("timed out")
            }
            StorageError::NotFound | StorageError::Conflict(_) | StorageError::Serialization(_) => {
                false
            }
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StorageError::Connection("refused".into()).is_transient());
        assert!(StorageError::Query("database is locked".into()).is_transient());
        assert!(!StorageError::Query("no such table: runs".into()).is_transient());
        assert!(!StorageError::Conflict("dup".into()).is_transient());
        assert!(!StorageError::NotFound.is_transient());
    }
}
