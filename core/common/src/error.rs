//! Common error types for offsync.

use thiserror::Error;

/// Top-level error type for reconciliation operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The underlying SQLite database reported a failure.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// No record store is registered under the table name.
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    /// The conflict has already been resolved.
    #[error("Conflict already resolved: {0}")]
    AlreadyResolved(String),

    /// A queue item status change that the state machine does not allow.
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// A record store rejected or failed a write.
    #[error("Adapter error: {0}")]
    Adapter(String),

    /// A unit of work exceeded its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Internal failure (poisoned lock, lost worker task).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error says the referenced thing does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = Error::UnknownTable("kennel".to_string());
        assert_eq!(err.to_string(), "Unknown table: kennel");

        let err = Error::InvalidTransition {
            from: "completed".to_string(),
            to: "pending".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid status transition: completed -> pending");
    }

    #[test]
    fn test_database_error_conversion() {
        let err: Error = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, Error::Database(_)));
        assert!(!err.is_not_found());
        assert!(Error::NotFound("x".to_string()).is_not_found());
    }
}
