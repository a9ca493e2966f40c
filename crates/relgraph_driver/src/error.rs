//! Error types for relational drivers.

use thiserror::Error;

/// Result type for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

/// Errors reported by a relational driver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// The store rejected a statement.
    #[error("statement failed: {message} [{sql}]")]
    Statement {
        /// SQL text of the failing statement.
        sql: String,
        /// Store message.
        message: String,
    },

    /// Transaction control failed.
    #[error("transaction error: {message}")]
    Transaction {
        /// Description of the failure.
        message: String,
    },

    /// Commit or rollback without an open transaction.
    #[error("no transaction in progress")]
    NoTransaction,

    /// Large-object handle failure.
    #[error("large object error: {message}")]
    Lob {
        /// Description of the failure.
        message: String,
    },

    /// Connection lost.
    #[error("connection closed")]
    Closed,
}

impl DriverError {
    /// Create a statement error.
    pub fn statement(sql: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Statement {
            sql: sql.into(),
            message: message.into(),
        }
    }

    /// Create a transaction error.
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
        }
    }

    /// Create a large-object error.
    pub fn lob(message: impl Into<String>) -> Self {
        Self::Lob {
            message: message.into(),
        }
    }
}
