//! Error types for relgraph core.

use crate::state::PersistenceState;
use relgraph_codec::{CodecError, Identity};
use relgraph_driver::DriverError;
use relgraph_schema::SchemaError;
use relgraph_sync_protocol::{ContextId, ProtocolError};
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in relgraph core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Schema lookup or validation error.
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    /// Driver error outside a commit.
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    /// Event protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// CBOR codec error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// I/O error, such as failing to start the dispatcher thread.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The object belongs to another context.
    #[error("{object} is already tracked by {owner}")]
    AlreadyTrackedElsewhere {
        /// The object, by identity or entity name.
        object: String,
        /// Context that owns it.
        owner: ContextId,
    },

    /// Operation not allowed in the object's current state.
    #[error("cannot {operation} {object} in state {state}")]
    InvalidStateTransition {
        /// The object, by identity or entity name.
        object: String,
        /// Current state.
        state: PersistenceState,
        /// Attempted operation.
        operation: String,
    },

    /// A query path does not resolve against the schema.
    #[error("invalid path '{path}': {message}")]
    InvalidPath {
        /// The path as written.
        path: String,
        /// What went wrong.
        message: String,
    },

    /// A path ends in a relationship whose key cannot be compared.
    #[error("invalid terminal relationship in '{path}': {message}")]
    InvalidTerminalRelationship {
        /// The path as written.
        path: String,
        /// What went wrong.
        message: String,
    },

    /// An object with a multi-column key was used as a query parameter.
    #[error("object {identity} has a composite key and cannot be a query parameter")]
    UnsupportedCompositeKeyParameter {
        /// Identity of the parameter object.
        identity: Identity,
    },

    /// A query parameter is not usable.
    #[error("invalid query parameter: {message}")]
    InvalidParameter {
        /// What went wrong.
        message: String,
    },

    /// An expression cannot be translated.
    #[error("invalid expression: {message}")]
    InvalidExpression {
        /// What went wrong.
        message: String,
    },

    /// A new object has no key and none can be generated.
    #[error("missing primary key for {entity}: {message}")]
    MissingPrimaryKey {
        /// Entity name.
        entity: String,
        /// What went wrong.
        message: String,
    },

    /// Commit order cannot be established.
    #[error("cyclic dependency between entities: {}", entities.join(", "))]
    CyclicDependency {
        /// Entities on the cycle.
        entities: Vec<String>,
    },

    /// A deny delete rule blocked a delete.
    #[error("cannot delete {identity}: relationship '{relationship}' is not empty")]
    DeleteDenied {
        /// Object being deleted.
        identity: String,
        /// Relationship with the deny rule.
        relationship: String,
    },

    /// A hollow object's row no longer exists.
    #[error("no row found for {identity}")]
    FaultFailure {
        /// The hollow object's identity.
        identity: Identity,
    },

    /// A commit statement failed; the transaction was rolled back.
    #[error("commit failed at batch {batch} ({entity}): {source}")]
    CommitFailed {
        /// Index of the failing batch.
        batch: usize,
        /// Entity of the failing batch.
        entity: String,
        /// Driver cause.
        #[source]
        source: DriverError,
    },

    /// The store transaction could not be committed.
    #[error("transaction commit failed: {source}")]
    TransactionFailed {
        /// Driver cause.
        #[source]
        source: DriverError,
    },

    /// An UPDATE or DELETE qualified on locking columns matched no row.
    #[error("optimistic lock failure at batch {batch} for {identity}")]
    OptimisticLockFailure {
        /// Index of the failing batch.
        batch: usize,
        /// Object whose row changed underneath.
        identity: Identity,
    },
}

impl CoreError {
    /// Returns true if resubmitting the operation may succeed.
    ///
    /// Only commit failures are retryable: the context keeps every pending
    /// change, so the commit can simply be called again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CommitFailed { .. }
                | Self::TransactionFailed { .. }
                | Self::OptimisticLockFailure { .. }
        )
    }

    /// Create an invalid state transition error.
    pub fn invalid_state(
        object: impl ToString,
        state: PersistenceState,
        operation: impl Into<String>,
    ) -> Self {
        Self::InvalidStateTransition {
            object: object.to_string(),
            state,
            operation: operation.into(),
        }
    }

    /// Create an invalid path error.
    pub fn invalid_path(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create an invalid parameter error.
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    /// Create an invalid expression error.
    pub fn invalid_expression(message: impl Into<String>) -> Self {
        Self::InvalidExpression {
            message: message.into(),
        }
    }

    /// Lift a schema sort failure into a commit planning error.
    pub(crate) fn from_sort(error: SchemaError) -> Self {
        match error {
            SchemaError::CyclicDependency { entities } => Self::CyclicDependency { entities },
            other => Self::Schema(other),
        }
    }
}
