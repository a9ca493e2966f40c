//! Error types for the schema model.

use thiserror::Error;

/// Result type for schema operations.
pub type SchemaResult<T> = Result<T, SchemaError>;

/// Errors raised while building or querying a schema.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// No entity with this name.
    #[error("unknown entity: {name}")]
    UnknownEntity {
        /// Entity name that was looked up.
        name: String,
    },

    /// No attribute with this name on the entity.
    #[error("unknown attribute '{name}' on entity {entity}")]
    UnknownAttribute {
        /// Owning entity.
        entity: String,
        /// Attribute name that was looked up.
        name: String,
    },

    /// No relationship with this name on the entity.
    #[error("unknown relationship '{name}' on entity {entity}")]
    UnknownRelationship {
        /// Owning entity.
        entity: String,
        /// Relationship name that was looked up.
        name: String,
    },

    /// Entity definition is malformed.
    #[error("invalid entity {name}: {message}")]
    InvalidEntity {
        /// Entity name.
        name: String,
        /// What is wrong with it.
        message: String,
    },

    /// Relationship definition is malformed.
    #[error("invalid relationship {entity}.{name}: {message}")]
    InvalidRelationship {
        /// Owning entity.
        entity: String,
        /// Relationship name.
        name: String,
        /// What is wrong with it.
        message: String,
    },

    /// Two entities share a name.
    #[error("duplicate entity: {name}")]
    DuplicateEntity {
        /// The duplicated name.
        name: String,
    },

    /// Foreign-key dependencies form a cycle.
    #[error("cyclic dependency between entities: {}", entities.join(", "))]
    CyclicDependency {
        /// Entities on the cycle.
        entities: Vec<String>,
    },

    /// Schema document could not be parsed.
    #[error("schema parse error: {message}")]
    Parse {
        /// Parser message.
        message: String,
    },
}

impl SchemaError {
    /// Create an unknown entity error.
    pub fn unknown_entity(name: impl Into<String>) -> Self {
        Self::UnknownEntity { name: name.into() }
    }

    /// Create an invalid entity error.
    pub fn invalid_entity(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidEntity {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create an invalid relationship error.
    pub fn invalid_relationship(
        entity: impl Into<String>,
        name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidRelationship {
            entity: entity.into(),
            name: name.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for SchemaError {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse {
            message: e.to_string(),
        }
    }
}
