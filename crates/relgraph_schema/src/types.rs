//! Column types and delete rules.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Declared type of a mapped column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    /// 32-bit integer.
    Integer,
    /// 64-bit integer.
    BigInt,
    /// Exact numeric.
    Decimal,
    /// Boolean.
    Boolean,
    /// Fixed-length character.
    Char,
    /// Variable-length character.
    VarChar,
    /// Calendar date.
    Date,
    /// Date and time.
    Timestamp,
    /// Short binary.
    VarBinary,
    /// Binary large object.
    Blob,
    /// Character large object.
    Clob,
    /// National character large object.
    NClob,
    /// Long binary.
    LongVarBinary,
    /// Long character.
    LongVarChar,
    /// Long national character.
    LongNVarChar,
}

impl ColumnType {
    /// Returns true for large-object types.
    ///
    /// Large-object columns cannot appear in a `SELECT DISTINCT` and are
    /// written in two phases when the context is configured for it.
    #[must_use]
    pub const fn is_lob(self) -> bool {
        matches!(
            self,
            Self::Blob
                | Self::Clob
                | Self::NClob
                | Self::LongVarBinary
                | Self::LongVarChar
                | Self::LongNVarChar
        )
    }

    /// Returns true for character large objects.
    #[must_use]
    pub const fn is_character_lob(self) -> bool {
        matches!(
            self,
            Self::Clob | Self::NClob | Self::LongVarChar | Self::LongNVarChar
        )
    }

    /// Returns true if values of this type can be produced by a sequence.
    #[must_use]
    pub const fn is_integral(self) -> bool {
        matches!(self, Self::Integer | Self::BigInt)
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Integer => "INTEGER",
            Self::BigInt => "BIGINT",
            Self::Decimal => "DECIMAL",
            Self::Boolean => "BOOLEAN",
            Self::Char => "CHAR",
            Self::VarChar => "VARCHAR",
            Self::Date => "DATE",
            Self::Timestamp => "TIMESTAMP",
            Self::VarBinary => "VARBINARY",
            Self::Blob => "BLOB",
            Self::Clob => "CLOB",
            Self::NClob => "NCLOB",
            Self::LongVarBinary => "LONGVARBINARY",
            Self::LongVarChar => "LONGVARCHAR",
            Self::LongNVarChar => "LONGNVARCHAR",
        };
        f.write_str(name)
    }
}

/// What happens to related objects when the source object is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DeleteRule {
    /// Leave related objects alone.
    NoAction,
    /// Unlink the reverse side of the relationship.
    #[default]
    Nullify,
    /// Delete related objects too.
    Cascade,
    /// Refuse to delete while related objects exist.
    Deny,
}
