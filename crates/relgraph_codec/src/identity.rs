//! Entity identity.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Process-unique token backing a temporary identity.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TempToken([u8; 16]);

impl TempToken {
    /// Creates a new random token.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().into_bytes())
    }

    /// Creates a token from raw bytes.
    #[inline]
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl Default for TempToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TempToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TempToken({})", Uuid::from_bytes(self.0))
    }
}

/// Key part of an [`Identity`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IdentityKey {
    /// Assigned before the first commit; never equal across distinct tokens.
    Temporary(TempToken),
    /// Primary key column → value. The map is sorted, so equality and
    /// hashing do not depend on the order the key was built in.
    Permanent(BTreeMap<String, Value>),
}

/// Immutable identity of one logical persisted entity.
///
/// Identities are either permanent (entity name plus primary key values) or
/// temporary (entity name plus a [`TempToken`]) until their first commit.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity {
    entity: String,
    key: IdentityKey,
}

impl Identity {
    /// Creates a permanent identity from primary key column/value pairs.
    pub fn permanent<K, V>(entity: impl Into<String>, key: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        Self {
            entity: entity.into(),
            key: IdentityKey::Permanent(
                key.into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }

    /// Creates a permanent identity with a single key column.
    pub fn single(entity: impl Into<String>, column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::permanent(entity, [(column.into(), value.into())])
    }

    /// Creates a fresh temporary identity.
    pub fn temporary(entity: impl Into<String>) -> Self {
        Self::with_token(entity, TempToken::new())
    }

    /// Creates a temporary identity from a known token.
    pub fn with_token(entity: impl Into<String>, token: TempToken) -> Self {
        Self {
            entity: entity.into(),
            key: IdentityKey::Temporary(token),
        }
    }

    /// Returns the entity name.
    #[must_use]
    pub fn entity_name(&self) -> &str {
        &self.entity
    }

    /// Returns the key part.
    #[must_use]
    pub fn key(&self) -> &IdentityKey {
        &self.key
    }

    /// Returns true if this identity has not been persisted yet.
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        matches!(self.key, IdentityKey::Temporary(_))
    }

    /// Returns the primary key map of a permanent identity.
    #[must_use]
    pub fn key_values(&self) -> Option<&BTreeMap<String, Value>> {
        match &self.key {
            IdentityKey::Permanent(map) => Some(map),
            IdentityKey::Temporary(_) => None,
        }
    }

    /// Returns the value of a single-column permanent key.
    ///
    /// Returns `None` for temporary identities and for composite keys.
    #[must_use]
    pub fn single_key_value(&self) -> Option<&Value> {
        match self.key_values() {
            Some(map) if map.len() == 1 => map.values().next(),
            _ => None,
        }
    }

    /// Returns the value of one key column.
    #[must_use]
    pub fn key_value(&self, column: &str) -> Option<&Value> {
        self.key_values().and_then(|map| map.get(column))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            IdentityKey::Temporary(token) => {
                write!(f, "{}<tmp:{}>", self.entity, Uuid::from_bytes(*token.as_bytes()))
            }
            IdentityKey::Permanent(map) => {
                write!(f, "{}{{", self.entity)?;
                for (i, (column, value)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{column}={value}")?;
                }
                f.write_str("}")
            }
        }
    }
}
