//! Graph-diff events.

use crate::error::{ProtocolError, ProtocolResult};
use relgraph_codec::{from_cbor, to_cbor, Identity, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Protocol version written in front of every encoded event.
pub const PROTOCOL_VERSION: u16 = 1;

/// Identifies one context on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContextId(u64);

impl ContextId {
    /// Wraps a raw id.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw id.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// Kind of committed row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    /// Row inserted.
    Insert,
    /// Row updated.
    Update,
    /// Row deleted.
    Delete,
}

impl ChangeKind {
    /// Converts to a code.
    #[must_use]
    pub fn to_code(self) -> u8 {
        match self {
            ChangeKind::Insert => 1,
            ChangeKind::Update => 2,
            ChangeKind::Delete => 3,
        }
    }

    /// Converts from a code.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ChangeKind::Insert),
            2 => Some(ChangeKind::Update),
            3 => Some(ChangeKind::Delete),
            _ => None,
        }
    }
}

/// One committed object change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectChange {
    /// Permanent identity of the row.
    pub identity: Identity,
    /// What happened to it.
    pub kind: ChangeKind,
    /// Full post-commit row for inserts and updates.
    pub snapshot: Option<BTreeMap<String, Value>>,
    /// Columns written by the commit.
    pub changed_columns: Vec<String>,
}

impl ObjectChange {
    /// Creates an insert change.
    pub fn insert(identity: Identity, snapshot: BTreeMap<String, Value>) -> Self {
        let changed_columns = snapshot.keys().cloned().collect();
        Self {
            identity,
            kind: ChangeKind::Insert,
            snapshot: Some(snapshot),
            changed_columns,
        }
    }

    /// Creates an update change.
    pub fn update(
        identity: Identity,
        snapshot: BTreeMap<String, Value>,
        changed_columns: Vec<String>,
    ) -> Self {
        Self {
            identity,
            kind: ChangeKind::Update,
            snapshot: Some(snapshot),
            changed_columns,
        }
    }

    /// Creates a delete change.
    pub fn delete(identity: Identity) -> Self {
        Self {
            identity,
            kind: ChangeKind::Delete,
            snapshot: None,
            changed_columns: Vec::new(),
        }
    }
}

/// Direction of a to-many membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArcOp {
    /// Target joined the collection.
    Add,
    /// Target left the collection.
    Remove,
}

/// A committed to-many membership change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArcChange {
    /// Owner of the collection.
    pub source: Identity,
    /// To-many relationship name on the owner.
    pub relationship: String,
    /// Member added or removed.
    pub target: Identity,
    /// Direction.
    pub op: ArcOp,
}

/// The committed subset of one context's change-set.
///
/// Events are built by the committing context, stamped with a sequence by
/// the channel and never mutated after publication. They only ever carry
/// permanent identities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphDiffEvent {
    /// Committing context.
    pub source: ContextId,
    /// Channel sequence, assigned on publication.
    pub sequence: u64,
    /// Row changes in batch order.
    pub changes: Vec<ObjectChange>,
    /// To-many membership changes.
    pub arcs: Vec<ArcChange>,
    /// Identities whose cached state peers should drop.
    pub invalidated: Vec<Identity>,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    version: u16,
    event: GraphDiffEvent,
}

impl GraphDiffEvent {
    /// Creates an empty event for a source context.
    #[must_use]
    pub fn new(source: ContextId) -> Self {
        Self {
            source,
            sequence: 0,
            changes: Vec::new(),
            arcs: Vec::new(),
            invalidated: Vec::new(),
        }
    }

    /// Returns true if the event carries nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.arcs.is_empty() && self.invalidated.is_empty()
    }

    /// Finds the change for an identity.
    #[must_use]
    pub fn change_for(&self, identity: &Identity) -> Option<&ObjectChange> {
        self.changes.iter().find(|c| &c.identity == identity)
    }

    /// Every identity the event touches.
    pub fn identities(&self) -> impl Iterator<Item = &Identity> {
        self.changes
            .iter()
            .map(|c| &c.identity)
            .chain(self.arcs.iter().flat_map(|a| [&a.source, &a.target]))
            .chain(self.invalidated.iter())
    }

    /// Checks protocol rules.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidEvent`] if a temporary identity is
    /// present or an insert/update lacks its snapshot.
    pub fn validate(&self) -> ProtocolResult<()> {
        if let Some(id) = self.identities().find(|id| id.is_temporary()) {
            return Err(ProtocolError::invalid_event(format!(
                "temporary identity {id} in event"
            )));
        }
        for change in &self.changes {
            let needs_snapshot = change.kind != ChangeKind::Delete;
            if needs_snapshot != change.snapshot.is_some() {
                return Err(ProtocolError::invalid_event(format!(
                    "{:?} of {} {} a snapshot",
                    change.kind,
                    change.identity,
                    if needs_snapshot { "lacks" } else { "carries" }
                )));
            }
        }
        Ok(())
    }

    /// Encodes to versioned CBOR.
    ///
    /// # Errors
    ///
    /// Returns an error if the event is invalid or cannot be encoded.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        self.validate()?;
        Ok(to_cbor(&Envelope {
            version: PROTOCOL_VERSION,
            event: self.clone(),
        })?)
    }

    /// Decodes from versioned CBOR.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed bytes, an unknown version or an
    /// invalid event.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let envelope: Envelope = from_cbor(bytes)?;
        if envelope.version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion {
                found: envelope.version,
                expected: PROTOCOL_VERSION,
            });
        }
        envelope.event.validate()?;
        Ok(envelope.event)
    }
}
