//! Merge conflicts between a peer event and local uncommitted work.

use crate::event::ChangeKind;
use relgraph_codec::{Identity, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Uncommitted local state that an incoming change collides with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalChange {
    /// The local copy has pending field or edge changes.
    Modified,
    /// The local copy is scheduled for deletion.
    Deleted,
}

/// An incoming change that hits a locally modified or deleted object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeConflict {
    /// Object in conflict.
    pub identity: Identity,
    /// Local pending state.
    pub local: LocalChange,
    /// Incoming change kind.
    pub incoming_kind: ChangeKind,
    /// Incoming post-commit row, absent for deletes.
    pub incoming: Option<BTreeMap<String, Value>>,
    /// Columns the peer wrote.
    pub incoming_columns: BTreeSet<String>,
    /// Columns with pending local changes.
    pub locally_modified: BTreeSet<String>,
}

impl MergeConflict {
    /// Columns written by the peer and also pending locally.
    #[must_use]
    pub fn overlapping_columns(&self) -> BTreeSet<String> {
        self.incoming_columns
            .intersection(&self.locally_modified)
            .cloned()
            .collect()
    }

    /// Columns written by the peer that are not pending locally.
    #[must_use]
    pub fn disjoint_columns(&self) -> BTreeSet<String> {
        self.incoming_columns
            .difference(&self.locally_modified)
            .cloned()
            .collect()
    }

    /// Returns true if the peer deleted the object.
    #[must_use]
    pub fn is_remote_delete(&self) -> bool {
        self.incoming_kind == ChangeKind::Delete
    }
}

/// What to do with an incoming change that conflicts with local work.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MergeDecision {
    /// Take the incoming change. For a remote delete of a modified object,
    /// the local copy becomes NEW so the local edits can be re-inserted.
    Approve,
    /// Keep local work untouched.
    #[default]
    Reject,
    /// Take only these columns; pending local changes on them are dropped.
    Partial(BTreeSet<String>),
}

/// Built-in conflict policies used when no delegate decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MergePolicy {
    /// Keep local work; the incoming change is skipped.
    #[default]
    KeepLocal,
    /// Incoming changes win.
    AcceptRemote,
    /// Take incoming columns that are not pending locally.
    MergeDisjoint,
}

impl MergePolicy {
    /// Decides a conflict according to this policy.
    #[must_use]
    pub fn decide(self, conflict: &MergeConflict) -> MergeDecision {
        match self {
            MergePolicy::KeepLocal => MergeDecision::Reject,
            MergePolicy::AcceptRemote => MergeDecision::Approve,
            MergePolicy::MergeDisjoint if conflict.is_remote_delete() => MergeDecision::Reject,
            MergePolicy::MergeDisjoint => {
                let disjoint = conflict.disjoint_columns();
                if disjoint.is_empty() {
                    MergeDecision::Reject
                } else {
                    MergeDecision::Partial(disjoint)
                }
            }
        }
    }

    /// Converts to a code.
    #[must_use]
    pub fn to_code(self) -> u8 {
        match self {
            MergePolicy::KeepLocal => 1,
            MergePolicy::AcceptRemote => 2,
            MergePolicy::MergeDisjoint => 3,
        }
    }

    /// Converts from a code.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(MergePolicy::KeepLocal),
            2 => Some(MergePolicy::AcceptRemote),
            3 => Some(MergePolicy::MergeDisjoint),
            _ => None,
        }
    }
}
