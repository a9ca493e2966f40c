//! Persistence states of tracked objects.

use std::fmt;

/// Lifecycle state of a tracked object.
///
/// ```text
/// TRANSIENT -> NEW -> COMMITTED <-> MODIFIED -> DELETED -> TRANSIENT
///                         ^  |
///                         |  v
///                        HOLLOW
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PersistenceState {
    /// Not registered with any context.
    Transient,
    /// Registered, not yet inserted.
    New,
    /// In sync with its snapshot.
    Committed,
    /// Has pending changes against its snapshot.
    Modified,
    /// Scheduled for deletion on the next commit.
    Deleted,
    /// Identity known, fields not loaded.
    Hollow,
}

impl PersistenceState {
    /// Returns true for states held strongly until commit or rollback.
    #[must_use]
    pub const fn is_dirty(self) -> bool {
        matches!(self, Self::New | Self::Modified | Self::Deleted)
    }

    /// Returns true if field and edge writes are accepted.
    #[must_use]
    pub const fn is_mutable(self) -> bool {
        matches!(self, Self::New | Self::Committed | Self::Modified)
    }

    /// Returns true for states with no row in the store yet.
    #[must_use]
    pub const fn is_unsaved(self) -> bool {
        matches!(self, Self::Transient | Self::New)
    }

    /// Returns true if the transition is part of the lifecycle.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        use PersistenceState::{Committed, Deleted, Hollow, Modified, New, Transient};
        matches!(
            (self, to),
            (Transient, New | Committed | Hollow)
                | (New, New | Committed | Transient)
                | (Committed, Committed | Modified | Deleted | Hollow | Transient)
                | (Modified, Modified | Committed | Deleted | Hollow | New | Transient)
                | (Deleted, Deleted | Committed | Hollow | Transient)
                | (Hollow, Hollow | Committed | Deleted | Transient)
        )
    }
}

impl fmt::Display for PersistenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Transient => "TRANSIENT",
            Self::New => "NEW",
            Self::Committed => "COMMITTED",
            Self::Modified => "MODIFIED",
            Self::Deleted => "DELETED",
            Self::Hollow => "HOLLOW",
        };
        f.write_str(name)
    }
}
