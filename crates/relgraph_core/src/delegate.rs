//! Application hooks for peer merges.

use crate::merge::MergeReport;
use relgraph_sync_protocol::{MergeConflict, MergeDecision};

/// Receives merge callbacks for one context.
///
/// Every hook runs without the context lock held, so a delegate may read
/// its context. Changes it makes before answering `should_merge_changes`
/// void that answer, and the context's policy decides instead.
pub trait ContextDelegate: Send + Sync {
    /// Decides an incoming change that hits a MODIFIED or DELETED object.
    ///
    /// Returning `None` leaves the decision to the context's
    /// [`MergePolicy`](relgraph_sync_protocol::MergePolicy).
    fn should_merge_changes(&self, conflict: &MergeConflict) -> Option<MergeDecision> {
        let _ = conflict;
        None
    }

    /// Called for every conflict that was rejected.
    fn conflict_skipped(&self, conflict: &MergeConflict) {
        let _ = conflict;
    }

    /// Called once per merged event.
    fn did_merge(&self, report: &MergeReport) {
        let _ = report;
    }
}
