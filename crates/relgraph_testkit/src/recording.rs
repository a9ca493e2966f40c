//! Delegates and listeners that record what a channel delivered.

use parking_lot::Mutex;
use relgraph_core::{ContextDelegate, MergeReport, PeerListener};
use relgraph_sync_protocol::{ContextId, GraphDiffEvent, MergeConflict, MergeDecision};

/// A delegate that answers every conflict the same way and records the
/// merge callbacks it receives.
#[derive(Debug, Default)]
pub struct RecordingDelegate {
    decision: Option<MergeDecision>,
    conflicts: Mutex<Vec<MergeConflict>>,
    skipped: Mutex<Vec<MergeConflict>>,
    reports: Mutex<Vec<MergeReport>>,
}

impl RecordingDelegate {
    /// Leaves every decision to the context's merge policy.
    pub fn deferring() -> Self {
        Self::default()
    }

    /// Answers every conflict with `decision`.
    pub fn deciding(decision: MergeDecision) -> Self {
        Self {
            decision: Some(decision),
            ..Self::default()
        }
    }

    /// Conflicts offered to the delegate.
    pub fn conflicts(&self) -> Vec<MergeConflict> {
        self.conflicts.lock().clone()
    }

    /// Conflicts that were rejected.
    pub fn skipped(&self) -> Vec<MergeConflict> {
        self.skipped.lock().clone()
    }

    /// Reports of every merged event.
    pub fn reports(&self) -> Vec<MergeReport> {
        self.reports.lock().clone()
    }
}

impl ContextDelegate for RecordingDelegate {
    fn should_merge_changes(&self, conflict: &MergeConflict) -> Option<MergeDecision> {
        self.conflicts.lock().push(conflict.clone());
        self.decision.clone()
    }

    fn conflict_skipped(&self, conflict: &MergeConflict) {
        self.skipped.lock().push(conflict.clone());
    }

    fn did_merge(&self, report: &MergeReport) {
        self.reports.lock().push(report.clone());
    }
}

/// A bare peer that keeps every event it receives.
#[derive(Debug)]
pub struct RecordingPeer {
    id: ContextId,
    events: Mutex<Vec<GraphDiffEvent>>,
}

impl RecordingPeer {
    /// Creates a peer with the given id.
    pub fn new(id: u64) -> Self {
        Self {
            id: ContextId::new(id),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Events received so far.
    pub fn events(&self) -> Vec<GraphDiffEvent> {
        self.events.lock().clone()
    }

    /// Sequences of the events received so far.
    pub fn sequences(&self) -> Vec<u64> {
        self.events.lock().iter().map(|e| e.sequence).collect()
    }
}

impl PeerListener for RecordingPeer {
    fn peer_id(&self) -> ContextId {
        self.id
    }

    fn on_receive(&self, event: &GraphDiffEvent) {
        self.events.lock().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_peer() {
        let peer = RecordingPeer::new(9);
        let mut event = GraphDiffEvent::new(ContextId::new(1));
        event.sequence = 4;
        peer.on_receive(&event);
        assert_eq!(peer.peer_id(), ContextId::new(9));
        assert_eq!(peer.sequences(), vec![4]);
    }
}
