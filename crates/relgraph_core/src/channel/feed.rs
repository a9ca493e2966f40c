//! Bounded history of published events plus bridge subscribers.

use parking_lot::RwLock;
use relgraph_sync_protocol::GraphDiffEvent;
use std::sync::mpsc::{self, Receiver, Sender};

/// Published events in sequence order.
///
/// The feed:
/// - Records only committed events
/// - Preserves commit order
/// - Supports multiple subscribers
/// - Can be polled from a cursor position
pub(crate) struct ChangeFeed {
    subscribers: RwLock<Vec<Sender<GraphDiffEvent>>>,
    history: RwLock<Vec<GraphDiffEvent>>,
    max_history: usize,
}

impl ChangeFeed {
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            history: RwLock::new(Vec::new()),
            max_history,
        }
    }

    /// Returns a receiver for every event recorded from now on.
    pub fn subscribe(&self) -> Receiver<GraphDiffEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Records an event and forwards it to subscribers.
    pub fn record(&self, event: &GraphDiffEvent) {
        {
            let mut history = self.history.write();
            history.push(event.clone());
            if history.len() > self.max_history {
                let excess = history.len() - self.max_history;
                history.drain(0..excess);
            }
        }

        // Disconnected receivers are dropped here.
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Events with sequence > `cursor`, up to `limit`.
    pub fn poll(&self, cursor: u64, limit: usize) -> Vec<GraphDiffEvent> {
        self.history
            .read()
            .iter()
            .filter(|e| e.sequence > cursor)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Sequence of the newest retained event, 0 if none.
    #[cfg(test)]
    pub fn latest_sequence(&self) -> u64 {
        self.history.read().last().map_or(0, |e| e.sequence)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.history.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relgraph_sync_protocol::ContextId;

    fn event(sequence: u64) -> GraphDiffEvent {
        let mut event = GraphDiffEvent::new(ContextId::new(1));
        event.sequence = sequence;
        event
    }

    #[test]
    fn poll_from_cursor() {
        let feed = ChangeFeed::with_max_history(100);
        for i in 1..=5 {
            feed.record(&event(i));
        }

        let events = feed.poll(2, 10);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].sequence, 3);
        assert_eq!(feed.poll(0, 2).len(), 2);
        assert_eq!(feed.latest_sequence(), 5);
    }

    #[test]
    fn history_is_bounded() {
        let feed = ChangeFeed::with_max_history(3);
        for i in 1..=10 {
            feed.record(&event(i));
        }
        assert_eq!(feed.len(), 3);
        assert_eq!(feed.poll(0, 10)[0].sequence, 8);
    }

    #[test]
    fn subscribers_receive_and_are_pruned() {
        let feed = ChangeFeed::with_max_history(10);
        let rx = feed.subscribe();
        let dropped = feed.subscribe();
        drop(dropped);
        assert_eq!(feed.subscriber_count(), 2);

        feed.record(&event(1));
        assert_eq!(rx.recv().unwrap().sequence, 1);
        assert_eq!(feed.subscriber_count(), 1);
    }

    #[test]
    fn empty_feed() {
        let feed = ChangeFeed::with_max_history(10);
        assert_eq!(feed.latest_sequence(), 0);
        assert!(feed.poll(0, 10).is_empty());
    }
}
