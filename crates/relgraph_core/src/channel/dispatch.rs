//! Background delivery of published events.

use super::Hub;
use crate::error::CoreResult;
use parking_lot::Mutex;
use relgraph_sync_protocol::GraphDiffEvent;
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

enum Message {
    Deliver(GraphDiffEvent),
    Barrier(Sender<()>),
}

/// One worker thread that delivers events to peers in the order they were
/// queued.
pub(crate) struct Dispatcher {
    tx: Mutex<Option<Sender<Message>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn spawn(hub: Arc<Hub>) -> CoreResult<Self> {
        let (tx, rx) = mpsc::channel::<Message>();
        let handle = thread::Builder::new()
            .name("relgraph-dispatch".to_string())
            .spawn(move || {
                while let Ok(message) = rx.recv() {
                    match message {
                        Message::Deliver(event) => hub.deliver(&event),
                        Message::Barrier(done) => {
                            let _ = done.send(());
                        }
                    }
                }
                tracing::debug!("dispatcher stopped");
            })?;
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queues an event. Returns false once the dispatcher has stopped.
    pub fn send(&self, event: GraphDiffEvent) -> bool {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(Message::Deliver(event)).is_ok(),
            None => false,
        }
    }

    /// Blocks until every event queued before the call was delivered.
    pub fn drain(&self) {
        if self.is_worker() {
            return;
        }
        let (done_tx, done_rx) = mpsc::channel();
        let queued = match self.tx.lock().as_ref() {
            Some(tx) => tx.send(Message::Barrier(done_tx)).is_ok(),
            None => false,
        };
        if queued {
            let _ = done_rx.recv();
        }
    }

    fn is_worker(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|h| h.thread().id() == thread::current().id())
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.tx.lock().take();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            // The last channel reference can be released by a peer running
            // on the worker itself.
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                tracing::warn!("dispatcher thread panicked");
            }
        }
    }
}
