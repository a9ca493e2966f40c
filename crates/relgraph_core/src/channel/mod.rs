//! Synchronization channel: the single path from contexts to the store and
//! from committed contexts to their peers.
//!
//! A [`Channel`] serializes driver access, runs compiled queries and commit
//! plans, and republishes each committed [`GraphDiffEvent`] to every other
//! peer registered on it. Events get a channel-wide sequence number and are
//! kept in a bounded history for bridges that poll or subscribe.

mod dispatch;
mod feed;

use crate::commit::{CommitBatch, CommitPlan, CommitPlanner};
use crate::config::{ChannelConfig, DeliveryMode};
use crate::diff::ChangeSet;
use crate::error::{CoreError, CoreResult};
use crate::pk::{PkGenerator, SequencePkGenerator};
use crate::query::CompiledQuery;
use crate::registry::Registry;
use dispatch::Dispatcher;
use feed::ChangeFeed;
use parking_lot::{Mutex, RwLock};
use relgraph_driver::{Driver, DriverError, Row};
use relgraph_schema::Schema;
use relgraph_sync_protocol::{ContextId, GraphDiffEvent};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Weak};

/// Receiver of events committed by other peers on a channel.
pub trait PeerListener: Send + Sync {
    /// Identifies the peer; events it published are not sent back to it.
    fn peer_id(&self) -> ContextId;

    /// Applies an event committed elsewhere.
    fn on_receive(&self, event: &GraphDiffEvent);
}

/// Registered peers.
pub(crate) struct Hub {
    peers: RwLock<Vec<Weak<dyn PeerListener>>>,
}

impl Hub {
    fn new() -> Self {
        Self {
            peers: RwLock::new(Vec::new()),
        }
    }

    /// Delivers to every live peer except the source.
    ///
    /// Peers are called without holding the peer list lock.
    pub(crate) fn deliver(&self, event: &GraphDiffEvent) {
        let live: Vec<Arc<dyn PeerListener>> = {
            let mut peers = self.peers.write();
            peers.retain(|p| p.strong_count() > 0);
            peers.iter().filter_map(Weak::upgrade).collect()
        };
        let mut delivered = 0usize;
        for peer in live {
            if peer.peer_id() != event.source {
                peer.on_receive(event);
                delivered += 1;
            }
        }
        tracing::debug!(sequence = event.sequence, source = %event.source, delivered, "delivered event");
    }
}

/// Shared access to one store for a group of peer contexts.
pub struct Channel {
    driver: Arc<dyn Driver>,
    schema: Arc<Schema>,
    config: ChannelConfig,
    keys: Arc<dyn PkGenerator>,
    io_lock: Mutex<()>,
    delivery: Mutex<()>,
    sequence: AtomicU64,
    hub: Arc<Hub>,
    feed: ChangeFeed,
    dispatcher: Option<Dispatcher>,
}

impl Channel {
    /// Creates a channel over `driver`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Io`] if the background dispatcher cannot be
    /// started.
    pub fn new(driver: Arc<dyn Driver>, schema: Arc<Schema>, config: ChannelConfig) -> CoreResult<Self> {
        let hub = Arc::new(Hub::new());
        let dispatcher = match config.delivery {
            DeliveryMode::Synchronous => None,
            DeliveryMode::Background => Some(Dispatcher::spawn(Arc::clone(&hub))?),
        };
        let keys: Arc<dyn PkGenerator> = Arc::new(SequencePkGenerator::new(config.pk_start, config.pk_cache_size));
        tracing::debug!(delivery = ?config.delivery, entities = schema.len(), "channel created");
        Ok(Self {
            driver,
            schema,
            feed: ChangeFeed::with_max_history(config.max_history),
            config,
            keys,
            io_lock: Mutex::new(()),
            delivery: Mutex::new(()),
            sequence: AtomicU64::new(0),
            hub,
            dispatcher,
        })
    }

    /// Replaces the primary key generator.
    #[must_use]
    pub fn with_pk_generator(mut self, keys: Arc<dyn PkGenerator>) -> Self {
        self.keys = keys;
        self
    }

    /// Schema shared by every context on the channel.
    #[must_use]
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Channel configuration.
    #[must_use]
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Adds a peer. The channel holds it weakly; dropped peers are pruned
    /// here and on delivery.
    pub fn register_peer(&self, peer: Weak<dyn PeerListener>) {
        let mut peers = self.hub.peers.write();
        peers.retain(|p| p.strong_count() > 0);
        peers.push(peer);
    }

    /// Number of live peers.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.hub.peers.read().iter().filter(|p| p.strong_count() > 0).count()
    }

    /// Runs a compiled query.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Driver`] if the store rejects the statement.
    pub fn run_query(&self, query: &CompiledQuery) -> CoreResult<Vec<Row>> {
        let _io = self.io_lock.lock();
        let rows = self.driver.execute(&query.sql, &query.params)?.into_rows();
        tracing::debug!(root = %query.root, rows = rows.len(), "ran query");
        Ok(rows)
    }

    /// Plans the commit of one context's changes. A preview peeks at
    /// generated keys instead of reserving them.
    pub(crate) fn plan_commit(
        &self,
        source: ContextId,
        registry: &Registry,
        changes: &ChangeSet,
        preview: bool,
    ) -> CoreResult<CommitPlan> {
        CommitPlanner {
            schema: &self.schema,
            config: &self.config,
            keys: self.keys.as_ref(),
            source,
            preview,
        }
        .plan(registry, changes)
    }

    /// Executes a plan in one store transaction.
    ///
    /// Returns the plan's event, not yet published.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CommitFailed`] or
    /// [`CoreError::OptimisticLockFailure`] naming the failing batch, or
    /// [`CoreError::TransactionFailed`] if the store refuses to begin or
    /// commit. The transaction is rolled back in every case.
    pub fn run_commit(&self, plan: &CommitPlan) -> CoreResult<GraphDiffEvent> {
        let _io = self.io_lock.lock();
        self.driver
            .begin_transaction()
            .map_err(|source| CoreError::TransactionFailed { source })?;

        for (index, batch) in plan.batches().iter().enumerate() {
            if let Err(error) = self.run_batch(index, batch) {
                tracing::warn!(batch = index, entity = %batch.entity, error = %error, "rolling back commit");
                if let Err(rollback) = self.driver.rollback() {
                    tracing::warn!(error = %rollback, "rollback failed");
                }
                return Err(error);
            }
        }

        if let Err(source) = self.driver.commit() {
            tracing::warn!(error = %source, "store commit failed");
            // Drivers normally discard the transaction themselves.
            if let Err(rollback) = self.driver.rollback() {
                tracing::debug!(error = %rollback, "no transaction left to roll back");
            }
            return Err(CoreError::TransactionFailed { source });
        }
        tracing::info!(
            batches = plan.batches().len(),
            rows = plan.row_count(),
            "committed transaction"
        );
        Ok(plan.event().clone())
    }

    fn run_batch(&self, index: usize, batch: &CommitBatch) -> CoreResult<()> {
        let failed = |source: DriverError| CoreError::CommitFailed {
            batch: index,
            entity: batch.entity.clone(),
            source,
        };
        for row in &batch.rows {
            let result = self
                .driver
                .execute(&row.statement.sql, &row.statement.params)
                .map_err(failed)?;
            if row.check_update_count && result.update_count() == Some(0) {
                return Err(CoreError::OptimisticLockFailure {
                    batch: index,
                    identity: row.identity.clone(),
                });
            }
            let Some(lobs) = &row.lobs else {
                continue;
            };
            self.driver
                .execute(&lobs.select.sql, &lobs.select.params)
                .map_err(failed)?;
            let chunk_size = self.config.lob.chunk_size.max(1);
            for (locator, data) in &lobs.writes {
                let mut handle = self.driver.open_lob(locator).map_err(failed)?;
                for chunk in data.chunks(chunk_size) {
                    handle.write_chunk(chunk).map_err(failed)?;
                }
                handle.finish().map_err(failed)?;
                tracing::trace!(table = %locator.table, column = %locator.column, bytes = data.len(), "streamed lob");
            }
        }
        Ok(())
    }

    /// Assigns the next sequence to `event`, records it and delivers it to
    /// every peer except its source.
    ///
    /// Returns the assigned sequence. Must not be called while holding a
    /// context lock.
    pub fn publish(&self, mut event: GraphDiffEvent) -> u64 {
        let _delivery = self.delivery.lock();
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        event.sequence = sequence;
        self.feed.record(&event);
        tracing::debug!(
            sequence,
            source = %event.source,
            changes = event.changes.len(),
            arcs = event.arcs.len(),
            invalidated = event.invalidated.len(),
            "publishing event"
        );
        match &self.dispatcher {
            Some(dispatcher) => {
                if !dispatcher.send(event) {
                    tracing::warn!(sequence, "dispatcher stopped, event not delivered");
                }
            }
            None => self.hub.deliver(&event),
        }
        sequence
    }

    /// Waits until every published event reached the peers.
    pub fn drain(&self) {
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.drain();
        }
    }

    /// Retained events with sequence > `cursor`, up to `limit`.
    #[must_use]
    pub fn events_since(&self, cursor: u64, limit: usize) -> Vec<GraphDiffEvent> {
        self.feed.poll(cursor, limit)
    }

    /// Receives every event published from now on.
    pub fn subscribe(&self) -> Receiver<GraphDiffEvent> {
        self.feed.subscribe()
    }

    /// Number of bridge subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.feed.subscriber_count()
    }

    /// Latest assigned sequence.
    #[must_use]
    pub fn latest_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("delivery", &self.config.delivery)
            .field("peers", &self.peer_count())
            .field("sequence", &self.latest_sequence())
            .finish_non_exhaustive()
    }
}
