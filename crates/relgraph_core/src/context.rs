//! The object context: one unit of work over a channel.
//!
//! A [`Context`] owns an identity [`Registry`] and a [`ChangeSet`]. Reads of
//! tracked objects go straight to the objects; every write goes through the
//! context so the change-set and persistence states stay in step. Commits
//! run through the shared [`Channel`] and are republished to peer contexts,
//! whose registries merge them.
//!
//! ```
//! use relgraph_core::{Channel, ChannelConfig, Context, PersistenceState};
//! use relgraph_driver::MemoryDriver;
//! use relgraph_schema::{Attribute, ColumnType, Entity, Schema};
//! use std::sync::Arc;
//!
//! let schema = Schema::builder()
//!     .entity(
//!         Entity::new("Artist", "ARTIST")
//!             .attribute(Attribute::new("id", "ID", ColumnType::Integer).primary_key())
//!             .attribute(Attribute::new("name", "NAME", ColumnType::VarChar)),
//!     )
//!     .build()
//!     .unwrap();
//! let driver = Arc::new(MemoryDriver::new());
//! let channel = Arc::new(Channel::new(driver, Arc::new(schema), ChannelConfig::default()).unwrap());
//!
//! let context = Context::new(channel);
//! let artist = context.new_object("Artist").unwrap();
//! context.set_field(&artist, "name", "Monet").unwrap();
//! context.commit().unwrap();
//! assert_eq!(artist.state(), PersistenceState::Committed);
//! ```

use crate::channel::{Channel, PeerListener};
use crate::commit::{BatchKind, CommitOutcome, CommitPlan};
use crate::config::ContextConfig;
use crate::delegate::ContextDelegate;
use crate::diff::{ChangeSet, EdgeChange, ObjectDiff};
use crate::error::{CoreError, CoreResult};
use crate::merge::{decide, Decisions, Merger};
use crate::object::{identity_from_row, EntityRef, Fault, ObjectData};
use crate::query::{CompiledQuery, Expression, Property, SelectQuery, SqlCompiler};
use crate::registry::{Registry, Snapshot};
use crate::state::PersistenceState;
use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use relgraph_codec::{Identity, Value};
use relgraph_driver::Row;
use relgraph_schema::{DeleteRule, Entity, Relationship, Schema, SchemaError};
use relgraph_sync_protocol::{ContextId, GraphDiffEvent};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Result of a successful commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitSummary {
    /// Rows inserted.
    pub inserted: usize,
    /// Rows updated, including rows whose foreign key was derived.
    pub updated: usize,
    /// Rows deleted.
    pub deleted: usize,
    /// Channel sequence of the published event, if one was published.
    pub sequence: Option<u64>,
    /// Snapshot version stamped on the committed rows.
    pub version: u64,
}

struct ContextState {
    registry: Registry,
    changes: ChangeSet,
}

struct ContextShared {
    id: ContextId,
    channel: Arc<Channel>,
    config: ContextConfig,
    state: RwLock<ContextState>,
    delegate: RwLock<Option<Arc<dyn ContextDelegate>>>,
}

impl PeerListener for ContextShared {
    fn peer_id(&self) -> ContextId {
        self.id
    }

    fn on_receive(&self, event: &GraphDiffEvent) {
        let delegate = self.delegate.read().clone();
        let merger = Merger {
            schema: self.channel.schema(),
            policy: self.config.merge_policy,
        };
        // The delegate runs unlocked so it may read this context.
        let decisions = match &delegate {
            Some(delegate) => {
                let conflicts = {
                    let state = self.state.read();
                    merger.conflicts(&state.registry, &state.changes, event)
                };
                decide(delegate.as_ref(), conflicts)
            }
            None => Decisions::new(),
        };
        let (report, skipped) = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            merger.merge(&mut state.registry, &mut state.changes, event, &decisions)
        };
        if let Some(delegate) = delegate {
            for conflict in &skipped {
                delegate.conflict_skipped(conflict);
            }
            delegate.did_merge(&report);
        }
    }
}

/// Unit of work over a [`Channel`].
///
/// Clones share the same registry and change-set.
#[derive(Clone)]
pub struct Context {
    shared: Arc<ContextShared>,
}

impl Context {
    /// Creates a context and registers it as a peer on `channel`.
    pub fn new(channel: Arc<Channel>) -> Self {
        Self::with_config(channel, ContextConfig::default())
    }

    /// Creates a context with an explicit configuration.
    pub fn with_config(channel: Arc<Channel>, config: ContextConfig) -> Self {
        let id = ContextId::new(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed));
        let shared = Arc::new(ContextShared {
            id,
            channel,
            config,
            state: RwLock::new(ContextState {
                registry: Registry::new(id),
                changes: ChangeSet::new(),
            }),
            delegate: RwLock::new(None),
        });
        let peer: Weak<dyn PeerListener> = Arc::downgrade(&shared) as Weak<dyn PeerListener>;
        shared.channel.register_peer(peer);
        tracing::debug!(context = %id, "context created");
        Self { shared }
    }

    /// Context id, also used as the peer id on the channel.
    #[must_use]
    pub fn id(&self) -> ContextId {
        self.shared.id
    }

    /// The channel this context commits through.
    #[must_use]
    pub fn channel(&self) -> &Arc<Channel> {
        &self.shared.channel
    }

    /// Schema of the channel.
    #[must_use]
    pub fn schema(&self) -> &Arc<Schema> {
        self.shared.channel.schema()
    }

    /// Context configuration.
    #[must_use]
    pub fn config(&self) -> &ContextConfig {
        &self.shared.config
    }

    /// Installs or removes the merge delegate.
    pub fn set_delegate(&self, delegate: Option<Arc<dyn ContextDelegate>>) {
        *self.shared.delegate.write() = delegate;
    }

    // Registry

    /// Creates and registers a NEW object.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Schema`] for an unknown entity.
    pub fn new_object(&self, entity: &str) -> CoreResult<EntityRef> {
        self.schema().entity(entity)?;
        let object = EntityRef::new(entity);
        self.shared.state.write().registry.register(&object)?;
        Ok(object)
    }

    /// Registers a transient object as NEW.
    ///
    /// Idempotent for objects already tracked here.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::AlreadyTrackedElsewhere`] for an object of
    /// another context and [`CoreError::Schema`] for an unknown entity.
    pub fn register(&self, object: &EntityRef) -> CoreResult<Identity> {
        self.schema().entity(object.entity_name())?;
        self.shared.state.write().registry.register(object)
    }

    /// Live object for an identity.
    #[must_use]
    pub fn lookup(&self, identity: &Identity) -> Option<EntityRef> {
        self.shared.state.read().registry.lookup(identity)
    }

    /// The registered instance for `identity`, or a new HOLLOW placeholder.
    ///
    /// A cached snapshot fills the placeholder without I/O.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidParameter`] for a temporary identity that
    /// is not registered here.
    pub fn local_object(&self, identity: &Identity) -> CoreResult<EntityRef> {
        let entity = self.schema().entity(identity.entity_name())?;
        let mut guard = self.shared.state.write();
        let state = &mut *guard;
        if let Some(object) = state.registry.lookup(identity) {
            return Ok(object);
        }
        if identity.is_temporary() {
            return Err(CoreError::invalid_parameter(format!(
                "{identity} is not registered in {}",
                self.id()
            )));
        }
        let object = EntityRef::new(identity.entity_name());
        match state.registry.snapshot(identity) {
            Some(snapshot) => {
                object.write().load_row(entity, snapshot.values());
                state.registry.attach(identity.clone(), &object, PersistenceState::Committed);
            }
            None => state.registry.attach(identity.clone(), &object, PersistenceState::Hollow),
        }
        Ok(object)
    }

    /// Loads a HOLLOW object by primary key. Other states are left alone.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::FaultFailure`] when the row is gone; the object
    /// is unregistered in that case.
    pub fn resolve_fault(&self, object: &EntityRef) -> CoreResult<()> {
        if object.state() != PersistenceState::Hollow {
            return Ok(());
        }
        self.check_owner(object)?;
        let Some(identity) = object.identity() else {
            return Ok(());
        };
        let entity = self.schema().entity(identity.entity_name())?;
        let query = SelectQuery::new(entity.name.clone()).filter(key_qualifier(entity, &identity)?);
        let compiled = self.compile(&query)?;
        let rows = self.shared.channel.run_query(&compiled)?;

        let mut guard = self.shared.state.write();
        let state = &mut *guard;
        if object.state() != PersistenceState::Hollow {
            return Ok(());
        }
        let Some(row) = rows.first() else {
            state.registry.unregister(&identity);
            state.changes.remove(&identity);
            tracing::debug!(identity = %identity, "hollow object has no row");
            return Err(CoreError::FaultFailure { identity });
        };
        let values = row_values(&compiled, row);
        let version = state.registry.next_version();
        object.write().load_row(entity, &values);
        state.registry.set_snapshot(identity, values, version);
        state.registry.transition(object, PersistenceState::Committed)
    }

    /// Drops the snapshot and pending changes of one object and turns it
    /// HOLLOW. Returns false if the object is not tracked or is NEW.
    pub fn invalidate(&self, identity: &Identity) -> bool {
        let mut guard = self.shared.state.write();
        let state = &mut *guard;
        let invalidated = state.registry.invalidate(identity);
        if invalidated {
            state.changes.remove(identity);
        }
        invalidated
    }

    /// Invalidates objects here and in every peer context.
    ///
    /// Returns the number of objects invalidated locally.
    pub fn invalidate_objects(&self, identities: &[Identity]) -> usize {
        let mut event = GraphDiffEvent::new(self.id());
        let mut count = 0;
        {
            let mut guard = self.shared.state.write();
            let state = &mut *guard;
            for identity in identities.iter().filter(|id| !id.is_temporary()) {
                if state.registry.invalidate(identity) {
                    state.changes.remove(identity);
                    count += 1;
                }
                event.invalidated.push(identity.clone());
            }
        }
        if !event.is_empty() {
            self.shared.channel.publish(event);
        }
        count
    }

    /// Stops tracking an object and drops its pending changes.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::AlreadyTrackedElsewhere`] for an object of
    /// another context.
    pub fn unregister_object(&self, object: &EntityRef) -> CoreResult<()> {
        self.check_owner(object)?;
        let Some(identity) = object.identity() else {
            return Ok(());
        };
        let mut guard = self.shared.state.write();
        let state = &mut *guard;
        state.registry.unregister(&identity);
        state.changes.remove(&identity);
        Ok(())
    }

    /// Forgets clean objects the application no longer references.
    pub fn evict_unreferenced(&self) -> usize {
        self.shared.state.write().registry.evict_unreferenced()
    }

    /// Number of registry entries.
    #[must_use]
    pub fn registered_count(&self) -> usize {
        self.shared.state.read().registry.len()
    }

    /// Live tracked objects in registration order.
    #[must_use]
    pub fn registered_objects(&self) -> Vec<EntityRef> {
        self.shared.state.read().registry.objects()
    }

    /// Current snapshot of a row.
    #[must_use]
    pub fn snapshot(&self, identity: &Identity) -> Option<Arc<Snapshot>> {
        self.shared.state.read().registry.snapshot(identity)
    }

    /// Version of a row's snapshot.
    #[must_use]
    pub fn snapshot_version(&self, identity: &Identity) -> Option<u64> {
        self.snapshot(identity).map(|s| s.version())
    }

    /// Latest snapshot version handed out by this context.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.shared.state.read().registry.version()
    }

    /// Returns true if a commit would have work to do.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        let state = self.shared.state.read();
        !state.changes.is_empty() || !state.registry.dirty_objects().is_empty()
    }

    /// Pending changes of one object.
    #[must_use]
    pub fn diff(&self, identity: &Identity) -> Option<ObjectDiff> {
        self.shared.state.read().changes.diff(identity).cloned()
    }

    // Writes

    /// Writes an attribute.
    ///
    /// Transient objects are written directly. A HOLLOW object is resolved
    /// first.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidStateTransition`] for a DELETED object or
    /// a primary key change on a saved object, and
    /// [`CoreError::AlreadyTrackedElsewhere`] for an object of another
    /// context.
    pub fn set_field(&self, object: &EntityRef, attribute: &str, value: impl Into<Value>) -> CoreResult<()> {
        let value = value.into();
        let entity = self.schema().entity(object.entity_name())?;
        let Some(definition) = entity.get_attribute(attribute) else {
            return Err(SchemaError::UnknownAttribute {
                entity: entity.name.clone(),
                name: attribute.to_string(),
            }
            .into());
        };
        self.check_owner(object)?;
        self.resolve_fault(object)?;

        let mut guard = self.shared.state.write();
        let state = &mut *guard;
        let current = object.state();
        if current == PersistenceState::Transient {
            object.write().values.insert(attribute.to_string(), value);
            return Ok(());
        }
        if !current.is_mutable() {
            return Err(CoreError::invalid_state(
                object.describe(),
                current,
                format!("set '{attribute}' on"),
            ));
        }
        if definition.primary_key && current != PersistenceState::New {
            return Err(CoreError::invalid_state(
                object.describe(),
                current,
                "change the primary key of",
            ));
        }
        let identity = identity_of(object)?;
        let previous = object
            .write()
            .values
            .insert(attribute.to_string(), value.clone())
            .unwrap_or_default();
        if current != PersistenceState::New {
            state.changes.record_scalar_change(&identity, attribute, previous, value);
            state.refresh(object)?;
        }
        Ok(())
    }

    /// Points a to-one relationship at `target`, or clears it.
    ///
    /// Transient objects on either side are registered. The reverse side is
    /// kept in step when the schema declares one.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidParameter`] for a to-many relationship or
    /// a target of the wrong entity, plus the errors of [`Self::set_field`].
    pub fn set_to_one(&self, object: &EntityRef, relationship: &str, target: Option<&EntityRef>) -> CoreResult<()> {
        let schema = Arc::clone(self.schema());
        let entity = schema.entity(object.entity_name())?;
        let rel = find_relationship(entity, relationship)?;
        if rel.to_many {
            return Err(CoreError::invalid_parameter(format!(
                "'{relationship}' is a to-many relationship"
            )));
        }
        self.check_owner(object)?;
        self.resolve_fault(object)?;
        self.prepare_to_one(object, rel)?;
        if let Some(target) = target {
            check_target(rel, target)?;
            self.check_owner(target)?;
            self.resolve_fault(target)?;
            if let Some(reverse) = schema.reverse_of(rel).filter(|r| r.is_to_one()) {
                self.prepare_to_one(target, reverse)?;
            }
        }

        let mut guard = self.shared.state.write();
        let state = &mut *guard;
        state.ensure_registered(object, "relate")?;
        let target_id = match target {
            Some(t) => Some(state.ensure_registered(t, "relate")?),
            None => None,
        };
        state.set_to_one(&schema, object, rel, target_id, true)
    }

    /// Adds `member` to a to-many relationship of `owner`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::set_to_one`].
    pub fn add_to_relationship(&self, owner: &EntityRef, relationship: &str, member: &EntityRef) -> CoreResult<()> {
        let schema = Arc::clone(self.schema());
        let rel = self.prepare_to_many(&schema, owner, relationship, member)?;
        let mut guard = self.shared.state.write();
        let state = &mut *guard;
        let owner_id = state.ensure_registered(owner, "relate")?;
        let member_id = state.ensure_registered(member, "relate")?;
        state.add(&schema, &owner_id, rel, &member_id)
    }

    /// Removes `member` from a to-many relationship of `owner`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::set_to_one`].
    pub fn remove_from_relationship(
        &self,
        owner: &EntityRef,
        relationship: &str,
        member: &EntityRef,
    ) -> CoreResult<()> {
        let schema = Arc::clone(self.schema());
        let rel = self.prepare_to_many(&schema, owner, relationship, member)?;
        let mut guard = self.shared.state.write();
        let state = &mut *guard;
        let owner_id = state.ensure_registered(owner, "relate")?;
        let member_id = state.ensure_registered(member, "relate")?;
        state.remove(&schema, &owner_id, rel, &member_id)
    }

    fn prepare_to_many<'s>(
        &self,
        schema: &'s Schema,
        owner: &EntityRef,
        relationship: &str,
        member: &EntityRef,
    ) -> CoreResult<&'s Relationship> {
        let entity = schema.entity(owner.entity_name())?;
        let rel = find_relationship(entity, relationship)?;
        if !rel.to_many {
            return Err(CoreError::invalid_parameter(format!(
                "'{relationship}' is a to-one relationship"
            )));
        }
        check_target(rel, member)?;
        self.check_owner(owner)?;
        self.check_owner(member)?;
        self.resolve_fault(owner)?;
        self.resolve_fault(member)?;
        if let Some(reverse) = schema.reverse_of(rel).filter(|r| r.is_to_one()) {
            self.prepare_to_one(member, reverse)?;
        }
        Ok(rel)
    }

    /// Loads a to-one relationship and, for one-to-one pairs, the current
    /// partner with its side of the pair.
    fn prepare_to_one(&self, object: &EntityRef, rel: &Relationship) -> CoreResult<()> {
        self.load_relationship(object, rel)?;
        let Some(reverse) = self.schema().reverse_of(rel).filter(|r| r.is_to_one()) else {
            return Ok(());
        };
        if let Fault::Loaded(Some(partner)) = object.to_one(&rel.name) {
            let partner = self.local_object(&partner)?;
            self.load_relationship(&partner, reverse)?;
        }
        Ok(())
    }

    /// Marks an object and its cascade closure DELETED.
    ///
    /// NEW objects are simply unregistered, so they never reach the store or
    /// a peer. Delete rules are applied in two phases: relationships are
    /// resolved first, then nullified and marked under the context lock.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DeleteDenied`] when a deny rule finds related
    /// objects, and [`CoreError::InvalidStateTransition`] for a transient
    /// object.
    pub fn delete_object(&self, object: &EntityRef) -> CoreResult<()> {
        self.check_owner(object)?;
        match object.state() {
            PersistenceState::Transient => {
                return Err(CoreError::invalid_state(
                    object.describe(),
                    PersistenceState::Transient,
                    "delete",
                ))
            }
            PersistenceState::Deleted => return Ok(()),
            _ => {}
        }
        let schema = Arc::clone(self.schema());

        let mut queue = VecDeque::from([object.clone()]);
        let mut closure: Vec<EntityRef> = Vec::new();
        while let Some(current) = queue.pop_front() {
            if current.state() == PersistenceState::Deleted || closure.iter().any(|o| o.ptr_eq(&current)) {
                continue;
            }
            self.resolve_fault(&current)?;
            let entity = schema.entity(current.entity_name())?;
            for rel in &entity.relationships {
                if rel.delete_rule == DeleteRule::NoAction {
                    continue;
                }
                self.load_relationship(&current, rel)?;
                let related = related_ids(&current, rel);
                match rel.delete_rule {
                    DeleteRule::Deny if !related.is_empty() => {
                        return Err(CoreError::DeleteDenied {
                            identity: current.describe(),
                            relationship: rel.name.clone(),
                        });
                    }
                    DeleteRule::Cascade => {
                        for identity in &related {
                            queue.push_back(self.local_object(identity)?);
                        }
                    }
                    DeleteRule::Nullify => {
                        if let Some(reverse) = schema.reverse_of(rel).filter(|r| r.is_to_one()) {
                            for identity in &related {
                                let member = self.local_object(identity)?;
                                self.prepare_to_one(&member, reverse)?;
                            }
                        }
                    }
                    _ => {}
                }
            }
            closure.push(current);
        }

        let mut guard = self.shared.state.write();
        let state = &mut *guard;
        for current in &closure {
            let identity = identity_of(current)?;
            let entity = schema.entity(current.entity_name())?;
            for rel in entity.relationships.iter().filter(|r| r.delete_rule == DeleteRule::Nullify) {
                for target in related_ids(current, rel) {
                    state.nullify(&schema, &identity, rel, &target)?;
                }
            }
        }
        for current in &closure {
            let identity = identity_of(current)?;
            match current.state() {
                PersistenceState::New => {
                    state.registry.unregister(&identity);
                    state.changes.remove(&identity);
                }
                PersistenceState::Deleted => {}
                _ => state.registry.transition(current, PersistenceState::Deleted)?,
            }
        }
        tracing::debug!(root = %object.describe(), objects = closure.len(), "deleted objects");
        Ok(())
    }

    // Relationships

    /// Fetches a relationship that is not loaded yet.
    ///
    /// While the fetch runs, a to-many list reads as
    /// [`Fault::Resolving`]. Pending local additions and removals are
    /// applied to the fetched members.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Schema`] for an unknown relationship and the
    /// query errors of [`Self::perform_query`].
    pub fn resolve_relationship(&self, object: &EntityRef, relationship: &str) -> CoreResult<()> {
        self.check_owner(object)?;
        let entity = self.schema().entity(object.entity_name())?;
        let rel = find_relationship(entity, relationship)?;
        self.load_relationship(object, rel)
    }

    /// Target of a to-one relationship, fetched if needed.
    ///
    /// # Errors
    ///
    /// Same as [`Self::resolve_relationship`].
    pub fn related_object(&self, object: &EntityRef, relationship: &str) -> CoreResult<Option<EntityRef>> {
        self.resolve_relationship(object, relationship)?;
        match object.to_one(relationship) {
            Fault::Loaded(Some(target)) => self.local_object(&target).map(Some),
            _ => Ok(None),
        }
    }

    /// Members of a to-many relationship, fetched if needed.
    ///
    /// # Errors
    ///
    /// Same as [`Self::resolve_relationship`].
    pub fn related_objects(&self, object: &EntityRef, relationship: &str) -> CoreResult<Vec<EntityRef>> {
        self.resolve_relationship(object, relationship)?;
        object
            .to_many(relationship)
            .loaded()
            .unwrap_or_default()
            .iter()
            .map(|identity| self.local_object(identity))
            .collect()
    }

    fn load_relationship(&self, object: &EntityRef, rel: &Relationship) -> CoreResult<()> {
        self.resolve_fault(object)?;
        if object.state().is_unsaved() || is_loaded(object, rel) {
            return Ok(());
        }
        let Some(identity) = object.identity() else {
            return Ok(());
        };
        let target = self.schema().entity(&rel.target)?;

        let Some(qualifier) = self.join_qualifier(&identity, rel) else {
            let mut data = object.write();
            if rel.to_many {
                data.to_many.insert(rel.name.clone(), Fault::Loaded(Vec::new()));
            } else {
                data.to_one.insert(rel.name.clone(), None);
            }
            return Ok(());
        };
        if rel.to_many {
            object.write().to_many.insert(rel.name.clone(), Fault::Resolving);
        }
        let fetched = self
            .compile(&SelectQuery::new(target.name.clone()).filter(qualifier))
            .and_then(|compiled| {
                let rows = self.shared.channel.run_query(&compiled)?;
                Ok((compiled, rows))
            });
        let (compiled, rows) = match fetched {
            Ok(fetched) => fetched,
            Err(error) => {
                let mut data = object.write();
                if matches!(data.to_many.get(&rel.name), Some(Fault::Resolving)) {
                    data.to_many.insert(rel.name.clone(), Fault::NotLoaded);
                }
                return Err(error);
            }
        };

        let mut guard = self.shared.state.write();
        let state = &mut *guard;
        let version = state.registry.next_version();
        let mut members: Vec<Identity> = Vec::new();
        for row in &rows {
            let values = row_values(&compiled, row);
            let Some(member) = identity_from_row(target, &values) else {
                continue;
            };
            state.hydrate(target, member.clone(), values, version)?;
            if !members.contains(&member) {
                members.push(member);
            }
        }
        if let Some(delta) = state.changes.diff(&identity).and_then(|d| d.to_many(&rel.name)) {
            for (member, count) in delta {
                if *count > 0 && !members.contains(member) {
                    members.push(member.clone());
                } else if *count < 0 {
                    members.retain(|m| m != member);
                }
            }
        }
        tracing::debug!(owner = %identity, relationship = %rel.name, members = members.len(), "resolved relationship");
        let mut data = object.write();
        if rel.to_many {
            data.to_many.insert(rel.name.clone(), Fault::Loaded(members));
        } else {
            data.to_one.insert(rel.name.clone(), members.into_iter().next());
        }
        Ok(())
    }

    /// Target columns equal to the owner's join values; `None` when a join
    /// value is null, so nothing can be related.
    fn join_qualifier(&self, identity: &Identity, rel: &Relationship) -> Option<Expression> {
        let snapshot = self.snapshot(identity);
        let mut qualifier: Option<Expression> = None;
        for join in &rel.joins {
            let value = identity
                .key_value(&join.source_column)
                .or_else(|| snapshot.as_ref().and_then(|s| s.get(&join.source_column)))
                .cloned()
                .unwrap_or_default();
            if value.is_null() {
                return None;
            }
            let term = Property::db(&join.target_column).eq(value);
            qualifier = Some(match qualifier {
                Some(q) => q.and(term),
                None => term,
            });
        }
        qualifier
    }

    // Lifecycle

    /// Plans the pending changes without touching the store.
    ///
    /// # Errors
    ///
    /// Returns the planning errors of [`Self::commit`].
    pub fn plan(&self) -> CoreResult<CommitPlan> {
        let state = self.shared.state.read();
        self.shared
            .channel
            .plan_commit(self.id(), &state.registry, &state.changes, true)
    }

    /// Writes every pending change in one store transaction and publishes
    /// the result to the peers.
    ///
    /// # Errors
    ///
    /// Returns planning errors ([`CoreError::MissingPrimaryKey`],
    /// [`CoreError::CyclicDependency`]) before any I/O, and the channel's
    /// commit errors afterwards. On any error every object keeps its state
    /// and pending changes, so the commit can be retried.
    pub fn commit(&self) -> CoreResult<CommitSummary> {
        let channel = Arc::clone(&self.shared.channel);
        let schema = Arc::clone(self.schema());
        let (event, mut summary) = {
            // Readers proceed during the store round trip; writers and
            // merges wait until the outcome is applied.
            let guard = self.shared.state.upgradable_read();
            if guard.changes.is_empty() && guard.registry.dirty_objects().is_empty() {
                return Ok(CommitSummary {
                    version: guard.registry.version(),
                    ..CommitSummary::default()
                });
            }
            let plan = channel.plan_commit(self.id(), &guard.registry, &guard.changes, false)?;
            let event = channel.run_commit(&plan)?;
            let mut summary = CommitSummary {
                inserted: plan.count(BatchKind::Insert),
                updated: plan.count(BatchKind::Update),
                deleted: plan.count(BatchKind::Delete),
                ..CommitSummary::default()
            };
            let mut guard = RwLockUpgradableReadGuard::upgrade(guard);
            summary.version = guard.apply_commit(&schema, plan.outcome)?;
            (event, summary)
        };

        if !event.is_empty() {
            summary.sequence = Some(channel.publish(event));
        }
        tracing::info!(
            context = %self.id(),
            inserted = summary.inserted,
            updated = summary.updated,
            deleted = summary.deleted,
            sequence = ?summary.sequence,
            "committed context"
        );
        Ok(summary)
    }

    /// Discards every pending change.
    ///
    /// NEW objects become TRANSIENT, MODIFIED and DELETED objects return to
    /// their snapshot, and to-many lists with local deltas are unloaded.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Schema`] if a tracked object's entity vanished
    /// from the schema.
    pub fn rollback(&self) -> CoreResult<()> {
        let schema = Arc::clone(self.schema());
        let mut guard = self.shared.state.write();
        let state = &mut *guard;
        let discarded = state.changes.len();
        for object in state.registry.dirty_objects() {
            let Some(identity) = object.identity() else {
                continue;
            };
            match object.state() {
                PersistenceState::New => {
                    state.registry.unregister(&identity);
                }
                PersistenceState::Modified | PersistenceState::Deleted => match state.registry.snapshot(&identity) {
                    Some(snapshot) => {
                        let entity = schema.entity(object.entity_name())?;
                        {
                            let mut data = object.write();
                            data.load_row(entity, snapshot.values());
                            unload_edges(&mut data, entity, state.changes.diff(&identity));
                        }
                        state.registry.transition(&object, PersistenceState::Committed)?;
                    }
                    None => {
                        state.registry.invalidate(&identity);
                    }
                },
                _ => {}
            }
        }
        let owners: Vec<Identity> = state.changes.identities().cloned().collect();
        for identity in owners {
            if let Some(object) = state.registry.lookup(&identity) {
                let entity = schema.entity(object.entity_name())?;
                unload_edges(&mut object.write(), entity, state.changes.diff(&identity));
            }
        }
        state.changes.clear();
        tracing::debug!(context = %self.id(), discarded, "rolled back context");
        Ok(())
    }

    // Queries

    /// Compiles a query with the channel's SQL settings.
    ///
    /// # Errors
    ///
    /// Returns the compiler's path, expression and parameter errors.
    pub fn compile(&self, query: &SelectQuery) -> CoreResult<CompiledQuery> {
        SqlCompiler::new(self.schema(), &self.shared.channel.config().sql).compile_select(query)
    }

    /// Runs an object query and returns the registered objects.
    ///
    /// Clean copies are refreshed from the rows; objects with pending
    /// changes keep their local values.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidParameter`] for a column query, compiler
    /// errors, and [`CoreError::Driver`] when the store rejects the query.
    pub fn perform_query(&self, query: &SelectQuery) -> CoreResult<Vec<EntityRef>> {
        if !query.is_object_query() {
            return Err(CoreError::invalid_parameter(
                "column queries return rows, use perform_column_query",
            ));
        }
        let compiled = self.compile(query)?;
        let rows = self.shared.channel.run_query(&compiled)?;
        let entity = self.schema().entity(&compiled.root)?;

        let mut objects = Vec::with_capacity(rows.len());
        {
            let mut guard = self.shared.state.write();
            let state = &mut *guard;
            let version = state.registry.next_version();
            let mut seen = HashSet::new();
            for row in &rows {
                let values = row_values(&compiled, row);
                let Some(identity) = identity_from_row(entity, &values) else {
                    tracing::warn!(entity = %entity.name, "skipping row without primary key");
                    continue;
                };
                if compiled.suppressed_distinct && !seen.insert(identity.clone()) {
                    continue;
                }
                objects.push(state.hydrate(entity, identity, values, version)?);
            }
        }
        Ok(page(objects, &compiled))
    }

    /// Runs a column query and returns one value list per row, in select
    /// order.
    ///
    /// # Errors
    ///
    /// Same as [`Self::perform_query`], with object queries rejected
    /// instead.
    pub fn perform_column_query(&self, query: &SelectQuery) -> CoreResult<Vec<Vec<Value>>> {
        if query.is_object_query() {
            return Err(CoreError::invalid_parameter(
                "object queries return objects, use perform_query",
            ));
        }
        let compiled = self.compile(query)?;
        let rows = self.shared.channel.run_query(&compiled)?;
        let mut result: Vec<Vec<Value>> = Vec::with_capacity(rows.len());
        for row in &rows {
            let values: Vec<Value> = (0..compiled.columns.len())
                .map(|i| row.get_index(i).cloned().unwrap_or_default())
                .collect();
            if compiled.suppressed_distinct && result.contains(&values) {
                continue;
            }
            result.push(values);
        }
        Ok(page(result, &compiled))
    }

    fn check_owner(&self, object: &EntityRef) -> CoreResult<()> {
        match object.context_id() {
            Some(owner) if owner != self.id() => Err(CoreError::AlreadyTrackedElsewhere {
                object: object.describe(),
                owner,
            }),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.read();
        f.debug_struct("Context")
            .field("id", &self.shared.id)
            .field("registry", &state.registry)
            .field("changes", &state.changes.len())
            .finish_non_exhaustive()
    }
}

impl ContextState {
    /// Registers transient objects and rejects immutable ones.
    fn ensure_registered(&mut self, object: &EntityRef, operation: &str) -> CoreResult<Identity> {
        match object.state() {
            PersistenceState::Transient => self.registry.register(object),
            state if state.is_mutable() => identity_of(object),
            state => Err(CoreError::invalid_state(object.describe(), state, operation)),
        }
    }

    /// Moves a saved object between COMMITTED and MODIFIED to match its
    /// pending changes.
    fn refresh(&mut self, object: &EntityRef) -> CoreResult<()> {
        let Some(identity) = object.identity() else {
            return Ok(());
        };
        let to = match object.state() {
            PersistenceState::Committed | PersistenceState::Modified if self.changes.has_changes(&identity) => {
                PersistenceState::Modified
            }
            PersistenceState::Committed | PersistenceState::Modified => PersistenceState::Committed,
            _ => return Ok(()),
        };
        self.registry.transition(object, to)
    }

    fn set_to_one(
        &mut self,
        schema: &Schema,
        holder: &EntityRef,
        rel: &Relationship,
        target: Option<Identity>,
        pair: bool,
    ) -> CoreResult<()> {
        let holder_id = identity_of(holder)?;
        let previous = holder.read().to_one.get(&rel.name).cloned().flatten();
        if previous == target {
            return Ok(());
        }
        holder.write().to_one.insert(rel.name.clone(), target.clone());
        self.changes.record_edge_change(
            &holder_id,
            &rel.name,
            EdgeChange::Set {
                previous: previous.clone(),
                target: target.clone(),
            },
        );
        self.refresh(holder)?;

        if pair {
            if let Some(reverse) = schema.reverse_of(rel) {
                if let Some(previous) = &previous {
                    self.unlink(schema, previous, reverse, &holder_id)?;
                }
                if let Some(target) = &target {
                    self.link(schema, target, reverse, &holder_id)?;
                }
            }
        }
        Ok(())
    }

    /// Adds `member` to the holder's to-many list, or points the holder's
    /// to-one at it.
    fn link(&mut self, schema: &Schema, holder_id: &Identity, rel: &Relationship, member: &Identity) -> CoreResult<()> {
        let holder = self.registry.lookup(holder_id);
        if rel.to_many {
            if let Some(holder) = &holder {
                let mut data = holder.write();
                let unsaved = data.state.is_unsaved();
                match data.to_many.get_mut(&rel.name) {
                    Some(Fault::Loaded(list)) if list.contains(member) => return Ok(()),
                    Some(Fault::Loaded(list)) => list.push(member.clone()),
                    None if unsaved => {
                        data.to_many.insert(rel.name.clone(), Fault::Loaded(vec![member.clone()]));
                    }
                    _ => {}
                }
            }
            self.changes
                .record_edge_change(holder_id, &rel.name, EdgeChange::Add(member.clone()));
            if let Some(holder) = &holder {
                self.refresh(holder)?;
            }
            return Ok(());
        }

        let Some(holder) = holder else {
            return Ok(());
        };
        // One-to-one: the holder's old partner loses its side.
        let old = holder.read().to_one.get(&rel.name).cloned().flatten();
        if let (Some(old), Some(reverse)) = (old.filter(|o| o != member), schema.reverse_of(rel)) {
            if let Some(partner) = self.registry.lookup(&old) {
                self.set_to_one(schema, &partner, reverse, None, false)?;
            }
        }
        self.set_to_one(schema, &holder, rel, Some(member.clone()), false)
    }

    fn unlink(&mut self, schema: &Schema, holder_id: &Identity, rel: &Relationship, member: &Identity) -> CoreResult<()> {
        let holder = self.registry.lookup(holder_id);
        if rel.to_many {
            if let Some(holder) = &holder {
                if let Some(Fault::Loaded(list)) = holder.write().to_many.get_mut(&rel.name) {
                    list.retain(|m| m != member);
                }
            }
            self.changes
                .record_edge_change(holder_id, &rel.name, EdgeChange::Remove(member.clone()));
            if let Some(holder) = &holder {
                self.refresh(holder)?;
            }
            return Ok(());
        }

        if let Some(holder) = holder {
            let current = holder.read().to_one.get(&rel.name).cloned().flatten();
            if current.as_ref() == Some(member) {
                self.set_to_one(schema, &holder, rel, None, false)?;
            }
        }
        Ok(())
    }

    fn add(&mut self, schema: &Schema, owner: &Identity, rel: &Relationship, member: &Identity) -> CoreResult<()> {
        match schema.reverse_of(rel) {
            Some(reverse) if reverse.is_to_one() => match self.registry.lookup(member) {
                Some(object) => self.set_to_one(schema, &object, reverse, Some(owner.clone()), true),
                None => self.link(schema, owner, rel, member),
            },
            Some(reverse) => {
                self.link(schema, owner, rel, member)?;
                self.link(schema, member, reverse, owner)
            }
            None => self.link(schema, owner, rel, member),
        }
    }

    fn remove(&mut self, schema: &Schema, owner: &Identity, rel: &Relationship, member: &Identity) -> CoreResult<()> {
        match schema.reverse_of(rel) {
            Some(reverse) if reverse.is_to_one() => {
                if let Some(object) = self.registry.lookup(member) {
                    let current = object.read().to_one.get(&reverse.name).cloned().flatten();
                    // A member pointing elsewhere was never in the list.
                    if current.as_ref() != Some(owner) {
                        return Ok(());
                    }
                    return self.set_to_one(schema, &object, reverse, None, true);
                }
                self.unlink(schema, owner, rel, member)
            }
            Some(reverse) => {
                self.unlink(schema, owner, rel, member)?;
                self.unlink(schema, member, reverse, owner)
            }
            None => self.unlink(schema, owner, rel, member),
        }
    }

    /// Detaches a deleted object from one related object.
    fn nullify(&mut self, schema: &Schema, deleted: &Identity, rel: &Relationship, target: &Identity) -> CoreResult<()> {
        match schema.reverse_of(rel) {
            Some(reverse) if reverse.is_to_one() => {
                let Some(member) = self.registry.lookup(target) else {
                    return Ok(());
                };
                let points_here = member.read().to_one.get(&reverse.name).cloned().flatten().as_ref() == Some(deleted);
                if points_here && member.state().is_mutable() {
                    self.set_to_one(schema, &member, reverse, None, true)?;
                }
                Ok(())
            }
            Some(reverse) => self.unlink(schema, target, reverse, deleted),
            None if rel.to_many => self.unlink(schema, deleted, rel, target),
            None => Ok(()),
        }
    }

    /// Registers or refreshes the object of a fetched row.
    fn hydrate(
        &mut self,
        entity: &Entity,
        identity: Identity,
        values: BTreeMap<String, Value>,
        version: u64,
    ) -> CoreResult<EntityRef> {
        if let Some(object) = self.registry.lookup(&identity) {
            let state = object.state();
            if matches!(state, PersistenceState::Committed | PersistenceState::Hollow) {
                object.write().load_row(entity, &values);
                self.registry.set_snapshot(identity, values, version);
                if state == PersistenceState::Hollow {
                    self.registry.transition(&object, PersistenceState::Committed)?;
                }
            }
            return Ok(object);
        }
        let object = EntityRef::new(entity.name.clone());
        object.write().load_row(entity, &values);
        self.registry.set_snapshot(identity.clone(), values, version);
        self.registry.attach(identity, &object, PersistenceState::Committed);
        Ok(object)
    }

    /// Applies a successful commit. Returns the version stamped on the new
    /// snapshots.
    fn apply_commit(&mut self, schema: &Schema, outcome: CommitOutcome) -> CoreResult<u64> {
        let version = self.registry.next_version();
        for (old, new) in &outcome.mapping {
            self.registry.replace_identity(old, new.clone());
            if let Some(object) = self.registry.lookup(new) {
                let entity = schema.entity(new.entity_name())?;
                let mut data = object.write();
                for attribute in entity.primary_key() {
                    if let Some(value) = new.key_value(&attribute.column) {
                        data.values.insert(attribute.name.clone(), value.clone());
                    }
                }
            }
        }
        self.registry.rewrite_references(&outcome.mapping);

        for (identity, row) in outcome.snapshots {
            if let Some(object) = self.registry.lookup(&identity) {
                if object.state() != PersistenceState::Hollow {
                    let entity = schema.entity(identity.entity_name())?;
                    object.write().load_row(entity, &row);
                }
            }
            self.registry.set_snapshot(identity, row, version);
        }
        for identity in &outcome.committed {
            let identity = outcome.mapping.get(identity).unwrap_or(identity);
            if let Some(object) = self.registry.lookup(identity) {
                self.registry.transition(&object, PersistenceState::Committed)?;
            }
        }
        for identity in &outcome.deleted {
            self.registry.unregister(identity);
        }
        for identity in &outcome.stale {
            self.registry.invalidate(identity);
        }
        self.changes.clear();
        Ok(version)
    }
}

fn identity_of(object: &EntityRef) -> CoreResult<Identity> {
    object
        .identity()
        .ok_or_else(|| CoreError::invalid_state(object.describe(), object.state(), "track"))
}

fn find_relationship<'s>(entity: &'s Entity, name: &str) -> CoreResult<&'s Relationship> {
    entity.get_relationship(name).ok_or_else(|| {
        SchemaError::UnknownRelationship {
            entity: entity.name.clone(),
            name: name.to_string(),
        }
        .into()
    })
}

fn check_target(rel: &Relationship, target: &EntityRef) -> CoreResult<()> {
    if target.entity_name() == rel.target {
        Ok(())
    } else {
        Err(CoreError::invalid_parameter(format!(
            "'{}' expects {}, got {}",
            rel.name,
            rel.target,
            target.entity_name()
        )))
    }
}

fn is_loaded(object: &EntityRef, rel: &Relationship) -> bool {
    let data = object.read();
    if rel.to_many {
        data.to_many.get(&rel.name).is_some_and(Fault::is_loaded)
    } else {
        data.to_one.contains_key(&rel.name)
    }
}

fn related_ids(object: &EntityRef, rel: &Relationship) -> Vec<Identity> {
    if rel.to_many {
        object.to_many(&rel.name).loaded().unwrap_or_default()
    } else {
        object.to_one(&rel.name).loaded().flatten().into_iter().collect()
    }
}

/// Unloads relationships that carried local deltas so they are fetched
/// again.
fn unload_edges(data: &mut ObjectData, entity: &Entity, diff: Option<&ObjectDiff>) {
    let Some(diff) = diff else {
        return;
    };
    for name in diff.to_many_relationships() {
        data.to_many.remove(name);
    }
    for name in diff.to_one().keys() {
        let owned = entity
            .get_relationship(name)
            .is_some_and(|rel| entity.owns_foreign_key(rel));
        if !owned {
            data.to_one.remove(name);
        }
    }
}

fn key_qualifier(entity: &Entity, identity: &Identity) -> CoreResult<Expression> {
    let mut qualifier: Option<Expression> = None;
    for column in entity.primary_key_columns() {
        let value = identity.key_value(column).cloned().ok_or_else(|| {
            CoreError::invalid_parameter(format!("{identity} has no value for key column {column}"))
        })?;
        let term = Property::db(column).eq(value);
        qualifier = Some(match qualifier {
            Some(q) => q.and(term),
            None => term,
        });
    }
    qualifier.ok_or_else(|| CoreError::invalid_parameter(format!("{} has no primary key", entity.name)))
}

/// Row values keyed by result label. Rows without labels are read by
/// position.
fn row_values(query: &CompiledQuery, row: &Row) -> BTreeMap<String, Value> {
    let positional = row.len() == query.columns.len();
    query
        .columns
        .iter()
        .enumerate()
        .map(|(index, column)| {
            let value = row
                .get(&column.label)
                .or_else(|| positional.then(|| row.get_index(index)).flatten())
                .cloned()
                .unwrap_or_default();
            (column.label.clone(), value)
        })
        .collect()
}

fn page<T>(items: Vec<T>, query: &CompiledQuery) -> Vec<T> {
    if query.memory_offset == 0 && query.memory_limit.is_none() {
        return items;
    }
    items
        .into_iter()
        .skip(query.memory_offset)
        .take(query.memory_limit.unwrap_or(usize::MAX))
        .collect()
}
