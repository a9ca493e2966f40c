//! Identity registry: identity to live object and identity to snapshot.

use crate::error::{CoreError, CoreResult};
use crate::object::{EntityRef, Fault, WeakEntityRef};
use crate::state::PersistenceState;
use relgraph_codec::{Identity, Value};
use relgraph_sync_protocol::ContextId;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Last persisted row of an object.
///
/// Snapshots are immutable; the registry replaces them on every fetch or
/// commit that touches the row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    values: BTreeMap<String, Value>,
    version: u64,
}

impl Snapshot {
    /// Creates a snapshot.
    #[must_use]
    pub fn new(values: BTreeMap<String, Value>, version: u64) -> Self {
        Self { values, version }
    }

    /// Column values.
    #[must_use]
    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    /// Value of one column.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    /// Version stamp.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }
}

struct Slot {
    weak: WeakEntityRef,
    /// Held while the object has pending changes.
    strong: Option<EntityRef>,
    order: u64,
}

/// Per-context map of identities to live objects and snapshots.
///
/// Clean objects (COMMITTED, HOLLOW) are held weakly and disappear once the
/// application drops them; NEW, MODIFIED and DELETED objects are held
/// strongly until commit or rollback.
pub struct Registry {
    context: ContextId,
    objects: HashMap<Identity, Slot>,
    snapshots: HashMap<Identity, Arc<Snapshot>>,
    clock: u64,
    next_order: u64,
}

impl Registry {
    /// Creates an empty registry for a context.
    #[must_use]
    pub fn new(context: ContextId) -> Self {
        Self {
            context,
            objects: HashMap::new(),
            snapshots: HashMap::new(),
            clock: 0,
            next_order: 0,
        }
    }

    /// Owning context.
    #[must_use]
    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Registers a transient object as NEW.
    ///
    /// Assigns a temporary identity when the object has none. Registering an
    /// object already tracked here returns its identity unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::AlreadyTrackedElsewhere`] if another context owns
    /// the object, and [`CoreError::InvalidStateTransition`] for a DELETED
    /// object or an identity already taken by another instance.
    pub fn register(&mut self, object: &EntityRef) -> CoreResult<Identity> {
        let identity = {
            let mut data = object.write();
            match data.context {
                Some(owner) if owner != self.context => {
                    return Err(CoreError::AlreadyTrackedElsewhere {
                        object: data
                            .identity
                            .as_ref()
                            .map_or_else(|| object.entity_name().to_string(), ToString::to_string),
                        owner,
                    });
                }
                Some(_) if data.state == PersistenceState::Deleted => {
                    return Err(CoreError::invalid_state(
                        object.entity_name(),
                        data.state,
                        "register",
                    ));
                }
                Some(_) => {
                    if let Some(id) = &data.identity {
                        return Ok(id.clone());
                    }
                }
                None => {}
            }

            let identity = data
                .identity
                .clone()
                .unwrap_or_else(|| Identity::temporary(object.entity_name()));
            if self.lookup(&identity).is_some() {
                return Err(CoreError::invalid_state(&identity, data.state, "register duplicate of"));
            }
            data.identity = Some(identity.clone());
            data.context = Some(self.context);
            data.state = PersistenceState::New;
            identity
        };
        self.insert_slot(identity.clone(), object, true);
        tracing::debug!(identity = %identity, "registered new object");
        Ok(identity)
    }

    /// Adds a hydrated or hollow object under a permanent identity.
    pub(crate) fn attach(&mut self, identity: Identity, object: &EntityRef, state: PersistenceState) {
        {
            let mut data = object.write();
            data.identity = Some(identity.clone());
            data.context = Some(self.context);
            data.state = state;
        }
        self.insert_slot(identity, object, state.is_dirty());
    }

    fn insert_slot(&mut self, identity: Identity, object: &EntityRef, pinned: bool) {
        let order = self.next_order;
        self.next_order += 1;
        self.objects.insert(
            identity,
            Slot {
                weak: object.downgrade(),
                strong: pinned.then(|| object.clone()),
                order,
            },
        );
    }

    /// Live object for an identity.
    #[must_use]
    pub fn lookup(&self, identity: &Identity) -> Option<EntityRef> {
        let slot = self.objects.get(identity)?;
        slot.strong.clone().or_else(|| slot.weak.upgrade())
    }

    /// Drops the snapshot and turns the object HOLLOW without detaching it.
    ///
    /// Pending changes of the object are discarded by the caller.
    pub fn invalidate(&mut self, identity: &Identity) -> bool {
        self.snapshots.remove(identity);
        let Some(object) = self.lookup(identity) else {
            return false;
        };
        {
            let mut data = object.write();
            if data.state == PersistenceState::New {
                return false;
            }
            data.state = PersistenceState::Hollow;
            data.values.clear();
            data.to_one.clear();
            data.to_many.clear();
        }
        self.set_pinned(identity, false);
        true
    }

    /// Removes the object and its snapshot; the object becomes TRANSIENT.
    pub fn unregister(&mut self, identity: &Identity) -> Option<EntityRef> {
        self.snapshots.remove(identity);
        let slot = self.objects.remove(identity)?;
        let object = slot.strong.or_else(|| slot.weak.upgrade())?;
        {
            let mut data = object.write();
            data.state = PersistenceState::Transient;
            data.context = None;
        }
        Some(object)
    }

    /// Moves an object to `to`, enforcing the lifecycle.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidStateTransition`] for a transition outside
    /// the lifecycle.
    pub fn transition(&mut self, object: &EntityRef, to: PersistenceState) -> CoreResult<()> {
        let identity = {
            let mut data = object.write();
            if !data.state.can_transition_to(to) {
                return Err(CoreError::invalid_state(
                    object_name(object, data.identity.as_ref()),
                    data.state,
                    format!("move to {to}"),
                ));
            }
            data.state = to;
            data.identity.clone()
        };
        if let Some(id) = identity {
            self.set_pinned(&id, to.is_dirty());
        }
        Ok(())
    }

    fn set_pinned(&mut self, identity: &Identity, pinned: bool) {
        if let Some(slot) = self.objects.get_mut(identity) {
            if pinned {
                if slot.strong.is_none() {
                    slot.strong = slot.weak.upgrade();
                }
            } else {
                slot.strong = None;
            }
        }
    }

    /// Current snapshot of a row.
    #[must_use]
    pub fn snapshot(&self, identity: &Identity) -> Option<Arc<Snapshot>> {
        self.snapshots.get(identity).cloned()
    }

    /// Replaces the snapshot of a row.
    pub fn set_snapshot(&mut self, identity: Identity, values: BTreeMap<String, Value>, version: u64) {
        self.snapshots
            .insert(identity, Arc::new(Snapshot::new(values, version)));
    }

    /// Drops the snapshot of a row.
    pub fn remove_snapshot(&mut self, identity: &Identity) {
        self.snapshots.remove(identity);
    }

    /// Advances the version clock and returns the new version.
    pub fn next_version(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Latest version handed out.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.clock
    }

    /// Re-keys an object after its first commit.
    pub fn replace_identity(&mut self, old: &Identity, new: Identity) {
        if let Some(slot) = self.objects.remove(old) {
            if let Some(object) = slot.strong.clone().or_else(|| slot.weak.upgrade()) {
                object.write().identity = Some(new.clone());
            }
            self.objects.insert(new.clone(), slot);
        }
        if let Some(snapshot) = self.snapshots.remove(old) {
            self.snapshots.insert(new, snapshot);
        }
    }

    /// Rewrites every relationship reference from `old` to `new`.
    pub(crate) fn rewrite_references(&self, mapping: &HashMap<Identity, Identity>) {
        if mapping.is_empty() {
            return;
        }
        for object in self.objects() {
            let mut data = object.write();
            for target in data.to_one.values_mut().flatten() {
                if let Some(new) = mapping.get(target) {
                    *target = new.clone();
                }
            }
            for fault in data.to_many.values_mut() {
                if let Fault::Loaded(list) = fault {
                    for member in list.iter_mut() {
                        if let Some(new) = mapping.get(member) {
                            *member = new.clone();
                        }
                    }
                }
            }
        }
    }

    /// Live objects in registration order.
    #[must_use]
    pub fn objects(&self) -> Vec<EntityRef> {
        let mut slots: Vec<&Slot> = self.objects.values().collect();
        slots.sort_by_key(|s| s.order);
        slots
            .into_iter()
            .filter_map(|s| s.strong.clone().or_else(|| s.weak.upgrade()))
            .collect()
    }

    /// Objects with pending changes, in registration order.
    #[must_use]
    pub fn dirty_objects(&self) -> Vec<EntityRef> {
        let mut slots: Vec<&Slot> = self.objects.values().filter(|s| s.strong.is_some()).collect();
        slots.sort_by_key(|s| s.order);
        slots.into_iter().filter_map(|s| s.strong.clone()).collect()
    }

    /// Forgets clean objects the application no longer references.
    ///
    /// Returns the number of evicted entries.
    pub fn evict_unreferenced(&mut self) -> usize {
        let dead: Vec<Identity> = self
            .objects
            .iter()
            .filter(|(_, s)| s.strong.is_none() && s.weak.upgrade().is_none())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &dead {
            self.objects.remove(id);
            self.snapshots.remove(id);
        }
        if !dead.is_empty() {
            tracing::debug!(evicted = dead.len(), "evicted unreferenced objects");
        }
        dead.len()
    }

    /// Number of registry entries, including ones not yet evicted.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("context", &self.context)
            .field("objects", &self.objects.len())
            .field("snapshots", &self.snapshots.len())
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

fn object_name(object: &EntityRef, identity: Option<&Identity>) -> String {
    identity.map_or_else(|| object.entity_name().to_string(), ToString::to_string)
}
