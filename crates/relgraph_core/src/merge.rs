//! Merging peer events into a context's registry.
//!
//! Unmodified copies (COMMITTED, HOLLOW, or only a cached snapshot) take
//! incoming rows as they are. Copies with uncommitted work (MODIFIED,
//! DELETED) are never overwritten silently: each collision becomes a
//! [`MergeConflict`] that the delegate, or the configured policy, settles.
//!
//! Conflicts are collected and decided before the merge itself, so the
//! delegate never runs under the context lock.

use crate::delegate::ContextDelegate;
use crate::diff::ChangeSet;
use crate::object::{target_from_row, EntityRef, Fault};
use crate::registry::Registry;
use crate::state::PersistenceState;
use relgraph_codec::{Identity, Value};
use relgraph_schema::{Entity, Schema};
use relgraph_sync_protocol::{
    ArcChange, ArcOp, ChangeKind, GraphDiffEvent, LocalChange, MergeConflict, MergeDecision, MergePolicy,
    ObjectChange,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Outcome of merging one event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Sequence of the merged event.
    pub sequence: u64,
    /// Identities whose local copy or snapshot took incoming values.
    pub applied: Vec<Identity>,
    /// Identities whose incoming change was rejected.
    pub skipped: Vec<Identity>,
    /// Identities unregistered because the peer deleted them.
    pub removed: Vec<Identity>,
    /// Identities turned HOLLOW.
    pub invalidated: Vec<Identity>,
    /// Arc changes applied to loaded to-many lists.
    pub arcs: usize,
    /// Changes for objects this context does not know.
    pub ignored: usize,
}

impl MergeReport {
    /// Returns true if the event left the context unchanged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
            && self.removed.is_empty()
            && self.invalidated.is_empty()
            && self.arcs == 0
    }
}

/// Delegate decisions keyed by identity, with the conflict each one answered.
pub(crate) type Decisions = HashMap<Identity, (MergeConflict, MergeDecision)>;

/// Asks the delegate about each conflict. Conflicts it leaves open are
/// settled by the policy during the merge.
pub(crate) fn decide(delegate: &dyn ContextDelegate, conflicts: Vec<MergeConflict>) -> Decisions {
    conflicts
        .into_iter()
        .filter_map(|conflict| {
            let decision = delegate.should_merge_changes(&conflict)?;
            Some((conflict.identity.clone(), (conflict, decision)))
        })
        .collect()
}

pub(crate) struct Merger<'a> {
    pub schema: &'a Schema,
    pub policy: MergePolicy,
}

impl Merger<'_> {
    /// Conflicts `event` raises against uncommitted local work.
    pub fn conflicts(&self, registry: &Registry, changes: &ChangeSet, event: &GraphDiffEvent) -> Vec<MergeConflict> {
        event
            .changes
            .iter()
            .filter_map(|change| {
                let entity = self.schema.get_entity(change.identity.entity_name())?;
                let object = registry.lookup(&change.identity)?;
                matches!(object.state(), PersistenceState::Modified | PersistenceState::Deleted)
                    .then(|| conflict_for(entity, &object, change, changes))
            })
            .collect()
    }

    /// Applies `event`. A decision is used only while its conflict still
    /// matches the registry; otherwise the policy decides. Returns the
    /// report and the conflicts that were skipped.
    pub fn merge(
        &self,
        registry: &mut Registry,
        changes: &mut ChangeSet,
        event: &GraphDiffEvent,
        decisions: &Decisions,
    ) -> (MergeReport, Vec<MergeConflict>) {
        let mut report = MergeReport {
            sequence: event.sequence,
            ..MergeReport::default()
        };
        let mut skipped = Vec::new();
        let version = registry.next_version();

        for change in &event.changes {
            let Some(entity) = self.schema.get_entity(change.identity.entity_name()) else {
                tracing::warn!(identity = %change.identity, "ignoring change for unknown entity");
                report.ignored += 1;
                continue;
            };
            match registry.lookup(&change.identity) {
                None => merge_absent(registry, change, version, &mut report),
                Some(object) => match object.state() {
                    PersistenceState::Committed | PersistenceState::Hollow => {
                        merge_clean(registry, changes, entity, &object, change, version, &mut report);
                    }
                    PersistenceState::Modified | PersistenceState::Deleted => {
                        let conflict = conflict_for(entity, &object, change, changes);
                        let decision = match decisions.get(&change.identity) {
                            Some((seen, decision)) if *seen == conflict => decision.clone(),
                            _ => self.policy.decide(&conflict),
                        };
                        match merge_conflict(registry, changes, entity, &object, change, decision, version) {
                            Settled::Applied => report.applied.push(change.identity.clone()),
                            Settled::Removed => report.removed.push(change.identity.clone()),
                            Settled::Skipped => {
                                tracing::warn!(
                                    identity = %change.identity,
                                    local = ?conflict.local,
                                    incoming = ?change.kind,
                                    "skipped conflicting peer change"
                                );
                                report.skipped.push(change.identity.clone());
                                skipped.push(conflict);
                            }
                        }
                    }
                    PersistenceState::New | PersistenceState::Transient => report.ignored += 1,
                },
            }
        }

        for identity in &event.invalidated {
            match registry.lookup(identity) {
                Some(object) if object.state() == PersistenceState::Committed => {
                    registry.invalidate(identity);
                    report.invalidated.push(identity.clone());
                }
                Some(_) => {}
                None => registry.remove_snapshot(identity),
            }
        }

        for arc in &event.arcs {
            if apply_arc(registry, arc) {
                report.arcs += 1;
            }
        }

        tracing::info!(
            sequence = event.sequence,
            source = %event.source,
            applied = report.applied.len(),
            skipped = report.skipped.len(),
            removed = report.removed.len(),
            invalidated = report.invalidated.len(),
            "merged peer event"
        );
        (report, skipped)
    }
}

fn conflict_for(entity: &Entity, object: &EntityRef, change: &ObjectChange, changes: &ChangeSet) -> MergeConflict {
    let local = if object.state() == PersistenceState::Deleted {
        LocalChange::Deleted
    } else {
        LocalChange::Modified
    };
    MergeConflict {
        identity: change.identity.clone(),
        local,
        incoming_kind: change.kind,
        incoming: change.snapshot.clone(),
        incoming_columns: change.changed_columns.iter().cloned().collect(),
        locally_modified: locally_modified_columns(entity, changes, &change.identity),
    }
}

enum Settled {
    Applied,
    Removed,
    Skipped,
}

/// Applies a decided conflict.
fn merge_conflict(
    registry: &mut Registry,
    changes: &mut ChangeSet,
    entity: &Entity,
    object: &EntityRef,
    change: &ObjectChange,
    decision: MergeDecision,
    version: u64,
) -> Settled {
    let identity = &change.identity;
    let deleted = object.state() == PersistenceState::Deleted;
    match (decision, change.kind, &change.snapshot) {
        (MergeDecision::Approve, ChangeKind::Delete, _) => {
            if deleted {
                changes.remove(identity);
                registry.unregister(identity);
                return Settled::Removed;
            }
            // Local edits survive as a fresh insert under the same key.
            registry.remove_snapshot(identity);
            changes.remove(identity);
            registry.attach(identity.clone(), object, PersistenceState::New);
        }
        (MergeDecision::Approve, _, Some(row)) => {
            let columns: BTreeSet<String> = row.keys().cloned().collect();
            let names = apply_columns(entity, object, row, &columns);
            registry.set_snapshot(identity.clone(), row.clone(), version);
            if deleted {
                changes.remove(identity);
                registry.attach(identity.clone(), object, PersistenceState::Committed);
            } else {
                forget(changes, identity, &names);
                settle(registry, changes, object, identity);
            }
        }
        (MergeDecision::Partial(columns), ChangeKind::Insert | ChangeKind::Update, Some(row)) => {
            let names = apply_columns(entity, object, row, &columns);
            registry.set_snapshot(identity.clone(), row.clone(), version);
            forget(changes, identity, &names);
            if !deleted {
                settle(registry, changes, object, identity);
            }
        }
        _ => return Settled::Skipped,
    }
    Settled::Applied
}

fn merge_absent(registry: &mut Registry, change: &ObjectChange, version: u64, report: &mut MergeReport) {
    let identity = &change.identity;
    if registry.snapshot(identity).is_none() {
        report.ignored += 1;
        return;
    }
    match &change.snapshot {
        Some(row) if change.kind != ChangeKind::Delete => {
            registry.set_snapshot(identity.clone(), row.clone(), version);
            report.applied.push(identity.clone());
        }
        _ => {
            registry.remove_snapshot(identity);
            report.removed.push(identity.clone());
        }
    }
}

fn merge_clean(
    registry: &mut Registry,
    changes: &mut ChangeSet,
    entity: &Entity,
    object: &EntityRef,
    change: &ObjectChange,
    version: u64,
    report: &mut MergeReport,
) {
    let identity = &change.identity;
    match (&change.kind, &change.snapshot) {
        (ChangeKind::Insert | ChangeKind::Update, Some(row)) => {
            object.write().load_row(entity, row);
            registry.set_snapshot(identity.clone(), row.clone(), version);
            if object.state() == PersistenceState::Hollow {
                registry.attach(identity.clone(), object, PersistenceState::Committed);
            }
            report.applied.push(identity.clone());
        }
        _ => {
            changes.remove(identity);
            registry.unregister(identity);
            report.removed.push(identity.clone());
        }
    }
}

/// Copies `columns` of `row` into the object. Returns the attribute and
/// relationship names that changed.
fn apply_columns(
    entity: &Entity,
    object: &EntityRef,
    row: &BTreeMap<String, Value>,
    columns: &BTreeSet<String>,
) -> Vec<String> {
    let mut names = Vec::new();
    let mut data = object.write();
    for column in columns {
        if let Some(attribute) = entity.attribute_for_column(column) {
            let value = row.get(column).cloned().unwrap_or_default();
            data.values.insert(attribute.name.clone(), value);
            names.push(attribute.name.clone());
        }
    }
    for rel in entity.foreign_key_relationships() {
        if rel.source_columns().any(|c| columns.contains(c)) {
            data.to_one.insert(rel.name.clone(), target_from_row(rel, row));
            names.push(rel.name.clone());
        }
    }
    names
}

fn forget(changes: &mut ChangeSet, identity: &Identity, names: &[String]) {
    if let Some(diff) = changes.diff_mut(identity) {
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        diff.forget(&names);
    }
    changes.prune_empty(identity);
}

/// A MODIFIED object without pending changes is COMMITTED again.
fn settle(registry: &mut Registry, changes: &ChangeSet, object: &EntityRef, identity: &Identity) {
    if object.state() == PersistenceState::Modified && !changes.has_changes(identity) {
        if let Err(error) = registry.transition(object, PersistenceState::Committed) {
            tracing::debug!(identity = %identity, error = %error, "object stays modified");
        }
    }
}

/// Columns with pending local changes.
fn locally_modified_columns(entity: &Entity, changes: &ChangeSet, identity: &Identity) -> BTreeSet<String> {
    let mut columns = BTreeSet::new();
    let Some(diff) = changes.diff(identity) else {
        return columns;
    };
    for name in diff.attributes().keys() {
        if let Some(attribute) = entity.get_attribute(name) {
            columns.insert(attribute.column.clone());
        }
    }
    for name in diff.to_one().keys() {
        if let Some(rel) = entity.get_relationship(name) {
            if entity.owns_foreign_key(rel) {
                columns.extend(rel.source_columns().map(str::to_string));
            }
        }
    }
    columns
}

/// Applies a membership change to a loaded list of an unmodified owner.
fn apply_arc(registry: &Registry, arc: &ArcChange) -> bool {
    let Some(owner) = registry.lookup(&arc.source) else {
        return false;
    };
    if owner.state() != PersistenceState::Committed {
        return false;
    }
    let mut data = owner.write();
    let Some(Fault::Loaded(members)) = data.to_many.get_mut(&arc.relationship) else {
        return false;
    };
    match arc.op {
        ArcOp::Add if !members.contains(&arc.target) => members.push(arc.target.clone()),
        ArcOp::Add => return false,
        ArcOp::Remove => {
            let before = members.len();
            members.retain(|m| m != &arc.target);
            if members.len() == before {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::EdgeChange;
    use parking_lot::Mutex;
    use relgraph_schema::{Attribute, ColumnType, Relationship};
    use relgraph_sync_protocol::ContextId;

    fn schema() -> Schema {
        Schema::builder()
            .entity(
                Entity::new("Artist", "ARTIST")
                    .attribute(Attribute::new("id", "ID", ColumnType::Integer).primary_key())
                    .attribute(Attribute::new("name", "NAME", ColumnType::VarChar))
                    .attribute(Attribute::new("city", "CITY", ColumnType::VarChar))
                    .relationship(
                        Relationship::to_many("paintings", "Painting")
                            .join("ID", "ARTIST_ID")
                            .reverse("artist"),
                    ),
            )
            .entity(
                Entity::new("Painting", "PAINTING")
                    .attribute(Attribute::new("id", "ID", ColumnType::Integer).primary_key())
                    .relationship(
                        Relationship::to_one("artist", "Artist")
                            .join("ARTIST_ID", "ID")
                            .reverse("paintings"),
                    ),
            )
            .build()
            .unwrap()
    }

    fn artist_id(id: i64) -> Identity {
        Identity::single("Artist", "ID", id)
    }

    fn row(id: i64, name: &str, city: &str) -> BTreeMap<String, Value> {
        [
            ("ID".to_string(), Value::Integer(id)),
            ("NAME".to_string(), Value::from(name)),
            ("CITY".to_string(), Value::from(city)),
        ]
        .into_iter()
        .collect()
    }

    struct Fixture {
        schema: Schema,
        registry: Registry,
        changes: ChangeSet,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                schema: schema(),
                registry: Registry::new(ContextId::new(2)),
                changes: ChangeSet::new(),
            }
        }

        fn committed(&mut self, id: i64, name: &str) -> EntityRef {
            let object = EntityRef::new("Artist");
            let values = row(id, name, "Paris");
            object
                .write()
                .load_row(self.schema.entity("Artist").unwrap(), &values);
            self.registry
                .attach(artist_id(id), &object, PersistenceState::Committed);
            self.registry.set_snapshot(artist_id(id), values, 1);
            object
        }

        fn modify(&mut self, object: &EntityRef, field: &str, value: &str) {
            let id = object.identity().unwrap();
            let previous = object.value(field);
            object.write().values.insert(field.into(), value.into());
            self.changes
                .record_scalar_change(&id, field, previous, value.into());
            self.registry
                .transition(object, PersistenceState::Modified)
                .unwrap();
        }

        fn merge(&mut self, event: &GraphDiffEvent, delegate: Option<&dyn ContextDelegate>, policy: MergePolicy) -> MergeReport {
            let merger = Merger {
                schema: &self.schema,
                policy,
            };
            let decisions = match delegate {
                Some(d) => decide(d, merger.conflicts(&self.registry, &self.changes, event)),
                None => Decisions::new(),
            };
            let (report, skipped) = merger.merge(&mut self.registry, &mut self.changes, event, &decisions);
            if let Some(d) = delegate {
                skipped.iter().for_each(|c| d.conflict_skipped(c));
            }
            report
        }
    }

    fn update_event(id: i64, name: &str, city: &str, columns: &[&str]) -> GraphDiffEvent {
        let mut event = GraphDiffEvent::new(ContextId::new(1));
        event.sequence = 7;
        event.changes.push(ObjectChange::update(
            artist_id(id),
            row(id, name, city),
            columns.iter().map(|c| c.to_string()).collect(),
        ));
        event
    }

    #[test]
    fn committed_copy_takes_incoming_values() {
        let mut f = Fixture::new();
        let artist = f.committed(1, "Monet");
        let report = f.merge(&update_event(1, "Manet", "Paris", &["NAME"]), None, MergePolicy::KeepLocal);

        assert_eq!(report.applied, vec![artist_id(1)]);
        assert_eq!(artist.value("name"), Value::from("Manet"));
        let snapshot = f.registry.snapshot(&artist_id(1)).unwrap();
        assert_eq!(snapshot.get("NAME"), Some(&Value::from("Manet")));
        assert_eq!(snapshot.version(), f.registry.version());
    }

    #[test]
    fn modified_copy_is_kept_by_default() {
        let mut f = Fixture::new();
        let artist = f.committed(1, "Monet");
        f.modify(&artist, "name", "Local");

        let report = f.merge(&update_event(1, "Remote", "Paris", &["NAME"]), None, MergePolicy::KeepLocal);
        assert_eq!(report.skipped, vec![artist_id(1)]);
        assert_eq!(artist.value("name"), Value::from("Local"));
        assert_eq!(artist.state(), PersistenceState::Modified);
        assert!(f.changes.has_changes(&artist_id(1)));
        // The snapshot is untouched too.
        assert_eq!(
            f.registry.snapshot(&artist_id(1)).unwrap().get("NAME"),
            Some(&Value::from("Monet"))
        );
    }

    #[test]
    fn disjoint_policy_takes_other_columns() {
        let mut f = Fixture::new();
        let artist = f.committed(1, "Monet");
        f.modify(&artist, "name", "Local");

        let report = f.merge(
            &update_event(1, "Remote", "Giverny", &["NAME", "CITY"]),
            None,
            MergePolicy::MergeDisjoint,
        );
        assert_eq!(report.applied, vec![artist_id(1)]);
        assert_eq!(artist.value("name"), Value::from("Local"));
        assert_eq!(artist.value("city"), Value::from("Giverny"));
        assert_eq!(artist.state(), PersistenceState::Modified);
    }

    #[test]
    fn approve_overwrites_and_settles() {
        let mut f = Fixture::new();
        let artist = f.committed(1, "Monet");
        f.modify(&artist, "name", "Local");

        f.merge(&update_event(1, "Remote", "Paris", &["NAME"]), None, MergePolicy::AcceptRemote);
        assert_eq!(artist.value("name"), Value::from("Remote"));
        assert_eq!(artist.state(), PersistenceState::Committed);
        assert!(!f.changes.has_changes(&artist_id(1)));
    }

    struct Recording {
        decision: Option<MergeDecision>,
        skipped: Mutex<Vec<Identity>>,
    }

    impl ContextDelegate for Recording {
        fn should_merge_changes(&self, _conflict: &MergeConflict) -> Option<MergeDecision> {
            self.decision.clone()
        }

        fn conflict_skipped(&self, conflict: &MergeConflict) {
            self.skipped.lock().push(conflict.identity.clone());
        }
    }

    #[test]
    fn delegate_overrides_policy() {
        let mut f = Fixture::new();
        let artist = f.committed(1, "Monet");
        f.modify(&artist, "name", "Local");
        let delegate = Recording {
            decision: Some(MergeDecision::Reject),
            skipped: Mutex::new(Vec::new()),
        };

        f.merge(
            &update_event(1, "Remote", "Paris", &["NAME"]),
            Some(&delegate as &dyn ContextDelegate),
            MergePolicy::AcceptRemote,
        );
        assert_eq!(artist.value("name"), Value::from("Local"));
        assert_eq!(*delegate.skipped.lock(), vec![artist_id(1)]);
    }

    #[test]
    fn stale_decision_falls_back_to_policy() {
        let mut f = Fixture::new();
        let artist = f.committed(1, "Monet");
        f.modify(&artist, "name", "Local");
        let event = update_event(1, "Remote", "Paris", &["NAME"]);
        let merger_schema = schema();
        let merger = Merger {
            schema: &merger_schema,
            policy: MergePolicy::KeepLocal,
        };
        let delegate = Recording {
            decision: Some(MergeDecision::Approve),
            skipped: Mutex::new(Vec::new()),
        };
        let decisions = decide(&delegate, merger.conflicts(&f.registry, &f.changes, &event));
        assert_eq!(decisions.len(), 1);

        // The local work changed after the delegate answered.
        f.modify(&artist, "city", "Giverny");
        let (report, skipped) = merger.merge(&mut f.registry, &mut f.changes, &event, &decisions);
        assert_eq!(report.skipped, vec![artist_id(1)]);
        assert_eq!(skipped[0].locally_modified.len(), 2);
        assert_eq!(artist.value("name"), Value::from("Local"));
    }

    #[test]
    fn remote_delete() {
        let mut f = Fixture::new();
        let clean = f.committed(1, "Monet");
        let edited = f.committed(2, "Degas");
        f.modify(&edited, "name", "Local");

        let mut event = GraphDiffEvent::new(ContextId::new(1));
        event.changes.push(ObjectChange::delete(artist_id(1)));
        event.changes.push(ObjectChange::delete(artist_id(2)));
        let report = f.merge(&event, None, MergePolicy::AcceptRemote);

        assert_eq!(report.removed, vec![artist_id(1)]);
        assert_eq!(clean.state(), PersistenceState::Transient);
        // Approved delete of a modified copy re-inserts the local edits.
        assert_eq!(edited.state(), PersistenceState::New);
        assert_eq!(edited.identity(), Some(artist_id(2)));
        assert!(f.registry.snapshot(&artist_id(2)).is_none());
    }

    #[test]
    fn invalidation_and_absent_snapshots() {
        let mut f = Fixture::new();
        let artist = f.committed(1, "Monet");
        f.registry.set_snapshot(artist_id(9), row(9, "Gone", "X"), 1);

        let mut event = update_event(9, "Cached", "Y", &["NAME"]);
        event.invalidated.push(artist_id(1));
        let report = f.merge(&event, None, MergePolicy::KeepLocal);

        assert_eq!(artist.state(), PersistenceState::Hollow);
        assert_eq!(report.invalidated, vec![artist_id(1)]);
        assert_eq!(
            f.registry.snapshot(&artist_id(9)).unwrap().get("NAME"),
            Some(&Value::from("Cached"))
        );
        assert_eq!(report.ignored, 0);

        let unknown = f.merge(&update_event(50, "?", "?", &["NAME"]), None, MergePolicy::KeepLocal);
        assert_eq!(unknown.ignored, 1);
    }

    #[test]
    fn arcs_update_loaded_lists_of_clean_owners() {
        let mut f = Fixture::new();
        let artist = f.committed(1, "Monet");
        artist
            .write()
            .to_many
            .insert("paintings".into(), Fault::Loaded(Vec::new()));
        let painting = Identity::single("Painting", "ID", 5i64);

        let mut event = GraphDiffEvent::new(ContextId::new(1));
        event.arcs.push(ArcChange {
            source: artist_id(1),
            relationship: "paintings".into(),
            target: painting.clone(),
            op: ArcOp::Add,
        });
        let report = f.merge(&event, None, MergePolicy::KeepLocal);
        assert_eq!(report.arcs, 1);
        assert_eq!(artist.to_many("paintings"), Fault::Loaded(vec![painting]));

        // To-many deltas are not column changes.
        f.changes.record_edge_change(
            &artist_id(1),
            "paintings",
            EdgeChange::Add(Identity::single("Painting", "ID", 6i64)),
        );
        assert!(locally_modified_columns(f.schema.entity("Artist").unwrap(), &f.changes, &artist_id(1)).is_empty());
    }
}
