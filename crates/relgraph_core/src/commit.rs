//! Commit planning: turns a context's pending changes into ordered
//! statement batches and the graph-diff event describing them.
//!
//! Batches run in three phases: every INSERT batch (parent tables first),
//! then every UPDATE batch (parent tables first), then every DELETE batch
//! (child tables first). Rows of a self-referencing table are ordered
//! along the reflexive relationship.

use crate::config::ChannelConfig;
use crate::diff::ChangeSet;
use crate::error::{CoreError, CoreResult};
use crate::object::{target_from_row, EntityRef, ObjectData};
use crate::pk::PkGenerator;
use crate::query::{DmlStatement, DmlWriter};
use crate::registry::Registry;
use crate::state::PersistenceState;
use relgraph_codec::{Identity, Value};
use relgraph_driver::LobLocator;
use relgraph_schema::{topological_order, Entity, EntitySorter, Relationship, Schema};
use relgraph_sync_protocol::{ArcChange, ArcOp, ContextId, GraphDiffEvent, ObjectChange};
use std::collections::{BTreeMap, HashMap};

/// Statement kind of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    /// `INSERT`
    Insert,
    /// `UPDATE`
    Update,
    /// `DELETE`
    Delete,
}

/// Large-object content streamed after a row was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingLobs {
    /// `SELECT ... FOR UPDATE` locking the row.
    pub select: DmlStatement,
    /// Cells and their content.
    pub writes: Vec<(LobLocator, Vec<u8>)>,
}

/// One row of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRow {
    /// Permanent identity of the row.
    pub identity: Identity,
    /// Statement to execute.
    pub statement: DmlStatement,
    /// Two-phase large-object writes.
    pub lobs: Option<PendingLobs>,
    /// The statement is qualified on locking columns, so an update count of
    /// zero means the row changed underneath.
    pub check_update_count: bool,
}

/// Rows of one entity and statement kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitBatch {
    /// Entity name.
    pub entity: String,
    /// Statement kind.
    pub kind: BatchKind,
    /// Rows in execution order.
    pub rows: Vec<BatchRow>,
}

/// Registry updates to apply once the store transaction committed.
#[derive(Debug, Default)]
pub(crate) struct CommitOutcome {
    /// Temporary to permanent identities.
    pub mapping: HashMap<Identity, Identity>,
    /// Post-commit snapshots by permanent identity.
    pub snapshots: Vec<(Identity, BTreeMap<String, Value>)>,
    /// Registered identities of objects that become COMMITTED.
    pub committed: Vec<Identity>,
    /// Identities of deleted objects.
    pub deleted: Vec<Identity>,
    /// Identities whose rows changed without a full snapshot.
    pub stale: Vec<Identity>,
}

/// Ordered batches of one commit plus the event to publish afterwards.
#[derive(Debug)]
pub struct CommitPlan {
    batches: Vec<CommitBatch>,
    event: GraphDiffEvent,
    pub(crate) outcome: CommitOutcome,
}

impl CommitPlan {
    /// Batches in execution order.
    #[must_use]
    pub fn batches(&self) -> &[CommitBatch] {
        &self.batches
    }

    /// Event describing the committed changes, sequence not yet assigned.
    #[must_use]
    pub fn event(&self) -> &GraphDiffEvent {
        &self.event
    }

    /// Returns true if there is nothing to write.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty() && self.event.is_empty()
    }

    /// Total number of rows across batches.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.batches.iter().map(|b| b.rows.len()).sum()
    }

    /// Number of rows of one kind.
    #[must_use]
    pub fn count(&self, kind: BatchKind) -> usize {
        self.batches
            .iter()
            .filter(|b| b.kind == kind)
            .map(|b| b.rows.len())
            .sum()
    }
}

struct PendingRow<'s> {
    identity: Identity,
    entity: &'s Entity,
    /// Full row for inserts, changed columns for updates.
    values: BTreeMap<String, Value>,
    qualifier: Vec<(String, Value)>,
    check: bool,
    /// Row used to find reflexive parents.
    links: BTreeMap<String, Value>,
    snapshot: Option<BTreeMap<String, Value>>,
}

/// Builds [`CommitPlan`] values.
pub(crate) struct CommitPlanner<'a> {
    pub schema: &'a Schema,
    pub config: &'a ChannelConfig,
    pub keys: &'a dyn PkGenerator,
    pub source: ContextId,
    /// Peek at generated keys instead of reserving them.
    pub preview: bool,
}

impl<'a> CommitPlanner<'a> {
    pub fn plan(&self, registry: &Registry, changes: &ChangeSet) -> CoreResult<CommitPlan> {
        let mut new_objects = Vec::new();
        let mut modified = Vec::new();
        let mut deleted = Vec::new();
        for object in registry.dirty_objects() {
            let Some(identity) = object.identity() else {
                continue;
            };
            match object.state() {
                PersistenceState::New => new_objects.push((identity, object)),
                PersistenceState::Modified => modified.push((identity, object)),
                PersistenceState::Deleted => deleted.push((identity, object)),
                _ => {}
            }
        }

        let mut outcome = CommitOutcome::default();

        // Keys first: foreign keys of new rows refer to them.
        let mut new_keys = Vec::with_capacity(new_objects.len());
        let mut peeked: HashMap<&str, usize> = HashMap::new();
        for (identity, object) in &new_objects {
            let entity = self.schema.entity(object.entity_name())?;
            let permanent = if identity.is_temporary() {
                let permanent = self.permanent_identity(entity, object, &mut peeked)?;
                outcome.mapping.insert(identity.clone(), permanent.clone());
                permanent
            } else {
                identity.clone()
            };
            new_keys.push(permanent);
        }

        let mut inserts = Vec::new();
        for ((identity, object), permanent) in new_objects.iter().zip(new_keys) {
            let entity = self.schema.entity(object.entity_name())?;
            let row = self.object_row(entity, &object.read(), &permanent, &outcome.mapping)?;
            inserts.push(PendingRow {
                identity: permanent,
                entity,
                values: row.clone(),
                qualifier: Vec::new(),
                check: false,
                links: row.clone(),
                snapshot: Some(row),
            });
            outcome.committed.push(identity.clone());
        }

        let mut updates = Vec::new();
        for (identity, object) in &modified {
            let entity = self.schema.entity(object.entity_name())?;
            let set = match changes.diff(identity) {
                Some(diff) => self.changed_columns(entity, diff, &outcome.mapping)?,
                None => BTreeMap::new(),
            };
            outcome.committed.push(identity.clone());
            if set.is_empty() {
                continue;
            }
            let snapshot = registry.snapshot(identity);
            let (qualifier, check) = qualifier(entity, identity, snapshot.as_ref().map(|s| s.values()));
            let mut after = match &snapshot {
                Some(s) => s.values().clone(),
                None => self.object_row(entity, &object.read(), identity, &outcome.mapping)?,
            };
            after.extend(set.clone());
            updates.push(PendingRow {
                identity: identity.clone(),
                entity,
                values: set,
                qualifier,
                check,
                links: BTreeMap::new(),
                snapshot: Some(after),
            });
        }

        let mut deletes = Vec::new();
        for (identity, object) in &deleted {
            let entity = self.schema.entity(object.entity_name())?;
            let snapshot = registry.snapshot(identity);
            let (qualifier, check) = qualifier(entity, identity, snapshot.as_ref().map(|s| s.values()));
            let links = match &snapshot {
                Some(s) => s.values().clone(),
                None => self.object_row(entity, &object.read(), identity, &outcome.mapping)?,
            };
            deletes.push(PendingRow {
                identity: identity.clone(),
                entity,
                values: BTreeMap::new(),
                qualifier,
                check,
                links,
                snapshot: None,
            });
            outcome.deleted.push(identity.clone());
        }

        self.derive_foreign_keys(registry, changes, &outcome.mapping, &mut inserts, &mut updates, &deletes)?;

        let sorter = EntitySorter::new(self.schema).allow_cycles(self.config.deferred_constraints);
        let mut event = GraphDiffEvent::new(self.source);
        let writer = DmlWriter::new(&self.config.sql, &self.config.lob);
        let mut batches = Vec::new();

        let insert_order = sorter
            .sort_for_insert(inserts.iter().map(|r| r.entity.name.as_str()))
            .map_err(CoreError::from_sort)?;
        for name in &insert_order {
            let rows = self.order_reflexive(name, take_entity(&mut inserts, name), false)?;
            let mut batch = Vec::with_capacity(rows.len());
            for row in rows {
                let (statement, lobs) = writer.insert(row.entity, &row.values);
                let lobs = pending_lobs(&writer, &row, lobs);
                let snapshot = row.snapshot.unwrap_or_default();
                event.changes.push(ObjectChange::insert(row.identity.clone(), snapshot.clone()));
                outcome.snapshots.push((row.identity.clone(), snapshot));
                batch.push(BatchRow {
                    identity: row.identity,
                    statement,
                    lobs,
                    check_update_count: false,
                });
            }
            batches.push(CommitBatch {
                entity: name.clone(),
                kind: BatchKind::Insert,
                rows: batch,
            });
        }

        let update_order = sorter
            .sort_for_insert(updates.iter().map(|r| r.entity.name.as_str()))
            .map_err(CoreError::from_sort)?;
        for name in &update_order {
            let mut batch = Vec::new();
            for row in take_entity(&mut updates, name) {
                let (statement, lobs) = writer.update(row.entity, &row.values, &row.qualifier);
                let lobs = pending_lobs(&writer, &row, lobs);
                let columns: Vec<String> = row.values.keys().cloned().collect();
                match row.snapshot {
                    Some(snapshot) => {
                        event
                            .changes
                            .push(ObjectChange::update(row.identity.clone(), snapshot.clone(), columns));
                        outcome.snapshots.push((row.identity.clone(), snapshot));
                    }
                    None => {
                        event.invalidated.push(row.identity.clone());
                        outcome.stale.push(row.identity.clone());
                    }
                }
                batch.push(BatchRow {
                    identity: row.identity,
                    statement,
                    lobs,
                    check_update_count: row.check,
                });
            }
            batches.push(CommitBatch {
                entity: name.clone(),
                kind: BatchKind::Update,
                rows: batch,
            });
        }

        let delete_order = sorter
            .sort_for_delete(deletes.iter().map(|r| r.entity.name.as_str()))
            .map_err(CoreError::from_sort)?;
        for name in &delete_order {
            let rows = self.order_reflexive(name, take_entity(&mut deletes, name), true)?;
            let batch = rows
                .into_iter()
                .map(|row| {
                    event.changes.push(ObjectChange::delete(row.identity.clone()));
                    BatchRow {
                        statement: writer.delete(row.entity, &row.qualifier),
                        identity: row.identity,
                        lobs: None,
                        check_update_count: row.check,
                    }
                })
                .collect();
            batches.push(CommitBatch {
                entity: name.clone(),
                kind: BatchKind::Delete,
                rows: batch,
            });
        }

        event.arcs = arcs(changes, &outcome.mapping, &outcome.deleted);

        let plan = CommitPlan {
            batches,
            event,
            outcome,
        };
        tracing::debug!(
            batches = plan.batches.len(),
            inserts = plan.count(BatchKind::Insert),
            updates = plan.count(BatchKind::Update),
            deletes = plan.count(BatchKind::Delete),
            arcs = plan.event.arcs.len(),
            "planned commit"
        );
        Ok(plan)
    }

    /// Permanent identity of a NEW object: caller-set key values, or a
    /// generated key.
    fn permanent_identity<'e>(
        &self,
        entity: &'e Entity,
        object: &EntityRef,
        peeked: &mut HashMap<&'e str, usize>,
    ) -> CoreResult<Identity> {
        let data = object.read();
        let mut key = Vec::new();
        let mut missing = 0;
        for attribute in entity.primary_key() {
            match data.values.get(&attribute.name) {
                Some(v) if !v.is_null() => key.push((attribute.column.clone(), v.clone())),
                _ => missing += 1,
            }
        }
        if missing == 0 {
            return Ok(Identity::permanent(entity.name.clone(), key));
        }
        if !key.is_empty() {
            return Err(CoreError::MissingPrimaryKey {
                entity: entity.name.clone(),
                message: "composite key is only partially set".to_string(),
            });
        }
        let value = if self.preview {
            let ahead = peeked.entry(entity.name.as_str()).or_default();
            let value = self.keys.peek_key(entity, *ahead)?;
            *ahead += 1;
            value
        } else {
            self.keys.next_key(entity)?
        };
        let columns = entity.primary_key_columns();
        let [column] = columns.as_slice() else {
            return Err(CoreError::MissingPrimaryKey {
                entity: entity.name.clone(),
                message: "composite key must be set explicitly".to_string(),
            });
        };
        Ok(Identity::single(entity.name.clone(), *column, value))
    }

    /// Full row of an object under `key`.
    fn object_row(
        &self,
        entity: &Entity,
        data: &ObjectData,
        key: &Identity,
        mapping: &HashMap<Identity, Identity>,
    ) -> CoreResult<BTreeMap<String, Value>> {
        let mut row = BTreeMap::new();
        for attribute in &entity.attributes {
            let value = if attribute.primary_key {
                key.key_value(&attribute.column).cloned()
            } else {
                data.values.get(&attribute.name).cloned()
            };
            row.insert(attribute.column.clone(), value.unwrap_or_default());
        }
        for rel in entity.foreign_key_relationships() {
            let target = match data.to_one.get(&rel.name).cloned().flatten() {
                Some(t) => permanent(&t, mapping)?,
                None => None,
            };
            row.extend(foreign_key_values(rel, target.as_ref()));
        }
        Ok(row)
    }

    fn changed_columns(
        &self,
        entity: &Entity,
        diff: &crate::diff::ObjectDiff,
        mapping: &HashMap<Identity, Identity>,
    ) -> CoreResult<BTreeMap<String, Value>> {
        let mut set = BTreeMap::new();
        for (name, change) in diff.attributes() {
            if let Some(attribute) = entity.get_attribute(name) {
                set.insert(attribute.column.clone(), change.current.clone());
            }
        }
        for (name, change) in diff.to_one() {
            let Some(rel) = entity.get_relationship(name) else {
                continue;
            };
            if !entity.owns_foreign_key(rel) {
                continue;
            }
            let target = match &change.current {
                Some(t) => permanent(t, mapping)?,
                None => None,
            };
            set.extend(foreign_key_values(rel, target.as_ref()));
        }
        Ok(set)
    }

    /// Foreign keys of to-many relationships without a to-one reverse
    /// live on the members' rows and are written from the owner's deltas.
    fn derive_foreign_keys(
        &self,
        registry: &Registry,
        changes: &ChangeSet,
        mapping: &HashMap<Identity, Identity>,
        inserts: &mut [PendingRow<'a>],
        updates: &mut Vec<PendingRow<'a>>,
        deletes: &[PendingRow<'a>],
    ) -> CoreResult<()> {
        let mut derived: Vec<(Identity, Vec<(String, Value)>)> = Vec::new();
        for owner in changes.identities() {
            let Some(diff) = changes.diff(owner) else {
                continue;
            };
            let owner_entity = self.schema.entity(owner.entity_name())?;
            for name in diff.to_many_relationships() {
                let Some(rel) = owner_entity.get_relationship(name) else {
                    continue;
                };
                // A to-one reverse writes the key from the member side.
                if self.schema.reverse_of(rel).is_some_and(|r| r.is_to_one()) {
                    continue;
                }
                let Some(owner_key) = permanent(owner, mapping)? else {
                    continue;
                };
                let Some(delta) = diff.to_many(name) else {
                    continue;
                };
                let owner_row = inserts
                    .iter()
                    .find(|r| r.identity == owner_key)
                    .map(|r| r.values.clone())
                    .or_else(|| registry.snapshot(&owner_key).map(|s| s.values().clone()))
                    .unwrap_or_default();
                // Removals before additions so a member moved between
                // owners ends up with the new key.
                let mut ordered: Vec<(&Identity, &i64)> = delta.iter().collect();
                ordered.sort_by_key(|(_, count)| **count > 0);
                for (member, count) in ordered {
                    let Some(member) = permanent_or_skip(member, mapping) else {
                        continue;
                    };
                    let columns = rel
                        .joins
                        .iter()
                        .map(|j| {
                            let value = if *count > 0 {
                                owner_key
                                    .key_value(&j.source_column)
                                    .or_else(|| owner_row.get(&j.source_column))
                                    .cloned()
                                    .unwrap_or_default()
                            } else {
                                Value::Null
                            };
                            (j.target_column.clone(), value)
                        })
                        .collect();
                    derived.push((member, columns));
                }
            }
        }

        for (member, columns) in derived {
            if deletes.iter().any(|r| r.identity == member) {
                continue;
            }
            if let Some(row) = inserts.iter_mut().find(|r| r.identity == member) {
                row.values.extend(columns.iter().cloned());
                row.links.extend(columns.iter().cloned());
                if let Some(snapshot) = &mut row.snapshot {
                    snapshot.extend(columns);
                }
                continue;
            }
            if let Some(row) = updates.iter_mut().find(|r| r.identity == member) {
                row.values.extend(columns.iter().cloned());
                if let Some(snapshot) = &mut row.snapshot {
                    snapshot.extend(columns);
                }
                continue;
            }
            let entity = self.schema.entity(member.entity_name())?;
            let base = registry.snapshot(&member);
            let (qualifier, check) = qualifier(entity, &member, base.as_ref().map(|s| s.values()));
            let snapshot = base.map(|s| {
                let mut after = s.values().clone();
                after.extend(columns.iter().cloned());
                after
            });
            updates.push(PendingRow {
                identity: member,
                entity,
                values: columns.into_iter().collect(),
                qualifier,
                check,
                links: BTreeMap::new(),
                snapshot,
            });
        }
        Ok(())
    }

    /// Orders rows of a self-referencing entity parents first, or children
    /// first for deletes.
    fn order_reflexive<'r>(
        &self,
        entity: &str,
        rows: Vec<PendingRow<'r>>,
        children_first: bool,
    ) -> CoreResult<Vec<PendingRow<'r>>> {
        let reflexive: Vec<&Relationship> = EntitySorter::new(self.schema)
            .reflexive_relationships(entity)
            .map_err(CoreError::from_sort)?;
        if reflexive.is_empty() || rows.len() < 2 {
            return Ok(rows);
        }

        let mut edges = Vec::new();
        for (child, row) in rows.iter().enumerate() {
            for rel in &reflexive {
                let Some(target) = target_from_row(rel, &row.links) else {
                    continue;
                };
                if let Some(parent) = rows.iter().position(|r| r.identity == target) {
                    if parent != child {
                        edges.push(if children_first { (child, parent) } else { (parent, child) });
                    }
                }
            }
        }
        let order = match topological_order(rows.len(), &edges) {
            Ok(order) => order,
            Err(_) if self.config.deferred_constraints => {
                tracing::warn!(entity, "breaking reflexive row cycle");
                return Ok(rows);
            }
            Err(_) => {
                return Err(CoreError::CyclicDependency {
                    entities: vec![entity.to_string()],
                })
            }
        };
        let mut slots: Vec<Option<PendingRow<'r>>> = rows.into_iter().map(Some).collect();
        Ok(order.into_iter().filter_map(|i| slots[i].take()).collect())
    }
}

fn take_entity<'s>(rows: &mut Vec<PendingRow<'s>>, entity: &str) -> Vec<PendingRow<'s>> {
    let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(rows)
        .into_iter()
        .partition(|r| r.entity.name == entity);
    *rows = kept;
    taken
}

/// Primary key plus locking columns with their snapshot values.
fn qualifier(
    entity: &Entity,
    identity: &Identity,
    snapshot: Option<&BTreeMap<String, Value>>,
) -> (Vec<(String, Value)>, bool) {
    let mut qualifier: Vec<(String, Value)> = entity
        .primary_key_columns()
        .into_iter()
        .map(|c| (c.to_string(), identity.key_value(c).cloned().unwrap_or_default()))
        .collect();
    let mut check = false;
    if let Some(snapshot) = snapshot {
        for attribute in entity.locking_attributes().filter(|a| !a.primary_key) {
            let value = snapshot.get(&attribute.column).cloned().unwrap_or_default();
            qualifier.push((attribute.column.clone(), value));
            check = true;
        }
    }
    (qualifier, check)
}

fn pending_lobs(writer: &DmlWriter<'_>, row: &PendingRow<'_>, lobs: Vec<crate::query::LobValue>) -> Option<PendingLobs> {
    if lobs.is_empty() {
        return None;
    }
    let key: Vec<(String, Value)> = row
        .entity
        .primary_key_columns()
        .into_iter()
        .map(|c| (c.to_string(), row.identity.key_value(c).cloned().unwrap_or_default()))
        .collect();
    let columns: Vec<&str> = lobs.iter().map(|l| l.column.as_str()).collect();
    let select = writer.select_lobs(row.entity, &columns, &key);
    let writes = lobs
        .into_iter()
        .map(|l| {
            (
                LobLocator {
                    table: row.entity.table.clone(),
                    column: l.column,
                    key: key.clone(),
                },
                l.data,
            )
        })
        .collect();
    Some(PendingLobs { select, writes })
}

fn foreign_key_values(rel: &Relationship, target: Option<&Identity>) -> Vec<(String, Value)> {
    rel.joins
        .iter()
        .map(|j| {
            let value = target
                .and_then(|t| t.key_value(&j.target_column))
                .cloned()
                .unwrap_or_default();
            (j.source_column.clone(), value)
        })
        .collect()
}

/// Permanent form of an identity referenced by a committed row.
fn permanent(identity: &Identity, mapping: &HashMap<Identity, Identity>) -> CoreResult<Option<Identity>> {
    if !identity.is_temporary() {
        return Ok(Some(identity.clone()));
    }
    match mapping.get(identity) {
        Some(p) => Ok(Some(p.clone())),
        None => Err(CoreError::MissingPrimaryKey {
            entity: identity.entity_name().to_string(),
            message: format!("related object {identity} is not part of this commit"),
        }),
    }
}

/// Like [`permanent`], but drops references to objects that were never
/// saved.
fn permanent_or_skip(identity: &Identity, mapping: &HashMap<Identity, Identity>) -> Option<Identity> {
    let resolved = permanent(identity, mapping).ok().flatten();
    if resolved.is_none() {
        tracing::debug!(identity = %identity, "skipping reference to unsaved object");
    }
    resolved
}

/// To-many membership changes in permanent identities.
fn arcs(changes: &ChangeSet, mapping: &HashMap<Identity, Identity>, deleted: &[Identity]) -> Vec<ArcChange> {
    let mut arcs = Vec::new();
    for owner in changes.identities() {
        if deleted.contains(owner) {
            continue;
        }
        let (Some(diff), Some(source)) = (changes.diff(owner), permanent_or_skip(owner, mapping)) else {
            continue;
        };
        for relationship in diff.to_many_relationships() {
            let Some(delta) = diff.to_many(relationship) else {
                continue;
            };
            for (member, count) in delta {
                let Some(target) = permanent_or_skip(member, mapping) else {
                    continue;
                };
                arcs.push(ArcChange {
                    source: source.clone(),
                    relationship: relationship.to_string(),
                    target,
                    op: if *count > 0 { ArcOp::Add } else { ArcOp::Remove },
                });
            }
        }
    }
    arcs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::EdgeChange;
    use crate::pk::SequencePkGenerator;
    use relgraph_schema::{Attribute, ColumnType};
    use relgraph_sync_protocol::ChangeKind;

    fn schema() -> Schema {
        Schema::builder()
            .entity(
                Entity::new("Artist", "ARTIST")
                    .attribute(Attribute::new("id", "ID", ColumnType::Integer).primary_key())
                    .attribute(Attribute::new("name", "NAME", ColumnType::VarChar))
                    .attribute(Attribute::new("version", "VERSION", ColumnType::Integer).used_for_locking())
                    .relationship(
                        Relationship::to_many("paintings", "Painting")
                            .join("ID", "ARTIST_ID")
                            .reverse("artist"),
                    )
                    .relationship(Relationship::to_one("mentor", "Artist").join("MENTOR_ID", "ID")),
            )
            .entity(
                Entity::new("Painting", "PAINTING")
                    .attribute(Attribute::new("id", "ID", ColumnType::Integer).primary_key())
                    .attribute(Attribute::new("title", "TITLE", ColumnType::VarChar))
                    .attribute(Attribute::new("image", "IMAGE", ColumnType::Blob))
                    .attribute(Attribute::new("galleryId", "GALLERY_ID", ColumnType::Integer))
                    .relationship(
                        Relationship::to_one("artist", "Artist")
                            .join("ARTIST_ID", "ID")
                            .reverse("paintings"),
                    ),
            )
            .entity(
                Entity::new("Gallery", "GALLERY")
                    .attribute(Attribute::new("id", "ID", ColumnType::Integer).primary_key())
                    .relationship(Relationship::to_many("paintings", "Painting").join("ID", "GALLERY_ID")),
            )
            .build()
            .unwrap()
    }

    struct Fixture {
        schema: Schema,
        config: ChannelConfig,
        keys: SequencePkGenerator,
        registry: Registry,
        changes: ChangeSet,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_config(ChannelConfig::default())
        }

        fn with_config(config: ChannelConfig) -> Self {
            Self {
                schema: schema(),
                config,
                keys: SequencePkGenerator::default(),
                registry: Registry::new(ContextId::new(1)),
                changes: ChangeSet::new(),
            }
        }

        fn plan(&self) -> CoreResult<CommitPlan> {
            CommitPlanner {
                schema: &self.schema,
                config: &self.config,
                keys: &self.keys,
                source: ContextId::new(1),
                preview: false,
            }
            .plan(&self.registry, &self.changes)
        }

        fn new_object(&mut self, entity: &str, values: &[(&str, Value)]) -> (Identity, EntityRef) {
            let object = EntityRef::with_values(entity, values.iter().map(|(k, v)| (*k, v.clone())));
            let id = self.registry.register(&object).unwrap();
            (id, object)
        }

        fn committed(&mut self, entity: &str, id: i64, row: &[(&str, Value)]) -> (Identity, EntityRef) {
            let identity = Identity::single(entity, "ID", id);
            let mut values: BTreeMap<String, Value> =
                row.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
            values.insert("ID".into(), Value::Integer(id));
            let object = EntityRef::new(entity);
            object.write().load_row(self.schema.entity(entity).unwrap(), &values);
            self.registry.attach(identity.clone(), &object, PersistenceState::Committed);
            self.registry.set_snapshot(identity.clone(), values, 1);
            (identity, object)
        }

        fn link(&mut self, child: &(Identity, EntityRef), rel: &str, parent: &Identity) {
            child.1.write().to_one.insert(rel.into(), Some(parent.clone()));
            self.changes.record_edge_change(
                &child.0,
                rel,
                EdgeChange::Set {
                    previous: None,
                    target: Some(parent.clone()),
                },
            );
        }
    }

    fn sql(plan: &CommitPlan) -> Vec<String> {
        plan.batches()
            .iter()
            .flat_map(|b| b.rows.iter().map(|r| r.statement.sql.clone()))
            .collect()
    }

    #[test]
    fn insert_parents_first_with_generated_keys() {
        let mut f = Fixture::new();
        let painting = f.new_object("Painting", &[("title", "Irises".into())]);
        let artist = f.new_object("Artist", &[("name", "Van Gogh".into())]);
        f.link(&painting, "artist", &artist.0);

        let plan = f.plan().unwrap();
        let kinds: Vec<(&str, BatchKind)> = plan
            .batches()
            .iter()
            .map(|b| (b.entity.as_str(), b.kind))
            .collect();
        assert_eq!(kinds, vec![("Artist", BatchKind::Insert), ("Painting", BatchKind::Insert)]);

        let artist_row = &plan.batches()[0].rows[0];
        assert_eq!(artist_row.identity, Identity::single("Artist", "ID", 200i64));
        let painting_row = &plan.batches()[1].rows[0];
        assert_eq!(
            painting_row.statement.sql,
            "INSERT INTO PAINTING (ID, TITLE, IMAGE, GALLERY_ID, ARTIST_ID) VALUES (?, ?, ?, ?, ?)"
        );
        assert_eq!(
            painting_row.statement.params,
            vec![
                Value::Integer(200),
                "Irises".into(),
                Value::Null,
                Value::Null,
                Value::Integer(200)
            ]
        );
        assert_eq!(plan.outcome.mapping.len(), 2);
        assert!(plan.event().validate().is_ok());
    }

    #[test]
    fn explicit_key_is_used() {
        let mut f = Fixture::new();
        f.new_object("Artist", &[("id", Value::Integer(42))]);
        let plan = f.plan().unwrap();
        assert_eq!(
            plan.batches()[0].rows[0].identity,
            Identity::single("Artist", "ID", 42i64)
        );
    }

    #[test]
    fn deletes_children_first_and_after_updates() {
        let mut f = Fixture::new();
        let artist = f.committed("Artist", 1, &[("NAME", "A".into()), ("VERSION", Value::Integer(3))]);
        let painting = f.committed("Painting", 2, &[("ARTIST_ID", Value::Integer(1))]);
        let other = f.committed("Artist", 3, &[("NAME", "B".into())]);
        f.registry.transition(&artist.1, PersistenceState::Deleted).unwrap();
        f.registry.transition(&painting.1, PersistenceState::Deleted).unwrap();
        f.changes.record_scalar_change(&other.0, "name", "B".into(), "C".into());
        f.registry.transition(&other.1, PersistenceState::Modified).unwrap();

        let plan = f.plan().unwrap();
        assert_eq!(
            sql(&plan),
            vec![
                "UPDATE ARTIST SET NAME = ? WHERE ID = ? AND VERSION IS NULL",
                "DELETE FROM PAINTING WHERE ID = ?",
                "DELETE FROM ARTIST WHERE ID = ? AND VERSION = ?",
            ]
        );
        assert!(plan.batches()[2].rows[0].check_update_count);
        let kinds: Vec<ChangeKind> = plan.event().changes.iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![ChangeKind::Update, ChangeKind::Delete, ChangeKind::Delete]);
        assert_eq!(
            plan.event().changes[0].snapshot.as_ref().unwrap()["NAME"],
            Value::from("C")
        );
    }

    #[test]
    fn reflexive_rows_are_ordered() {
        let mut f = Fixture::new();
        let student = f.new_object("Artist", &[("id", Value::Integer(2))]);
        let mentor = f.new_object("Artist", &[("id", Value::Integer(1))]);
        f.link(&student, "mentor", &mentor.0);

        let plan = f.plan().unwrap();
        let ids: Vec<&Identity> = plan.batches()[0].rows.iter().map(|r| &r.identity).collect();
        assert_eq!(
            ids,
            vec![
                &Identity::single("Artist", "ID", 1i64),
                &Identity::single("Artist", "ID", 2i64)
            ]
        );
    }

    #[test]
    fn reflexive_cycle_fails_without_deferred_constraints() {
        let mut f = Fixture::new();
        let a = f.new_object("Artist", &[("id", Value::Integer(1))]);
        let b = f.new_object("Artist", &[("id", Value::Integer(2))]);
        f.link(&a, "mentor", &b.0);
        f.link(&b, "mentor", &a.0);
        assert!(matches!(f.plan(), Err(CoreError::CyclicDependency { .. })));

        let mut f = Fixture::with_config(ChannelConfig::new().deferred_constraints(true));
        let a = f.new_object("Artist", &[("id", Value::Integer(1))]);
        let b = f.new_object("Artist", &[("id", Value::Integer(2))]);
        f.link(&a, "mentor", &b.0);
        f.link(&b, "mentor", &a.0);
        assert_eq!(f.plan().unwrap().count(BatchKind::Insert), 2);
    }

    #[test]
    fn to_many_without_reverse_updates_member_rows() {
        let mut f = Fixture::new();
        let gallery = f.committed("Gallery", 5, &[]);
        let painting = f.committed("Painting", 2, &[("TITLE", "x".into())]);
        f.changes
            .record_edge_change(&gallery.0, "paintings", EdgeChange::Add(painting.0.clone()));
        f.registry.transition(&gallery.1, PersistenceState::Modified).unwrap();

        let plan = f.plan().unwrap();
        assert_eq!(sql(&plan), vec!["UPDATE PAINTING SET GALLERY_ID = ? WHERE ID = ?"]);
        assert_eq!(
            plan.batches()[0].rows[0].statement.params,
            vec![Value::Integer(5), Value::Integer(2)]
        );
        assert_eq!(plan.event().arcs.len(), 1);
        assert_eq!(plan.event().arcs[0].op, ArcOp::Add);
    }

    #[test]
    fn two_phase_lob_insert() {
        let mut f = Fixture::with_config(
            ChannelConfig::new().lob(crate::config::LobConfig::new().two_phase(true)),
        );
        f.new_object(
            "Painting",
            &[("id", Value::Integer(9)), ("image", Value::Bytes(vec![0; 10]))],
        );
        let plan = f.plan().unwrap();
        let row = &plan.batches()[0].rows[0];
        assert!(row.statement.sql.contains("EMPTY_BLOB()"));
        let lobs = row.lobs.as_ref().unwrap();
        assert_eq!(lobs.select.sql, "SELECT IMAGE FROM PAINTING WHERE ID = ? FOR UPDATE");
        assert_eq!(lobs.writes[0].0.column, "IMAGE");
        assert_eq!(lobs.writes[0].1.len(), 10);
        // Snapshots keep the real content.
        assert_eq!(
            plan.outcome.snapshots[0].1["IMAGE"],
            Value::Bytes(vec![0; 10])
        );
    }

    #[test]
    fn unsaved_related_object_fails() {
        let mut f = Fixture::new();
        let painting = f.new_object("Painting", &[]);
        f.link(&painting, "artist", &Identity::temporary("Artist"));
        assert!(matches!(f.plan(), Err(CoreError::MissingPrimaryKey { .. })));
    }

    #[test]
    fn empty_plan() {
        let f = Fixture::new();
        assert!(f.plan().unwrap().is_empty());
    }
}
