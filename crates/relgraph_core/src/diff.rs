//! Change-set: per-object field and edge deltas recorded as mutations happen.

use relgraph_codec::{Identity, Value};
use std::collections::{BTreeMap, HashMap};

/// Operation on a relationship edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeChange {
    /// Add a member to a to-many relationship.
    Add(Identity),
    /// Remove a member from a to-many relationship.
    Remove(Identity),
    /// Point a to-one relationship somewhere else.
    Set {
        /// Target before this write.
        previous: Option<Identity>,
        /// Target after this write.
        target: Option<Identity>,
    },
}

/// Original and current value of one changed field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldChange<T> {
    /// Value before the first write.
    pub original: T,
    /// Value after the last write.
    pub current: T,
}

/// Pending changes of one object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectDiff {
    attributes: BTreeMap<String, FieldChange<Value>>,
    to_one: BTreeMap<String, FieldChange<Option<Identity>>>,
    to_many: BTreeMap<String, BTreeMap<Identity, i64>>,
}

impl ObjectDiff {
    /// Returns true if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty() && self.to_one.is_empty() && self.to_many.is_empty()
    }

    /// Changed attributes.
    #[must_use]
    pub fn attributes(&self) -> &BTreeMap<String, FieldChange<Value>> {
        &self.attributes
    }

    /// Changed to-one relationships.
    #[must_use]
    pub fn to_one(&self) -> &BTreeMap<String, FieldChange<Option<Identity>>> {
        &self.to_one
    }

    /// Net membership delta of a to-many relationship: positive counts are
    /// additions, negative counts removals.
    #[must_use]
    pub fn to_many(&self, relationship: &str) -> Option<&BTreeMap<Identity, i64>> {
        self.to_many.get(relationship)
    }

    /// Names of to-many relationships with a pending delta.
    pub fn to_many_relationships(&self) -> impl Iterator<Item = &str> {
        self.to_many.keys().map(String::as_str)
    }

    fn record_value(&mut self, field: &str, previous: Value, value: Value) {
        coalesce(&mut self.attributes, field, previous, value);
    }

    fn record_to_one(&mut self, relationship: &str, previous: Option<Identity>, target: Option<Identity>) {
        coalesce(&mut self.to_one, relationship, previous, target);
    }

    fn record_to_many(&mut self, relationship: &str, target: Identity, delta: i64) {
        let members = self.to_many.entry(relationship.to_string()).or_default();
        let count = members.entry(target.clone()).or_insert(0);
        *count += delta;
        if *count == 0 {
            members.remove(&target);
        }
        if members.is_empty() {
            self.to_many.remove(relationship);
        }
    }

    /// Drops pending changes on the given attributes and to-one
    /// relationships.
    pub(crate) fn forget(&mut self, names: &[&str]) {
        for name in names {
            self.attributes.remove(*name);
            self.to_one.remove(*name);
        }
    }

    fn rewrite(&mut self, mapping: &HashMap<Identity, Identity>) {
        for change in self.to_one.values_mut() {
            for side in [&mut change.original, &mut change.current] {
                if let Some(new) = side.as_ref().and_then(|id| mapping.get(id)) {
                    *side = Some(new.clone());
                }
            }
        }
        for members in self.to_many.values_mut() {
            let renamed: Vec<(Identity, Identity)> = members
                .keys()
                .filter_map(|id| mapping.get(id).map(|new| (id.clone(), new.clone())))
                .collect();
            for (old, new) in renamed {
                if let Some(count) = members.remove(&old) {
                    members.insert(new, count);
                }
            }
        }
    }
}

/// Writes `current` and keeps the first `original`; writing the original
/// back removes the entry.
fn coalesce<T: PartialEq>(map: &mut BTreeMap<String, FieldChange<T>>, key: &str, previous: T, value: T) {
    if let Some(change) = map.get_mut(key) {
        if change.original == value {
            map.remove(key);
        } else {
            change.current = value;
        }
    } else if previous != value {
        map.insert(
            key.to_string(),
            FieldChange {
                original: previous,
                current: value,
            },
        );
    }
}

/// Ordered per-object change record of one context.
///
/// Built as mutations occur and consumed once by commit or rollback.
#[derive(Debug, Default)]
pub struct ChangeSet {
    order: Vec<Identity>,
    diffs: HashMap<Identity, ObjectDiff>,
}

impl ChangeSet {
    /// Creates an empty change-set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an attribute write; `previous` is the value before it.
    pub fn record_scalar_change(&mut self, identity: &Identity, field: &str, previous: Value, value: Value) {
        self.entry(identity).record_value(field, previous, value);
        self.prune(identity);
    }

    /// Records a relationship edge operation.
    pub fn record_edge_change(&mut self, identity: &Identity, relationship: &str, change: EdgeChange) {
        let diff = self.entry(identity);
        match change {
            EdgeChange::Add(target) => diff.record_to_many(relationship, target, 1),
            EdgeChange::Remove(target) => diff.record_to_many(relationship, target, -1),
            EdgeChange::Set { previous, target } => diff.record_to_one(relationship, previous, target),
        }
        self.prune(identity);
    }

    fn entry(&mut self, identity: &Identity) -> &mut ObjectDiff {
        if !self.diffs.contains_key(identity) {
            self.order.push(identity.clone());
        }
        self.diffs.entry(identity.clone()).or_default()
    }

    fn prune(&mut self, identity: &Identity) {
        if self.diffs.get(identity).is_some_and(ObjectDiff::is_empty) {
            self.remove(identity);
        }
    }

    /// Pending changes of one object.
    #[must_use]
    pub fn diff(&self, identity: &Identity) -> Option<&ObjectDiff> {
        self.diffs.get(identity)
    }

    pub(crate) fn diff_mut(&mut self, identity: &Identity) -> Option<&mut ObjectDiff> {
        self.diffs.get_mut(identity)
    }

    /// Returns true if the object has pending changes.
    #[must_use]
    pub fn has_changes(&self, identity: &Identity) -> bool {
        self.diffs.contains_key(identity)
    }

    /// Drops every change of one object.
    pub fn remove(&mut self, identity: &Identity) -> Option<ObjectDiff> {
        let diff = self.diffs.remove(identity)?;
        self.order.retain(|id| id != identity);
        Some(diff)
    }

    /// Drops an object's entry if its diff became empty.
    pub(crate) fn prune_empty(&mut self, identity: &Identity) {
        self.prune(identity);
    }

    /// Re-keys entries and references after temporary identities became
    /// permanent.
    pub fn replace_identities(&mut self, mapping: &HashMap<Identity, Identity>) {
        if mapping.is_empty() {
            return;
        }
        for id in &mut self.order {
            if let Some(new) = mapping.get(id) {
                *id = new.clone();
            }
        }
        let diffs = std::mem::take(&mut self.diffs);
        self.diffs = diffs
            .into_iter()
            .map(|(id, mut diff)| {
                diff.rewrite(mapping);
                (mapping.get(&id).cloned().unwrap_or(id), diff)
            })
            .collect();
    }

    /// Identities in first-touch order.
    pub fn identities(&self) -> impl Iterator<Item = &Identity> {
        self.order.iter()
    }

    /// Returns true if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.diffs.is_empty()
    }

    /// Number of objects with pending changes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.diffs.len()
    }

    /// Clears everything.
    pub fn clear(&mut self) {
        self.order.clear();
        self.diffs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn artist() -> Identity {
        Identity::single("Artist", "ID", 1i64)
    }

    fn painting(n: i64) -> Identity {
        Identity::single("Painting", "ID", n)
    }

    #[test]
    fn scalar_changes_coalesce() {
        let mut cs = ChangeSet::new();
        let id = artist();
        cs.record_scalar_change(&id, "name", "A".into(), "B".into());
        cs.record_scalar_change(&id, "name", "B".into(), "C".into());

        let change = &cs.diff(&id).unwrap().attributes()["name"];
        assert_eq!(change.original, Value::from("A"));
        assert_eq!(change.current, Value::from("C"));
    }

    #[test]
    fn writing_original_back_clears_entry() {
        let mut cs = ChangeSet::new();
        let id = artist();
        cs.record_scalar_change(&id, "name", "A".into(), "B".into());
        cs.record_scalar_change(&id, "name", "B".into(), "A".into());
        assert!(cs.diff(&id).is_none());
        assert!(cs.is_empty());
        assert_eq!(cs.identities().count(), 0);
    }

    #[test]
    fn same_value_write_is_noop() {
        let mut cs = ChangeSet::new();
        cs.record_scalar_change(&artist(), "name", "A".into(), "A".into());
        assert!(cs.is_empty());
    }

    #[test]
    fn add_then_remove_cancels() {
        let mut cs = ChangeSet::new();
        let id = artist();
        cs.record_edge_change(&id, "paintings", EdgeChange::Add(painting(1)));
        cs.record_edge_change(&id, "paintings", EdgeChange::Remove(painting(1)));
        assert!(cs.diff(&id).is_none());
    }

    #[test]
    fn to_many_is_a_multiset_delta() {
        let mut cs = ChangeSet::new();
        let id = artist();
        cs.record_edge_change(&id, "paintings", EdgeChange::Add(painting(1)));
        cs.record_edge_change(&id, "paintings", EdgeChange::Add(painting(2)));
        cs.record_edge_change(&id, "paintings", EdgeChange::Remove(painting(3)));
        let delta = cs.diff(&id).unwrap().to_many("paintings").unwrap();
        assert_eq!(delta[&painting(1)], 1);
        assert_eq!(delta[&painting(2)], 1);
        assert_eq!(delta[&painting(3)], -1);
    }

    #[test]
    fn to_one_last_set_wins() {
        let mut cs = ChangeSet::new();
        let id = painting(1);
        let a = Identity::single("Artist", "ID", 1i64);
        let b = Identity::single("Artist", "ID", 2i64);
        cs.record_edge_change(&id, "artist", EdgeChange::Set { previous: None, target: Some(a.clone()) });
        cs.record_edge_change(&id, "artist", EdgeChange::Set { previous: Some(a), target: Some(b.clone()) });
        let change = &cs.diff(&id).unwrap().to_one()["artist"];
        assert_eq!(change.original, None);
        assert_eq!(change.current, Some(b));
    }

    #[test]
    fn first_touch_order() {
        let mut cs = ChangeSet::new();
        cs.record_scalar_change(&painting(2), "title", Value::Null, "x".into());
        cs.record_scalar_change(&painting(1), "title", Value::Null, "y".into());
        cs.record_scalar_change(&painting(2), "title", "x".into(), "z".into());
        let order: Vec<_> = cs.identities().cloned().collect();
        assert_eq!(order, vec![painting(2), painting(1)]);
    }

    #[test]
    fn replace_identities_rekeys_everything() {
        let mut cs = ChangeSet::new();
        let temp = Identity::temporary("Painting");
        let perm = painting(200);
        cs.record_scalar_change(&temp, "title", Value::Null, "x".into());
        cs.record_edge_change(&artist(), "paintings", EdgeChange::Add(temp.clone()));

        let mapping: HashMap<_, _> = [(temp.clone(), perm.clone())].into_iter().collect();
        cs.replace_identities(&mapping);

        assert!(cs.has_changes(&perm));
        assert!(!cs.has_changes(&temp));
        let delta = cs.diff(&artist()).unwrap().to_many("paintings").unwrap();
        assert_eq!(delta[&perm], 1);
    }

    proptest! {
        #[test]
        fn balanced_edge_ops_cancel(ops in prop::collection::vec((0i64..4, any::<bool>()), 0..40)) {
            let mut cs = ChangeSet::new();
            let id = artist();
            for (n, add) in &ops {
                let change = if *add { EdgeChange::Add(painting(*n)) } else { EdgeChange::Remove(painting(*n)) };
                cs.record_edge_change(&id, "paintings", change);
            }
            // Undo everything in reverse.
            for (n, add) in ops.iter().rev() {
                let change = if *add { EdgeChange::Remove(painting(*n)) } else { EdgeChange::Add(painting(*n)) };
                cs.record_edge_change(&id, "paintings", change);
            }
            prop_assert!(cs.is_empty());
        }

        #[test]
        fn last_write_is_current(values in prop::collection::vec(0i64..5, 1..20)) {
            let mut cs = ChangeSet::new();
            let id = artist();
            let mut previous = Value::Integer(-1);
            for v in &values {
                cs.record_scalar_change(&id, "rank", previous.clone(), Value::Integer(*v));
                previous = Value::Integer(*v);
            }
            let last = *values.last().unwrap();
            match cs.diff(&id) {
                Some(diff) => {
                    let change = &diff.attributes()["rank"];
                    prop_assert_eq!(&change.original, &Value::Integer(-1));
                    prop_assert_eq!(&change.current, &Value::Integer(last));
                }
                None => prop_assert_eq!(last, -1),
            }
        }
    }
}
