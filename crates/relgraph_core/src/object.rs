//! Tracked objects.

use crate::state::PersistenceState;
use parking_lot::RwLock;
use relgraph_codec::{Identity, Value};
use relgraph_schema::{Entity, Relationship};
use relgraph_sync_protocol::ContextId;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

/// Result of reading a lazily loaded relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault<T> {
    /// The value is in memory.
    Loaded(T),
    /// The value has not been fetched; resolve it through the context.
    NotLoaded,
    /// Another caller is fetching the value.
    Resolving,
}

impl<T> Fault<T> {
    /// Returns the loaded value, if any.
    pub fn loaded(self) -> Option<T> {
        match self {
            Fault::Loaded(v) => Some(v),
            Fault::NotLoaded | Fault::Resolving => None,
        }
    }

    /// Returns true if the value is in memory.
    pub fn is_loaded(&self) -> bool {
        matches!(self, Fault::Loaded(_))
    }

    /// Borrows the loaded value.
    pub fn by_ref(&self) -> Fault<&T> {
        match self {
            Fault::Loaded(v) => Fault::Loaded(v),
            Fault::NotLoaded => Fault::NotLoaded,
            Fault::Resolving => Fault::Resolving,
        }
    }
}

pub(crate) struct ObjectData {
    pub identity: Option<Identity>,
    pub state: PersistenceState,
    pub context: Option<ContextId>,
    pub values: BTreeMap<String, Value>,
    pub to_one: BTreeMap<String, Option<Identity>>,
    pub to_many: BTreeMap<String, Fault<Vec<Identity>>>,
}

impl ObjectData {
    /// Replaces attribute values and foreign-key targets with a row.
    pub fn load_row(&mut self, entity: &Entity, row: &BTreeMap<String, Value>) {
        self.values = entity
            .attributes
            .iter()
            .map(|a| (a.name.clone(), row.get(&a.column).cloned().unwrap_or_default()))
            .collect();
        for rel in entity.foreign_key_relationships() {
            self.to_one.insert(rel.name.clone(), target_from_row(rel, row));
        }
    }
}

/// Identity of the row, if every primary key column is present.
pub(crate) fn identity_from_row(entity: &Entity, row: &BTreeMap<String, Value>) -> Option<Identity> {
    let mut key = Vec::new();
    for column in entity.primary_key_columns() {
        match row.get(column) {
            Some(v) if !v.is_null() => key.push((column.to_string(), v.clone())),
            _ => return None,
        }
    }
    (!key.is_empty()).then(|| Identity::permanent(entity.name.clone(), key))
}

/// Target of a foreign-key relationship as stored in the row.
pub(crate) fn target_from_row(relationship: &Relationship, row: &BTreeMap<String, Value>) -> Option<Identity> {
    let mut key = Vec::new();
    for join in &relationship.joins {
        match row.get(&join.source_column) {
            Some(v) if !v.is_null() => key.push((join.target_column.clone(), v.clone())),
            _ => return None,
        }
    }
    Some(Identity::permanent(relationship.target.clone(), key))
}

pub(crate) struct ObjectCell {
    entity: String,
    pub data: RwLock<ObjectData>,
}

/// Handle to one tracked object.
///
/// Clones share the object. Relationships hold [`Identity`] values, never
/// other objects; navigate them through the owning context.
///
/// Reads take only the object's own lock, so they never wait on the
/// context. Writes go through the [`crate::Context`] API.
#[derive(Clone)]
pub struct EntityRef(Arc<ObjectCell>);

impl EntityRef {
    /// Creates a transient object.
    pub fn new(entity: impl Into<String>) -> Self {
        Self::with_values(entity, std::iter::empty::<(String, Value)>())
    }

    /// Creates a transient object with initial attribute values.
    pub fn with_values<K, V>(entity: impl Into<String>, values: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        Self(Arc::new(ObjectCell {
            entity: entity.into(),
            data: RwLock::new(ObjectData {
                identity: None,
                state: PersistenceState::Transient,
                context: None,
                values: values.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
                to_one: BTreeMap::new(),
                to_many: BTreeMap::new(),
            }),
        }))
    }

    /// Entity name.
    #[must_use]
    pub fn entity_name(&self) -> &str {
        &self.0.entity
    }

    /// Current identity, absent while transient and never registered.
    #[must_use]
    pub fn identity(&self) -> Option<Identity> {
        self.0.data.read().identity.clone()
    }

    /// Current persistence state.
    #[must_use]
    pub fn state(&self) -> PersistenceState {
        self.0.data.read().state
    }

    /// Owning context.
    #[must_use]
    pub fn context_id(&self) -> Option<ContextId> {
        self.0.data.read().context
    }

    /// Attribute value. Unset attributes read as [`Value::Null`].
    ///
    /// Hollow objects have no values loaded and return `NotLoaded`.
    #[must_use]
    pub fn get(&self, attribute: &str) -> Fault<Value> {
        let data = self.0.data.read();
        if data.state == PersistenceState::Hollow {
            return Fault::NotLoaded;
        }
        Fault::Loaded(data.values.get(attribute).cloned().unwrap_or_default())
    }

    /// Attribute value, or `Null` when not loaded.
    #[must_use]
    pub fn value(&self, attribute: &str) -> Value {
        self.get(attribute).loaded().unwrap_or_default()
    }

    /// Target of a to-one relationship.
    ///
    /// Foreign-key relationships are loaded with the row; others are
    /// `NotLoaded` until resolved.
    #[must_use]
    pub fn to_one(&self, relationship: &str) -> Fault<Option<Identity>> {
        let data = self.0.data.read();
        match data.to_one.get(relationship) {
            _ if data.state == PersistenceState::Hollow => Fault::NotLoaded,
            Some(target) => Fault::Loaded(target.clone()),
            None if data.state.is_unsaved() => Fault::Loaded(None),
            None => Fault::NotLoaded,
        }
    }

    /// Members of a to-many relationship.
    #[must_use]
    pub fn to_many(&self, relationship: &str) -> Fault<Vec<Identity>> {
        let data = self.0.data.read();
        match data.to_many.get(relationship) {
            Some(fault) => fault.clone(),
            None if data.state.is_unsaved() => Fault::Loaded(Vec::new()),
            None => Fault::NotLoaded,
        }
    }

    /// Returns true if both handles point to the same object.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn read(&self) -> parking_lot::RwLockReadGuard<'_, ObjectData> {
        self.0.data.read()
    }

    pub(crate) fn write(&self) -> parking_lot::RwLockWriteGuard<'_, ObjectData> {
        self.0.data.write()
    }

    pub(crate) fn downgrade(&self) -> WeakEntityRef {
        WeakEntityRef(Arc::downgrade(&self.0))
    }

    /// Description used in error messages.
    pub(crate) fn describe(&self) -> String {
        match self.identity() {
            Some(id) => id.to_string(),
            None => format!("transient {}", self.entity_name()),
        }
    }
}

impl PartialEq for EntityRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for EntityRef {}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.0.data.read();
        f.debug_struct("EntityRef")
            .field("entity", &self.0.entity)
            .field("identity", &data.identity)
            .field("state", &data.state)
            .finish_non_exhaustive()
    }
}

/// Non-owning handle kept by the registry for clean objects.
#[derive(Clone)]
pub(crate) struct WeakEntityRef(Weak<ObjectCell>);

impl WeakEntityRef {
    pub fn upgrade(&self) -> Option<EntityRef> {
        self.0.upgrade().map(EntityRef)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relgraph_schema::{Attribute, ColumnType};

    #[test]
    fn transient_object() {
        let obj = EntityRef::with_values("Artist", [("name", "Monet")]);
        assert_eq!(obj.entity_name(), "Artist");
        assert_eq!(obj.state(), PersistenceState::Transient);
        assert!(obj.identity().is_none());
        assert_eq!(obj.value("name"), Value::from("Monet"));
        assert_eq!(obj.value("born"), Value::Null);
        assert_eq!(obj.to_many("paintings"), Fault::Loaded(vec![]));
        assert_eq!(obj.to_one("mentor"), Fault::Loaded(None));
    }

    #[test]
    fn hollow_reads_are_faults() {
        let obj = EntityRef::new("Artist");
        obj.write().state = PersistenceState::Hollow;
        assert_eq!(obj.get("name"), Fault::NotLoaded);
        assert_eq!(obj.to_one("mentor"), Fault::NotLoaded);
        assert_eq!(obj.to_many("paintings"), Fault::NotLoaded);
    }

    #[test]
    fn identity_of_handles() {
        let a = EntityRef::new("Artist");
        let b = a.clone();
        let c = EntityRef::new("Artist");
        assert_eq!(a, b);
        assert_ne!(a, c);

        let weak = a.downgrade();
        assert!(weak.upgrade().is_some());
        drop(a);
        drop(b);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn committed_to_one_needs_resolution() {
        let obj = EntityRef::new("Artist");
        obj.write().state = PersistenceState::Committed;
        assert_eq!(obj.to_one("mentor"), Fault::NotLoaded);
        obj.write().to_one.insert("mentor".into(), None);
        assert_eq!(obj.to_one("mentor"), Fault::Loaded(None));
    }

    #[test]
    fn load_row_sets_values_and_foreign_keys() {
        let painting = Entity::new("Painting", "PAINTING")
            .attribute(Attribute::new("id", "ID", ColumnType::Integer).primary_key())
            .attribute(Attribute::new("title", "TITLE", ColumnType::VarChar))
            .relationship(Relationship::to_one("artist", "Artist").join("ARTIST_ID", "ID"));
        let row: BTreeMap<String, Value> = [
            ("ID".to_string(), Value::Integer(7)),
            ("TITLE".to_string(), Value::from("Water Lilies")),
            ("ARTIST_ID".to_string(), Value::Integer(3)),
        ]
        .into_iter()
        .collect();

        let obj = EntityRef::new("Painting");
        obj.write().load_row(&painting, &row);
        assert_eq!(obj.value("title"), Value::from("Water Lilies"));
        assert_eq!(
            obj.to_one("artist"),
            Fault::Loaded(Some(Identity::single("Artist", "ID", 3i64)))
        );
        assert_eq!(
            identity_from_row(&painting, &row),
            Some(Identity::single("Painting", "ID", 7i64))
        );

        let mut orphan = row.clone();
        orphan.insert("ARTIST_ID".into(), Value::Null);
        assert_eq!(target_from_row(&painting.relationships[0], &orphan), None);
        orphan.remove("ID");
        assert_eq!(identity_from_row(&painting, &orphan), None);
    }

    #[test]
    fn fault_accessors() {
        let f: Fault<i32> = Fault::Loaded(3);
        assert!(f.is_loaded());
        assert_eq!(f.by_ref(), Fault::Loaded(&3));
        assert_eq!(f.loaded(), Some(3));
        assert_eq!(Fault::<i32>::Resolving.loaded(), None);
    }
}
