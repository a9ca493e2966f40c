//! The validated schema and its builder.

use crate::entity::{Entity, Relationship};
use crate::error::{SchemaError, SchemaResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// On-disk form of a schema.
#[derive(Debug, Serialize, Deserialize)]
struct SchemaDocument {
    entities: Vec<Entity>,
}

/// Read-only description of every mapped entity.
///
/// A `Schema` is always validated: relationship targets exist, join columns
/// resolve, reverse relationships point back, and every entity has a
/// primary key.
#[derive(Debug, Clone)]
pub struct Schema {
    entities: Vec<Entity>,
    index: HashMap<String, usize>,
}

impl Schema {
    /// Starts building a schema.
    #[must_use]
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// Parses and validates a JSON schema document.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::Parse`] for malformed JSON, or a validation
    /// error for an inconsistent schema.
    pub fn from_json(json: &str) -> SchemaResult<Self> {
        let doc: SchemaDocument = serde_json::from_str(json)?;
        let mut builder = Self::builder();
        for mut entity in doc.entities {
            for rel in &mut entity.relationships {
                rel.source.clone_from(&entity.name);
            }
            builder = builder.entity(entity);
        }
        builder.build()
    }

    /// Reads a JSON schema document from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or the schema is invalid.
    pub fn from_json_file(path: impl AsRef<Path>) -> SchemaResult<Self> {
        let json = std::fs::read_to_string(path.as_ref()).map_err(|e| SchemaError::Parse {
            message: format!("{}: {e}", path.as_ref().display()),
        })?;
        Self::from_json(&json)
    }

    /// Serializes the schema to pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> SchemaResult<String> {
        let doc = SchemaDocument {
            entities: self.entities.clone(),
        };
        Ok(serde_json::to_string_pretty(&doc)?)
    }

    /// Looks up an entity.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::UnknownEntity`] if absent.
    pub fn entity(&self, name: &str) -> SchemaResult<&Entity> {
        self.get_entity(name)
            .ok_or_else(|| SchemaError::unknown_entity(name))
    }

    /// Looks up an entity, returning `None` if absent.
    #[must_use]
    pub fn get_entity(&self, name: &str) -> Option<&Entity> {
        self.index.get(name).map(|&i| &self.entities[i])
    }

    /// Relationships declared on an entity.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::UnknownEntity`] if absent.
    pub fn relationships_of(&self, entity: &str) -> SchemaResult<&[Relationship]> {
        Ok(&self.entity(entity)?.relationships)
    }

    /// Looks up a relationship.
    ///
    /// # Errors
    ///
    /// Returns an error if the entity or relationship is unknown.
    pub fn relationship(&self, entity: &str, name: &str) -> SchemaResult<&Relationship> {
        self.entity(entity)?
            .get_relationship(name)
            .ok_or_else(|| SchemaError::UnknownRelationship {
                entity: entity.to_string(),
                name: name.to_string(),
            })
    }

    /// Primary key columns of an entity.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::UnknownEntity`] if absent.
    pub fn primary_key_columns_of(&self, entity: &str) -> SchemaResult<Vec<&str>> {
        Ok(self.entity(entity)?.primary_key_columns())
    }

    /// The relationship pointing back along `relationship`, if declared.
    #[must_use]
    pub fn reverse_of(&self, relationship: &Relationship) -> Option<&Relationship> {
        let name = relationship.reverse.as_deref()?;
        self.get_entity(&relationship.target)?.get_relationship(name)
    }

    /// All entities in declaration order.
    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.iter()
    }

    /// Position of an entity in declaration order.
    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Number of entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Returns true if the schema declares no entity.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// Collects entities and validates them into a [`Schema`].
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    entities: Vec<Entity>,
}

impl SchemaBuilder {
    /// Adds an entity.
    #[must_use]
    pub fn entity(mut self, entity: Entity) -> Self {
        self.entities.push(entity);
        self
    }

    /// Validates and builds the schema.
    ///
    /// # Errors
    ///
    /// Returns the first validation error found.
    pub fn build(self) -> SchemaResult<Schema> {
        let mut index = HashMap::with_capacity(self.entities.len());
        for (i, entity) in self.entities.iter().enumerate() {
            if index.insert(entity.name.clone(), i).is_some() {
                return Err(SchemaError::DuplicateEntity {
                    name: entity.name.clone(),
                });
            }
        }
        let schema = Schema {
            entities: self.entities,
            index,
        };
        for entity in &schema.entities {
            validate_entity(&schema, entity)?;
        }
        tracing::debug!(entities = schema.entities.len(), "schema built");
        Ok(schema)
    }
}

fn validate_entity(schema: &Schema, entity: &Entity) -> SchemaResult<()> {
    if entity.primary_key().next().is_none() {
        return Err(SchemaError::invalid_entity(&entity.name, "no primary key"));
    }
    for (i, a) in entity.attributes.iter().enumerate() {
        if entity.attributes[..i].iter().any(|b| b.name == a.name) {
            return Err(SchemaError::invalid_entity(
                &entity.name,
                format!("duplicate attribute '{}'", a.name),
            ));
        }
        if entity.attributes[..i].iter().any(|b| b.column == a.column) {
            return Err(SchemaError::invalid_entity(
                &entity.name,
                format!("column {} mapped twice", a.column),
            ));
        }
    }
    for (i, rel) in entity.relationships.iter().enumerate() {
        if entity.relationships[..i].iter().any(|r| r.name == rel.name)
            || entity.get_attribute(&rel.name).is_some()
        {
            return Err(SchemaError::invalid_entity(
                &entity.name,
                format!("duplicate property '{}'", rel.name),
            ));
        }
        validate_relationship(schema, entity, rel)?;
    }
    Ok(())
}

fn validate_relationship(schema: &Schema, entity: &Entity, rel: &Relationship) -> SchemaResult<()> {
    let invalid = |message: String| SchemaError::invalid_relationship(&entity.name, &rel.name, message);

    let target = schema
        .get_entity(&rel.target)
        .ok_or_else(|| invalid(format!("unknown target entity {}", rel.target)))?;

    if rel.joins.is_empty() {
        return Err(invalid("no join columns".to_string()));
    }

    if rel.is_to_one() && entity.owns_foreign_key(rel) {
        // The foreign key must reference the whole target key.
        let mut target_cols: Vec<&str> = rel.target_columns().collect();
        let mut pk = target.primary_key_columns();
        target_cols.sort_unstable();
        pk.sort_unstable();
        if target_cols != pk {
            return Err(invalid(format!(
                "foreign key must reference the primary key of {}",
                target.name
            )));
        }
    } else {
        for column in rel.source_columns() {
            if !entity.has_column(column) {
                return Err(invalid(format!("unknown source column {column}")));
            }
        }
        for column in rel.target_columns() {
            if !target.has_column(column) {
                return Err(invalid(format!("unknown target column {column}")));
            }
        }
    }

    if let Some(reverse) = rel.reverse.as_deref() {
        let back = target
            .get_relationship(reverse)
            .ok_or_else(|| invalid(format!("unknown reverse relationship {reverse}")))?;
        if back.target != entity.name {
            return Err(invalid(format!(
                "reverse relationship {reverse} does not point back to {}",
                entity.name
            )));
        }
        if !rel.is_to_one() && !back.is_to_one() {
            return Err(invalid(format!(
                "reverse relationship {reverse} is also to-many; a join table is not supported"
            )));
        }
    }
    Ok(())
}
