//! Entities, attributes and relationships.

use crate::types::{ColumnType, DeleteRule};
use serde::{Deserialize, Serialize};

/// A mapped scalar property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    /// Property name used by the Context API and in query paths.
    pub name: String,
    /// Column name in the entity's table.
    pub column: String,
    /// Declared column type.
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    /// Part of the primary key.
    #[serde(default)]
    pub primary_key: bool,
    /// NOT NULL column.
    #[serde(default)]
    pub mandatory: bool,
    /// Qualifies UPDATE and DELETE statements with the snapshot value.
    #[serde(default)]
    pub used_for_locking: bool,
}

impl Attribute {
    /// Creates a nullable, non-key attribute.
    pub fn new(name: impl Into<String>, column: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column: column.into(),
            column_type,
            primary_key: false,
            mandatory: false,
            used_for_locking: false,
        }
    }

    /// Marks the attribute as a primary key column.
    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.mandatory = true;
        self
    }

    /// Marks the attribute as NOT NULL.
    #[must_use]
    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    /// Marks the attribute for optimistic locking.
    #[must_use]
    pub fn used_for_locking(mut self) -> Self {
        self.used_for_locking = true;
        self
    }

    /// Returns true if the column holds a large object.
    #[must_use]
    pub fn is_lob(&self) -> bool {
        self.column_type.is_lob()
    }
}

/// One column pair of a relationship join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Join {
    /// Column on the source table.
    #[serde(rename = "source")]
    pub source_column: String,
    /// Column on the target table.
    #[serde(rename = "target")]
    pub target_column: String,
}

/// A directed relationship between two entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    /// Relationship name used in paths and by the Context API.
    pub name: String,
    /// Owning entity. Filled in when the relationship is added to an entity.
    #[serde(default)]
    pub source: String,
    /// Target entity.
    pub target: String,
    /// Join columns, source to target.
    pub joins: Vec<Join>,
    /// Arity.
    #[serde(default)]
    pub to_many: bool,
    /// Name of the relationship on the target that points back.
    #[serde(default)]
    pub reverse: Option<String>,
    /// Rule applied when the source object is deleted.
    #[serde(default)]
    pub delete_rule: DeleteRule,
}

impl Relationship {
    /// Creates a to-one relationship.
    pub fn to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: String::new(),
            target: target.into(),
            joins: Vec::new(),
            to_many: false,
            reverse: None,
            delete_rule: DeleteRule::default(),
        }
    }

    /// Creates a to-many relationship.
    pub fn to_many(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            to_many: true,
            ..Self::to_one(name, target)
        }
    }

    /// Adds a join column pair.
    #[must_use]
    pub fn join(mut self, source_column: impl Into<String>, target_column: impl Into<String>) -> Self {
        self.joins.push(Join {
            source_column: source_column.into(),
            target_column: target_column.into(),
        });
        self
    }

    /// Names the reverse relationship.
    #[must_use]
    pub fn reverse(mut self, name: impl Into<String>) -> Self {
        self.reverse = Some(name.into());
        self
    }

    /// Sets the delete rule.
    #[must_use]
    pub fn delete_rule(mut self, rule: DeleteRule) -> Self {
        self.delete_rule = rule;
        self
    }

    /// Returns true for to-one relationships.
    #[must_use]
    pub fn is_to_one(&self) -> bool {
        !self.to_many
    }

    /// Returns true if the relationship points back at its own entity.
    #[must_use]
    pub fn is_reflexive(&self) -> bool {
        self.source == self.target
    }

    /// Source-side join columns in declaration order.
    pub fn source_columns(&self) -> impl Iterator<Item = &str> {
        self.joins.iter().map(|j| j.source_column.as_str())
    }

    /// Target-side join columns in declaration order.
    pub fn target_columns(&self) -> impl Iterator<Item = &str> {
        self.joins.iter().map(|j| j.target_column.as_str())
    }
}

/// A mapped entity: one table, its attributes and outgoing relationships.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Entity name.
    pub name: String,
    /// Table name.
    pub table: String,
    /// Scalar attributes, primary key included.
    #[serde(default)]
    pub attributes: Vec<Attribute>,
    /// Outgoing relationships.
    #[serde(default)]
    pub relationships: Vec<Relationship>,
}

impl Entity {
    /// Creates an entity with no attributes.
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            attributes: Vec::new(),
            relationships: Vec::new(),
        }
    }

    /// Adds an attribute.
    #[must_use]
    pub fn attribute(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Adds a relationship, setting its source to this entity.
    #[must_use]
    pub fn relationship(mut self, mut relationship: Relationship) -> Self {
        relationship.source = self.name.clone();
        self.relationships.push(relationship);
        self
    }

    /// Looks up an attribute by property name.
    #[must_use]
    pub fn get_attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Looks up an attribute by column name.
    #[must_use]
    pub fn attribute_for_column(&self, column: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.column == column)
    }

    /// Looks up a relationship by name.
    #[must_use]
    pub fn get_relationship(&self, name: &str) -> Option<&Relationship> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// Primary key attributes in declaration order.
    pub fn primary_key(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.iter().filter(|a| a.primary_key)
    }

    /// Primary key column names in declaration order.
    #[must_use]
    pub fn primary_key_columns(&self) -> Vec<&str> {
        self.primary_key().map(|a| a.column.as_str()).collect()
    }

    /// Returns true if `column` is part of the primary key.
    #[must_use]
    pub fn is_primary_key_column(&self, column: &str) -> bool {
        self.primary_key().any(|a| a.column == column)
    }

    /// Returns true if this entity's table holds the foreign key of `relationship`.
    ///
    /// That is the case for to-one relationships whose source columns are
    /// not part of the primary key.
    #[must_use]
    pub fn owns_foreign_key(&self, relationship: &Relationship) -> bool {
        relationship.is_to_one()
            && !relationship.joins.is_empty()
            && relationship
                .source_columns()
                .all(|c| !self.is_primary_key_column(c))
    }

    /// To-one relationships whose foreign key lives in this table.
    pub fn foreign_key_relationships(&self) -> impl Iterator<Item = &Relationship> {
        self.relationships
            .iter()
            .filter(|r| self.owns_foreign_key(r))
    }

    /// Every column of the table: attribute columns, then foreign key
    /// columns not mapped as attributes.
    #[must_use]
    pub fn columns(&self) -> Vec<&str> {
        let mut columns: Vec<&str> = self.attributes.iter().map(|a| a.column.as_str()).collect();
        for rel in self.foreign_key_relationships() {
            for column in rel.source_columns() {
                if !columns.contains(&column) {
                    columns.push(column);
                }
            }
        }
        columns
    }

    /// Returns true if `column` belongs to the table.
    #[must_use]
    pub fn has_column(&self, column: &str) -> bool {
        self.columns().contains(&column)
    }

    /// Attributes holding large objects.
    pub fn lob_attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.iter().filter(|a| a.is_lob())
    }

    /// Attributes used for optimistic locking.
    pub fn locking_attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes.iter().filter(|a| a.used_for_locking)
    }
}
