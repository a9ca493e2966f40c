//! Inspect command implementation.

use relgraph_schema::{DeleteRule, Entity, Schema};
use serde::Serialize;
use std::path::Path;

/// Schema inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Schema file path.
    pub path: String,
    /// Number of entities.
    pub entity_count: usize,
    /// Number of relationships across all entities.
    pub relationship_count: usize,
    /// Per-entity details.
    pub entities: Vec<EntitySummary>,
}

/// Summary of one entity.
#[derive(Debug, Serialize)]
pub struct EntitySummary {
    /// Entity name.
    pub name: String,
    /// Table name.
    pub table: String,
    /// Primary key columns.
    pub primary_key: Vec<String>,
    /// Large-object columns.
    pub lob_columns: Vec<String>,
    /// Optimistic locking columns.
    pub locking_columns: Vec<String>,
    /// Relationships.
    pub relationships: Vec<RelationshipSummary>,
    /// Attributes (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Vec<AttributeSummary>>,
}

/// Summary of one relationship.
#[derive(Debug, Serialize)]
pub struct RelationshipSummary {
    /// Relationship name.
    pub name: String,
    /// Target entity.
    pub target: String,
    /// True for to-many.
    pub to_many: bool,
    /// Reverse relationship name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reverse: Option<String>,
    /// Delete rule.
    pub delete_rule: DeleteRule,
    /// True if this entity's table holds the foreign key.
    pub owns_foreign_key: bool,
}

/// Summary of one attribute.
#[derive(Debug, Serialize)]
pub struct AttributeSummary {
    /// Attribute name.
    pub name: String,
    /// Column name.
    pub column: String,
    /// Declared column type.
    pub column_type: String,
    /// Not nullable.
    pub mandatory: bool,
}

/// Runs the inspect command.
pub fn run(path: &Path, show_attributes: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let schema = Schema::from_json_file(path)?;
    let result = inspect(&schema, path, show_attributes);

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

/// Builds the inspection result.
pub fn inspect(schema: &Schema, path: &Path, show_attributes: bool) -> InspectResult {
    let entities: Vec<EntitySummary> = schema
        .entities()
        .map(|e| summarize(e, show_attributes))
        .collect();
    InspectResult {
        path: path.display().to_string(),
        entity_count: entities.len(),
        relationship_count: entities.iter().map(|e| e.relationships.len()).sum(),
        entities,
    }
}

fn summarize(entity: &Entity, show_attributes: bool) -> EntitySummary {
    let relationships = entity
        .relationships
        .iter()
        .map(|r| RelationshipSummary {
            name: r.name.clone(),
            target: r.target.clone(),
            to_many: r.to_many,
            reverse: r.reverse.clone(),
            delete_rule: r.delete_rule,
            owns_foreign_key: entity.owns_foreign_key(r),
        })
        .collect();
    let attributes = show_attributes.then(|| {
        entity
            .attributes
            .iter()
            .map(|a| AttributeSummary {
                name: a.name.clone(),
                column: a.column.clone(),
                column_type: a.column_type.to_string(),
                mandatory: a.mandatory,
            })
            .collect()
    });
    EntitySummary {
        name: entity.name.clone(),
        table: entity.table.clone(),
        primary_key: entity
            .primary_key_columns()
            .into_iter()
            .map(String::from)
            .collect(),
        lob_columns: entity.lob_attributes().map(|a| a.column.clone()).collect(),
        locking_columns: entity
            .locking_attributes()
            .map(|a| a.column.clone())
            .collect(),
        relationships,
        attributes,
    }
}

fn print_text_output(result: &InspectResult) {
    println!("relgraph Schema Inspection");
    println!("==========================");
    println!();
    println!("Path: {}", result.path);
    println!("Entities:      {}", result.entity_count);
    println!("Relationships: {}", result.relationship_count);

    for entity in &result.entities {
        println!();
        println!("{} (table {})", entity.name, entity.table);
        println!("  Primary key: {}", entity.primary_key.join(", "));
        if !entity.lob_columns.is_empty() {
            println!("  LOB columns: {}", entity.lob_columns.join(", "));
        }
        if !entity.locking_columns.is_empty() {
            println!("  Locking:     {}", entity.locking_columns.join(", "));
        }
        if let Some(attributes) = &entity.attributes {
            println!("  Attributes:");
            for a in attributes {
                let flag = if a.mandatory { " not null" } else { "" };
                println!("    {} -> {} {}{}", a.name, a.column, a.column_type, flag);
            }
        }
        if !entity.relationships.is_empty() {
            println!("  Relationships:");
            for r in &entity.relationships {
                let arity = if r.to_many { "to-many" } else { "to-one" };
                let reverse = r
                    .reverse
                    .as_deref()
                    .map_or_else(String::new, |name| format!(", reverse {name}"));
                println!(
                    "    {} -> {} ({arity}, {:?}{reverse})",
                    r.name, r.target, r.delete_rule
                );
            }
        }
    }
}
