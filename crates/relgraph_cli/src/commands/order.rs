//! Order command implementation.

use relgraph_schema::{EntitySorter, Schema, SchemaResult};
use serde::Serialize;
use std::path::Path;

/// Commit ordering result.
#[derive(Debug, Serialize)]
pub struct OrderResult {
    /// Order of INSERT and UPDATE batches.
    pub insert_order: Vec<String>,
    /// Order of DELETE batches.
    pub delete_order: Vec<String>,
    /// Entities whose rows must also be ordered among themselves.
    pub reflexive: Vec<ReflexiveEntry>,
}

/// A self-referencing relationship.
#[derive(Debug, Serialize)]
pub struct ReflexiveEntry {
    /// Entity name.
    pub entity: String,
    /// Relationship name.
    pub relationship: String,
}

/// Runs the order command.
pub fn run(path: &Path, entities: &[String], format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let schema = Schema::from_json_file(path)?;
    let result = order(&schema, entities)?;

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

/// Computes the commit order of `entities`, or of the whole schema when
/// the list is empty.
pub fn order(schema: &Schema, entities: &[String]) -> SchemaResult<OrderResult> {
    let names: Vec<&str> = if entities.is_empty() {
        schema.entities().map(|e| e.name.as_str()).collect()
    } else {
        entities.iter().map(String::as_str).collect()
    };

    let sorter = EntitySorter::new(schema);
    let insert_order = sorter.sort_for_insert(names.iter().copied())?;
    let delete_order = sorter.sort_for_delete(names.iter().copied())?;

    let mut reflexive = Vec::new();
    for name in &names {
        for rel in sorter.reflexive_relationships(name)? {
            reflexive.push(ReflexiveEntry {
                entity: (*name).to_string(),
                relationship: rel.name.clone(),
            });
        }
    }

    Ok(OrderResult {
        insert_order,
        delete_order,
        reflexive,
    })
}

fn print_text_output(result: &OrderResult) {
    println!("relgraph Commit Order");
    println!("=====================");
    println!();
    println!("Insert/update:");
    for (i, name) in result.insert_order.iter().enumerate() {
        println!("  {:>3}. {name}", i + 1);
    }
    println!();
    println!("Delete:");
    for (i, name) in result.delete_order.iter().enumerate() {
        println!("  {:>3}. {name}", i + 1);
    }
    if !result.reflexive.is_empty() {
        println!();
        println!("Rows sorted within entity:");
        for entry in &result.reflexive {
            println!("  {} via {}", entry.entity, entry.relationship);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relgraph_schema::{Attribute, ColumnType, Entity, Relationship};

    fn schema() -> Schema {
        Schema::builder()
            .entity(
                Entity::new("Painting", "PAINTING")
                    .attribute(Attribute::new("id", "ID", ColumnType::Integer).primary_key())
                    .relationship(Relationship::to_one("artist", "Artist").join("ARTIST_ID", "ID")),
            )
            .entity(
                Entity::new("Artist", "ARTIST")
                    .attribute(Attribute::new("id", "ID", ColumnType::Integer).primary_key())
                    .relationship(Relationship::to_one("mentor", "Artist").join("MENTOR_ID", "ID")),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn masters_are_inserted_first_and_deleted_last() {
        let result = order(&schema(), &[]).unwrap();

        assert_eq!(result.insert_order, vec!["Artist", "Painting"]);
        assert_eq!(result.delete_order, vec!["Painting", "Artist"]);
        assert_eq!(result.reflexive.len(), 1);
        assert_eq!(result.reflexive[0].relationship, "mentor");
    }

    #[test]
    fn unknown_entity_is_an_error() {
        assert!(order(&schema(), &["Sculpture".to_string()]).is_err());
    }
}
