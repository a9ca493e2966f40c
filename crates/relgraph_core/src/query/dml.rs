//! INSERT, UPDATE and DELETE rendering for commit batches.

use super::Quoter;
use crate::config::{LobConfig, SqlConfig};
use relgraph_codec::Value;
use relgraph_schema::Entity;
use std::collections::BTreeMap;
use std::fmt;

/// A rendered statement with its parameters.
#[derive(Clone, PartialEq, Eq)]
pub struct DmlStatement {
    /// SQL text with `?` placeholders.
    pub sql: String,
    /// Parameters in placeholder order.
    pub params: Vec<Value>,
}

impl fmt::Debug for DmlStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmlStatement")
            .field("sql", &self.sql)
            .field("params", &self.params.len())
            .finish()
    }
}

/// Large-object content written after its row, through a LOB handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LobValue {
    /// Target column.
    pub column: String,
    /// Content.
    pub data: Vec<u8>,
}

/// Renders data-modification statements for one store.
#[derive(Debug, Clone)]
pub struct DmlWriter<'a> {
    quoter: Quoter,
    lob: &'a LobConfig,
}

impl<'a> DmlWriter<'a> {
    /// Creates a writer.
    #[must_use]
    pub fn new(sql: &SqlConfig, lob: &'a LobConfig) -> Self {
        Self {
            quoter: Quoter::new(sql),
            lob,
        }
    }

    /// `INSERT` of every mapped column. Missing values are written as NULL.
    ///
    /// With two-phase LOB writes, non-null LOB values are replaced by the
    /// placeholder function and returned for streaming.
    #[must_use]
    pub fn insert(&self, entity: &Entity, row: &BTreeMap<String, Value>) -> (DmlStatement, Vec<LobValue>) {
        let mut names = Vec::new();
        let mut values = Vec::new();
        let mut params = Vec::new();
        let mut lobs = Vec::new();
        for column in entity.columns() {
            names.push(self.quoter.quote(column));
            let value = row.get(column).cloned().unwrap_or_default();
            values.push(self.bind(entity, column, value, &mut params, &mut lobs));
        }
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.quoter.quote(&entity.table),
            names.join(", "),
            values.join(", ")
        );
        (DmlStatement { sql, params }, lobs)
    }

    /// `UPDATE` of the given columns, qualified on `qualifier`.
    #[must_use]
    pub fn update(
        &self,
        entity: &Entity,
        changes: &BTreeMap<String, Value>,
        qualifier: &[(String, Value)],
    ) -> (DmlStatement, Vec<LobValue>) {
        let mut params = Vec::new();
        let mut lobs = Vec::new();
        let assignments: Vec<String> = changes
            .iter()
            .map(|(column, value)| {
                let bound = self.bind(entity, column, value.clone(), &mut params, &mut lobs);
                format!("{} = {bound}", self.quoter.quote(column))
            })
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            self.quoter.quote(&entity.table),
            assignments.join(", "),
            self.condition(qualifier, &mut params)
        );
        (DmlStatement { sql, params }, lobs)
    }

    /// `DELETE` qualified on `qualifier`.
    #[must_use]
    pub fn delete(&self, entity: &Entity, qualifier: &[(String, Value)]) -> DmlStatement {
        let mut params = Vec::new();
        let sql = format!(
            "DELETE FROM {} WHERE {}",
            self.quoter.quote(&entity.table),
            self.condition(qualifier, &mut params)
        );
        DmlStatement { sql, params }
    }

    /// `SELECT ... FOR UPDATE` that locks the LOB cells of one row before
    /// streaming.
    #[must_use]
    pub fn select_lobs(&self, entity: &Entity, columns: &[&str], key: &[(String, Value)]) -> DmlStatement {
        let mut params = Vec::new();
        let names: Vec<String> = columns.iter().map(|c| self.quoter.quote(c)).collect();
        let sql = format!(
            "SELECT {} FROM {} WHERE {} FOR UPDATE",
            names.join(", "),
            self.quoter.quote(&entity.table),
            self.condition(key, &mut params)
        );
        DmlStatement { sql, params }
    }

    fn bind(
        &self,
        entity: &Entity,
        column: &str,
        value: Value,
        params: &mut Vec<Value>,
        lobs: &mut Vec<LobValue>,
    ) -> String {
        let lob_type = entity
            .attribute_for_column(column)
            .map(|a| a.column_type)
            .filter(|t| t.is_lob());
        match lob_type {
            Some(column_type) if self.lob.two_phase && !value.is_null() => {
                lobs.push(LobValue {
                    column: column.to_string(),
                    data: lob_bytes(value),
                });
                if column_type.is_character_lob() {
                    self.lob.character_placeholder.clone()
                } else {
                    self.lob.binary_placeholder.clone()
                }
            }
            _ => {
                params.push(value);
                "?".to_string()
            }
        }
    }

    fn condition(&self, qualifier: &[(String, Value)], params: &mut Vec<Value>) -> String {
        qualifier
            .iter()
            .map(|(column, value)| {
                if value.is_null() {
                    format!("{} IS NULL", self.quoter.quote(column))
                } else {
                    params.push(value.clone());
                    format!("{} = ?", self.quoter.quote(column))
                }
            })
            .collect::<Vec<_>>()
            .join(" AND ")
    }
}

fn lob_bytes(value: Value) -> Vec<u8> {
    match value {
        Value::Bytes(b) => b,
        Value::Text(s) | Value::Decimal(s) => s.into_bytes(),
        other => other.to_string().into_bytes(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relgraph_schema::{Attribute, ColumnType, Relationship};

    fn painting() -> Entity {
        Entity::new("Painting", "PAINTING")
            .attribute(Attribute::new("id", "ID", ColumnType::Integer).primary_key())
            .attribute(Attribute::new("title", "TITLE", ColumnType::VarChar))
            .attribute(Attribute::new("image", "IMAGE", ColumnType::Blob))
            .attribute(Attribute::new("notes", "NOTES", ColumnType::Clob))
            .attribute(Attribute::new("version", "VERSION", ColumnType::Integer).used_for_locking())
            .relationship(Relationship::to_one("artist", "Artist").join("ARTIST_ID", "ID"))
    }

    fn row() -> BTreeMap<String, Value> {
        [
            ("ID".to_string(), Value::Integer(1)),
            ("TITLE".to_string(), Value::from("Irises")),
            ("IMAGE".to_string(), Value::Bytes(vec![1, 2, 3])),
            ("NOTES".to_string(), Value::Null),
            ("ARTIST_ID".to_string(), Value::Integer(7)),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn insert_binds_every_column() {
        let lob = LobConfig::default();
        let writer = DmlWriter::new(&SqlConfig::default(), &lob);
        let (stmt, lobs) = writer.insert(&painting(), &row());
        assert_eq!(
            stmt.sql,
            "INSERT INTO PAINTING (ID, TITLE, IMAGE, NOTES, VERSION, ARTIST_ID) VALUES (?, ?, ?, ?, ?, ?)"
        );
        assert_eq!(stmt.params.len(), 6);
        assert_eq!(stmt.params[4], Value::Null);
        assert!(lobs.is_empty());
    }

    #[test]
    fn two_phase_insert_uses_placeholders() {
        let lob = LobConfig::new().two_phase(true);
        let writer = DmlWriter::new(&SqlConfig::default(), &lob);
        let (stmt, lobs) = writer.insert(&painting(), &row());
        assert_eq!(
            stmt.sql,
            "INSERT INTO PAINTING (ID, TITLE, IMAGE, NOTES, VERSION, ARTIST_ID) VALUES (?, ?, EMPTY_BLOB(), ?, ?, ?)"
        );
        // Null LOBs are bound directly.
        assert_eq!(stmt.params.len(), 5);
        assert_eq!(
            lobs,
            vec![LobValue {
                column: "IMAGE".into(),
                data: vec![1, 2, 3]
            }]
        );

        let select = writer.select_lobs(&painting(), &["IMAGE"], &[("ID".into(), Value::Integer(1))]);
        assert_eq!(select.sql, "SELECT IMAGE FROM PAINTING WHERE ID = ? FOR UPDATE");
    }

    #[test]
    fn character_lob_placeholder() {
        let lob = LobConfig::new().two_phase(true).placeholders("EMPTY_BLOB()", "EMPTY_CLOB()");
        let writer = DmlWriter::new(&SqlConfig::default(), &lob);
        let changes: BTreeMap<String, Value> = [("NOTES".to_string(), Value::from("long text"))].into_iter().collect();
        let (stmt, lobs) = writer.update(&painting(), &changes, &[("ID".into(), Value::Integer(1))]);
        assert_eq!(stmt.sql, "UPDATE PAINTING SET NOTES = EMPTY_CLOB() WHERE ID = ?");
        assert_eq!(lobs[0].data, b"long text".to_vec());
    }

    #[test]
    fn update_with_locking_qualifier() {
        let lob = LobConfig::default();
        let writer = DmlWriter::new(&SqlConfig::default(), &lob);
        let changes: BTreeMap<String, Value> = [
            ("TITLE".to_string(), Value::from("Sunflowers")),
            ("ARTIST_ID".to_string(), Value::Null),
        ]
        .into_iter()
        .collect();
        let (stmt, _) = writer.update(
            &painting(),
            &changes,
            &[("ID".into(), Value::Integer(1)), ("VERSION".into(), Value::Null)],
        );
        assert_eq!(
            stmt.sql,
            "UPDATE PAINTING SET ARTIST_ID = ?, TITLE = ? WHERE ID = ? AND VERSION IS NULL"
        );
        assert_eq!(
            stmt.params,
            vec![Value::Null, Value::from("Sunflowers"), Value::Integer(1)]
        );
    }

    #[test]
    fn quoted_delete() {
        let lob = LobConfig::default();
        let writer = DmlWriter::new(&SqlConfig::new().quote_identifiers(true), &lob);
        let stmt = writer.delete(
            &painting(),
            &[("ID".into(), Value::Integer(1)), ("VERSION".into(), Value::Integer(4))],
        );
        assert_eq!(stmt.sql, "DELETE FROM \"PAINTING\" WHERE \"ID\" = ? AND \"VERSION\" = ?");
        assert_eq!(stmt.params, vec![Value::Integer(1), Value::Integer(4)]);
    }
}
