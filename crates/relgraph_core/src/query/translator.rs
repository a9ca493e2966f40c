//! Select query to SQL translation.

use super::expression::{CompareOp, Expression, Operand};
use super::join::JoinStack;
use super::select::{Column, SelectQuery};
use super::Quoter;
use crate::config::SqlConfig;
use crate::error::{CoreError, CoreResult};
use relgraph_codec::{Identity, Value};
use relgraph_schema::{Entity, Schema};
use std::fmt::Write as _;

/// Description of one result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultColumn {
    /// Column name for object queries, the path for column queries.
    pub label: String,
    /// Large-object column.
    pub lob: bool,
    /// Aggregate column.
    pub aggregate: bool,
}

/// A compiled select statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledQuery {
    /// SQL text with `?` placeholders.
    pub sql: String,
    /// Parameters in placeholder order.
    pub params: Vec<Value>,
    /// Root entity.
    pub root: String,
    /// Result columns in select-list order.
    pub columns: Vec<ResultColumn>,
    /// `SELECT DISTINCT` was emitted.
    pub distinct: bool,
    /// Distinct results were needed but `DISTINCT` could not be emitted
    /// because a large-object column is selected; de-duplicate in memory.
    pub suppressed_distinct: bool,
    /// Limit to apply after fetching.
    pub memory_limit: Option<usize>,
    /// Offset to apply after fetching.
    pub memory_offset: usize,
    /// Rows describe root objects rather than projected columns.
    pub object_query: bool,
}

/// Resolved column of a path.
struct ColumnRef {
    sql: String,
    lob: bool,
    /// Entity whose key the column holds.
    key_of: Option<String>,
}

/// Compiles [`SelectQuery`] values against a schema.
#[derive(Debug, Clone, Copy)]
pub struct SqlCompiler<'a> {
    schema: &'a Schema,
    config: &'a SqlConfig,
}

impl<'a> SqlCompiler<'a> {
    /// Creates a compiler.
    #[must_use]
    pub fn new(schema: &'a Schema, config: &'a SqlConfig) -> Self {
        Self { schema, config }
    }

    /// Compiles a select query.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidPath`] or
    /// [`CoreError::InvalidTerminalRelationship`] for paths that do not
    /// resolve, [`CoreError::InvalidExpression`] for untranslatable
    /// qualifiers, and [`CoreError::InvalidParameter`] or
    /// [`CoreError::UnsupportedCompositeKeyParameter`] for object
    /// parameters without a usable key.
    pub fn compile_select(&self, query: &SelectQuery) -> CoreResult<CompiledQuery> {
        let root = self.schema.entity(query.root())?;
        let mut compilation = Compilation {
            schema: self.schema,
            root,
            query,
            quoter: Quoter::new(self.config),
            joins: JoinStack::new(root.table.clone()),
            params: Vec::new(),
            forcing_distinct: false,
        };
        let compiled = compilation.run(self.config)?;
        tracing::debug!(
            sql = %compiled.sql,
            params = compiled.params.len(),
            suppressed_distinct = compiled.suppressed_distinct,
            "compiled select"
        );
        Ok(compiled)
    }
}

struct Compilation<'a> {
    schema: &'a Schema,
    root: &'a Entity,
    query: &'a SelectQuery,
    quoter: Quoter,
    joins: JoinStack,
    params: Vec<Value>,
    forcing_distinct: bool,
}

impl<'a> Compilation<'a> {
    fn run(&mut self, config: &SqlConfig) -> CoreResult<CompiledQuery> {
        let query = self.query;
        let root = self.root;
        let mut select: Vec<String> = Vec::new();
        let mut columns = Vec::new();
        let mut group_by = Vec::new();

        if query.is_object_query() {
            for column in root.columns() {
                select.push(self.quoter.column(JoinStack::ROOT_ALIAS, column));
                columns.push(ResultColumn {
                    label: column.to_string(),
                    lob: root
                        .attribute_for_column(column)
                        .is_some_and(|a| a.is_lob()),
                    aggregate: false,
                });
            }
        } else {
            for column in query.columns() {
                let (sql, label, lob) = match column {
                    Column::Path(path) => {
                        let resolved = self.resolve(path)?;
                        group_by.push(resolved.sql.clone());
                        (resolved.sql, path.clone(), resolved.lob)
                    }
                    Column::Count(None) => ("COUNT(*)".to_string(), "COUNT(*)".to_string(), false),
                    Column::Count(Some(path)) => {
                        let resolved = self.resolve(path)?;
                        (format!("COUNT({})", resolved.sql), format!("COUNT({path})"), false)
                    }
                };
                select.push(sql);
                columns.push(ResultColumn {
                    label,
                    lob,
                    aggregate: column.is_aggregate(),
                });
            }
        }

        let qualifier = match query.qualifier() {
            Some(expression) => Some(self.expression(expression)?),
            None => None,
        };

        let mut order_by = Vec::new();
        let mut order_columns = Vec::new();
        for ordering in query.orderings() {
            let resolved = self.resolve(&ordering.path)?;
            let expr = if ordering.case_insensitive {
                format!("UPPER({})", resolved.sql)
            } else {
                resolved.sql
            };
            order_by.push(if ordering.descending {
                format!("{expr} DESC")
            } else {
                expr.clone()
            });
            order_columns.push(expr);
        }

        let has_aggregate = columns.iter().any(|c| c.aggregate);
        let wants_distinct = query.is_distinct() || (self.forcing_distinct && !has_aggregate);
        let has_lob = columns.iter().any(|c| c.lob);
        let suppressed_distinct = wants_distinct && has_lob;
        let distinct = wants_distinct && !has_lob;

        if distinct {
            for expr in order_columns {
                if !select.contains(&expr) {
                    select.push(expr);
                }
            }
        }

        let mut sql = String::from("SELECT ");
        if distinct {
            sql.push_str("DISTINCT ");
        }
        sql.push_str(&select.join(", "));
        sql.push_str(&self.joins.render(&self.quoter));
        if let Some(qualifier) = qualifier {
            let _ = write!(sql, " WHERE {qualifier}");
        }
        if has_aggregate && !group_by.is_empty() {
            let _ = write!(sql, " GROUP BY {}", group_by.join(", "));
        }
        if !order_by.is_empty() {
            let _ = write!(sql, " ORDER BY {}", order_by.join(", "));
        }

        let limit = query.fetch_limit();
        let offset = query.fetch_offset();
        let page_in_memory = suppressed_distinct || !config.supports_limit;
        if !page_in_memory {
            if let Some(limit) = limit {
                let _ = write!(sql, " LIMIT {limit}");
            }
            if offset > 0 {
                let _ = write!(sql, " OFFSET {offset}");
            }
        }

        Ok(CompiledQuery {
            sql,
            params: std::mem::take(&mut self.params),
            root: root.name.clone(),
            columns,
            distinct,
            suppressed_distinct,
            memory_limit: if page_in_memory { limit } else { None },
            memory_offset: if page_in_memory { offset } else { 0 },
            object_query: query.is_object_query(),
        })
    }

    /// Resolves a path to a column, registering joins on the way.
    fn resolve(&mut self, path: &str) -> CoreResult<ColumnRef> {
        let schema = self.schema;
        let query = self.query;
        let mut components: Vec<&str> = path.split('.').collect();
        if components.iter().any(|c| c.is_empty()) {
            return Err(CoreError::invalid_path(path, "empty path component"));
        }

        // Split aliases start their own join chain.
        let mut key = String::new();
        if let Some(aliased) = query.alias_path(components[0]) {
            key = format!("@{}", components[0]);
            let mut expanded: Vec<&str> = aliased.split('.').collect();
            expanded.extend_from_slice(&components[1..]);
            components = expanded;
        }

        let mut entity = self.root;
        let mut alias = JoinStack::ROOT_ALIAS.to_string();
        let count = components.len();
        for (i, component) in components.iter().enumerate() {
            let last = i + 1 == count;

            if let Some(column) = component.strip_prefix("db:") {
                if !last {
                    return Err(CoreError::invalid_path(path, "db: component must end the path"));
                }
                if !entity.has_column(column) {
                    return Err(CoreError::invalid_path(
                        path,
                        format!("no column {column} on {}", entity.name),
                    ));
                }
                return Ok(ColumnRef {
                    sql: self.quoter.column(&alias, column),
                    lob: entity.attribute_for_column(column).is_some_and(|a| a.is_lob()),
                    key_of: key_owner(entity, column),
                });
            }

            let (name, outer) = match component.strip_suffix('+') {
                Some(name) => (name, true),
                None => (*component, false),
            };

            if let Some(attribute) = entity.get_attribute(name) {
                if !last {
                    return Err(CoreError::invalid_path(
                        path,
                        format!("attribute '{name}' can only end a path"),
                    ));
                }
                if outer {
                    return Err(CoreError::invalid_path(
                        path,
                        format!("outer join marker on attribute '{name}'"),
                    ));
                }
                return Ok(ColumnRef {
                    sql: self.quoter.column(&alias, &attribute.column),
                    lob: attribute.is_lob(),
                    key_of: attribute.primary_key.then(|| entity.name.clone()),
                });
            }

            let relationship = entity.get_relationship(name).ok_or_else(|| {
                CoreError::invalid_path(path, format!("no property '{name}' on {}", entity.name))
            })?;
            let target = schema.entity(&relationship.target)?;

            if last && entity.owns_foreign_key(relationship) {
                let [join] = relationship.joins.as_slice() else {
                    return Err(CoreError::InvalidTerminalRelationship {
                        path: path.to_string(),
                        message: format!("'{name}' has a multi-column foreign key"),
                    });
                };
                return Ok(ColumnRef {
                    sql: self.quoter.column(&alias, &join.source_column),
                    lob: false,
                    key_of: Some(target.name.clone()),
                });
            }

            if !key.is_empty() {
                key.push('.');
            }
            key.push_str(component);
            alias = self.joins.join(&key, &alias, relationship, &target.table, outer);
            if relationship.to_many {
                self.forcing_distinct = true;
            }
            entity = target;

            if last {
                let pk = target.primary_key_columns();
                let [pk] = pk.as_slice() else {
                    return Err(CoreError::InvalidTerminalRelationship {
                        path: path.to_string(),
                        message: format!("{} has a composite primary key", target.name),
                    });
                };
                return Ok(ColumnRef {
                    sql: self.quoter.column(&alias, pk),
                    lob: false,
                    key_of: Some(target.name.clone()),
                });
            }
        }
        Err(CoreError::invalid_path(path, "empty path"))
    }

    fn expression(&mut self, expression: &Expression) -> CoreResult<String> {
        match expression {
            Expression::Compare { path, op, operand } => {
                let column = self.resolve(path)?;
                let value = self.operand_value(path, &column, operand)?;
                if value.is_null() {
                    return match op {
                        CompareOp::Eq => Ok(format!("{} IS NULL", column.sql)),
                        CompareOp::Ne => Ok(format!("{} IS NOT NULL", column.sql)),
                        other => Err(CoreError::invalid_expression(format!(
                            "cannot compare '{path}' with NULL using {}",
                            other.sql()
                        ))),
                    };
                }
                self.params.push(value);
                Ok(format!("{} {} ?", column.sql, op.sql()))
            }
            Expression::In { path, operands } => {
                let column = self.resolve(path)?;
                if operands.is_empty() {
                    return Ok("1 = 0".to_string());
                }
                for operand in operands {
                    let value = self.operand_value(path, &column, operand)?;
                    self.params.push(value);
                }
                let placeholders = vec!["?"; operands.len()].join(", ");
                Ok(format!("{} IN ({placeholders})", column.sql))
            }
            Expression::Like {
                path,
                pattern,
                case_insensitive,
                escape,
            } => {
                if *escape == Some('?') {
                    return Err(CoreError::invalid_expression(
                        "'?' cannot be used as a LIKE escape character",
                    ));
                }
                let column = self.resolve(path)?;
                self.params.push(Value::Text(pattern.clone()));
                let mut sql = if *case_insensitive {
                    format!("UPPER({}) LIKE UPPER(?)", column.sql)
                } else {
                    format!("{} LIKE ?", column.sql)
                };
                if let Some(c) = escape {
                    let c = if *c == '\'' { "''".to_string() } else { c.to_string() };
                    let _ = write!(sql, " ESCAPE '{c}'");
                }
                Ok(sql)
            }
            Expression::And(list) => self.junction(list, " AND ", "1 = 1"),
            Expression::Or(list) => self.junction(list, " OR ", "1 = 0"),
            Expression::Not(inner) => Ok(format!("NOT ({})", self.expression(inner)?)),
        }
    }

    fn junction(&mut self, list: &[Expression], separator: &str, empty: &str) -> CoreResult<String> {
        match list {
            [] => Ok(empty.to_string()),
            [single] => self.expression(single),
            _ => {
                let parts = list
                    .iter()
                    .map(|e| self.expression(e))
                    .collect::<CoreResult<Vec<_>>>()?;
                Ok(format!("({})", parts.join(separator)))
            }
        }
    }

    fn operand_value(&self, path: &str, column: &ColumnRef, operand: &Operand) -> CoreResult<Value> {
        match operand {
            Operand::Value(v) => Ok(v.clone()),
            Operand::Object(object) => {
                let identity = object.identity().ok_or_else(|| {
                    CoreError::invalid_parameter(format!(
                        "transient {} cannot be a query parameter",
                        object.entity_name()
                    ))
                })?;
                key_parameter(path, column, &identity)
            }
            Operand::Identity(identity) => key_parameter(path, column, identity),
        }
    }
}

/// Entity whose key a column holds: the entity itself for primary key
/// columns, the target for foreign key columns.
fn key_owner(entity: &Entity, column: &str) -> Option<String> {
    if entity.is_primary_key_column(column) {
        return Some(entity.name.clone());
    }
    entity
        .foreign_key_relationships()
        .find(|r| r.source_columns().any(|c| c == column))
        .map(|r| r.target.clone())
}

fn key_parameter(path: &str, column: &ColumnRef, identity: &Identity) -> CoreResult<Value> {
    if identity.is_temporary() {
        return Err(CoreError::invalid_parameter(format!(
            "{identity} is not committed and cannot be a query parameter"
        )));
    }
    if let Some(expected) = &column.key_of {
        if expected != identity.entity_name() {
            return Err(CoreError::invalid_parameter(format!(
                "'{path}' expects {expected}, got {}",
                identity.entity_name()
            )));
        }
    }
    identity
        .single_key_value()
        .cloned()
        .ok_or_else(|| CoreError::UnsupportedCompositeKeyParameter {
            identity: identity.clone(),
        })
}
