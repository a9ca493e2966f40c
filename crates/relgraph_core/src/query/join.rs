//! Table aliases and join bookkeeping for one compilation.

use super::Quoter;
use relgraph_schema::Relationship;
use std::collections::HashMap;
use std::fmt::Write as _;

struct JoinClause {
    outer: bool,
    table: String,
    alias: String,
    conditions: Vec<(String, String, String, String)>,
}

/// Join tree of one query.
///
/// Each distinct traversal key gets exactly one alias; resolving the same
/// key again, from the select list, the qualifier or the orderings, reuses
/// it.
pub(crate) struct JoinStack {
    root_table: String,
    joins: Vec<JoinClause>,
    aliases: HashMap<String, String>,
}

impl JoinStack {
    pub const ROOT_ALIAS: &'static str = "t0";

    pub fn new(root_table: impl Into<String>) -> Self {
        Self {
            root_table: root_table.into(),
            joins: Vec::new(),
            aliases: HashMap::new(),
        }
    }

    /// Alias of the table reached through `key`, joining it on first use.
    pub fn join(
        &mut self,
        key: &str,
        parent_alias: &str,
        relationship: &Relationship,
        target_table: &str,
        outer: bool,
    ) -> String {
        if let Some(alias) = self.aliases.get(key) {
            return alias.clone();
        }
        let alias = format!("t{}", self.joins.len() + 1);
        self.joins.push(JoinClause {
            outer,
            table: target_table.to_string(),
            alias: alias.clone(),
            conditions: relationship
                .joins
                .iter()
                .map(|j| {
                    (
                        parent_alias.to_string(),
                        j.source_column.clone(),
                        alias.clone(),
                        j.target_column.clone(),
                    )
                })
                .collect(),
        });
        self.aliases.insert(key.to_string(), alias.clone());
        tracing::trace!(key, alias = %alias, table = target_table, outer, "registered join");
        alias
    }

    /// Number of joined tables.
    pub fn len(&self) -> usize {
        self.joins.len()
    }

    /// Renders the `FROM` clause including joins.
    pub fn render(&self, quoter: &Quoter) -> String {
        let mut sql = format!(" FROM {} {}", quoter.quote(&self.root_table), Self::ROOT_ALIAS);
        for join in &self.joins {
            let keyword = if join.outer { "LEFT JOIN" } else { "JOIN" };
            let _ = write!(sql, " {keyword} {} {} ON (", quoter.quote(&join.table), join.alias);
            for (i, (left, left_col, right, right_col)) in join.conditions.iter().enumerate() {
                if i > 0 {
                    sql.push_str(" AND ");
                }
                let _ = write!(
                    sql,
                    "{left}.{} = {right}.{}",
                    quoter.quote(left_col),
                    quoter.quote(right_col)
                );
            }
            sql.push(')');
        }
        sql
    }
}
