//! Query description and SQL generation.
//!
//! A [`SelectQuery`] names a root entity, a qualifier [`Expression`] over
//! property paths, orderings and optional projected columns.
//! [`SqlCompiler`] resolves the paths against the schema and produces a
//! [`CompiledQuery`]: parameterized SQL plus ordered parameters and the
//! facts the caller needs to read the rows back.
//!
//! The same module renders the INSERT, UPDATE and DELETE statements of
//! commit batches.

mod dml;
mod expression;
mod join;
mod select;
mod translator;

pub use dml::{DmlStatement, DmlWriter, LobValue};
pub use expression::{CompareOp, Expression, Operand, Property};
pub use select::{Column, Ordering, SelectQuery};
pub use translator::{CompiledQuery, ResultColumn, SqlCompiler};

use crate::config::SqlConfig;

/// Identifier quoting for one dialect.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Quoter {
    quote: Option<char>,
}

impl Quoter {
    pub fn new(config: &SqlConfig) -> Self {
        Self {
            quote: config.quote_identifiers.then_some(config.quote_char),
        }
    }

    /// Table or column name, quoted when configured.
    pub fn quote(&self, identifier: &str) -> String {
        match self.quote {
            Some(q) => format!("{q}{identifier}{q}"),
            None => identifier.to_string(),
        }
    }

    /// Alias-qualified column reference.
    pub fn column(&self, alias: &str, column: &str) -> String {
        format!("{alias}.{}", self.quote(column))
    }
}
