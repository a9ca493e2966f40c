//! Select query description.

use super::expression::Expression;
use std::collections::BTreeMap;

/// One ordering term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ordering {
    /// Property path.
    pub path: String,
    /// Sort descending.
    pub descending: bool,
    /// Compare upper-cased.
    pub case_insensitive: bool,
}

impl Ordering {
    /// Ascending ordering.
    pub fn asc(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            descending: false,
            case_insensitive: false,
        }
    }

    /// Descending ordering.
    pub fn desc(path: impl Into<String>) -> Self {
        Self {
            descending: true,
            ..Self::asc(path)
        }
    }

    /// Makes the ordering case-insensitive.
    #[must_use]
    pub fn ignore_case(mut self) -> Self {
        self.case_insensitive = true;
        self
    }
}

/// A projected result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Column {
    /// Value at a property path.
    Path(String),
    /// `COUNT(*)`, or `COUNT(path)`.
    Count(Option<String>),
}

impl Column {
    /// Returns true for aggregate columns.
    #[must_use]
    pub fn is_aggregate(&self) -> bool {
        matches!(self, Self::Count(_))
    }
}

/// A query for objects of one root entity, or for projected columns when
/// columns are given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectQuery {
    root: String,
    qualifier: Option<Expression>,
    orderings: Vec<Ordering>,
    columns: Vec<Column>,
    aliases: BTreeMap<String, String>,
    distinct: bool,
    limit: Option<usize>,
    offset: usize,
}

impl SelectQuery {
    /// Creates a query rooted at `entity`.
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            root: entity.into(),
            qualifier: None,
            orderings: Vec::new(),
            columns: Vec::new(),
            aliases: BTreeMap::new(),
            distinct: false,
            limit: None,
            offset: 0,
        }
    }

    /// Sets the qualifier, AND-ing it with any existing one.
    #[must_use]
    pub fn filter(mut self, expression: Expression) -> Self {
        self.qualifier = Some(match self.qualifier.take() {
            Some(existing) => existing.and(expression),
            None => expression,
        });
        self
    }

    /// Appends an ordering.
    #[must_use]
    pub fn order_by(mut self, ordering: Ordering) -> Self {
        self.orderings.push(ordering);
        self
    }

    /// Appends a projected column.
    #[must_use]
    pub fn column(mut self, path: impl Into<String>) -> Self {
        self.columns.push(Column::Path(path.into()));
        self
    }

    /// Appends `COUNT(*)`.
    #[must_use]
    pub fn count(mut self) -> Self {
        self.columns.push(Column::Count(None));
        self
    }

    /// Appends `COUNT(path)`.
    #[must_use]
    pub fn count_of(mut self, path: impl Into<String>) -> Self {
        self.columns.push(Column::Count(Some(path.into())));
        self
    }

    /// Declares a split path alias: paths starting with `alias` follow
    /// `path` through their own join chain.
    #[must_use]
    pub fn alias(mut self, alias: impl Into<String>, path: impl Into<String>) -> Self {
        self.aliases.insert(alias.into(), path.into());
        self
    }

    /// Requests `SELECT DISTINCT`.
    #[must_use]
    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    /// Limits the number of results.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skips leading results.
    #[must_use]
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Root entity name.
    #[must_use]
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Qualifier.
    #[must_use]
    pub fn qualifier(&self) -> Option<&Expression> {
        self.qualifier.as_ref()
    }

    /// Orderings.
    #[must_use]
    pub fn orderings(&self) -> &[Ordering] {
        &self.orderings
    }

    /// Projected columns; empty for object queries.
    #[must_use]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Relationship path of a split alias.
    #[must_use]
    pub fn alias_path(&self, alias: &str) -> Option<&str> {
        self.aliases.get(alias).map(String::as_str)
    }

    /// Returns true if `SELECT DISTINCT` was requested.
    #[must_use]
    pub fn is_distinct(&self) -> bool {
        self.distinct
    }

    /// Result limit.
    #[must_use]
    pub fn fetch_limit(&self) -> Option<usize> {
        self.limit
    }

    /// Result offset.
    #[must_use]
    pub fn fetch_offset(&self) -> usize {
        self.offset
    }

    /// Returns true if the query fetches objects rather than columns.
    #[must_use]
    pub fn is_object_query(&self) -> bool {
        self.columns.is_empty()
    }
}
