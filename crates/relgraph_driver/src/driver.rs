//! Driver trait definition.

use crate::error::DriverResult;
use relgraph_codec::Value;
use std::collections::BTreeMap;

/// One result row: column labels and values in select order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    columns: Vec<(String, Value)>,
}

impl Row {
    /// Creates an empty row.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a column.
    #[must_use]
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(column, value);
        self
    }

    /// Appends a column in place.
    pub fn push(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.columns.push((column.into(), value.into()));
    }

    /// Value of a column by label.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, v)| v)
    }

    /// Value at a select position.
    #[must_use]
    pub fn get_index(&self, index: usize) -> Option<&Value> {
        self.columns.get(index).map(|(_, v)| v)
    }

    /// Column labels and values in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(c, v)| (c.as_str(), v))
    }

    /// Number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns true if the row has no column.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Converts into a column map. Later duplicates win.
    #[must_use]
    pub fn into_map(self) -> BTreeMap<String, Value> {
        self.columns.into_iter().collect()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            columns: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

/// Outcome of one statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecuteResult {
    /// Rows returned by a query.
    Rows(Vec<Row>),
    /// Number of rows affected by a data-modification statement.
    Updated(u64),
}

impl ExecuteResult {
    /// Returns the rows, or an empty list for an update.
    #[must_use]
    pub fn into_rows(self) -> Vec<Row> {
        match self {
            Self::Rows(rows) => rows,
            Self::Updated(_) => Vec::new(),
        }
    }

    /// Returns the update count, if any.
    #[must_use]
    pub fn update_count(&self) -> Option<u64> {
        match self {
            Self::Rows(_) => None,
            Self::Updated(n) => Some(*n),
        }
    }
}

/// Addresses one large-object cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LobLocator {
    /// Table name.
    pub table: String,
    /// LOB column.
    pub column: String,
    /// Primary key column/value pairs of the row.
    pub key: Vec<(String, Value)>,
}

/// An open large-object handle that receives the value in chunks.
pub trait LobHandle: Send {
    /// Writes the next chunk.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the write.
    fn write_chunk(&mut self, chunk: &[u8]) -> DriverResult<()>;

    /// Completes the write.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the value.
    fn finish(self: Box<Self>) -> DriverResult<()>;
}

/// Synchronous request/response access to a transactional relational store.
///
/// Drivers execute parameterized SQL: every `?` in `sql` binds the next
/// value of `params`. Statements issued between [`Driver::begin_transaction`]
/// and [`Driver::commit`] or [`Driver::rollback`] form one transaction.
///
/// # Implementors
///
/// - [`crate::MemoryDriver`] - scripted driver for tests
pub trait Driver: Send + Sync {
    /// Executes one statement.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the statement.
    fn execute(&self, sql: &str, params: &[Value]) -> DriverResult<ExecuteResult>;

    /// Opens a transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if a transaction cannot be started.
    fn begin_transaction(&self) -> DriverResult<()>;

    /// Commits the open transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit fails; the transaction is then gone.
    fn commit(&self) -> DriverResult<()>;

    /// Rolls back the open transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if no transaction is open.
    fn rollback(&self) -> DriverResult<()>;

    /// Opens a large-object handle on a row selected `FOR UPDATE`.
    ///
    /// # Errors
    ///
    /// Returns an error if the cell cannot be opened.
    fn open_lob(&self, locator: &LobLocator) -> DriverResult<Box<dyn LobHandle>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_access() {
        let row = Row::new().with("ID", 1i64).with("NAME", "Monet");
        assert_eq!(row.get("NAME"), Some(&Value::from("Monet")));
        assert_eq!(row.get_index(0), Some(&Value::Integer(1)));
        assert_eq!(row.get("MISSING"), None);
        assert_eq!(row.len(), 2);

        let map = row.into_map();
        assert_eq!(map["ID"], Value::Integer(1));
    }

    #[test]
    fn result_accessors() {
        assert_eq!(ExecuteResult::Updated(3).update_count(), Some(3));
        assert!(ExecuteResult::Updated(3).into_rows().is_empty());
        let rows = vec![Row::new().with("ID", 1i64)];
        assert_eq!(ExecuteResult::Rows(rows.clone()).into_rows(), rows);
    }
}
