//! Scripted in-memory driver for testing.

use crate::driver::{Driver, ExecuteResult, LobHandle, LobLocator, Row};
use crate::error::{DriverError, DriverResult};
use parking_lot::Mutex;
use relgraph_codec::Value;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// One executed statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    /// SQL text.
    pub sql: String,
    /// Bound parameters.
    pub params: Vec<Value>,
}

/// One completed large-object write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LobWrite {
    /// Target cell.
    pub locator: LobLocator,
    /// Concatenated chunks.
    pub data: Vec<u8>,
    /// Number of chunks received.
    pub chunks: usize,
}

type QueryHandler = dyn Fn(&str, &[Value]) -> Option<DriverResult<ExecuteResult>> + Send + Sync;
type FailurePredicate = dyn Fn(&str) -> bool + Send + Sync;

#[derive(Default)]
struct State {
    in_transaction: bool,
    pending: Vec<Statement>,
    committed: Vec<Statement>,
    executed: Vec<Statement>,
    pending_lobs: Vec<LobWrite>,
    committed_lobs: Vec<LobWrite>,
    scripted: VecDeque<Vec<Row>>,
    commits: u64,
    rollbacks: u64,
}

/// A driver that records statements and answers from a script.
///
/// Queries (`SELECT ...`) return the next scripted row set, or the result of
/// the installed handler, or no rows. Other statements report one affected
/// row unless the handler says otherwise. Statements executed inside a
/// transaction only appear in [`MemoryDriver::statements`] once committed.
///
/// # Example
///
/// ```rust
/// use relgraph_driver::{Driver, MemoryDriver, Row};
///
/// let driver = MemoryDriver::new();
/// driver.push_rows(vec![Row::new().with("ID", 1i64)]);
/// let rows = driver.execute("SELECT ID FROM ARTIST", &[]).unwrap().into_rows();
/// assert_eq!(rows.len(), 1);
/// ```
#[derive(Default)]
pub struct MemoryDriver {
    state: Arc<Mutex<State>>,
    handler: Mutex<Option<Arc<QueryHandler>>>,
    fail_when: Mutex<Option<Arc<FailurePredicate>>>,
}

impl MemoryDriver {
    /// Creates an empty driver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the rows returned by the next query.
    pub fn push_rows(&self, rows: Vec<Row>) {
        self.state.lock().scripted.push_back(rows);
    }

    /// Installs a handler consulted for every statement before the script.
    ///
    /// Returning `None` falls back to the default behavior.
    pub fn on_execute<F>(&self, handler: F)
    where
        F: Fn(&str, &[Value]) -> Option<DriverResult<ExecuteResult>> + Send + Sync + 'static,
    {
        *self.handler.lock() = Some(Arc::new(handler));
    }

    /// Makes every statement whose SQL matches `predicate` fail.
    pub fn fail_when<F>(&self, predicate: F)
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        *self.fail_when.lock() = Some(Arc::new(predicate));
    }

    /// Removes the failure predicate.
    pub fn clear_failures(&self) {
        *self.fail_when.lock() = None;
    }

    /// Statements that took effect: auto-committed ones and those of
    /// committed transactions, in order.
    #[must_use]
    pub fn statements(&self) -> Vec<Statement> {
        self.state.lock().committed.clone()
    }

    /// Every statement executed, including rolled back and failed ones.
    #[must_use]
    pub fn executed(&self) -> Vec<Statement> {
        self.state.lock().executed.clone()
    }

    /// Committed statements whose SQL starts with `prefix`.
    #[must_use]
    pub fn statements_starting_with(&self, prefix: &str) -> Vec<Statement> {
        self.state
            .lock()
            .committed
            .iter()
            .filter(|s| s.sql.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Committed large-object writes.
    #[must_use]
    pub fn lob_writes(&self) -> Vec<LobWrite> {
        self.state.lock().committed_lobs.clone()
    }

    /// Number of committed transactions.
    #[must_use]
    pub fn commit_count(&self) -> u64 {
        self.state.lock().commits
    }

    /// Number of rolled back transactions.
    #[must_use]
    pub fn rollback_count(&self) -> u64 {
        self.state.lock().rollbacks
    }

    /// Returns true while a transaction is open.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.state.lock().in_transaction
    }

    /// Clears recorded statements and counters. Scripted rows are kept.
    pub fn reset_log(&self) {
        let mut state = self.state.lock();
        state.committed.clear();
        state.executed.clear();
        state.committed_lobs.clear();
        state.commits = 0;
        state.rollbacks = 0;
    }

    fn record(&self, statement: Statement) {
        let mut state = self.state.lock();
        state.executed.push(statement.clone());
        if state.in_transaction {
            state.pending.push(statement);
        } else {
            state.committed.push(statement);
        }
    }
}

fn is_query(sql: &str) -> bool {
    sql.trim_start()
        .get(..6)
        .is_some_and(|head| head.eq_ignore_ascii_case("SELECT"))
}

impl Driver for MemoryDriver {
    fn execute(&self, sql: &str, params: &[Value]) -> DriverResult<ExecuteResult> {
        tracing::trace!(sql, params = params.len(), "memory driver execute");
        let fail = self.fail_when.lock().clone();
        if fail.is_some_and(|f| f(sql)) {
            self.state.lock().executed.push(Statement {
                sql: sql.to_string(),
                params: params.to_vec(),
            });
            return Err(DriverError::statement(sql, "injected failure"));
        }

        let handler = self.handler.lock().clone();
        let handled = handler.and_then(|h| h(sql, params));

        let result = match handled {
            Some(result) => result?,
            None if is_query(sql) => {
                let rows = self.state.lock().scripted.pop_front().unwrap_or_default();
                ExecuteResult::Rows(rows)
            }
            None => ExecuteResult::Updated(1),
        };

        self.record(Statement {
            sql: sql.to_string(),
            params: params.to_vec(),
        });
        Ok(result)
    }

    fn begin_transaction(&self) -> DriverResult<()> {
        let mut state = self.state.lock();
        if state.in_transaction {
            return Err(DriverError::transaction("transaction already open"));
        }
        state.in_transaction = true;
        Ok(())
    }

    fn commit(&self) -> DriverResult<()> {
        let fail = self.fail_when.lock().clone();
        let mut state = self.state.lock();
        if !state.in_transaction {
            return Err(DriverError::NoTransaction);
        }
        if fail.is_some_and(|f| f("COMMIT")) {
            state.in_transaction = false;
            state.pending.clear();
            state.pending_lobs.clear();
            state.rollbacks += 1;
            return Err(DriverError::transaction("injected commit failure"));
        }
        state.in_transaction = false;
        let pending = std::mem::take(&mut state.pending);
        state.committed.extend(pending);
        let lobs = std::mem::take(&mut state.pending_lobs);
        state.committed_lobs.extend(lobs);
        state.commits += 1;
        Ok(())
    }

    fn rollback(&self) -> DriverResult<()> {
        let mut state = self.state.lock();
        if !state.in_transaction {
            return Err(DriverError::NoTransaction);
        }
        state.in_transaction = false;
        state.pending.clear();
        state.pending_lobs.clear();
        state.rollbacks += 1;
        Ok(())
    }

    fn open_lob(&self, locator: &LobLocator) -> DriverResult<Box<dyn LobHandle>> {
        let fail = self.fail_when.lock().clone();
        if fail.is_some_and(|f| f(&format!("LOB {}.{}", locator.table, locator.column))) {
            return Err(DriverError::lob("injected failure"));
        }
        Ok(Box::new(MemoryLobHandle {
            state: Arc::clone(&self.state),
            write: LobWrite {
                locator: locator.clone(),
                data: Vec::new(),
                chunks: 0,
            },
        }))
    }
}

impl fmt::Debug for MemoryDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryDriver")
            .field("in_transaction", &state.in_transaction)
            .field("statements", &state.committed.len())
            .field("commits", &state.commits)
            .finish_non_exhaustive()
    }
}

struct MemoryLobHandle {
    state: Arc<Mutex<State>>,
    write: LobWrite,
}

impl LobHandle for MemoryLobHandle {
    fn write_chunk(&mut self, chunk: &[u8]) -> DriverResult<()> {
        self.write.data.extend_from_slice(chunk);
        self.write.chunks += 1;
        Ok(())
    }

    fn finish(self: Box<Self>) -> DriverResult<()> {
        let mut state = self.state.lock();
        if state.in_transaction {
            state.pending_lobs.push(self.write);
        } else {
            state.committed_lobs.push(self.write);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_rows_are_fifo() {
        let driver = MemoryDriver::new();
        driver.push_rows(vec![Row::new().with("ID", 1i64)]);
        driver.push_rows(vec![]);

        let first = driver.execute("SELECT ID FROM A", &[]).unwrap().into_rows();
        let second = driver.execute("select ID FROM A", &[]).unwrap().into_rows();
        let third = driver.execute("SELECT ID FROM A", &[]).unwrap().into_rows();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert!(third.is_empty());
    }

    #[test]
    fn rollback_discards_statements() {
        let driver = MemoryDriver::new();
        driver.begin_transaction().unwrap();
        driver.execute("INSERT INTO A (ID) VALUES (?)", &[Value::Integer(1)]).unwrap();
        assert!(driver.statements().is_empty());
        driver.rollback().unwrap();

        assert!(driver.statements().is_empty());
        assert_eq!(driver.executed().len(), 1);
        assert_eq!(driver.rollback_count(), 1);
    }

    #[test]
    fn commit_publishes_statements() {
        let driver = MemoryDriver::new();
        driver.begin_transaction().unwrap();
        let result = driver.execute("UPDATE A SET X = ?", &[Value::Integer(1)]).unwrap();
        assert_eq!(result.update_count(), Some(1));
        driver.commit().unwrap();

        assert_eq!(driver.statements_starting_with("UPDATE").len(), 1);
        assert_eq!(driver.commit_count(), 1);
        assert!(matches!(driver.commit(), Err(DriverError::NoTransaction)));
    }

    #[test]
    fn injected_failure() {
        let driver = MemoryDriver::new();
        driver.fail_when(|sql| sql.contains("PAINTING"));
        assert!(driver.execute("DELETE FROM PAINTING", &[]).is_err());
        assert!(driver.execute("DELETE FROM ARTIST", &[]).is_ok());
        driver.clear_failures();
        assert!(driver.execute("DELETE FROM PAINTING", &[]).is_ok());
    }

    #[test]
    fn handler_overrides_update_count() {
        let driver = MemoryDriver::new();
        driver.on_execute(|sql, _| sql.starts_with("UPDATE").then(|| Ok(ExecuteResult::Updated(0))));
        assert_eq!(driver.execute("UPDATE A SET X = 1", &[]).unwrap().update_count(), Some(0));
        assert_eq!(driver.execute("DELETE FROM A", &[]).unwrap().update_count(), Some(1));
    }

    #[test]
    fn lob_writes_follow_transaction() {
        let driver = MemoryDriver::new();
        let locator = LobLocator {
            table: "PAINTING".into(),
            column: "IMAGE".into(),
            key: vec![("ID".into(), Value::Integer(1))],
        };
        driver.begin_transaction().unwrap();
        let mut handle = driver.open_lob(&locator).unwrap();
        handle.write_chunk(&[1, 2]).unwrap();
        handle.write_chunk(&[3]).unwrap();
        handle.finish().unwrap();
        assert!(driver.lob_writes().is_empty());
        driver.commit().unwrap();

        let writes = driver.lob_writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].data, vec![1, 2, 3]);
        assert_eq!(writes[0].chunks, 2);
    }
}
