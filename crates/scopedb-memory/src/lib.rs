//! In-process reference driver for ScopeDB.
//!
//! `MemoryDriver` keeps tables in shared memory and hands out lightweight
//! connection handles. It exists so the pool and session layers can be
//! exercised without a database server, and it records enough about what it
//! was asked to do for tests to assert on round trips.
//!
//! # Semantics
//!
//! - Tables have one integer key column with auto-increment.
//! - Writes apply immediately and are visible to every connection
//!   (read-uncommitted). Each connection keeps an undo log for its open
//!   transaction; rollback replays it in reverse.
//! - `Raw` statements understand `SELECT connection_id()`, `SELECT 1`, and
//!   `SHOW statement_timeout`.
//! - Faults can be injected: failed connects, failed statements, failed
//!   rollbacks, and killed connections.
//!
//! # Example
//!
//! ```rust,ignore
//! let driver = MemoryDriver::new();
//! driver.create_table("users", "id", &["name"]);
//! let mut conn = match driver.connect(&cx).await {
//!     Outcome::Ok(conn) => conn,
//!     _ => return,
//! };
//! ```

use scopedb_core::{
    Cx, Driver, Error, ExecOptions, Filter, Outcome, QueryErrorKind, Row, RowSet, Statement,
    Value,
};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// One statement as seen by the driver.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedStatement {
    pub connection: u64,
    pub statement: Statement,
    pub options: ExecOptions,
}

#[derive(Debug)]
struct Table {
    key_column: String,
    /// Key column first.
    columns: Vec<String>,
    rows: BTreeMap<i64, Vec<Value>>,
    next_id: i64,
}

impl Table {
    fn index_of(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    fn row(&self, values: &[Value]) -> Row {
        Row::new(self.columns.clone(), values.to_vec())
    }
}

#[derive(Debug)]
enum Undo {
    Insert { table: String, key: i64 },
    Update { table: String, key: i64, previous: Vec<Value> },
}

#[derive(Debug, Default)]
struct ConnState {
    in_transaction: bool,
    undo: Vec<Undo>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, Table>,
    connections: HashMap<u64, ConnState>,
    killed: HashSet<u64>,
    log: Vec<LoggedStatement>,
    connections_opened: u64,
    commits: u64,
    rollbacks: u64,
    pings: u64,
    fail_connects: usize,
    fail_statement: Option<String>,
    fail_rollbacks: usize,
}

impl MemoryState {
    fn check_alive(&self, id: u64) -> Result<(), Error> {
        if self.killed.contains(&id) || !self.connections.contains_key(&id) {
            return Err(Error::disconnected(format!(
                "connection {} is no longer available",
                id
            )));
        }
        Ok(())
    }

    fn undo_all(&mut self, id: u64) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        conn.in_transaction = false;
        let undo = std::mem::take(&mut conn.undo);
        for entry in undo.into_iter().rev() {
            match entry {
                Undo::Insert { table, key } => {
                    if let Some(t) = self.tables.get_mut(&table) {
                        t.rows.remove(&key);
                    }
                }
                Undo::Update {
                    table,
                    key,
                    previous,
                } => {
                    if let Some(t) = self.tables.get_mut(&table) {
                        t.rows.insert(key, previous);
                    }
                }
            }
        }
    }

    fn record_undo(&mut self, id: u64, undo: Undo) {
        if let Some(conn) = self.connections.get_mut(&id) {
            if conn.in_transaction {
                conn.undo.push(undo);
            }
        }
    }

    fn execute(&mut self, id: u64, stmt: &Statement, options: &ExecOptions) -> Result<RowSet, Error> {
        self.check_alive(id)?;
        self.log.push(LoggedStatement {
            connection: id,
            statement: stmt.clone(),
            options: *options,
        });
        if let Some(message) = self.fail_statement.take() {
            return Err(Error::query(
                QueryErrorKind::Database,
                Some(stmt.to_string()),
                message,
            ));
        }

        match stmt {
            Statement::Insert {
                table,
                columns,
                values,
                returning,
            } => self.insert(id, stmt, table, columns, values, returning.is_some()),
            Statement::Update {
                table,
                key,
                columns,
                values,
                ..
            } => self.update(id, stmt, table, key, columns, values),
            Statement::Select {
                table,
                filter,
                order_by,
            } => self.select(stmt, table, filter, order_by.as_deref()),
            Statement::SelectJoined {
                parent,
                parent_key,
                child,
                foreign_key,
                filter,
            } => self.select_joined(stmt, parent, parent_key, child, foreign_key, filter),
            Statement::Raw { sql, .. } => raw(id, sql, options),
        }
    }

    fn table_mut(&mut self, stmt: &Statement, name: &str) -> Result<&mut Table, Error> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| no_such_table(stmt, name))
    }

    fn table(&self, stmt: &Statement, name: &str) -> Result<&Table, Error> {
        self.tables.get(name).ok_or_else(|| no_such_table(stmt, name))
    }

    fn insert(
        &mut self,
        id: u64,
        stmt: &Statement,
        table_name: &str,
        columns: &[String],
        values: &[Value],
        returning: bool,
    ) -> Result<RowSet, Error> {
        let table = self.table_mut(stmt, table_name)?;
        let mut row = vec![Value::Null; table.columns.len()];
        for (column, value) in columns.iter().zip(values) {
            let idx = table
                .index_of(column)
                .ok_or_else(|| no_such_column(stmt, table_name, column))?;
            row[idx] = value.clone();
        }

        let key = match row[0].as_i64() {
            Some(explicit) => {
                if table.rows.contains_key(&explicit) {
                    return Err(Error::query(
                        QueryErrorKind::Constraint,
                        Some(stmt.to_string()),
                        format!(
                            "UNIQUE constraint failed: {}.{}",
                            table_name, table.key_column
                        ),
                    ));
                }
                table.next_id = table.next_id.max(explicit + 1);
                explicit
            }
            None => {
                let assigned = table.next_id;
                table.next_id += 1;
                assigned
            }
        };
        row[0] = Value::BigInt(key);
        table.rows.insert(key, row);
        self.record_undo(
            id,
            Undo::Insert {
                table: table_name.to_string(),
                key,
            },
        );

        let mut result = RowSet::affected(1);
        if returning {
            result.generated_key = Some(Value::BigInt(key));
        }
        Ok(result)
    }

    fn update(
        &mut self,
        id: u64,
        stmt: &Statement,
        table_name: &str,
        key: &Value,
        columns: &[String],
        values: &[Value],
    ) -> Result<RowSet, Error> {
        let table = self.table_mut(stmt, table_name)?;
        let mut indices = Vec::with_capacity(columns.len());
        for column in columns {
            indices.push(
                table
                    .index_of(column)
                    .ok_or_else(|| no_such_column(stmt, table_name, column))?,
            );
        }
        let Some(key) = key.as_i64() else {
            return Ok(RowSet::affected(0));
        };
        let Some(row) = table.rows.get_mut(&key) else {
            return Ok(RowSet::affected(0));
        };
        let previous = row.clone();
        for (idx, value) in indices.into_iter().zip(values) {
            row[idx] = value.clone();
        }
        self.record_undo(
            id,
            Undo::Update {
                table: table_name.to_string(),
                key,
                previous,
            },
        );
        Ok(RowSet::affected(1))
    }

    fn select(
        &self,
        stmt: &Statement,
        table_name: &str,
        filter: &Filter,
        order_by: Option<&str>,
    ) -> Result<RowSet, Error> {
        let table = self.table(stmt, table_name)?;
        check_filter_column(stmt, table_name, filter, |c| table.index_of(c).is_some())?;
        let mut matched: Vec<&Vec<Value>> = table
            .rows
            .values()
            .filter(|row| filter.matches(|c| table.index_of(c).map(|i| &row[i])))
            .collect();
        if let Some(column) = order_by {
            let idx = table
                .index_of(column)
                .ok_or_else(|| no_such_column(stmt, table_name, column))?;
            matched.sort_by(|a, b| compare(&a[idx], &b[idx]));
        }
        Ok(RowSet::from_rows(
            matched.into_iter().map(|r| table.row(r)).collect(),
        ))
    }

    fn select_joined(
        &self,
        stmt: &Statement,
        parent_name: &str,
        parent_key: &str,
        child_name: &str,
        foreign_key: &str,
        filter: &Filter,
    ) -> Result<RowSet, Error> {
        let parent = self.table(stmt, parent_name)?;
        let child = self.table(stmt, child_name)?;
        let pk_idx = parent
            .index_of(parent_key)
            .ok_or_else(|| no_such_column(stmt, parent_name, parent_key))?;
        let fk_idx = child
            .index_of(foreign_key)
            .ok_or_else(|| no_such_column(stmt, child_name, foreign_key))?;

        let qualify = |table: &str, columns: &[String]| {
            columns
                .iter()
                .map(|c| format!("{}.{}", table, c))
                .collect::<Vec<_>>()
        };
        let mut names = qualify(parent_name, &parent.columns);
        names.extend(qualify(child_name, &child.columns));

        let parent_lookup = |row: &Vec<Value>, qualified: &str| -> Option<usize> {
            let bare = qualified
                .strip_prefix(parent_name)
                .and_then(|rest| rest.strip_prefix('.'))?;
            let idx = parent.index_of(bare)?;
            (idx < row.len()).then_some(idx)
        };
        check_filter_column(stmt, parent_name, filter, |c| {
            c.strip_prefix(parent_name)
                .and_then(|rest| rest.strip_prefix('.'))
                .is_some_and(|bare| parent.index_of(bare).is_some())
        })?;

        let mut rows = Vec::new();
        for parent_row in parent.rows.values() {
            if !filter.matches(|c| parent_lookup(parent_row, c).map(|i| &parent_row[i])) {
                continue;
            }
            let mut any = false;
            for child_row in child.rows.values() {
                if child_row[fk_idx].sql_eq(&parent_row[pk_idx]) {
                    any = true;
                    let mut values = parent_row.clone();
                    values.extend(child_row.iter().cloned());
                    rows.push(Row::new(names.clone(), values));
                }
            }
            if !any {
                let mut values = parent_row.clone();
                values.extend(std::iter::repeat_n(Value::Null, child.columns.len()));
                rows.push(Row::new(names.clone(), values));
            }
        }
        Ok(RowSet::from_rows(rows))
    }
}

fn raw(id: u64, sql: &str, options: &ExecOptions) -> Result<RowSet, Error> {
    let normalized = sql.trim().trim_end_matches(';').to_ascii_lowercase();
    let row = match normalized.as_str() {
        "select connection_id()" => Row::new(
            vec!["connection_id".to_string()],
            vec![Value::from_u64_clamped(id)],
        ),
        "select 1" => Row::new(vec!["1".to_string()], vec![Value::BigInt(1)]),
        "show statement_timeout" => {
            let rendered = options
                .timeout
                .map_or_else(|| "0".to_string(), |t| format!("{}ms", t.as_millis()));
            Row::new(
                vec!["statement_timeout".to_string()],
                vec![Value::Text(rendered)],
            )
        }
        _ => {
            return Err(Error::query(
                QueryErrorKind::Unsupported,
                Some(sql.to_string()),
                "statement not supported by the memory driver",
            ));
        }
    };
    Ok(RowSet::from_rows(vec![row]))
}

fn check_filter_column(
    stmt: &Statement,
    table: &str,
    filter: &Filter,
    known: impl Fn(&str) -> bool,
) -> Result<(), Error> {
    match filter {
        Filter::All => Ok(()),
        Filter::Eq(column, _) | Filter::In(column, _) => {
            if known(column) {
                Ok(())
            } else {
                Err(no_such_column(stmt, table, column))
            }
        }
    }
}

fn compare(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        _ => {
            if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
                return x.cmp(&y);
            }
            if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
                return x.partial_cmp(&y).unwrap_or(Ordering::Equal);
            }
            match (a.as_str(), b.as_str()) {
                (Some(x), Some(y)) => x.cmp(y),
                _ => Ordering::Equal,
            }
        }
    }
}

fn no_such_table(stmt: &Statement, table: &str) -> Error {
    Error::query(
        QueryErrorKind::NotFound,
        Some(stmt.to_string()),
        format!("no such table: {}", table),
    )
}

fn no_such_column(stmt: &Statement, table: &str, column: &str) -> Error {
    Error::query(
        QueryErrorKind::NotFound,
        Some(stmt.to_string()),
        format!("no such column: {}.{}", table, column),
    )
}

/// A connection handle. Dropping it closes the connection and rolls back any
/// open transaction.
#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryConnection {
    /// Backend identifier, the analogue of a server-side process id.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.undo_all(self.id);
        state.connections.remove(&self.id);
        tracing::trace!(connection = self.id, "memory connection closed");
    }
}

/// Shared in-memory database.
///
/// Clones share the same tables, counters, and fault switches.
#[derive(Debug, Clone, Default)]
pub struct MemoryDriver {
    state: Arc<Mutex<MemoryState>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create (or replace) a table. The key column is an auto-increment integer.
    pub fn create_table(&self, name: &str, key_column: &str, columns: &[&str]) {
        let mut all = vec![key_column.to_string()];
        all.extend(columns.iter().map(|c| (*c).to_string()));
        self.lock().tables.insert(
            name.to_string(),
            Table {
                key_column: key_column.to_string(),
                columns: all,
                rows: BTreeMap::new(),
                next_id: 1,
            },
        );
    }

    /// Insert a row outside any connection, returning its key. Not logged.
    pub fn seed(&self, table: &str, values: &[(&str, Value)]) -> Result<i64, Error> {
        let columns: Vec<String> = values.iter().map(|(c, _)| (*c).to_string()).collect();
        let values: Vec<Value> = values.iter().map(|(_, v)| v.clone()).collect();
        let stmt = Statement::insert(table, columns.clone(), values.clone(), None);
        let result = self.lock().insert(0, &stmt, table, &columns, &values, true)?;
        Ok(result
            .generated_key
            .as_ref()
            .and_then(Value::as_i64)
            .unwrap_or_default())
    }

    /// Current contents of a table in key order.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        let state = self.lock();
        state
            .tables
            .get(table)
            .map(|t| t.rows.values().map(|r| t.row(r)).collect())
            .unwrap_or_default()
    }

    /// Every statement executed so far, oldest first.
    pub fn statement_log(&self) -> Vec<LoggedStatement> {
        self.lock().log.clone()
    }

    pub fn statement_count(&self) -> usize {
        self.lock().log.len()
    }

    /// Statements executed since the log had `mark` entries.
    pub fn statements_since(&self, mark: usize) -> Vec<Statement> {
        self.lock()
            .log
            .iter()
            .skip(mark)
            .map(|l| l.statement.clone())
            .collect()
    }

    pub fn clear_log(&self) {
        self.lock().log.clear();
    }

    /// Total connections ever opened.
    pub fn connections_opened(&self) -> u64 {
        self.lock().connections_opened
    }

    /// Connections currently open.
    pub fn open_connections(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn commits(&self) -> u64 {
        self.lock().commits
    }

    pub fn rollbacks(&self) -> u64 {
        self.lock().rollbacks
    }

    pub fn pings(&self) -> u64 {
        self.lock().pings
    }

    /// Whether connection `id` has an open transaction.
    pub fn in_transaction(&self, id: u64) -> bool {
        self.lock()
            .connections
            .get(&id)
            .is_some_and(|c| c.in_transaction)
    }

    /// Make the next `count` connects fail.
    pub fn fail_next_connect(&self, count: usize) {
        self.lock().fail_connects = count;
    }

    /// Make the next executed statement fail with `message`.
    pub fn fail_next_statement(&self, message: impl Into<String>) {
        self.lock().fail_statement = Some(message.into());
    }

    /// Make the next `count` rollbacks fail.
    pub fn fail_next_rollback(&self, count: usize) {
        self.lock().fail_rollbacks = count;
    }

    /// Sever a connection: every later operation on it fails and pings report dead.
    pub fn kill(&self, id: u64) {
        let mut state = self.lock();
        state.undo_all(id);
        state.killed.insert(id);
    }

    /// Sever every currently open connection.
    pub fn kill_all(&self) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.undo_all(id);
            state.killed.insert(id);
        }
    }

    fn connect_sync(&self) -> Result<MemoryConnection, Error> {
        let mut state = self.lock();
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(Error::connect("memory driver refused the connection"));
        }
        let id = self.next_id.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        state.connections.insert(id, ConnState::default());
        state.connections_opened += 1;
        tracing::trace!(connection = id, "memory connection opened");
        Ok(MemoryConnection {
            id,
            state: Arc::clone(&self.state),
        })
    }

    fn begin_sync(&self, id: u64) -> Result<(), Error> {
        let mut state = self.lock();
        state.check_alive(id)?;
        let conn = state
            .connections
            .get_mut(&id)
            .ok_or_else(|| Error::disconnected("connection closed"))?;
        if conn.in_transaction {
            return Err(Error::query(
                QueryErrorKind::Database,
                Some("BEGIN".to_string()),
                "cannot start a transaction within a transaction",
            ));
        }
        conn.in_transaction = true;
        Ok(())
    }

    fn commit_sync(&self, id: u64) -> Result<(), Error> {
        let mut state = self.lock();
        state.check_alive(id)?;
        if let Some(conn) = state.connections.get_mut(&id) {
            conn.in_transaction = false;
            conn.undo.clear();
        }
        state.commits += 1;
        Ok(())
    }

    fn rollback_sync(&self, id: u64) -> Result<(), Error> {
        let mut state = self.lock();
        state.check_alive(id)?;
        if state.fail_rollbacks > 0 {
            state.fail_rollbacks -= 1;
            return Err(Error::disconnected("connection lost during rollback"));
        }
        state.undo_all(id);
        state.rollbacks += 1;
        Ok(())
    }

    fn ping_sync(&self, id: u64) -> bool {
        let mut state = self.lock();
        state.pings += 1;
        state.check_alive(id).is_ok()
    }
}

impl Driver for MemoryDriver {
    type Conn = MemoryConnection;

    fn connect(&self, _cx: &Cx) -> impl Future<Output = Outcome<MemoryConnection, Error>> + Send {
        let result = self.connect_sync();
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn execute(
        &self,
        _cx: &Cx,
        conn: &mut MemoryConnection,
        statement: &Statement,
        options: &ExecOptions,
    ) -> impl Future<Output = Outcome<RowSet, Error>> + Send {
        let result = self.lock().execute(conn.id, statement, options);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn begin(
        &self,
        _cx: &Cx,
        conn: &mut MemoryConnection,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.begin_sync(conn.id);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn commit(
        &self,
        _cx: &Cx,
        conn: &mut MemoryConnection,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.commit_sync(conn.id);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn rollback(
        &self,
        _cx: &Cx,
        conn: &mut MemoryConnection,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.rollback_sync(conn.id);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn ping(&self, _cx: &Cx, conn: &mut MemoryConnection) -> impl Future<Output = bool> + Send {
        let alive = self.ping_sync(conn.id);
        async move { alive }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;

    fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => panic!("unexpected error: {e}"),
            Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
            Outcome::Panicked(p) => panic!("panicked: {p:?}"),
        }
    }

    fn users_and_posts() -> MemoryDriver {
        let driver = MemoryDriver::new();
        driver.create_table("users", "id", &["name"]);
        driver.create_table("posts", "id", &["user_id", "title"]);
        driver
    }

    #[test]
    fn insert_assigns_keys_and_select_filters() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let driver = users_and_posts();

        rt.block_on(async {
            let mut conn = unwrap_outcome(driver.connect(&cx).await);
            let opts = ExecOptions::default();
            for name in ["ann", "bob"] {
                let stmt = Statement::insert(
                    "users",
                    vec!["name".into()],
                    vec![Value::from(name)],
                    Some("id".into()),
                );
                let result = unwrap_outcome(driver.execute(&cx, &mut conn, &stmt, &opts).await);
                assert!(result.generated_key.is_some());
            }

            let stmt = Statement::select("users", Filter::eq("name", "bob"));
            let result = unwrap_outcome(driver.execute(&cx, &mut conn, &stmt, &opts).await);
            assert_eq!(result.len(), 1);
            assert_eq!(result.rows[0].get_named::<i64>("id").unwrap(), 2);
        });
        assert_eq!(driver.statement_count(), 3);
    }

    #[test]
    fn rollback_reverts_writes() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let driver = users_and_posts();
        let kept = driver.seed("users", &[("name", Value::from("ann"))]).unwrap();

        rt.block_on(async {
            let mut conn = unwrap_outcome(driver.connect(&cx).await);
            let opts = ExecOptions::default();
            unwrap_outcome(driver.begin(&cx, &mut conn).await);
            let insert = Statement::insert(
                "users",
                vec!["name".into()],
                vec![Value::from("bob")],
                None,
            );
            unwrap_outcome(driver.execute(&cx, &mut conn, &insert, &opts).await);
            let update = Statement::Update {
                table: "users".into(),
                key_column: "id".into(),
                key: Value::BigInt(kept),
                columns: vec!["name".into()],
                values: vec![Value::from("renamed")],
            };
            unwrap_outcome(driver.execute(&cx, &mut conn, &update, &opts).await);
            assert_eq!(driver.rows("users").len(), 2);

            unwrap_outcome(driver.rollback(&cx, &mut conn).await);
        });

        let rows = driver.rows("users");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_named::<String>("name").unwrap(), "ann");
        assert_eq!(driver.rollbacks(), 1);
    }

    #[test]
    fn joined_select_emits_one_row_per_child() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let driver = users_and_posts();
        let ann = driver.seed("users", &[("name", Value::from("ann"))]).unwrap();
        driver.seed("users", &[("name", Value::from("bob"))]).unwrap();
        for title in ["a", "b"] {
            driver
                .seed(
                    "posts",
                    &[("user_id", Value::BigInt(ann)), ("title", Value::from(title))],
                )
                .unwrap();
        }

        rt.block_on(async {
            let mut conn = unwrap_outcome(driver.connect(&cx).await);
            let stmt = Statement::SelectJoined {
                parent: "users".into(),
                parent_key: "id".into(),
                child: "posts".into(),
                foreign_key: "user_id".into(),
                filter: Filter::All,
            };
            let result = unwrap_outcome(
                driver
                    .execute(&cx, &mut conn, &stmt, &ExecOptions::default())
                    .await,
            );
            assert_eq!(result.len(), 3);
            assert_eq!(result.rows[0].get_named::<String>("posts.title").unwrap(), "a");
            assert_eq!(result.rows[1].get_named::<String>("posts.title").unwrap(), "b");
            assert!(result.rows[2].get_by_name("posts.id").unwrap().is_null());
            assert_eq!(result.rows[2].get_named::<String>("users.name").unwrap(), "bob");
        });
    }

    #[test]
    fn killed_connections_fail_and_ping_dead() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let driver = users_and_posts();

        rt.block_on(async {
            let mut conn = unwrap_outcome(driver.connect(&cx).await);
            assert!(driver.ping(&cx, &mut conn).await);
            driver.kill(conn.id());
            assert!(!driver.ping(&cx, &mut conn).await);
            let stmt = Statement::raw("SELECT 1", vec![]);
            match driver
                .execute(&cx, &mut conn, &stmt, &ExecOptions::default())
                .await
            {
                Outcome::Err(e) => assert!(e.is_connection_error()),
                other => panic!("expected connection error, got {other:?}"),
            }
        });
    }

    #[test]
    fn raw_probes_report_connection_and_timeout() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let driver = MemoryDriver::new();

        rt.block_on(async {
            let mut first = unwrap_outcome(driver.connect(&cx).await);
            let mut second = unwrap_outcome(driver.connect(&cx).await);
            let probe = Statement::raw("SELECT connection_id()", vec![]);
            let opts = ExecOptions::default();
            let a = unwrap_outcome(driver.execute(&cx, &mut first, &probe, &opts).await);
            let b = unwrap_outcome(driver.execute(&cx, &mut second, &probe, &opts).await);
            assert_ne!(a.rows[0], b.rows[0]);

            let show = Statement::raw("SHOW statement_timeout", vec![]);
            let opts = ExecOptions::with_timeout(std::time::Duration::from_millis(1500));
            let result = unwrap_outcome(driver.execute(&cx, &mut first, &show, &opts).await);
            assert_eq!(
                result.rows[0].get_named::<String>("statement_timeout").unwrap(),
                "1500ms"
            );
            assert_eq!(driver.open_connections(), 2);
        });
        assert_eq!(driver.open_connections(), 0);
        assert_eq!(driver.connections_opened(), 2);
    }

    #[test]
    fn injected_faults_fire_once() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let driver = MemoryDriver::new();
        driver.fail_next_connect(1);

        rt.block_on(async {
            assert!(matches!(driver.connect(&cx).await, Outcome::Err(_)));
            let mut conn = unwrap_outcome(driver.connect(&cx).await);
            driver.fail_next_statement("boom");
            let stmt = Statement::raw("SELECT 1", vec![]);
            let opts = ExecOptions::default();
            assert!(matches!(
                driver.execute(&cx, &mut conn, &stmt, &opts).await,
                Outcome::Err(_)
            ));
            unwrap_outcome(driver.execute(&cx, &mut conn, &stmt, &opts).await);
        });
    }
}
