//! Dialect-free statement model handed to drivers.
//!
//! The session layer never produces SQL text. It builds [`Statement`] values
//! and drivers translate them into whatever their backend speaks. The
//! `Display` impl renders a SQL-like form used only for logging and error
//! messages.

use crate::row::Row;
use crate::value::Value;
use std::fmt;
use std::time::Duration;

/// Row filter applied by `Select` and `SelectJoined`.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Filter {
    /// Every row
    #[default]
    All,
    /// `column = value`
    Eq(String, Value),
    /// `column IN (values...)`
    In(String, Vec<Value>),
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(column.into(), value.into())
    }

    pub fn in_list(column: impl Into<String>, values: Vec<Value>) -> Self {
        Filter::In(column.into(), values)
    }

    /// Check a row-like lookup against this filter.
    pub fn matches<'a>(&self, lookup: impl Fn(&str) -> Option<&'a Value>) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq(column, value) => lookup(column).is_some_and(|v| v.sql_eq(value)),
            Filter::In(column, values) => {
                lookup(column).is_some_and(|v| values.iter().any(|candidate| v.sql_eq(candidate)))
            }
        }
    }
}

/// A single statement to execute on a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// Insert one row; `returning` names the generated key column.
    Insert {
        table: String,
        columns: Vec<String>,
        values: Vec<Value>,
        returning: Option<String>,
    },
    /// Update columns of the row identified by `key_column = key`.
    Update {
        table: String,
        key_column: String,
        key: Value,
        columns: Vec<String>,
        values: Vec<Value>,
    },
    /// Select whole rows from one table.
    Select {
        table: String,
        filter: Filter,
        order_by: Option<String>,
    },
    /// Parent LEFT OUTER JOIN child, one row per child (or one row with NULL
    /// child columns for a childless parent). Columns are qualified as
    /// `table.column`; `filter` refers to qualified parent columns.
    SelectJoined {
        parent: String,
        parent_key: String,
        child: String,
        foreign_key: String,
        filter: Filter,
    },
    /// Driver-specific text with positional parameters.
    Raw { sql: String, params: Vec<Value> },
}

impl Statement {
    pub fn insert(
        table: impl Into<String>,
        columns: Vec<String>,
        values: Vec<Value>,
        returning: Option<String>,
    ) -> Self {
        Statement::Insert {
            table: table.into(),
            columns,
            values,
            returning,
        }
    }

    pub fn select(table: impl Into<String>, filter: Filter) -> Self {
        Statement::Select {
            table: table.into(),
            filter,
            order_by: None,
        }
    }

    pub fn raw(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Statement::Raw {
            sql: sql.into(),
            params,
        }
    }

    /// Set the ordering column of a `Select`; no effect on other statements.
    pub fn ordered_by(mut self, column: impl Into<String>) -> Self {
        if let Statement::Select { order_by, .. } = &mut self {
            *order_by = Some(column.into());
        }
        self
    }

    /// Does this statement modify data?
    pub fn is_write(&self) -> bool {
        match self {
            Statement::Insert { .. } | Statement::Update { .. } => true,
            Statement::Select { .. } | Statement::SelectJoined { .. } => false,
            Statement::Raw { sql, .. } => {
                let head = sql.trim_start().to_ascii_uppercase();
                !(head.starts_with("SELECT") || head.starts_with("SHOW"))
            }
        }
    }

    /// Primary table the statement touches.
    pub fn table(&self) -> Option<&str> {
        match self {
            Statement::Insert { table, .. }
            | Statement::Update { table, .. }
            | Statement::Select { table, .. } => Some(table),
            Statement::SelectJoined { parent, .. } => Some(parent),
            Statement::Raw { .. } => None,
        }
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, items: impl Iterator<Item = String>) -> fmt::Result {
    let joined: Vec<String> = items.collect();
    write!(f, "{}", joined.join(", "))
}

fn write_filter(f: &mut fmt::Formatter<'_>, filter: &Filter) -> fmt::Result {
    match filter {
        Filter::All => Ok(()),
        Filter::Eq(column, value) => write!(f, " WHERE {} = {}", column, value),
        Filter::In(column, values) => {
            write!(f, " WHERE {} IN (", column)?;
            write_list(f, values.iter().map(ToString::to_string))?;
            write!(f, ")")
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::Insert {
                table,
                columns,
                values,
                returning,
            } => {
                write!(f, "INSERT INTO {} (", table)?;
                write_list(f, columns.iter().cloned())?;
                write!(f, ") VALUES (")?;
                write_list(f, values.iter().map(ToString::to_string))?;
                write!(f, ")")?;
                if let Some(col) = returning {
                    write!(f, " RETURNING {}", col)?;
                }
                Ok(())
            }
            Statement::Update {
                table,
                key_column,
                key,
                columns,
                values,
            } => {
                write!(f, "UPDATE {} SET ", table)?;
                write_list(
                    f,
                    columns
                        .iter()
                        .zip(values)
                        .map(|(c, v)| format!("{} = {}", c, v)),
                )?;
                write!(f, " WHERE {} = {}", key_column, key)
            }
            Statement::Select {
                table,
                filter,
                order_by,
            } => {
                write!(f, "SELECT * FROM {}", table)?;
                write_filter(f, filter)?;
                if let Some(col) = order_by {
                    write!(f, " ORDER BY {}", col)?;
                }
                Ok(())
            }
            Statement::SelectJoined {
                parent,
                parent_key,
                child,
                foreign_key,
                filter,
            } => {
                write!(
                    f,
                    "SELECT * FROM {parent} LEFT OUTER JOIN {child} ON {child}.{foreign_key} = {parent}.{parent_key}"
                )?;
                write_filter(f, filter)
            }
            Statement::Raw { sql, .. } => write!(f, "{}", sql),
        }
    }
}

/// Per-statement execution options requested from the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecOptions {
    /// Statement timeout enforced by the driver, if any.
    pub timeout: Option<Duration>,
}

impl ExecOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

/// Result of executing one statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub rows: Vec<Row>,
    pub rows_affected: u64,
    /// Key generated by an `Insert` with `returning` set.
    pub generated_key: Option<Value>,
}

impl RowSet {
    pub fn from_rows(rows: Vec<Row>) -> Self {
        Self {
            rows,
            rows_affected: 0,
            generated_key: None,
        }
    }

    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows: Vec::new(),
            rows_affected,
            generated_key: None,
        }
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
