//! Core types and traits for ScopeDB.
//!
//! This crate provides the foundations shared by the pool and session layers:
//!
//! - `Value` and `Row` for dynamically-typed data
//! - `Statement`, `Filter`, and `RowSet`, the dialect-free statement model
//! - `Driver`, the backend capability the pool connects through
//! - `Error`, the single error taxonomy
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Budget, Cx, Outcome, RegionId, TaskId};

pub mod driver;
pub mod error;
pub mod row;
pub mod statement;
pub mod value;

pub use driver::Driver;
pub use error::{
    ConnectionError, ConnectionErrorKind, DetachedError, Error, PoolError, PoolErrorKind,
    QueryError, QueryErrorKind, Result, ScopeViolationError, StateError, StateErrorKind,
    TransactionError, TransactionErrorKind, TypeError,
};
pub use row::{ColumnInfo, FromValue, Row};
pub use statement::{ExecOptions, Filter, RowSet, Statement};
pub use value::Value;
