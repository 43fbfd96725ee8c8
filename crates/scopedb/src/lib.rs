//! ScopeDB - pooled connections and scoped sessions for Rust.
//!
//! ScopeDB provides the session layer of an ORM, independent of any SQL
//! dialect:
//!
//! - A bounded connection pool with overflow, checkout timeouts, pre-ping
//!   and idle recycling
//! - Transactions that always hand their connection back to the pool
//! - Sessions that track entity lifecycle (transient, pending, persistent,
//!   expired, detached) with an identity map
//! - A scope registry giving each thread or task its own session
//! - Lazy, select-in and joined relationship loading
//!
//! # Quick Start
//!
//! ```ignore
//! use scopedb::prelude::*;
//!
//! static USER: EntityType = EntityType::new("users", "id");
//!
//! async fn example(cx: &Cx, driver: impl Driver) -> Outcome<(), Error> {
//!     let pool = match ConnectionPool::new(driver, PoolConfig::new(5)) {
//!         Ok(pool) => pool,
//!         Err(e) => return Outcome::Err(e),
//!     };
//!     let registry = ScopeRegistry::new(pool, SessionConfig::default());
//!
//!     let user = Entity::new(&USER).with("name", "ann");
//!     registry
//!         .with_session(cx, ScopeKey::current_thread(), |session| async move {
//!             match session.add(cx, &user).await {
//!                 Outcome::Ok(()) => session.commit(cx).await,
//!                 other => other,
//!             }
//!         })
//!         .await
//! }
//! ```
//!
//! # Drivers
//!
//! The pool talks to the database through the [`Driver`] trait. The
//! `scopedb-memory` crate ships an in-process driver used by the test
//! suites.

pub use scopedb_core::{
    // asupersync re-exports
    Budget,
    Cx,
    // Core types
    ColumnInfo,
    Driver,
    Error,
    ExecOptions,
    Filter,
    FromValue,
    Outcome,
    RegionId,
    Result,
    Row,
    RowSet,
    Statement,
    TaskId,
    Value,
};

pub use scopedb_core::error::{
    ConnectionError, ConnectionErrorKind, DetachedError, PoolError, PoolErrorKind, QueryError,
    QueryErrorKind, ScopeViolationError, StateError, StateErrorKind, TransactionError,
    TransactionErrorKind, TypeError,
};

pub use scopedb_pool::{ConnectionId, ConnectionPool, PoolConfig, PoolStats, PooledConnection};

pub use scopedb_session::{
    Entity, EntityState, EntityStateTracker, EntityType, FlushResult, Load, LoadSample,
    LoadStrategy, N1QueryTracker, N1Stats, QueryResult, Relation, RelationshipInfo,
    RelationshipLoader, ScopeKey, ScopeRegistry, Select, Session, SessionConfig, SessionHandle,
    SessionId, StateEvent, Transaction, TransactionState, next_state,
};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use scopedb::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        // asupersync
        Cx,
        Outcome,
        // Core
        Driver,
        Error,
        Filter,
        Result,
        Row,
        Statement,
        Value,
        // Pool
        ConnectionPool,
        PoolConfig,
        // Session
        Entity,
        EntityState,
        EntityType,
        Load,
        RelationshipInfo,
        ScopeKey,
        ScopeRegistry,
        Select,
        Session,
        SessionConfig,
        SessionHandle,
    };
}
