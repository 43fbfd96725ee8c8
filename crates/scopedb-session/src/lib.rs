//! Sessions and unit of work for ScopeDB.
//!
//! `scopedb-session` is the **unit-of-work layer**. It sits on top of
//! `scopedb-pool` and ties entity lifecycle tracking to pooled transactions.
//!
//! # Role In The Architecture
//!
//! - **Transaction**: one pooled connection with a queue of pending writes,
//!   released back to the pool on every exit path.
//! - **Session**: entities are added, flushed, committed, refreshed and
//!   expired through it; it owns the identity map.
//! - **Scope registry**: at most one live session per scope key.
//! - **Relationship loading**: lazy, select-in and joined strategies for
//!   one-to-many relationships, with N+1 detection for the lazy path.
//!
//! # Entity lifecycle
//!
//! ```text
//! transient --add--> pending --flush--> persistent --commit--> expired
//!                                           ^                     |
//!                                           +-------access--------+
//! persistent/expired --close--> detached
//! ```
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(pool, SessionConfig::default());
//! session.add(&user)?;
//! session.commit(&cx).await;            // user is now expired
//! session.get(&cx, &user, "name").await; // reloads, user is persistent
//! session.close(&cx).await;             // user is detached
//! ```

pub mod entity;
pub mod loader;
pub mod n1_detection;
pub mod registry;
pub mod session;
pub mod tracker;
pub mod transaction;

pub use entity::{Entity, EntityType, Relation, RelationshipInfo};
pub use loader::{Load, LoadStrategy, QueryResult, RelationshipLoader, Select};
pub use n1_detection::{LoadSample, N1QueryTracker, N1Stats};
pub use registry::{ScopeKey, ScopeRegistry, SessionHandle};
pub use session::{FlushResult, Session, SessionConfig};
pub use tracker::{EntityState, EntityStateTracker, SessionId, StateEvent, next_state};
pub use transaction::{Transaction, TransactionState};
