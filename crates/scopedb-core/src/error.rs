//! Error types for ScopeDB operations.

use crate::value::Value;
use std::fmt;

/// The primary error type for all ScopeDB operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (connect, disconnect)
    Connection(ConnectionError),
    /// Statement execution errors
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Transaction misuse
    Transaction(TransactionError),
    /// Pool errors (checkout timeout, closed pool, bad config)
    Pool(PoolError),
    /// Illegal entity or session state transition
    InvalidState(StateError),
    /// Attribute access on an entity no longer attached to a session
    Detached(DetachedError),
    /// A session was observed being used by two scopes at once
    ScopeViolation(ScopeViolationError),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection lost during operation
    Disconnected,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    /// Rendered statement that failed, when known
    pub statement: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Deadlock detected
    Deadlock,
    /// Statement timeout
    Timeout,
    /// Statement not understood by the driver
    Unsupported,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// Operation requires an open transaction
    NotActive,
    /// Already committed
    AlreadyCommitted,
    /// Already rolled back
    AlreadyRolledBack,
}

#[derive(Debug)]
pub struct PoolError {
    pub kind: PoolErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolErrorKind {
    /// Connection checkout timeout
    Timeout,
    /// Pool is closed
    Closed,
    /// Configuration error
    Config,
}

#[derive(Debug)]
pub struct StateError {
    pub kind: StateErrorKind,
    /// Name of the state the entity was in, when the error concerns an entity
    pub state: Option<&'static str>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateErrorKind {
    /// The requested event is not legal from the current state
    InvalidTransition,
    /// Expired attributes must be reloaded through the owning session
    Expired,
    /// The entity is not managed by this session
    NotManaged,
    /// The entity is managed by a different session
    ForeignSession,
    /// The session has already been closed
    SessionClosed,
    /// Another managed entity already owns this identity
    DuplicateIdentity,
    /// The row backing a persistent entity no longer exists
    MissingIdentity,
}

#[derive(Debug)]
pub struct DetachedError {
    pub table: &'static str,
    pub key: Option<Value>,
}

#[derive(Debug)]
pub struct ScopeViolationError {
    /// Debug rendering of the scope key involved
    pub scope: String,
    pub message: String,
}

impl Error {
    /// Build a pool checkout timeout error.
    pub fn pool_timeout(message: impl Into<String>) -> Self {
        Error::Pool(PoolError {
            kind: PoolErrorKind::Timeout,
            message: message.into(),
            source: None,
        })
    }

    /// Build an error for an operation attempted on a closed pool.
    pub fn pool_closed() -> Self {
        Error::Pool(PoolError {
            kind: PoolErrorKind::Closed,
            message: "connection pool is closed".to_string(),
            source: None,
        })
    }

    /// Build an invalid-state error.
    pub fn invalid_state(
        kind: StateErrorKind,
        state: Option<&'static str>,
        message: impl Into<String>,
    ) -> Self {
        Error::InvalidState(StateError {
            kind,
            state,
            message: message.into(),
        })
    }

    /// Build a statement failure.
    pub fn query(
        kind: QueryErrorKind,
        statement: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Query(QueryError {
            kind,
            statement,
            message: message.into(),
            source: None,
        })
    }

    /// Build a connect failure.
    pub fn connect(message: impl Into<String>) -> Self {
        Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Connect,
            message: message.into(),
            source: None,
        })
    }

    /// Build a lost-connection failure.
    pub fn disconnected(message: impl Into<String>) -> Self {
        Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Disconnected,
            message: message.into(),
            source: None,
        })
    }

    /// Is this a pool checkout timeout?
    pub fn is_pool_timeout(&self) -> bool {
        matches!(self, Error::Pool(p) if p.kind == PoolErrorKind::Timeout)
    }

    /// Is this a retryable error (deadlock, statement timeout, pool timeout)?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(q.kind, QueryErrorKind::Deadlock | QueryErrorKind::Timeout),
            Error::Pool(p) => p.kind == PoolErrorKind::Timeout,
            _ => false,
        }
    }

    /// Is this a connection error that likely requires reconnection?
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    pub fn is_detached(&self) -> bool {
        matches!(self, Error::Detached(_))
    }

    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Error::InvalidState(_))
    }

    pub fn is_scope_violation(&self) -> bool {
        matches!(self, Error::ScopeViolation(_))
    }

    /// Kind of the invalid-state error, if this is one.
    pub fn state_kind(&self) -> Option<StateErrorKind> {
        match self {
            Error::InvalidState(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Get the statement that caused this error, if available
    pub fn statement(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.statement.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => write!(f, "Query error: {}", e.message),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Pool(e) => write!(f, "Pool error: {}", e.message),
            Error::InvalidState(e) => write!(f, "Invalid state: {}", e),
            Error::Detached(e) => write!(f, "Detached entity: {}", e),
            Error::ScopeViolation(e) => write!(f, "Concurrent scope violation: {}", e),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Pool(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.statement {
            Some(stmt) => write!(f, "{} (statement: {})", self.message, stmt),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state {
            Some(state) => write!(f, "{} (state: {})", self.message, state),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for DetachedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            Some(key) => write!(
                f,
                "instance of '{}' with key {} is not bound to a session",
                self.table, key
            ),
            None => write!(f, "instance of '{}' is not bound to a session", self.table),
        }
    }
}

impl fmt::Display for ScopeViolationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (scope: {})", self.message, self.scope)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<PoolError> for Error {
    fn from(err: PoolError) -> Self {
        Error::Pool(err)
    }
}

impl From<StateError> for Error {
    fn from(err: StateError) -> Self {
        Error::InvalidState(err)
    }
}

impl From<DetachedError> for Error {
    fn from(err: DetachedError) -> Self {
        Error::Detached(err)
    }
}

impl From<ScopeViolationError> for Error {
    fn from(err: ScopeViolationError) -> Self {
        Error::ScopeViolation(err)
    }
}

/// Result type alias for ScopeDB operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_and_connection_flags() {
        let deadlock = Error::query(QueryErrorKind::Deadlock, None, "deadlock detected");
        let timeout = Error::pool_timeout("no connection within 1000ms");
        let closed = Error::pool_closed();
        let lost = Error::disconnected("lost connection");

        assert!(deadlock.is_retryable());
        assert!(timeout.is_retryable());
        assert!(timeout.is_pool_timeout());
        assert!(!closed.is_retryable());
        assert!(!closed.is_pool_timeout());
        assert!(lost.is_connection_error());
        assert!(!lost.is_retryable());
    }

    #[test]
    fn state_errors_expose_kind() {
        let err = Error::invalid_state(
            StateErrorKind::InvalidTransition,
            Some("transient"),
            "cannot refresh",
        );
        assert!(err.is_invalid_state());
        assert_eq!(err.state_kind(), Some(StateErrorKind::InvalidTransition));
        assert_eq!(err.to_string(), "Invalid state: cannot refresh (state: transient)");
    }

    #[test]
    fn detached_display_includes_key() {
        let err = Error::from(DetachedError {
            table: "users",
            key: Some(Value::BigInt(7)),
        });
        assert!(err.is_detached());
        assert_eq!(
            err.to_string(),
            "Detached entity: instance of 'users' with key 7 is not bound to a session"
        );
    }

    #[test]
    fn query_error_keeps_statement() {
        let err = Error::query(
            QueryErrorKind::NotFound,
            Some("SELECT * FROM nope".to_string()),
            "no such table: nope",
        );
        assert_eq!(err.statement(), Some("SELECT * FROM nope"));
        assert!(std::error::Error::source(&err).is_none());
    }
}
