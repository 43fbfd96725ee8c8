//! The driver capability consumed by the pool and session layers.
//!
//! A [`Driver`] owns nothing but the knowledge of how to talk to a backend.
//! Physical connections are plain values of [`Driver::Conn`]; the pool owns
//! them and lends them out. All suspending operations take a `Cx` so drivers
//! can observe cancellation.

use crate::error::Error;
use crate::statement::{ExecOptions, RowSet, Statement};
use asupersync::{Cx, Outcome};

/// A database backend.
///
/// Implementations must be cheap to share: the pool keeps one instance and
/// calls it from many tasks concurrently.
pub trait Driver: Send + Sync + 'static {
    /// A physical connection.
    type Conn: Send + 'static;

    /// Open a new physical connection.
    fn connect(&self, cx: &Cx) -> impl Future<Output = Outcome<Self::Conn, Error>> + Send;

    /// Execute one statement on `conn`.
    fn execute(
        &self,
        cx: &Cx,
        conn: &mut Self::Conn,
        statement: &Statement,
        options: &ExecOptions,
    ) -> impl Future<Output = Outcome<RowSet, Error>> + Send;

    /// Begin a transaction on `conn`.
    fn begin(&self, cx: &Cx, conn: &mut Self::Conn)
    -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Commit the transaction open on `conn`.
    fn commit(
        &self,
        cx: &Cx,
        conn: &mut Self::Conn,
    ) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Roll back the transaction open on `conn`.
    fn rollback(
        &self,
        cx: &Cx,
        conn: &mut Self::Conn,
    ) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Liveness probe. Returns `false` for a connection that must be discarded.
    fn ping(&self, cx: &Cx, conn: &mut Self::Conn) -> impl Future<Output = bool> + Send;

    /// Close a connection the pool is discarding. Best-effort and non-blocking.
    fn close(&self, conn: Self::Conn) {
        drop(conn);
    }
}
