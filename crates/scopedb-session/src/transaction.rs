//! A driver transaction on one pooled connection.
//!
//! The connection is owned by the [`Transaction`] and returned to its pool
//! when the transaction commits, rolls back, or is dropped. Dropping an open
//! transaction flags the connection so the pool rolls it back before the
//! next checkout; that covers cancellation and early returns alike.

use scopedb_core::{
    Cx, Driver, Error, ExecOptions, Outcome, RowSet, Statement, TransactionError,
    TransactionErrorKind,
};
use scopedb_pool::{ConnectionId, ConnectionPool, PooledConnection};
use std::collections::VecDeque;

/// Where a transaction is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Committed,
    RolledBack,
}

/// An open driver transaction with a queue of unflushed writes.
#[derive(Debug)]
pub struct Transaction<D: Driver> {
    conn: Option<PooledConnection<D>>,
    state: TransactionState,
    pending: VecDeque<Statement>,
    options: ExecOptions,
}

impl<D: Driver> Transaction<D> {
    /// Check out a connection and begin a transaction on it.
    ///
    /// A connection whose `BEGIN` fails is discarded rather than pooled.
    #[tracing::instrument(level = "debug", skip(cx, pool))]
    pub async fn begin(
        cx: &Cx,
        pool: &ConnectionPool<D>,
        options: ExecOptions,
    ) -> Outcome<Self, Error> {
        let mut conn = match pool.acquire(cx).await {
            Outcome::Ok(conn) => conn,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        let begun = {
            let (driver, raw) = conn.parts();
            driver.begin(cx, raw).await
        };
        match begun {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => {
                conn.mark_dead();
                return Outcome::Err(e);
            }
            Outcome::Cancelled(r) => {
                conn.mark_needs_reset();
                return Outcome::Cancelled(r);
            }
            Outcome::Panicked(p) => {
                conn.mark_dead();
                return Outcome::Panicked(p);
            }
        }

        tracing::debug!(connection = %conn.id(), "transaction begun");
        Outcome::Ok(Self {
            conn: Some(conn),
            state: TransactionState::Open,
            pending: VecDeque::new(),
            options,
        })
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == TransactionState::Open
    }

    /// Connection backing this transaction while it is open.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.conn.as_ref().map(PooledConnection::id)
    }

    pub fn options(&self) -> &ExecOptions {
        &self.options
    }

    /// Number of queued, unflushed statements.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn ensure_open(&self) -> Result<(), Error> {
        let kind = match self.state {
            TransactionState::Open => return Ok(()),
            TransactionState::Committed => TransactionErrorKind::AlreadyCommitted,
            TransactionState::RolledBack => TransactionErrorKind::AlreadyRolledBack,
        };
        Err(Error::Transaction(TransactionError {
            kind,
            message: "transaction is no longer active".to_string(),
        }))
    }

    /// Queue a write to be sent by the next flush.
    pub fn queue(&mut self, statement: Statement) -> Result<(), Error> {
        self.ensure_open()?;
        self.pending.push_back(statement);
        Ok(())
    }

    /// Execute a statement now, after sending anything still queued.
    ///
    /// A failed statement leaves the transaction open.
    pub async fn execute(&mut self, cx: &Cx, statement: &Statement) -> Outcome<RowSet, Error> {
        match self.flush(cx).await {
            Outcome::Ok(_) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        self.run(cx, statement).await
    }

    /// Send every queued statement in order without ending the transaction.
    ///
    /// On failure the failed statement and everything after it stay queued.
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<Vec<RowSet>, Error> {
        if let Err(e) = self.ensure_open() {
            return Outcome::Err(e);
        }
        let mut results = Vec::with_capacity(self.pending.len());
        while let Some(statement) = self.pending.front().cloned() {
            match self.run(cx, &statement).await {
                Outcome::Ok(rows) => {
                    self.pending.pop_front();
                    results.push(rows);
                }
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(results)
    }

    async fn run(&mut self, cx: &Cx, statement: &Statement) -> Outcome<RowSet, Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        if let Err(e) = self.ensure_open() {
            return Outcome::Err(e);
        }
        let options = self.options;
        let Some(conn) = self.conn.as_mut() else {
            return Outcome::Err(not_active());
        };
        tracing::debug!(connection = %conn.id(), %statement, "execute");
        let outcome = {
            let (driver, raw) = conn.parts();
            driver.execute(cx, raw, statement, &options).await
        };
        if let Outcome::Err(e) = &outcome {
            if e.is_connection_error() {
                conn.mark_dead();
            }
        }
        outcome
    }

    /// Flush, then commit. The connection goes back to the pool on success;
    /// on failure or cancellation the transaction stays open.
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<(), Error> {
        match self.flush(cx).await {
            Outcome::Ok(_) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        let Some(conn) = self.conn.as_mut() else {
            return Outcome::Err(not_active());
        };
        let committed = {
            let (driver, raw) = conn.parts();
            driver.commit(cx, raw).await
        };
        match committed {
            Outcome::Ok(()) => {
                tracing::debug!(connection = %conn.id(), "transaction committed");
                self.state = TransactionState::Committed;
                self.conn = None;
                Outcome::Ok(())
            }
            Outcome::Err(e) => {
                if e.is_connection_error() {
                    conn.mark_dead();
                }
                Outcome::Err(e)
            }
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Discard queued writes and roll back.
    ///
    /// Never fails because of the connection: a rollback the driver rejects
    /// is logged and the connection discarded. Rolling back a transaction
    /// that already ended is a no-op.
    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if !self.is_open() {
            return Outcome::Ok(());
        }
        self.pending.clear();
        self.state = TransactionState::RolledBack;
        let Some(mut conn) = self.conn.take() else {
            return Outcome::Ok(());
        };
        let rolled_back = {
            let (driver, raw) = conn.parts();
            driver.rollback(cx, raw).await
        };
        match rolled_back {
            Outcome::Ok(()) => {
                tracing::debug!(connection = %conn.id(), "transaction rolled back");
                Outcome::Ok(())
            }
            Outcome::Err(e) => {
                tracing::warn!(
                    connection = %conn.id(),
                    error = %e,
                    "rollback failed; discarding connection"
                );
                conn.mark_dead();
                Outcome::Ok(())
            }
            Outcome::Cancelled(r) => {
                conn.mark_needs_reset();
                Outcome::Cancelled(r)
            }
            Outcome::Panicked(p) => {
                conn.mark_dead();
                Outcome::Panicked(p)
            }
        }
    }
}

fn not_active() -> Error {
    Error::Transaction(TransactionError {
        kind: TransactionErrorKind::NotActive,
        message: "transaction has no connection".to_string(),
    })
}

impl<D: Driver> Drop for Transaction<D> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            if self.state == TransactionState::Open {
                tracing::debug!(connection = %conn.id(), "open transaction dropped; connection flagged for reset");
                conn.mark_needs_reset();
            }
        }
    }
}
