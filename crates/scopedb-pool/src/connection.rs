//! Physical connections and the checkout guard.

use crate::PoolShared;
use scopedb_core::Driver;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Identity token of a pooled physical connection, unique within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) u64);

impl ConnectionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// A physical connection plus the bookkeeping the pool needs.
#[derive(Debug)]
pub(crate) struct Connection<C> {
    pub(crate) id: ConnectionId,
    pub(crate) raw: C,
    pub(crate) alive: bool,
    pub(crate) last_used: Instant,
    pub(crate) created_at: Instant,
    pub(crate) overflow: bool,
    /// Checked back in with a transaction possibly still open.
    pub(crate) needs_reset: bool,
}

impl<C> Connection<C> {
    pub(crate) fn new(id: ConnectionId, raw: C, overflow: bool) -> Self {
        let now = Instant::now();
        Self {
            id,
            raw,
            alive: true,
            last_used: now,
            created_at: now,
            overflow,
            needs_reset: false,
        }
    }
}

/// A connection checked out of a [`ConnectionPool`](crate::ConnectionPool).
///
/// Dropping it returns the connection to the pool. Dead and overflow
/// connections are closed instead of pooled. Release never blocks.
pub struct PooledConnection<D: Driver> {
    conn: Option<Connection<D::Conn>>,
    shared: Arc<PoolShared<D>>,
}

impl<D: Driver> PooledConnection<D> {
    pub(crate) fn new(conn: Connection<D::Conn>, shared: Arc<PoolShared<D>>) -> Self {
        Self {
            conn: Some(conn),
            shared,
        }
    }

    fn conn(&self) -> &Connection<D::Conn> {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }

    fn conn_mut(&mut self) -> &mut Connection<D::Conn> {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.conn().id
    }

    pub fn is_overflow(&self) -> bool {
        self.conn().overflow
    }

    pub fn is_alive(&self) -> bool {
        self.conn().alive
    }

    pub fn created_at(&self) -> Instant {
        self.conn().created_at
    }

    pub fn driver(&self) -> &D {
        &self.shared.driver
    }

    pub fn raw(&self) -> &D::Conn {
        &self.conn().raw
    }

    pub fn raw_mut(&mut self) -> &mut D::Conn {
        &mut self.conn_mut().raw
    }

    /// Borrow the driver and the physical connection together.
    pub fn parts(&mut self) -> (&D, &mut D::Conn) {
        let conn = match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        };
        (&self.shared.driver, &mut conn.raw)
    }

    /// Discard this connection on release instead of pooling it.
    pub fn mark_dead(&mut self) {
        self.conn_mut().alive = false;
    }

    /// Roll back whatever the connection holds before its next checkout.
    pub fn mark_needs_reset(&mut self) {
        self.conn_mut().needs_reset = true;
    }

    pub(crate) fn clear_needs_reset(&mut self) {
        self.conn_mut().needs_reset = false;
    }

    pub(crate) fn take(mut self) -> Connection<D::Conn> {
        match self.conn.take() {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<D: Driver> fmt::Debug for PooledConnection<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.conn {
            Some(conn) => f
                .debug_struct("PooledConnection")
                .field("id", &conn.id)
                .field("alive", &conn.alive)
                .field("overflow", &conn.overflow)
                .finish(),
            None => f.write_str("PooledConnection(released)"),
        }
    }
}

impl<D: Driver> Drop for PooledConnection<D> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.shared.release(conn);
        }
    }
}
