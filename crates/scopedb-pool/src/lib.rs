//! Connection pooling for ScopeDB using asupersync.
//!
//! [`ConnectionPool`] owns a bounded set of physical connections opened
//! through a [`Driver`]. Up to `pool_size` connections are kept and reused;
//! once those are all checked out, up to `max_overflow` extra connections may
//! be opened and are closed as soon as they are released. Beyond that,
//! acquisition waits for a release until `pool_timeout_ms` elapses and then
//! fails with a pool timeout. A waiter whose context is cancelled stops
//! waiting and returns `Outcome::Cancelled`.
//!
//! Reused connections are validated lazily at checkout:
//!
//! - connections idle longer than `pool_recycle_ms` are replaced
//! - connections returned with an abandoned transaction are rolled back
//! - with `pool_pre_ping`, connections are probed and replaced if dead
//!
//! A replaced connection is never reported to the caller; only a failure to
//! open its replacement is.
//!
//! # Example
//!
//! ```rust,ignore
//! let pool = ConnectionPool::new(driver, PoolConfig::new(2).max_overflow(0))?;
//! let conn = match pool.acquire(&cx).await {
//!     Outcome::Ok(conn) => conn,
//!     Outcome::Err(e) => return Err(e),
//!     _ => return Ok(()),
//! };
//! drop(conn); // back to the pool
//! ```

pub mod config;
pub mod connection;

pub use config::PoolConfig;
pub use connection::{ConnectionId, PooledConnection};

use asupersync::sync::Notify;
use asupersync::time::{timeout, wall_now};
use connection::Connection;
use scopedb_core::{Cx, Driver, Error, Outcome};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Upper bound on one uninterrupted wait for a release. Cancellation and the
/// pool timeout are re-checked at least this often.
const WAIT_SLICE: Duration = Duration::from_millis(20);

/// Pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total number of connections (active + idle, overflow included)
    pub total_connections: usize,
    /// Number of idle connections
    pub idle_connections: usize,
    /// Number of checked-out connections
    pub active_connections: usize,
    /// Number of open overflow connections
    pub overflow_connections: usize,
    /// Number of pending acquire requests
    pub pending_requests: usize,
    /// Physical connections opened over the pool's lifetime
    pub connections_created: u64,
    /// Physical connections closed over the pool's lifetime
    pub connections_discarded: u64,
    /// Acquisitions that failed with a timeout
    pub acquire_timeouts: u64,
}

struct PoolInner<C> {
    idle: VecDeque<Connection<C>>,
    /// Base connections in existence or being opened (idle + checked out).
    open: usize,
    /// Overflow connections in existence or being opened.
    overflow: usize,
    /// Acquisitions currently waiting for a release.
    waiting: usize,
    closed: bool,
}

pub(crate) struct PoolShared<D: Driver> {
    pub(crate) driver: D,
    config: PoolConfig,
    inner: Mutex<PoolInner<D::Conn>>,
    /// Signalled once per release while someone is waiting.
    released: Notify,
    next_id: AtomicU64,
    created: AtomicU64,
    discarded: AtomicU64,
    timeouts: AtomicU64,
}

enum Reservation<C> {
    Idle(Connection<C>),
    Open { overflow: bool },
    Exhausted,
    Closed,
}

impl<D: Driver> PoolShared<D> {
    fn lock(&self) -> MutexGuard<'_, PoolInner<D::Conn>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take an idle connection, claim capacity, or report exhaustion. With
    /// `register`, an exhausted caller is counted as waiting under the same
    /// lock, so no release between here and its wait goes unsignalled.
    fn reserve(&self, register: bool) -> Reservation<D::Conn> {
        let mut inner = self.lock();
        if inner.closed {
            return Reservation::Closed;
        }
        if let Some(conn) = inner.idle.pop_front() {
            return Reservation::Idle(conn);
        }
        if inner.open < self.config.pool_size {
            inner.open += 1;
            return Reservation::Open { overflow: false };
        }
        if inner.overflow < self.config.max_overflow {
            inner.overflow += 1;
            return Reservation::Open { overflow: true };
        }
        if register {
            inner.waiting += 1;
        }
        Reservation::Exhausted
    }

    /// Give back capacity claimed by `reserve` that never became a connection.
    fn unreserve(&self, overflow: bool) {
        let mut inner = self.lock();
        if overflow {
            inner.overflow = inner.overflow.saturating_sub(1);
        } else {
            inner.open = inner.open.saturating_sub(1);
        }
        self.wake_one(&inner);
    }

    fn wake_one(&self, inner: &PoolInner<D::Conn>) {
        if inner.waiting > 0 {
            self.released.notify_one();
        }
    }

    fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub(crate) fn release(&self, mut conn: Connection<D::Conn>) {
        let discard = {
            let mut inner = self.lock();
            let discard = if conn.overflow {
                inner.overflow = inner.overflow.saturating_sub(1);
                true
            } else if !conn.alive || inner.closed {
                inner.open = inner.open.saturating_sub(1);
                true
            } else {
                conn.last_used = Instant::now();
                false
            };
            if discard {
                self.wake_one(&inner);
                Some(conn)
            } else {
                tracing::trace!(connection = %conn.id, "connection returned to pool");
                inner.idle.push_back(conn);
                self.wake_one(&inner);
                None
            }
        };
        if let Some(conn) = discard {
            if !conn.alive {
                tracing::warn!(connection = %conn.id, "discarding dead connection");
            } else {
                tracing::debug!(connection = %conn.id, overflow = conn.overflow, "closing released connection");
            }
            self.close_raw(conn);
        }
    }

    fn close_raw(&self, conn: Connection<D::Conn>) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
        self.driver.close(conn.raw);
    }
}

/// Counts an acquisition as waiting until it returns, however it returns.
struct PendingRequest<'a, D: Driver> {
    shared: &'a PoolShared<D>,
}

impl<D: Driver> Drop for PendingRequest<'_, D> {
    fn drop(&mut self) {
        let mut inner = self.shared.lock();
        inner.waiting = inner.waiting.saturating_sub(1);
    }
}

/// Capacity claimed for a connection that is still being opened.
///
/// Dropping an armed slot (error or cancellation mid-connect) returns the
/// capacity and wakes a waiter.
struct CapacitySlot<'a, D: Driver> {
    shared: &'a PoolShared<D>,
    overflow: bool,
    armed: bool,
}

impl<D: Driver> CapacitySlot<'_, D> {
    fn disarm(mut self) -> bool {
        self.armed = false;
        self.overflow
    }
}

impl<D: Driver> Drop for CapacitySlot<'_, D> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.unreserve(self.overflow);
        }
    }
}

/// A bounded pool of driver connections.
///
/// Cloning is cheap and clones share the same pool.
pub struct ConnectionPool<D: Driver> {
    shared: Arc<PoolShared<D>>,
}

impl<D: Driver> Clone for ConnectionPool<D> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<D: Driver> std::fmt::Debug for ConnectionPool<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<D: Driver> ConnectionPool<D> {
    /// Create a new connection pool. No connection is opened until first use.
    #[allow(clippy::result_large_err)]
    pub fn new(driver: D, config: PoolConfig) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(PoolShared {
                driver,
                config,
                inner: Mutex::new(PoolInner {
                    idle: VecDeque::new(),
                    open: 0,
                    overflow: 0,
                    waiting: 0,
                    closed: false,
                }),
                released: Notify::new(),
                next_id: AtomicU64::new(0),
                created: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
                timeouts: AtomicU64::new(0),
            }),
        })
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn driver(&self) -> &D {
        &self.shared.driver
    }

    /// Check out a connection, waiting up to `pool_timeout_ms` for one.
    ///
    /// Waiting ends early with `Outcome::Cancelled` when `cx` is cancelled.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn acquire(&self, cx: &Cx) -> Outcome<PooledConnection<D>, Error> {
        let deadline = Instant::now() + self.shared.config.timeout();
        let mut pending: Option<PendingRequest<'_, D>> = None;
        loop {
            match self.checkout(cx, pending.is_none()).await {
                Outcome::Ok(Some(conn)) => return Outcome::Ok(conn),
                Outcome::Ok(None) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
            if pending.is_none() {
                tracing::debug!("pool exhausted; waiting for a release");
                pending = Some(PendingRequest {
                    shared: &self.shared,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return Outcome::Err(self.timed_out());
            }
            let slice = (deadline - now).min(WAIT_SLICE);
            if timeout(wall_now(), slice, self.shared.released.notified())
                .await
                .is_ok()
            {
                tracing::trace!("woken by a release");
            }
            if let Some(reason) = cx.cancel_reason() {
                tracing::debug!("acquisition cancelled while waiting");
                return Outcome::Cancelled(reason);
            }
        }
    }

    fn timed_out(&self) -> Error {
        self.shared.timeouts.fetch_add(1, Ordering::Relaxed);
        let config = &self.shared.config;
        tracing::warn!(
            pool_size = config.pool_size,
            max_overflow = config.max_overflow,
            timeout_ms = config.pool_timeout_ms,
            "connection acquisition timed out"
        );
        Error::pool_timeout(format!(
            "QueuePool limit of size {} overflow {} reached, connection timed out, timeout {}ms",
            config.pool_size, config.max_overflow, config.pool_timeout_ms
        ))
    }

    /// Check out a connection without waiting.
    ///
    /// Returns `None` when every connection is checked out and no capacity
    /// is left to open another.
    pub async fn try_acquire(&self, cx: &Cx) -> Outcome<Option<PooledConnection<D>>, Error> {
        self.checkout(cx, false).await
    }

    /// One checkout attempt. `Ok(None)` means the pool is exhausted.
    async fn checkout(
        &self,
        cx: &Cx,
        register: bool,
    ) -> Outcome<Option<PooledConnection<D>>, Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        match self.shared.reserve(register) {
            Reservation::Closed => Outcome::Err(Error::pool_closed()),
            Reservation::Exhausted => Outcome::Ok(None),
            Reservation::Idle(conn) => match self.prepare_idle(cx, conn).await {
                Outcome::Ok(conn) => Outcome::Ok(Some(conn)),
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            },
            Reservation::Open { overflow } => {
                let slot = CapacitySlot {
                    shared: &self.shared,
                    overflow,
                    armed: true,
                };
                match self.open(cx, slot).await {
                    Outcome::Ok(conn) => Outcome::Ok(Some(conn)),
                    Outcome::Err(e) => Outcome::Err(e),
                    Outcome::Cancelled(r) => Outcome::Cancelled(r),
                    Outcome::Panicked(p) => Outcome::Panicked(p),
                }
            }
        }
    }

    async fn open(
        &self,
        cx: &Cx,
        slot: CapacitySlot<'_, D>,
    ) -> Outcome<PooledConnection<D>, Error> {
        let raw = match self.shared.driver.connect(cx).await {
            Outcome::Ok(raw) => raw,
            Outcome::Err(e) => {
                tracing::warn!(error = %e, "failed to open connection");
                return Outcome::Err(e);
            }
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let overflow = slot.disarm();
        let id = self.shared.next_id();
        self.shared.created.fetch_add(1, Ordering::Relaxed);
        tracing::info!(connection = %id, overflow, "opened new connection");
        Outcome::Ok(PooledConnection::new(
            Connection::new(id, raw, overflow),
            Arc::clone(&self.shared),
        ))
    }

    /// Validate a reused connection, replacing it in place if it is unusable.
    async fn prepare_idle(
        &self,
        cx: &Cx,
        conn: Connection<D::Conn>,
    ) -> Outcome<PooledConnection<D>, Error> {
        let config = &self.shared.config;
        let recycle = config
            .recycle_after()
            .is_some_and(|age| conn.last_used.elapsed() >= age);
        let needs_reset = conn.needs_reset;
        let mut pooled = PooledConnection::new(conn, Arc::clone(&self.shared));

        let mut usable = !recycle;
        if recycle {
            tracing::debug!(connection = %pooled.id(), "recycling idle connection");
        }
        if usable && needs_reset {
            let (driver, raw) = pooled.parts();
            match driver.rollback(cx, raw).await {
                Outcome::Ok(()) => {
                    tracing::debug!(connection = %pooled.id(), "reset abandoned transaction");
                }
                Outcome::Err(e) => {
                    tracing::warn!(connection = %pooled.id(), error = %e, "reset failed; replacing connection");
                    usable = false;
                }
                Outcome::Cancelled(r) => {
                    pooled.mark_dead();
                    return Outcome::Cancelled(r);
                }
                Outcome::Panicked(p) => {
                    pooled.mark_dead();
                    return Outcome::Panicked(p);
                }
            }
        }
        if usable && config.pool_pre_ping {
            let (driver, raw) = pooled.parts();
            if !driver.ping(cx, raw).await {
                tracing::warn!(connection = %pooled.id(), "pre-ping failed; replacing connection");
                usable = false;
            }
        }

        if usable {
            pooled.clear_needs_reset();
            tracing::debug!(connection = %pooled.id(), "checked out pooled connection");
            return Outcome::Ok(pooled);
        }

        // Close the stale connection but keep its capacity for the replacement.
        let stale = pooled.take();
        self.shared.close_raw(stale);
        let slot = CapacitySlot {
            shared: &self.shared,
            overflow: false,
            armed: true,
        };
        self.open(cx, slot).await
    }

    /// Probe a checked-out connection. A dead connection is marked so it is
    /// discarded on release.
    pub async fn check(&self, cx: &Cx, conn: &mut PooledConnection<D>) -> bool {
        let (driver, raw) = conn.parts();
        let alive = driver.ping(cx, raw).await;
        if !alive {
            conn.mark_dead();
        }
        alive
    }

    /// Get the current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let inner = self.shared.lock();
        let total = inner.open + inner.overflow;
        PoolStats {
            total_connections: total,
            idle_connections: inner.idle.len(),
            active_connections: total - inner.idle.len(),
            overflow_connections: inner.overflow,
            pending_requests: inner.waiting,
            connections_created: self.shared.created.load(Ordering::Relaxed),
            connections_discarded: self.shared.discarded.load(Ordering::Relaxed),
            acquire_timeouts: self.shared.timeouts.load(Ordering::Relaxed),
        }
    }

    /// Close every idle connection. Checked-out connections are unaffected.
    pub fn dispose(&self) -> usize {
        let drained: Vec<Connection<D::Conn>> = {
            let mut inner = self.shared.lock();
            let drained: Vec<_> = inner.idle.drain(..).collect();
            inner.open = inner.open.saturating_sub(drained.len());
            for _ in 0..drained.len() {
                self.shared.wake_one(&inner);
            }
            drained
        };
        let count = drained.len();
        for conn in drained {
            self.shared.close_raw(conn);
        }
        if count > 0 {
            tracing::info!(closed = count, "disposed idle connections");
        }
        count
    }

    /// Close the pool. Idle connections are closed now, checked-out ones on
    /// release, and pending and future acquisitions fail.
    pub fn close(&self) {
        let waiting = {
            let mut inner = self.shared.lock();
            inner.closed = true;
            inner.waiting
        };
        for _ in 0..waiting {
            self.shared.released.notify_one();
        }
        self.dispose();
        tracing::info!("connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}
