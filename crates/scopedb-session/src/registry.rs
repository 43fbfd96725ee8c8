//! Scoped sessions.
//!
//! A [`ScopeRegistry`] hands out at most one live [`Session`] per
//! [`ScopeKey`]. The key identifies the caller's unit of concurrent work
//! (thread, task, request). Lookup-or-create happens under one lock, so two
//! scopes racing on the registry can never receive the same session, and
//! two callers racing on the same key always do. A new session is published
//! already locked by its creator; callers joining it wait until it has begun
//! and fail if it never did.
//!
//! The registry only holds weak references. A session leaves the registry
//! when it is closed or when the last [`SessionHandle`] to it is dropped; a
//! later request for the same key then starts a fresh session.
//!
//! ```rust,ignore
//! let registry = ScopeRegistry::new(pool, SessionConfig::default());
//! registry
//!     .with_session(&cx, ScopeKey::current_thread(), |session| async move {
//!         match session.add(&cx, &user).await {
//!             Outcome::Ok(()) => session.commit(&cx).await,
//!             other => other,
//!         }
//!     })
//!     .await;
//! ```

use crate::entity::{Entity, EntityType};
use crate::loader::{QueryResult, Select};
use crate::n1_detection::N1Stats;
use crate::session::{FlushResult, Session, SessionConfig};
use crate::tracker::SessionId;
use asupersync::sync::Mutex;
use scopedb_core::{
    Cx, Driver, Error, Outcome, Result, RowSet, ScopeViolationError, StateErrorKind, Statement,
    Value,
};
use scopedb_pool::{ConnectionId, ConnectionPool};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, Weak};
use std::thread::ThreadId;

/// Identity of a unit of concurrent work.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScopeKey {
    Thread(ThreadId),
    Id(u64),
    Name(String),
}

impl ScopeKey {
    /// Key for the calling thread.
    pub fn current_thread() -> Self {
        ScopeKey::Thread(std::thread::current().id())
    }
}

impl From<u64> for ScopeKey {
    fn from(id: u64) -> Self {
        ScopeKey::Id(id)
    }
}

impl From<&str> for ScopeKey {
    fn from(name: &str) -> Self {
        ScopeKey::Name(name.to_string())
    }
}

impl From<String> for ScopeKey {
    fn from(name: String) -> Self {
        ScopeKey::Name(name)
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeKey::Thread(id) => write!(f, "thread {:?}", id),
            ScopeKey::Id(id) => write!(f, "scope {}", id),
            ScopeKey::Name(name) => write!(f, "scope '{}'", name),
        }
    }
}

struct Entry<D: Driver> {
    id: SessionId,
    cell: Weak<SessionCell<D>>,
}

struct RegistryInner<D: Driver> {
    pool: ConnectionPool<D>,
    config: SessionConfig,
    sessions: std::sync::Mutex<HashMap<ScopeKey, Entry<D>>>,
}

impl<D: Driver> RegistryInner<D> {
    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<ScopeKey, Entry<D>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop the entry for `scope` if it still belongs to session `id`.
    fn remove(&self, scope: &ScopeKey, id: SessionId) {
        let mut sessions = self.sessions();
        if sessions.get(scope).is_some_and(|e| e.id == id) {
            sessions.remove(scope);
        }
    }
}

struct SessionCell<D: Driver> {
    id: SessionId,
    scope: ScopeKey,
    in_use: AtomicBool,
    closed: AtomicBool,
    session: Mutex<Session<D>>,
    registry: Weak<RegistryInner<D>>,
}

impl<D: Driver> SessionCell<D> {
    fn closed_error(&self) -> Error {
        Error::invalid_state(
            StateErrorKind::SessionClosed,
            None,
            format!("{} for scope {} is closed", self.id, self.scope),
        )
    }

    fn unregister(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.scope, self.id);
        }
    }
}

impl<D: Driver> Drop for SessionCell<D> {
    fn drop(&mut self) {
        self.unregister();
    }
}

/// Marks a session busy for the duration of one operation.
struct InUse<'a>(&'a AtomicBool);

impl Drop for InUse<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn lock_failed<T>(cx: &Cx) -> Outcome<T, Error> {
    match cx.cancel_reason() {
        Some(reason) => Outcome::Cancelled(reason),
        None => Outcome::Err(Error::Custom("session lock unavailable".to_string())),
    }
}

/// Hand out an existing session once its creator has released it.
async fn join<D: Driver>(
    cx: &Cx,
    cell: Arc<SessionCell<D>>,
) -> Outcome<(SessionHandle<D>, bool), Error> {
    if cell.session.lock(cx).await.is_err() {
        return lock_failed(cx);
    }
    if cell.closed.load(Ordering::Acquire) {
        return Outcome::Err(cell.closed_error());
    }
    Outcome::Ok((SessionHandle { cell }, false))
}

fn lift<T>(result: Result<T>) -> Outcome<T, Error> {
    match result {
        Ok(value) => Outcome::Ok(value),
        Err(e) => Outcome::Err(e),
    }
}

/// Run `$body` with exclusive access to the handle's session, failing with
/// a scope violation if another operation on it is in flight and with
/// `SessionClosed` once the session is closed or failed to open.
macro_rules! with_locked {
    ($handle:expr, $cx:expr, |$session:ident| $body:expr) => {{
        let _in_use = match $handle.claim() {
            Ok(guard) => guard,
            Err(e) => return Outcome::Err(e),
        };
        let Ok(mut guard) = $handle.cell.session.lock($cx).await else {
            return lock_failed($cx);
        };
        if $handle.is_closed() {
            return Outcome::Err($handle.cell.closed_error());
        }
        let $session = &mut *guard;
        $body
    }};
}

/// Shared handle to a registry-owned session.
///
/// Every operation takes the session exclusively. An operation started
/// while another is still running on the same session fails with
/// [`Error::ScopeViolation`] instead of interleaving with it.
pub struct SessionHandle<D: Driver> {
    cell: Arc<SessionCell<D>>,
}

impl<D: Driver> Clone for SessionHandle<D> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<D: Driver> fmt::Debug for SessionHandle<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.cell.id)
            .field("scope", &self.cell.scope)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<D: Driver> SessionHandle<D> {
    fn claim(&self) -> Result<InUse<'_>> {
        if self
            .cell
            .in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::error!(
                scope = %self.cell.scope,
                session = %self.cell.id,
                "session used by two scopes at once"
            );
            return Err(Error::ScopeViolation(ScopeViolationError {
                scope: self.cell.scope.to_string(),
                message: format!("{} is already in use by another task", self.cell.id),
            }));
        }
        Ok(InUse(&self.cell.in_use))
    }

    pub fn id(&self) -> SessionId {
        self.cell.id
    }

    pub fn scope(&self) -> &ScopeKey {
        &self.cell.scope
    }

    pub fn is_closed(&self) -> bool {
        self.cell.closed.load(Ordering::Acquire)
    }

    /// Do both handles refer to the same session?
    pub fn same_session(&self, other: &SessionHandle<D>) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }

    pub async fn add(&self, cx: &Cx, entity: &Entity) -> Outcome<(), Error> {
        with_locked!(self, cx, |session| lift(session.add(entity)))
    }

    pub async fn add_all(&self, cx: &Cx, entities: &[Entity]) -> Outcome<(), Error> {
        with_locked!(self, cx, |session| lift(session.add_all(entities)))
    }

    pub async fn flush(&self, cx: &Cx, only: Option<&[Entity]>) -> Outcome<FlushResult, Error> {
        with_locked!(self, cx, |session| session.flush(cx, only).await)
    }

    pub async fn commit(&self, cx: &Cx) -> Outcome<(), Error> {
        with_locked!(self, cx, |session| session.commit(cx).await)
    }

    pub async fn rollback(&self, cx: &Cx) -> Outcome<(), Error> {
        with_locked!(self, cx, |session| session.rollback(cx).await)
    }

    pub async fn refresh(&self, cx: &Cx, entity: &Entity) -> Outcome<(), Error> {
        with_locked!(self, cx, |session| session.refresh(cx, entity).await)
    }

    pub async fn get(&self, cx: &Cx, entity: &Entity, field: &str) -> Outcome<Value, Error> {
        with_locked!(self, cx, |session| session.get(cx, entity, field).await)
    }

    pub async fn find(
        &self,
        cx: &Cx,
        ty: &'static EntityType,
        key: impl Into<Value>,
    ) -> Outcome<Option<Entity>, Error> {
        let key = key.into();
        with_locked!(self, cx, |session| session.find(cx, ty, key).await)
    }

    pub async fn expire(&self, cx: &Cx, entity: &Entity) -> Outcome<(), Error> {
        with_locked!(self, cx, |session| lift(session.expire(entity)))
    }

    pub async fn expire_all(&self, cx: &Cx) -> Outcome<(), Error> {
        with_locked!(self, cx, |session| lift(session.expire_all()))
    }

    pub async fn execute(&self, cx: &Cx, statement: &Statement) -> Outcome<RowSet, Error> {
        with_locked!(self, cx, |session| session.execute(cx, statement).await)
    }

    pub async fn select(&self, cx: &Cx, select: &Select) -> Outcome<QueryResult, Error> {
        with_locked!(self, cx, |session| session.select(cx, select).await)
    }

    pub async fn related(
        &self,
        cx: &Cx,
        parent: &Entity,
        relationship: &str,
    ) -> Outcome<Vec<Entity>, Error> {
        with_locked!(self, cx, |session| session.related(cx, parent, relationship).await)
    }

    pub async fn load_related(
        &self,
        cx: &Cx,
        parents: &[Entity],
        relationship: &str,
    ) -> Outcome<(), Error> {
        with_locked!(self, cx, |session| session
            .load_related(cx, parents, relationship)
            .await)
    }

    /// Connection currently held by the session's transaction.
    pub async fn connection_id(&self, cx: &Cx) -> Outcome<Option<ConnectionId>, Error> {
        with_locked!(self, cx, |session| Outcome::Ok(session.connection_id()))
    }

    pub async fn len(&self, cx: &Cx) -> Outcome<usize, Error> {
        with_locked!(self, cx, |session| Outcome::Ok(session.len()))
    }

    pub async fn enable_n1_detection(&self, cx: &Cx, threshold: usize) -> Outcome<(), Error> {
        with_locked!(self, cx, |session| {
            session.enable_n1_detection(threshold);
            Outcome::Ok(())
        })
    }

    pub async fn n1_stats(&self, cx: &Cx) -> Outcome<Option<N1Stats>, Error> {
        with_locked!(self, cx, |session| Outcome::Ok(session.n1_stats()))
    }

    /// Close the session and remove it from the registry. Closing twice is
    /// a no-op.
    pub async fn close(&self, cx: &Cx) -> Outcome<(), Error> {
        if self.is_closed() {
            self.cell.unregister();
            return Outcome::Ok(());
        }
        let outcome = with_locked!(self, cx, |session| session.close(cx).await);
        if !self.cell.closed.swap(true, Ordering::AcqRel) {
            tracing::info!(scope = %self.cell.scope, session = %self.cell.id, "scoped session closed");
        }
        self.cell.unregister();
        outcome
    }
}

/// Maps scope keys to live sessions over one connection pool.
pub struct ScopeRegistry<D: Driver> {
    inner: Arc<RegistryInner<D>>,
}

impl<D: Driver> Clone for ScopeRegistry<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Driver> fmt::Debug for ScopeRegistry<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeRegistry")
            .field("sessions", &self.len())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl<D: Driver> ScopeRegistry<D> {
    pub fn new(pool: ConnectionPool<D>, config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                pool,
                config,
                sessions: std::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn pool(&self) -> &ConnectionPool<D> {
        &self.inner.pool
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// The live session for `key`, creating one if there is none.
    ///
    /// A new session checks out its connection immediately; if that fails
    /// (for example with a pool timeout) nothing is registered.
    #[tracing::instrument(level = "debug", skip(self, cx, key))]
    pub async fn session_for(
        &self,
        cx: &Cx,
        key: impl Into<ScopeKey>,
    ) -> Outcome<SessionHandle<D>, Error> {
        match self.lookup_or_create(cx, key.into()).await {
            Outcome::Ok((handle, _)) => Outcome::Ok(handle),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    fn live_cell(&self, key: &ScopeKey) -> Option<Arc<SessionCell<D>>> {
        self.inner
            .sessions()
            .get(key)
            .and_then(|e| e.cell.upgrade())
            .filter(|cell| !cell.closed.load(Ordering::Acquire))
    }

    fn new_cell(&self, key: &ScopeKey) -> Arc<SessionCell<D>> {
        let session = Session::scoped(
            self.inner.pool.clone(),
            self.inner.config.clone(),
            key.clone(),
        );
        Arc::new(SessionCell {
            id: session.id(),
            scope: key.clone(),
            in_use: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            session: Mutex::new(session),
            registry: Arc::downgrade(&self.inner),
        })
    }

    async fn lookup_or_create(
        &self,
        cx: &Cx,
        key: ScopeKey,
    ) -> Outcome<(SessionHandle<D>, bool), Error> {
        if let Some(cell) = self.live_cell(&key) {
            return join(cx, cell).await;
        }

        // The cell is locked before it is published, so a caller that finds
        // it in the map cannot use it until `begin` below has finished.
        let cell = self.new_cell(&key);
        let Ok(mut session) = cell.session.try_lock() else {
            return Outcome::Err(Error::Custom("session lock unavailable".to_string()));
        };

        // Cells are only dropped after the registry lock is released.
        let mut stale = None;
        let existing = {
            let mut sessions = self.inner.sessions();
            match sessions.get(&key).and_then(|e| e.cell.upgrade()) {
                Some(live) if !live.closed.load(Ordering::Acquire) => Some(live),
                other => {
                    stale = other;
                    sessions.insert(
                        key.clone(),
                        Entry {
                            id: cell.id,
                            cell: Arc::downgrade(&cell),
                        },
                    );
                    None
                }
            }
        };
        drop(stale);
        if let Some(live) = existing {
            drop(session);
            return join(cx, live).await;
        }

        let begun = session.begin(cx).await;
        if !matches!(begun, Outcome::Ok(())) {
            cell.closed.store(true, Ordering::Release);
        }
        drop(session);
        let handle = SessionHandle {
            cell: Arc::clone(&cell),
        };
        match begun {
            Outcome::Ok(()) => {
                tracing::info!(scope = %key, session = %handle.id(), "scoped session opened");
                Outcome::Ok((handle, true))
            }
            Outcome::Err(e) => {
                tracing::debug!(scope = %key, error = %e, "scoped session failed to open");
                cell.unregister();
                Outcome::Err(e)
            }
            Outcome::Cancelled(r) => {
                cell.unregister();
                Outcome::Cancelled(r)
            }
            Outcome::Panicked(p) => {
                cell.unregister();
                Outcome::Panicked(p)
            }
        }
    }

    /// Run `f` with the session for `key`.
    ///
    /// If this call created the session, it is closed when `f` finishes,
    /// whatever `f` returned; a session that already existed is left open
    /// for its creator. Nothing is committed implicitly.
    pub async fn with_session<T, F, Fut>(
        &self,
        cx: &Cx,
        key: impl Into<ScopeKey>,
        f: F,
    ) -> Outcome<T, Error>
    where
        F: FnOnce(SessionHandle<D>) -> Fut,
        Fut: Future<Output = Outcome<T, Error>>,
    {
        let (handle, created) = match self.lookup_or_create(cx, key.into()).await {
            Outcome::Ok(found) => found,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let result = f(handle.clone()).await;
        if !created {
            return result;
        }
        match (handle.close(cx).await, result) {
            (_, Outcome::Err(e)) => Outcome::Err(e),
            (Outcome::Ok(()), result) => result,
            (Outcome::Err(e), _) => Outcome::Err(e),
            (Outcome::Cancelled(r), _) => Outcome::Cancelled(r),
            (Outcome::Panicked(p), _) => Outcome::Panicked(p),
        }
    }

    /// Close every live session.
    pub async fn shutdown(&self, cx: &Cx) -> Outcome<(), Error> {
        let cells: Vec<Arc<SessionCell<D>>> = {
            let sessions = self.inner.sessions();
            sessions.values().filter_map(|e| e.cell.upgrade()).collect()
        };
        tracing::info!(sessions = cells.len(), "closing scoped sessions");
        for cell in cells {
            let handle = SessionHandle { cell };
            match handle.close(cx).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(())
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.inner
            .sessions()
            .values()
            .filter(|e| e.cell.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Is there a live session for `key`?
    pub fn contains(&self, key: &ScopeKey) -> bool {
        self.inner
            .sessions()
            .get(key)
            .is_some_and(|e| e.cell.strong_count() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use scopedb_memory::MemoryDriver;
    use scopedb_pool::PoolConfig;
    use std::sync::Barrier;

    static USER: EntityType = EntityType::new("users", "id");

    fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => panic!("unexpected error: {e}"),
            Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
            Outcome::Panicked(p) => panic!("panicked: {p:?}"),
        }
    }

    fn registry(driver: &MemoryDriver, config: PoolConfig) -> ScopeRegistry<MemoryDriver> {
        driver.create_table("users", "id", &["name"]);
        let pool = ConnectionPool::new(driver.clone(), config).expect("valid pool config");
        ScopeRegistry::new(pool, SessionConfig::default())
    }

    #[test]
    fn same_key_same_session() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let driver = MemoryDriver::new();
        let registry = registry(&driver, PoolConfig::new(2));

        rt.block_on(async {
            let first = unwrap_outcome(registry.session_for(&cx, "req-1").await);
            let again = unwrap_outcome(registry.session_for(&cx, "req-1").await);
            assert!(first.same_session(&again));
            assert_eq!(first.id(), again.id());
            assert!(registry.contains(&ScopeKey::from("req-1")));
            assert_eq!(registry.len(), 1);
            assert!(unwrap_outcome(first.connection_id(&cx).await).is_some());
        });

        assert_eq!(driver.connections_opened(), 1);
    }

    #[test]
    fn distinct_keys_distinct_sessions_and_connections() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let driver = MemoryDriver::new();
        let registry = registry(&driver, PoolConfig::new(2));

        rt.block_on(async {
            let a = unwrap_outcome(registry.session_for(&cx, 1_u64).await);
            let b = unwrap_outcome(registry.session_for(&cx, 2_u64).await);
            assert!(!a.same_session(&b));
            let conn_a = unwrap_outcome(a.connection_id(&cx).await);
            let conn_b = unwrap_outcome(b.connection_id(&cx).await);
            assert_ne!(conn_a, conn_b);
        });
    }

    #[test]
    fn racing_threads_get_their_own_sessions() {
        let driver = MemoryDriver::new();
        let registry = registry(&driver, PoolConfig::new(2).max_overflow(0));
        let barrier = Arc::new(Barrier::new(2));

        let workers: Vec<_> = (0..2)
            .map(|_| {
                let registry = registry.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let rt = RuntimeBuilder::current_thread()
                        .build()
                        .expect("create asupersync runtime");
                    let cx = Cx::for_testing();
                    barrier.wait();
                    rt.block_on(async {
                        let handle =
                            unwrap_outcome(registry.session_for(&cx, ScopeKey::current_thread()).await);
                        let conn = unwrap_outcome(handle.connection_id(&cx).await);
                        (handle, conn)
                    })
                })
            })
            .collect();
        let results: Vec<_> = workers
            .into_iter()
            .map(|w| w.join().expect("worker thread"))
            .collect();

        assert!(!results[0].0.same_session(&results[1].0));
        assert_ne!(results[0].1, results[1].1);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn racing_on_one_key_shares_the_session() {
        let driver = MemoryDriver::new();
        let registry = registry(&driver, PoolConfig::new(4));
        let barrier = Arc::new(Barrier::new(4));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let rt = RuntimeBuilder::current_thread()
                        .build()
                        .expect("create asupersync runtime");
                    let cx = Cx::for_testing();
                    barrier.wait();
                    rt.block_on(async { unwrap_outcome(registry.session_for(&cx, "shared").await) })
                })
            })
            .collect();
        let handles: Vec<_> = workers
            .into_iter()
            .map(|w| w.join().expect("worker thread"))
            .collect();

        assert!(handles.iter().all(|h| h.same_session(&handles[0])));
        assert_eq!(driver.connections_opened(), 1);
    }

    #[test]
    fn closed_keys_start_fresh() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let driver = MemoryDriver::new();
        let registry = registry(&driver, PoolConfig::new(1));

        rt.block_on(async {
            let first = unwrap_outcome(registry.session_for(&cx, 9_u64).await);
            unwrap_outcome(first.close(&cx).await);
            assert!(first.is_closed());
            assert!(!registry.contains(&ScopeKey::from(9_u64)));

            let second = unwrap_outcome(registry.session_for(&cx, 9_u64).await);
            assert_ne!(first.id(), second.id());
            assert!(unwrap_outcome(second.connection_id(&cx).await).is_some());
        });
    }

    #[test]
    fn dropping_every_handle_unregisters() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let driver = MemoryDriver::new();
        let registry = registry(&driver, PoolConfig::new(1).max_overflow(0));

        rt.block_on(async {
            let handle = unwrap_outcome(registry.session_for(&cx, "tmp").await);
            unwrap_outcome(handle.add(&cx, &Entity::new(&USER).with("name", "x")).await);
            unwrap_outcome(handle.flush(&cx, None).await);
            drop(handle);
            assert!(registry.is_empty());

            // The abandoned transaction is rolled back before reuse.
            let next = unwrap_outcome(registry.session_for(&cx, "tmp").await);
            assert!(unwrap_outcome(next.connection_id(&cx).await).is_some());
        });

        assert!(driver.rows("users").is_empty());
        assert_eq!(driver.connections_opened(), 1);
    }

    #[test]
    fn overlapping_operations_are_a_scope_violation() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let driver = MemoryDriver::new();
        let registry = registry(&driver, PoolConfig::new(1));

        rt.block_on(async {
            let handle = unwrap_outcome(registry.session_for(&cx, "shared").await);
            let other = unwrap_outcome(registry.session_for(&cx, "shared").await);
            let busy = handle.claim().unwrap();
            match other.commit(&cx).await {
                Outcome::Err(e) => assert!(e.is_scope_violation(), "unexpected error: {e}"),
                _ => panic!("expected a scope violation"),
            }
            drop(busy);
            unwrap_outcome(other.commit(&cx).await);
        });
    }

    #[test]
    fn with_session_closes_only_what_it_created() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let driver = MemoryDriver::new();
        let registry = registry(&driver, PoolConfig::new(2));

        rt.block_on(async {
            let user = Entity::new(&USER).with("name", "ann");
            let outer = registry
                .with_session(&cx, "req", |session| {
                    let registry = registry.clone();
                    let cx = &cx;
                    let user = user.clone();
                    async move {
                        let inner = registry
                            .with_session(cx, "req", |nested| async move {
                                match nested.add(cx, &user).await {
                                    Outcome::Ok(()) => Outcome::Ok(nested.id()),
                                    Outcome::Err(e) => Outcome::Err(e),
                                    Outcome::Cancelled(r) => Outcome::Cancelled(r),
                                    Outcome::Panicked(p) => Outcome::Panicked(p),
                                }
                            })
                            .await;
                        let inner = unwrap_outcome(inner);
                        assert!(!session.is_closed());
                        unwrap_outcome(session.commit(cx).await);
                        Outcome::Ok(inner)
                    }
                })
                .await;
            let outer_id = unwrap_outcome(outer);
            assert!(registry.is_empty());
            assert_eq!(user.state(), crate::tracker::EntityState::Detached);
            assert_eq!(user.session_id(), Some(outer_id));
        });

        assert_eq!(driver.rows("users").len(), 1);
        assert_eq!(driver.connections_opened(), 1);
    }

    #[test]
    fn failed_checkout_registers_nothing() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let driver = MemoryDriver::new();
        let registry = registry(&driver, PoolConfig::new(1).max_overflow(0).pool_timeout(50));

        rt.block_on(async {
            let _held = unwrap_outcome(registry.session_for(&cx, "a").await);
            match registry.session_for(&cx, "b").await {
                Outcome::Err(e) => assert!(e.is_pool_timeout(), "unexpected error: {e}"),
                _ => panic!("expected pool timeout"),
            }
            assert!(!registry.contains(&ScopeKey::from("b")));
            assert_eq!(registry.len(), 1);
        });
    }

    #[test]
    fn joining_a_session_that_fails_to_open_yields_no_handle() {
        let driver = MemoryDriver::new();
        let registry = registry(&driver, PoolConfig::new(1).max_overflow(0).pool_timeout(500));
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let held = unwrap_outcome(rt.block_on(registry.session_for(&cx, "a")));

        let creator = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                let rt = RuntimeBuilder::current_thread()
                    .build()
                    .expect("create asupersync runtime");
                let cx = Cx::for_testing();
                rt.block_on(registry.session_for(&cx, "b"))
            })
        };
        let joiner = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                let rt = RuntimeBuilder::current_thread()
                    .build()
                    .expect("create asupersync runtime");
                let cx = Cx::for_testing();
                while !registry.contains(&ScopeKey::from("b")) {
                    std::thread::yield_now();
                }
                rt.block_on(registry.session_for(&cx, "b"))
            })
        };

        match creator.join().expect("creator thread") {
            Outcome::Err(e) => assert!(e.is_pool_timeout(), "unexpected error: {e}"),
            _ => panic!("expected pool timeout"),
        }
        match joiner.join().expect("joiner thread") {
            Outcome::Err(e) => assert!(e.is_invalid_state(), "unexpected error: {e}"),
            Outcome::Ok(handle) => panic!("joiner got {handle:?} for a session that never began"),
            _ => panic!("expected session closed error"),
        }
        assert!(!registry.contains(&ScopeKey::from("b")));

        rt.block_on(async {
            unwrap_outcome(held.close(&cx).await);
            let fresh = unwrap_outcome(registry.session_for(&cx, "b").await);
            assert!(unwrap_outcome(fresh.connection_id(&cx).await).is_some());
            assert_eq!(registry.len(), 1);
        });
    }

    #[test]
    fn closed_handle_rejects_further_operations() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let driver = MemoryDriver::new();
        let registry = registry(&driver, PoolConfig::new(1));

        rt.block_on(async {
            let handle = unwrap_outcome(registry.session_for(&cx, "req").await);
            unwrap_outcome(handle.close(&cx).await);
            unwrap_outcome(handle.close(&cx).await);
            match handle.len(&cx).await {
                Outcome::Err(e) => assert!(e.is_invalid_state(), "unexpected error: {e}"),
                _ => panic!("expected session closed error"),
            }
        });
    }

    #[test]
    fn shutdown_closes_everything() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let driver = MemoryDriver::new();
        let registry = registry(&driver, PoolConfig::new(3));

        rt.block_on(async {
            let mut live = Vec::new();
            for key in [1_u64, 2, 3] {
                live.push(unwrap_outcome(registry.session_for(&cx, key).await));
            }
            unwrap_outcome(registry.shutdown(&cx).await);
            assert!(live.iter().all(SessionHandle::is_closed));
            assert!(registry.is_empty());
        });

        assert_eq!(driver.rollbacks(), 3);
        assert_eq!(registry.pool().stats().idle_connections, 3);
    }
}
