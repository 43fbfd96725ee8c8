//! The unit of work.
//!
//! A [`Session`] combines one lazily begun [`Transaction`] with the
//! [`EntityStateTracker`] for every entity it manages. Nothing is written
//! until `flush` or `commit`; commit is never implicit, and a session that
//! is closed or dropped with an open transaction rolls it back.

use crate::entity::{Entity, EntityType};
use crate::n1_detection::{LoadSample, N1QueryTracker, N1Stats};
use crate::registry::ScopeKey;
use crate::tracker::{EntityState, EntityStateTracker, SessionId, StateEvent};
use crate::transaction::Transaction;
use scopedb_core::{
    Cx, DetachedError, Driver, Error, ExecOptions, Filter, Outcome, Result, Row, RowSet,
    StateErrorKind, Statement, Value,
};
use scopedb_pool::{ConnectionId, ConnectionPool};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

// ============================================================================
// Configuration
// ============================================================================

/// Session behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Expire every persistent entity after commit so the next access reloads it.
    pub expire_on_commit: bool,
    /// Statement timeout requested from the driver, in milliseconds.
    pub statement_timeout_ms: Option<u64>,
    /// Enable N+1 detection with this threshold.
    pub n1_threshold: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            expire_on_commit: true,
            statement_timeout_ms: None,
            n1_threshold: None,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expire_on_commit(mut self, value: bool) -> Self {
        self.expire_on_commit = value;
        self
    }

    pub fn statement_timeout(mut self, ms: u64) -> Self {
        self.statement_timeout_ms = Some(ms);
        self
    }

    pub fn n1_threshold(mut self, threshold: usize) -> Self {
        self.n1_threshold = Some(threshold);
        self
    }

    /// Driver options derived from this configuration.
    pub fn exec_options(&self) -> ExecOptions {
        match self.statement_timeout_ms {
            Some(ms) => ExecOptions::with_timeout(Duration::from_millis(ms)),
            None => ExecOptions::default(),
        }
    }
}

/// What a flush wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushResult {
    pub inserted: usize,
    pub updated: usize,
}

impl FlushResult {
    pub fn is_empty(&self) -> bool {
        self.inserted == 0 && self.updated == 0
    }
}

// ============================================================================
// Session
// ============================================================================

/// A unit of work over pooled connections.
pub struct Session<D: Driver> {
    id: SessionId,
    scope: Option<ScopeKey>,
    pool: ConnectionPool<D>,
    config: SessionConfig,
    tx: Option<Transaction<D>>,
    tracker: EntityStateTracker,
    /// Entities whose insert was flushed in the current transaction.
    inserted: Vec<Entity>,
    n1: Option<N1QueryTracker>,
    closed: bool,
}

impl<D: Driver> Session<D> {
    /// Create a session. No connection is checked out until the first
    /// operation that needs one.
    pub fn new(pool: ConnectionPool<D>, config: SessionConfig) -> Self {
        let n1 = config.n1_threshold.map(N1QueryTracker::new);
        Self {
            id: SessionId::next(),
            scope: None,
            pool,
            config,
            tx: None,
            tracker: EntityStateTracker::new(),
            inserted: Vec::new(),
            n1,
            closed: false,
        }
    }

    pub(crate) fn scoped(pool: ConnectionPool<D>, config: SessionConfig, scope: ScopeKey) -> Self {
        let mut session = Self::new(pool, config);
        session.scope = Some(scope);
        session
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn scope(&self) -> Option<&ScopeKey> {
        self.scope.as_ref()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Is a transaction (and so a connection) currently held?
    pub fn in_transaction(&self) -> bool {
        self.tx.as_ref().is_some_and(Transaction::is_open)
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.tx.as_ref().and_then(Transaction::connection_id)
    }

    /// Managed entities in the order they became managed.
    pub fn entities(&self) -> &[Entity] {
        self.tracker.entities()
    }

    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    pub fn contains(&self, entity: &Entity) -> bool {
        self.tracker.contains(entity)
    }

    fn ensure_active(&self) -> Result<()> {
        if self.closed {
            return Err(Error::invalid_state(
                StateErrorKind::SessionClosed,
                None,
                format!("{} is closed", self.id),
            ));
        }
        Ok(())
    }

    /// Is `entity` managed by this session?
    pub(crate) fn check_owned(&self, entity: &Entity) -> Result<()> {
        let data = entity.read();
        match data.session {
            Some(id) if id == self.id && self.tracker.contains(entity) => Ok(()),
            Some(id) if id != self.id => Err(Error::invalid_state(
                StateErrorKind::ForeignSession,
                Some(data.state.as_str()),
                format!("'{}' instance belongs to {}", data.ty.table, id),
            )),
            _ => Err(Error::invalid_state(
                StateErrorKind::NotManaged,
                Some(data.state.as_str()),
                format!("'{}' instance is not managed by {}", data.ty.table, self.id),
            )),
        }
    }

    // ========================================================================
    // Transaction Management
    // ========================================================================

    /// Check out a connection and begin a transaction, unless one is open.
    pub async fn begin(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if let Err(e) = self.ensure_active() {
            return Outcome::Err(e);
        }
        if self.in_transaction() {
            return Outcome::Ok(());
        }
        match Transaction::begin(cx, &self.pool, self.config.exec_options()).await {
            Outcome::Ok(tx) => {
                tracing::debug!(session = %self.id, connection = ?tx.connection_id(), "session begun");
                self.tx = Some(tx);
                Outcome::Ok(())
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Execute a statement inside the session's transaction, beginning one
    /// if needed.
    pub async fn execute(&mut self, cx: &Cx, statement: &Statement) -> Outcome<RowSet, Error> {
        match self.begin(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        let Some(tx) = self.tx.as_mut() else {
            return Outcome::Err(Error::Custom("transaction missing after begin".to_string()));
        };
        tx.execute(cx, statement).await
    }

    /// Flush, commit, then apply the expire-on-commit policy.
    ///
    /// The connection returns to the pool; the next operation begins a new
    /// transaction.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(session = %self.id))]
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<(), Error> {
        match self.flush(cx, None).await {
            Outcome::Ok(_) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        if let Some(tx) = self.tx.as_mut() {
            match tx.commit(cx).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        self.tx = None;
        self.inserted.clear();

        let event = StateEvent::Commit {
            expire_on_commit: self.config.expire_on_commit,
        };
        for entity in self.tracker.entities() {
            if matches!(entity.state(), EntityState::Persistent | EntityState::Expired) {
                if let Err(e) = self.tracker.transition(entity, event) {
                    return Outcome::Err(e);
                }
            }
        }
        Outcome::Ok(())
    }

    /// Roll back the transaction.
    ///
    /// Pending entities and entities inserted by this transaction become
    /// transient again; everything else managed is expired.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(session = %self.id))]
    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if let Err(e) = self.ensure_active() {
            return Outcome::Err(e);
        }
        let outcome = match self.tx.take() {
            Some(mut tx) => tx.rollback(cx).await,
            None => Outcome::Ok(()),
        };

        let inserted = std::mem::take(&mut self.inserted);
        for entity in self.tracker.entities().to_vec() {
            let discard = match entity.state() {
                EntityState::Pending => true,
                EntityState::Persistent | EntityState::Expired => {
                    inserted.iter().any(|e| e.ptr_eq(&entity))
                }
                _ => false,
            };
            let result = if discard {
                self.tracker.remove(&entity);
                self.tracker.transition(&entity, StateEvent::Discard)
            } else {
                self.tracker.transition(&entity, StateEvent::Rollback)
            };
            if let Err(e) = result {
                return Outcome::Err(e);
            }
        }
        outcome
    }

    // ========================================================================
    // Entity Operations
    // ========================================================================

    /// Start managing an entity.
    ///
    /// Transient entities become pending. Re-adding an entity this session
    /// already manages does nothing. A detached entity is re-attached as
    /// expired, so its attributes are reloaded on next access.
    pub fn add(&mut self, entity: &Entity) -> Result<()> {
        self.ensure_active()?;
        match entity.state() {
            EntityState::Transient => {
                self.tracker.transition(entity, StateEvent::Add)?;
                entity.write().session = Some(self.id);
                self.tracker.manage(entity);
                Ok(())
            }
            EntityState::Detached => {
                let Some(key) = entity.key() else {
                    return Err(Error::invalid_state(
                        StateErrorKind::MissingIdentity,
                        Some(EntityState::Detached.as_str()),
                        "detached instance has no identity key",
                    ));
                };
                if self.tracker.lookup(entity.table(), &key).is_some() {
                    return Err(Error::invalid_state(
                        StateErrorKind::DuplicateIdentity,
                        Some(EntityState::Detached.as_str()),
                        format!(
                            "another '{}' instance with key {} is already in this session",
                            entity.table(),
                            key
                        ),
                    ));
                }
                self.tracker.transition(entity, StateEvent::Attach)?;
                entity.write().session = Some(self.id);
                self.tracker.manage(entity);
                self.tracker.register_identity(entity)
            }
            EntityState::Pending | EntityState::Persistent | EntityState::Expired => {
                self.check_owned(entity)
            }
        }
    }

    pub fn add_all<'a>(&mut self, entities: impl IntoIterator<Item = &'a Entity>) -> Result<()> {
        for entity in entities {
            self.add(entity)?;
        }
        Ok(())
    }

    /// Send pending inserts and dirty updates without ending the transaction.
    ///
    /// With `only`, restricts the flush to those entities (each must be
    /// managed here). Inserts go out in the order entities were added and
    /// assign identity keys.
    #[tracing::instrument(level = "debug", skip(self, cx, only), fields(session = %self.id))]
    pub async fn flush(&mut self, cx: &Cx, only: Option<&[Entity]>) -> Outcome<FlushResult, Error> {
        if let Err(e) = self.ensure_active() {
            return Outcome::Err(e);
        }
        if let Some(only) = only {
            for entity in only {
                if let Err(e) = self.check_owned(entity) {
                    return Outcome::Err(e);
                }
            }
        }

        let selected: Vec<Entity> = self
            .tracker
            .entities()
            .iter()
            .filter(|e| only.is_none_or(|only| only.iter().any(|o| o.ptr_eq(e))))
            .cloned()
            .collect();
        let inserts: Vec<Entity> = selected
            .iter()
            .filter(|e| e.state() == EntityState::Pending)
            .cloned()
            .collect();
        let updates: Vec<Entity> = selected
            .iter()
            .filter(|e| {
                matches!(e.state(), EntityState::Persistent | EntityState::Expired) && e.is_dirty()
            })
            .cloned()
            .collect();

        let mut result = FlushResult::default();
        if inserts.is_empty() && updates.is_empty() {
            return Outcome::Ok(result);
        }

        for entity in inserts {
            let statement = insert_statement(&entity);
            let rows = match self.execute(cx, &statement).await {
                Outcome::Ok(rows) => rows,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            if let Err(e) = self.assign_identity(&entity, rows.generated_key) {
                return Outcome::Err(e);
            }
            self.inserted.push(entity);
            result.inserted += 1;
        }

        for entity in updates {
            let Some(statement) = update_statement(&entity) else {
                continue;
            };
            match self.execute(cx, &statement).await {
                Outcome::Ok(_) => entity.write().dirty.clear(),
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
            result.updated += 1;
        }

        tracing::debug!(
            session = %self.id,
            inserted = result.inserted,
            updated = result.updated,
            "flushed"
        );
        Outcome::Ok(result)
    }

    fn assign_identity(&mut self, entity: &Entity, generated: Option<Value>) -> Result<()> {
        {
            let mut data = entity.write();
            let pk = data.ty.primary_key;
            let explicit = data.fields.get(pk).filter(|v| !v.is_null()).cloned();
            let Some(key) = generated.or(explicit) else {
                return Err(Error::invalid_state(
                    StateErrorKind::MissingIdentity,
                    Some(data.state.as_str()),
                    format!("driver assigned no key to the new '{}' row", data.ty.table),
                ));
            };
            data.fields.insert(pk.to_string(), key.clone());
            data.key = Some(key);
        }
        self.tracker.transition(entity, StateEvent::Flushed)?;
        self.tracker.register_identity(entity)
    }

    /// Reload an entity from storage, discarding unflushed changes.
    ///
    /// Transient, pending and detached entities have nothing to reload
    /// from and fail with an invalid-state error.
    #[tracing::instrument(level = "debug", skip(self, cx, entity), fields(session = %self.id))]
    pub async fn refresh(&mut self, cx: &Cx, entity: &Entity) -> Outcome<(), Error> {
        if let Err(e) = self.ensure_active() {
            return Outcome::Err(e);
        }
        let state = entity.state();
        if matches!(
            state,
            EntityState::Transient | EntityState::Pending | EntityState::Detached
        ) {
            return Outcome::Err(Error::invalid_state(
                StateErrorKind::InvalidTransition,
                Some(state.as_str()),
                format!("cannot refresh a {} '{}' instance", state, entity.table()),
            ));
        }
        if let Err(e) = self.check_owned(entity) {
            return Outcome::Err(e);
        }
        self.reload(cx, entity, true).await
    }

    pub(crate) async fn reload(
        &mut self,
        cx: &Cx,
        entity: &Entity,
        discard_changes: bool,
    ) -> Outcome<(), Error> {
        let (ty, key) = {
            let data = entity.read();
            (data.ty, data.key.clone())
        };
        let Some(key) = key else {
            return Outcome::Err(Error::invalid_state(
                StateErrorKind::MissingIdentity,
                Some(entity.state().as_str()),
                format!("'{}' instance has no identity key", ty.table),
            ));
        };
        let statement = Statement::select(ty.table, Filter::eq(ty.primary_key, key.clone()));
        let rows = match self.execute(cx, &statement).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let Some(row) = rows.first() else {
            return Outcome::Err(Error::invalid_state(
                StateErrorKind::MissingIdentity,
                Some(entity.state().as_str()),
                format!("row for '{}' with key {} no longer exists", ty.table, key),
            ));
        };
        entity.populate(row_fields(row), discard_changes);
        match self.tracker.transition(entity, StateEvent::Reload) {
            Ok(_) => Outcome::Ok(()),
            Err(e) => Outcome::Err(e),
        }
    }

    /// Read an attribute, reloading the entity first if it is expired.
    pub async fn get(&mut self, cx: &Cx, entity: &Entity, field: &str) -> Outcome<Value, Error> {
        let state = entity.state();
        if state == EntityState::Detached {
            return Outcome::Err(Error::Detached(DetachedError {
                table: entity.table(),
                key: entity.key(),
            }));
        }
        if state == EntityState::Expired {
            if let Err(e) = self.ensure_active().and_then(|()| self.check_owned(entity)) {
                return Outcome::Err(e);
            }
            match self.reload(cx, entity, false).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        match entity.get(field) {
            Ok(value) => Outcome::Ok(value),
            Err(e) => Outcome::Err(e),
        }
    }

    /// Look up an entity by primary key, consulting the identity map first.
    pub async fn find(
        &mut self,
        cx: &Cx,
        ty: &'static EntityType,
        key: impl Into<Value>,
    ) -> Outcome<Option<Entity>, Error> {
        if let Err(e) = self.ensure_active() {
            return Outcome::Err(e);
        }
        let key = key.into();
        if let Some(entity) = self.tracker.lookup(ty.table, &key) {
            if entity.state() == EntityState::Expired {
                match self.reload(cx, &entity, false).await {
                    Outcome::Ok(()) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }
            return Outcome::Ok(Some(entity));
        }

        let statement = Statement::select(ty.table, Filter::eq(ty.primary_key, key));
        let rows = match self.execute(cx, &statement).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        match rows.first() {
            Some(row) => match self.materialize(ty, row_fields(row)) {
                Ok(entity) => Outcome::Ok(Some(entity)),
                Err(e) => Outcome::Err(e),
            },
            None => Outcome::Ok(None),
        }
    }

    /// Mark one managed entity for reload on next access.
    pub fn expire(&mut self, entity: &Entity) -> Result<()> {
        self.ensure_active()?;
        self.check_owned(entity)?;
        self.tracker.transition(entity, StateEvent::Expire).map(|_| ())
    }

    /// Expire every persistent entity.
    pub fn expire_all(&mut self) -> Result<()> {
        self.ensure_active()?;
        for entity in self.tracker.entities() {
            if entity.state() == EntityState::Persistent {
                self.tracker.transition(entity, StateEvent::Expire)?;
            }
        }
        Ok(())
    }

    /// Resolve a loaded row to the managed instance for its key, creating a
    /// persistent entity if none exists. An expired match is repopulated.
    pub(crate) fn materialize(
        &mut self,
        ty: &'static EntityType,
        fields: BTreeMap<String, Value>,
    ) -> Result<Entity> {
        let Some(key) = fields.get(ty.primary_key).filter(|v| !v.is_null()).cloned() else {
            return Err(Error::invalid_state(
                StateErrorKind::MissingIdentity,
                None,
                format!("row for '{}' has no '{}' value", ty.table, ty.primary_key),
            ));
        };
        if let Some(existing) = self.tracker.lookup(ty.table, &key) {
            if existing.state() == EntityState::Expired {
                existing.populate(fields, false);
                self.tracker.transition(&existing, StateEvent::Reload)?;
            }
            return Ok(existing);
        }
        let entity = Entity::loaded(ty, key, fields, self.id);
        self.tracker.manage(&entity);
        self.tracker.register_identity(&entity)?;
        Ok(entity)
    }

    // ========================================================================
    // N+1 Detection
    // ========================================================================

    /// Start counting lazy loads, warning at `threshold` per relationship.
    pub fn enable_n1_detection(&mut self, threshold: usize) {
        self.n1 = Some(N1QueryTracker::new(threshold));
    }

    pub fn disable_n1_detection(&mut self) {
        self.n1 = None;
    }

    pub fn n1_stats(&self) -> Option<N1Stats> {
        self.n1.as_ref().map(N1QueryTracker::stats)
    }

    /// Sampled lazy loads; empty when detection is off.
    pub fn n1_samples(&self) -> &[LoadSample] {
        match &self.n1 {
            Some(tracker) => tracker.samples(),
            None => &[],
        }
    }

    pub(crate) fn record_lazy_load(&mut self, parent: &Entity, relationship: &'static str) {
        if let Some(tracker) = &mut self.n1 {
            tracker.record_load(parent.table(), relationship, parent.key());
        }
    }

    // ========================================================================
    // Close
    // ========================================================================

    /// Roll back any open transaction, return the connection, and detach
    /// every managed entity. Closing twice is a no-op.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(session = %self.id))]
    pub async fn close(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.closed {
            return Outcome::Ok(());
        }
        let outcome = match self.tx.take() {
            Some(mut tx) => tx.rollback(cx).await,
            None => Outcome::Ok(()),
        };
        self.detach_all();
        outcome
    }

    fn detach_all(&mut self) {
        self.closed = true;
        self.inserted.clear();
        for entity in self.tracker.drain() {
            if let Err(e) = self.tracker.transition(&entity, StateEvent::Close) {
                tracing::debug!(session = %self.id, error = %e, "entity not detached");
            }
        }
        tracing::debug!(session = %self.id, "session closed");
    }
}

impl<D: Driver> Drop for Session<D> {
    fn drop(&mut self) {
        if !self.closed {
            self.detach_all();
        }
    }
}

impl<D: Driver> std::fmt::Debug for Session<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("scope", &self.scope)
            .field("connection", &self.connection_id())
            .field("entities", &self.tracker.len())
            .field("closed", &self.closed)
            .finish()
    }
}

/// Column values of a row, keyed by column name.
pub(crate) fn row_fields(row: &Row) -> BTreeMap<String, Value> {
    row.iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

fn insert_statement(entity: &Entity) -> Statement {
    let data = entity.read();
    let pk = data.ty.primary_key;
    let (columns, values): (Vec<String>, Vec<Value>) = data
        .fields
        .iter()
        .filter(|(name, value)| !(name.as_str() == pk && value.is_null()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .unzip();
    Statement::insert(data.ty.table, columns, values, Some(pk.to_string()))
}

fn update_statement(entity: &Entity) -> Option<Statement> {
    let data = entity.read();
    let key = data.key.clone()?;
    let (columns, values): (Vec<String>, Vec<Value>) = data
        .dirty
        .iter()
        .map(|name| {
            let value = data.fields.get(name).cloned().unwrap_or(Value::Null);
            (name.clone(), value)
        })
        .unzip();
    if columns.is_empty() {
        return None;
    }
    Some(Statement::Update {
        table: data.ty.table.to_string(),
        key_column: data.ty.primary_key.to_string(),
        key,
        columns,
        values,
    })
}
