//! Entity lifecycle state machine and the per-session identity map.

use crate::entity::Entity;
use scopedb_core::{Error, Result, StateErrorKind, Value};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-unique session identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

impl SessionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SESSION.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// Lifecycle state of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityState {
    /// Not associated with any session.
    Transient,
    /// Added to a session, not yet flushed.
    Pending,
    /// Flushed, with a loaded identity and attributes.
    Persistent,
    /// Attributes must be reloaded before the next access.
    Expired,
    /// Its session has closed.
    Detached,
}

impl EntityState {
    pub const fn as_str(self) -> &'static str {
        match self {
            EntityState::Transient => "transient",
            EntityState::Pending => "pending",
            EntityState::Persistent => "persistent",
            EntityState::Expired => "expired",
            EntityState::Detached => "detached",
        }
    }
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that happened to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    Add,
    Flushed,
    Commit { expire_on_commit: bool },
    Expire,
    Reload,
    /// The transaction rolled back under a persistent entity.
    Rollback,
    /// Forget an entity whose insert never became durable.
    Discard,
    Close,
    /// A detached entity re-added to a live session.
    Attach,
}

impl StateEvent {
    fn name(self) -> &'static str {
        match self {
            StateEvent::Add => "add",
            StateEvent::Flushed => "flush",
            StateEvent::Commit { .. } => "commit",
            StateEvent::Expire => "expire",
            StateEvent::Reload => "reload",
            StateEvent::Rollback => "rollback",
            StateEvent::Discard => "discard",
            StateEvent::Close => "close",
            StateEvent::Attach => "attach",
        }
    }
}

/// The transition table. `None` means the event is illegal in `from`.
pub fn next_state(from: EntityState, event: StateEvent) -> Option<EntityState> {
    use EntityState::{Detached, Expired, Pending, Persistent, Transient};
    match (from, event) {
        (Transient, StateEvent::Add) => Some(Pending),
        (Pending, StateEvent::Flushed) => Some(Persistent),
        (Persistent | Expired, StateEvent::Flushed) => Some(from),
        (Persistent, StateEvent::Commit { expire_on_commit }) => {
            Some(if expire_on_commit { Expired } else { Persistent })
        }
        (Expired, StateEvent::Commit { .. }) => Some(Expired),
        (Persistent | Expired, StateEvent::Expire) => Some(Expired),
        (Persistent | Expired, StateEvent::Reload) => Some(Persistent),
        (Persistent | Expired, StateEvent::Rollback) => Some(Expired),
        (Pending | Persistent | Expired, StateEvent::Discard) => Some(Transient),
        (Pending, StateEvent::Close) => Some(Transient),
        (Persistent | Expired, StateEvent::Close) => Some(Detached),
        (Detached, StateEvent::Attach) => Some(Expired),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ObjectKey {
    table: &'static str,
    key_hash: u64,
}

impl ObjectKey {
    fn new(table: &'static str, key: &Value) -> Self {
        let mut hasher = DefaultHasher::new();
        key.hash_key(&mut hasher);
        Self {
            table,
            key_hash: hasher.finish(),
        }
    }
}

/// Entities managed by one session, in the order they became managed,
/// plus an identity map from `(table, key)` to the managed instance.
#[derive(Debug, Default)]
pub struct EntityStateTracker {
    entities: Vec<Entity>,
    identity: HashMap<ObjectKey, Vec<Entity>>,
}

impl EntityStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start managing an entity. Returns false if it already was.
    pub fn manage(&mut self, entity: &Entity) -> bool {
        if self.contains(entity) {
            return false;
        }
        self.entities.push(entity.clone());
        true
    }

    pub fn contains(&self, entity: &Entity) -> bool {
        self.entities.iter().any(|e| e.ptr_eq(entity))
    }

    /// Register an identity for an entity that already has its key.
    pub fn register_identity(&mut self, entity: &Entity) -> Result<()> {
        let (table, key) = {
            let data = entity.read();
            let Some(key) = data.key.clone() else {
                return Err(Error::invalid_state(
                    StateErrorKind::MissingIdentity,
                    Some(data.state.as_str()),
                    format!("'{}' instance has no identity key", data.ty.table),
                ));
            };
            (data.ty.table, key)
        };
        if let Some(existing) = self.lookup(table, &key) {
            if existing.ptr_eq(entity) {
                return Ok(());
            }
            return Err(Error::invalid_state(
                StateErrorKind::DuplicateIdentity,
                Some(entity.state().as_str()),
                format!(
                    "another '{}' instance with key {} is already in this session",
                    table, key
                ),
            ));
        }
        self.identity
            .entry(ObjectKey::new(table, &key))
            .or_default()
            .push(entity.clone());
        Ok(())
    }

    /// Find the managed instance for `(table, key)`.
    pub fn lookup(&self, table: &'static str, key: &Value) -> Option<Entity> {
        self.identity
            .get(&ObjectKey::new(table, key))?
            .iter()
            .find(|e| e.read().key.as_ref().is_some_and(|k| k.sql_eq(key)))
            .cloned()
    }

    /// Stop managing an entity and drop its identity entry.
    pub fn remove(&mut self, entity: &Entity) {
        self.entities.retain(|e| !e.ptr_eq(entity));
        self.forget_identity(entity);
    }

    fn forget_identity(&mut self, entity: &Entity) {
        let Some(key) = entity.key() else {
            return;
        };
        let slot = ObjectKey::new(entity.table(), &key);
        if let Some(bucket) = self.identity.get_mut(&slot) {
            bucket.retain(|e| !e.ptr_eq(entity));
            if bucket.is_empty() {
                self.identity.remove(&slot);
            }
        }
    }

    /// Remove and return every managed entity.
    pub fn drain(&mut self) -> Vec<Entity> {
        self.identity.clear();
        std::mem::take(&mut self.entities)
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Apply an event to an entity.
    ///
    /// Expiration (including expire-on-commit), reload, rollback and discard
    /// invalidate resolved relationships; discard also clears the identity
    /// key so the entity can be inserted again.
    pub fn transition(&self, entity: &Entity, event: StateEvent) -> Result<EntityState> {
        let mut data = entity.write();
        let from = data.state;
        let Some(to) = next_state(from, event) else {
            return Err(Error::invalid_state(
                StateErrorKind::InvalidTransition,
                Some(from.as_str()),
                format!(
                    "cannot {} a {} '{}' instance",
                    event.name(),
                    from,
                    data.ty.table
                ),
            ));
        };
        match event {
            StateEvent::Expire | StateEvent::Reload => data.relations.clear(),
            StateEvent::Commit { .. } if to == EntityState::Expired => data.relations.clear(),
            StateEvent::Rollback => {
                data.relations.clear();
                data.dirty.clear();
            }
            StateEvent::Discard => {
                data.relations.clear();
                data.dirty.clear();
                data.session = None;
                if data.key.is_some() {
                    let pk = data.ty.primary_key;
                    data.fields.remove(pk);
                    data.key = None;
                }
            }
            StateEvent::Close if to == EntityState::Transient => data.session = None,
            _ => {}
        }
        data.state = to;
        tracing::debug!(
            table = data.ty.table,
            key = ?data.key,
            from = from.as_str(),
            to = to.as_str(),
            event = event.name(),
            "entity state transition"
        );
        Ok(to)
    }
}
