//! Entities and their static type descriptions.
//!
//! An [`Entity`] is a shared handle (`Arc<RwLock<..>>`) to one row's worth of
//! field values plus the lifecycle state the owning session tracks for it.
//! Cloning an `Entity` clones the handle, not the data: the session's
//! identity map and every caller see the same instance.

use crate::tracker::{EntityState, SessionId};
use scopedb_core::{DetachedError, Error, Result, StateErrorKind, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A one-to-many relationship declared on an entity type.
#[derive(Debug, Clone, Copy)]
pub struct RelationshipInfo {
    /// Relationship name used for lookups and loads
    pub name: &'static str,
    /// The "many" side
    pub target: &'static EntityType,
    /// Column on `target` that references the parent's primary key
    pub foreign_key: &'static str,
}

impl RelationshipInfo {
    pub const fn one_to_many(
        name: &'static str,
        target: &'static EntityType,
        foreign_key: &'static str,
    ) -> Self {
        Self {
            name,
            target,
            foreign_key,
        }
    }
}

/// Static description of a mapped table.
///
/// ```rust,ignore
/// static POST: EntityType = EntityType::new("posts", "id");
/// static USER_RELATIONS: [RelationshipInfo; 1] =
///     [RelationshipInfo::one_to_many("posts", &POST, "user_id")];
/// static USER: EntityType = EntityType::new("users", "id").with_relationships(&USER_RELATIONS);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct EntityType {
    pub table: &'static str,
    pub primary_key: &'static str,
    pub relationships: &'static [RelationshipInfo],
}

impl EntityType {
    pub const fn new(table: &'static str, primary_key: &'static str) -> Self {
        Self {
            table,
            primary_key,
            relationships: &[],
        }
    }

    pub const fn with_relationships(mut self, relationships: &'static [RelationshipInfo]) -> Self {
        self.relationships = relationships;
        self
    }

    /// Find a relationship by name.
    pub fn relationship(&self, name: &str) -> Option<&'static RelationshipInfo> {
        self.relationships.iter().find(|r| r.name == name)
    }

    pub fn same_as(&self, other: &EntityType) -> bool {
        self.table == other.table
    }
}

/// Resolution state of one relationship on one entity.
#[derive(Debug, Clone, Default)]
pub enum Relation {
    #[default]
    Unresolved,
    Resolved(Vec<Entity>),
}

impl Relation {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Relation::Resolved(_))
    }
}

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

pub(crate) struct EntityData {
    pub(crate) instance: u64,
    pub(crate) ty: &'static EntityType,
    pub(crate) key: Option<Value>,
    pub(crate) fields: BTreeMap<String, Value>,
    pub(crate) dirty: BTreeSet<String>,
    pub(crate) state: EntityState,
    pub(crate) session: Option<SessionId>,
    pub(crate) relations: HashMap<&'static str, Relation>,
}

/// A mapped row tracked through its lifecycle.
#[derive(Clone)]
pub struct Entity {
    inner: Arc<RwLock<EntityData>>,
}

impl Entity {
    /// Create a transient entity with no fields set.
    pub fn new(ty: &'static EntityType) -> Self {
        Self::from_data(EntityData {
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            ty,
            key: None,
            fields: BTreeMap::new(),
            dirty: BTreeSet::new(),
            state: EntityState::Transient,
            session: None,
            relations: HashMap::new(),
        })
    }

    /// Builder-style field assignment for transient entities.
    #[must_use]
    pub fn with(self, field: &str, value: impl Into<Value>) -> Self {
        self.write().fields.insert(field.to_string(), value.into());
        self
    }

    /// An entity materialized from storage: persistent from the start.
    pub(crate) fn loaded(
        ty: &'static EntityType,
        key: Value,
        fields: BTreeMap<String, Value>,
        session: SessionId,
    ) -> Self {
        Self::from_data(EntityData {
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            ty,
            key: Some(key),
            fields,
            dirty: BTreeSet::new(),
            state: EntityState::Persistent,
            session: Some(session),
            relations: HashMap::new(),
        })
    }

    fn from_data(data: EntityData) -> Self {
        Self {
            inner: Arc::new(RwLock::new(data)),
        }
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, EntityData> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, EntityData> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn entity_type(&self) -> &'static EntityType {
        self.read().ty
    }

    pub fn table(&self) -> &'static str {
        self.read().ty.table
    }

    /// Identity key; `None` until the entity is flushed.
    pub fn key(&self) -> Option<Value> {
        self.read().key.clone()
    }

    pub fn state(&self) -> EntityState {
        self.read().state
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.read().session
    }

    /// Do both handles refer to the same instance?
    pub fn ptr_eq(&self, other: &Entity) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Read a field without touching storage.
    ///
    /// Fails with a detached-entity error once the owning session has
    /// closed, and with an `Expired` state error when the entity must be
    /// reloaded first (use `Session::get`, which reloads). Unset fields
    /// read as `Null`.
    pub fn get(&self, field: &str) -> Result<Value> {
        let data = self.read();
        match data.state {
            EntityState::Detached => Err(Error::Detached(DetachedError {
                table: data.ty.table,
                key: data.key.clone(),
            })),
            EntityState::Expired => Err(Error::invalid_state(
                StateErrorKind::Expired,
                Some(data.state.as_str()),
                format!(
                    "attributes of '{}' were expired; load them through the session",
                    data.ty.table
                ),
            )),
            _ => Ok(data.fields.get(field).cloned().unwrap_or(Value::Null)),
        }
    }

    /// Assign a field.
    ///
    /// On persistent and expired entities the field is marked dirty and
    /// written by the next flush. The primary key can only be assigned
    /// before the entity has an identity.
    pub fn set(&self, field: &str, value: impl Into<Value>) -> Result<()> {
        let mut data = self.write();
        if field == data.ty.primary_key && data.key.is_some() {
            return Err(Error::invalid_state(
                StateErrorKind::InvalidTransition,
                Some(data.state.as_str()),
                format!("primary key of '{}' cannot change once assigned", data.ty.table),
            ));
        }
        data.fields.insert(field.to_string(), value.into());
        if data.key.is_some() {
            data.dirty.insert(field.to_string());
        }
        Ok(())
    }

    /// Has this entity unflushed field changes?
    pub fn is_dirty(&self) -> bool {
        !self.read().dirty.is_empty()
    }

    /// Relationship resolution state without loading anything.
    pub fn relation(&self, name: &str) -> Relation {
        self.read()
            .relations
            .iter()
            .find(|(n, _)| **n == name)
            .map(|(_, r)| r.clone())
            .unwrap_or_default()
    }

    /// Already-loaded related entities, if the relationship is resolved.
    pub fn loaded_related(&self, name: &str) -> Option<Vec<Entity>> {
        match self.relation(name) {
            Relation::Resolved(children) => Some(children),
            Relation::Unresolved => None,
        }
    }

    /// Resolve a relationship unless it already is. Returns whether it was set.
    pub(crate) fn resolve(&self, name: &'static str, children: Vec<Entity>) -> bool {
        let mut data = self.write();
        let slot = data.relations.entry(name).or_default();
        if slot.is_resolved() {
            return false;
        }
        *slot = Relation::Resolved(children);
        true
    }

    /// Replace loaded column values. Dirty columns keep their pending values
    /// unless `discard_changes` is set.
    pub(crate) fn populate(&self, fields: BTreeMap<String, Value>, discard_changes: bool) {
        let mut data = self.write();
        if discard_changes {
            data.dirty.clear();
        }
        for (name, value) in fields {
            if !data.dirty.contains(&name) {
                data.fields.insert(name, value);
            }
        }
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.read();
        f.debug_struct("Entity")
            .field("table", &data.ty.table)
            .field("instance", &data.instance)
            .field("key", &data.key)
            .field("state", &data.state)
            .finish()
    }
}
