//! Relationship loading.
//!
//! One-to-many relationships resolve in one of three ways, chosen per query:
//!
//! - **lazy**: the first [`Session::related`] call for a parent issues one
//!   query for that parent's children and caches the result on the parent.
//! - **select-in**: after the parents are loaded, a single `IN` query fetches
//!   the children of all of them, partitioned back by foreign key.
//! - **joined**: parents and children come back from one `LEFT OUTER JOIN`.
//!   Every child repeats its parent's row, so [`QueryResult::all`] may hold
//!   the same parent more than once; use [`QueryResult::unique`].
//!
//! All three produce the same parent to children associations. A resolved
//! relationship is not queried again until the parent is expired, reloaded,
//! or rolled back.

use crate::entity::{Entity, EntityType, RelationshipInfo};
use crate::session::{Session, row_fields};
use crate::tracker::EntityState;
use scopedb_core::{
    Cx, DetachedError, Driver, Error, Filter, Outcome, QueryErrorKind, Result, StateErrorKind,
    Statement, Value,
};
use std::collections::BTreeMap;

/// How to resolve a relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStrategy {
    Lazy,
    SelectIn,
    Joined,
}

/// A relationship load option for a [`Select`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Load {
    pub relationship: &'static str,
    pub strategy: LoadStrategy,
}

impl Load {
    pub fn lazy(relationship: &'static str) -> Self {
        Self {
            relationship,
            strategy: LoadStrategy::Lazy,
        }
    }

    pub fn select_in(relationship: &'static str) -> Self {
        Self {
            relationship,
            strategy: LoadStrategy::SelectIn,
        }
    }

    pub fn joined(relationship: &'static str) -> Self {
        Self {
            relationship,
            strategy: LoadStrategy::Joined,
        }
    }
}

/// A query for entities of one type, with relationship load options.
///
/// ```rust,ignore
/// let users = session
///     .select(&cx, &Select::new(&USER).load(Load::select_in("posts")))
///     .await?;
/// ```
#[derive(Debug, Clone)]
pub struct Select {
    ty: &'static EntityType,
    filter: Filter,
    order_by: Option<String>,
    loads: Vec<Load>,
}

impl Select {
    pub fn new(ty: &'static EntityType) -> Self {
        Self {
            ty,
            filter: Filter::All,
            order_by: None,
            loads: Vec::new(),
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    /// Order parents by a column. Joined loads return rows in the driver's
    /// join order instead.
    pub fn order_by(mut self, column: impl Into<String>) -> Self {
        self.order_by = Some(column.into());
        self
    }

    pub fn load(mut self, load: Load) -> Self {
        self.loads.push(load);
        self
    }

    pub fn entity_type(&self) -> &'static EntityType {
        self.ty
    }

    pub fn loads(&self) -> &[Load] {
        &self.loads
    }

    fn validate(&self) -> Result<Option<&'static RelationshipInfo>> {
        let mut joined = None;
        for load in &self.loads {
            let rel = relationship(self.ty, load.relationship)?;
            if load.strategy == LoadStrategy::Joined {
                if joined.is_some() {
                    return Err(Error::query(
                        QueryErrorKind::Unsupported,
                        None,
                        format!("at most one joined load per query on '{}'", self.ty.table),
                    ));
                }
                joined = Some(rel);
            }
        }
        Ok(joined)
    }

    fn statement(&self) -> Statement {
        let statement = Statement::select(self.ty.table, self.filter.clone());
        match &self.order_by {
            Some(column) => statement.ordered_by(column.clone()),
            None => statement.ordered_by(self.ty.primary_key),
        }
    }
}

/// Entities returned by [`Session::select`], one per result row.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    rows: Vec<Entity>,
}

impl QueryResult {
    /// Every row, including parents repeated by a joined load.
    pub fn all(self) -> Vec<Entity> {
        self.rows
    }

    /// Rows with repeated instances removed, keeping first occurrences.
    pub fn unique(self) -> Vec<Entity> {
        let mut seen: Vec<Entity> = Vec::with_capacity(self.rows.len());
        for entity in self.rows {
            if !seen.iter().any(|e| e.ptr_eq(&entity)) {
                seen.push(entity);
            }
        }
        seen
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.rows.iter()
    }
}

fn relationship(ty: &'static EntityType, name: &str) -> Result<&'static RelationshipInfo> {
    ty.relationship(name).ok_or_else(|| {
        Error::query(
            QueryErrorKind::NotFound,
            None,
            format!("'{}' has no relationship named '{}'", ty.table, name),
        )
    })
}

/// A parent must be loaded and managed by `session` before its children can be.
fn check_parent<D: Driver>(session: &Session<D>, parent: &Entity) -> Result<Value> {
    let state = parent.state();
    match state {
        EntityState::Detached => {
            return Err(Error::Detached(DetachedError {
                table: parent.table(),
                key: parent.key(),
            }));
        }
        EntityState::Transient | EntityState::Pending => {
            return Err(Error::invalid_state(
                StateErrorKind::MissingIdentity,
                Some(state.as_str()),
                format!(
                    "a {} '{}' instance has no identity to load relationships for",
                    state,
                    parent.table()
                ),
            ));
        }
        EntityState::Persistent | EntityState::Expired => {}
    }
    session.check_owned(parent)?;
    parent.key().ok_or_else(|| {
        Error::invalid_state(
            StateErrorKind::MissingIdentity,
            Some(state.as_str()),
            format!("'{}' instance has no identity key", parent.table()),
        )
    })
}

fn children_query(rel: &RelationshipInfo, filter: Filter) -> Statement {
    Statement::select(rel.target.table, filter).ordered_by(rel.target.primary_key)
}

/// Prefix unqualified filter columns with `table`.
fn qualify(filter: &Filter, table: &str) -> Filter {
    let qualified = |column: &str| {
        if column.contains('.') {
            column.to_string()
        } else {
            format!("{}.{}", table, column)
        }
    };
    match filter {
        Filter::All => Filter::All,
        Filter::Eq(column, value) => Filter::Eq(qualified(column), value.clone()),
        Filter::In(column, values) => Filter::In(qualified(column), values.clone()),
    }
}

/// Loads one-to-many relationships into a session.
#[derive(Debug, Clone, Copy, Default)]
pub struct RelationshipLoader;

impl RelationshipLoader {
    /// Resolve one parent's relationship, querying only if it is unresolved.
    pub async fn lazy<D: Driver>(
        session: &mut Session<D>,
        cx: &Cx,
        parent: &Entity,
        name: &str,
    ) -> Outcome<Vec<Entity>, Error> {
        let rel = match relationship(parent.entity_type(), name) {
            Ok(rel) => rel,
            Err(e) => return Outcome::Err(e),
        };
        let key = match check_parent(session, parent) {
            Ok(key) => key,
            Err(e) => return Outcome::Err(e),
        };
        if parent.state() == EntityState::Expired {
            match session.reload(cx, parent, false).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        if let Some(children) = parent.loaded_related(rel.name) {
            return Outcome::Ok(children);
        }

        let statement = children_query(rel, Filter::eq(rel.foreign_key, key));
        let rows = match session.execute(cx, &statement).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let mut children = Vec::with_capacity(rows.len());
        for row in &rows.rows {
            match session.materialize(rel.target, row_fields(row)) {
                Ok(child) => children.push(child),
                Err(e) => return Outcome::Err(e),
            }
        }
        parent.resolve(rel.name, children.clone());
        session.record_lazy_load(parent, rel.name);
        Outcome::Ok(children)
    }

    /// Resolve a relationship for many parents with one `IN` query.
    ///
    /// Parents that already have it resolved are skipped; if none remain,
    /// nothing is queried. Parents without children resolve to an empty list.
    pub async fn select_in<D: Driver>(
        session: &mut Session<D>,
        cx: &Cx,
        parents: &[Entity],
        name: &str,
    ) -> Outcome<(), Error> {
        let Some(first) = parents.first() else {
            return Outcome::Ok(());
        };
        let ty = first.entity_type();
        let rel = match relationship(ty, name) {
            Ok(rel) => rel,
            Err(e) => return Outcome::Err(e),
        };

        let mut targets: Vec<(&Entity, Value)> = Vec::new();
        for parent in parents {
            if !parent.entity_type().same_as(ty) {
                return Outcome::Err(Error::Custom(format!(
                    "select-in parents must all be '{}' instances, found '{}'",
                    ty.table,
                    parent.table()
                )));
            }
            let key = match check_parent(session, parent) {
                Ok(key) => key,
                Err(e) => return Outcome::Err(e),
            };
            if parent.relation(rel.name).is_resolved()
                || targets.iter().any(|(p, _)| p.ptr_eq(parent))
            {
                continue;
            }
            targets.push((parent, key));
        }
        if targets.is_empty() {
            return Outcome::Ok(());
        }

        let mut keys: Vec<Value> = Vec::with_capacity(targets.len());
        for (_, key) in &targets {
            if !keys.iter().any(|k| k.sql_eq(key)) {
                keys.push(key.clone());
            }
        }
        let statement = children_query(rel, Filter::in_list(rel.foreign_key, keys));
        let rows = match session.execute(cx, &statement).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        let mut loaded: Vec<(Value, Entity)> = Vec::with_capacity(rows.len());
        for row in &rows.rows {
            let fk = row.get_by_name(rel.foreign_key).cloned().unwrap_or(Value::Null);
            match session.materialize(rel.target, row_fields(row)) {
                Ok(child) => loaded.push((fk, child)),
                Err(e) => return Outcome::Err(e),
            }
        }
        for (parent, key) in &targets {
            let children: Vec<Entity> = loaded
                .iter()
                .filter(|(fk, _)| fk.sql_eq(key))
                .map(|(_, child)| child.clone())
                .collect();
            parent.resolve(rel.name, children);
        }

        tracing::info!(
            table = ty.table,
            relationship = rel.name,
            parents = targets.len(),
            children = loaded.len(),
            "select-in load"
        );
        Outcome::Ok(())
    }

    /// Run a select with one joined relationship. Returns one parent per row.
    async fn joined<D: Driver>(
        session: &mut Session<D>,
        cx: &Cx,
        select: &Select,
        rel: &'static RelationshipInfo,
    ) -> Outcome<Vec<Entity>, Error> {
        let ty = select.ty;
        let statement = Statement::SelectJoined {
            parent: ty.table.to_string(),
            parent_key: ty.primary_key.to_string(),
            child: rel.target.table.to_string(),
            foreign_key: rel.foreign_key.to_string(),
            filter: qualify(&select.filter, ty.table),
        };
        let rows = match session.execute(cx, &statement).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        let mut parents = Vec::with_capacity(rows.len());
        let mut groups: Vec<(Entity, Vec<Entity>)> = Vec::new();
        for row in &rows.rows {
            let parent_fields: BTreeMap<String, Value> = row
                .qualified(ty.table)
                .map(|(name, value)| (name.to_string(), value.clone()))
                .collect();
            let parent = match session.materialize(ty, parent_fields) {
                Ok(parent) => parent,
                Err(e) => return Outcome::Err(e),
            };
            parents.push(parent.clone());

            let index = match groups.iter().position(|(p, _)| p.ptr_eq(&parent)) {
                Some(index) => index,
                None => {
                    groups.push((parent, Vec::new()));
                    groups.len() - 1
                }
            };
            let child_fields: BTreeMap<String, Value> = row
                .qualified(rel.target.table)
                .map(|(name, value)| (name.to_string(), value.clone()))
                .collect();
            let outer_null = child_fields
                .get(rel.target.primary_key)
                .is_none_or(Value::is_null);
            if outer_null {
                continue;
            }
            let child = match session.materialize(rel.target, child_fields) {
                Ok(child) => child,
                Err(e) => return Outcome::Err(e),
            };
            let children = &mut groups[index].1;
            if !children.iter().any(|c| c.ptr_eq(&child)) {
                children.push(child);
            }
        }
        for (parent, children) in groups {
            parent.resolve(rel.name, children);
        }
        Outcome::Ok(parents)
    }
}

impl<D: Driver> Session<D> {
    /// Run a [`Select`], applying its relationship loads.
    #[tracing::instrument(level = "debug", skip(self, cx, select), fields(table = select.entity_type().table))]
    pub async fn select(&mut self, cx: &Cx, select: &Select) -> Outcome<QueryResult, Error> {
        let joined = match select.validate() {
            Ok(joined) => joined,
            Err(e) => return Outcome::Err(e),
        };

        let rows = match joined {
            Some(rel) => match RelationshipLoader::joined(self, cx, select, rel).await {
                Outcome::Ok(rows) => rows,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            },
            None => {
                let result = match self.execute(cx, &select.statement()).await {
                    Outcome::Ok(rows) => rows,
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                };
                let mut rows = Vec::with_capacity(result.len());
                for row in &result.rows {
                    match self.materialize(select.ty, row_fields(row)) {
                        Ok(entity) => rows.push(entity),
                        Err(e) => return Outcome::Err(e),
                    }
                }
                rows
            }
        };

        let result = QueryResult { rows };
        let batched: Vec<&Load> = select
            .loads
            .iter()
            .filter(|l| l.strategy == LoadStrategy::SelectIn)
            .collect();
        if !batched.is_empty() {
            let parents = result.clone().unique();
            for load in batched {
                match RelationshipLoader::select_in(self, cx, &parents, load.relationship).await {
                    Outcome::Ok(()) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }
        }
        Outcome::Ok(result)
    }

    /// Related entities of `parent`, loading them on first access.
    pub async fn related(
        &mut self,
        cx: &Cx,
        parent: &Entity,
        relationship: &str,
    ) -> Outcome<Vec<Entity>, Error> {
        RelationshipLoader::lazy(self, cx, parent, relationship).await
    }

    /// Batch-load a relationship for already loaded parents.
    pub async fn load_related(
        &mut self,
        cx: &Cx,
        parents: &[Entity],
        relationship: &str,
    ) -> Outcome<(), Error> {
        RelationshipLoader::select_in(self, cx, parents, relationship).await
    }
}
