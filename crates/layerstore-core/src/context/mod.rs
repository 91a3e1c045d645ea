//! Working contexts
//!
//! A `WorkingContext` stages record changes until it is saved. Saving a child
//! folds its changes into its parent's pending set; saving the root commits
//! them to the bound store. Reads fall through the chain: a context answers
//! from its own pending changes first, then asks its parent (or the store).
//!
//! Each context is confined to its own serial domain. Public operations are
//! dispatched onto that domain and waited for, so a context can be shared
//! freely between threads while its state is only ever touched from one.
//! Calls only ever wait on a context's ancestors, never its children, so work
//! running on a parent's domain must not block on a child's save.
//!
//! ```ignore
//! let child = stack.new_scoped_child_context()?;
//! child.insert("Book", "dune", &json!({"title": "Dune"}))?;
//! child.save()?;                 // now visible in the main context
//! stack.save_changes(|e| eprintln!("{e}"));
//! ```

mod domain;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::error::ContextError;
use crate::record::{Change, ChangeSet, Record, RecordKey};
use crate::storage::SqliteStore;
use domain::Domain;

/// How a context's domain is scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confinement {
    /// The stack's single foreground domain
    MainQueue,
    /// A background domain owned by the context
    PrivateQueue,
}

/// Where a context's saves go. A context has either a parent or a store, never both.
enum Upstream {
    Parent(WorkingContext),
    Store(OnceLock<Mutex<SqliteStore>>),
}

struct ContextInner {
    id: Uuid,
    name: String,
    confinement: Confinement,
    upstream: Upstream,
    domain: Domain,
    pending: Mutex<ChangeSet>,
}

/// A staging area for record changes
///
/// Cloning is cheap and yields another handle to the same context.
#[derive(Clone)]
pub struct WorkingContext {
    inner: Arc<ContextInner>,
}

impl WorkingContext {
    /// Create a root context; it becomes usable once a store is bound
    pub(crate) fn root(name: impl Into<String>) -> Result<Self, ContextError> {
        Self::build(name.into(), Confinement::PrivateQueue, Upstream::Store(OnceLock::new()))
    }

    /// Create a context whose saves go into `parent`
    pub(crate) fn child(
        name: impl Into<String>,
        confinement: Confinement,
        parent: &WorkingContext,
    ) -> Result<Self, ContextError> {
        Self::build(name.into(), confinement, Upstream::Parent(parent.clone()))
    }

    fn build(
        name: String,
        confinement: Confinement,
        upstream: Upstream,
    ) -> Result<Self, ContextError> {
        let domain = Domain::spawn(name.clone())?;
        Ok(Self {
            inner: Arc::new(ContextInner {
                id: Uuid::new_v4(),
                name,
                confinement,
                upstream,
                domain,
                pending: Mutex::new(ChangeSet::new()),
            }),
        })
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn confinement(&self) -> Confinement {
        self.inner.confinement
    }

    /// The context this one saves into, if it isn't the root
    pub fn parent(&self) -> Option<&WorkingContext> {
        match &self.inner.upstream {
            Upstream::Parent(parent) => Some(parent),
            Upstream::Store(_) => None,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent().is_none()
    }

    /// Whether a store has been bound (always false for non-root contexts)
    pub fn has_store(&self) -> bool {
        matches!(&self.inner.upstream, Upstream::Store(slot) if slot.get().is_some())
    }

    /// Whether both handles refer to the same context
    pub fn ptr_eq(&self, other: &WorkingContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether there are unsaved changes
    pub fn has_changes(&self) -> bool {
        !self.pending().is_empty()
    }

    /// Number of records with unsaved changes
    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// Queue `work` on this context's domain and return immediately
    pub fn perform<F>(&self, work: F) -> Result<(), ContextError>
    where
        F: FnOnce(&WorkingContext) + Send + 'static,
    {
        let ctx = self.clone();
        self.inner.domain.dispatch(move || work(&ctx))
    }

    /// Run `work` on this context's domain and wait for its result
    pub fn perform_and_wait<F, R>(&self, work: F) -> Result<R, ContextError>
    where
        F: FnOnce(&WorkingContext) -> R + Send + 'static,
        R: Send + 'static,
    {
        let ctx = self.clone();
        self.inner.domain.dispatch_and_wait(move || work(&ctx))
    }

    /// Stage an insert or replacement of `entity/id`
    pub fn insert<T: Serialize>(
        &self,
        entity: &str,
        id: &str,
        value: &T,
    ) -> Result<(), ContextError> {
        let key = RecordKey::new(entity, id);
        let body = serde_json::to_value(value)?;
        self.run(move |ctx| {
            ctx.pending().upsert(key, body);
            Ok(())
        })
    }

    /// Stage a new record under a generated id and return the id
    pub fn insert_new<T: Serialize>(
        &self,
        entity: &str,
        value: &T,
    ) -> Result<String, ContextError> {
        let id = Uuid::new_v4().to_string();
        self.insert(entity, &id, value)?;
        Ok(id)
    }

    /// Stage removal of `entity/id`
    pub fn delete(&self, entity: &str, id: &str) -> Result<(), ContextError> {
        let key = RecordKey::new(entity, id);
        self.run(move |ctx| {
            ctx.pending().delete(key);
            Ok(())
        })
    }

    /// Read `entity/id` as this context sees it
    pub fn get(&self, entity: &str, id: &str) -> Result<Option<Value>, ContextError> {
        let key = RecordKey::new(entity, id);
        self.run(move |ctx| ctx.lookup(&key))
    }

    /// Read `entity/id` and deserialize it
    pub fn get_as<T: DeserializeOwned>(
        &self,
        entity: &str,
        id: &str,
    ) -> Result<Option<T>, ContextError> {
        self.get(entity, id)?
            .map(serde_json::from_value)
            .transpose()
            .map_err(ContextError::from)
    }

    /// Every record of `entity` as this context sees it, ordered by id
    pub fn fetch_all(&self, entity: &str) -> Result<Vec<Record>, ContextError> {
        Ok(self
            .snapshot(entity.to_string())?
            .into_iter()
            .map(|(id, body)| Record {
                entity: entity.to_string(),
                id,
                body,
            })
            .collect())
    }

    /// Number of records of `entity` as this context sees it
    pub fn count(&self, entity: &str) -> Result<usize, ContextError> {
        Ok(self.snapshot(entity.to_string())?.len())
    }

    /// Discard all unsaved changes
    pub fn rollback(&self) -> Result<(), ContextError> {
        self.run(|ctx| {
            ctx.pending().clear();
            Ok(())
        })
    }

    /// Push pending changes one level up
    ///
    /// A child's changes are validated against the model and merged into its
    /// parent; the root's are committed to the store. On failure the changes
    /// stay pending here.
    pub fn save(&self) -> Result<(), ContextError> {
        self.run(|ctx| ctx.save_here())
    }

    /// Attach the storage engine to a root context
    pub(crate) fn bind_store(&self, store: SqliteStore) -> Result<(), ContextError> {
        self.run(move |ctx| match &ctx.inner.upstream {
            Upstream::Store(slot) => slot
                .set(Mutex::new(store))
                .map_err(|_| ContextError::StoreAlreadyBound(ctx.name().to_string())),
            Upstream::Parent(_) => Err(ContextError::NotRoot(ctx.name().to_string())),
        })
    }

    fn run<F, R>(&self, work: F) -> Result<R, ContextError>
    where
        F: FnOnce(&WorkingContext) -> Result<R, ContextError> + Send + 'static,
        R: Send + 'static,
    {
        self.perform_and_wait(work)?
    }

    fn pending(&self) -> MutexGuard<'_, ChangeSet> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn store(&self) -> Result<MutexGuard<'_, SqliteStore>, ContextError> {
        match &self.inner.upstream {
            Upstream::Store(slot) => {
                let store = slot.get().ok_or(ContextError::StoreNotBound)?;
                Ok(store.lock().unwrap_or_else(PoisonError::into_inner))
            }
            Upstream::Parent(_) => Err(ContextError::NotRoot(self.name().to_string())),
        }
    }

    // The methods below run on this context's own domain.

    fn lookup(&self, key: &RecordKey) -> Result<Option<Value>, ContextError> {
        let staged = self.pending().get(key).cloned();
        match staged {
            Some(Change::Upsert(body)) => Ok(Some(body)),
            Some(Change::Delete) => Ok(None),
            None => match &self.inner.upstream {
                Upstream::Parent(parent) => {
                    let key = key.clone();
                    parent.run(move |p| p.lookup(&key))
                }
                Upstream::Store(_) => Ok(self.store()?.fetch(key)?),
            },
        }
    }

    fn snapshot(&self, entity: String) -> Result<BTreeMap<String, Value>, ContextError> {
        self.run(move |ctx| {
            let mut records = match &ctx.inner.upstream {
                Upstream::Parent(parent) => parent.snapshot(entity.clone())?,
                Upstream::Store(_) => ctx.store()?.fetch_all(&entity)?,
            };
            ctx.pending().overlay(&entity, &mut records);
            Ok(records)
        })
    }

    fn validate(&self, changes: ChangeSet) -> Result<(), ContextError> {
        self.run(move |ctx| match &ctx.inner.upstream {
            Upstream::Parent(parent) => parent.validate(changes),
            Upstream::Store(_) => ctx.store()?.model().validate(&changes),
        })
    }

    fn absorb(&self, changes: ChangeSet) -> Result<(), ContextError> {
        self.run(move |ctx| {
            match &ctx.inner.upstream {
                Upstream::Parent(parent) => parent.validate(changes.clone())?,
                Upstream::Store(_) => ctx.store()?.model().validate(&changes)?,
            }
            ctx.pending().merge(changes);
            Ok(())
        })
    }

    fn save_here(&self) -> Result<(), ContextError> {
        let changes = self.pending().clone();
        if changes.is_empty() {
            return Ok(());
        }

        let count = changes.len();
        match &self.inner.upstream {
            Upstream::Parent(parent) => parent.absorb(changes)?,
            Upstream::Store(_) => {
                let mut store = self.store()?;
                store.model().validate(&changes)?;
                store.commit(&changes)?;
            }
        }

        self.pending().clear();
        debug!("Saved {} change(s) from context '{}'", count, self.name());
        Ok(())
    }
}

impl PartialEq for WorkingContext {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for WorkingContext {}

impl fmt::Debug for WorkingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkingContext")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("confinement", &self.inner.confinement)
            .field("root", &self.is_root())
            .field("pending", &self.pending_count())
            .finish()
    }
}
