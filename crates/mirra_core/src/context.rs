//! Contexts and the store.
//!
//! A [`Context`] is a logical scope owning an entity arena, an identity map
//! and an operation registry. Contexts nest: a nested context has its own
//! map and registry, so identical keys resolve to different entities in
//! different contexts. Destroying a context destroys its nested contexts
//! first, then every entity it owns, then cancels whatever work remains.
//!
//! ```no_run
//! # async fn demo(remote: mirra_protocol::RemoteServices) -> mirra_core::SyncResult<()> {
//! use mirra_core::{LoadOptions, Store, StoreConfig};
//!
//! let store = Store::new(StoreConfig::default(), remote)?;
//! let duck = store.doc("ducks/yellow")?;
//! assert!(std::sync::Arc::ptr_eq(&duck, &store.doc("ducks/yellow")?));
//!
//! duck.load(LoadOptions::default()).await?;
//! store.settle().await;
//! # Ok(())
//! # }
//! ```

use crate::auth::Auth;
use crate::config::StoreConfig;
use crate::document::{Document, DocumentInit};
use crate::entity::{downcast, Entity, EntitySeed};
use crate::error::{SyncError, SyncResult};
use crate::identity::{IdentityKey, IdentityMap};
use crate::lifecycle::{EntityId, Lifecycle};
use crate::operation::Operations;
use crate::query::{Query, QueryInit};
use crate::storage::Storage;
use mirra_protocol::RemoteServices;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tracing::{debug, trace};

struct ContextState {
    tree: Lifecycle<Arc<dyn Entity>>,
    identity: IdentityMap,
}

pub(crate) struct ContextInner {
    config: StoreConfig,
    remote: RemoteServices,
    operations: Operations,
    state: Mutex<ContextState>,
    nested: Mutex<BTreeMap<String, Arc<ContextInner>>>,
    parent: Weak<ContextInner>,
    destroyed: AtomicBool,
    me: Weak<ContextInner>,
}

impl ContextInner {
    fn new(
        config: StoreConfig,
        remote: RemoteServices,
        runtime: Handle,
        parent: Weak<ContextInner>,
    ) -> Arc<Self> {
        debug!(context = %config.identifier, "context created");
        Arc::new_cyclic(|me| Self {
            operations: Operations::new(config.identifier.clone(), runtime),
            config,
            remote,
            state: Mutex::new(ContextState {
                tree: Lifecycle::new(),
                identity: IdentityMap::new(),
            }),
            nested: Mutex::new(BTreeMap::new()),
            parent,
            destroyed: AtomicBool::new(false),
            me: me.clone(),
        })
    }

    pub(crate) fn identifier(&self) -> &str {
        &self.config.identifier
    }

    pub(crate) fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub(crate) fn remote(&self) -> &RemoteServices {
        &self.remote
    }

    pub(crate) fn operations(&self) -> &Operations {
        &self.operations
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_live(&self) -> SyncResult<()> {
        if self.is_destroyed() {
            return Err(SyncError::context_destroyed(self.identifier()));
        }
        Ok(())
    }

    /// Returns the entity registered under `key`, or builds one with
    /// `factory` and registers it atomically.
    ///
    /// `factory` runs under the entity lock and must not call back into the
    /// context.
    pub(crate) fn resolve<E: Entity + 'static>(
        &self,
        key: Option<IdentityKey>,
        parent: Option<EntityId>,
        factory: impl FnOnce(EntitySeed) -> Arc<E>,
    ) -> SyncResult<Arc<E>> {
        self.ensure_live()?;
        let described = key.as_ref().map(|key| key.to_string());
        let resolved = {
            let mut state = self.state.lock();
            let ContextState { tree, identity } = &mut *state;
            let seed_key = key.clone();
            let context = self.me.clone();
            identity.lookup_or_create(tree, key, parent, |id| {
                let entity: Arc<dyn Entity> = factory(EntitySeed {
                    id,
                    key: seed_key,
                    context,
                });
                entity
            })?
        };

        let created = resolved.created;
        let entity = Arc::clone(&resolved.value);
        let typed = downcast::<E>(resolved.value).ok_or_else(|| {
            SyncError::invalid_operation(format!(
                "{} is registered as a {}",
                described.as_deref().unwrap_or("entity"),
                entity.header().kind()
            ))
        })?;

        if created {
            trace!(
                context = %self.identifier(),
                entity = %entity.header().describe(),
                "entity created"
            );
            if let Some(parent) = parent {
                entity.did_attach(parent);
            }
        }
        Ok(typed)
    }

    pub(crate) fn entity(&self, id: EntityId) -> Option<Arc<dyn Entity>> {
        self.state.lock().tree.get(id).cloned()
    }

    pub(crate) fn typed<E: Entity + 'static>(&self, id: EntityId) -> Option<Arc<E>> {
        self.entity(id).and_then(downcast::<E>)
    }

    pub(crate) fn parent_of(&self, id: EntityId) -> Option<EntityId> {
        self.state.lock().tree.parent(id)
    }

    pub(crate) fn children(&self, id: EntityId) -> Vec<EntityId> {
        self.state.lock().tree.children(id).to_vec()
    }

    /// Moves `child` below `parent`, running detach and attach hooks.
    pub(crate) fn attach(&self, child: EntityId, parent: EntityId) -> SyncResult<()> {
        if self.parent_of(child) == Some(parent) {
            return Ok(());
        }
        self.detach(child);
        let entity = {
            let mut state = self.state.lock();
            state.tree.attach(child, parent)?;
            state.tree.get(child).cloned()
        };
        if let Some(entity) = entity {
            entity.did_attach(parent);
        }
        Ok(())
    }

    /// Detaches `child` from its parent. Returns the previous parent.
    pub(crate) fn detach(&self, child: EntityId) -> Option<EntityId> {
        let (entity, parent) = {
            let state = self.state.lock();
            (state.tree.get(child).cloned(), state.tree.parent(child)?)
        };
        if let Some(entity) = &entity {
            entity.will_detach(parent);
        }
        self.state.lock().tree.detach(child);
        if let Some(parent_entity) = self.entity(parent) {
            parent_entity.child_detached(child);
        }
        Some(parent)
    }

    /// Detaches `id` and drops its subtree from the arena without destroying
    /// it. Released entities are no longer reachable through the context.
    pub(crate) fn release(&self, id: EntityId) {
        self.detach(id);
        let mut state = self.state.lock();
        for released in state.tree.teardown_order(id) {
            if let Some(entity) = state.tree.remove(released) {
                if let Some(key) = entity.header().key() {
                    state.identity.remove(&key, released);
                }
            }
        }
        trace!(context = %self.identifier(), entity = %id, "entity released");
    }

    /// Registers `key` for an entity created without one.
    pub(crate) fn rekey(&self, id: EntityId, key: IdentityKey) -> SyncResult<()> {
        let entity = {
            let mut state = self.state.lock();
            let entity = state
                .tree
                .get(id)
                .cloned()
                .ok_or_else(|| SyncError::invalid_operation(format!("unknown entity {id}")))?;
            state.identity.register(key.clone(), id).map_err(|holder| {
                SyncError::invalid_operation(format!("{key} is already held by {holder}"))
            })?;
            entity
        };
        entity.header().set_key(Some(key));
        Ok(())
    }

    /// Destroys `id` and its subtree, children first.
    ///
    /// Per entity: `will_destroy` (observers stop), owned operations are
    /// cancelled, the entity is marked destroyed, then its slot is freed and
    /// its key unregistered. The parent of `id` is told afterwards.
    ///
    /// Returns false if `id` is not in the arena.
    pub(crate) fn destroy_entity(&self, id: EntityId) -> bool {
        let (order, parent) = {
            let state = self.state.lock();
            let order: Vec<(EntityId, Arc<dyn Entity>)> = state
                .tree
                .teardown_order(id)
                .into_iter()
                .filter_map(|id| state.tree.get(id).cloned().map(|entity| (id, entity)))
                .collect();
            (order, state.tree.parent(id))
        };
        if order.is_empty() {
            return false;
        }

        for (id, entity) in order {
            let header = entity.header();
            if header.is_destroyed() {
                continue;
            }
            entity.will_destroy();
            self.operations.cancel_owned(id);
            if !header.mark_destroyed() {
                continue;
            }
            {
                let mut state = self.state.lock();
                state.tree.remove(id);
                if let Some(key) = header.key() {
                    state.identity.remove(&key, id);
                }
            }
            trace!(
                context = %self.identifier(),
                entity = %header.describe(),
                "entity destroyed"
            );
        }

        if let Some(parent) = parent.and_then(|parent| self.entity(parent)) {
            parent.child_detached(id);
        }
        true
    }

    fn nest(&self, identifier: &str) -> SyncResult<Arc<ContextInner>> {
        self.ensure_live()?;
        let mut nested = self.nested.lock();
        if let Some(context) = nested.get(identifier) {
            return Ok(Arc::clone(context));
        }
        let context = ContextInner::new(
            self.config.nested(identifier),
            self.remote.clone(),
            self.operations.runtime().clone(),
            self.me.clone(),
        );
        nested.insert(identifier.to_string(), Arc::clone(&context));
        Ok(context)
    }

    /// This context and every context nested below it.
    fn descendants(self: &Arc<Self>) -> Vec<Arc<ContextInner>> {
        let mut all = vec![Arc::clone(self)];
        let mut cursor = 0;
        while cursor < all.len() {
            let nested: Vec<_> = all[cursor].nested.lock().values().cloned().collect();
            all.extend(nested);
            cursor += 1;
        }
        all
    }

    pub(crate) fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(context = %self.identifier(), "destroying context");

        let nested: Vec<_> = std::mem::take(&mut *self.nested.lock())
            .into_values()
            .collect();
        for context in nested {
            context.destroy();
        }

        let roots = self.state.lock().tree.roots();
        for root in roots {
            self.destroy_entity(root);
        }

        let cancelled = self.operations.cancel_all();
        if cancelled > 0 {
            debug!(context = %self.identifier(), cancelled, "cancelled remaining operations");
        }

        if let Some(parent) = self.parent.upgrade() {
            let mut nested = parent.nested.lock();
            let is_self = nested
                .get(self.identifier())
                .is_some_and(|context| std::ptr::eq(Arc::as_ptr(context), self));
            if is_self {
                nested.remove(self.identifier());
            }
        }
    }
}

/// A logical scope of entities.
///
/// Cloning yields a handle to the same context.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Context identifier.
    pub fn identifier(&self) -> &str {
        self.inner.identifier()
    }

    /// Configuration of this context.
    pub fn config(&self) -> &StoreConfig {
        self.inner.config()
    }

    /// Operation registry of this context.
    pub fn operations(&self) -> &Operations {
        self.inner.operations()
    }

    /// Returns true once destroyed.
    pub fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }

    /// Number of live entities owned by this context.
    pub fn entity_count(&self) -> usize {
        self.inner.state.lock().tree.len()
    }

    /// Returns the nested context named `identifier`, creating it if needed.
    pub fn nest(&self, identifier: &str) -> SyncResult<Context> {
        Ok(Context {
            inner: self.inner.nest(identifier)?,
        })
    }

    /// The context this one is nested in.
    pub fn parent(&self) -> Option<Context> {
        self.inner.parent.upgrade().map(|inner| Context { inner })
    }

    /// Canonical document at `path`, e.g. `ducks/yellow`.
    pub fn doc(&self, path: &str) -> SyncResult<Arc<Document>> {
        Document::resolve(&self.inner, DocumentInit::at(path)?)
    }

    /// A document from parts. Documents with a full path are canonical.
    pub fn new_document(&self, init: DocumentInit) -> SyncResult<Arc<Document>> {
        Document::resolve(&self.inner, init)
    }

    /// A live query. Queries with an id are canonical.
    pub fn query(&self, init: QueryInit) -> SyncResult<Arc<Query>> {
        Query::resolve(&self.inner, init)
    }

    /// Storage service of this context.
    pub fn storage(&self) -> SyncResult<Arc<Storage>> {
        Storage::resolve(&self.inner)
    }

    /// Auth service of this context.
    pub fn auth(&self) -> SyncResult<Arc<Auth>> {
        Auth::resolve(&self.inner)
    }

    /// Waits until this context and every nested context have no
    /// operation in flight.
    pub async fn settle(&self) {
        loop {
            let contexts = self.inner.descendants();
            for context in &contexts {
                context.operations.settle().await;
            }
            if contexts.iter().all(|context| context.operations.is_empty()) {
                return;
            }
        }
    }

    /// Destroys nested contexts, every owned entity, then cancels remaining
    /// operations. Idempotent.
    pub fn destroy(&self) {
        self.inner.destroy();
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("identifier", &self.identifier())
            .field("destroyed", &self.is_destroyed())
            .field("entities", &self.entity_count())
            .finish()
    }
}

/// Root context bound to a tokio runtime.
///
/// Dropping the store destroys its context.
pub struct Store {
    context: Context,
}

impl Store {
    /// Creates a store on the current tokio runtime.
    pub fn new(config: StoreConfig, remote: RemoteServices) -> SyncResult<Self> {
        let runtime = Handle::try_current().map_err(|_| SyncError::MissingRuntime)?;
        Ok(Self::with_runtime(config, remote, runtime))
    }

    /// Creates a store that runs its operations on `runtime`.
    pub fn with_runtime(config: StoreConfig, remote: RemoteServices, runtime: Handle) -> Self {
        Self {
            context: Context {
                inner: ContextInner::new(config, remote, runtime, Weak::new()),
            },
        }
    }

    /// Root context.
    pub fn context(&self) -> &Context {
        &self.context
    }
}

impl Deref for Store {
    type Target = Context;

    fn deref(&self) -> &Context {
        &self.context
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        self.context.destroy();
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Store").field(&self.context).finish()
    }
}
