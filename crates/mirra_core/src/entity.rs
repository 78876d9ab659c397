//! Entity base: the header every synchronized object carries and the hooks
//! the lifecycle tracker calls.

use crate::batch::{ChangeBatcher, ChangeSet, ListenerId};
use crate::context::ContextInner;
use crate::error::{SyncError, SyncResult};
use crate::identity::IdentityKey;
use crate::lifecycle::EntityId;
use parking_lot::Mutex;
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Upcast of an `Arc<dyn Entity>` for downcasting to the concrete type.
pub trait AsAny {
    /// Converts into `Arc<dyn Any>`.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A synchronized object owned by a context.
///
/// Lifecycle hooks run outside the context's entity lock and outside any
/// batch of the entity itself.
pub trait Entity: AsAny + Send + Sync {
    /// Shared entity header.
    fn header(&self) -> &EntityHeader;

    /// Plain keyed projection of the current state.
    fn serialized(&self) -> Value;

    /// Called after the entity was attached below `parent`.
    fn did_attach(&self, _parent: EntityId) {}

    /// Called before the entity is detached from `parent`.
    fn will_detach(&self, _parent: EntityId) {}

    /// Called after a child was detached from or destroyed below this entity.
    fn child_detached(&self, _child: EntityId) {}

    /// Called first when the entity is destroyed, after its children.
    fn will_destroy(&self) {}

    /// Arena handle.
    fn entity_id(&self) -> EntityId {
        self.header().id()
    }

    /// Returns true once the entity has been destroyed.
    fn is_destroyed(&self) -> bool {
        self.header().is_destroyed()
    }

    /// Destroys the entity and everything it owns. Idempotent.
    fn destroy(&self) {
        self.header().destroy();
    }

    /// Registers a change listener.
    fn subscribe(&self, listener: impl Fn(&ChangeSet) + Send + Sync + 'static) -> ListenerId
    where
        Self: Sized,
    {
        self.header().changes().subscribe(listener)
    }

    /// Removes a change listener.
    fn unsubscribe(&self, id: ListenerId) -> bool {
        self.header().changes().unsubscribe(id)
    }
}

/// Everything an entity factory needs to build an [`EntityHeader`].
pub(crate) struct EntitySeed {
    pub(crate) id: EntityId,
    pub(crate) key: Option<IdentityKey>,
    pub(crate) context: Weak<ContextInner>,
}

impl EntitySeed {
    pub(crate) fn into_header(self, kind: &'static str) -> EntityHeader {
        EntityHeader {
            id: self.id,
            kind,
            key: Mutex::new(self.key),
            context: self.context,
            destroyed: AtomicBool::new(false),
            changes: ChangeBatcher::with_derived(&["serialized"]),
        }
    }
}

/// State shared by every entity.
pub struct EntityHeader {
    id: EntityId,
    kind: &'static str,
    key: Mutex<Option<IdentityKey>>,
    context: Weak<ContextInner>,
    destroyed: AtomicBool,
    changes: ChangeBatcher,
}

impl EntityHeader {
    /// Arena handle.
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// Entity kind, e.g. `document`.
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Identity key, if registered.
    pub fn key(&self) -> Option<IdentityKey> {
        self.key.lock().clone()
    }

    /// Returns true once destroyed.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Change batcher of the entity.
    pub fn changes(&self) -> &ChangeBatcher {
        &self.changes
    }

    /// Destroys the entity. Idempotent.
    ///
    /// An entity that is no longer in its context's arena is only marked.
    pub fn destroy(&self) {
        let destroyed = self
            .context
            .upgrade()
            .is_some_and(|context| context.destroy_entity(self.id));
        if !destroyed {
            self.mark_destroyed();
        }
    }

    /// Human-readable description used in errors and logs.
    pub fn describe(&self) -> String {
        match self.key() {
            Some(key) => format!("{} {}", self.kind, key.key()),
            None => format!("{} {}", self.kind, self.id),
        }
    }

    /// Fails with `Destroyed` once destroyed.
    pub fn ensure_live(&self) -> SyncResult<()> {
        if self.is_destroyed() {
            return Err(SyncError::destroyed(self.describe()));
        }
        Ok(())
    }

    /// The owning context, if both it and this entity are alive.
    pub(crate) fn context(&self) -> SyncResult<Arc<ContextInner>> {
        self.ensure_live()?;
        let context = self
            .context
            .upgrade()
            .ok_or_else(|| SyncError::destroyed(self.describe()))?;
        context.ensure_live()?;
        Ok(context)
    }

    pub(crate) fn set_key(&self, key: Option<IdentityKey>) {
        *self.key.lock() = key;
    }

    /// Marks the entity destroyed. Returns true on the first call only.
    pub(crate) fn mark_destroyed(&self) -> bool {
        !self.destroyed.swap(true, Ordering::SeqCst)
    }
}

impl fmt::Debug for EntityHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityHeader")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("key", &self.key())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/// Downcasts a type-erased entity.
pub(crate) fn downcast<E: Entity + 'static>(entity: Arc<dyn Entity>) -> Option<Arc<E>> {
    entity.into_any().downcast::<E>().ok()
}
