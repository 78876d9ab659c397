//! Owning arrays of entities.

use crate::context::ContextInner;
use crate::entity::{Entity, EntityHeader};
use crate::error::SyncResult;
use crate::lifecycle::EntityId;
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Weak};

/// What happens to an element removed from an [`EntityArray`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposal {
    /// The element leaves its context and lives on while it has holders.
    Release,
    /// The element is destroyed.
    Destroy,
}

/// An entity owning an ordered list of child entities.
///
/// Elements are children in the lifecycle tree. An element that is destroyed,
/// detached or released by any path leaves the array.
pub struct EntityArray<T> {
    header: EntityHeader,
    context: Weak<ContextInner>,
    items: Mutex<Vec<Arc<T>>>,
}

impl<T: Entity + 'static> EntityArray<T> {
    pub(crate) fn create(
        context: &ContextInner,
        parent: Option<EntityId>,
    ) -> SyncResult<Arc<EntityArray<T>>> {
        context.resolve(None, parent, |seed| {
            Arc::new(EntityArray {
                context: seed.context.clone(),
                header: seed.into_header("array"),
                items: Mutex::new(Vec::new()),
            })
        })
    }

    /// Appends `item`, attaching it below this array.
    pub fn push(&self, item: Arc<T>) -> SyncResult<()> {
        let context = self.header.context()?;
        item.header().ensure_live()?;
        context.attach(item.entity_id(), self.header.id())?;

        self.header.changes().with_changes(true, |changed| {
            let mut items = self.items.lock();
            if !items.iter().any(|i| i.entity_id() == item.entity_id()) {
                items.push(item);
                changed.changed("inserted");
                changed.changed("length");
            }
        });
        Ok(())
    }

    /// Removes `item`. Returns false if it is not an element.
    pub fn remove(&self, item: &T, disposal: Disposal) -> SyncResult<bool> {
        if !self.contains(item) {
            return Ok(false);
        }
        match disposal {
            Disposal::Release => match self.context.upgrade() {
                Some(context) => context.release(item.entity_id()),
                None => self.child_detached(item.entity_id()),
            },
            Disposal::Destroy => item.destroy(),
        }
        Ok(true)
    }

    /// Returns true if `item` is an element.
    pub fn contains(&self, item: &T) -> bool {
        let id = item.entity_id();
        self.items.lock().iter().any(|i| i.entity_id() == id)
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Returns true if the array has no elements.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Element at `index`.
    pub fn get(&self, index: usize) -> Option<Arc<T>> {
        self.items.lock().get(index).cloned()
    }

    /// Snapshot of the elements.
    pub fn to_vec(&self) -> Vec<Arc<T>> {
        self.items.lock().clone()
    }
}

impl<T: Entity + 'static> Entity for EntityArray<T> {
    fn header(&self) -> &EntityHeader {
        &self.header
    }

    fn serialized(&self) -> Value {
        Value::Array(self.to_vec().iter().map(|item| item.serialized()).collect())
    }

    fn child_detached(&self, child: EntityId) {
        self.header.changes().with_changes(true, |changed| {
            let mut items = self.items.lock();
            let before = items.len();
            items.retain(|item| item.entity_id() != child);
            if items.len() != before {
                changed.changed("removed");
                changed.changed("length");
            }
        });
    }

    fn will_destroy(&self) {
        self.items.lock().clear();
    }
}

impl<T> fmt::Debug for EntityArray<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityArray")
            .field("id", &self.header.id())
            .field("length", &self.items.lock().len())
            .finish()
    }
}
