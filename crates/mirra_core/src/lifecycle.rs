//! Lifecycle and attachment tracking.
//!
//! Entities live in a generational arena. Each slot records its parent and
//! its children, which makes the arena the single owner of every entity:
//! parents refer to children by [`EntityId`], the identity map refers to
//! entities by [`EntityId`], and no reference cycles exist.
//!
//! Teardown walks the tree depth-first and yields children before their
//! parents (see [`Lifecycle::teardown_order`]).

use crate::error::{SyncError, SyncResult};
use std::fmt;

/// Stable handle of an entity within one context.
///
/// Handles carry a generation, so a handle to a freed slot never resolves to
/// the entity that later reuses the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId {
    index: u32,
    generation: u32,
}

impl EntityId {
    /// Slot index.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Slot generation.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

struct Node<T> {
    value: T,
    parent: Option<EntityId>,
    children: Vec<EntityId>,
}

struct Slot<T> {
    generation: u32,
    node: Option<Node<T>>,
}

/// Generational arena with parent/child links.
pub struct Lifecycle<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Lifecycle<T> {
    /// Creates an empty arena.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    /// The id the next [`insert`](Self::insert) will return.
    ///
    /// Lets a value learn its own id before it is constructed.
    pub fn vacant_id(&self) -> EntityId {
        match self.free.last() {
            Some(&index) => EntityId {
                index,
                generation: self.slots[index as usize].generation,
            },
            None => EntityId {
                index: self.slots.len() as u32,
                generation: 0,
            },
        }
    }

    /// Inserts a value, optionally as a child of `parent`.
    ///
    /// A stale or unknown parent is rejected.
    pub fn insert(&mut self, value: T, parent: Option<EntityId>) -> SyncResult<EntityId> {
        if let Some(parent) = parent {
            if !self.contains(parent) {
                return Err(SyncError::invalid_operation(format!(
                    "cannot attach to unknown entity {parent}"
                )));
            }
        }

        let id = self.vacant_id();
        let node = Node {
            value,
            parent,
            children: Vec::new(),
        };
        if self.free.pop().is_some() {
            self.slots[id.index as usize].node = Some(node);
        } else {
            self.slots.push(Slot {
                generation: 0,
                node: Some(node),
            });
        }
        if let Some(parent) = parent {
            if let Some(node) = self.node_mut(parent) {
                node.children.push(id);
            }
        }
        self.len += 1;
        Ok(id)
    }

    /// Returns true if `id` refers to a live slot.
    pub fn contains(&self, id: EntityId) -> bool {
        self.node(id).is_some()
    }

    /// Value stored under `id`.
    pub fn get(&self, id: EntityId) -> Option<&T> {
        self.node(id).map(|node| &node.value)
    }

    /// Parent of `id`, if attached.
    pub fn parent(&self, id: EntityId) -> Option<EntityId> {
        self.node(id).and_then(|node| node.parent)
    }

    /// Children of `id` in attachment order.
    pub fn children(&self, id: EntityId) -> &[EntityId] {
        self.node(id).map(|node| node.children.as_slice()).unwrap_or(&[])
    }

    /// Attaches `child` to `parent`, detaching it from its previous parent.
    ///
    /// Returns the previous parent. Attaching an entity below itself is
    /// rejected.
    pub fn attach(&mut self, child: EntityId, parent: EntityId) -> SyncResult<Option<EntityId>> {
        if !self.contains(child) || !self.contains(parent) {
            return Err(SyncError::invalid_operation(format!(
                "cannot attach {child} to {parent}: unknown entity"
            )));
        }
        let mut cursor = Some(parent);
        while let Some(id) = cursor {
            if id == child {
                return Err(SyncError::invalid_operation(format!(
                    "cannot attach {child} below itself"
                )));
            }
            cursor = self.parent(id);
        }

        let previous = self.detach(child);
        if let Some(node) = self.node_mut(child) {
            node.parent = Some(parent);
        }
        if let Some(node) = self.node_mut(parent) {
            node.children.push(child);
        }
        Ok(previous)
    }

    /// Detaches `child` from its parent, making it a root.
    ///
    /// Returns the previous parent.
    pub fn detach(&mut self, child: EntityId) -> Option<EntityId> {
        let parent = self.node_mut(child)?.parent.take()?;
        if let Some(node) = self.node_mut(parent) {
            node.children.retain(|id| *id != child);
        }
        Some(parent)
    }

    /// Ids of the subtree rooted at `id`, children before parents.
    pub fn teardown_order(&self, id: EntityId) -> Vec<EntityId> {
        let mut order = Vec::new();
        if !self.contains(id) {
            return order;
        }
        // Iterative post-order: (node, children visited?)
        let mut stack = vec![(id, false)];
        while let Some((current, expanded)) = stack.pop() {
            if expanded {
                order.push(current);
                continue;
            }
            stack.push((current, true));
            for child in self.children(current).iter().rev() {
                stack.push((*child, false));
            }
        }
        order
    }

    /// Removes `id`, unlinking it from its parent.
    ///
    /// Remaining children become roots; callers tearing down a subtree remove
    /// nodes in [`teardown_order`](Self::teardown_order) so none remain.
    pub fn remove(&mut self, id: EntityId) -> Option<T> {
        self.detach(id);
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;

        for child in &node.children {
            if let Some(child) = self.node_mut(*child) {
                child.parent = None;
            }
        }
        Some(node.value)
    }

    /// Ids of all entities without a parent.
    pub fn roots(&self) -> Vec<EntityId> {
        self.iter_ids()
            .filter(|id| self.parent(*id).is_none())
            .collect()
    }

    /// Number of live entities.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the arena holds no entities.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn iter_ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.node.as_ref().map(|_| EntityId {
                index: index as u32,
                generation: slot.generation,
            })
        })
    }

    fn node(&self, id: EntityId) -> Option<&Node<T>> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_ref()
    }

    fn node_mut(&mut self, id: EntityId) -> Option<&mut Node<T>> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_mut()
    }
}

impl<T> Default for Lifecycle<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Lifecycle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("len", &self.len)
            .field("slots", &self.slots.len())
            .finish()
    }
}
