//! Identity map.
//!
//! Canonicalizes entities by `(namespace, key)` within one context. The map
//! stores [`EntityId`] handles only; the [`Lifecycle`] arena owns the values.

use crate::error::SyncResult;
use crate::lifecycle::{EntityId, Lifecycle};
use std::collections::HashMap;
use std::fmt;

/// Top-level partition of identity keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Namespace {
    /// Documents, keyed by full document path.
    Documents,
    /// Queries, keyed by caller-supplied id.
    Queries,
    /// Storage references, keyed by `gs://bucket/path` URL.
    StorageReferences,
    /// Per-context singleton services.
    Services,
}

impl Namespace {
    /// Namespace name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Documents => "documents",
            Namespace::Queries => "queries",
            Namespace::StorageReferences => "storage-references",
            Namespace::Services => "services",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable key of an entity within one context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey {
    namespace: Namespace,
    key: String,
}

impl IdentityKey {
    /// Creates a key.
    pub fn new(namespace: Namespace, key: impl Into<String>) -> Self {
        Self {
            namespace,
            key: key.into(),
        }
    }

    /// Key of a document path.
    pub fn document(path: impl Into<String>) -> Self {
        Self::new(Namespace::Documents, path)
    }

    /// Key of a query id.
    pub fn query(id: impl Into<String>) -> Self {
        Self::new(Namespace::Queries, id)
    }

    /// Key of a storage reference URL.
    pub fn storage_reference(url: impl Into<String>) -> Self {
        Self::new(Namespace::StorageReferences, url)
    }

    /// Key of a per-context service.
    pub fn service(name: &'static str) -> Self {
        Self::new(Namespace::Services, name)
    }

    /// Namespace of this key.
    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    /// Key within the namespace.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.key)
    }
}

/// Outcome of [`IdentityMap::lookup_or_create`].
#[derive(Debug, Clone)]
pub struct Resolved<T> {
    /// Handle of the entity.
    pub id: EntityId,
    /// The entity.
    pub value: T,
    /// True if the factory ran.
    pub created: bool,
}

/// Per-context index from identity keys to live entities.
#[derive(Debug, Default)]
pub struct IdentityMap {
    entries: HashMap<IdentityKey, EntityId>,
}

impl IdentityMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the canonical entity for `key`, creating it if necessary.
    ///
    /// Without a key the factory always runs and nothing is registered.
    /// Entries pointing at freed slots are treated as absent. The factory
    /// receives the id the new entity will occupy.
    pub fn lookup_or_create<T: Clone>(
        &mut self,
        tree: &mut Lifecycle<T>,
        key: Option<IdentityKey>,
        parent: Option<EntityId>,
        factory: impl FnOnce(EntityId) -> T,
    ) -> SyncResult<Resolved<T>> {
        if let Some(key) = &key {
            if let Some(id) = self.entries.get(key).copied() {
                if let Some(value) = tree.get(id) {
                    return Ok(Resolved {
                        id,
                        value: value.clone(),
                        created: false,
                    });
                }
                self.entries.remove(key);
            }
        }

        let id = tree.vacant_id();
        let value = factory(id);
        let inserted = tree.insert(value.clone(), parent)?;
        debug_assert_eq!(inserted, id);
        if let Some(key) = key {
            self.entries.insert(key, id);
        }
        Ok(Resolved {
            id,
            value,
            created: true,
        })
    }

    /// Looks up the handle registered for `key`.
    pub fn get(&self, key: &IdentityKey) -> Option<EntityId> {
        self.entries.get(key).copied()
    }

    /// Registers `id` under `key`.
    ///
    /// Fails with the current holder if another entity owns the key.
    pub fn register(&mut self, key: IdentityKey, id: EntityId) -> Result<(), EntityId> {
        match self.entries.get(&key) {
            Some(existing) if *existing != id => Err(*existing),
            _ => {
                self.entries.insert(key, id);
                Ok(())
            }
        }
    }

    /// Removes the entry for `key` if it still points at `id`.
    ///
    /// Returns true if an entry was removed.
    pub fn remove(&mut self, key: &IdentityKey, id: EntityId) -> bool {
        if self.entries.get(key) == Some(&id) {
            self.entries.remove(key);
            true
        } else {
            false
        }
    }

    /// Number of registered keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no key is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered keys of one namespace, sorted.
    pub fn keys(&self, namespace: Namespace) -> Vec<&IdentityKey> {
        let mut keys: Vec<_> = self
            .entries
            .keys()
            .filter(|key| key.namespace == namespace)
            .collect();
        keys.sort();
        keys
    }
}
