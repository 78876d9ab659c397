//! Blob storage: the per-context service, object references, their
//! metadata records and transfer tasks.
//!
//! Ownership follows the lifecycle tree: the storage service owns its
//! references and the `tasks` array, a reference owns its metadata record,
//! and the array owns running tasks until they finish.

mod metadata;
mod reference;
mod task;

pub use metadata::{Metadata, MetadataLoadOptions};
pub use reference::{PutRequest, ReferenceLoadOptions, StorageReference};
pub use task::Task;

use crate::array::EntityArray;
use crate::context::ContextInner;
use crate::entity::{Entity, EntityHeader};
use crate::error::{SyncError, SyncResult};
use crate::identity::IdentityKey;
use crate::lifecycle::EntityId;
use mirra_protocol::{StorageLocation, StoragePath};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::fmt;
use std::sync::{Arc, Weak};

/// Storage service of one context.
pub struct Storage {
    header: EntityHeader,
    me: Weak<Storage>,
    bucket: String,
    tasks: Mutex<Option<Arc<EntityArray<Task>>>>,
}

impl Storage {
    pub(crate) fn resolve(context: &ContextInner) -> SyncResult<Arc<Storage>> {
        let bucket = context.remote().storage.bucket().to_string();
        context.resolve(Some(IdentityKey::service("storage")), None, |seed| {
            Arc::new_cyclic(|me| Storage {
                header: seed.into_header("storage"),
                me: me.clone(),
                bucket,
                tasks: Mutex::new(None),
            })
        })
    }

    /// Default bucket.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Canonical reference for a path in the default bucket or a `gs://` URL.
    pub fn reference(&self, location: StorageLocation) -> SyncResult<Arc<StorageReference>> {
        let context = self.header.context()?;
        let path = StoragePath::resolve(&location, &self.bucket).ok_or_else(|| {
            SyncError::invalid_operation(format!("{location:?} is not a storage location"))
        })?;
        StorageReference::resolve(&context, path, self.me.clone(), self.header.id())
    }

    /// Shorthand for a reference by path.
    pub fn path(&self, path: &str) -> SyncResult<Arc<StorageReference>> {
        self.reference(StorageLocation::Path(path.to_string()))
    }

    /// Transfers that are still running.
    pub fn tasks(&self) -> SyncResult<Arc<EntityArray<Task>>> {
        let context = self.header.context()?;
        let mut slot = self.tasks.lock();
        if let Some(tasks) = slot.as_ref() {
            if !tasks.is_destroyed() {
                return Ok(Arc::clone(tasks));
            }
        }
        let tasks = EntityArray::create(&context, Some(self.header.id()))?;
        *slot = Some(Arc::clone(&tasks));
        Ok(tasks)
    }
}

impl Entity for Storage {
    fn header(&self) -> &EntityHeader {
        &self.header
    }

    fn serialized(&self) -> Value {
        let tasks = self.tasks.lock().clone();
        json!({
            "bucket": self.bucket,
            "tasks": tasks.map_or_else(|| json!([]), |tasks| tasks.serialized()),
        })
    }

    fn child_detached(&self, child: EntityId) {
        let mut slot = self.tasks.lock();
        if slot.as_ref().is_some_and(|tasks| tasks.entity_id() == child) {
            *slot = None;
        }
    }

    fn will_destroy(&self) {
        self.tasks.lock().take();
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("id", &self.header.id())
            .field("bucket", &self.bucket)
            .finish()
    }
}
