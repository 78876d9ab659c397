//! Canonical references to storage objects and upload requests.

use super::metadata::{Metadata, MetadataLoadOptions};
use super::task::Task;
use super::Storage;
use crate::context::ContextInner;
use crate::entity::{Entity, EntityHeader};
use crate::error::{SyncError, SyncResult};
use crate::identity::IdentityKey;
use crate::lifecycle::EntityId;
use bytes::Bytes;
use mirra_protocol::{MetadataPatch, PutPayload, StoragePath, UploadOutcome};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::fmt;
use std::sync::{Arc, Weak};

/// An upload request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutRequest {
    /// Content to upload.
    pub payload: PutPayload,
    /// Metadata stored with the object.
    pub metadata: MetadataPatch,
}

impl PutRequest {
    /// Uploads a raw string.
    pub fn string(data: impl Into<String>) -> Self {
        Self {
            payload: PutPayload::String(data.into()),
            metadata: MetadataPatch::default(),
        }
    }

    /// Uploads binary data.
    pub fn data(data: impl Into<Bytes>) -> Self {
        Self {
            payload: PutPayload::Data(data.into()),
            metadata: MetadataPatch::default(),
        }
    }

    /// Sets the metadata stored with the object.
    #[must_use]
    pub fn with_metadata(mut self, metadata: MetadataPatch) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Options for [`StorageReference::load`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReferenceLoadOptions {
    /// Resolve the download URL.
    pub url: bool,
    /// Load the metadata record.
    pub metadata: bool,
    /// A missing object is not an error.
    pub optional: bool,
}

/// Canonical reference to one storage object.
pub struct StorageReference {
    header: EntityHeader,
    me: Weak<StorageReference>,
    path: StoragePath,
    storage: Weak<Storage>,
    metadata: Mutex<Option<Arc<Metadata>>>,
    url: Mutex<Option<String>>,
}

impl StorageReference {
    pub(crate) fn resolve(
        context: &ContextInner,
        path: StoragePath,
        storage: Weak<Storage>,
        parent: EntityId,
    ) -> SyncResult<Arc<StorageReference>> {
        let key = IdentityKey::storage_reference(path.url());
        context.resolve(Some(key), Some(parent), |seed| {
            Arc::new_cyclic(|me| StorageReference {
                header: seed.into_header("reference"),
                me: me.clone(),
                path,
                storage,
                metadata: Mutex::new(None),
                url: Mutex::new(None),
            })
        })
    }

    /// Resolved location.
    pub fn path(&self) -> &StoragePath {
        &self.path
    }

    /// Bucket name.
    pub fn bucket(&self) -> &str {
        &self.path.bucket
    }

    /// Object path inside the bucket.
    pub fn full_path(&self) -> &str {
        &self.path.full_path
    }

    /// Last path segment.
    pub fn name(&self) -> &str {
        self.path.name()
    }

    /// Download URL, once resolved or uploaded.
    pub fn url(&self) -> Option<String> {
        self.url.lock().clone()
    }

    /// Metadata record of this object, created on first access.
    pub fn metadata(&self) -> SyncResult<Arc<Metadata>> {
        let context = self.header.context()?;
        let mut slot = self.metadata.lock();
        if let Some(metadata) = slot.as_ref() {
            if !metadata.is_destroyed() {
                return Ok(Arc::clone(metadata));
            }
        }
        let metadata = Metadata::create(&context, self.path.clone(), self.header.id())?;
        *slot = Some(Arc::clone(&metadata));
        Ok(metadata)
    }

    /// Starts an upload.
    ///
    /// The task is listed in `storage.tasks` while it runs.
    pub fn put(&self, request: PutRequest) -> SyncResult<Arc<Task>> {
        let context = self.header.context()?;
        let storage = self
            .storage
            .upgrade()
            .ok_or_else(|| SyncError::destroyed(self.header.describe()))?;
        let tasks = storage.tasks()?;
        let task = Task::create(&context, self.this()?, &request.payload)?;
        tasks.push(Arc::clone(&task))?;
        task.start(&context, request);
        Ok(task)
    }

    /// Loads the metadata record and/or the download URL.
    pub async fn load(&self, options: ReferenceLoadOptions) -> SyncResult<()> {
        self.header.ensure_live()?;
        if options.metadata {
            self.metadata()?
                .load(MetadataLoadOptions {
                    optional: options.optional,
                    reload: false,
                })
                .await?;
        }
        if options.url {
            match self.download_url().await {
                Err(error) if error.is_not_found() && options.optional => {}
                result => {
                    result?;
                }
            }
        }
        Ok(())
    }

    /// Resolves the download URL.
    pub async fn download_url(&self) -> SyncResult<String> {
        let context = self.header.context()?;
        let remote = Arc::clone(&context.remote().storage);
        let path = self.path.clone();
        let this = self.this()?;
        context
            .operations()
            .invoke(format!("storage.url {path}"), Some(self.header.id()), async move {
                let url = remote.download_url(&path).await.map_err(SyncError::from);
                if let Ok(url) = &url {
                    this.set_url(Some(url.clone()));
                }
                url
            })
            .await
    }

    /// Deletes the object.
    pub async fn delete(&self) -> SyncResult<()> {
        let context = self.header.context()?;
        let remote = Arc::clone(&context.remote().storage);
        let path = self.path.clone();
        let this = self.this()?;
        context
            .operations()
            .invoke(format!("storage.delete {path}"), Some(self.header.id()), async move {
                let result = remote.delete(&path).await.map_err(SyncError::from);
                if result.is_ok() {
                    this.set_url(None);
                    let metadata = this.metadata.lock().clone();
                    if let Some(metadata) = metadata {
                        metadata.deleted();
                    }
                }
                result
            })
            .await
    }

    /// Applies the outcome of a finished upload.
    pub(crate) fn uploaded(&self, outcome: &UploadOutcome) {
        if self.header.is_destroyed() {
            return;
        }
        self.set_url(Some(outcome.download_url.clone()));
        let metadata = self.metadata.lock().clone();
        if let Some(metadata) = metadata {
            metadata.uploaded(outcome.metadata.clone());
        }
    }

    fn set_url(&self, url: Option<String>) {
        self.header.changes().with_changes(true, |changed| {
            let mut slot = self.url.lock();
            if *slot != url {
                *slot = url;
                changed.changed("url");
            }
        });
    }

    fn this(&self) -> SyncResult<Arc<StorageReference>> {
        self.me
            .upgrade()
            .ok_or_else(|| SyncError::destroyed(self.header.describe()))
    }
}

impl Entity for StorageReference {
    fn header(&self) -> &EntityHeader {
        &self.header
    }

    fn serialized(&self) -> Value {
        json!({
            "bucket": self.path.bucket,
            "fullPath": self.path.full_path,
            "name": self.path.name(),
        })
    }

    fn child_detached(&self, child: EntityId) {
        let mut slot = self.metadata.lock();
        if slot.as_ref().is_some_and(|metadata| metadata.entity_id() == child) {
            *slot = None;
        }
    }

    fn will_destroy(&self) {
        self.metadata.lock().take();
    }
}

impl fmt::Debug for StorageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageReference")
            .field("id", &self.header.id())
            .field("path", &self.path)
            .finish()
    }
}
