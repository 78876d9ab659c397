//! Metadata record of one storage object.

use crate::batch::FieldRecorder;
use crate::context::ContextInner;
use crate::entity::{Entity, EntityHeader};
use crate::error::{SyncError, SyncResult};
use crate::lifecycle::EntityId;
use crate::state::{MetadataFlags, MetadataState};
use mirra_protocol::{MetadataPatch, ObjectMetadata, RemoteResult, StoragePath};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::fmt;
use std::sync::{Arc, Weak};

/// Options for [`Metadata::load`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetadataLoadOptions {
    /// A missing object is a successful load with `is_existing == false`.
    pub optional: bool,
    /// Read again even if already loaded.
    pub reload: bool,
}

struct MetadataInner {
    raw: Option<ObjectMetadata>,
    state: MetadataState,
}

impl MetadataInner {
    fn loaded(&mut self, raw: ObjectMetadata, changed: &FieldRecorder<'_>) {
        if self.raw.as_ref() != Some(&raw) {
            self.raw = Some(raw);
            changed.changed("raw");
        }
        self.state.loaded(changed);
    }
}

/// Metadata record of one storage object.
///
/// Whether a missing object is an error is decided by each `load` call,
/// not by the record.
pub struct Metadata {
    header: EntityHeader,
    me: Weak<Metadata>,
    path: StoragePath,
    inner: Mutex<MetadataInner>,
}

impl Metadata {
    pub(crate) fn create(
        context: &ContextInner,
        path: StoragePath,
        parent: EntityId,
    ) -> SyncResult<Arc<Metadata>> {
        context.resolve(None, Some(parent), |seed| {
            Arc::new_cyclic(|me| Metadata {
                header: seed.into_header("metadata"),
                me: me.clone(),
                path,
                inner: Mutex::new(MetadataInner {
                    raw: None,
                    state: MetadataState::new(),
                }),
            })
        })
    }

    /// Object this record describes.
    pub fn path(&self) -> &StoragePath {
        &self.path
    }

    /// Last metadata read from the backend.
    pub fn raw(&self) -> Option<ObjectMetadata> {
        self.inner.lock().raw.clone()
    }

    /// Current state projections.
    pub fn state(&self) -> MetadataFlags {
        self.inner.lock().state.flags()
    }

    /// Reads the metadata.
    ///
    /// Skipped when already loaded unless `reload` is set.
    pub async fn load(&self, options: MetadataLoadOptions) -> SyncResult<()> {
        let context = self.header.context()?;
        if !options.reload && self.state().is_loaded {
            return Ok(());
        }

        self.apply(|inner, changed| inner.state.loading(changed));
        let remote = Arc::clone(&context.remote().storage);
        let path = self.path.clone();
        let this = self.this()?;
        context
            .operations()
            .invoke(
                format!("storage.metadata.load {path}"),
                Some(self.header.id()),
                async move {
                    let result = remote.get_metadata(&path).await;
                    this.finish_load(result, options.optional)
                },
            )
            .await
    }

    /// Updates the metadata and applies what the backend returns.
    pub async fn update(&self, patch: MetadataPatch) -> SyncResult<()> {
        let context = self.header.context()?;
        let remote = Arc::clone(&context.remote().storage);
        let path = self.path.clone();
        let this = self.this()?;
        context
            .operations()
            .invoke(
                format!("storage.metadata.update {path}"),
                Some(self.header.id()),
                async move {
                    match remote.update_metadata(&path, patch).await {
                        Ok(raw) => {
                            this.apply(|inner, changed| inner.loaded(raw, changed));
                            Ok(())
                        }
                        Err(error) => {
                            let error = SyncError::from(error);
                            this.apply(|inner, changed| inner.state.failed(error.clone(), changed));
                            Err(error)
                        }
                    }
                },
            )
            .await
    }

    /// Applies metadata returned by an upload.
    pub(crate) fn uploaded(&self, raw: ObjectMetadata) {
        if !self.header.is_destroyed() {
            self.apply(|inner, changed| inner.loaded(raw, changed));
        }
    }

    /// Records that the object was deleted.
    pub(crate) fn deleted(&self) {
        if !self.header.is_destroyed() {
            self.apply(|inner, changed| {
                if inner.raw.take().is_some() {
                    changed.changed("raw");
                }
                inner.state.missing(changed);
            });
        }
    }

    fn finish_load(&self, result: RemoteResult<ObjectMetadata>, optional: bool) -> SyncResult<()> {
        match result {
            Ok(raw) => {
                self.apply(|inner, changed| inner.loaded(raw, changed));
                Ok(())
            }
            Err(error) if error.is_not_found() && optional => {
                self.apply(|inner, changed| inner.state.missing(changed));
                Ok(())
            }
            Err(error) => {
                let missing = error.is_not_found();
                let error = SyncError::from(error);
                self.apply(|inner, changed| {
                    if missing {
                        inner.state.missing_error(error.clone(), changed);
                    } else {
                        inner.state.failed(error.clone(), changed);
                    }
                });
                Err(error)
            }
        }
    }

    fn apply<R>(&self, f: impl FnOnce(&mut MetadataInner, &FieldRecorder<'_>) -> R) -> R {
        self.header.changes().with_changes(true, |changed| {
            let mut inner = self.inner.lock();
            f(&mut inner, changed)
        })
    }

    fn this(&self) -> SyncResult<Arc<Metadata>> {
        self.me
            .upgrade()
            .ok_or_else(|| SyncError::destroyed(self.header.describe()))
    }
}

impl Entity for Metadata {
    fn header(&self) -> &EntityHeader {
        &self.header
    }

    fn serialized(&self) -> Value {
        let inner = self.inner.lock();
        json!({
            "raw": inner.raw,
            "state": inner.state.flags(),
        })
    }
}

impl fmt::Debug for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metadata")
            .field("id", &self.header.id())
            .field("path", &self.path)
            .field("phase", &self.inner.lock().state.phase())
            .finish()
    }
}
