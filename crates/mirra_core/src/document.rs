//! Documents: persisted models mirroring one remote document.

use crate::batch::FieldRecorder;
use crate::context::ContextInner;
use crate::entity::{Entity, EntityHeader};
use crate::error::{SyncError, SyncResult};
use crate::identity::IdentityKey;
use crate::observer::{ObserverPhase, SnapshotDelegate, SnapshotObserver};
use crate::state::{ModelFlags, ModelState};
use mirra_protocol::{
    DocumentPath, DocumentSnapshot, QueryTarget, RemoteError, RemoteResult, Snapshot, SnapshotData,
    SnapshotMetadata,
};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use tracing::debug;
use uuid::Uuid;

/// Parts a document is created from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentInit {
    /// Collection and id; either may be absent.
    pub path: DocumentPath,
    /// Initial local data.
    pub data: Option<Value>,
}

impl DocumentInit {
    /// A document at a full path such as `ducks/yellow`.
    pub fn at(path: &str) -> SyncResult<Self> {
        let path = DocumentPath::parse(path)
            .ok_or_else(|| SyncError::invalid_operation(format!("'{path}' is not a document path")))?;
        Ok(Self { path, data: None })
    }

    /// A document in `collection` that receives an id on first save.
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            path: DocumentPath::new(Some(collection.into()), None),
            data: None,
        }
    }

    /// Sets the document id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.path.id = Some(id.into());
        self
    }

    /// Sets the initial data.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Options for [`Document::load`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// A missing document is a successful load with `is_existing == false`.
    pub optional: bool,
    /// Read again even if already loaded.
    pub reload: bool,
}

/// Options for [`Document::save`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveOptions {
    /// Merge top-level fields into the remote document.
    pub merge: bool,
}

struct DocumentInner {
    path: DocumentPath,
    data: Value,
    synced: Option<Value>,
    state: ModelState,
    metadata: Option<SnapshotMetadata>,
}

impl DocumentInner {
    fn is_dirty(&self) -> bool {
        self.synced.as_ref() != Some(&self.data)
    }

    fn set_data(&mut self, data: Value, changed: &FieldRecorder<'_>) {
        if self.data != data {
            self.data = data;
            changed.changed("data");
        }
    }

    fn apply_remote(&mut self, snapshot: &DocumentSnapshot, changed: &FieldRecorder<'_>) {
        if snapshot.exists {
            let data = snapshot.data.clone().unwrap_or_else(empty);
            self.synced = Some(data.clone());
            self.set_data(data, changed);
            self.state.loaded(true, changed);
        } else {
            self.synced = None;
            self.state.loaded(false, changed);
        }
    }
}

fn empty() -> Value {
    Value::Object(Map::new())
}

/// Merges top-level fields of `patch` into `data`. `null` removes a field.
fn merge(data: &Value, patch: Value) -> Value {
    match (data, patch) {
        (Value::Object(current), Value::Object(patch)) => {
            let mut merged = current.clone();
            for (key, value) in patch {
                if value.is_null() {
                    merged.remove(&key);
                } else {
                    merged.insert(key, value);
                }
            }
            Value::Object(merged)
        }
        (_, patch) => patch,
    }
}

/// A local, identity-stable mirror of one remote document.
pub struct Document {
    header: EntityHeader,
    me: Weak<Document>,
    inner: Mutex<DocumentInner>,
    observer: Mutex<Option<SnapshotObserver>>,
}

impl Document {
    pub(crate) fn resolve(context: &ContextInner, init: DocumentInit) -> SyncResult<Arc<Document>> {
        let key = init.path.path().map(IdentityKey::document);
        let DocumentInit { path, data } = init;
        let mut created = false;
        let initial = data.clone();
        let document = context.resolve(key, None, |seed| {
            created = true;
            Arc::new_cyclic(|me| Document {
                header: seed.into_header("document"),
                me: me.clone(),
                inner: Mutex::new(DocumentInner {
                    path,
                    data: initial.unwrap_or_else(empty),
                    synced: None,
                    state: ModelState::new(),
                    metadata: None,
                }),
                observer: Mutex::new(None),
            })
        })?;
        if !created {
            if let Some(data) = data {
                document.set_data(data)?;
            }
        }
        Ok(document)
    }

    /// Document id.
    pub fn id(&self) -> Option<String> {
        self.inner.lock().path.id.clone()
    }

    /// Collection path.
    pub fn collection(&self) -> Option<String> {
        self.inner.lock().path.collection.clone()
    }

    /// Full path, once both collection and id are known.
    pub fn path(&self) -> Option<String> {
        self.inner.lock().path.path()
    }

    /// Local data.
    pub fn data(&self) -> Value {
        self.inner.lock().data.clone()
    }

    /// Returns true if local data differs from the last synced data.
    pub fn is_dirty(&self) -> bool {
        self.inner.lock().is_dirty()
    }

    /// Current state projections.
    pub fn state(&self) -> ModelFlags {
        self.inner.lock().state.flags()
    }

    /// Metadata of the last observed snapshot.
    pub fn metadata(&self) -> Option<SnapshotMetadata> {
        self.inner.lock().metadata
    }

    /// Replaces local data.
    pub fn set_data(&self, data: Value) -> SyncResult<()> {
        self.header.ensure_live()?;
        self.apply(|inner, changed| inner.set_data(data, changed));
        Ok(())
    }

    /// Merges top-level fields into local data; `null` removes a field.
    pub fn update_data(&self, patch: Value) -> SyncResult<()> {
        self.header.ensure_live()?;
        self.apply(|inner, changed| {
            let data = merge(&inner.data, patch);
            inner.set_data(data, changed);
        });
        Ok(())
    }

    /// Reads the document once.
    ///
    /// Skipped when already loaded unless `reload` is set. A missing document
    /// fails with `not-found` unless `optional` is set.
    pub async fn load(&self, options: LoadOptions) -> SyncResult<()> {
        let context = self.header.context()?;
        let path = self.require_path()?;
        if !options.reload && self.state().is_loaded {
            return Ok(());
        }

        self.apply(|inner, changed| inner.state.loading(changed));
        let source = Arc::clone(&context.remote().documents);
        let this = self.this()?;
        context
            .operations()
            .invoke(format!("document.load {path}"), Some(self.header.id()), async move {
                let result = source.get(&path).await;
                this.finish_load(&path, result, options.optional)
            })
            .await
    }

    /// Writes local data.
    ///
    /// A document without an id receives a generated one and becomes
    /// canonical for its new path.
    pub async fn save(&self, options: SaveOptions) -> SyncResult<()> {
        let context = self.header.context()?;
        let path = match self.path() {
            Some(path) => path,
            None => self.assign_id(&context)?,
        };

        let data = self.apply(|inner, changed| {
            inner.state.saving(changed);
            inner.data.clone()
        });
        let source = Arc::clone(&context.remote().documents);
        let this = self.this()?;
        context
            .operations()
            .invoke(format!("document.save {path}"), Some(self.header.id()), async move {
                let result = source.set(&path, data.clone(), options.merge).await;
                this.finish_write(result, Some(data))
            })
            .await
    }

    /// Deletes the remote document.
    pub async fn delete(&self) -> SyncResult<()> {
        let context = self.header.context()?;
        let path = self.require_path()?;

        self.apply(|inner, changed| inner.state.saving(changed));
        let source = Arc::clone(&context.remote().documents);
        let this = self.this()?;
        context
            .operations()
            .invoke(format!("document.delete {path}"), Some(self.header.id()), async move {
                let result = source.delete(&path).await;
                this.finish_write(result, None)
            })
            .await
    }

    /// Starts observing the remote document and returns the observer.
    ///
    /// While an observer is running, the same one is returned.
    pub fn observe(&self) -> SyncResult<SnapshotObserver> {
        let context = self.header.context()?;
        let mut slot = self.observer.lock();
        if let Some(observer) = slot.as_ref() {
            if observer.phase() != ObserverPhase::Stopped {
                return Ok(observer.clone());
            }
        }

        let path = self.require_path()?;
        let delegate: Weak<dyn SnapshotDelegate> = self.me.clone();
        let observer = SnapshotObserver::new(
            context.operations().clone(),
            Arc::clone(&context.remote().documents),
            QueryTarget::Document(path),
            context.config().snapshot_options,
            Some(self.header.id()),
            delegate,
        );
        *slot = Some(observer.clone());
        drop(slot);

        observer.start();
        Ok(observer)
    }

    /// Returns true while an observer is running.
    pub fn is_observing(&self) -> bool {
        self.observer
            .lock()
            .as_ref()
            .is_some_and(|observer| observer.phase() != ObserverPhase::Stopped)
    }

    /// Stops observing. A later [`observe`](Self::observe) starts a new observer.
    pub fn stop_observing(&self) {
        let observer = self.observer.lock().take();
        if let Some(observer) = observer {
            observer.stop();
        }
    }

    /// Observes the document and resolves once the first snapshot applied.
    pub fn promise(&self) -> SyncResult<impl Future<Output = SyncResult<()>> + Send + 'static> {
        let first = self.observe()?.promise();
        Ok(async move { first.await.map(|_| ()) })
    }

    /// Applies a remote document snapshot delivered by a query.
    pub(crate) fn apply_remote(&self, snapshot: &DocumentSnapshot) {
        if self.header.is_destroyed() {
            return;
        }
        self.apply(|inner, changed| inner.apply_remote(snapshot, changed));
    }

    fn finish_load(
        &self,
        path: &str,
        result: RemoteResult<DocumentSnapshot>,
        optional: bool,
    ) -> SyncResult<()> {
        match result {
            Ok(snapshot) if snapshot.exists || optional => {
                self.apply(|inner, changed| inner.apply_remote(&snapshot, changed));
                Ok(())
            }
            Ok(_) => {
                let error = SyncError::from(RemoteError::not_found(format!(
                    "document '{path}' does not exist"
                )));
                self.apply(|inner, changed| inner.state.failed(error.clone(), Some(false), changed));
                Err(error)
            }
            Err(error) => self.fail(error.into()),
        }
    }

    fn finish_write(&self, result: RemoteResult<()>, written: Option<Value>) -> SyncResult<()> {
        match result {
            Ok(()) => {
                self.apply(|inner, changed| {
                    match written {
                        Some(_) => inner.state.saved(changed),
                        None => inner.state.loaded(false, changed),
                    }
                    inner.synced = written;
                });
                Ok(())
            }
            Err(error) => self.fail(error.into()),
        }
    }

    fn fail(&self, error: SyncError) -> SyncResult<()> {
        let exists = error.is_not_found().then_some(false);
        self.apply(|inner, changed| inner.state.failed(error.clone(), exists, changed));
        Err(error)
    }

    fn assign_id(&self, context: &ContextInner) -> SyncResult<String> {
        let id = Uuid::new_v4().simple().to_string();
        let path = self.apply(|inner, changed| {
            if inner.path.collection.is_none() {
                return Err(SyncError::invalid_operation(
                    "cannot save a document without a collection",
                ));
            }
            inner.path = inner.path.with_id(id);
            changed.changed("id");
            changed.changed("path");
            inner
                .path
                .path()
                .ok_or_else(|| SyncError::invalid_operation("document path is incomplete"))
        })?;
        context.rekey(self.header.id(), IdentityKey::document(path.clone()))?;
        debug!(document = %path, "assigned document id");
        Ok(path)
    }

    fn require_path(&self) -> SyncResult<String> {
        self.path().ok_or_else(|| {
            SyncError::invalid_operation(format!("{} has no path", self.header.describe()))
        })
    }

    fn this(&self) -> SyncResult<Arc<Document>> {
        self.me
            .upgrade()
            .ok_or_else(|| SyncError::destroyed(self.header.describe()))
    }

    fn apply<R>(&self, f: impl FnOnce(&mut DocumentInner, &FieldRecorder<'_>) -> R) -> R {
        self.header.changes().with_changes(true, |changed| {
            let mut inner = self.inner.lock();
            let dirty = inner.is_dirty();
            let result = f(&mut inner, changed);
            if inner.is_dirty() != dirty {
                changed.changed("isDirty");
            }
            result
        })
    }
}

impl Entity for Document {
    fn header(&self) -> &EntityHeader {
        &self.header
    }

    fn serialized(&self) -> Value {
        let inner = self.inner.lock();
        let mut state = json!(inner.state.flags());
        state["isDirty"] = json!(inner.is_dirty());
        json!({
            "data": inner.data,
            "ref": {
                "collection": inner.path.collection,
                "id": inner.path.id,
                "path": inner.path.path(),
            },
            "state": state,
        })
    }

    fn will_destroy(&self) {
        self.stop_observing();
    }
}

impl SnapshotDelegate for Document {
    fn on_loading(&self) {
        self.apply(|inner, changed| inner.state.loading(changed));
    }

    fn on_metadata(&self, metadata: SnapshotMetadata) {
        self.apply(|inner, changed| {
            inner.metadata = Some(metadata);
            changed.changed("metadata");
        });
    }

    fn on_snapshot(&self, snapshot: &Snapshot) {
        if let SnapshotData::Document(document) = &snapshot.data {
            self.apply(|inner, changed| inner.apply_remote(document, changed));
        }
    }

    fn on_error(&self, error: &RemoteError) {
        let exists = error.is_not_found().then_some(false);
        self.apply(|inner, changed| {
            inner.state.failed(SyncError::from(error.clone()), exists, changed)
        });
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("id", &self.header.id())
            .field("path", &self.path())
            .field("destroyed", &self.header.is_destroyed())
            .finish()
    }
}
