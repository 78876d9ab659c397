//! Upload tasks and their progress.

use super::reference::{PutRequest, StorageReference};
use crate::array::{Disposal, EntityArray};
use crate::batch::FieldRecorder;
use crate::context::ContextInner;
use crate::entity::{Entity, EntityHeader};
use crate::error::{SyncError, SyncResult};
use crate::state::{TaskFlags, TaskState};
use mirra_protocol::{ProgressListener, PutPayload, RemoteResult, TransferProgress, UploadOutcome};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, trace};

type Outcome = Option<SyncResult<String>>;

struct TaskInner {
    state: TaskState,
    download_url: Option<String>,
}

/// A running or finished upload.
///
/// The outcome is published once. Destroying a task that has not finished
/// publishes [`SyncError::Cancelled`].
pub struct Task {
    header: EntityHeader,
    kind: &'static str,
    reference: Arc<StorageReference>,
    inner: Mutex<TaskInner>,
    outcome: watch::Sender<Outcome>,
}

impl Task {
    pub(crate) fn create(
        context: &ContextInner,
        reference: Arc<StorageReference>,
        payload: &PutPayload,
    ) -> SyncResult<Arc<Task>> {
        let kind = payload.kind();
        let total = payload.len();
        context.resolve(None, None, |seed| {
            Arc::new(Task {
                header: seed.into_header("task"),
                kind,
                reference,
                inner: Mutex::new(TaskInner {
                    state: TaskState::new(total),
                    download_url: None,
                }),
                outcome: watch::channel(None).0,
            })
        })
    }

    /// Spawns the upload on the context's registry.
    pub(crate) fn start(self: &Arc<Self>, context: &ContextInner, request: PutRequest) {
        let remote = Arc::clone(&context.remote().storage);
        let path = self.reference.path().clone();
        let weak = Arc::downgrade(self);
        let progress: ProgressListener = Box::new(move |event| {
            if let Some(task) = weak.upgrade() {
                task.on_progress(event);
            }
        });

        debug!(context = %context.identifier(), entity = %path, "upload started");
        let this = Arc::clone(self);
        let PutRequest { payload, metadata } = request;
        // The handle is dropped; the outcome is published through `promise`.
        let _operation = context.operations().invoke(
            format!("storage.put {path}"),
            Some(self.header.id()),
            async move {
                let result = remote.put(&path, payload, metadata, progress).await;
                this.finish(result)
            },
        );
    }

    /// Upload kind, `string` or `data`.
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Reference the upload writes to.
    pub fn reference(&self) -> &Arc<StorageReference> {
        &self.reference
    }

    /// Current state projections.
    pub fn state(&self) -> TaskFlags {
        self.inner.lock().state.flags()
    }

    /// Download URL, once completed.
    pub fn download_url(&self) -> Option<String> {
        self.inner.lock().download_url.clone()
    }

    /// Resolves with the download URL once the upload finished.
    pub fn promise(&self) -> impl Future<Output = SyncResult<String>> + Send + 'static {
        let mut outcome = self.outcome.subscribe();
        async move {
            loop {
                if let Some(result) = outcome.borrow_and_update().clone() {
                    return result;
                }
                if outcome.changed().await.is_err() {
                    return Err(SyncError::Cancelled);
                }
            }
        }
    }

    fn on_progress(&self, event: TransferProgress) {
        if self.header.is_destroyed() {
            return;
        }
        self.apply(|inner, changed| {
            inner
                .state
                .progress(event.bytes_transferred, event.total_bytes, changed)
        });
    }

    fn finish(&self, result: RemoteResult<UploadOutcome>) -> SyncResult<String> {
        if self.header.is_destroyed() {
            return Err(SyncError::Cancelled);
        }
        let outcome = match result {
            Ok(upload) => {
                self.apply(|inner, changed| {
                    inner.download_url = Some(upload.download_url.clone());
                    changed.changed("downloadURL");
                    inner.state.complete(changed)
                });
                self.reference.uploaded(&upload);
                Ok(upload.download_url)
            }
            Err(error) => {
                let error = SyncError::from(error);
                self.apply(|inner, changed| inner.state.fail(error.clone(), changed));
                Err(error)
            }
        };
        trace!(entity = %self.header.describe(), ok = outcome.is_ok(), "upload finished");
        self.publish(outcome.clone());
        self.leave_tasks();
        outcome
    }

    fn publish(&self, result: SyncResult<String>) {
        self.outcome.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(result);
            true
        });
    }

    /// Removes the task from `storage.tasks`.
    fn leave_tasks(&self) {
        let Ok(context) = self.header.context() else {
            return;
        };
        let Some(parent) = context.parent_of(self.header.id()) else {
            return;
        };
        let Some(tasks) = context.typed::<EntityArray<Task>>(parent) else {
            return;
        };
        let disposal = if context.config().destroy_completed_tasks {
            Disposal::Destroy
        } else {
            Disposal::Release
        };
        if let Err(error) = tasks.remove(self, disposal) {
            debug!(entity = %self.header.describe(), %error, "task left storage late");
        }
    }

    fn apply<R>(&self, f: impl FnOnce(&mut TaskInner, &FieldRecorder<'_>) -> R) -> R {
        self.header.changes().with_changes(true, |changed| {
            let mut inner = self.inner.lock();
            f(&mut inner, changed)
        })
    }
}

impl Entity for Task {
    fn header(&self) -> &EntityHeader {
        &self.header
    }

    fn serialized(&self) -> Value {
        let inner = self.inner.lock();
        let mut value = json!(inner.state.flags());
        value["downloadURL"] = json!(inner.download_url);
        value["type"] = json!(self.kind);
        value
    }

    fn will_destroy(&self) {
        self.publish(Err(SyncError::Cancelled));
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.header.id())
            .field("kind", &self.kind)
            .field("reference", &self.reference.path())
            .field("phase", &self.inner.lock().state.phase())
            .finish()
    }
}
