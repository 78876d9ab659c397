//! Remote capabilities consumed by the sync core.
//!
//! The core never talks to a concrete backend. It is handed a
//! [`RemoteServices`] bundle and only ever calls the traits below.

use crate::error::RemoteResult;
use crate::path::StoragePath;
use crate::snapshot::{DocumentSnapshot, QueryTarget, Snapshot, SnapshotOptions};
use crate::storage::{MetadataPatch, ObjectMetadata, PutPayload, TransferProgress, UploadOutcome};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Callback invoked for every snapshot (or terminal error) of a subscription.
pub type SnapshotListener = Box<dyn Fn(RemoteResult<Snapshot>) + Send + Sync>;

/// Callback invoked for every progress event of an upload.
pub type ProgressListener = Box<dyn Fn(TransferProgress) + Send + Sync>;

/// Handle returned by [`DocumentSource::on_snapshot`].
///
/// Calling [`remove`](Self::remove) closes the subscription. Dropping the
/// handle without removing it leaves the subscription open.
pub struct ListenerRegistration {
    remove: Option<Box<dyn FnOnce() + Send>>,
}

impl ListenerRegistration {
    /// Creates a registration that runs `remove` when the listener is removed.
    pub fn new(remove: impl FnOnce() + Send + 'static) -> Self {
        Self {
            remove: Some(Box::new(remove)),
        }
    }

    /// A registration with nothing to close.
    pub fn noop() -> Self {
        Self { remove: None }
    }

    /// Closes the subscription.
    pub fn remove(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl fmt::Debug for ListenerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistration")
            .field("active", &self.remove.is_some())
            .finish()
    }
}

/// A signed-in user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Stable user id.
    pub uid: String,
    /// True for anonymous accounts.
    pub is_anonymous: bool,
}

/// Remote document store.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Reads a document once. A missing document is a snapshot with
    /// `exists == false`, not an error.
    async fn get(&self, path: &str) -> RemoteResult<DocumentSnapshot>;

    /// Writes a document. With `merge`, top-level fields are merged into the
    /// existing data.
    async fn set(&self, path: &str, data: Value, merge: bool) -> RemoteResult<()>;

    /// Deletes a document.
    async fn delete(&self, path: &str) -> RemoteResult<()>;

    /// Opens a live subscription.
    ///
    /// Implementations deliver snapshots in remote order and must never call
    /// `listener` again after the returned registration has been removed.
    /// A permission or not-found failure is delivered as `Err` and ends the
    /// subscription.
    fn on_snapshot(
        &self,
        target: &QueryTarget,
        options: SnapshotOptions,
        listener: SnapshotListener,
    ) -> ListenerRegistration;
}

/// Remote blob storage.
#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Default bucket for path-based references.
    fn bucket(&self) -> &str;

    /// Uploads `payload`, reporting progress through `progress`.
    async fn put(
        &self,
        path: &StoragePath,
        payload: PutPayload,
        metadata: MetadataPatch,
        progress: ProgressListener,
    ) -> RemoteResult<UploadOutcome>;

    /// Reads object metadata. Fails with `not-found` for missing objects.
    async fn get_metadata(&self, path: &StoragePath) -> RemoteResult<ObjectMetadata>;

    /// Updates object metadata and returns the new metadata.
    async fn update_metadata(
        &self,
        path: &StoragePath,
        patch: MetadataPatch,
    ) -> RemoteResult<ObjectMetadata>;

    /// Resolves the public download URL of an object.
    async fn download_url(&self, path: &StoragePath) -> RemoteResult<String>;

    /// Deletes an object.
    async fn delete(&self, path: &StoragePath) -> RemoteResult<()>;
}

/// Remote authentication.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Signs in with a fresh anonymous account.
    async fn sign_in_anonymously(&self) -> RemoteResult<User>;

    /// Signs the current user out.
    async fn sign_out(&self) -> RemoteResult<()>;

    /// Currently signed-in user, if any.
    fn current_user(&self) -> Option<User>;
}

/// The bundle of remote capabilities a store is created with.
#[derive(Clone)]
pub struct RemoteServices {
    /// Document store.
    pub documents: Arc<dyn DocumentSource>,
    /// Blob storage.
    pub storage: Arc<dyn BlobStorage>,
    /// Authentication.
    pub auth: Arc<dyn Authenticator>,
}

impl RemoteServices {
    /// Bundles three capabilities.
    pub fn new(
        documents: Arc<dyn DocumentSource>,
        storage: Arc<dyn BlobStorage>,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            documents,
            storage,
            auth,
        }
    }
}

impl fmt::Debug for RemoteServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteServices")
            .field("bucket", &self.storage.bucket())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn registration_runs_remove_once() {
        let removed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&removed);
        let registration = ListenerRegistration::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        registration.remove();
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn noop_registration() {
        let registration = ListenerRegistration::noop();
        assert_eq!(format!("{registration:?}"), "ListenerRegistration { active: false }");
        registration.remove();
    }
}
