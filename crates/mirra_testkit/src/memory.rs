//! In-memory remote backend.
//!
//! [`MemoryBackend`] implements every remote capability over plain maps.
//! Subscriptions are pumped by one tokio task each, so snapshots reach
//! listeners asynchronously and in write order, like a real backend.

use async_trait::async_trait;
use bytes::Bytes;
use mirra_protocol::{
    Authenticator, BlobStorage, DocumentSnapshot, DocumentSource, ListenerRegistration,
    MetadataPatch, ObjectMetadata, ProgressListener, PutPayload, QueryTarget, RemoteError,
    RemoteResult, RemoteServices, Snapshot, SnapshotData, SnapshotListener, SnapshotMetadata,
    SnapshotOptions, StoragePath, TransferProgress, UploadOutcome, User,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{trace, warn};

/// Default bucket of a new backend.
pub const DEFAULT_BUCKET: &str = "mirra-test.appspot.com";

/// Host of generated download URLs.
pub const DOWNLOAD_HOST: &str = "https://storage.memory.test";

/// A stored blob.
#[derive(Debug, Clone)]
pub struct StoredObject {
    /// Content.
    pub bytes: Bytes,
    /// Metadata.
    pub metadata: ObjectMetadata,
}

struct Subscriber {
    target: QueryTarget,
    sender: mpsc::UnboundedSender<RemoteResult<Snapshot>>,
}

struct Rules {
    denied: Vec<String>,
    require_auth: bool,
    offline: bool,
    chunk_size: usize,
    chunk_delay: Option<Duration>,
}

struct BackendState {
    documents: BTreeMap<String, Value>,
    objects: BTreeMap<String, StoredObject>,
    subscribers: BTreeMap<u64, Subscriber>,
    user: Option<User>,
    rules: Rules,
    generation: u64,
}

struct Shared {
    bucket: String,
    state: Mutex<BackendState>,
    next_subscriber: AtomicU64,
    next_user: AtomicU64,
}

/// In-memory implementation of the remote capabilities.
///
/// Cloning yields a handle to the same backend. Paths below `forbidden/`
/// are denied by default.
#[derive(Clone)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl MemoryBackend {
    /// Creates an empty backend with [`DEFAULT_BUCKET`].
    pub fn new() -> Self {
        Self::with_bucket(DEFAULT_BUCKET)
    }

    /// Creates an empty backend with the given default bucket.
    pub fn with_bucket(bucket: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                bucket: bucket.into(),
                state: Mutex::new(BackendState {
                    documents: BTreeMap::new(),
                    objects: BTreeMap::new(),
                    subscribers: BTreeMap::new(),
                    user: None,
                    rules: Rules {
                        denied: vec!["forbidden/".to_string()],
                        require_auth: false,
                        offline: false,
                        chunk_size: 8,
                        chunk_delay: None,
                    },
                    generation: 0,
                }),
                next_subscriber: AtomicU64::new(1),
                next_user: AtomicU64::new(1),
            }),
        }
    }

    /// Bundles this backend as every remote capability.
    pub fn remote(&self) -> RemoteServices {
        RemoteServices::new(
            Arc::new(self.clone()),
            Arc::new(self.clone()),
            Arc::new(self.clone()),
        )
    }

    /// Denies every document and object path starting with `prefix`.
    pub fn deny(&self, prefix: impl Into<String>) {
        self.shared.state.lock().rules.denied.push(prefix.into());
    }

    /// Requires a signed-in user for storage calls.
    pub fn require_auth(&self, require: bool) {
        self.shared.state.lock().rules.require_auth = require;
    }

    /// Makes every remote call fail with `unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.shared.state.lock().rules.offline = offline;
    }

    /// Sets the number of bytes reported per progress event.
    pub fn set_chunk_size(&self, chunk_size: usize) {
        self.shared.state.lock().rules.chunk_size = chunk_size.max(1);
    }

    /// Sleeps between upload chunks.
    pub fn set_chunk_delay(&self, delay: Option<Duration>) {
        self.shared.state.lock().rules.chunk_delay = delay;
    }

    /// Writes a document directly and notifies subscribers.
    pub fn put_document(&self, path: &str, data: Value) {
        let mut state = self.shared.state.lock();
        state.documents.insert(path.to_string(), data);
        notify(&mut state, path);
    }

    /// Removes a document directly and notifies subscribers.
    pub fn remove_document(&self, path: &str) {
        let mut state = self.shared.state.lock();
        state.documents.remove(path);
        notify(&mut state, path);
    }

    /// Stored data of a document.
    pub fn document(&self, path: &str) -> Option<Value> {
        self.shared.state.lock().documents.get(path).cloned()
    }

    /// Stores an object directly in the default bucket.
    pub fn put_object(&self, full_path: &str, bytes: impl Into<Bytes>) -> ObjectMetadata {
        let path = StoragePath::new(self.shared.bucket.as_str(), full_path);
        let mut state = self.shared.state.lock();
        store_object(&mut state, &path, bytes.into(), &MetadataPatch::default())
    }

    /// A stored object.
    pub fn object(&self, path: &StoragePath) -> Option<StoredObject> {
        self.shared.state.lock().objects.get(&path.url()).cloned()
    }

    /// Number of open subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.shared.state.lock().subscribers.len()
    }

    fn check(&self, path: &str) -> RemoteResult<()> {
        let state = self.shared.state.lock();
        if state.rules.offline {
            return Err(RemoteError::unavailable("backend is offline"));
        }
        if state.rules.denied.iter().any(|prefix| path.starts_with(prefix)) {
            return Err(RemoteError::permission_denied(format!(
                "missing or insufficient permissions for '{path}'"
            )));
        }
        Ok(())
    }

    fn check_object(&self, path: &StoragePath) -> RemoteResult<()> {
        let state = self.shared.state.lock();
        if state.rules.offline {
            return Err(RemoteError::unavailable("backend is offline"));
        }
        if state.rules.require_auth && state.user.is_none() {
            return Err(RemoteError::unauthenticated(
                "user is not authenticated, please authenticate and try again",
            ));
        }
        if state
            .rules
            .denied
            .iter()
            .any(|prefix| path.full_path.starts_with(prefix))
        {
            return Err(RemoteError::unauthorized(format!(
                "user does not have permission to access '{}'",
                path.full_path
            )));
        }
        Ok(())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn snapshot_of(state: &BackendState, target: &QueryTarget, metadata: SnapshotMetadata) -> Snapshot {
    let data = match target {
        QueryTarget::Document(path) => SnapshotData::Document(document_snapshot(state, path)),
        QueryTarget::Collection(_) => SnapshotData::Query(
            state
                .documents
                .iter()
                .filter(|(path, _)| target.covers(path))
                .map(|(path, data)| DocumentSnapshot::existing(path.as_str(), data.clone()))
                .collect(),
        ),
    };
    Snapshot::new(data, metadata)
}

fn document_snapshot(state: &BackendState, path: &str) -> DocumentSnapshot {
    match state.documents.get(path) {
        Some(data) => DocumentSnapshot::existing(path, data.clone()),
        None => DocumentSnapshot::missing(path),
    }
}

/// Pushes a fresh snapshot to every subscriber covering `path`.
fn notify(state: &mut BackendState, path: &str) {
    let mut closed = Vec::new();
    for (id, subscriber) in &state.subscribers {
        if !subscriber.target.covers(path) {
            continue;
        }
        let snapshot = snapshot_of(state, &subscriber.target, SnapshotMetadata::server());
        if subscriber.sender.send(Ok(snapshot)).is_err() {
            closed.push(*id);
        }
    }
    for id in closed {
        state.subscribers.remove(&id);
    }
}

fn store_object(
    state: &mut BackendState,
    path: &StoragePath,
    bytes: Bytes,
    patch: &MetadataPatch,
) -> ObjectMetadata {
    state.generation += 1;
    let mut metadata = ObjectMetadata {
        bucket: path.bucket.clone(),
        full_path: path.full_path.clone(),
        name: path.name().to_string(),
        size: bytes.len() as u64,
        content_type: None,
        custom_metadata: BTreeMap::new(),
        generation: state.generation,
    };
    patch.apply_to(&mut metadata);
    state.objects.insert(
        path.url(),
        StoredObject {
            bytes,
            metadata: metadata.clone(),
        },
    );
    metadata
}

fn merge(current: Option<Value>, data: Value) -> Value {
    match (current, data) {
        (Some(Value::Object(mut current)), Value::Object(patch)) => {
            current.extend(patch);
            Value::Object(current)
        }
        (_, data) => data,
    }
}

#[async_trait]
impl DocumentSource for MemoryBackend {
    async fn get(&self, path: &str) -> RemoteResult<DocumentSnapshot> {
        tokio::task::yield_now().await;
        self.check(path)?;
        Ok(document_snapshot(&self.shared.state.lock(), path))
    }

    async fn set(&self, path: &str, data: Value, merge_fields: bool) -> RemoteResult<()> {
        tokio::task::yield_now().await;
        self.check(path)?;
        let mut state = self.shared.state.lock();
        let data = if merge_fields {
            merge(state.documents.get(path).cloned(), data)
        } else {
            data
        };
        state.documents.insert(path.to_string(), data);
        notify(&mut state, path);
        Ok(())
    }

    async fn delete(&self, path: &str) -> RemoteResult<()> {
        tokio::task::yield_now().await;
        self.check(path)?;
        let mut state = self.shared.state.lock();
        state.documents.remove(path);
        notify(&mut state, path);
        Ok(())
    }

    fn on_snapshot(
        &self,
        target: &QueryTarget,
        options: SnapshotOptions,
        listener: SnapshotListener,
    ) -> ListenerRegistration {
        let Ok(runtime) = Handle::try_current() else {
            warn!(%target, "subscription opened outside a tokio runtime");
            return ListenerRegistration::noop();
        };

        let (sender, mut receiver) = mpsc::unbounded_channel();
        let checked = match target {
            QueryTarget::Document(path) | QueryTarget::Collection(path) => self.check(path),
        };
        let id = self.shared.next_subscriber.fetch_add(1, Ordering::SeqCst);
        match checked {
            Err(error) => {
                let _ = sender.send(Err(error));
            }
            Ok(()) => {
                let mut state = self.shared.state.lock();
                if options.include_metadata_changes {
                    let _ = sender.send(Ok(snapshot_of(&state, target, SnapshotMetadata::cache())));
                }
                let _ = sender.send(Ok(snapshot_of(&state, target, SnapshotMetadata::server())));
                state.subscribers.insert(
                    id,
                    Subscriber {
                        target: target.clone(),
                        sender,
                    },
                );
            }
        }
        trace!(%target, id, "subscription opened");

        let active = Arc::new(AtomicBool::new(true));
        let pumping = Arc::clone(&active);
        runtime.spawn(async move {
            while let Some(result) = receiver.recv().await {
                if !pumping.load(Ordering::SeqCst) {
                    break;
                }
                let last = result.is_err();
                listener(result);
                if last {
                    break;
                }
            }
        });

        let shared = Arc::clone(&self.shared);
        ListenerRegistration::new(move || {
            active.store(false, Ordering::SeqCst);
            shared.state.lock().subscribers.remove(&id);
        })
    }
}

#[async_trait]
impl BlobStorage for MemoryBackend {
    fn bucket(&self) -> &str {
        &self.shared.bucket
    }

    async fn put(
        &self,
        path: &StoragePath,
        payload: PutPayload,
        metadata: MetadataPatch,
        progress: ProgressListener,
    ) -> RemoteResult<UploadOutcome> {
        tokio::task::yield_now().await;
        self.check_object(path)?;

        let (chunk_size, delay) = {
            let state = self.shared.state.lock();
            (state.rules.chunk_size, state.rules.chunk_delay)
        };
        let bytes = payload.into_bytes();
        let total = bytes.len() as u64;
        progress(TransferProgress::new(0, total));

        let mut sent = 0usize;
        while sent < bytes.len() {
            match delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => tokio::task::yield_now().await,
            }
            sent = (sent + chunk_size).min(bytes.len());
            progress(TransferProgress::new(sent as u64, total));
        }

        let mut state = self.shared.state.lock();
        let metadata = store_object(&mut state, path, bytes, &metadata);
        Ok(UploadOutcome {
            download_url: download_url(path),
            metadata,
        })
    }

    async fn get_metadata(&self, path: &StoragePath) -> RemoteResult<ObjectMetadata> {
        tokio::task::yield_now().await;
        self.check_object(path)?;
        self.shared
            .state
            .lock()
            .objects
            .get(&path.url())
            .map(|object| object.metadata.clone())
            .ok_or_else(|| missing_object(path))
    }

    async fn update_metadata(
        &self,
        path: &StoragePath,
        patch: MetadataPatch,
    ) -> RemoteResult<ObjectMetadata> {
        tokio::task::yield_now().await;
        self.check_object(path)?;
        let mut state = self.shared.state.lock();
        let object = state
            .objects
            .get_mut(&path.url())
            .ok_or_else(|| missing_object(path))?;
        patch.apply_to(&mut object.metadata);
        Ok(object.metadata.clone())
    }

    async fn download_url(&self, path: &StoragePath) -> RemoteResult<String> {
        tokio::task::yield_now().await;
        self.check_object(path)?;
        if self.shared.state.lock().objects.contains_key(&path.url()) {
            Ok(download_url(path))
        } else {
            Err(missing_object(path))
        }
    }

    async fn delete(&self, path: &StoragePath) -> RemoteResult<()> {
        tokio::task::yield_now().await;
        self.check_object(path)?;
        self.shared
            .state
            .lock()
            .objects
            .remove(&path.url())
            .map(|_| ())
            .ok_or_else(|| missing_object(path))
    }
}

fn download_url(path: &StoragePath) -> String {
    format!(
        "{DOWNLOAD_HOST}/v0/b/{}/o/{}?alt=media",
        path.bucket,
        path.full_path.replace('/', "%2F")
    )
}

fn missing_object(path: &StoragePath) -> RemoteError {
    RemoteError::not_found(format!("object '{}' does not exist", path.full_path))
}

#[async_trait]
impl Authenticator for MemoryBackend {
    async fn sign_in_anonymously(&self) -> RemoteResult<User> {
        tokio::task::yield_now().await;
        let mut state = self.shared.state.lock();
        if state.rules.offline {
            return Err(RemoteError::unavailable("backend is offline"));
        }
        let n = self.shared.next_user.fetch_add(1, Ordering::SeqCst);
        let user = User {
            uid: format!("anonymous-{n}"),
            is_anonymous: true,
        };
        state.user = Some(user.clone());
        Ok(user)
    }

    async fn sign_out(&self) -> RemoteResult<()> {
        tokio::task::yield_now().await;
        self.shared.state.lock().user = None;
        Ok(())
    }

    fn current_user(&self) -> Option<User> {
        self.shared.state.lock().user.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirra_protocol::ErrorCode;
    use serde_json::json;

    fn recorder() -> (SnapshotListener, mpsc::UnboundedReceiver<RemoteResult<Snapshot>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
            rx,
        )
    }

    #[tokio::test]
    async fn documents_round_trip() {
        let backend = MemoryBackend::new();
        backend
            .set("ducks/yellow", json!({ "name": "Yellow" }), false)
            .await
            .unwrap();
        backend
            .set("ducks/yellow", json!({ "age": 2 }), true)
            .await
            .unwrap();

        let snapshot = DocumentSource::get(&backend, "ducks/yellow").await.unwrap();
        assert!(snapshot.exists);
        assert_eq!(snapshot.data, Some(json!({ "name": "Yellow", "age": 2 })));

        DocumentSource::delete(&backend, "ducks/yellow").await.unwrap();
        assert!(!DocumentSource::get(&backend, "ducks/yellow").await.unwrap().exists);
    }

    #[tokio::test]
    async fn subscription_delivers_initial_and_updates() {
        let backend = MemoryBackend::new();
        backend.put_document("ducks/yellow", json!({ "name": "Yellow" }));

        let (listener, mut rx) = recorder();
        let registration = backend.on_snapshot(
            &QueryTarget::Collection("ducks".into()),
            SnapshotOptions::default(),
            listener,
        );

        let first = rx.recv().await.unwrap().unwrap();
        assert_eq!(first.data.documents().len(), 1);

        backend.put_document("ducks/green", json!({ "name": "Green" }));
        let second = rx.recv().await.unwrap().unwrap();
        assert_eq!(second.data.documents().len(), 2);

        registration.remove();
        assert_eq!(backend.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn denied_subscription_fails() {
        let backend = MemoryBackend::new();
        let (listener, mut rx) = recorder();
        let _registration = backend.on_snapshot(
            &QueryTarget::Document("forbidden/duck".into()),
            SnapshotOptions::default(),
            listener,
        );
        let error = rx.recv().await.unwrap().unwrap_err();
        assert_eq!(error.code, ErrorCode::PermissionDenied);
    }

    #[tokio::test]
    async fn upload_reports_progress() {
        let backend = MemoryBackend::new();
        backend.set_chunk_size(10);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let path = StoragePath::new(DEFAULT_BUCKET, "hello");

        let outcome = backend
            .put(
                &path,
                PutPayload::String("hello world as a raw string".into()),
                MetadataPatch::new().with_content_type("text/plain"),
                Box::new(move |event| sink.lock().push(event.bytes_transferred)),
            )
            .await
            .unwrap();

        assert_eq!(*events.lock(), vec![0, 10, 20, 27]);
        assert_eq!(outcome.metadata.size, 27);
        assert_eq!(outcome.metadata.content_type.as_deref(), Some("text/plain"));
        assert!(outcome.download_url.starts_with(DOWNLOAD_HOST));
    }

    #[tokio::test]
    async fn forbidden_upload_is_unauthorized() {
        let backend = MemoryBackend::new();
        let path = StoragePath::new(DEFAULT_BUCKET, "forbidden/hello");
        let error = backend
            .put(
                &path,
                PutPayload::String("nope".into()),
                MetadataPatch::new(),
                Box::new(|_| {}),
            )
            .await
            .unwrap_err();
        assert_eq!(error.code, ErrorCode::Unauthorized);
    }

    #[tokio::test]
    async fn missing_object_metadata() {
        let backend = MemoryBackend::new();
        let path = StoragePath::new(DEFAULT_BUCKET, "missing");
        assert!(backend.get_metadata(&path).await.unwrap_err().is_not_found());
        assert!(backend.download_url(&path).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn storage_can_require_auth() {
        let backend = MemoryBackend::new();
        backend.require_auth(true);
        backend.put_object("hello", Bytes::from_static(b"hi"));
        let path = StoragePath::new(DEFAULT_BUCKET, "hello");

        let error = backend.get_metadata(&path).await.unwrap_err();
        assert_eq!(error.code, ErrorCode::Unauthenticated);

        let user = backend.sign_in_anonymously().await.unwrap();
        assert!(user.is_anonymous);
        assert_eq!(backend.current_user(), Some(user));
        assert_eq!(backend.get_metadata(&path).await.unwrap().size, 2);
    }
}
