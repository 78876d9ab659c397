//! Integration tests for storage, references, metadata and transfer tasks.

mod common;

use common::{store, store_with};
use mirra_core::{
    Entity, MetadataLoadOptions, PutRequest, ReferenceLoadOptions, StoreConfig, SyncError,
};
use mirra_protocol::{ErrorCode, MetadataPatch, StorageLocation};
use mirra_testkit::{hello_metadata, DEFAULT_BUCKET, DOWNLOAD_HOST, HELLO};
use serde_json::json;
use std::sync::{Arc, Mutex};

#[tokio::test]
async fn storage_is_per_context() {
    let (_backend, store) = store();
    let root = store.storage().unwrap();
    assert!(Arc::ptr_eq(&root, &store.storage().unwrap()));
    assert_eq!(root.bucket(), DEFAULT_BUCKET);

    let nested = store.nest("foo").unwrap().storage().unwrap();
    assert!(!Arc::ptr_eq(&root, &nested));
}

#[tokio::test]
async fn storage_is_destroyed_with_its_context() {
    let (_backend, store) = store();
    let storage = store.storage().unwrap();
    let reference = storage.path("hello").unwrap();

    store.destroy();
    assert!(storage.is_destroyed());
    assert!(reference.is_destroyed());
    assert!(store.storage().is_err());
}

#[tokio::test]
async fn references_by_path_and_url() {
    let (_backend, store) = store();
    let storage = store.storage().unwrap();

    let reference = storage.path("hello").unwrap();
    assert_eq!(
        reference.serialized(),
        json!({ "bucket": DEFAULT_BUCKET, "fullPath": "hello", "name": "hello" })
    );
    assert!(Arc::ptr_eq(&reference, &storage.path("hello").unwrap()));
    assert!(Arc::ptr_eq(
        &reference,
        &storage
            .reference(StorageLocation::Url(format!("gs://{DEFAULT_BUCKET}/hello")))
            .unwrap()
    ));

    let remote = storage
        .reference(StorageLocation::Url("gs://foo/bar".into()))
        .unwrap();
    assert_eq!(
        remote.serialized(),
        json!({ "bucket": "foo", "fullPath": "bar", "name": "bar" })
    );

    assert!(storage
        .reference(StorageLocation::Url("https://foo/bar".into()))
        .is_err());
}

#[tokio::test]
async fn put_string_reports_progress_and_completes() {
    let (backend, store) = store();
    let reference = store.storage().unwrap().path("hello").unwrap();

    let task = reference
        .put(PutRequest::string(HELLO).with_metadata(hello_metadata()))
        .unwrap();
    assert_eq!(task.kind(), "string");
    assert!(Arc::ptr_eq(task.reference(), &reference));
    assert_eq!(
        task.serialized(),
        json!({
            "bytesTransferred": 0,
            "downloadURL": null,
            "error": null,
            "isCompleted": false,
            "isError": false,
            "isRunning": true,
            "percent": 0,
            "totalBytes": 27,
            "type": "string",
        })
    );

    let url = task.promise().await.unwrap();
    assert!(url.starts_with(DOWNLOAD_HOST));
    assert_eq!(
        task.serialized(),
        json!({
            "bytesTransferred": 27,
            "downloadURL": url,
            "error": null,
            "isCompleted": true,
            "isError": false,
            "isRunning": false,
            "percent": 100,
            "totalBytes": 27,
            "type": "string",
        })
    );
    assert_eq!(reference.url(), Some(url));

    let stored = backend.object(reference.path()).unwrap();
    assert_eq!(stored.bytes.as_ref(), HELLO.as_bytes());
    assert_eq!(stored.metadata.content_type.as_deref(), Some("text/plain"));
}

#[tokio::test]
async fn put_data_payload() {
    let (_backend, store) = store();
    let reference = store.storage().unwrap().path("blob").unwrap();

    let task = reference
        .put(PutRequest::data(&b"hello world as a blob"[..]))
        .unwrap();
    assert_eq!(task.kind(), "data");
    task.promise().await.unwrap();
    assert_eq!(task.state().total_bytes, 21);
    assert_eq!(task.state().percent, 100);
}

#[tokio::test]
async fn progress_is_batched_per_event() {
    let (backend, store) = store();
    backend.set_chunk_size(10);
    let reference = store.storage().unwrap().path("hello").unwrap();

    let task = reference.put(PutRequest::string(HELLO)).unwrap();
    let progress = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&progress);
    let observed = Arc::clone(&task);
    task.subscribe(move |changes| {
        if changes.contains("bytesTransferred") {
            sink.lock().unwrap().push(observed.state().bytes_transferred);
        }
    });

    task.promise().await.unwrap();
    assert_eq!(*progress.lock().unwrap(), vec![10, 20, 27]);
}

#[tokio::test]
async fn running_tasks_are_listed_in_storage() {
    let (_backend, store) = store();
    let storage = store.storage().unwrap();
    let tasks = storage.tasks().unwrap();
    assert!(tasks.is_empty());

    let task = storage.path("hello").unwrap().put(PutRequest::string(HELLO)).unwrap();
    assert_eq!(tasks.len(), 1);
    assert!(tasks.contains(&task));
    assert_eq!(storage.serialized()["tasks"][0]["isRunning"], true);

    task.promise().await.unwrap();
    store.settle().await;

    assert!(tasks.is_empty());
    assert!(!task.is_destroyed());
    assert!(task.state().is_completed);
}

#[tokio::test]
async fn finished_uploads_do_not_accumulate() {
    let (_backend, store) = store();
    let storage = store.storage().unwrap();
    let reference = storage.path("hello").unwrap();
    let tasks = storage.tasks().unwrap();
    let baseline = store.entity_count();

    for _ in 0..50 {
        let task = reference.put(PutRequest::string(HELLO)).unwrap();
        task.promise().await.unwrap();
    }
    store.settle().await;

    assert!(tasks.is_empty());
    assert_eq!(store.entity_count(), baseline);
}

#[tokio::test]
async fn released_task_stays_usable_for_its_holder() {
    let (_backend, store) = store();
    let task = store
        .storage()
        .unwrap()
        .path("hello")
        .unwrap()
        .put(PutRequest::string(HELLO))
        .unwrap();
    let url = task.promise().await.unwrap();
    store.settle().await;

    assert!(!task.is_destroyed());
    assert_eq!(task.download_url(), Some(url.clone()));
    assert_eq!(task.serialized()["percent"], 100);
    assert_eq!(task.promise().await, Ok(url));

    task.destroy();
    assert!(task.is_destroyed());
}

#[tokio::test]
async fn completed_tasks_can_be_destroyed() {
    let (_backend, store) = store_with(StoreConfig::default().with_destroy_completed_tasks(true));
    let storage = store.storage().unwrap();

    let task = storage.path("hello").unwrap().put(PutRequest::string(HELLO)).unwrap();
    store.settle().await;

    assert!(task.is_destroyed());
    assert!(storage.tasks().unwrap().is_empty());
    assert!(task.promise().await.is_ok());
}

#[tokio::test]
async fn settle_waits_for_uploads() {
    let (_backend, store) = store();
    let storage = store.storage().unwrap();
    let task = storage.path("hello").unwrap().put(PutRequest::string(HELLO)).unwrap();

    store.settle().await;
    assert!(task.state().is_completed);
    assert_eq!(storage.tasks().unwrap().len(), 0);
}

#[tokio::test]
async fn forbidden_upload_fails_unauthorized() {
    let (_backend, store) = store();
    let reference = store.storage().unwrap().path("forbidden/hello").unwrap();
    let task = reference
        .put(PutRequest::string(HELLO).with_metadata(MetadataPatch::new().with_content_type("text/plain")))
        .unwrap();

    let error = task.promise().await.unwrap_err();
    assert_eq!(error.code(), Some(&ErrorCode::Unauthorized));

    let serialized = task.serialized();
    assert_eq!(serialized["isCompleted"], true);
    assert_eq!(serialized["isError"], true);
    assert_eq!(serialized["isRunning"], false);
    assert_eq!(serialized["bytesTransferred"], 0);
    assert_eq!(serialized["percent"], 0);
    assert_eq!(serialized["totalBytes"], 27);
    assert_eq!(serialized["downloadURL"], json!(null));
    assert_eq!(serialized["error"]["code"], "unauthorized");
}

#[tokio::test]
async fn destroying_a_nested_context_cancels_its_uploads() {
    let (backend, store) = store();
    let nested = store.nest("nested").unwrap();
    let reference = nested.storage().unwrap().path("hello").unwrap();
    let task = reference.put(PutRequest::string("hey")).unwrap();
    let outcome = task.promise();

    nested.destroy();
    assert!(task.is_destroyed());
    assert!(matches!(outcome.await, Err(SyncError::Cancelled)));
    assert!(matches!(task.promise().await, Err(SyncError::Cancelled)));

    store.settle().await;
    assert!(backend.object(reference.path()).is_none());
    assert!(!store.is_destroyed());
}

#[tokio::test]
async fn destroying_a_task_removes_it_from_storage() {
    let (_backend, store) = store();
    let storage = store.storage().unwrap();
    let tasks = storage.tasks().unwrap();
    let task = storage.path("hello").unwrap().put(PutRequest::string(HELLO)).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    tasks.subscribe(move |changes| sink.lock().unwrap().push(changes.fields().to_vec()));

    task.destroy();
    assert!(tasks.is_empty());
    assert_eq!(*seen.lock().unwrap(), vec![vec!["removed", "length", "serialized"]]);
    assert!(matches!(task.promise().await, Err(SyncError::Cancelled)));
}

#[tokio::test]
async fn metadata_of_an_existing_object() {
    let (backend, store) = store();
    backend.put_object("hello", HELLO);
    let metadata = store.storage().unwrap().path("hello").unwrap().metadata().unwrap();

    metadata.load(MetadataLoadOptions::default()).await.unwrap();
    let state = metadata.state();
    assert!(state.is_loaded);
    assert_eq!(state.is_existing, Some(true));
    assert_eq!(metadata.raw().unwrap().size, 27);

    metadata
        .update(MetadataPatch::new().with_custom("owner", "duck"))
        .await
        .unwrap();
    assert_eq!(
        metadata.raw().unwrap().custom_metadata.get("owner").map(String::as_str),
        Some("duck")
    );
    assert_eq!(metadata.serialized()["raw"]["customMetadata"]["owner"], "duck");
}

#[tokio::test]
async fn optional_missing_metadata_is_not_an_error() {
    let (_backend, store) = store();
    let metadata = store.storage().unwrap().path("missing").unwrap().metadata().unwrap();

    metadata
        .load(MetadataLoadOptions {
            optional: true,
            reload: false,
        })
        .await
        .unwrap();

    let state = metadata.serialized()["state"].clone();
    assert_eq!(state["isExisting"], false);
    assert_eq!(state["isLoaded"], true);
    assert_eq!(state["isError"], false);
}

#[tokio::test]
async fn required_missing_metadata_is_an_error() {
    let (_backend, store) = store();
    let metadata = store.storage().unwrap().path("missing").unwrap().metadata().unwrap();

    let error = metadata
        .load(MetadataLoadOptions::default())
        .await
        .unwrap_err();
    assert_eq!(error.code(), Some(&ErrorCode::NotFound));

    let state = metadata.state();
    assert_eq!(state.is_existing, Some(false));
    assert!(state.is_error);
    assert!(!state.is_loaded);
}

#[tokio::test]
async fn reference_load_resolves_url_and_metadata() {
    let (backend, store) = store();
    backend.put_object("hello", HELLO);
    let reference = store.storage().unwrap().path("hello").unwrap();

    reference
        .load(ReferenceLoadOptions {
            url: true,
            metadata: true,
            optional: false,
        })
        .await
        .unwrap();

    assert!(reference.url().unwrap().starts_with(DOWNLOAD_HOST));
    assert!(reference.metadata().unwrap().state().is_loaded);

    reference.delete().await.unwrap();
    assert_eq!(reference.url(), None);
    assert_eq!(reference.metadata().unwrap().state().is_existing, Some(false));
}

#[tokio::test]
async fn upload_refreshes_loaded_metadata() {
    let (_backend, store) = store();
    let reference = store.storage().unwrap().path("hello").unwrap();
    let metadata = reference.metadata().unwrap();
    metadata
        .load(MetadataLoadOptions {
            optional: true,
            reload: false,
        })
        .await
        .unwrap();
    assert_eq!(metadata.state().is_existing, Some(false));

    reference
        .put(PutRequest::string(HELLO))
        .unwrap()
        .promise()
        .await
        .unwrap();
    assert_eq!(metadata.state().is_existing, Some(true));
    assert_eq!(metadata.raw().unwrap().size, 27);
}

#[tokio::test]
async fn storage_calls_can_require_sign_in() {
    let (backend, store) = store();
    backend.require_auth(true);
    let reference = store.storage().unwrap().path("hello").unwrap();

    let error = reference
        .put(PutRequest::string(HELLO))
        .unwrap()
        .promise()
        .await
        .unwrap_err();
    assert_eq!(error.code(), Some(&ErrorCode::Unauthenticated));

    let auth = store.auth().unwrap();
    let user = auth.sign_in_anonymously().await.unwrap();
    assert!(user.is_anonymous);
    assert_eq!(auth.user(), Some(user.clone()));
    assert_eq!(auth.serialized()["user"]["uid"], user.uid);

    reference
        .put(PutRequest::string(HELLO))
        .unwrap()
        .promise()
        .await
        .unwrap();

    auth.sign_out().await.unwrap();
    assert_eq!(auth.user(), None);
}
