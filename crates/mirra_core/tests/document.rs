//! Integration tests for documents.

mod common;

use common::{eventually, store};
use mirra_core::{DocumentInit, Entity, LoadOptions, SaveOptions};
use mirra_protocol::ErrorCode;
use mirra_testkit::yellow_duck;
use serde_json::json;
use std::sync::{Arc, Mutex};

#[tokio::test]
async fn new_document_is_new_and_dirty() {
    let (_backend, store) = store();
    let doc = store
        .new_document(DocumentInit::at("ducks/yellow").unwrap().with_data(yellow_duck()))
        .unwrap();

    let serialized = doc.serialized();
    assert_eq!(serialized["data"], json!({ "name": "Yellow" }));
    assert_eq!(
        serialized["ref"],
        json!({ "collection": "ducks", "id": "yellow", "path": "ducks/yellow" })
    );
    assert_eq!(serialized["state"]["isNew"], true);
    assert_eq!(serialized["state"]["isDirty"], true);
    assert_eq!(serialized["state"]["isLoaded"], false);
    assert_eq!(serialized["state"]["isError"], false);
    assert_eq!(serialized["state"]["error"], json!(null));
}

#[tokio::test]
async fn documents_are_canonical_per_path() {
    let (_backend, store) = store();
    let first = store.doc("ducks/yellow").unwrap();
    let second = store.doc("ducks/yellow").unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    let other = store.doc("ducks/green").unwrap();
    assert!(!Arc::ptr_eq(&first, &other));

    first.destroy();
    assert!(first.is_destroyed());
    let fresh = store.doc("ducks/yellow").unwrap();
    assert!(!Arc::ptr_eq(&first, &fresh));
    assert!(!fresh.is_destroyed());
}

#[tokio::test]
async fn load_existing_document() {
    let (backend, store) = store();
    backend.put_document("ducks/yellow", yellow_duck());

    let doc = store.doc("ducks/yellow").unwrap();
    doc.load(LoadOptions::default()).await.unwrap();

    assert_eq!(doc.data(), yellow_duck());
    let state = doc.state();
    assert!(state.is_loaded);
    assert!(!state.is_new);
    assert_eq!(state.is_existing, Some(true));
    assert!(!doc.is_dirty());
}

#[tokio::test]
async fn load_missing_document_is_an_error_unless_optional() {
    let (_backend, store) = store();
    let doc = store.doc("ducks/missing").unwrap();

    let error = doc.load(LoadOptions::default()).await.unwrap_err();
    assert!(error.is_not_found());
    let state = doc.state();
    assert!(state.is_error);
    assert_eq!(state.is_existing, Some(false));

    doc.load(LoadOptions {
        optional: true,
        reload: true,
    })
    .await
    .unwrap();
    let state = doc.state();
    assert!(!state.is_error);
    assert!(state.is_loaded);
    assert_eq!(state.is_existing, Some(false));
}

#[tokio::test]
async fn save_assigns_an_id_and_becomes_canonical() {
    let (backend, store) = store();
    let doc = store
        .new_document(DocumentInit::collection("ducks").with_data(yellow_duck()))
        .unwrap();
    assert_eq!(doc.path(), None);

    doc.save(SaveOptions::default()).await.unwrap();

    let path = doc.path().unwrap();
    assert!(path.starts_with("ducks/"));
    assert_eq!(backend.document(&path), Some(yellow_duck()));
    assert!(Arc::ptr_eq(&doc, &store.doc(&path).unwrap()));
    assert!(!doc.is_dirty());
    assert!(!doc.state().is_new);
}

#[tokio::test]
async fn successful_save_settles_in_loaded_existing_state() {
    let (_backend, store) = store();
    let doc = store.doc("ducks/yellow").unwrap();
    doc.set_data(yellow_duck()).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    doc.subscribe(move |changes| sink.lock().unwrap().push(changes.fields().to_vec()));

    doc.save(SaveOptions::default()).await.unwrap();

    let state = doc.state();
    assert!(state.is_loaded);
    assert!(!state.is_saving);
    assert!(!state.is_error);
    assert_eq!(state.is_existing, Some(true));
    assert!(!doc.is_dirty());

    let seen = seen.lock().unwrap();
    assert!(seen[0].contains(&"isSaving"));
    assert!(seen.last().unwrap().contains(&"isLoaded"));
    assert!(seen.last().unwrap().contains(&"isExisting"));
}

#[tokio::test]
async fn save_merge_and_delete() {
    let (backend, store) = store();
    backend.put_document("ducks/yellow", json!({ "name": "Yellow", "age": 1 }));

    let doc = store.doc("ducks/yellow").unwrap();
    doc.set_data(json!({ "age": 2 })).unwrap();
    doc.save(SaveOptions { merge: true }).await.unwrap();
    assert_eq!(
        backend.document("ducks/yellow"),
        Some(json!({ "name": "Yellow", "age": 2 }))
    );

    doc.delete().await.unwrap();
    assert_eq!(backend.document("ducks/yellow"), None);
    assert_eq!(doc.state().is_existing, Some(false));
}

#[tokio::test]
async fn denied_save_surfaces_the_remote_code() {
    let (_backend, store) = store();
    let doc = store.doc("forbidden/duck").unwrap();
    doc.set_data(yellow_duck()).unwrap();

    let error = doc.save(SaveOptions::default()).await.unwrap_err();
    assert_eq!(error.code(), Some(&ErrorCode::PermissionDenied));
    assert!(doc.state().is_error);
    assert_eq!(doc.serialized()["state"]["error"]["code"], "permission-denied");
}

#[tokio::test]
async fn local_edits_notify_once_per_batch() {
    let (_backend, store) = store();
    let doc = store.doc("ducks/yellow").unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    doc.subscribe(move |changes| sink.lock().unwrap().push(changes.fields().to_vec()));

    doc.update_data(json!({ "name": "Yellow", "age": 2 })).unwrap();
    doc.update_data(json!({ "age": null })).unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], vec!["data", "serialized"]);
    assert_eq!(seen[1], vec!["data", "serialized"]);
    assert_eq!(doc.data(), json!({ "name": "Yellow" }));
}

#[tokio::test]
async fn observed_document_follows_remote_writes() {
    let (backend, store) = store();
    backend.put_document("ducks/yellow", yellow_duck());

    let doc = store.doc("ducks/yellow").unwrap();
    doc.promise().unwrap().await.unwrap();
    assert!(doc.is_observing());
    assert_eq!(doc.data(), yellow_duck());
    assert!(doc.state().is_loaded);

    backend.put_document("ducks/yellow", json!({ "name": "Yellower" }));
    eventually(|| doc.data() == json!({ "name": "Yellower" })).await;

    doc.stop_observing();
    assert!(!doc.is_observing());
    assert_eq!(backend.subscriber_count(), 0);
}

#[tokio::test]
async fn settle_waits_for_the_first_snapshot() {
    let (backend, store) = store();
    backend.put_document("ducks/yellow", yellow_duck());

    let doc = store.doc("ducks/yellow").unwrap();
    doc.observe().unwrap();
    assert!(!store.operations().is_empty());

    store.settle().await;
    assert!(store.operations().is_empty());
    assert!(doc.state().is_loaded);
}

#[tokio::test]
async fn destroyed_document_rejects_work() {
    let (_backend, store) = store();
    let doc = store.doc("ducks/yellow").unwrap();
    doc.destroy();

    assert!(doc.set_data(yellow_duck()).is_err());
    let error = doc.load(LoadOptions::default()).await.unwrap_err();
    assert!(matches!(error, mirra_core::SyncError::Destroyed { .. }));
}
