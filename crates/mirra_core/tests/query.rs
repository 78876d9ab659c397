//! Integration tests for live queries.

mod common;

use common::{eventually, store, store_with};
use mirra_core::{Entity, QueryInit, QueryKind, Store, StoreConfig};
use mirra_protocol::{ErrorCode, SnapshotMetadata};
use mirra_testkit::scenarios::duck_pond;
use serde_json::json;
use std::sync::{Arc, Mutex};

#[tokio::test]
async fn collection_query_maps_onto_canonical_documents() {
    let (backend, store) = store();
    backend.put_document("ducks/green", json!({ "name": "Green" }));
    backend.put_document("ducks/yellow", json!({ "name": "Yellow" }));
    backend.put_document("geese/grey", json!({ "name": "Grey" }));

    let yellow = store.doc("ducks/yellow").unwrap();
    let query = store.query(QueryInit::collection("ducks")).unwrap();
    query.promise().unwrap().await.unwrap();

    let content = query.content();
    assert_eq!(content.len(), 2);
    assert_eq!(content[0].path().as_deref(), Some("ducks/green"));
    assert!(Arc::ptr_eq(&content[1], &yellow));
    assert_eq!(yellow.data(), json!({ "name": "Yellow" }));
    assert!(query.state().is_loaded);
}

#[tokio::test]
async fn query_content_follows_remote_writes() {
    let (backend, store) = store();
    backend.put_document("ducks/yellow", json!({ "name": "Yellow" }));

    let query = store.query(QueryInit::collection("ducks")).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    query.subscribe(move |changes| sink.lock().unwrap().push(changes.fields().to_vec()));
    query.promise().unwrap().await.unwrap();

    backend.put_document("ducks/green", json!({ "name": "Green" }));
    eventually(|| query.content().len() == 2).await;

    backend.remove_document("ducks/yellow");
    eventually(|| query.content().len() == 1).await;
    assert_eq!(query.first().unwrap().path().as_deref(), Some("ducks/green"));

    let seen = seen.lock().unwrap();
    assert!(seen.iter().all(|fields| fields.contains(&"serialized")));
    assert!(seen.iter().any(|fields| fields.contains(&"content")));
}

#[tokio::test]
async fn single_query_keeps_the_first_match() {
    let backend = duck_pond(3);
    let store = Store::new(StoreConfig::default(), backend.remote()).unwrap();

    let query = store
        .query(QueryInit::collection("ducks").with_kind(QueryKind::Single))
        .unwrap();
    query.promise().unwrap().await.unwrap();

    assert_eq!(query.content().len(), 1);
    assert_eq!(query.first().unwrap().path().as_deref(), Some("ducks/duck-000"));
    assert_eq!(query.serialized()["type"], "single");
}

#[tokio::test]
async fn document_query_observes_one_document() {
    let (backend, store) = store();
    backend.put_document("ducks/yellow", json!({ "name": "Yellow" }));

    let query = store.query(QueryInit::document("ducks/yellow")).unwrap();
    query.promise().unwrap().await.unwrap();
    assert_eq!(query.content().len(), 1);

    backend.remove_document("ducks/yellow");
    eventually(|| query.content().is_empty()).await;
}

#[tokio::test]
async fn keyed_queries_are_canonical() {
    let (_backend, store) = store();
    let first = store
        .query(QueryInit::collection("ducks").with_id("pond"))
        .unwrap();
    let second = store
        .query(QueryInit::collection("ducks").with_id("pond"))
        .unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.id().as_deref(), Some("pond"));

    let anonymous = store.query(QueryInit::collection("ducks")).unwrap();
    assert!(!Arc::ptr_eq(&first, &anonymous));
}

#[tokio::test]
async fn denied_query_fails() {
    let (_backend, store) = store();
    let query = store.query(QueryInit::collection("forbidden/1/ducks")).unwrap();

    let error = query.promise().unwrap().await.unwrap_err();
    assert_eq!(error.code(), Some(&ErrorCode::PermissionDenied));
    let state = query.state();
    assert!(state.is_error);
    assert!(!state.is_loaded);
}

#[tokio::test]
async fn metadata_changes_are_deduplicated() {
    let (backend, store) = store_with(StoreConfig::default().with_metadata_changes(true));
    backend.put_document("ducks/yellow", json!({ "name": "Yellow" }));

    let query = store.query(QueryInit::collection("ducks")).unwrap();
    let metadata_events = Arc::new(Mutex::new(0usize));
    let sink = Arc::clone(&metadata_events);
    query.subscribe(move |changes| {
        if changes.contains("metadata") {
            *sink.lock().unwrap() += 1;
        }
    });

    query.promise().unwrap().await.unwrap();
    eventually(|| query.metadata() == Some(SnapshotMetadata::server())).await;

    backend.put_document("ducks/green", json!({ "name": "Green" }));
    eventually(|| query.content().len() == 2).await;

    // cache, then server; the second server snapshot carries equal metadata
    assert_eq!(*metadata_events.lock().unwrap(), 2);
}

#[tokio::test]
async fn destroying_a_query_closes_its_subscription() {
    let (backend, store) = store();
    let query = store.query(QueryInit::collection("ducks")).unwrap();
    query.observe().unwrap();
    assert_eq!(backend.subscriber_count(), 1);

    query.destroy();
    assert_eq!(backend.subscriber_count(), 0);
    assert!(store.operations().is_empty());
}
