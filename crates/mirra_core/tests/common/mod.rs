//! Shared helpers for the integration tests.

#![allow(dead_code)]

use mirra_core::{Store, StoreConfig};
use mirra_testkit::{memory_remote, MemoryBackend};

/// A store on the current runtime backed by a fresh in-memory backend.
pub fn store() -> (MemoryBackend, Store) {
    store_with(StoreConfig::default())
}

/// Same as [`store`] with a custom configuration.
pub fn store_with(config: StoreConfig) -> (MemoryBackend, Store) {
    let (backend, remote) = memory_remote();
    let store = Store::new(config, remote).expect("inside a tokio runtime");
    (backend, store)
}

/// Yields until `condition` holds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}
