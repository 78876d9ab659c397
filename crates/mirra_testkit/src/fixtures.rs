//! Test fixtures and tracing setup.

use crate::memory::MemoryBackend;
use mirra_protocol::{MetadataPatch, RemoteServices};
use serde_json::{json, Value};
use std::sync::Once;
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Installs a `fmt` subscriber filtered by `RUST_LOG` (default `warn`).
///
/// Safe to call from every test; only the first call installs.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// A fresh backend and its capability bundle, with tracing installed.
pub fn memory_remote() -> (MemoryBackend, RemoteServices) {
    init_tracing();
    let backend = MemoryBackend::new();
    let remote = backend.remote();
    (backend, remote)
}

/// The payload uploaded by storage scenarios: 27 bytes of text.
pub const HELLO: &str = "hello world as a raw string";

/// Metadata sent with [`HELLO`].
pub fn hello_metadata() -> MetadataPatch {
    MetadataPatch::new()
        .with_content_type("text/plain")
        .with_custom("ok", "true")
}

/// Data of the yellow duck used across document scenarios.
pub fn yellow_duck() -> Value {
    json!({ "name": "Yellow" })
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// A backend holding `count` ducks in the `ducks` collection.
    pub fn duck_pond(count: usize) -> MemoryBackend {
        init_tracing();
        let backend = MemoryBackend::new();
        for i in 0..count {
            backend.put_document(&format!("ducks/duck-{i:03}"), json!({ "name": format!("Duck {i}") }));
        }
        backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_is_27_bytes() {
        assert_eq!(HELLO.len(), 27);
    }

    #[test]
    fn pond_is_populated() {
        let backend = scenarios::duck_pond(3);
        assert!(backend.document("ducks/duck-000").is_some());
        assert!(backend.document("ducks/duck-002").is_some());
        assert!(backend.document("ducks/duck-003").is_none());
    }
}
