//! # Mirra Testkit
//!
//! Test utilities for Mirra.
//!
//! This crate provides:
//! - `MemoryBackend`, an in-memory implementation of every remote capability
//! - Test fixtures and tracing setup
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mirra_core::{Store, StoreConfig};
//! use mirra_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn duck() {
//!     let (backend, remote) = memory_remote();
//!     let store = Store::new(StoreConfig::default(), remote).unwrap();
//!     // ... test operations
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod memory;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::memory::*;
}

pub use fixtures::*;
pub use generators::*;
pub use memory::*;
