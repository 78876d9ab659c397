//! # Mirra Core
//!
//! Client-side synchronization core for Mirra.
//!
//! This crate provides:
//! - Change batcher coalescing mutations into one notification per batch
//! - Lifecycle tracker for parent-owns-child composition and teardown order
//! - Identity map guaranteeing one live entity per key and context
//! - Operation registry for cancellation and `settle()`
//! - Snapshot observer adapting push subscriptions into resolvable state
//! - State machines for persisted models, object metadata and transfers
//! - Documents, queries, storage references, metadata records, transfer
//!   tasks and the auth service built on the pieces above
//!
//! ## Architecture
//!
//! A [`Store`] is the root [`Context`]. Each context owns an arena of
//! entities, keyed through its identity map, and an operation registry.
//! Entities hold arena handles to each other; only the arena owns them, so
//! teardown walks the tree children first and frees slots last.
//!
//! The remote side is reached only through the capability traits in
//! `mirra_protocol` (`DocumentSource`, `BlobStorage`, `Authenticator`).
//!
//! ## Key Invariants
//!
//! - One live entity per identity key within a context
//! - A destroyed entity is never reachable through the identity map
//! - Every batch notifies at most once, after the outermost batch returns
//! - Terminal task states are sticky
//! - A stopped observer never delivers again

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod array;
mod auth;
mod batch;
mod config;
mod context;
mod document;
mod entity;
mod error;
mod identity;
mod lifecycle;
mod observer;
mod operation;
mod query;
mod state;
mod storage;

pub use array::{Disposal, EntityArray};
pub use auth::Auth;
pub use batch::{ChangeBatcher, ChangeSet, FieldRecorder, ListenerId};
pub use config::StoreConfig;
pub use context::{Context, Store};
pub use document::{Document, DocumentInit, LoadOptions, SaveOptions};
pub use entity::{AsAny, Entity, EntityHeader};
pub use error::{SyncError, SyncResult};
pub use identity::{IdentityKey, IdentityMap, Namespace, Resolved};
pub use lifecycle::{EntityId, Lifecycle};
pub use observer::{ObserverPhase, SnapshotDelegate, SnapshotObserver};
pub use operation::{Operation, OperationId, OperationKind, Operations};
pub use query::{Query, QueryInit, QueryKind};
pub use state::{
    MetadataFlags, MetadataPhase, MetadataState, ModelFlags, ModelPhase, ModelState, TaskFlags,
    TaskPhase, TaskState,
};
pub use storage::{
    Metadata, MetadataLoadOptions, PutRequest, ReferenceLoadOptions, Storage, StorageReference,
    Task,
};
