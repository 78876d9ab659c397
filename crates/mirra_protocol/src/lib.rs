//! # Mirra Protocol
//!
//! Remote-facing value types and capability traits for Mirra.
//!
//! This crate provides:
//! - `RemoteError` with machine-readable error codes
//! - Document and storage paths (`DocumentPath`, `StoragePath`)
//! - Snapshot payloads and metadata
//! - Object metadata, upload payloads and transfer progress
//! - The abstract remote capabilities the sync core consumes
//!   (`DocumentSource`, `BlobStorage`, `Authenticator`)
//!
//! This is a pure types-and-traits crate with no I/O of its own. Concrete
//! backends live elsewhere (see `mirra_testkit` for an in-memory one).

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod path;
mod remote;
mod snapshot;
mod storage;

pub use error::{ErrorCode, RemoteError, RemoteResult};
pub use path::{DocumentPath, StorageLocation, StoragePath};
pub use remote::{
    Authenticator, BlobStorage, DocumentSource, ListenerRegistration, ProgressListener,
    RemoteServices, SnapshotListener, User,
};
pub use snapshot::{
    DocumentSnapshot, QueryTarget, Snapshot, SnapshotData, SnapshotMetadata, SnapshotOptions,
};
pub use storage::{MetadataPatch, ObjectMetadata, PutPayload, TransferProgress, UploadOutcome};
