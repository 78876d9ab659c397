//! Snapshot payloads pushed by live subscriptions.

use crate::path::DocumentPath;
use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// Metadata attached to every snapshot.
///
/// Compared structurally: two snapshots with equal metadata are treated as
/// "metadata unchanged" by observers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    /// True if the snapshot was served from a local cache.
    pub from_cache: bool,
    /// True if the snapshot includes local writes not yet acknowledged.
    pub has_pending_writes: bool,
}

impl SnapshotMetadata {
    /// Metadata for a snapshot confirmed by the server.
    pub fn server() -> Self {
        Self::default()
    }

    /// Metadata for a snapshot served from cache.
    pub fn cache() -> Self {
        Self {
            from_cache: true,
            has_pending_writes: false,
        }
    }
}

/// State of a single document at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentSnapshot {
    /// Full document path.
    pub path: String,
    /// Whether the document exists remotely.
    pub exists: bool,
    /// Document data when it exists.
    pub data: Option<Value>,
}

impl DocumentSnapshot {
    /// Snapshot of an existing document.
    pub fn existing(path: impl Into<String>, data: Value) -> Self {
        Self {
            path: path.into(),
            exists: true,
            data: Some(data),
        }
    }

    /// Snapshot of a missing document.
    pub fn missing(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            exists: false,
            data: None,
        }
    }

    /// Parsed collection and id of the document.
    pub fn document_path(&self) -> Option<DocumentPath> {
        DocumentPath::parse(&self.path)
    }
}

/// Payload of a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotData {
    /// A single document subscription.
    Document(DocumentSnapshot),
    /// A collection subscription, in result order.
    Query(Vec<DocumentSnapshot>),
}

impl SnapshotData {
    /// Existing documents carried by this payload, in order.
    pub fn documents(&self) -> Vec<&DocumentSnapshot> {
        match self {
            SnapshotData::Document(doc) if doc.exists => vec![doc],
            SnapshotData::Document(_) => Vec::new(),
            SnapshotData::Query(docs) => docs.iter().filter(|d| d.exists).collect(),
        }
    }
}

/// One remote update event.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Data payload.
    pub data: SnapshotData,
    /// Metadata payload.
    pub metadata: SnapshotMetadata,
}

impl Snapshot {
    /// Creates a snapshot.
    pub fn new(data: SnapshotData, metadata: SnapshotMetadata) -> Self {
        Self { data, metadata }
    }
}

/// Options passed when opening a live subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotOptions {
    /// Also deliver snapshots when only metadata changed.
    pub include_metadata_changes: bool,
}

/// What a live subscription observes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryTarget {
    /// A single document path.
    Document(String),
    /// Every document directly inside a collection, ordered by id.
    Collection(String),
}

impl QueryTarget {
    /// Returns true if a write to `path` can affect this target.
    pub fn covers(&self, path: &str) -> bool {
        match self {
            QueryTarget::Document(doc) => doc == path,
            QueryTarget::Collection(collection) => DocumentPath::parse(path)
                .and_then(|p| p.collection)
                .is_some_and(|c| &c == collection),
        }
    }
}

impl fmt::Display for QueryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryTarget::Document(path) => write!(f, "doc({path})"),
            QueryTarget::Collection(path) => write!(f, "collection({path})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn metadata_compares_structurally() {
        assert_eq!(SnapshotMetadata::server(), SnapshotMetadata::default());
        assert_ne!(SnapshotMetadata::server(), SnapshotMetadata::cache());
    }

    #[test]
    fn documents_skip_missing_entries() {
        let data = SnapshotData::Query(vec![
            DocumentSnapshot::existing("ducks/green", json!({ "name": "Green" })),
            DocumentSnapshot::missing("ducks/red"),
        ]);
        let docs = data.documents();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].path, "ducks/green");

        assert!(SnapshotData::Document(DocumentSnapshot::missing("ducks/red"))
            .documents()
            .is_empty());
    }

    #[test]
    fn target_coverage() {
        let collection = QueryTarget::Collection("ducks".into());
        assert!(collection.covers("ducks/yellow"));
        assert!(!collection.covers("geese/yellow"));
        assert!(!collection.covers("farms/1/ducks/yellow"));

        let document = QueryTarget::Document("ducks/yellow".into());
        assert!(document.covers("ducks/yellow"));
        assert!(!document.covers("ducks/green"));
    }
}
