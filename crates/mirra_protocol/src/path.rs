//! Document and storage paths.

use serde::Serialize;
use std::fmt;

/// Location of a document: its collection path and document id.
///
/// Either half may be absent for documents that have not been placed yet
/// (a blank document, or one that only knows its collection).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub struct DocumentPath {
    /// Collection path, e.g. `ducks` or `farms/1/ducks`.
    pub collection: Option<String>,
    /// Document id within the collection.
    pub id: Option<String>,
}

impl DocumentPath {
    /// Creates a document path from its parts.
    pub fn new(collection: Option<String>, id: Option<String>) -> Self {
        Self { collection, id }
    }

    /// Parses a full document path such as `ducks/yellow`.
    ///
    /// Returns `None` for empty segments or an odd number of segments
    /// (which would address a collection, not a document).
    pub fn parse(path: &str) -> Option<Self> {
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        if segments.len() < 2 || segments.len() % 2 != 0 || segments.iter().any(|s| s.is_empty())
        {
            return None;
        }
        let (id, collection) = segments.split_last()?;
        Some(Self {
            collection: Some(collection.join("/")),
            id: Some((*id).to_string()),
        })
    }

    /// Returns the full path when both collection and id are known.
    pub fn path(&self) -> Option<String> {
        match (&self.collection, &self.id) {
            (Some(collection), Some(id)) => Some(format!("{collection}/{id}")),
            _ => None,
        }
    }

    /// Returns a copy of this path with the given id.
    pub fn with_id(&self, id: impl Into<String>) -> Self {
        Self {
            collection: self.collection.clone(),
            id: Some(id.into()),
        }
    }
}

/// How a caller addresses a storage object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageLocation {
    /// Path inside the default bucket, e.g. `images/duck.png`.
    Path(String),
    /// Fully qualified `gs://bucket/path` URL.
    Url(String),
}

/// Resolved location of a storage object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoragePath {
    /// Bucket name.
    pub bucket: String,
    /// Object path inside the bucket.
    pub full_path: String,
}

impl StoragePath {
    /// Creates a storage path.
    pub fn new(bucket: impl Into<String>, full_path: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            full_path: full_path.into().trim_matches('/').to_string(),
        }
    }

    /// Resolves a caller-supplied location against the default bucket.
    ///
    /// Returns `None` for URLs that are not `gs://bucket/...`.
    pub fn resolve(location: &StorageLocation, default_bucket: &str) -> Option<Self> {
        match location {
            StorageLocation::Path(path) => Some(Self::new(default_bucket, path.as_str())),
            StorageLocation::Url(url) => {
                let rest = url.strip_prefix("gs://")?;
                let (bucket, path) = rest.split_once('/').unwrap_or((rest, ""));
                if bucket.is_empty() {
                    return None;
                }
                Some(Self::new(bucket, path))
            }
        }
    }

    /// Last path segment.
    pub fn name(&self) -> &str {
        self.full_path.rsplit('/').next().unwrap_or("")
    }

    /// Canonical `gs://` URL, used as the identity key of a reference.
    pub fn url(&self) -> String {
        format!("gs://{}/{}", self.bucket, self.full_path)
    }
}

impl fmt::Display for StoragePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gs://{}/{}", self.bucket, self.full_path)
    }
}
