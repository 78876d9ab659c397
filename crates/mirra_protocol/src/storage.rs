//! Storage object metadata and transfer types.

use bytes::Bytes;
use serde::Serialize;
use std::collections::BTreeMap;

/// Metadata of a stored object as reported by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMetadata {
    /// Bucket name.
    pub bucket: String,
    /// Object path inside the bucket.
    pub full_path: String,
    /// Last path segment.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// MIME type, if set.
    pub content_type: Option<String>,
    /// User-defined key/value pairs.
    pub custom_metadata: BTreeMap<String, String>,
    /// Monotonic generation, bumped on every write.
    pub generation: u64,
}

/// Partial update of object metadata.
///
/// `None` leaves a field untouched. In `custom_metadata`, a `None` value
/// deletes the key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataPatch {
    /// New MIME type.
    pub content_type: Option<String>,
    /// Custom metadata changes.
    pub custom_metadata: BTreeMap<String, Option<String>>,
}

impl MetadataPatch {
    /// Creates an empty patch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the content type.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Sets a custom metadata key.
    pub fn with_custom(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_metadata.insert(key.into(), Some(value.into()));
        self
    }

    /// Removes a custom metadata key.
    pub fn without_custom(mut self, key: impl Into<String>) -> Self {
        self.custom_metadata.insert(key.into(), None);
        self
    }

    /// Applies this patch to existing metadata.
    pub fn apply_to(&self, metadata: &mut ObjectMetadata) {
        if let Some(content_type) = &self.content_type {
            metadata.content_type = Some(content_type.clone());
        }
        for (key, value) in &self.custom_metadata {
            match value {
                Some(value) => {
                    metadata.custom_metadata.insert(key.clone(), value.clone());
                }
                None => {
                    metadata.custom_metadata.remove(key);
                }
            }
        }
    }
}

/// Content of an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutPayload {
    /// A raw string, uploaded as its UTF-8 bytes.
    String(String),
    /// Arbitrary binary data.
    Data(Bytes),
}

impl PutPayload {
    /// Kind label of the payload (`string` or `data`).
    pub fn kind(&self) -> &'static str {
        match self {
            PutPayload::String(_) => "string",
            PutPayload::Data(_) => "data",
        }
    }

    /// Number of bytes that will be transferred.
    pub fn len(&self) -> u64 {
        match self {
            PutPayload::String(s) => s.len() as u64,
            PutPayload::Data(b) => b.len() as u64,
        }
    }

    /// Returns true for an empty payload.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Converts the payload into bytes.
    pub fn into_bytes(self) -> Bytes {
        match self {
            PutPayload::String(s) => Bytes::from(s),
            PutPayload::Data(b) => b,
        }
    }
}

/// Progress event of a running transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferProgress {
    /// Bytes sent so far.
    pub bytes_transferred: u64,
    /// Total bytes to send.
    pub total_bytes: u64,
}

impl TransferProgress {
    /// Creates a progress event.
    pub fn new(bytes_transferred: u64, total_bytes: u64) -> Self {
        Self {
            bytes_transferred,
            total_bytes,
        }
    }
}

/// Result of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    /// Metadata of the stored object.
    pub metadata: ObjectMetadata,
    /// Public download URL.
    pub download_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_applies_and_removes_custom_keys() {
        let mut metadata = ObjectMetadata {
            custom_metadata: BTreeMap::from([
                ("ok".to_string(), "true".to_string()),
                ("stale".to_string(), "1".to_string()),
            ]),
            ..Default::default()
        };

        MetadataPatch::new()
            .with_content_type("text/plain")
            .with_custom("owner", "duck")
            .without_custom("stale")
            .apply_to(&mut metadata);

        assert_eq!(metadata.content_type.as_deref(), Some("text/plain"));
        assert_eq!(metadata.custom_metadata.get("owner").map(String::as_str), Some("duck"));
        assert_eq!(metadata.custom_metadata.get("ok").map(String::as_str), Some("true"));
        assert!(!metadata.custom_metadata.contains_key("stale"));
    }

    #[test]
    fn payload_sizes() {
        let payload = PutPayload::String("hello world as a raw string".into());
        assert_eq!(payload.kind(), "string");
        assert_eq!(payload.len(), 27);

        let payload = PutPayload::Data(Bytes::from_static(b"\x00\x01"));
        assert_eq!(payload.kind(), "data");
        assert_eq!(payload.len(), 2);
        assert_eq!(payload.into_bytes().as_ref(), b"\x00\x01");
    }
}
