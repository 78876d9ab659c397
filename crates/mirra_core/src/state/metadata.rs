//! Object-metadata lifecycle.

use super::record;
use crate::batch::FieldRecorder;
use crate::error::{serialize_error, SyncError};
use serde::Serialize;

/// Phase of a metadata record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetadataPhase {
    /// Not requested yet.
    #[default]
    Unknown,
    /// A read is in flight.
    Loading,
    /// Read finished, existing or missing.
    Loaded,
    /// Read failed.
    Error,
}

/// Projections of a [`MetadataState`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataFlags {
    /// A read is in flight.
    pub is_loading: bool,
    /// Last read succeeded.
    pub is_loaded: bool,
    /// Whether the object exists, once known.
    pub is_existing: Option<bool>,
    /// Last read failed.
    pub is_error: bool,
    /// Last error.
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<SyncError>,
}

/// Load lifecycle of remote object metadata.
///
/// A missing object is either a successful `missing` result or a
/// `missing_error`; which one is decided by the caller issuing the read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataState {
    phase: MetadataPhase,
    exists: Option<bool>,
    error: Option<SyncError>,
}

impl MetadataState {
    /// Creates a state in [`MetadataPhase::Unknown`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Current phase.
    pub fn phase(&self) -> MetadataPhase {
        self.phase
    }

    /// Current projections.
    pub fn flags(&self) -> MetadataFlags {
        MetadataFlags {
            is_loading: self.phase == MetadataPhase::Loading,
            is_loaded: self.phase == MetadataPhase::Loaded,
            is_existing: self.exists,
            is_error: self.phase == MetadataPhase::Error,
            error: self.error.clone(),
        }
    }

    /// A read started.
    pub fn loading(&mut self, changed: &FieldRecorder<'_>) {
        self.transition(changed, |state| {
            state.phase = MetadataPhase::Loading;
            state.error = None;
        });
    }

    /// The object was found.
    pub fn loaded(&mut self, changed: &FieldRecorder<'_>) {
        self.settled(Some(true), changed);
    }

    /// The object is missing and the caller accepts that.
    pub fn missing(&mut self, changed: &FieldRecorder<'_>) {
        self.settled(Some(false), changed);
    }

    /// The object is missing and the caller required it.
    pub fn missing_error(&mut self, error: SyncError, changed: &FieldRecorder<'_>) {
        self.transition(changed, |state| {
            state.phase = MetadataPhase::Error;
            state.exists = Some(false);
            state.error = Some(error);
        });
    }

    /// The read failed for another reason.
    pub fn failed(&mut self, error: SyncError, changed: &FieldRecorder<'_>) {
        self.transition(changed, |state| {
            state.phase = MetadataPhase::Error;
            state.error = Some(error);
        });
    }

    fn settled(&mut self, exists: Option<bool>, changed: &FieldRecorder<'_>) {
        self.transition(changed, |state| {
            state.phase = MetadataPhase::Loaded;
            state.exists = exists;
            state.error = None;
        });
    }

    fn transition(&mut self, changed: &FieldRecorder<'_>, f: impl FnOnce(&mut Self)) {
        let before = self.flags();
        f(self);
        let after = self.flags();
        record(changed, "isLoading", &before.is_loading, &after.is_loading);
        record(changed, "isLoaded", &before.is_loaded, &after.is_loaded);
        record(changed, "isExisting", &before.is_existing, &after.is_existing);
        record(changed, "isError", &before.is_error, &after.is_error);
        record(changed, "error", &before.error, &after.error);
    }
}
