//! Persisted-model lifecycle.

use super::record;
use crate::batch::FieldRecorder;
use crate::error::{serialize_error, SyncError};
use serde::Serialize;

/// Phase of a persisted model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelPhase {
    /// Never loaded nor saved.
    #[default]
    New,
    /// A read is in flight.
    Loading,
    /// Last read or write succeeded.
    Loaded,
    /// A write is in flight.
    Saving,
    /// Last read or write failed.
    Error,
}

/// Projections of a [`ModelState`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelFlags {
    /// True until the first successful load or save.
    pub is_new: bool,
    /// A read is in flight.
    pub is_loading: bool,
    /// Synced at least once and not currently reading.
    pub is_loaded: bool,
    /// A write is in flight.
    pub is_saving: bool,
    /// Last read or write failed.
    pub is_error: bool,
    /// Whether the model exists remotely, once known.
    pub is_existing: Option<bool>,
    /// Last error.
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<SyncError>,
}

/// Load/save lifecycle of a document.
///
/// A failed transition keeps the previous existence classification unless
/// the failure itself says the model is missing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelState {
    phase: ModelPhase,
    synced_once: bool,
    exists: Option<bool>,
    error: Option<SyncError>,
}

impl ModelState {
    /// Creates a state in [`ModelPhase::New`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Current phase.
    pub fn phase(&self) -> ModelPhase {
        self.phase
    }

    /// Current projections.
    pub fn flags(&self) -> ModelFlags {
        ModelFlags {
            is_new: !self.synced_once,
            is_loading: self.phase == ModelPhase::Loading,
            is_loaded: self.synced_once && self.phase != ModelPhase::Loading,
            is_saving: self.phase == ModelPhase::Saving,
            is_error: self.phase == ModelPhase::Error,
            is_existing: self.exists,
            error: self.error.clone(),
        }
    }

    /// A read started.
    pub fn loading(&mut self, changed: &FieldRecorder<'_>) {
        self.transition(changed, |state| {
            state.phase = ModelPhase::Loading;
            state.error = None;
        });
    }

    /// A read finished; `exists` tells whether the document was found.
    pub fn loaded(&mut self, exists: bool, changed: &FieldRecorder<'_>) {
        self.transition(changed, |state| {
            state.phase = ModelPhase::Loaded;
            state.synced_once = true;
            state.exists = Some(exists);
            state.error = None;
        });
    }

    /// A write started.
    pub fn saving(&mut self, changed: &FieldRecorder<'_>) {
        self.transition(changed, |state| {
            state.phase = ModelPhase::Saving;
            state.error = None;
        });
    }

    /// A write finished.
    pub fn saved(&mut self, changed: &FieldRecorder<'_>) {
        self.loaded(true, changed);
    }

    /// A read or write failed.
    ///
    /// `exists` overrides the existence classification when the failure
    /// determines it (a not-found read); `None` keeps the previous one.
    pub fn failed(&mut self, error: SyncError, exists: Option<bool>, changed: &FieldRecorder<'_>) {
        self.transition(changed, |state| {
            state.phase = ModelPhase::Error;
            state.error = Some(error);
            if exists.is_some() {
                state.exists = exists;
            }
        });
    }

    fn transition(&mut self, changed: &FieldRecorder<'_>, f: impl FnOnce(&mut Self)) {
        let before = self.flags();
        f(self);
        self.flags().record_changes(&before, changed);
    }
}

impl ModelFlags {
    fn record_changes(&self, before: &ModelFlags, changed: &FieldRecorder<'_>) {
        record(changed, "isNew", &before.is_new, &self.is_new);
        record(changed, "isLoading", &before.is_loading, &self.is_loading);
        record(changed, "isLoaded", &before.is_loaded, &self.is_loaded);
        record(changed, "isSaving", &before.is_saving, &self.is_saving);
        record(changed, "isError", &before.is_error, &self.is_error);
        record(changed, "isExisting", &before.is_existing, &self.is_existing);
        record(changed, "error", &before.error, &self.error);
    }
}
