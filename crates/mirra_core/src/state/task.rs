//! Transfer-task lifecycle.

use super::record;
use crate::batch::FieldRecorder;
use crate::error::{serialize_error, SyncError};
use serde::Serialize;

/// Phase of a transfer task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskPhase {
    /// Transfer in progress.
    #[default]
    Running,
    /// Transfer finished.
    Completed,
    /// Transfer failed.
    Error,
}

impl TaskPhase {
    /// Returns true for `Completed` and `Error`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskPhase::Running)
    }
}

/// Projections of a [`TaskState`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFlags {
    /// Transfer in progress.
    pub is_running: bool,
    /// Transfer ended, successfully or not.
    pub is_completed: bool,
    /// Transfer failed.
    pub is_error: bool,
    /// Bytes sent so far.
    pub bytes_transferred: u64,
    /// Total bytes to send.
    pub total_bytes: u64,
    /// Whole-number progress, 0 to 100.
    pub percent: u64,
    /// Failure, if any.
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<SyncError>,
}

/// Progress and outcome of a transfer.
///
/// `Completed` and `Error` are sticky: transitions out of them are ignored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskState {
    phase: TaskPhase,
    bytes_transferred: u64,
    total_bytes: u64,
    error: Option<SyncError>,
}

impl TaskState {
    /// Creates a running task expecting `total_bytes`.
    pub fn new(total_bytes: u64) -> Self {
        Self {
            total_bytes,
            ..Self::default()
        }
    }

    /// Current phase.
    pub fn phase(&self) -> TaskPhase {
        self.phase
    }

    /// Current projections.
    pub fn flags(&self) -> TaskFlags {
        TaskFlags {
            is_running: self.phase == TaskPhase::Running,
            is_completed: self.phase.is_terminal(),
            is_error: self.phase == TaskPhase::Error,
            bytes_transferred: self.bytes_transferred,
            total_bytes: self.total_bytes,
            percent: percent(self.bytes_transferred, self.total_bytes),
            error: self.error.clone(),
        }
    }

    /// Applies a progress event. Returns false once terminal.
    pub fn progress(&mut self, bytes_transferred: u64, total_bytes: u64, changed: &FieldRecorder<'_>) -> bool {
        self.transition(changed, |state| {
            state.bytes_transferred = bytes_transferred;
            state.total_bytes = total_bytes;
        })
    }

    /// Marks the transfer finished. Returns false once terminal.
    pub fn complete(&mut self, changed: &FieldRecorder<'_>) -> bool {
        self.transition(changed, |state| {
            state.phase = TaskPhase::Completed;
            state.bytes_transferred = state.total_bytes;
        })
    }

    /// Marks the transfer failed. Returns false once terminal.
    pub fn fail(&mut self, error: SyncError, changed: &FieldRecorder<'_>) -> bool {
        self.transition(changed, |state| {
            state.phase = TaskPhase::Error;
            state.error = Some(error);
        })
    }

    fn transition(&mut self, changed: &FieldRecorder<'_>, f: impl FnOnce(&mut Self)) -> bool {
        if self.phase.is_terminal() {
            return false;
        }
        let before = self.flags();
        f(self);
        let after = self.flags();
        record(changed, "isRunning", &before.is_running, &after.is_running);
        record(changed, "isCompleted", &before.is_completed, &after.is_completed);
        record(changed, "isError", &before.is_error, &after.is_error);
        record(changed, "bytesTransferred", &before.bytes_transferred, &after.bytes_transferred);
        record(changed, "totalBytes", &before.total_bytes, &after.total_bytes);
        record(changed, "percent", &before.percent, &after.percent);
        record(changed, "error", &before.error, &after.error);
        true
    }
}

fn percent(bytes: u64, total: u64) -> u64 {
    if total == 0 {
        return 0;
    }
    (bytes.min(total) as u128 * 100 / total as u128) as u64
}
