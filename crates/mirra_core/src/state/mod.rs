//! Entity state machines.
//!
//! Each machine is a closed phase enum plus an optional last error. Flags
//! such as `isLoading` are projections of that state and are never stored.
//! Transitions take the batch's [`FieldRecorder`] and record exactly the
//! projections whose value changed.

mod metadata;
mod model;
mod task;

pub use metadata::{MetadataFlags, MetadataPhase, MetadataState};
pub use model::{ModelFlags, ModelPhase, ModelState};
pub use task::{TaskFlags, TaskPhase, TaskState};

use crate::batch::FieldRecorder;

/// Records `field` if the projection changed.
fn record<T: PartialEq>(changed: &FieldRecorder<'_>, field: &'static str, before: &T, after: &T) {
    if before != after {
        changed.changed(field);
    }
}
