//! Change batcher.
//!
//! Every mutation of entity state happens inside [`ChangeBatcher::with_changes`].
//! The closure receives a [`FieldRecorder`]; entity setters take the recorder
//! as a parameter, so state cannot be mutated outside a batch.
//!
//! When the outermost batch returns, the distinct recorded field names are
//! delivered to listeners as one [`ChangeSet`], in first-touched order.
//!
//! ```
//! use mirra_core::ChangeBatcher;
//! use std::sync::{Arc, Mutex};
//!
//! let batcher = ChangeBatcher::new();
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let sink = Arc::clone(&seen);
//! batcher.subscribe(move |changes| sink.lock().unwrap().push(changes.fields().to_vec()));
//!
//! batcher.with_changes(true, |changed| {
//!     changed.changed("name");
//!     changed.changed("age");
//!     changed.changed("name");
//! });
//!
//! assert_eq!(*seen.lock().unwrap(), vec![vec!["name", "age"]]);
//! ```

use parking_lot::{Mutex, ReentrantMutex};
use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Identifies a change listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// The fields touched by one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    fields: Vec<&'static str>,
}

impl ChangeSet {
    /// Field names in first-touched order.
    pub fn fields(&self) -> &[&'static str] {
        &self.fields
    }

    /// Returns true if `field` was touched.
    pub fn contains(&self, field: &str) -> bool {
        self.fields.iter().any(|f| *f == field)
    }

    /// Number of touched fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if no field was touched.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

type Listener = Arc<dyn Fn(&ChangeSet) + Send + Sync>;

#[derive(Debug, Default)]
struct Batch {
    depth: usize,
    notify: bool,
    fields: Vec<&'static str>,
}

/// Records the fields touched during a batch.
///
/// Only obtainable inside [`ChangeBatcher::with_changes`].
pub struct FieldRecorder<'a> {
    batch: &'a RefCell<Batch>,
}

impl FieldRecorder<'_> {
    /// Records that `field` changed. Recording a field twice keeps one entry.
    pub fn changed(&self, field: &'static str) {
        let mut batch = self.batch.borrow_mut();
        debug_assert!(batch.depth > 0, "field '{field}' recorded outside a batch");
        if !batch.fields.contains(&field) {
            batch.fields.push(field);
        }
    }

    /// Fields recorded so far, including those of enclosing batches.
    pub fn fields(&self) -> Vec<&'static str> {
        self.batch.borrow().fields.clone()
    }

    /// Returns true if nothing has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.batch.borrow().fields.is_empty()
    }
}

/// Restores the batch depth even if the closure panics.
struct Depth<'a> {
    batch: &'a RefCell<Batch>,
}

impl Drop for Depth<'_> {
    fn drop(&mut self) {
        let mut batch = self.batch.borrow_mut();
        batch.depth -= 1;
        if batch.depth == 0 && std::thread::panicking() {
            batch.fields.clear();
        }
    }
}

/// Coalesces field mutations of one entity into single notifications.
///
/// Batches on one batcher run to completion: a batch started on another
/// thread waits until the current outermost batch has returned, while a batch
/// nested on the same thread flattens into the outer one.
pub struct ChangeBatcher {
    batch: ReentrantMutex<RefCell<Batch>>,
    derived: &'static [&'static str],
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
}

impl ChangeBatcher {
    /// Creates a batcher without derived fields.
    pub fn new() -> Self {
        Self::with_derived(&[])
    }

    /// Creates a batcher that appends `derived` to every non-empty change set.
    pub fn with_derived(derived: &'static [&'static str]) -> Self {
        Self {
            batch: ReentrantMutex::new(RefCell::new(Batch::default())),
            derived,
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
        }
    }

    /// Runs `f` inside a batch.
    ///
    /// After the outermost batch returns, listeners receive one change set if
    /// any field was recorded and the outermost call passed `notify = true`.
    pub fn with_changes<R>(&self, notify: bool, f: impl FnOnce(&FieldRecorder<'_>) -> R) -> R {
        let guard = self.batch.lock();
        let cell: &RefCell<Batch> = &guard;

        let outermost = {
            let mut batch = cell.borrow_mut();
            let outermost = batch.depth == 0;
            if outermost {
                batch.notify = notify;
                batch.fields.clear();
            }
            batch.depth += 1;
            outermost
        };

        let depth = Depth { batch: cell };
        let result = f(&FieldRecorder { batch: cell });
        drop(depth);

        if outermost {
            let changes = {
                let mut batch = cell.borrow_mut();
                let fields = std::mem::take(&mut batch.fields);
                (batch.notify && !fields.is_empty()).then(|| self.complete(fields))
            };
            if let Some(changes) = changes {
                self.dispatch(&changes);
            }
        }

        result
    }

    /// Registers a listener for change sets.
    pub fn subscribe(&self, listener: impl Fn(&ChangeSet) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    /// Removes a listener. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    fn complete(&self, mut fields: Vec<&'static str>) -> ChangeSet {
        for derived in self.derived {
            if !fields.contains(derived) {
                fields.push(derived);
            }
        }
        ChangeSet { fields }
    }

    fn dispatch(&self, changes: &ChangeSet) {
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(changes);
        }
    }
}

impl Default for ChangeBatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ChangeBatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeBatcher")
            .field("derived", &self.derived)
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn recording(batcher: &ChangeBatcher) -> Arc<Mutex<Vec<Vec<&'static str>>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        batcher.subscribe(move |changes| sink.lock().push(changes.fields().to_vec()));
        seen
    }

    #[test]
    fn coalesces_repeated_fields() {
        let batcher = ChangeBatcher::new();
        let seen = recording(&batcher);

        batcher.with_changes(true, |changed| {
            changed.changed("data");
            changed.changed("isDirty");
            changed.changed("data");
        });

        assert_eq!(*seen.lock(), vec![vec!["data", "isDirty"]]);
    }

    #[test]
    fn no_notification_without_fields() {
        let batcher = ChangeBatcher::new();
        let seen = recording(&batcher);

        let value = batcher.with_changes(true, |_| 42);

        assert_eq!(value, 42);
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn notify_false_suppresses_notification() {
        let batcher = ChangeBatcher::new();
        let seen = recording(&batcher);

        batcher.with_changes(false, |changed| changed.changed("data"));

        assert!(seen.lock().is_empty());
    }

    #[test]
    fn nested_batches_flatten_into_outermost() {
        let batcher = ChangeBatcher::new();
        let seen = recording(&batcher);

        batcher.with_changes(true, |changed| {
            changed.changed("state");
            batcher.with_changes(true, |inner| {
                inner.changed("data");
                inner.changed("state");
                assert_eq!(inner.fields(), vec!["state", "data"]);
            });
            assert!(seen.lock().is_empty());
            changed.changed("metadata");
        });

        assert_eq!(*seen.lock(), vec![vec!["state", "data", "metadata"]]);
    }

    #[test]
    fn derived_fields_follow_real_changes() {
        let batcher = ChangeBatcher::with_derived(&["serialized"]);
        let seen = recording(&batcher);

        batcher.with_changes(true, |_| {});
        batcher.with_changes(true, |changed| changed.changed("inserted"));

        assert_eq!(*seen.lock(), vec![vec!["inserted", "serialized"]]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let batcher = ChangeBatcher::new();
        let seen = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&seen);
        let id = batcher.subscribe(move |_| *sink.lock() += 1);

        batcher.with_changes(true, |changed| changed.changed("a"));
        assert!(batcher.unsubscribe(id));
        assert!(!batcher.unsubscribe(id));
        batcher.with_changes(true, |changed| changed.changed("a"));

        assert_eq!(*seen.lock(), 1);
        assert_eq!(batcher.listener_count(), 0);
    }

    #[test]
    fn listener_may_start_a_new_batch() {
        let batcher = Arc::new(ChangeBatcher::new());
        let seen = recording(&batcher);

        let inner = Arc::clone(&batcher);
        let fired = Arc::new(Mutex::new(false));
        let once = Arc::clone(&fired);
        batcher.subscribe(move |_| {
            let mut fired = once.lock();
            if !*fired {
                *fired = true;
                drop(fired);
                inner.with_changes(true, |changed| changed.changed("follow-up"));
            }
        });

        batcher.with_changes(true, |changed| changed.changed("first"));

        assert_eq!(*seen.lock(), vec![vec!["first"], vec!["follow-up"]]);
    }

    #[test]
    fn panicking_batch_leaves_batcher_usable() {
        let batcher = ChangeBatcher::new();
        let seen = recording(&batcher);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            batcher.with_changes(true, |changed| {
                changed.changed("lost");
                panic!("boom");
            })
        }));
        assert!(result.is_err());

        batcher.with_changes(true, |changed| changed.changed("kept"));
        assert_eq!(*seen.lock(), vec![vec!["kept"]]);
    }

    #[test]
    fn batches_from_other_threads_run_to_completion() {
        let batcher = Arc::new(ChangeBatcher::new());
        let seen = recording(&batcher);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let batcher = Arc::clone(&batcher);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        batcher.with_changes(true, |changed| {
                            changed.changed("a");
                            std::thread::yield_now();
                            changed.changed("b");
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let seen = seen.lock();
        assert_eq!(seen.len(), 200);
        assert!(seen.iter().all(|fields| fields == &vec!["a", "b"]));
    }

    const NAMES: [&str; 6] = ["data", "state", "metadata", "error", "isDirty", "content"];

    proptest! {
        #[test]
        fn one_notification_listing_each_field_once(
            touches in proptest::collection::vec(0usize..NAMES.len(), 0..40),
            nest_at in 0usize..40,
        ) {
            let batcher = ChangeBatcher::new();
            let seen = recording(&batcher);

            batcher.with_changes(true, |changed| {
                for (i, idx) in touches.iter().enumerate() {
                    if i == nest_at {
                        batcher.with_changes(true, |inner| inner.changed(NAMES[*idx]));
                    } else {
                        changed.changed(NAMES[*idx]);
                    }
                }
            });

            let mut expected: Vec<&str> = Vec::new();
            for idx in &touches {
                if !expected.contains(&NAMES[*idx]) {
                    expected.push(NAMES[*idx]);
                }
            }

            let seen = seen.lock();
            if expected.is_empty() {
                prop_assert!(seen.is_empty());
            } else {
                prop_assert_eq!(seen.len(), 1);
                prop_assert_eq!(&seen[0], &expected);
            }
        }
    }
}
