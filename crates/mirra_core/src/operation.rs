//! Operation registry.
//!
//! Every asynchronous unit of work a context starts is recorded in a shared
//! ledger. Two kinds exist:
//!
//! - **Promise** operations wrap one future. They are spawned eagerly on the
//!   context's runtime and leave the ledger exactly once, when the future
//!   finishes or is aborted.
//! - **Deferred** operations stand for a live subscription. They leave the
//!   ledger when their owner calls [`Operations::complete`] (first snapshot,
//!   failure, or stop) or when they are cancelled.
//!
//! [`Operations::settle`] waits until the ledger is empty at a quiescent
//! point, which makes it usable as a synchronization barrier in tests.

use crate::error::{SyncError, SyncResult};
use crate::lifecycle::EntityId;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, trace};

/// Identifies an operation within one registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(u64);

/// Kind of a registered operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// Wraps a single future.
    Promise,
    /// Stands for a live subscription.
    Deferred,
}

type CancelHook = Box<dyn FnOnce() + Send>;

struct Entry {
    name: String,
    owner: Option<EntityId>,
    kind: OperationKind,
    cancel: Option<CancelHook>,
}

struct Registry {
    label: String,
    runtime: Handle,
    ledger: Mutex<BTreeMap<OperationId, Entry>>,
    next_id: AtomicU64,
    idle: Notify,
}

impl Registry {
    fn take(&self, id: OperationId) -> Option<Entry> {
        let mut ledger = self.ledger.lock();
        let entry = ledger.remove(&id)?;
        if ledger.is_empty() {
            self.idle.notify_waiters();
        }
        Some(entry)
    }

    fn take_matching(&self, matches: impl Fn(&Entry) -> bool) -> Vec<(OperationId, Entry)> {
        let mut ledger = self.ledger.lock();
        let ids: Vec<OperationId> = ledger
            .iter()
            .filter(|(_, entry)| matches(entry))
            .map(|(id, _)| *id)
            .collect();
        let taken: Vec<_> = ids
            .into_iter()
            .filter_map(|id| ledger.remove(&id).map(|entry| (id, entry)))
            .collect();
        if !taken.is_empty() && ledger.is_empty() {
            self.idle.notify_waiters();
        }
        taken
    }
}

/// Shared ledger of in-flight operations of one context.
///
/// Cloning is cheap and yields a handle to the same ledger.
#[derive(Clone)]
pub struct Operations {
    registry: Arc<Registry>,
}

impl Operations {
    /// Creates a registry that spawns promise operations on `runtime`.
    pub fn new(label: impl Into<String>, runtime: Handle) -> Self {
        Self {
            registry: Arc::new(Registry {
                label: label.into(),
                runtime,
                ledger: Mutex::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
                idle: Notify::new(),
            }),
        }
    }

    /// Label of the owning context, used in logs.
    pub fn label(&self) -> &str {
        &self.registry.label
    }

    /// Runtime promise operations are spawned on.
    pub fn runtime(&self) -> &Handle {
        &self.registry.runtime
    }

    /// Registers and spawns `future`.
    ///
    /// The operation leaves the ledger when the future finishes or when it is
    /// cancelled, whichever happens first. Dropping the returned handle does
    /// not cancel the work.
    pub fn invoke<T, F>(
        &self,
        name: impl Into<String>,
        owner: Option<EntityId>,
        future: F,
    ) -> Operation<T>
    where
        T: Send + 'static,
        F: Future<Output = SyncResult<T>> + Send + 'static,
    {
        let name = name.into();
        let slot = Arc::new(AbortSlot::default());
        let hook = Arc::clone(&slot);
        let id = self.insert(
            name.clone(),
            owner,
            OperationKind::Promise,
            Some(Box::new(move || hook.cancel())),
        );

        let guard = Deregister {
            registry: Arc::clone(&self.registry),
            id,
        };
        let started = Arc::clone(&slot);
        let handle = self.registry.runtime.spawn(async move {
            let _guard = guard;
            if started.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            future.await
        });
        slot.arm(handle.abort_handle());

        Operation {
            id,
            name,
            handle,
            operations: self.clone(),
        }
    }

    /// Registers a deferred operation with a cancellation hook.
    pub fn register_deferred(
        &self,
        name: impl Into<String>,
        owner: Option<EntityId>,
        cancel: impl FnOnce() + Send + 'static,
    ) -> OperationId {
        self.insert(
            name.into(),
            owner,
            OperationKind::Deferred,
            Some(Box::new(cancel)),
        )
    }

    /// Removes an operation without running its cancellation hook.
    ///
    /// Returns false if it already left the ledger.
    pub fn complete(&self, id: OperationId) -> bool {
        match self.registry.take(id) {
            Some(entry) => {
                trace!(
                    context = %self.registry.label,
                    operation = %entry.name,
                    "operation completed"
                );
                true
            }
            None => false,
        }
    }

    /// Removes an operation and runs its cancellation hook.
    ///
    /// Returns false if it already left the ledger.
    pub fn cancel(&self, id: OperationId) -> bool {
        match self.registry.take(id) {
            Some(entry) => {
                self.run_hooks(vec![(id, entry)]);
                true
            }
            None => false,
        }
    }

    /// Cancels every operation owned by `owner`. Returns how many were cancelled.
    pub fn cancel_owned(&self, owner: EntityId) -> usize {
        let taken = self
            .registry
            .take_matching(|entry| entry.owner == Some(owner));
        let count = taken.len();
        self.run_hooks(taken);
        count
    }

    /// Cancels every operation. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let taken = self.registry.take_matching(|_| true);
        let count = taken.len();
        self.run_hooks(taken);
        count
    }

    /// Waits until the ledger is empty.
    ///
    /// Operations registered while waiting are waited for too. Emptiness is
    /// re-checked after yielding to the scheduler so that work spawned by a
    /// just-finished operation is not missed.
    pub async fn settle(&self) {
        loop {
            let notified = self.registry.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_empty() {
                tokio::task::yield_now().await;
                if self.is_empty() {
                    return;
                }
                continue;
            }
            notified.await;
        }
    }

    /// Number of operations in the ledger.
    pub fn len(&self) -> usize {
        self.registry.ledger.lock().len()
    }

    /// Returns true if no operation is in flight.
    pub fn is_empty(&self) -> bool {
        self.registry.ledger.lock().is_empty()
    }

    /// Names of the operations in the ledger, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.registry
            .ledger
            .lock()
            .values()
            .map(|entry| entry.name.clone())
            .collect()
    }

    /// Kind of a registered operation.
    pub fn kind(&self, id: OperationId) -> Option<OperationKind> {
        self.registry.ledger.lock().get(&id).map(|entry| entry.kind)
    }

    fn insert(
        &self,
        name: String,
        owner: Option<EntityId>,
        kind: OperationKind,
        cancel: Option<CancelHook>,
    ) -> OperationId {
        let id = OperationId(self.registry.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(
            context = %self.registry.label,
            operation = %name,
            ?kind,
            "operation registered"
        );
        self.registry.ledger.lock().insert(
            id,
            Entry {
                name,
                owner,
                kind,
                cancel,
            },
        );
        id
    }

    fn run_hooks(&self, taken: Vec<(OperationId, Entry)>) {
        for (_, entry) in taken {
            debug!(
                context = %self.registry.label,
                operation = %entry.name,
                "operation cancelled"
            );
            if let Some(cancel) = entry.cancel {
                cancel();
            }
        }
    }
}

impl fmt::Debug for Operations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operations")
            .field("label", &self.registry.label)
            .field("pending", &self.names())
            .finish()
    }
}

/// Cancellation hook of a promise operation.
///
/// The hook is in the ledger before the task is spawned; a cancel that lands
/// before [`AbortSlot::arm`] is replayed when the abort handle arrives.
#[derive(Default)]
struct AbortSlot {
    state: Mutex<(bool, Option<AbortHandle>)>,
}

impl AbortSlot {
    fn cancel(&self) {
        let mut state = self.state.lock();
        state.0 = true;
        if let Some(abort) = &state.1 {
            abort.abort();
        }
    }

    fn arm(&self, abort: AbortHandle) {
        let mut state = self.state.lock();
        if state.0 {
            abort.abort();
        }
        state.1 = Some(abort);
    }

    fn is_cancelled(&self) -> bool {
        self.state.lock().0
    }
}

/// Removes a promise operation when its task ends, including on abort.
struct Deregister {
    registry: Arc<Registry>,
    id: OperationId,
}

impl Drop for Deregister {
    fn drop(&mut self) {
        if let Some(entry) = self.registry.take(self.id) {
            trace!(
                context = %self.registry.label,
                operation = %entry.name,
                "operation finished"
            );
        }
    }
}

/// Handle to a spawned promise operation.
///
/// Resolves with the future's result, or with [`SyncError::Cancelled`] if the
/// operation was cancelled first.
pub struct Operation<T> {
    id: OperationId,
    name: String,
    handle: JoinHandle<SyncResult<T>>,
    operations: Operations,
}

impl<T> Operation<T> {
    /// Ledger id.
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Operation name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true once the spawned future has ended.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancels the operation.
    pub fn cancel(&self) -> bool {
        self.operations.cancel(self.id)
    }
}

impl<T> Future for Operation<T> {
    type Output = SyncResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.handle).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(err)) if err.is_cancelled() => Poll::Ready(Err(SyncError::Cancelled)),
            Poll::Ready(Err(err)) => std::panic::resume_unwind(err.into_panic()),
        }
    }
}

impl<T> fmt::Debug for Operation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}
