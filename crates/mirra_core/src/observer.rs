//! Snapshot observer.
//!
//! Adapts a push-based remote subscription into local signals:
//!
//! - `on_loading` when the observer starts, before the subscription opens
//! - `on_metadata` when snapshot metadata differs from the last one seen
//! - `on_snapshot` for every snapshot
//! - `on_loaded` once, after the first snapshot
//! - `on_error` once, when the subscription fails
//!
//! plus a first-resolution future ([`SnapshotObserver::promise`]) that
//! resolves exactly once: with the first snapshot, with `None` if the
//! observer stops first, or with the subscription error.
//!
//! The observer registers a deferred operation while it waits for the first
//! snapshot, so [`Operations::settle`] covers initial loads.

use crate::error::{SyncError, SyncResult};
use crate::lifecycle::EntityId;
use crate::operation::{OperationId, Operations};
use mirra_protocol::{
    DocumentSource, ListenerRegistration, QueryTarget, RemoteError, RemoteResult, Snapshot,
    SnapshotMetadata, SnapshotOptions,
};
use parking_lot::{Mutex, ReentrantMutex};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

/// Receives the signals of a [`SnapshotObserver`].
///
/// Callbacks run on the thread delivering the snapshot, one at a time.
pub trait SnapshotDelegate: Send + Sync {
    /// The observer started and is waiting for data.
    fn on_loading(&self) {}

    /// The first snapshot has been applied.
    fn on_loaded(&self) {}

    /// Snapshot metadata changed.
    fn on_metadata(&self, _metadata: SnapshotMetadata) {}

    /// A snapshot arrived.
    fn on_snapshot(&self, snapshot: &Snapshot);

    /// The subscription failed. No further callbacks follow.
    fn on_error(&self, error: &RemoteError);
}

/// Phase of a [`SnapshotObserver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverPhase {
    /// Not started.
    Idle,
    /// Start in progress.
    Starting,
    /// Waiting for the first snapshot.
    Loading,
    /// At least one snapshot applied.
    Loaded,
    /// Stopped or failed. Terminal.
    Stopped,
}

#[derive(Debug, Clone)]
enum FirstResolution {
    Pending,
    Resolved(Option<Snapshot>),
    Failed(RemoteError),
}

struct ObserverState {
    phase: ObserverPhase,
    last_metadata: Option<SnapshotMetadata>,
    operation: Option<OperationId>,
    registration: Option<ListenerRegistration>,
}

struct ObserverInner {
    operations: Operations,
    source: Arc<dyn DocumentSource>,
    target: QueryTarget,
    options: SnapshotOptions,
    owner: Option<EntityId>,
    delegate: Weak<dyn SnapshotDelegate>,
    state: Mutex<ObserverState>,
    delivery: ReentrantMutex<()>,
    generation: AtomicU64,
    first: watch::Sender<FirstResolution>,
}

/// Live subscription adapter. Cloning yields a handle to the same observer.
#[derive(Clone)]
pub struct SnapshotObserver {
    inner: Arc<ObserverInner>,
}

impl SnapshotObserver {
    /// Creates an idle observer of `target`.
    ///
    /// The delegate is held weakly; once it is gone, snapshots are dropped.
    pub fn new(
        operations: Operations,
        source: Arc<dyn DocumentSource>,
        target: QueryTarget,
        options: SnapshotOptions,
        owner: Option<EntityId>,
        delegate: Weak<dyn SnapshotDelegate>,
    ) -> Self {
        let (first, _) = watch::channel(FirstResolution::Pending);
        Self {
            inner: Arc::new(ObserverInner {
                operations,
                source,
                target,
                options,
                owner,
                delegate,
                state: Mutex::new(ObserverState {
                    phase: ObserverPhase::Idle,
                    last_metadata: None,
                    operation: None,
                    registration: None,
                }),
                delivery: ReentrantMutex::new(()),
                generation: AtomicU64::new(0),
                first,
            }),
        }
    }

    /// Observed target.
    pub fn target(&self) -> &QueryTarget {
        &self.inner.target
    }

    /// Current phase.
    pub fn phase(&self) -> ObserverPhase {
        self.inner.state.lock().phase
    }

    /// Metadata of the last snapshot.
    pub fn metadata(&self) -> Option<SnapshotMetadata> {
        self.inner.state.lock().last_metadata
    }

    /// Returns true once the first snapshot has been applied.
    pub fn is_loaded(&self) -> bool {
        self.phase() == ObserverPhase::Loaded
    }

    /// Starts observing. Calling it again, or after stop, does nothing.
    pub fn start(&self) {
        self.inner.start();
    }

    /// Stops observing. Idempotent.
    ///
    /// No delegate callback runs after this returns. A pending
    /// first-resolution future resolves with `None`.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Future of the first resolution. Starts the observer if needed.
    pub fn promise(&self) -> impl Future<Output = SyncResult<Option<Snapshot>>> + Send + 'static {
        self.inner.start();
        let mut first = self.inner.first.subscribe();
        async move {
            let resolution = first
                .wait_for(|value| !matches!(value, FirstResolution::Pending))
                .await
                .map(|value| value.clone());
            match resolution {
                Ok(FirstResolution::Resolved(snapshot)) => Ok(snapshot),
                Ok(FirstResolution::Failed(error)) => Err(SyncError::Remote(error)),
                Ok(FirstResolution::Pending) | Err(_) => Ok(None),
            }
        }
    }
}

impl ObserverInner {
    fn start(self: &Arc<Self>) {
        let generation = {
            let mut state = self.state.lock();
            if state.phase != ObserverPhase::Idle {
                return;
            }
            state.phase = ObserverPhase::Starting;

            let weak = Arc::downgrade(self);
            state.operation = Some(self.operations.register_deferred(
                format!("observe {}", self.target),
                self.owner,
                move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.stop();
                    }
                },
            ));
            self.generation.load(Ordering::SeqCst)
        };
        debug!(context = %self.operations.label(), query = %self.target, "observer starting");

        {
            let _delivery = self.delivery.lock();
            let loading = {
                let mut state = self.state.lock();
                let starting = state.phase == ObserverPhase::Starting;
                if starting {
                    state.phase = ObserverPhase::Loading;
                }
                starting
            };
            if loading {
                if let Some(delegate) = self.delegate.upgrade() {
                    delegate.on_loading();
                }
            }
        }

        let weak = Arc::downgrade(self);
        let registration = self.source.on_snapshot(
            &self.target,
            self.options,
            Box::new(move |result| {
                if let Some(inner) = weak.upgrade() {
                    inner.deliver(generation, result);
                }
            }),
        );

        let mut state = self.state.lock();
        if state.phase == ObserverPhase::Stopped {
            drop(state);
            registration.remove();
        } else {
            state.registration = Some(registration);
        }
    }

    fn deliver(&self, generation: u64, result: RemoteResult<Snapshot>) {
        let _delivery = self.delivery.lock();
        if self.generation.load(Ordering::SeqCst) != generation {
            trace!(query = %self.target, "dropping late snapshot");
            return;
        }
        match result {
            Ok(snapshot) => self.on_snapshot(snapshot),
            Err(error) => self.on_error(error),
        }
    }

    fn on_snapshot(&self, snapshot: Snapshot) {
        let (metadata_changed, first) = {
            let mut state = self.state.lock();
            if state.phase == ObserverPhase::Stopped {
                return;
            }
            let metadata_changed = state.last_metadata != Some(snapshot.metadata);
            state.last_metadata = Some(snapshot.metadata);
            let first = state.phase != ObserverPhase::Loaded;
            if first {
                state.phase = ObserverPhase::Loaded;
            }
            (metadata_changed, first.then(|| state.operation.take()))
        };

        let delegate = self.delegate.upgrade();
        if let Some(delegate) = &delegate {
            if metadata_changed {
                delegate.on_metadata(snapshot.metadata);
            }
            delegate.on_snapshot(&snapshot);
        }

        if let Some(operation) = first {
            trace!(query = %self.target, "first snapshot");
            self.first.send_if_modified(|value| match value {
                FirstResolution::Pending => {
                    *value = FirstResolution::Resolved(Some(snapshot));
                    true
                }
                _ => false,
            });
            if let Some(delegate) = &delegate {
                delegate.on_loaded();
            }
            if let Some(operation) = operation {
                self.operations.complete(operation);
            }
        }
    }

    fn on_error(&self, error: RemoteError) {
        let (operation, registration) = {
            let mut state = self.state.lock();
            if state.phase == ObserverPhase::Stopped {
                return;
            }
            state.phase = ObserverPhase::Stopped;
            (state.operation.take(), state.registration.take())
        };
        self.generation.fetch_add(1, Ordering::SeqCst);
        warn!(query = %self.target, %error, "subscription failed");

        if let Some(delegate) = self.delegate.upgrade() {
            delegate.on_error(&error);
        }
        self.first.send_if_modified(|value| match value {
            FirstResolution::Pending => {
                *value = FirstResolution::Failed(error);
                true
            }
            _ => false,
        });
        if let Some(registration) = registration {
            registration.remove();
        }
        if let Some(operation) = operation {
            self.operations.complete(operation);
        }
    }

    fn stop(&self) {
        let _delivery = self.delivery.lock();
        let (operation, registration) = {
            let mut state = self.state.lock();
            if state.phase == ObserverPhase::Stopped {
                return;
            }
            state.phase = ObserverPhase::Stopped;
            (state.operation.take(), state.registration.take())
        };
        self.generation.fetch_add(1, Ordering::SeqCst);
        debug!(context = %self.operations.label(), query = %self.target, "observer stopped");

        if let Some(registration) = registration {
            registration.remove();
        }
        self.first.send_if_modified(|value| match value {
            FirstResolution::Pending => {
                *value = FirstResolution::Resolved(None);
                true
            }
            _ => false,
        });
        if let Some(operation) = operation {
            self.operations.complete(operation);
        }
    }
}

impl Drop for ObserverInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(registration) = state.registration.take() {
            registration.remove();
        }
        if let Some(operation) = state.operation.take() {
            self.operations.complete(operation);
        }
    }
}

impl fmt::Debug for SnapshotObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotObserver")
            .field("target", &self.inner.target)
            .field("phase", &self.phase())
            .finish()
    }
}
