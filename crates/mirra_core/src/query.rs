//! Live queries over a document or a collection.
//!
//! Each snapshot is mapped onto canonical documents from the identity map,
//! so a document reached through a query is the same object as the one
//! returned by [`Context::doc`](crate::Context::doc).

use crate::context::ContextInner;
use crate::document::{Document, DocumentInit};
use crate::entity::{Entity, EntityHeader};
use crate::error::{SyncError, SyncResult};
use crate::identity::IdentityKey;
use crate::observer::{SnapshotDelegate, SnapshotObserver};
use crate::state::{MetadataFlags, MetadataState};
use mirra_protocol::{QueryTarget, RemoteError, Snapshot, SnapshotMetadata};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use tracing::warn;

/// Shape of a query's content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueryKind {
    /// Every matching document.
    #[default]
    Array,
    /// The first matching document only.
    Single,
}

impl QueryKind {
    fn as_str(&self) -> &'static str {
        match self {
            QueryKind::Array => "array",
            QueryKind::Single => "single",
        }
    }
}

/// Parts a query is created from.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryInit {
    /// Identity of the query; queries with the same id are the same object.
    pub id: Option<String>,
    /// What to observe.
    pub target: QueryTarget,
    /// Content shape.
    pub kind: QueryKind,
}

impl QueryInit {
    /// An array query over a collection.
    pub fn collection(path: impl Into<String>) -> Self {
        Self {
            id: None,
            target: QueryTarget::Collection(path.into()),
            kind: QueryKind::Array,
        }
    }

    /// A single-document query.
    pub fn document(path: impl Into<String>) -> Self {
        Self {
            id: None,
            target: QueryTarget::Document(path.into()),
            kind: QueryKind::Single,
        }
    }

    /// Sets the query id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the content shape.
    #[must_use]
    pub fn with_kind(mut self, kind: QueryKind) -> Self {
        self.kind = kind;
        self
    }
}

struct QueryInner {
    content: Vec<Arc<Document>>,
    state: MetadataState,
    metadata: Option<SnapshotMetadata>,
}

/// A live query.
pub struct Query {
    header: EntityHeader,
    target: QueryTarget,
    kind: QueryKind,
    context: Weak<ContextInner>,
    inner: Mutex<QueryInner>,
    observer: SnapshotObserver,
}

impl Query {
    pub(crate) fn resolve(context: &ContextInner, init: QueryInit) -> SyncResult<Arc<Query>> {
        let key = init.id.clone().map(IdentityKey::query);
        let operations = context.operations().clone();
        let source = Arc::clone(&context.remote().documents);
        let options = context.config().snapshot_options;
        context.resolve(key, None, |seed| {
            let owner = Some(seed.id);
            let context = seed.context.clone();
            Arc::new_cyclic(|me: &Weak<Query>| {
                let delegate: Weak<dyn SnapshotDelegate> = me.clone();
                Query {
                    header: seed.into_header("query"),
                    observer: SnapshotObserver::new(
                        operations,
                        source,
                        init.target.clone(),
                        options,
                        owner,
                        delegate,
                    ),
                    target: init.target,
                    kind: init.kind,
                    context,
                    inner: Mutex::new(QueryInner {
                        content: Vec::new(),
                        state: MetadataState::new(),
                        metadata: None,
                    }),
                }
            })
        })
    }

    /// Observed target.
    pub fn target(&self) -> &QueryTarget {
        &self.target
    }

    /// Content shape.
    pub fn kind(&self) -> QueryKind {
        self.kind
    }

    /// Query id, if keyed.
    pub fn id(&self) -> Option<String> {
        self.header.key().map(|key| key.key().to_string())
    }

    /// Current content, in result order.
    pub fn content(&self) -> Vec<Arc<Document>> {
        self.inner.lock().content.clone()
    }

    /// First document of the content.
    pub fn first(&self) -> Option<Arc<Document>> {
        self.inner.lock().content.first().cloned()
    }

    /// Current state projections.
    pub fn state(&self) -> MetadataFlags {
        self.inner.lock().state.flags()
    }

    /// Metadata of the last snapshot.
    pub fn metadata(&self) -> Option<SnapshotMetadata> {
        self.inner.lock().metadata
    }

    /// Starts observing. Idempotent.
    pub fn observe(&self) -> SyncResult<()> {
        self.header.ensure_live()?;
        self.observer.start();
        Ok(())
    }

    /// Observes the target and resolves once the first snapshot applied.
    pub fn promise(&self) -> SyncResult<impl Future<Output = SyncResult<()>> + Send + 'static> {
        self.header.ensure_live()?;
        let first = self.observer.promise();
        Ok(async move { first.await.map(|_| ()) })
    }

    fn canonical(&self, snapshot: &Snapshot) -> SyncResult<Vec<Arc<Document>>> {
        let context = self
            .context
            .upgrade()
            .ok_or_else(|| SyncError::destroyed(self.header.describe()))?;
        let mut documents = Vec::new();
        for remote in snapshot.data.documents() {
            let document = Document::resolve(&context, DocumentInit::at(&remote.path)?)?;
            document.apply_remote(remote);
            documents.push(document);
            if self.kind == QueryKind::Single {
                break;
            }
        }
        Ok(documents)
    }
}

impl Entity for Query {
    fn header(&self) -> &EntityHeader {
        &self.header
    }

    fn serialized(&self) -> Value {
        let inner = self.inner.lock();
        let content: Vec<Value> = inner
            .content
            .iter()
            .map(|document| document.serialized())
            .collect();
        json!({
            "id": self.id(),
            "target": self.target.to_string(),
            "type": self.kind.as_str(),
            "content": content,
            "state": inner.state.flags(),
        })
    }

    fn will_destroy(&self) {
        self.observer.stop();
    }
}

impl SnapshotDelegate for Query {
    fn on_loading(&self) {
        self.header.changes().with_changes(true, |changed| {
            self.inner.lock().state.loading(changed);
        });
    }

    fn on_metadata(&self, metadata: SnapshotMetadata) {
        self.header.changes().with_changes(true, |changed| {
            self.inner.lock().metadata = Some(metadata);
            changed.changed("metadata");
        });
    }

    fn on_snapshot(&self, snapshot: &Snapshot) {
        let documents = match self.canonical(snapshot) {
            Ok(documents) => documents,
            Err(error) => {
                warn!(query = %self.target, %error, "dropping snapshot");
                return;
            }
        };
        self.header.changes().with_changes(true, |changed| {
            let mut inner = self.inner.lock();
            let same = inner.content.len() == documents.len()
                && inner
                    .content
                    .iter()
                    .zip(&documents)
                    .all(|(a, b)| Arc::ptr_eq(a, b));
            if !same {
                inner.content = documents;
                changed.changed("content");
            }
            inner.state.loaded(changed);
        });
    }

    fn on_error(&self, error: &RemoteError) {
        self.header.changes().with_changes(true, |changed| {
            self.inner.lock().state.failed(SyncError::from(error.clone()), changed);
        });
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("id", &self.header.id())
            .field("target", &self.target)
            .field("kind", &self.kind)
            .finish()
    }
}
