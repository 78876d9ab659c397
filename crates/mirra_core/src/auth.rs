//! Authentication service.

use crate::context::ContextInner;
use crate::entity::{Entity, EntityHeader};
use crate::error::{SyncError, SyncResult};
use crate::identity::IdentityKey;
use mirra_protocol::{Authenticator, User};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Auth service of one context.
pub struct Auth {
    header: EntityHeader,
    me: Weak<Auth>,
    remote: Arc<dyn Authenticator>,
    user: Mutex<Option<User>>,
}

impl Auth {
    pub(crate) fn resolve(context: &ContextInner) -> SyncResult<Arc<Auth>> {
        let remote = Arc::clone(&context.remote().auth);
        context.resolve(Some(IdentityKey::service("auth")), None, |seed| {
            let user = remote.current_user();
            Arc::new_cyclic(|me| Auth {
                header: seed.into_header("auth"),
                me: me.clone(),
                remote,
                user: Mutex::new(user),
            })
        })
    }

    /// Signed-in user as last seen by this service.
    pub fn user(&self) -> Option<User> {
        self.user.lock().clone()
    }

    /// Signs in with a fresh anonymous account.
    pub async fn sign_in_anonymously(&self) -> SyncResult<User> {
        let context = self.header.context()?;
        let remote = Arc::clone(&self.remote);
        let this = self.this()?;
        context
            .operations()
            .invoke("auth.sign_in_anonymously", Some(self.header.id()), async move {
                let user = remote.sign_in_anonymously().await.map_err(SyncError::from);
                if let Ok(user) = &user {
                    debug!(uid = %user.uid, "signed in");
                    this.set_user(Some(user.clone()));
                }
                user
            })
            .await
    }

    /// Signs the current user out.
    pub async fn sign_out(&self) -> SyncResult<()> {
        let context = self.header.context()?;
        let remote = Arc::clone(&self.remote);
        let this = self.this()?;
        context
            .operations()
            .invoke("auth.sign_out", Some(self.header.id()), async move {
                let result = remote.sign_out().await.map_err(SyncError::from);
                if result.is_ok() {
                    this.set_user(None);
                }
                result
            })
            .await
    }

    fn set_user(&self, user: Option<User>) {
        self.header.changes().with_changes(true, |changed| {
            let mut slot = self.user.lock();
            if *slot != user {
                *slot = user;
                changed.changed("user");
            }
        });
    }

    fn this(&self) -> SyncResult<Arc<Auth>> {
        self.me
            .upgrade()
            .ok_or_else(|| SyncError::destroyed(self.header.describe()))
    }
}

impl Entity for Auth {
    fn header(&self) -> &EntityHeader {
        &self.header
    }

    fn serialized(&self) -> Value {
        json!({ "user": self.user() })
    }
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Auth")
            .field("id", &self.header.id())
            .field("user", &self.user())
            .finish()
    }
}
