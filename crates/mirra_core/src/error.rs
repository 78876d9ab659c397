//! Error types for the sync core.

use mirra_protocol::{ErrorCode, RemoteError};
use serde::{Serialize, Serializer};
use thiserror::Error;

/// Result type for sync core operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in the sync core.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// The remote capability reported a failure.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// The operation was cancelled before it completed.
    #[error("operation cancelled")]
    Cancelled,

    /// The entity was used after it was destroyed.
    #[error("{entity} is destroyed")]
    Destroyed {
        /// Description of the destroyed entity.
        entity: String,
    },

    /// The context was used after it was destroyed.
    #[error("context '{identifier}' is destroyed")]
    ContextDestroyed {
        /// Context identifier.
        identifier: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// No tokio runtime was available when the store was created.
    #[error("a tokio runtime is required")]
    MissingRuntime,
}

impl SyncError {
    /// Creates a destroyed-entity error.
    pub fn destroyed(entity: impl Into<String>) -> Self {
        Self::Destroyed {
            entity: entity.into(),
        }
    }

    /// Creates a destroyed-context error.
    pub fn context_destroyed(identifier: impl Into<String>) -> Self {
        Self::ContextDestroyed {
            identifier: identifier.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Machine-readable code of a remote failure.
    pub fn code(&self) -> Option<&ErrorCode> {
        match self {
            SyncError::Remote(err) => Some(&err.code),
            _ => None,
        }
    }

    /// Returns the remote error, if this is one.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            SyncError::Remote(err) => Some(err),
            _ => None,
        }
    }

    /// Returns true if the remote reported a missing document or object.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::Remote(err) if err.is_not_found())
    }

    /// Returns true if the operation was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }

    /// This error as a remote error value, for serialized entity state.
    pub fn to_remote(&self) -> RemoteError {
        match self {
            SyncError::Remote(err) => err.clone(),
            SyncError::Cancelled => RemoteError::new(ErrorCode::Cancelled, self.to_string()),
            _ => RemoteError::new(ErrorCode::Internal, self.to_string()),
        }
    }
}

/// Serializes an optional error as `{code, message}` or `null`.
pub(crate) fn serialize_error<S: Serializer>(
    error: &Option<SyncError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    error.as_ref().map(SyncError::to_remote).serialize(serializer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_code_is_exposed() {
        let err = SyncError::from(RemoteError::not_found("missing"));
        assert_eq!(err.code(), Some(&ErrorCode::NotFound));
        assert!(err.is_not_found());
        assert!(err.remote().is_some());

        assert_eq!(SyncError::Cancelled.code(), None);
        assert!(SyncError::Cancelled.is_cancelled());
    }

    #[test]
    fn error_display() {
        let err = SyncError::destroyed("document ducks/yellow");
        assert_eq!(err.to_string(), "document ducks/yellow is destroyed");

        let err = SyncError::context_destroyed("nested");
        assert_eq!(err.to_string(), "context 'nested' is destroyed");

        let err = SyncError::from(RemoteError::unauthorized("denied"));
        assert_eq!(err.to_string(), "remote error: unauthorized: denied");
    }

    #[test]
    fn local_errors_map_to_remote_codes() {
        assert_eq!(SyncError::Cancelled.to_remote().code, ErrorCode::Cancelled);
        assert_eq!(
            SyncError::destroyed("task").to_remote().code,
            ErrorCode::Internal
        );
        let remote = RemoteError::not_found("gone");
        assert_eq!(SyncError::from(remote.clone()).to_remote(), remote);
    }
}
