//! Errors reported by remote capabilities.

use serde::{Serialize, Serializer};
use std::fmt;
use thiserror::Error;

/// Result type for remote capability calls.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Machine-readable error code carried by every [`RemoteError`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The addressed document or object does not exist.
    NotFound,
    /// The caller is signed in but not allowed to perform the operation.
    Unauthorized,
    /// The operation requires a signed-in user.
    Unauthenticated,
    /// Security rules rejected the operation.
    PermissionDenied,
    /// The backend could not be reached.
    Unavailable,
    /// The operation was cancelled by the backend or the caller.
    Cancelled,
    /// Unexpected backend failure.
    Internal,
    /// Any other backend-specific code.
    Other(String),
}

impl ErrorCode {
    /// Returns the wire representation of the code (for example `not-found`).
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::NotFound => "not-found",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::Unauthenticated => "unauthenticated",
            ErrorCode::PermissionDenied => "permission-denied",
            ErrorCode::Unavailable => "unavailable",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::Internal => "internal",
            ErrorCode::Other(code) => code,
        }
    }

    /// Parses a wire code. Unknown codes are kept verbatim.
    pub fn parse(code: &str) -> Self {
        match code {
            "not-found" => ErrorCode::NotFound,
            "unauthorized" => ErrorCode::Unauthorized,
            "unauthenticated" => ErrorCode::Unauthenticated,
            "permission-denied" => ErrorCode::PermissionDenied,
            "unavailable" => ErrorCode::Unavailable,
            "cancelled" => ErrorCode::Cancelled,
            "internal" => ErrorCode::Internal,
            other => ErrorCode::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// An error delivered by a remote capability.
///
/// Remote errors are plain values: they are cloned into entity state so the
/// last raw error stays observable after the failing call has returned.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{code}: {message}")]
pub struct RemoteError {
    /// Machine-readable code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
}

impl RemoteError {
    /// Creates a remote error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Creates a `not-found` error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    /// Creates an `unauthorized` error.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    /// Creates an `unauthenticated` error.
    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthenticated, message)
    }

    /// Creates a `permission-denied` error.
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PermissionDenied, message)
    }

    /// Creates an `unavailable` error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unavailable, message)
    }

    /// Returns true if this error reports a missing document or object.
    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::NotFound
    }
}
