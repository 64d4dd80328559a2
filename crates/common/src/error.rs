//! Error taxonomy shared by both endpoints.
//!
//! Every fallible operation in the workspace reports an [`IamError`]: a
//! kind from the closed [`ErrorKind`] set plus a human-readable message.
//! The kind decides the wire translation (`tonic::Status` code) and the
//! retry policy (`Unavailable` is the only kind the dispatcher retries).

use std::fmt;

use tonic::{Code, Status};

/// Closed set of error kinds, orthogonal to the transport status.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or missing required field.
    InvalidArgument,
    /// Unknown node id, cert type or subscription.
    NotFound,
    /// Duplicate node registration.
    AlreadyExists,
    /// Operation illegal for the current node status, or TLS identity mismatch.
    PermissionDenied,
    /// Target node stream is closed or unreachable. Retried by the dispatcher.
    Unavailable,
    /// Per-call deadline exceeded. Never retried.
    TimedOut,
    /// Request would exceed a static capacity bound.
    ResourceExhausted,
    /// Collaborator failure (crypto, filesystem, subprocess).
    Internal,
    /// The dispatcher is shutting down.
    WrongState,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::NotFound => "not found",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::TimedOut => "timed out",
            ErrorKind::ResourceExhausted => "resource exhausted",
            ErrorKind::Internal => "internal",
            ErrorKind::WrongState => "wrong state",
        };
        f.write_str(name)
    }
}

/// An error with a kind and a message.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct IamError {
    kind: ErrorKind,
    message: String,
}

impl IamError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyExists, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermissionDenied, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TimedOut, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceExhausted, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn wrong_state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::WrongState, message)
    }

    /// Whether the forwarding retry loop may try this call again.
    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::Unavailable
    }
}

impl From<std::io::Error> for IamError {
    fn from(err: std::io::Error) -> Self {
        IamError::internal(err.to_string())
    }
}

impl From<IamError> for Status {
    fn from(err: IamError) -> Self {
        let code = match err.kind {
            ErrorKind::InvalidArgument => Code::InvalidArgument,
            ErrorKind::NotFound => Code::NotFound,
            ErrorKind::AlreadyExists => Code::AlreadyExists,
            ErrorKind::PermissionDenied => Code::PermissionDenied,
            ErrorKind::Unavailable => Code::Unavailable,
            ErrorKind::TimedOut => Code::DeadlineExceeded,
            ErrorKind::ResourceExhausted => Code::ResourceExhausted,
            ErrorKind::Internal => Code::Internal,
            ErrorKind::WrongState => Code::FailedPrecondition,
        };
        Status::new(code, err.message)
    }
}

impl From<Status> for IamError {
    fn from(status: Status) -> Self {
        let kind = match status.code() {
            Code::InvalidArgument => ErrorKind::InvalidArgument,
            Code::NotFound => ErrorKind::NotFound,
            Code::AlreadyExists => ErrorKind::AlreadyExists,
            Code::PermissionDenied => ErrorKind::PermissionDenied,
            Code::Unavailable => ErrorKind::Unavailable,
            Code::DeadlineExceeded => ErrorKind::TimedOut,
            Code::ResourceExhausted => ErrorKind::ResourceExhausted,
            Code::FailedPrecondition => ErrorKind::WrongState,
            _ => ErrorKind::Internal,
        };
        IamError::new(kind, status.message().to_string())
    }
}
