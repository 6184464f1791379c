//! Launch failure taxonomy.
//!
//! Each component returns its own error type; a launch that fails ends in
//! [`LaunchFailure`], which keeps the original error and exposes the
//! user-facing [`ErrorKind`].

use std::fmt;

use serde::Serialize;

use crate::attach::AttachError;
use crate::client::ClientError;
use crate::launch::LaunchRequestError;
use crate::sync::SyncError;

/// User-facing error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network or service down.
    RemoteUnavailable,
    /// The control plane answered with an unexpected shape.
    MalformedResponse,
    /// The launch request was invalid; edit and resubmit.
    RequestRejected,
    /// The spec was created but never became visible locally.
    NotSynchronized,
    /// The session refused the detach or attach.
    AttachFailed,
    /// The new document could not be created, opened, or attached.
    CreationFailed,
}

impl ErrorKind {
    /// Stable snake_case identifier, as used in structured logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RemoteUnavailable => "remote_unavailable",
            ErrorKind::MalformedResponse => "malformed_response",
            ErrorKind::RequestRejected => "request_rejected",
            ErrorKind::NotSynchronized => "not_synchronized",
            ErrorKind::AttachFailed => "attach_failed",
            ErrorKind::CreationFailed => "creation_failed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::RemoteUnavailable => "remote unavailable",
            ErrorKind::MalformedResponse => "malformed response",
            ErrorKind::RequestRejected => "request rejected",
            ErrorKind::NotSynchronized => "kernel not ready",
            ErrorKind::AttachFailed => "attach failed",
            ErrorKind::CreationFailed => "creation failed",
        };
        write!(f, "{s}")
    }
}

/// Terminal failure of a launch, with the originating error preserved.
#[derive(Debug, thiserror::Error)]
pub enum LaunchFailure {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    InvalidRequest(#[from] LaunchRequestError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Attach(#[from] AttachError),
}

impl LaunchFailure {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LaunchFailure::Client(ClientError::RemoteUnavailable(_)) => {
                ErrorKind::RemoteUnavailable
            }
            LaunchFailure::Client(ClientError::MalformedResponse(_)) => {
                ErrorKind::MalformedResponse
            }
            LaunchFailure::Client(ClientError::RequestRejected { .. }) => {
                ErrorKind::RequestRejected
            }
            LaunchFailure::InvalidRequest(_) => ErrorKind::RequestRejected,
            LaunchFailure::Sync(SyncError::NotSynchronized { .. }) => ErrorKind::NotSynchronized,
            LaunchFailure::Attach(AttachError::AttachFailed { .. }) => ErrorKind::AttachFailed,
            LaunchFailure::Attach(AttachError::CreationFailed { .. }) => ErrorKind::CreationFailed,
        }
    }

    /// Whether retrying the whole launch unchanged is worth suggesting.
    ///
    /// Only a sync timeout qualifies; every other kind needs the user or the
    /// service to change something first.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::NotSynchronized
    }
}
