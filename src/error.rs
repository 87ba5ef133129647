use std::path::PathBuf;

use thiserror::Error;

#[cfg(windows)]
use windows::Win32::Foundation::{self, NTSTATUS};

pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors surfaced by the sync engine and its collaborators.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("path {path:?} is not under {root:?}")]
    OutOfScope { path: PathBuf, root: PathBuf },

    #[error("invalid sync roots: server {server:?}, client {client:?}")]
    BadRoots { server: PathBuf, client: PathBuf },

    #[error("no entry at {0:?}")]
    NotFound(PathBuf),

    #[error("destination {0:?} already exists")]
    Collision(PathBuf),

    #[error("{0:?} is in use by another process")]
    InUse(PathBuf),

    #[error("configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Watch(#[from] notify::Error),

    #[cfg(windows)]
    #[error(transparent)]
    Os(#[from] windows::core::Error),

    #[error("{0} requires the Windows cloud filter")]
    Unsupported(&'static str),
}

impl SyncError {
    /// Whether a retry could plausibly succeed. Scope and configuration
    /// problems never heal on their own.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            SyncError::OutOfScope { .. }
                | SyncError::BadRoots { .. }
                | SyncError::Config(_)
                | SyncError::Unsupported(_)
        )
    }
}

/// Completion codes reported back to the cloud filter on the hydration path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudErrorKind {
    AccessDenied,
    InUse,
    InvalidRequest,
    NetworkUnavailable,
    ObjectNotFound,
    ProviderNotRunning,
    RequestAborted,
    RequestCancelled,
    RequestTimeout,
    Unsuccessful,
}

#[cfg(windows)]
impl From<CloudErrorKind> for NTSTATUS {
    fn from(error: CloudErrorKind) -> Self {
        match error {
            CloudErrorKind::AccessDenied => Foundation::STATUS_CLOUD_FILE_ACCESS_DENIED,
            CloudErrorKind::InUse => Foundation::STATUS_CLOUD_FILE_IN_USE,
            CloudErrorKind::InvalidRequest => Foundation::STATUS_CLOUD_FILE_INVALID_REQUEST,
            CloudErrorKind::NetworkUnavailable => Foundation::STATUS_CLOUD_FILE_NETWORK_UNAVAILABLE,
            CloudErrorKind::ObjectNotFound => Foundation::STATUS_OBJECT_NAME_NOT_FOUND,
            CloudErrorKind::ProviderNotRunning => Foundation::STATUS_CLOUD_FILE_PROVIDER_NOT_RUNNING,
            CloudErrorKind::RequestAborted => Foundation::STATUS_CLOUD_FILE_REQUEST_ABORTED,
            CloudErrorKind::RequestCancelled => Foundation::STATUS_CLOUD_FILE_REQUEST_CANCELED,
            CloudErrorKind::RequestTimeout => Foundation::STATUS_CLOUD_FILE_REQUEST_TIMEOUT,
            CloudErrorKind::Unsuccessful => Foundation::STATUS_CLOUD_FILE_UNSUCCESSFUL,
        }
    }
}
