use std::{any::Any, result};

use thiserror::Error;

use crate::{
    audit::{SyncCommand, SyncStatus},
    cursor::{self, Cursor},
    device::{self, DenyReason},
    folder, provision, AnyBoxedError, AnyError,
};

/// The global `Result` alias of the module.
pub type Result<T> = result::Result<T, Error>;

/// The global `Error` enum of the module.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot process command for device {0}: {1}")]
    DeviceDeniedError(String, DenyReason),
    #[error("cannot process command for device {0}: policy acknowledgment required")]
    PolicyRequiredError(String),
    #[error("cannot process command for device {0}: remote wipe pending")]
    RemoteWipeRequestedError(String),
    #[error("cannot sync {0}: cursor {1} was never issued, restart from the initial cursor")]
    InvalidCursorError(String, Cursor),
    #[error("cannot sync {0}: cursor {1} was superseded, restart from the initial cursor")]
    StaleCursorError(String, Cursor),
    #[error("cannot sync for device {0}: concurrent cursor advance")]
    SyncConflictError(String),
    #[error("command {0} is not supported by this server")]
    UnsupportedCommandError(SyncCommand),
    #[error("cannot reach mailbox storage")]
    MailboxError(#[source] AnyBoxedError),

    #[error(transparent)]
    DeviceError(#[from] device::Error),
    #[error(transparent)]
    FolderError(#[from] folder::Error),
    #[error(transparent)]
    CursorError(#[from] cursor::Error),
    #[error(transparent)]
    ProvisionError(#[from] provision::Error),
}

impl Error {
    /// Map the error to the audit status class of the exchange.
    pub fn status(&self) -> SyncStatus {
        match self {
            Self::DeviceDeniedError(..) => SyncStatus::AuthenticationError,
            Self::PolicyRequiredError(_) => SyncStatus::PolicyError,
            Self::RemoteWipeRequestedError(_) => SyncStatus::AuthenticationError,
            Self::InvalidCursorError(..) => SyncStatus::ProtocolError,
            Self::StaleCursorError(..) => SyncStatus::ProtocolError,
            Self::SyncConflictError(_) => SyncStatus::SyncError,
            Self::UnsupportedCommandError(_) => SyncStatus::ClientError,
            Self::MailboxError(_) => SyncStatus::ServerError,
            Self::DeviceError(err) => match err {
                device::Error::DeviceNotFoundError(_) => SyncStatus::ProtocolError,
                device::Error::PolicyKeyMismatchError(_) => SyncStatus::PolicyError,
                _ => SyncStatus::AuthenticationError,
            },
            Self::FolderError(err) => match err {
                folder::Error::FolderNotFoundError(_) => SyncStatus::FolderError,
                folder::Error::FolderNotSyncEnabledError(_) => SyncStatus::FolderError,
                _ => SyncStatus::ProtocolError,
            },
            Self::CursorError(err) => match err {
                cursor::Error::ParseCursorError(_) => SyncStatus::ProtocolError,
                cursor::Error::AdvanceConflictError(_) => SyncStatus::SyncError,
                cursor::Error::RegressingPositionError(..) => SyncStatus::ServerError,
            },
            Self::ProvisionError(err) => match err {
                provision::Error::ParsePolicyKeyError(_) => SyncStatus::ProtocolError,
                _ => SyncStatus::PolicyError,
            },
        }
    }

    /// Stable short code recorded in the audit trail.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DeviceDeniedError(..) => "device-denied",
            Self::PolicyRequiredError(_) => "policy-required",
            Self::RemoteWipeRequestedError(_) => "remote-wipe",
            Self::InvalidCursorError(..) => "invalid-cursor",
            Self::StaleCursorError(..) => "stale-cursor",
            Self::SyncConflictError(_) => "sync-conflict",
            Self::UnsupportedCommandError(_) => "unsupported-command",
            Self::MailboxError(_) => "mailbox-unavailable",
            Self::DeviceError(_) => "device-error",
            Self::FolderError(_) => "folder-error",
            Self::CursorError(_) => "cursor-error",
            Self::ProvisionError(_) => "provision-error",
        }
    }
}

impl AnyError for Error {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl From<Error> for AnyBoxedError {
    fn from(err: Error) -> Self {
        Box::new(err)
    }
}
