use std::{any::Any, result};

use thiserror::Error;

use crate::{AnyBoxedError, AnyError};

/// The global `Result` alias of the module.
pub type Result<T> = result::Result<T, Error>;

/// The global `Error` enum of the module.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot find folder {0}")]
    FolderNotFoundError(String),
    #[error("cannot sync folder {0}: synchronization is disabled for it")]
    FolderNotSyncEnabledError(String),
    #[error("cannot parse folder kind {0}")]
    ParseFolderKindError(String),
    #[error("cannot parse conflict resolution {0}")]
    ParseConflictResolutionError(String),
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
