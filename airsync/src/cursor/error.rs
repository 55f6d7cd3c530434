use std::{any::Any, result};

use thiserror::Error;

use crate::{AnyBoxedError, AnyError};

use super::Cursor;

/// The global `Result` alias of the module.
pub type Result<T> = result::Result<T, Error>;

/// The global `Error` enum of the module.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot parse cursor {0}")]
    ParseCursorError(String),
    #[error("cannot advance cursor for {0}: concurrent advance detected")]
    AdvanceConflictError(String),
    #[error("cannot advance cursor position from {0} back to {1}")]
    RegressingPositionError(Cursor, Cursor),
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
