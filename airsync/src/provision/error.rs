use std::{any::Any, result};

use thiserror::Error;

use crate::{device, AnyBoxedError, AnyError};

use super::PolicyKey;

/// The global `Result` alias of the module.
pub type Result<T> = result::Result<T, Error>;

/// The global `Error` enum of the module.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot parse policy key {0}")]
    ParsePolicyKeyError(String),
    #[error("cannot acknowledge policy for device {0}: no policy published")]
    NoPolicyPublishedError(String),
    #[error("cannot acknowledge policy key {0}: superseded by {1}")]
    SupersededPolicyKeyError(PolicyKey, PolicyKey),

    #[error(transparent)]
    DeviceError(#[from] device::Error),
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
