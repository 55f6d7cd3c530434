use std::{any::Any, result};

use thiserror::Error;

use crate::{AnyBoxedError, AnyError};

/// The global `Result` alias of the module.
pub type Result<T> = result::Result<T, Error>;

/// The global `Error` enum of the module.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot find device {0}")]
    DeviceNotFoundError(String),
    #[error("cannot register device {0}: synchronization is disabled")]
    SyncDisabledError(String),
    #[error("cannot register device {0}: account {1} reached its device limit")]
    TooManyDevicesError(String, String),
    #[error("cannot register device {0}: already registered by another account")]
    DeviceOwnedByOtherAccountError(String),
    #[error("cannot register device {0}: device was remote wiped, approval required")]
    ReRegisterWipedDeviceError(String),
    #[error("cannot acknowledge policy for device {0}: key mismatch")]
    PolicyKeyMismatchError(String),
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
