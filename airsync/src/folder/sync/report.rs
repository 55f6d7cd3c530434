//! Module dedicated to folder hierarchy synchronization reporting.
//!
//! The core structure of this module is the [`FolderSyncReport`],
//! which is also the response shipped back to the device.

use crate::{
    cursor::Cursor,
    folder::{DeviceFolder, FolderId},
};

/// The folder hierarchy synchronization report.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FolderSyncReport {
    /// The new hierarchy cursor of the device.
    pub cursor: Cursor,

    /// The folders added to the device view.
    pub added: Vec<DeviceFolder>,

    /// The folders whose name or place changed.
    pub changed: Vec<DeviceFolder>,

    /// The device folder identifiers removed from the view.
    pub deleted: Vec<FolderId>,
}

impl FolderSyncReport {
    /// Return `true` if the report carries no folder change.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.deleted.is_empty()
    }
}
