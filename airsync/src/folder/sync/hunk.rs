//! Module dedicated to folder hierarchy synchronization hunks.
//!
//! The core structure of the module is the [`FolderSyncHunk`], which
//! represents one folder-tree change in a patch.

use std::fmt;

use crate::{folder::FolderId, mailbox::MailboxFolder};

/// The folder hierarchy synchronization hunk.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FolderSyncHunk {
    /// The given mailbox folder is new to the device: a mapping needs
    /// to be created and announced as added.
    Create(MailboxFolder),

    /// The mapping matching the given device folder identifier needs
    /// to be updated to the given mailbox folder state and announced
    /// as changed.
    Update(FolderId, MailboxFolder),

    /// The mapping matching the given device folder identifier lost
    /// its mailbox counterpart and needs to be removed, cascading to
    /// its content cursor.
    Remove(FolderId),
}

impl fmt::Display for FolderSyncHunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create(folder) => write!(f, "Creating folder mapping for {}", folder.name),
            Self::Update(folder_id, folder) => {
                write!(f, "Updating folder mapping {folder_id} to {}", folder.name)
            }
            Self::Remove(folder_id) => write!(f, "Removing folder mapping {folder_id}"),
        }
    }
}
