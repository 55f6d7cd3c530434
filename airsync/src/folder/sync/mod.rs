//! # Folder hierarchy synchronization
//!
//! This module contains everything needed to synchronize the folder
//! hierarchy of a device with the mailbox snapshot.
//!
//! The device folder table is the cache: the patch compares the
//! snapshot supplied by the mailbox storage collaborator against the
//! device's existing mappings.

pub mod hunk;
pub mod report;

use std::collections::HashMap;

use crate::{folder::DeviceFolder, mailbox::MailboxFolder};

#[doc(inline)]
pub use self::{hunk::FolderSyncHunk, report::FolderSyncReport};

use super::FolderId;

/// A folder hierarchy synchronization patch is just a list of folder
/// synchronization hunks (changes).
pub type FolderSyncPatch = Vec<FolderSyncHunk>;

/// Folder hierarchy synchronization patch builder.
///
/// Contains the core algorithm of the folder hierarchy
/// synchronization. It has been exported in a dedicated function so
/// that it can be easily tested. `mappings` is keyed by the mailbox
/// folder each device mapping mirrors.
pub fn build(
    snapshot: &[MailboxFolder],
    mappings: &HashMap<FolderId, DeviceFolder>,
) -> FolderSyncPatch {
    let mut patch = FolderSyncPatch::default();

    for folder in snapshot {
        match mappings.get(&folder.id) {
            None => patch.push(FolderSyncHunk::Create(folder.clone())),
            Some(mapping) => {
                let renamed = mapping.name != folder.name;
                let moved = mapping.mailbox_parent_id != folder.parent_id;
                if renamed || moved {
                    patch.push(FolderSyncHunk::Update(
                        mapping.folder_id.clone(),
                        folder.clone(),
                    ));
                }
            }
        }
    }

    let mut removed: Vec<&DeviceFolder> = mappings
        .values()
        .filter(|mapping| {
            !snapshot
                .iter()
                .any(|folder| folder.id == mapping.mailbox_folder_id)
        })
        .collect();
    removed.sort_by(|a, b| a.folder_id.cmp(&b.folder_id));
    patch.extend(
        removed
            .into_iter()
            .map(|mapping| FolderSyncHunk::Remove(mapping.folder_id.clone())),
    );

    patch
}
