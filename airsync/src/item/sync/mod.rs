//! # Content synchronization
//!
//! This module contains everything content sync needs besides the
//! engine itself: the client change types, the window collapsing
//! helper and the reconciliation patch.
//!
//! The step sequence (validate cursor, read window, reconcile,
//! truncate and filter, commit) lives in
//! [`SyncEngine::sync`](crate::engine::SyncEngine::sync).

pub mod hunk;
pub mod patch;
pub mod report;

use std::collections::HashMap;

use crate::{
    feed::{ChangeKind, ItemChange},
    item::ItemId,
};

#[doc(inline)]
pub use self::{hunk::ItemSyncHunk, patch::ItemSyncPatch, report::ItemSyncReport};

/// The payload of a client-submitted add or change.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClientPayload {
    pub subject: String,
    pub body: Vec<u8>,
}

impl ClientPayload {
    /// Return the payload size in bytes.
    pub fn size(&self) -> u64 {
        self.body.len() as u64
    }
}

/// A change submitted by the device during a two-way content sync.
///
/// For adds, `item_id` is the client-side temporary identifier; the
/// response maps it to the server identifier minted by the mailbox.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClientChange {
    pub kind: ChangeKind,
    pub item_id: ItemId,

    /// The item content, absent for deletions.
    pub payload: Option<ClientPayload>,
}

/// The mapping from a client change to the mailbox item it produced.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AppliedChange {
    /// The identifier the client submitted.
    pub client_id: ItemId,

    /// The identifier the mailbox assigned (differs from `client_id`
    /// for adds and duplicates).
    pub server_id: ItemId,

    pub kind: ChangeKind,
}

/// Collapse a feed window to one net delta per item.
///
/// A device that replays a window only cares about the net effect:
/// an item added then deleted inside the window never existed for
/// it, an item deleted then re-added reads as changed. The output
/// keeps the feed order of each item's last contributing delta.
pub fn collapse(changes: Vec<ItemChange>) -> Vec<ItemChange> {
    let mut net: HashMap<ItemId, ItemChange> = HashMap::new();

    for change in changes {
        match net.remove(&change.item_id) {
            None => {
                net.insert(change.item_id.clone(), change);
            }
            Some(previous) => {
                let kind = match (previous.kind, change.kind) {
                    // never existed for this window
                    (ChangeKind::Added, ChangeKind::Deleted) => continue,
                    (ChangeKind::Added, _) => ChangeKind::Added,
                    (_, ChangeKind::Deleted) => ChangeKind::Deleted,
                    (ChangeKind::Deleted, _) => ChangeKind::Changed,
                    (ChangeKind::Changed, _) => ChangeKind::Changed,
                };
                net.insert(change.item_id.clone(), ItemChange { kind, ..change });
            }
        }
    }

    let mut collapsed: Vec<ItemChange> = net.into_values().collect();
    collapsed.sort_by_key(|change| change.seq);
    collapsed
}
