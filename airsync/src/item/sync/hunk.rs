//! Module dedicated to content synchronization hunks.
//!
//! The core structure of the module is the [`ItemSyncHunk`], which
//! represents one reconciled change of a patch.

use std::fmt;

use crate::feed::ItemChange;

use super::ClientChange;

/// The content synchronization hunk.
///
/// A hunk either flows a server delta to the device, writes a client
/// change back to the mailbox, or records the losing side of a
/// conflict so the audit trail can explain what the device saw.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ItemSyncHunk {
    /// The given server delta needs to be forwarded to the device.
    Forward(ItemChange),

    /// The given client change needs to be written back to the
    /// mailbox.
    Apply(ClientChange),

    /// The given client change needs to be written back to the
    /// mailbox as a new item, leaving the server version in place
    /// (duplicate resolution).
    ApplyAsNew(ClientChange),

    /// The given client change lost against the given server delta
    /// and is discarded (server-wins resolution).
    Discard(ClientChange, ItemChange),

    /// The given server delta is suppressed from the response in
    /// favor of the given client change (client-wins resolution).
    Suppress(ItemChange, ClientChange),
}

impl ItemSyncHunk {
    /// Return the identifier of the item the hunk is about.
    pub fn item_id(&self) -> &str {
        match self {
            Self::Forward(change) => change.item_id.as_str(),
            Self::Apply(change) => change.item_id.as_str(),
            Self::ApplyAsNew(change) => change.item_id.as_str(),
            Self::Discard(change, _) => change.item_id.as_str(),
            Self::Suppress(change, _) => change.item_id.as_str(),
        }
    }
}

impl fmt::Display for ItemSyncHunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forward(change) => {
                write!(f, "Forwarding {} {} to device", change.kind, change.item_id)
            }
            Self::Apply(change) => {
                write!(f, "Applying client {} of {}", change.kind, change.item_id)
            }
            Self::ApplyAsNew(change) => {
                write!(f, "Duplicating client {} of {}", change.kind, change.item_id)
            }
            Self::Discard(change, _) => {
                write!(f, "Discarding client {} of {}", change.kind, change.item_id)
            }
            Self::Suppress(change, _) => {
                write!(f, "Suppressing server {} of {}", change.kind, change.item_id)
            }
        }
    }
}
