//! # Item module
//!
//! Module dedicated to sync items, the unit of content sync. An item
//! is whatever the mailbox folder contains (a message, a contact, a
//! task); the engine only cares about its identifier, its body bytes
//! and its timestamps.

pub mod sync;

use chrono::{DateTime, Utc};

use crate::folder::FolderId;

/// Alias for the item identifier.
pub type ItemId = String;

/// The sync item structure.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SyncItem {
    pub id: ItemId,
    pub folder_id: FolderId,
    pub subject: String,
    pub body: Vec<u8>,

    /// When the item entered the folder, checked against the folder
    /// filter window.
    pub received_at: DateTime<Utc>,

    /// The size of the full body, before any truncation.
    pub size: u64,

    /// Whether the body carried here was truncated.
    pub truncated: bool,
}

impl SyncItem {
    pub fn new(
        id: impl Into<ItemId>,
        folder_id: impl Into<FolderId>,
        subject: impl Into<String>,
        body: impl Into<Vec<u8>>,
        received_at: DateTime<Utc>,
    ) -> Self {
        let body = body.into();
        Self {
            id: id.into(),
            folder_id: folder_id.into(),
            subject: subject.into(),
            size: body.len() as u64,
            body,
            received_at,
            truncated: false,
        }
    }

    /// Return a copy of the item with its body truncated to the given
    /// size, flagged accordingly. The recorded full size is kept so
    /// clients can fetch the rest later.
    pub fn truncate(&self, max_body_size: Option<u32>) -> SyncItem {
        match max_body_size {
            Some(max) if (self.body.len() as u64) > max as u64 => {
                let mut item = self.clone();
                item.body.truncate(max as usize);
                item.truncated = true;
                item
            }
            _ => self.clone(),
        }
    }
}
