//! # Mailbox storage
//!
//! Module dedicated to the mailbox storage collaborator seam.
//!
//! The engine never owns mailbox data: it reads folder snapshots and
//! item bodies, and only writes back when a client-wins or duplicate
//! resolution says so. Everything crosses this trait.

pub mod memory;

use async_trait::async_trait;

use crate::{
    folder::{FolderId, FolderKind},
    item::{
        sync::{AppliedChange, ClientChange},
        ItemId, SyncItem,
    },
    AnyResult,
};

#[doc(inline)]
pub use self::memory::InMemoryMailbox;

/// One folder of the mailbox snapshot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MailboxFolder {
    pub id: FolderId,
    pub parent_id: Option<FolderId>,
    pub name: String,
    pub kind: FolderKind,
}

/// A bounded mailbox search.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SearchQuery {
    /// Restrict the search to one folder, otherwise search the whole
    /// account.
    pub folder_id: Option<FolderId>,

    /// Substring matched against subjects and bodies.
    pub text: String,

    pub max_results: usize,
}

/// The mailbox storage collaborator.
///
/// The engine trusts an already-authenticated account; implementors
/// receive account and folder identifiers that were resolved upstream.
/// Mutations made on behalf of a device carry its identifier so the
/// change feed can tag the origin and avoid echoing the change back.
#[async_trait]
pub trait MailboxStorage: Send + Sync {
    /// List the folder snapshot of an account.
    async fn list_folders(&self, account_id: &str) -> AnyResult<Vec<MailboxFolder>>;

    /// Count the items of a folder.
    async fn count_items(&self, folder_id: &str) -> AnyResult<u32>;

    /// Fetch one item of a folder, if it still exists.
    async fn fetch_item(&self, folder_id: &str, item_id: &str) -> AnyResult<Option<SyncItem>>;

    /// Write a client change back to the mailbox. With `as_new`, the
    /// change is applied as a brand new item next to the existing one
    /// (duplicate resolution).
    async fn apply_client_change(
        &self,
        device_id: &str,
        folder_id: &str,
        change: &ClientChange,
        as_new: bool,
    ) -> AnyResult<AppliedChange>;

    /// Move an item between two folders and return its identifier in
    /// the target folder.
    async fn move_item(
        &self,
        device_id: &str,
        from_folder_id: &str,
        to_folder_id: &str,
        item_id: &str,
    ) -> AnyResult<ItemId>;

    /// Search the account.
    async fn search(&self, account_id: &str, query: &SearchQuery) -> AnyResult<Vec<SyncItem>>;

    /// Submit an outbound message for delivery.
    async fn submit(&self, account_id: &str, message: &[u8]) -> AnyResult<()>;
}
