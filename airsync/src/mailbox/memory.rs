//! Module dedicated to the in-memory mailbox storage.
//!
//! Backs the engine when no real store is wired in, and every
//! scenario test. Mutations append to the shared change feed the same
//! way a production mailbox collaborator is expected to.

use std::{
    any::Any,
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::{
    device::AccountId,
    feed::{ChangeFeed, ChangeKind, ChangeOrigin},
    folder::{FolderId, FolderKind},
    item::{
        sync::{AppliedChange, ClientChange},
        ItemId, SyncItem,
    },
    AnyBoxedError, AnyError, AnyResult,
};

use super::{MailboxFolder, MailboxStorage, SearchQuery};

/// The global `Error` enum of the module.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot find mailbox folder {0}")]
    FolderNotFoundError(String),
    #[error("cannot find mailbox item {1} in folder {0}")]
    ItemNotFoundError(String, String),
    #[error("cannot apply client change to {0}: payload is missing")]
    MissingPayloadError(String),
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

#[derive(Debug, Default)]
struct State {
    folders: HashMap<AccountId, Vec<MailboxFolder>>,
    items: HashMap<FolderId, BTreeMap<ItemId, SyncItem>>,
    outbox: Vec<Vec<u8>>,
}

/// The in-memory mailbox storage.
#[derive(Debug)]
pub struct InMemoryMailbox {
    state: RwLock<State>,
    feed: Arc<ChangeFeed>,
    next_id: AtomicU64,
}

impl InMemoryMailbox {
    pub fn new(feed: Arc<ChangeFeed>) -> Self {
        Self {
            state: RwLock::new(State::default()),
            feed,
            next_id: AtomicU64::new(1),
        }
    }

    fn mint_id(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a folder for an account and return its identifier.
    pub async fn create_folder(
        &self,
        account_id: &str,
        name: &str,
        kind: FolderKind,
        parent_id: Option<FolderId>,
    ) -> FolderId {
        let id = self.mint_id("mb");
        let mut state = self.state.write().await;
        state
            .folders
            .entry(account_id.to_owned())
            .or_default()
            .push(MailboxFolder {
                id: id.clone(),
                parent_id,
                name: name.to_owned(),
                kind,
            });
        state.items.entry(id.clone()).or_default();
        id
    }

    /// Rename a folder.
    pub async fn rename_folder(&self, folder_id: &str, name: &str) {
        let mut state = self.state.write().await;
        for folders in state.folders.values_mut() {
            for folder in folders.iter_mut() {
                if folder.id == folder_id {
                    folder.name = name.to_owned();
                }
            }
        }
    }

    /// Delete a folder and its items.
    pub async fn delete_folder(&self, folder_id: &str) {
        let mut state = self.state.write().await;
        for folders in state.folders.values_mut() {
            folders.retain(|folder| folder.id != folder_id);
        }
        state.items.remove(folder_id);
    }

    /// Deliver an item into a folder, as the ingestion pipeline
    /// would.
    pub async fn deliver(&self, folder_id: &str, subject: &str, body: &[u8]) -> ItemId {
        self.deliver_at(folder_id, subject, body, Utc::now()).await
    }

    /// Deliver an item with an explicit reception time.
    pub async fn deliver_at(
        &self,
        folder_id: &str,
        subject: &str,
        body: &[u8],
        received_at: chrono::DateTime<Utc>,
    ) -> ItemId {
        let id = self.mint_id("i");
        let item = SyncItem::new(id.clone(), folder_id, subject, body.to_vec(), received_at);
        self.state
            .write()
            .await
            .items
            .entry(folder_id.to_owned())
            .or_default()
            .insert(id.clone(), item);
        self.feed
            .append(folder_id, ChangeKind::Added, id.clone(), ChangeOrigin::Server)
            .await;
        id
    }

    /// Update an item server-side (another client, a flag change…).
    pub async fn update_item(&self, folder_id: &str, item_id: &str, subject: &str, body: &[u8]) {
        {
            let mut state = self.state.write().await;
            if let Some(item) = state
                .items
                .get_mut(folder_id)
                .and_then(|items| items.get_mut(item_id))
            {
                item.subject = subject.to_owned();
                item.body = body.to_vec();
                item.size = body.len() as u64;
            }
        }
        self.feed
            .append(
                folder_id,
                ChangeKind::Changed,
                item_id.to_owned(),
                ChangeOrigin::Server,
            )
            .await;
    }

    /// Remove an item server-side.
    pub async fn remove_item(&self, folder_id: &str, item_id: &str) {
        self.state
            .write()
            .await
            .items
            .get_mut(folder_id)
            .and_then(|items| items.remove(item_id));
        self.feed
            .append(
                folder_id,
                ChangeKind::Deleted,
                item_id.to_owned(),
                ChangeOrigin::Server,
            )
            .await;
    }

    /// Return the submitted outbound messages.
    pub async fn outbox(&self) -> Vec<Vec<u8>> {
        self.state.read().await.outbox.clone()
    }

    /// Return all item identifiers of a folder.
    pub async fn item_ids(&self, folder_id: &str) -> Vec<ItemId> {
        self.state
            .read()
            .await
            .items
            .get(folder_id)
            .map(|items| items.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MailboxStorage for InMemoryMailbox {
    async fn list_folders(&self, account_id: &str) -> AnyResult<Vec<MailboxFolder>> {
        Ok(self
            .state
            .read()
            .await
            .folders
            .get(account_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn count_items(&self, folder_id: &str) -> AnyResult<u32> {
        Ok(self
            .state
            .read()
            .await
            .items
            .get(folder_id)
            .map(|items| items.len() as u32)
            .unwrap_or_default())
    }

    async fn fetch_item(&self, folder_id: &str, item_id: &str) -> AnyResult<Option<SyncItem>> {
        Ok(self
            .state
            .read()
            .await
            .items
            .get(folder_id)
            .and_then(|items| items.get(item_id))
            .cloned())
    }

    async fn apply_client_change(
        &self,
        device_id: &str,
        folder_id: &str,
        change: &ClientChange,
        as_new: bool,
    ) -> AnyResult<AppliedChange> {
        let origin = ChangeOrigin::Device(device_id.to_owned());

        let (server_id, feed_kind) = match (change.kind, as_new) {
            (ChangeKind::Deleted, _) => {
                self.state
                    .write()
                    .await
                    .items
                    .get_mut(folder_id)
                    .and_then(|items| items.remove(&change.item_id));
                (change.item_id.clone(), ChangeKind::Deleted)
            }
            (ChangeKind::Added, _) | (_, true) => {
                let payload = change
                    .payload
                    .as_ref()
                    .ok_or_else(|| Error::MissingPayloadError(change.item_id.clone()))?;
                let id = self.mint_id("i");
                let item = SyncItem::new(
                    id.clone(),
                    folder_id,
                    payload.subject.clone(),
                    payload.body.clone(),
                    Utc::now(),
                );
                self.state
                    .write()
                    .await
                    .items
                    .entry(folder_id.to_owned())
                    .or_default()
                    .insert(id.clone(), item);
                (id, ChangeKind::Added)
            }
            (ChangeKind::Changed, false) => {
                let payload = change
                    .payload
                    .as_ref()
                    .ok_or_else(|| Error::MissingPayloadError(change.item_id.clone()))?;
                let mut state = self.state.write().await;
                let items = state.items.entry(folder_id.to_owned()).or_default();
                // a change of a vanished item recreates it, the
                // client version is authoritative here
                let item = items.entry(change.item_id.clone()).or_insert_with(|| {
                    SyncItem::new(
                        change.item_id.clone(),
                        folder_id,
                        payload.subject.clone(),
                        payload.body.clone(),
                        Utc::now(),
                    )
                });
                item.subject = payload.subject.clone();
                item.body = payload.body.clone();
                item.size = payload.body.len() as u64;
                (change.item_id.clone(), ChangeKind::Changed)
            }
        };

        self.feed
            .append(folder_id, feed_kind, server_id.clone(), origin)
            .await;

        Ok(AppliedChange {
            client_id: change.item_id.clone(),
            server_id,
            kind: change.kind,
        })
    }

    async fn move_item(
        &self,
        device_id: &str,
        from_folder_id: &str,
        to_folder_id: &str,
        item_id: &str,
    ) -> AnyResult<ItemId> {
        let origin = ChangeOrigin::Device(device_id.to_owned());

        let mut item = {
            let mut state = self.state.write().await;
            let item = state
                .items
                .get_mut(from_folder_id)
                .and_then(|items| items.remove(item_id))
                .ok_or_else(|| {
                    Error::ItemNotFoundError(from_folder_id.to_owned(), item_id.to_owned())
                })?;
            item
        };

        item.folder_id = to_folder_id.to_owned();
        self.state
            .write()
            .await
            .items
            .entry(to_folder_id.to_owned())
            .or_default()
            .insert(item.id.clone(), item.clone());

        self.feed
            .append(
                from_folder_id,
                ChangeKind::Deleted,
                item_id.to_owned(),
                origin.clone(),
            )
            .await;
        self.feed
            .append(to_folder_id, ChangeKind::Added, item.id.clone(), origin)
            .await;

        Ok(item.id)
    }

    async fn search(&self, account_id: &str, query: &SearchQuery) -> AnyResult<Vec<SyncItem>> {
        let state = self.state.read().await;
        let folder_ids: Vec<FolderId> = match &query.folder_id {
            Some(folder_id) => vec![folder_id.clone()],
            None => state
                .folders
                .get(account_id)
                .map(|folders| folders.iter().map(|folder| folder.id.clone()).collect())
                .unwrap_or_default(),
        };

        let needle = query.text.to_lowercase();
        let mut hits = Vec::new();
        for folder_id in folder_ids {
            let Some(items) = state.items.get(&folder_id) else {
                continue;
            };
            for item in items.values() {
                if hits.len() >= query.max_results {
                    return Ok(hits);
                }
                let in_subject = item.subject.to_lowercase().contains(&needle);
                let in_body = String::from_utf8_lossy(&item.body)
                    .to_lowercase()
                    .contains(&needle);
                if in_subject || in_body {
                    hits.push(item.clone());
                }
            }
        }
        Ok(hits)
    }

    async fn submit(&self, _account_id: &str, message: &[u8]) -> AnyResult<()> {
        self.state.write().await.outbox.push(message.to_vec());
        Ok(())
    }
}
