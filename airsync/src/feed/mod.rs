//! # Change feed
//!
//! Module dedicated to the folder change feed: a per-folder
//! append-only log of item deltas, fed by the mailbox storage
//! collaborator and consumed by content sync to compute diffs between
//! two cursors.
//!
//! Appends are broadcast so ping waiters can suspend on the feed
//! instead of polling it.

use std::{collections::HashMap, fmt};

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};
use tracing::trace;

use crate::{cursor::Cursor, device::DeviceId, folder::FolderId, item::ItemId};

/// Default capacity of the feed broadcast channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// The kind of change recorded in the feed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ChangeKind {
    Added,
    Changed,
    Deleted,
}

impl ChangeKind {
    /// Return the change kind as string slice.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Changed => "changed",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where a change came from.
///
/// Changes written back on behalf of a device are tagged with it so
/// that device never receives its own change echoed back.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum ChangeOrigin {
    /// The change happened server-side (delivery, another client…).
    Server,

    /// The change was written back on behalf of the given device.
    Device(DeviceId),
}

/// One delta of the feed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ItemChange {
    /// The position of the delta in its folder log. Sequence values
    /// are the cursor space of content sync.
    pub seq: Cursor,

    pub kind: ChangeKind,
    pub item_id: ItemId,
    pub origin: ChangeOrigin,
    pub occurred_at: DateTime<Utc>,
}

impl fmt::Display for ItemChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} item {} at {}", self.kind, self.item_id, self.seq)
    }
}

/// The event published on every append.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FeedEvent {
    pub folder_id: FolderId,
    pub seq: Cursor,
}

/// A bounded read of a folder log.
#[derive(Clone, Debug, Default)]
pub struct FeedWindow {
    /// The deltas in `(from, head]`, oldest first.
    pub changes: Vec<ItemChange>,

    /// The cursor the reader may advance to after consuming the
    /// window.
    pub head: Cursor,

    /// Whether more deltas remain past `head`. The client should
    /// re-issue immediately rather than wait for the next heartbeat.
    pub more: bool,
}

/// The folder change feed.
///
/// Append-only; may be read concurrently by many devices' content
/// sync and ping operations without coordination. Deltas within one
/// folder are observed by every device in append order; there is no
/// global ordering across folders.
#[derive(Debug)]
pub struct ChangeFeed {
    logs: RwLock<HashMap<FolderId, Vec<ItemChange>>>,
    events: broadcast::Sender<FeedEvent>,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl ChangeFeed {
    pub fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            logs: RwLock::new(HashMap::default()),
            events,
        }
    }

    /// Append a delta to a folder log and publish the matching event.
    pub async fn append(
        &self,
        folder_id: &str,
        kind: ChangeKind,
        item_id: impl Into<ItemId>,
        origin: ChangeOrigin,
    ) -> Cursor {
        let mut logs = self.logs.write().await;
        let log = logs.entry(folder_id.to_owned()).or_default();
        let seq = log
            .last()
            .map(|change| change.seq.next())
            .unwrap_or_else(|| Cursor::INITIAL.next());

        let change = ItemChange {
            seq,
            kind,
            item_id: item_id.into(),
            origin,
            occurred_at: Utc::now(),
        };
        trace!(folder = folder_id, %change, "appending feed delta");
        log.push(change);

        // nobody listening is fine
        let _ = self.events.send(FeedEvent {
            folder_id: folder_id.to_owned(),
            seq,
        });

        seq
    }

    /// Return the sequence of the last delta of a folder log.
    pub async fn head(&self, folder_id: &str) -> Cursor {
        self.logs
            .read()
            .await
            .get(folder_id)
            .and_then(|log| log.last())
            .map(|change| change.seq)
            .unwrap_or(Cursor::INITIAL)
    }

    /// Read the deltas in `(from, head]`, capped at `max`, skipping
    /// deltas originated by `exclude_device`.
    ///
    /// Trailing skipped deltas still advance the window head so the
    /// reader's cursor does not lag behind its own write-backs.
    pub async fn read_since(
        &self,
        folder_id: &str,
        from: Cursor,
        max: usize,
        exclude_device: Option<&str>,
    ) -> FeedWindow {
        let logs = self.logs.read().await;
        let log = match logs.get(folder_id) {
            Some(log) => log,
            None => {
                return FeedWindow {
                    head: from,
                    ..FeedWindow::default()
                }
            }
        };

        let mut window = FeedWindow {
            head: from,
            ..FeedWindow::default()
        };

        for change in log.iter().filter(|change| change.seq > from) {
            let own = match (&change.origin, exclude_device) {
                (ChangeOrigin::Device(device), Some(excluded)) => device == excluded,
                _ => false,
            };

            if own {
                window.head = change.seq;
                continue;
            }
            if window.changes.len() >= max {
                window.more = true;
                break;
            }
            window.head = change.seq;
            window.changes.push(change.clone());
        }

        window
    }

    /// Count the deltas pending past the given cursor, skipping
    /// deltas originated by `exclude_device`.
    pub async fn pending_count(
        &self,
        folder_id: &str,
        from: Cursor,
        exclude_device: Option<&str>,
    ) -> usize {
        let logs = self.logs.read().await;
        logs.get(folder_id)
            .map(|log| {
                log.iter()
                    .filter(|change| change.seq > from)
                    .filter(|change| match (&change.origin, exclude_device) {
                        (ChangeOrigin::Device(device), Some(excluded)) => device != excluded,
                        _ => true,
                    })
                    .count()
            })
            .unwrap_or_default()
    }

    /// Return `true` if deltas are pending past the given cursor.
    pub async fn has_changes_since(
        &self,
        folder_id: &str,
        from: Cursor,
        exclude_device: Option<&str>,
    ) -> bool {
        self.pending_count(folder_id, from, exclude_device).await > 0
    }

    /// Subscribe to append events.
    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.events.subscribe()
    }
}
