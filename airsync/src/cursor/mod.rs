//! # Cursor module
//!
//! Module dedicated to sync cursors (sync keys): opaque,
//! monotonically advancing tokens marking a device's sync position in
//! a folder, and the store that advances them with compare-and-swap
//! semantics.
//!
//! Cursor values are minted by the store, one per advance, so a value
//! is never reused and client-presented values classify cleanly:
//! current, replayed, stale or never issued. The feed position a
//! cursor corresponds to is stored next to it, which keeps cursors
//! advancing even for exchanges that only carried client changes.

mod error;

use std::{collections::HashMap, fmt, str::FromStr};

use tokio::sync::RwLock;
use tracing::trace;

use crate::{device::DeviceId, folder::FolderId};

#[doc(inline)]
pub use self::error::{Error, Result};

/// The opaque sync cursor.
///
/// Rendered as a plain token to devices; internally strictly
/// increasing per (device, scope) so staleness and monotonicity stay
/// checkable. Cursor `0` is reserved for the initial sync and is
/// always a valid starting point.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Cursor(u64);

impl Cursor {
    /// The reserved initial cursor.
    pub const INITIAL: Cursor = Cursor(0);

    /// Return `true` if the cursor is the reserved initial one.
    pub fn is_initial(&self) -> bool {
        self.0 == 0
    }

    /// Return the next cursor in the sequence.
    pub fn next(&self) -> Cursor {
        Cursor(self.0 + 1)
    }
}

impl From<u64> for Cursor {
    fn from(cursor: u64) -> Self {
        Self(cursor)
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Cursor {
    type Err = Error;

    fn from_str(cursor: &str) -> Result<Self> {
        cursor
            .parse::<u64>()
            .map(Cursor)
            .map_err(|_| Error::ParseCursorError(cursor.to_owned()))
    }
}

/// The scope a cursor applies to: the folder hierarchy of a device,
/// or the content of one of its folders.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum CursorScope {
    /// The folder-hierarchy cursor of a device.
    Hierarchy,

    /// The content cursor of the given mailbox folder.
    Folder(FolderId),
}

impl fmt::Display for CursorScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hierarchy => write!(f, "hierarchy"),
            Self::Folder(folder) => write!(f, "folder {folder}"),
        }
    }
}

/// The classification of a cursor presented by a client.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CursorCheck {
    /// The cursor matches the stored one: normal diff window.
    Current,

    /// The cursor is the one the stored cursor was advanced from: the
    /// previous exchange is being retried and its recorded response
    /// must be re-served.
    Replay,

    /// A once-valid cursor older than the replay window. The client
    /// must restart from the initial cursor.
    Stale,

    /// A value never issued for this scope. The client must restart
    /// from the initial cursor.
    Unknown,
}

/// The stored cursor state of one (device, scope).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CursorState {
    /// The cursor the device is expected to present.
    pub current: Cursor,

    /// The change feed position the cursor corresponds to.
    pub position: Cursor,
}

#[derive(Clone, Copy, Debug, Default)]
struct CursorEntry {
    current: Cursor,
    advanced_from: Cursor,
    position: Cursor,
}

/// The durable cursor store.
///
/// One entry per (device, scope). [`advance`] is an atomic
/// compare-and-swap: concurrent sessions racing on the same scope
/// observe a conflict instead of silently double-advancing.
///
/// [`advance`]: CursorStore::advance
#[derive(Debug, Default)]
pub struct CursorStore {
    entries: RwLock<HashMap<(DeviceId, CursorScope), CursorEntry>>,
}

impl CursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the stored state for the given scope.
    pub async fn state(&self, device_id: &str, scope: &CursorScope) -> CursorState {
        self.entries
            .read()
            .await
            .get(&(device_id.to_owned(), scope.clone()))
            .map(|entry| CursorState {
                current: entry.current,
                position: entry.position,
            })
            .unwrap_or_default()
    }

    /// Classify a cursor presented by a client against the stored
    /// state.
    ///
    /// The initial cursor is always a valid starting point: when it
    /// is neither the current value nor the replayed one, it reads as
    /// a deliberate restart. Minting is dense, so any other value
    /// below the current cursor was once issued and classifies as
    /// [`CursorCheck::Stale`]; values above it were never issued and
    /// classify as [`CursorCheck::Unknown`].
    pub async fn check(&self, device_id: &str, scope: &CursorScope, from: Cursor) -> CursorCheck {
        let entries = self.entries.read().await;
        match entries.get(&(device_id.to_owned(), scope.clone())) {
            None if from.is_initial() => CursorCheck::Current,
            None => CursorCheck::Unknown,
            Some(entry) if from == entry.current => CursorCheck::Current,
            Some(entry) if from == entry.advanced_from => CursorCheck::Replay,
            Some(_) if from.is_initial() => CursorCheck::Current,
            Some(entry) if from < entry.current => CursorCheck::Stale,
            Some(_) => CursorCheck::Unknown,
        }
    }

    /// Atomically advance the cursor for the given scope, minting the
    /// next value and recording the feed position it corresponds to.
    ///
    /// Fails with a conflict if the stored cursor no longer equals
    /// `from`, meaning a concurrent session already advanced it or
    /// the caller is replaying a superseded request. The initial
    /// cursor is exempt from the compare (and from the position
    /// check): a device restarting from zero re-syncs whatever the
    /// stored state says. Minted values continue the sequence either
    /// way, so a cursor value is never reused.
    pub async fn advance(
        &self,
        device_id: &str,
        scope: &CursorScope,
        from: Cursor,
        position: Cursor,
    ) -> Result<Cursor> {
        let mut entries = self.entries.write().await;
        let key = (device_id.to_owned(), scope.clone());
        let entry = entries.get(&key).copied().unwrap_or_default();

        if !from.is_initial() {
            if entry.current != from {
                return Err(Error::AdvanceConflictError(scope.to_string()));
            }
            if position < entry.position {
                return Err(Error::RegressingPositionError(entry.position, position));
            }
        }

        let next = entry.current.next();
        trace!(device = device_id, %scope, %from, %next, %position, "advancing cursor");
        entries.insert(
            key,
            CursorEntry {
                current: next,
                advanced_from: from,
                position,
            },
        );
        Ok(next)
    }

    /// Drop the cursor of the given scope (folder delete cascade).
    pub async fn invalidate(&self, device_id: &str, scope: &CursorScope) {
        self.entries
            .write()
            .await
            .remove(&(device_id.to_owned(), scope.clone()));
    }

    /// Drop every cursor of a device (device delete cascade).
    pub async fn remove_device(&self, device_id: &str) {
        self.entries
            .write()
            .await
            .retain(|(device, _), _| device != device_id);
    }
}
