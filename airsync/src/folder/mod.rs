//! # Folder module
//!
//! Module dedicated to per-device folder management.
//!
//! The main entities are [`FolderKind`], [`FilterWindow`],
//! [`ConflictResolution`] and [`DeviceFolder`], the per-device mirror
//! of a mailbox folder.
//!
//! The [`sync`] module contains everything needed to synchronize the
//! folder hierarchy of a device with the mailbox snapshot.

mod error;
pub mod sync;

use std::{collections::HashMap, fmt, str::FromStr};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use crate::device::DeviceId;

#[doc(inline)]
pub use self::error::{Error, Result};

/// Alias for the server-scoped folder identifier.
pub type FolderId = String;

/// The folder kind enumeration.
///
/// The folder kind is a category that gives a specific purpose to a
/// folder. Kinds beyond the mail set (calendar, contacts, tasks,
/// notes) exist so devices can classify non-mail collections; the
/// engine itself treats them all as item containers.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum FolderKind {
    Inbox,
    Sent,
    Drafts,
    Trash,
    Spam,
    Calendar,
    Contacts,
    Tasks,
    Notes,

    /// The user-defined kind of folder.
    Custom,
}

impl FolderKind {
    /// Return `true` if the current folder kind matches the Inbox
    /// variant.
    pub fn is_inbox(&self) -> bool {
        matches!(self, FolderKind::Inbox)
    }

    /// Return `true` if the current folder kind matches the Trash
    /// variant.
    pub fn is_trash(&self) -> bool {
        matches!(self, FolderKind::Trash)
    }

    /// Return the folder kind as string slice.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbox => "inbox",
            Self::Sent => "sent",
            Self::Drafts => "drafts",
            Self::Trash => "trash",
            Self::Spam => "spam",
            Self::Calendar => "calendar",
            Self::Contacts => "contacts",
            Self::Tasks => "tasks",
            Self::Notes => "notes",
            Self::Custom => "custom",
        }
    }
}

impl FromStr for FolderKind {
    type Err = Error;

    fn from_str(kind: &str) -> Result<Self> {
        match kind {
            kind if kind.eq_ignore_ascii_case("inbox") => Ok(Self::Inbox),
            kind if kind.eq_ignore_ascii_case("sent") => Ok(Self::Sent),
            kind if kind.eq_ignore_ascii_case("drafts") => Ok(Self::Drafts),
            kind if kind.eq_ignore_ascii_case("trash") => Ok(Self::Trash),
            kind if kind.eq_ignore_ascii_case("spam") => Ok(Self::Spam),
            kind if kind.eq_ignore_ascii_case("calendar") => Ok(Self::Calendar),
            kind if kind.eq_ignore_ascii_case("contacts") => Ok(Self::Contacts),
            kind if kind.eq_ignore_ascii_case("tasks") => Ok(Self::Tasks),
            kind if kind.eq_ignore_ascii_case("notes") => Ok(Self::Notes),
            kind if kind.eq_ignore_ascii_case("custom") => Ok(Self::Custom),
            kind => Err(Error::ParseFolderKindError(kind.to_owned())),
        }
    }
}

impl fmt::Display for FolderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The per-folder time horizon limiting which items are eligible for
/// sync.
///
/// A window bounds visibility, it never deletes anything: items older
/// than the cutoff are simply not shipped to the device.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum FilterWindow {
    /// No horizon, every item is eligible.
    #[default]
    All,
    OneDay,
    ThreeDays,
    OneWeek,
    TwoWeeks,
    OneMonth,
    ThreeMonths,
    SixMonths,
}

impl FilterWindow {
    /// Return the horizon in days, `None` meaning unbounded.
    pub fn days(&self) -> Option<i64> {
        match self {
            Self::All => None,
            Self::OneDay => Some(1),
            Self::ThreeDays => Some(3),
            Self::OneWeek => Some(7),
            Self::TwoWeeks => Some(14),
            Self::OneMonth => Some(30),
            Self::ThreeMonths => Some(90),
            Self::SixMonths => Some(180),
        }
    }

    /// Return the cutoff timestamp relative to `now`, `None` meaning
    /// unbounded.
    pub fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.days().map(|days| now - Duration::days(days))
    }

    /// Return `true` if an item received at the given time falls
    /// inside the window relative to `now`.
    pub fn contains(&self, received_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self.cutoff(now) {
            None => true,
            Some(cutoff) => received_at >= cutoff,
        }
    }
}

/// The rule for reconciling simultaneous server- and client-side
/// changes to the same item.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum ConflictResolution {
    /// The client change is discarded, the device receives the server
    /// version.
    #[default]
    ServerWins,

    /// The client change overwrites the server version, the server
    /// delta is suppressed from the response.
    ClientWins,

    /// The client change is applied as a new item alongside the
    /// server version; both survive.
    Duplicate,
}

impl ConflictResolution {
    /// Return the conflict resolution as string slice.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServerWins => "server-wins",
            Self::ClientWins => "client-wins",
            Self::Duplicate => "duplicate",
        }
    }
}

impl fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ConflictResolution {
    type Err = Error;

    fn from_str(policy: &str) -> Result<Self> {
        match policy {
            policy if policy.eq_ignore_ascii_case("server-wins") => Ok(Self::ServerWins),
            policy if policy.eq_ignore_ascii_case("client-wins") => Ok(Self::ClientWins),
            policy if policy.eq_ignore_ascii_case("duplicate") => Ok(Self::Duplicate),
            policy => Err(Error::ParseConflictResolutionError(policy.to_owned())),
        }
    }
}

/// The per-device folder structure.
///
/// A device folder mirrors one mailbox folder for one device: it
/// carries the device-facing identifier, the sync settings and the
/// progress counters. The reference to the mailbox folder is a weak
/// back-reference, never ownership, since the mailbox lifecycle is
/// independent.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceFolder {
    /// The server-scoped, device-facing folder identifier.
    pub folder_id: FolderId,

    /// The device-facing identifier of the parent folder mapping, if
    /// any.
    pub parent_id: Option<FolderId>,

    /// The mailbox folder this mapping mirrors.
    pub mailbox_folder_id: FolderId,

    /// The mailbox identifier of the parent folder, used to detect
    /// moves.
    pub mailbox_parent_id: Option<FolderId>,

    pub name: String,
    pub kind: FolderKind,

    pub sync_enabled: bool,
    pub filter_window: FilterWindow,

    /// Max body bytes returned per item, `None` meaning whole bodies.
    pub truncation_size: Option<u32>,

    pub conflict_resolution: ConflictResolution,

    pub total_items: u32,
    pub synced_items: u32,

    /// Set when the change feed moved past the device cursor, cleared
    /// on a successful drain.
    pub has_pending_changes: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeviceFolder {
    pub fn new(
        folder_id: impl Into<FolderId>,
        mailbox_folder_id: impl Into<FolderId>,
        name: impl Into<String>,
        kind: FolderKind,
    ) -> Self {
        let now = Utc::now();
        Self {
            folder_id: folder_id.into(),
            parent_id: None,
            mailbox_folder_id: mailbox_folder_id.into(),
            mailbox_parent_id: None,
            name: name.into(),
            kind,
            sync_enabled: true,
            filter_window: FilterWindow::default(),
            truncation_size: None,
            conflict_resolution: ConflictResolution::default(),
            total_items: 0,
            synced_items: 0,
            has_pending_changes: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Update the progress counters, keeping `synced_items` within
    /// `total_items`.
    pub fn update_progress(&mut self, total_items: u32, synced_items: u32) {
        self.total_items = total_items;
        self.synced_items = synced_items.min(total_items);
        self.updated_at = Utc::now();
    }
}

impl fmt::Display for DeviceFolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.kind)
    }
}

/// The per-device folder table.
///
/// Devices own their folder mappings: removing a device cascades to
/// all of them.
#[derive(Debug, Default)]
pub struct FolderTable {
    folders: RwLock<HashMap<DeviceId, HashMap<FolderId, DeviceFolder>>>,
}

impl FolderTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a folder mapping for a device.
    pub async fn insert(&self, device_id: &str, folder: DeviceFolder) {
        self.folders
            .write()
            .await
            .entry(device_id.to_owned())
            .or_default()
            .insert(folder.folder_id.clone(), folder);
    }

    /// Find a folder mapping by its device-facing identifier.
    pub async fn find(&self, device_id: &str, folder_id: &str) -> Option<DeviceFolder> {
        self.folders
            .read()
            .await
            .get(device_id)
            .and_then(|folders| folders.get(folder_id))
            .cloned()
    }

    /// Get a folder mapping by its device-facing identifier.
    pub async fn get(&self, device_id: &str, folder_id: &str) -> Result<DeviceFolder> {
        self.find(device_id, folder_id)
            .await
            .ok_or_else(|| Error::FolderNotFoundError(folder_id.to_owned()))
    }

    /// List the folder mappings of a device.
    pub async fn list(&self, device_id: &str) -> Vec<DeviceFolder> {
        let folders = self.folders.read().await;
        let mut folders: Vec<_> = folders
            .get(device_id)
            .map(|folders| folders.values().cloned().collect())
            .unwrap_or_default();
        folders.sort_by(|a: &DeviceFolder, b: &DeviceFolder| a.folder_id.cmp(&b.folder_id));
        folders
    }

    /// Index the folder mappings of a device by the mailbox folder
    /// they mirror.
    pub async fn by_mailbox_folder(&self, device_id: &str) -> HashMap<FolderId, DeviceFolder> {
        self.folders
            .read()
            .await
            .get(device_id)
            .map(|folders| {
                folders
                    .values()
                    .map(|folder| (folder.mailbox_folder_id.clone(), folder.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Apply a mutation to a folder mapping and return the updated
    /// copy.
    pub async fn update<F>(&self, device_id: &str, folder_id: &str, f: F) -> Result<DeviceFolder>
    where
        F: FnOnce(&mut DeviceFolder),
    {
        let mut folders = self.folders.write().await;
        let folder = folders
            .get_mut(device_id)
            .and_then(|folders| folders.get_mut(folder_id))
            .ok_or_else(|| Error::FolderNotFoundError(folder_id.to_owned()))?;
        f(folder);
        Ok(folder.clone())
    }

    /// Remove a folder mapping.
    pub async fn remove(&self, device_id: &str, folder_id: &str) -> Option<DeviceFolder> {
        self.folders
            .write()
            .await
            .get_mut(device_id)
            .and_then(|folders| folders.remove(folder_id))
    }

    /// Remove every folder mapping of a device (cascade on device
    /// deletion).
    pub async fn remove_device(&self, device_id: &str) -> Vec<DeviceFolder> {
        self.folders
            .write()
            .await
            .remove(device_id)
            .map(|folders| folders.into_values().collect())
            .unwrap_or_default()
    }
}
