//! # Audit module
//!
//! Module dedicated to the protocol audit trail: one append-only
//! entry per protocol exchange, written in the same commit section as
//! the cursor advance so the trail and the cursor store can never
//! diverge.
//!
//! The trail serves device troubleshooting (replay what cursor and
//! response a device received) and abuse detection (sync volume per
//! device and address).

use std::{
    collections::HashMap,
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::{cursor::Cursor, device::DeviceId, folder::FolderId, provision::PolicyKey};

/// The protocol command set.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum SyncCommand {
    FolderSync,
    Sync,
    Ping,
    Provision,
    Settings,
    ItemEstimate,
    MoveItems,
    Search,
    SendMail,
    SmartReply,
    SmartForward,
    MeetingResponse,
    ResolveRecipients,
    ValidateCert,
}

impl SyncCommand {
    /// Return the command as string slice.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FolderSync => "FolderSync",
            Self::Sync => "Sync",
            Self::Ping => "Ping",
            Self::Provision => "Provision",
            Self::Settings => "Settings",
            Self::ItemEstimate => "ItemEstimate",
            Self::MoveItems => "MoveItems",
            Self::Search => "Search",
            Self::SendMail => "SendMail",
            Self::SmartReply => "SmartReply",
            Self::SmartForward => "SmartForward",
            Self::MeetingResponse => "MeetingResponse",
            Self::ResolveRecipients => "ResolveRecipients",
            Self::ValidateCert => "ValidateCert",
        }
    }
}

impl fmt::Display for SyncCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The outcome class of a protocol exchange.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum SyncStatus {
    #[default]
    Success,
    PartialSuccess,
    Failed,
    ProtocolError,
    AuthenticationError,
    PolicyError,
    FolderError,
    SyncError,
    ServerError,
    ClientError,
}

impl SyncStatus {
    /// Return the status as string slice.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::PartialSuccess => "partial-success",
            Self::Failed => "failed",
            Self::ProtocolError => "protocol-error",
            Self::AuthenticationError => "authentication-error",
            Self::PolicyError => "policy-error",
            Self::FolderError => "folder-error",
            Self::SyncError => "sync-error",
            Self::ServerError => "server-error",
            Self::ClientError => "client-error",
        }
    }

    /// Return `true` for the outcomes that count as a successful
    /// exchange.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success | Self::PartialSuccess)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One entry of the audit trail.
///
/// Created once per protocol exchange, never mutated after append.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SyncLogEntry {
    /// The append position of the entry, assigned by the log.
    pub id: u64,

    pub device_id: DeviceId,
    pub folder_id: Option<FolderId>,
    pub command: SyncCommand,

    /// The cursor the client presented.
    pub cursor_in: Option<Cursor>,

    /// The cursor the client was handed back.
    pub cursor_out: Option<Cursor>,

    pub items_added: u32,
    pub items_changed: u32,
    pub items_deleted: u32,
    pub items_fetched: u32,

    pub bytes_sent: u64,
    pub bytes_received: u64,

    pub status: SyncStatus,
    pub error_code: Option<String>,
    pub error_message: Option<String>,

    pub processing_time_ms: u64,

    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub session_id: Option<String>,

    pub heartbeat_interval_secs: Option<u32>,
    pub policy_key: Option<PolicyKey>,
    pub wipe_requested: bool,

    pub created_at: DateTime<Utc>,
}

impl SyncLogEntry {
    /// Create a blank entry for a device exchange; counters and
    /// outcome are filled by the engine before append.
    pub fn new(device_id: impl Into<DeviceId>, command: SyncCommand) -> Self {
        Self {
            id: 0,
            device_id: device_id.into(),
            folder_id: None,
            command,
            cursor_in: None,
            cursor_out: None,
            items_added: 0,
            items_changed: 0,
            items_deleted: 0,
            items_fetched: 0,
            bytes_sent: 0,
            bytes_received: 0,
            status: SyncStatus::Success,
            error_code: None,
            error_message: None,
            processing_time_ms: 0,
            client_ip: None,
            user_agent: None,
            session_id: None,
            heartbeat_interval_secs: None,
            policy_key: None,
            wipe_requested: false,
            created_at: Utc::now(),
        }
    }

    /// Return the item total of the exchange.
    pub fn total_items(&self) -> u32 {
        self.items_added + self.items_changed + self.items_deleted + self.items_fetched
    }
}

/// The sync volume aggregation of one device over a time window.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeviceSyncStatistics {
    pub device_id: DeviceId,
    pub total_exchanges: u64,
    pub successful_exchanges: u64,
    pub failed_exchanges: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub total_items: u64,
    pub average_processing_time_ms: f64,
}

/// The append-only audit log.
#[derive(Debug, Default)]
pub struct AuditLog {
    entries: RwLock<Vec<SyncLogEntry>>,
    next_id: AtomicU64,
}

impl AuditLog {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Append an entry and return it with its assigned position.
    pub async fn append(&self, mut entry: SyncLogEntry) -> SyncLogEntry {
        entry.id = self.next_id.fetch_add(1, Ordering::Relaxed);
        entry.created_at = Utc::now();
        self.entries.write().await.push(entry.clone());
        entry
    }

    /// Return every entry of a device, oldest first.
    pub async fn for_device(&self, device_id: &str) -> Vec<SyncLogEntry> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|entry| entry.device_id == device_id)
            .cloned()
            .collect()
    }

    /// Return the last entry of a device for the given folder.
    pub async fn last_for_folder(
        &self,
        device_id: &str,
        folder_id: &str,
    ) -> Option<SyncLogEntry> {
        self.entries
            .read()
            .await
            .iter()
            .rev()
            .find(|entry| {
                entry.device_id == device_id && entry.folder_id.as_deref() == Some(folder_id)
            })
            .cloned()
    }

    /// Aggregate the sync volume of a device over a time window.
    pub async fn device_statistics(
        &self,
        device_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> DeviceSyncStatistics {
        let entries = self.entries.read().await;
        let mut stats = DeviceSyncStatistics {
            device_id: device_id.to_owned(),
            ..DeviceSyncStatistics::default()
        };
        let mut processing_total = 0u64;

        for entry in entries
            .iter()
            .filter(|entry| entry.device_id == device_id)
            .filter(|entry| entry.created_at >= from && entry.created_at <= to)
        {
            stats.total_exchanges += 1;
            if entry.status.is_success() {
                stats.successful_exchanges += 1;
            } else {
                stats.failed_exchanges += 1;
            }
            stats.bytes_sent += entry.bytes_sent;
            stats.bytes_received += entry.bytes_received;
            stats.total_items += entry.total_items() as u64;
            processing_total += entry.processing_time_ms;
        }

        if stats.total_exchanges > 0 {
            stats.average_processing_time_ms =
                processing_total as f64 / stats.total_exchanges as f64;
        }
        stats
    }

    /// Aggregate the sync volume per client address, for abuse
    /// detection.
    pub async fn volume_per_address(&self) -> HashMap<String, u64> {
        let entries = self.entries.read().await;
        let mut volumes: HashMap<String, u64> = HashMap::new();
        for entry in entries.iter() {
            if let Some(ip) = &entry.client_ip {
                *volumes.entry(ip.clone()).or_default() +=
                    entry.bytes_sent + entry.bytes_received;
            }
        }
        volumes
    }

    /// Return the number of recorded exchanges.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Return `true` when nothing was recorded yet.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn entry(device_id: &str, status: SyncStatus) -> SyncLogEntry {
        SyncLogEntry {
            status,
            bytes_sent: 10,
            bytes_received: 5,
            items_fetched: 2,
            processing_time_ms: 40,
            client_ip: Some("10.0.0.1".into()),
            ..SyncLogEntry::new(device_id, SyncCommand::Sync)
        }
    }

    #[tokio::test]
    async fn appends_assign_increasing_positions() {
        let log = AuditLog::new();

        let first = log.append(entry("dev1", SyncStatus::Success)).await;
        let second = log.append(entry("dev1", SyncStatus::Failed)).await;

        assert!(second.id > first.id);
        assert_eq!(log.len().await, 2);
    }

    #[tokio::test]
    async fn statistics_aggregate_per_device_and_window() {
        let log = AuditLog::new();
        log.append(entry("dev1", SyncStatus::Success)).await;
        log.append(entry("dev1", SyncStatus::Failed)).await;
        log.append(entry("dev2", SyncStatus::Success)).await;

        let now = Utc::now();
        let stats = log
            .device_statistics("dev1", now - Duration::hours(1), now + Duration::hours(1))
            .await;

        assert_eq!(stats.total_exchanges, 2);
        assert_eq!(stats.successful_exchanges, 1);
        assert_eq!(stats.failed_exchanges, 1);
        assert_eq!(stats.bytes_sent, 20);
        assert_eq!(stats.total_items, 4);
        assert_eq!(stats.average_processing_time_ms, 40.0);

        let outside = log
            .device_statistics("dev1", now + Duration::hours(1), now + Duration::hours(2))
            .await;
        assert_eq!(outside.total_exchanges, 0);
    }

    #[tokio::test]
    async fn volume_is_tracked_per_address() {
        let log = AuditLog::new();
        log.append(entry("dev1", SyncStatus::Success)).await;
        log.append(entry("dev2", SyncStatus::Success)).await;

        let volumes = log.volume_per_address().await;
        assert_eq!(volumes.get("10.0.0.1"), Some(&30));
    }
}
