//! # Device module
//!
//! Module dedicated to mobile device management.
//!
//! The main entities are [`DeviceStatus`], [`Device`] and
//! [`DeviceInfo`].
//!
//! The [`registry`] module exposes the [`DeviceRegistry`], the
//! authorization gate in front of every protocol command.

mod error;
pub mod registry;

use std::fmt;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;

use crate::{folder::ConflictResolution, provision::PolicyKey};

#[doc(inline)]
pub use self::{
    error::{Error, Result},
    registry::{Authorization, DenyReason, DeviceRegistry},
};

/// Alias for the opaque per-install device identifier.
pub type DeviceId = String;

/// Alias for the mailbox-owning account identifier.
pub type AccountId = String;

/// Default protocol version reported by devices that do not announce
/// one.
pub const DEFAULT_PROTOCOL_VERSION: &str = "14.1";

/// Substring table used to classify devices from their user-agent
/// string.
static USER_AGENT_CLASSES: Lazy<Vec<(&str, &str, &str)>> = Lazy::new(|| {
    vec![
        ("iPhone", "iPhone", "iOS"),
        ("iPad", "iPad", "iOS"),
        ("Android", "Android", "Android"),
        ("Windows", "Windows", "Windows"),
    ]
});

/// The device status enumeration.
///
/// The status drives the authorization gate: only [`Allowed`] devices
/// may sync content. Illegal combinations (a wiped device with sync
/// access, for example) are unrepresentable because every transition
/// goes through the [`Device`] methods.
///
/// [`Allowed`]: DeviceStatus::Allowed
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum DeviceStatus {
    /// The device registered but still waits for administrative
    /// approval.
    Pending,

    /// The device may sync content.
    Allowed,

    /// The device was blocked by an administrator.
    Blocked,

    /// The device was quarantined by an administrator.
    Quarantined,

    /// A remote wipe was requested for the device. Terminal until
    /// administrative re-approval.
    Wiped,

    /// A security policy is outstanding and must be acknowledged
    /// before the device can sync again.
    ProvisionPending,
}

impl DeviceStatus {
    /// Return the device status as string slice.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Allowed => "allowed",
            Self::Blocked => "blocked",
            Self::Quarantined => "quarantined",
            Self::Wiped => "wiped",
            Self::ProvisionPending => "provision-pending",
        }
    }

    /// Return `true` if the current status matches the Allowed
    /// variant.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// Return `true` if the current status matches the Wiped variant.
    pub fn is_wiped(&self) -> bool {
        matches!(self, Self::Wiped)
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The provisioning state of a device.
///
/// Progresses `NoPolicy → Offered → Acknowledged`; publishing a new
/// server policy moves any device back to `Offered`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PolicyState {
    /// No security policy applies to the device.
    NoPolicy,

    /// A policy was offered to the device and waits for
    /// acknowledgment.
    Offered(PolicyKey),

    /// The device acknowledged the given policy key.
    Acknowledged(PolicyKey),
}

impl PolicyState {
    /// Return the policy key currently associated with the device,
    /// offered or acknowledged.
    pub fn key(&self) -> Option<&PolicyKey> {
        match self {
            Self::NoPolicy => None,
            Self::Offered(key) => Some(key),
            Self::Acknowledged(key) => Some(key),
        }
    }

    /// Return `true` if the current state matches the Acknowledged
    /// variant.
    pub fn is_acknowledged(&self) -> bool {
        matches!(self, Self::Acknowledged(_))
    }
}

/// Classification fields collected from the device at registration
/// time.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DeviceInfo {
    pub device_type: Option<String>,
    pub model: Option<String>,
    pub os: Option<String>,
    pub user_agent: Option<String>,
    pub friendly_name: Option<String>,
    pub protocol_version: Option<String>,
}

/// The device structure.
///
/// One record per (account, device install). The device owns its
/// per-folder sync state (see
/// [`FolderTable`](crate::folder::FolderTable)) and is the subject of
/// every audit entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Device {
    /// The account the device belongs to.
    pub account_id: AccountId,

    /// The opaque per-install device identifier.
    pub device_id: DeviceId,

    /// The device type, parsed from the user agent when absent
    /// (iPhone, Android, Windows…).
    pub device_type: Option<String>,

    /// The device model.
    pub model: Option<String>,

    /// The device operating system.
    pub os: Option<String>,

    /// The raw user-agent string announced by the device.
    pub user_agent: Option<String>,

    /// The device friendly name.
    pub friendly_name: Option<String>,

    /// The protocol version announced by the device.
    pub protocol_version: String,

    pub status: DeviceStatus,

    /// The provisioning state of the device.
    pub policy: PolicyState,

    pub remote_wipe_requested: bool,
    pub remote_wipe_acknowledged: bool,

    pub is_blocked: bool,
    pub block_reason: Option<String>,

    /// The heartbeat interval the device last negotiated, in seconds.
    /// Never a promise: the next ping may renegotiate.
    pub heartbeat_interval_secs: u32,

    /// Per-device cap on items returned by one content sync exchange.
    pub max_items_per_sync: u32,

    /// Resolution applied to folders that do not carry their own
    /// policy.
    pub conflict_resolution: ConflictResolution,

    pub total_sync_count: u64,
    pub failed_sync_count: u32,

    pub first_sync_time: DateTime<Utc>,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_sync_ip: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Device {
    /// Create a new device record for the given account with the
    /// given classification.
    pub fn new(
        account_id: impl Into<AccountId>,
        device_id: impl Into<DeviceId>,
        info: DeviceInfo,
    ) -> Self {
        let now = Utc::now();
        let mut device = Self {
            account_id: account_id.into(),
            device_id: device_id.into(),
            device_type: None,
            model: None,
            os: None,
            user_agent: None,
            friendly_name: None,
            protocol_version: DEFAULT_PROTOCOL_VERSION.to_owned(),
            status: DeviceStatus::Pending,
            policy: PolicyState::NoPolicy,
            remote_wipe_requested: false,
            remote_wipe_acknowledged: false,
            is_blocked: false,
            block_reason: None,
            heartbeat_interval_secs: 300,
            max_items_per_sync: 100,
            conflict_resolution: ConflictResolution::default(),
            total_sync_count: 0,
            failed_sync_count: 0,
            first_sync_time: now,
            last_sync_time: None,
            last_sync_ip: None,
            created_at: now,
            updated_at: now,
        };
        device.refresh_info(info);
        device
    }

    /// Refresh the classification fields from the given info,
    /// completing missing type/os from the user agent.
    pub fn refresh_info(&mut self, info: DeviceInfo) {
        if let Some(device_type) = info.device_type {
            self.device_type = Some(device_type);
        }
        if let Some(model) = info.model {
            self.model = Some(model);
        }
        if let Some(os) = info.os {
            self.os = Some(os);
        }
        if let Some(friendly_name) = info.friendly_name {
            self.friendly_name = Some(friendly_name);
        }
        if let Some(version) = info.protocol_version {
            self.protocol_version = version;
        }
        if let Some(user_agent) = info.user_agent {
            if let Some((device_type, os)) = classify_user_agent(&user_agent) {
                self.device_type.get_or_insert_with(|| device_type.to_owned());
                self.os.get_or_insert_with(|| os.to_owned());
            }
            self.user_agent = Some(user_agent);
        }
        self.touch();
    }

    /// The can-sync predicate: content operations are refused unless
    /// it holds.
    pub fn can_sync(&self) -> bool {
        self.status.is_allowed() && !self.is_blocked && !self.remote_wipe_requested
    }

    /// Return `true` if a policy is outstanding for the device.
    pub fn needs_policy_acknowledgment(&self) -> bool {
        match &self.policy {
            PolicyState::NoPolicy => false,
            PolicyState::Offered(_) => true,
            PolicyState::Acknowledged(_) => self.status == DeviceStatus::ProvisionPending,
        }
    }

    /// Block the device with the given reason.
    pub fn block(&mut self, reason: impl Into<String>) {
        self.status = DeviceStatus::Blocked;
        self.is_blocked = true;
        self.block_reason = Some(reason.into());
        self.touch();
    }

    /// Allow the device, clearing any block and any wipe state. Used
    /// both for approval and for administrative re-approval after a
    /// wipe.
    pub fn allow(&mut self) {
        self.status = if self.needs_policy_acknowledgment() {
            DeviceStatus::ProvisionPending
        } else {
            DeviceStatus::Allowed
        };
        self.is_blocked = false;
        self.block_reason = None;
        self.remote_wipe_requested = false;
        self.remote_wipe_acknowledged = false;
        self.touch();
    }

    /// Quarantine the device.
    pub fn quarantine(&mut self) {
        self.status = DeviceStatus::Quarantined;
        self.touch();
    }

    /// Request a remote wipe. This is a request, not a confirmation
    /// that data was erased: the device learns about it on its next
    /// contact.
    pub fn request_remote_wipe(&mut self) {
        self.remote_wipe_requested = true;
        self.status = DeviceStatus::Wiped;
        self.touch();
    }

    /// Record the device acknowledgment of a remote wipe. The record
    /// becomes inert afterwards.
    pub fn acknowledge_remote_wipe(&mut self) {
        self.remote_wipe_acknowledged = true;
        self.touch();
    }

    /// Offer a security policy to the device, forcing acknowledgment
    /// before any further content sync.
    pub fn offer_policy(&mut self, key: PolicyKey) {
        self.policy = PolicyState::Offered(key);
        if self.can_sync() {
            self.status = DeviceStatus::ProvisionPending;
        }
        self.touch();
    }

    /// Record the device acknowledgment of the offered policy key.
    pub fn acknowledge_policy(&mut self, key: &PolicyKey) -> Result<()> {
        match &self.policy {
            PolicyState::Offered(offered) if offered == key => {
                self.policy = PolicyState::Acknowledged(key.clone());
                if self.status == DeviceStatus::ProvisionPending {
                    self.status = DeviceStatus::Allowed;
                }
                self.touch();
                Ok(())
            }
            PolicyState::Acknowledged(acked) if acked == key => Ok(()),
            _ => Err(Error::PolicyKeyMismatchError(self.device_id.clone())),
        }
    }

    /// Update the sync counters after an exchange. A success resets
    /// the failure streak.
    pub fn update_sync_stats(&mut self, success: bool, client_ip: Option<&str>) {
        self.total_sync_count += 1;
        if success {
            self.failed_sync_count = 0;
        } else {
            self.failed_sync_count += 1;
        }
        self.last_sync_time = Some(Utc::now());
        if let Some(ip) = client_ip {
            self.last_sync_ip = Some(ip.to_owned());
        }
        self.touch();
    }

    /// Return a human readable description of the device.
    pub fn description(&self) -> String {
        if let Some(name) = &self.friendly_name {
            return name.clone();
        }

        let mut desc = String::new();
        if let Some(device_type) = &self.device_type {
            desc.push_str(device_type);
        }
        if let Some(model) = &self.model {
            if !desc.is_empty() {
                desc.push(' ');
            }
            desc.push_str(model);
        }
        if let Some(os) = &self.os {
            if !desc.is_empty() {
                desc.push_str(&format!(" ({os})"));
            } else {
                desc.push_str(os);
            }
        }

        if desc.is_empty() {
            self.device_id.clone()
        } else {
            desc
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Classify a device from its user-agent string.
pub fn classify_user_agent(user_agent: &str) -> Option<(&'static str, &'static str)> {
    USER_AGENT_CLASSES
        .iter()
        .find(|(needle, _, _)| user_agent.contains(needle))
        .map(|(_, device_type, os)| (*device_type, *os))
}
