//! # Engine config
//!
//! Module dedicated to the service-level synchronization
//! configuration.

use crate::ping::config::PingConfig;

/// The synchronization engine configuration.
///
/// Knobs that apply to the whole engine rather than to a single
/// device or folder. Per-device and per-folder settings live on the
/// [`Device`](crate::device::Device) and
/// [`DeviceFolder`](crate::folder::DeviceFolder) records.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(
    feature = "derive",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case", default)
)]
pub struct SyncConfig {
    /// Global kill-switch. When `false`, device registration is
    /// refused; already registered devices are denied at the gate.
    pub enabled: bool,

    /// When `true`, newly registered devices start in the pending
    /// state and must be approved by an administrator before they can
    /// sync. When `false` they are allowed right away.
    pub require_device_approval: bool,

    /// Maximum number of non-blocked devices a single account may
    /// register.
    pub max_devices_per_account: usize,

    /// Hard cap on the number of items returned by a single content
    /// sync exchange, whatever the device asks for.
    pub max_items_per_sync: u32,

    /// Items larger than this many bytes are skipped during content
    /// sync regardless of the folder truncation size, and surfaced as
    /// a partial success.
    pub max_item_size: u64,

    /// Quota on client write-back bytes accepted per exchange. The
    /// changes that fit are applied, the rest is flagged back to the
    /// client as a partial success.
    pub max_client_bytes_per_sync: u64,

    /// Default number of items a device syncs per exchange when it
    /// does not say otherwise.
    pub default_max_items: u32,

    /// Heartbeat interval bounds applied to ping requests.
    pub ping: PingConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            require_device_approval: false,
            max_devices_per_account: 10,
            max_items_per_sync: 500,
            max_item_size: 10 * 1024 * 1024,
            max_client_bytes_per_sync: 25 * 1024 * 1024,
            default_max_items: 100,
            ping: PingConfig::default(),
        }
    }
}
