//! # Device registry
//!
//! Module dedicated to the device registry, the authorization gate in
//! front of every protocol command.

use std::{collections::HashMap, fmt};

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::SyncConfig;

use super::{AccountId, Device, DeviceId, DeviceInfo, DeviceStatus, Error, Result};

/// The outcome of authorizing a device against the registry.
///
/// Checked on every request, before any cursor read or write.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Authorization {
    /// The device may proceed with the requested command.
    Allow,

    /// The device is denied for the given reason. The denial is
    /// distinct per reason so clients do not retry the same request
    /// forever.
    Denied(DenyReason),

    /// A security policy is outstanding: only the provisioning
    /// handshake may proceed.
    RequirePolicy,

    /// A remote wipe is pending: the device receives the wipe
    /// directive instead of its normal response.
    Wipe,
}

/// The reason a device was denied.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DenyReason {
    /// The device was blocked by an administrator.
    Blocked(Option<String>),

    /// The device still waits for administrative approval.
    PendingApproval,

    /// The device was quarantined.
    Quarantined,

    /// The device acknowledged a remote wipe and its record is inert.
    Wiped,

    /// Synchronization is disabled service-wide.
    Disabled,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocked(Some(reason)) => write!(f, "device blocked: {reason}"),
            Self::Blocked(None) => write!(f, "device blocked"),
            Self::PendingApproval => write!(f, "device waiting for approval"),
            Self::Quarantined => write!(f, "device quarantined"),
            Self::Wiped => write!(f, "device wiped"),
            Self::Disabled => write!(f, "synchronization disabled"),
        }
    }
}

/// The device registry.
///
/// Keyed by device identifier so that [`authorize`] stays O(1)
/// however many devices an account carries.
///
/// [`authorize`]: DeviceRegistry::authorize
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<DeviceId, Device>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device, idempotently.
    ///
    /// A known device has its classification refreshed and is
    /// returned as-is; an unknown one is created in the state the
    /// config dictates. A wiped device cannot re-register until an
    /// administrator re-approves it.
    pub async fn register(
        &self,
        config: &SyncConfig,
        account_id: impl Into<AccountId>,
        device_id: impl Into<DeviceId>,
        info: DeviceInfo,
    ) -> Result<Device> {
        let account_id = account_id.into();
        let device_id = device_id.into();

        if !config.enabled {
            return Err(Error::SyncDisabledError(device_id));
        }

        let mut devices = self.devices.write().await;

        if let Some(device) = devices.get_mut(&device_id) {
            if device.account_id != account_id {
                return Err(Error::DeviceOwnedByOtherAccountError(device_id));
            }
            if device.remote_wipe_requested || device.status.is_wiped() {
                return Err(Error::ReRegisterWipedDeviceError(device_id));
            }
            device.refresh_info(info);
            debug!(device = %device_id, "refreshed known device");
            return Ok(device.clone());
        }

        let account_devices = devices
            .values()
            .filter(|device| device.account_id == account_id && !device.is_blocked)
            .count();
        if account_devices >= config.max_devices_per_account {
            return Err(Error::TooManyDevicesError(device_id, account_id));
        }

        let mut device = Device::new(account_id, device_id.clone(), info);
        device.heartbeat_interval_secs = config.ping.default_interval_secs;
        device.max_items_per_sync = config.default_max_items;
        if !config.require_device_approval {
            device.allow();
        }

        info!(
            device = %device_id,
            status = %device.status,
            "registered new device"
        );

        devices.insert(device_id, device.clone());
        Ok(device)
    }

    /// Authorize the device for a protocol command.
    pub async fn authorize(&self, device_id: &str) -> Result<Authorization> {
        let devices = self.devices.read().await;
        let device = devices
            .get(device_id)
            .ok_or_else(|| Error::DeviceNotFoundError(device_id.to_owned()))?;

        if device.remote_wipe_requested && !device.remote_wipe_acknowledged {
            return Ok(Authorization::Wipe);
        }
        if device.remote_wipe_acknowledged || device.status.is_wiped() {
            return Ok(Authorization::Denied(DenyReason::Wiped));
        }
        if device.is_blocked {
            return Ok(Authorization::Denied(DenyReason::Blocked(
                device.block_reason.clone(),
            )));
        }

        match device.status {
            DeviceStatus::Pending => Ok(Authorization::Denied(DenyReason::PendingApproval)),
            DeviceStatus::Quarantined => Ok(Authorization::Denied(DenyReason::Quarantined)),
            DeviceStatus::Blocked => Ok(Authorization::Denied(DenyReason::Blocked(
                device.block_reason.clone(),
            ))),
            DeviceStatus::ProvisionPending => Ok(Authorization::RequirePolicy),
            DeviceStatus::Allowed if device.needs_policy_acknowledgment() => {
                Ok(Authorization::RequirePolicy)
            }
            DeviceStatus::Allowed => Ok(Authorization::Allow),
            // remote wipe flags handled above
            DeviceStatus::Wiped => Ok(Authorization::Denied(DenyReason::Wiped)),
        }
    }

    /// Find a device by its identifier.
    pub async fn find(&self, device_id: &str) -> Option<Device> {
        self.devices.read().await.get(device_id).cloned()
    }

    /// Get a device by its identifier.
    pub async fn get(&self, device_id: &str) -> Result<Device> {
        self.find(device_id)
            .await
            .ok_or_else(|| Error::DeviceNotFoundError(device_id.to_owned()))
    }

    /// Apply a mutation to a device record and return the updated
    /// copy.
    pub async fn update<F>(&self, device_id: &str, f: F) -> Result<Device>
    where
        F: FnOnce(&mut Device),
    {
        let mut devices = self.devices.write().await;
        let device = devices
            .get_mut(device_id)
            .ok_or_else(|| Error::DeviceNotFoundError(device_id.to_owned()))?;
        f(device);
        Ok(device.clone())
    }

    /// Apply a fallible mutation to a device record and return the
    /// updated copy.
    pub async fn try_update<F>(&self, device_id: &str, f: F) -> Result<Device>
    where
        F: FnOnce(&mut Device) -> Result<()>,
    {
        let mut devices = self.devices.write().await;
        let device = devices
            .get_mut(device_id)
            .ok_or_else(|| Error::DeviceNotFoundError(device_id.to_owned()))?;
        f(device)?;
        Ok(device.clone())
    }

    /// Block a device with the given reason.
    pub async fn block(&self, device_id: &str, reason: impl Into<String>) -> Result<Device> {
        let reason = reason.into();
        info!(device = device_id, reason = %reason, "blocking device");
        self.update(device_id, |device| device.block(reason))
            .await
    }

    /// Allow (or re-approve) a device.
    pub async fn allow(&self, device_id: &str) -> Result<Device> {
        info!(device = device_id, "allowing device");
        self.update(device_id, Device::allow).await
    }

    /// Request a remote wipe for a device.
    pub async fn request_wipe(&self, device_id: &str) -> Result<Device> {
        info!(device = device_id, "requesting remote wipe");
        self.update(device_id, Device::request_remote_wipe).await
    }

    /// Record the device-side acknowledgment of a remote wipe.
    pub async fn acknowledge_wipe(&self, device_id: &str) -> Result<Device> {
        info!(device = device_id, "remote wipe acknowledged");
        self.update(device_id, Device::acknowledge_remote_wipe)
            .await
    }

    /// Offer the given policy key to every device of the registry,
    /// forcing re-acknowledgment on their next request.
    pub async fn offer_policy_to_all(&self, key: &crate::provision::PolicyKey) {
        let mut devices = self.devices.write().await;
        for device in devices.values_mut() {
            device.offer_policy(key.clone());
        }
    }

    /// List the devices of an account, most recently synced first.
    pub async fn devices_for_account(&self, account_id: &str) -> Vec<Device> {
        let devices = self.devices.read().await;
        let mut devices: Vec<_> = devices
            .values()
            .filter(|device| device.account_id == account_id)
            .cloned()
            .collect();
        devices.sort_by(|a, b| b.last_sync_time.cmp(&a.last_sync_time));
        devices
    }
}
