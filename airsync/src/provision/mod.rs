//! # Provisioning module
//!
//! Module dedicated to the security policy handshake: a device must
//! accept the current policy before being allowed to sync content.
//! Publishing a new policy forces every device through the handshake
//! again on its next request.
//!
//! Remote wipe delivery rides the same gate: the directive replaces
//! the normal response of whatever command the device issues next
//! (see [`SyncEngine`](crate::engine::SyncEngine)).

mod error;

use std::{
    fmt,
    str::FromStr,
    sync::atomic::{AtomicU64, Ordering},
};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::info;

use crate::device::{Device, DeviceRegistry};

#[doc(inline)]
pub use self::error::{Error, Result};

/// The opaque security policy key.
///
/// Keys are minted monotonically so an acknowledgment can never refer
/// to a newer policy than the one published.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PolicyKey(u64);

impl From<u64> for PolicyKey {
    fn from(key: u64) -> Self {
        Self(key)
    }
}

impl fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PolicyKey {
    type Err = Error;

    fn from_str(key: &str) -> Result<Self> {
        key.parse::<u64>()
            .map(PolicyKey)
            .map_err(|_| Error::ParsePolicyKeyError(key.to_owned()))
    }
}

/// The published security policy.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SecurityPolicy {
    pub key: PolicyKey,
    pub issued_at: DateTime<Utc>,
}

/// The provisioning coordinator.
///
/// Holds the currently published policy and drives the per-device
/// handshake through the registry.
#[derive(Debug, Default)]
pub struct ProvisionCoordinator {
    policy: RwLock<Option<SecurityPolicy>>,
    next_key: AtomicU64,
}

impl ProvisionCoordinator {
    pub fn new() -> Self {
        Self {
            policy: RwLock::new(None),
            next_key: AtomicU64::new(1),
        }
    }

    /// Return the currently published policy, if any.
    pub async fn current(&self) -> Option<SecurityPolicy> {
        self.policy.read().await.clone()
    }

    /// Publish a new policy and force every registered device through
    /// the handshake again.
    pub async fn publish(&self, registry: &DeviceRegistry) -> SecurityPolicy {
        let key = PolicyKey(self.next_key.fetch_add(1, Ordering::Relaxed));
        let policy = SecurityPolicy {
            key: key.clone(),
            issued_at: Utc::now(),
        };

        *self.policy.write().await = Some(policy.clone());
        registry.offer_policy_to_all(&key).await;

        info!(key = %key, "published security policy");
        policy
    }

    /// Offer the current policy to one device as part of the
    /// handshake. Returns `None` when no policy is published (the
    /// device stays unconstrained).
    pub async fn offer(
        &self,
        registry: &DeviceRegistry,
        device_id: &str,
    ) -> Result<Option<PolicyKey>> {
        let Some(policy) = self.current().await else {
            return Ok(None);
        };

        let key = policy.key;
        registry
            .update(device_id, |device| device.offer_policy(key.clone()))
            .await?;
        Ok(Some(key))
    }

    /// Record the device acknowledgment of the given policy key.
    pub async fn acknowledge(
        &self,
        registry: &DeviceRegistry,
        device_id: &str,
        key: &PolicyKey,
    ) -> Result<Device> {
        let current = self.current().await;
        match current {
            None => Err(Error::NoPolicyPublishedError(device_id.to_owned())),
            Some(policy) if &policy.key != key => Err(Error::SupersededPolicyKeyError(
                key.clone(),
                policy.key.clone(),
            )),
            Some(_) => {
                let device = registry
                    .try_update(device_id, |device| device.acknowledge_policy(key))
                    .await?;
                info!(device = device_id, key = %key, "policy acknowledged");
                Ok(device)
            }
        }
    }
}
