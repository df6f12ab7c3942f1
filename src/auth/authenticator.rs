//! Device resolution and the duplicate-connection policy.

use serde_json::json;
use tracing::{error, info, warn};

use crate::identity;
use crate::registry::error::StoreError;
use crate::registry::store::RegistryStore;
use crate::registry::{alerts, Device, DeviceConnection, DeviceStatus};

/// Outcome of resolving a device identity against the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// Device is registered and approved.
    Valid,
    /// Device is registered but still awaiting approval.
    Pending,
    /// Device has been blocked.
    Blocked,
    /// Device is registered with a status that never grants access.
    InvalidStatus(DeviceStatus),
    /// No device with this composite identity is known.
    NotFound,
}

/// What the interceptor must do with the incoming session after a
/// duplicate-connection event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneVerdict {
    AcceptNew,
    RejectNew,
}

#[derive(Clone)]
pub struct DeviceAuthenticator {
    store: RegistryStore,
}

impl DeviceAuthenticator {
    pub fn new(store: RegistryStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &RegistryStore {
        &self.store
    }

    /// Resolves `{serial, mac}` through the composite hash and classifies the
    /// device's standing.
    pub async fn validate_device(
        &self,
        serial: &str,
        mac: &str,
    ) -> Result<ValidationOutcome, StoreError> {
        let composite = identity::hash_composite(serial, mac);
        let Some(device) = self.store.find_by_composite_hash(&composite).await? else {
            warn!(serial, "device not found in registry");
            return Ok(ValidationOutcome::NotFound);
        };

        Ok(match device.status {
            DeviceStatus::Approved => ValidationOutcome::Valid,
            DeviceStatus::Pending => {
                warn!(serial, "device is pending approval");
                ValidationOutcome::Pending
            }
            DeviceStatus::Blocked => {
                warn!(serial, "device is blocked");
                ValidationOutcome::Blocked
            }
            other => {
                warn!(serial, status = %other, "device has invalid status");
                ValidationOutcome::InvalidStatus(other)
            }
        })
    }

    /// Returns the active connection of a device, if any.
    pub async fn check_duplicate_connection(
        &self,
        device_id: i64,
    ) -> Result<Option<DeviceConnection>, StoreError> {
        self.store.find_active_by_device_id(device_id).await
    }

    /// Applies the clone policy for a CONNECT that found an existing active
    /// session. Exactly one alert row is written per event.
    ///
    /// Same peer address: reconnect, the stale session is closed and the new
    /// one admitted. Different address on a critical device: the incumbent
    /// wins. Different address otherwise: both sessions go and the device is
    /// blocked until an operator intervenes.
    pub async fn handle_duplicate(
        &self,
        device: &Device,
        old_connection: &DeviceConnection,
        new_addr: &str,
    ) -> Result<CloneVerdict, StoreError> {
        let old_addr = old_connection.ip_address.as_str();
        warn!(
            device_id = device.id,
            old_addr, new_addr, "duplicate connection detected"
        );

        let (verdict, alert_type, action_taken) = if old_addr == new_addr {
            info!(device_id = device.id, "same peer address, treating as reconnection");
            self.store.close_connection(old_connection.id).await?;
            (
                CloneVerdict::AcceptNew,
                alerts::DEVICE_RECONNECTION,
                "CLOSED_OLD_ALLOWED_NEW",
            )
        } else if device.is_critical {
            error!(
                device_id = device.id,
                "clone attempt against critical device, keeping incumbent session"
            );
            (
                CloneVerdict::RejectNew,
                alerts::CRITICAL_DEVICE_CLONE_ATTEMPT,
                "REJECTED_NEW_KEPT_OLD",
            )
        } else {
            error!(
                device_id = device.id,
                "clone detected, blocking device and dropping both sessions"
            );
            self.store.close_connection(old_connection.id).await?;
            self.store
                .update_status(device.id, DeviceStatus::Blocked, "SYSTEM")
                .await?;
            (
                CloneVerdict::RejectNew,
                alerts::DEVICE_CLONE_DETECTED,
                "BLOCKED_DEVICE_DISCONNECTED_BOTH",
            )
        };

        let details = json!({
            "old_addr": old_addr,
            "new_addr": new_addr,
            "critical": device.is_critical,
            "action_taken": action_taken,
            "old_connection_time": old_connection.connected_at.to_string(),
        });
        self.store
            .insert_alert(alert_type, &device.serial_hash, details)
            .await?;
        info!(device_id = device.id, alert_type, "clone policy applied");

        Ok(verdict)
    }
}
