//! Operator-facing registry mutations.
//!
//! Every mutation checks the approval state machine, writes through the
//! store's transactional status update, and records the matching audit alert
//! plus a single-line audit log entry. Failures are reported as a plain
//! `false`; the caller surfaces only success or failure.

use serde_json::json;
use tracing::{error, info, warn};

use super::store::RegistryStore;
use super::{alerts, Device, DeviceStatus, SecurityAlert};

#[derive(Clone)]
pub struct AdminService {
    store: RegistryStore,
}

impl AdminService {
    pub fn new(store: RegistryStore) -> Self {
        Self { store }
    }

    pub async fn approve_device(&self, device_id: i64, admin: &str) -> bool {
        self.transition(
            device_id,
            admin,
            DeviceStatus::Approved,
            alerts::DEVICE_APPROVED,
            "APPROVED",
        )
        .await
    }

    /// Rejection also tears down any live session of the device.
    pub async fn reject_device(&self, device_id: i64, admin: &str, reason: &str) -> bool {
        let Some(device) = self.load(device_id).await else {
            return false;
        };
        if !device.status.can_transition_to(DeviceStatus::Rejected) {
            warn!(device_id, status = %device.status, "rejection not allowed from current status");
            return false;
        }
        match self
            .store
            .update_status(device_id, DeviceStatus::Rejected, admin)
            .await
        {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                error!(device_id, error = %e, "failed to reject device");
                return false;
            }
        }
        if let Err(e) = self.store.close_all_for_device(device_id).await {
            error!(device_id, error = %e, "failed to close connections of rejected device");
        }
        let details = json!({
            "admin": admin,
            "device_id": device_id,
            "reason": reason,
            "action": "REJECTED",
        });
        self.record(alerts::DEVICE_REJECTED, &device.serial_hash, details)
            .await;
        info!(device_id, admin, reason, "device rejected");
        true
    }

    pub async fn unblock_device(&self, device_id: i64, admin: &str) -> bool {
        let Some(device) = self.load(device_id).await else {
            return false;
        };
        if device.status != DeviceStatus::Blocked {
            warn!(device_id, status = %device.status, "unblock requested for a device that is not blocked");
            return false;
        }
        self.transition(
            device_id,
            admin,
            DeviceStatus::Approved,
            alerts::DEVICE_UNBLOCKED,
            "UNBLOCKED",
        )
        .await
    }

    pub async fn mark_critical(&self, device_id: i64, admin: &str) -> bool {
        let Some(device) = self.load(device_id).await else {
            return false;
        };
        match self.store.mark_critical(device_id).await {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                error!(device_id, error = %e, "failed to mark device critical");
                return false;
            }
        }
        let details = json!({
            "admin": admin,
            "device_id": device_id,
            "action": "MARKED_CRITICAL",
        });
        self.record(alerts::DEVICE_MARKED_CRITICAL, &device.serial_hash, details)
            .await;
        info!(device_id, admin, "device marked critical");
        true
    }

    pub async fn pending_devices(&self) -> Vec<Device> {
        self.store
            .find_by_status(DeviceStatus::Pending)
            .await
            .unwrap_or_else(|e| {
                error!(error = %e, "failed to list pending devices");
                Vec::new()
            })
    }

    pub async fn all_devices(&self) -> Vec<Device> {
        self.store.find_all().await.unwrap_or_else(|e| {
            error!(error = %e, "failed to list devices");
            Vec::new()
        })
    }

    pub async fn all_alerts(&self) -> Vec<SecurityAlert> {
        self.store.find_all_alerts().await.unwrap_or_else(|e| {
            error!(error = %e, "failed to list alerts");
            Vec::new()
        })
    }

    pub async fn alerts_for_device(&self, serial_hash: &str) -> Vec<SecurityAlert> {
        self.store
            .find_alerts_by_serial_hash(serial_hash)
            .await
            .unwrap_or_else(|e| {
                error!(error = %e, "failed to list alerts for device");
                Vec::new()
            })
    }

    async fn transition(
        &self,
        device_id: i64,
        admin: &str,
        next: DeviceStatus,
        alert_type: &str,
        action: &str,
    ) -> bool {
        let Some(device) = self.load(device_id).await else {
            return false;
        };
        if !device.status.can_transition_to(next) {
            warn!(
                device_id,
                from = %device.status,
                to = %next,
                "status transition not allowed"
            );
            return false;
        }
        match self.store.update_status(device_id, next, admin).await {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                error!(device_id, error = %e, "status update failed");
                return false;
            }
        }
        let details = json!({
            "admin": admin,
            "device_id": device_id,
            "action": action,
        });
        self.record(alert_type, &device.serial_hash, details).await;
        info!(device_id, admin, action, "admin action applied");
        true
    }

    async fn load(&self, device_id: i64) -> Option<Device> {
        match self.store.find_by_id(device_id).await {
            Ok(Some(device)) => Some(device),
            Ok(None) => {
                warn!(device_id, "device not found");
                None
            }
            Err(e) => {
                error!(device_id, error = %e, "device lookup failed");
                None
            }
        }
    }

    async fn record(&self, alert_type: &str, serial_hash: &str, details: serde_json::Value) {
        if let Err(e) = self
            .store
            .insert_alert(alert_type, serial_hash, details.clone())
            .await
        {
            error!(alert_type, error = %e, "failed to record audit alert");
        }
        if let Err(e) = self
            .store
            .insert_audit_log(alert_type, serial_hash, details)
            .await
        {
            error!(alert_type, error = %e, "failed to record audit log");
        }
    }
}
