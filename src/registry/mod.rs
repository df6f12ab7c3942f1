//! # Registry Module
//!
//! ## Why This Module Exists
//! The registry is the single durable source of truth for everything the hub
//! decides: which devices exist and in which approval state, which sessions
//! are live, every security-relevant event, and all captured telemetry. Every
//! other component holds a handle to the [`store::RegistryStore`] and goes
//! through its operations; nothing else writes rows.
//!
//! ## Key Abstractions
//! - **Hashed identities**: rows never contain plaintext serials or MACs,
//!   only the digests from [`crate::identity`]
//! - **Status as data**: the approval state machine lives in
//!   [`DeviceStatus`], its edges in [`DeviceStatus::can_transition_to`]
//! - **Append-only history**: alerts, telemetry and audit logs are inserted,
//!   never updated or deleted by the hub
//!
//! ## Error Handling Strategy
//! Store operations return typed [`error::StoreError`] values. Idempotent
//! bootstrap inserts suppress unique-key violations (matched on the driver's
//! error kind, never on message text); everything else propagates to the
//! caller, which logs and continues or aborts startup.

pub mod admin;
pub mod error;
pub mod pairing;
pub mod store;

use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Wallclock used for all registry timestamps.
pub(crate) fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

/// Approval state of a registered device.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceStatus {
    Pending,
    Approved,
    Rejected,
    Blocked,
}

impl DeviceStatus {
    /// Edges of the approval state machine. Blocked is entered automatically
    /// only by clone detection; every other transition needs an admin actor.
    pub fn can_transition_to(self, next: DeviceStatus) -> bool {
        use DeviceStatus::*;
        matches!(
            (self, next),
            (Pending, Approved)
                | (Pending, Rejected)
                | (Pending, Blocked)
                | (Approved, Rejected)
                | (Approved, Blocked)
                | (Blocked, Approved)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Pending => "PENDING",
            DeviceStatus::Approved => "APPROVED",
            DeviceStatus::Rejected => "REJECTED",
            DeviceStatus::Blocked => "BLOCKED",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One physical unit as the registry knows it.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub id: i64,
    pub device_type: String,
    pub serial_hash: String,
    pub mac_hash: String,
    pub composite_hash: String,
    pub status: DeviceStatus,
    pub is_critical: bool,
    pub registered_at: NaiveDateTime,
    pub approved_at: Option<NaiveDateTime>,
    pub approved_by: Option<String>,
    pub last_health_check: Option<NaiveDateTime>,
}

/// Insert form of [`Device`]; the store assigns id and registration time.
#[derive(Debug, Clone)]
pub struct NewDevice {
    pub device_type: String,
    pub serial_hash: String,
    pub mac_hash: String,
    pub composite_hash: String,
    pub status: DeviceStatus,
    pub is_critical: bool,
}

/// A single live or historical broker session of a device.
/// `disconnected_at == None` means the session is active.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeviceConnection {
    pub id: i64,
    pub device_id: i64,
    pub connected_at: NaiveDateTime,
    pub disconnected_at: Option<NaiveDateTime>,
    pub ip_address: String,
    pub client_info: String,
}

/// Append-only security event row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SecurityAlert {
    pub id: i64,
    pub alert_type: String,
    pub device_serial_hash: String,
    pub details: Option<String>,
    pub created_at: NaiveDateTime,
}

/// One captured telemetry message.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TelemetryRecord {
    pub id: i64,
    pub device_id: i64,
    pub received_at: NaiveDateTime,
    pub topic: String,
    pub ts: Option<NaiveDateTime>,
    pub measurement: Option<String>,
    pub metric_value: Option<f64>,
    pub payload_raw: String,
}

/// Insert form of [`TelemetryRecord`].
#[derive(Debug, Clone)]
pub struct NewTelemetry {
    pub device_id: i64,
    pub topic: String,
    pub ts: Option<NaiveDateTime>,
    pub measurement: Option<String>,
    pub metric_value: Option<f64>,
    pub payload_raw: String,
}

/// Pairing result: maps an external client UUID to a certificate
/// fingerprint and role.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ClientBinding {
    pub id: i64,
    pub uuid: String,
    pub fingerprint: String,
    pub role: String,
    pub created_at: NaiveDateTime,
    pub last_seen_at: Option<NaiveDateTime>,
}

/// Append-only admin action record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditLog {
    pub id: i64,
    pub event_type: String,
    pub subject: String,
    pub details: Option<String>,
    pub created_at: NaiveDateTime,
}

/// Stable alert tags written by the security core.
pub mod alerts {
    pub const DEVICE_REGISTRATION: &str = "DEVICE_REGISTRATION";
    pub const REGISTRATION_ERROR: &str = "REGISTRATION_ERROR";
    pub const HEALTH_CHECK_ERROR: &str = "HEALTH_CHECK_ERROR";
    pub const INVALID_MAC_FORMAT: &str = "INVALID_MAC_FORMAT";
    pub const DEVICE_NOT_FOUND: &str = "DEVICE_NOT_FOUND";
    pub const MAC_MISMATCH: &str = "MAC_MISMATCH";
    pub const TIME_DRIFT: &str = "TIME_DRIFT";
    pub const INVALID_TIMESTAMP: &str = "INVALID_TIMESTAMP";
    pub const HEALTH_CHECK_REJECTED_BLOCKED: &str = "HEALTH_CHECK_REJECTED_BLOCKED";
    pub const HEALTH_CHECK_REJECTED_NO_CONNECTION: &str = "HEALTH_CHECK_REJECTED_NO_CONNECTION";
    pub const CONNECTION_ERROR: &str = "CONNECTION_ERROR";
    pub const MALFORMED_CLIENT_ID: &str = "MALFORMED_CLIENT_ID";
    pub const DEVICE_RECONNECTION: &str = "DEVICE_RECONNECTION";
    pub const CRITICAL_DEVICE_CLONE_ATTEMPT: &str = "CRITICAL_DEVICE_CLONE_ATTEMPT";
    pub const DEVICE_CLONE_DETECTED: &str = "DEVICE_CLONE_DETECTED";
    pub const DEVICE_OFFLINE: &str = "DEVICE_OFFLINE";
    pub const DEVICE_APPROVED: &str = "DEVICE_APPROVED";
    pub const DEVICE_REJECTED: &str = "DEVICE_REJECTED";
    pub const DEVICE_UNBLOCKED: &str = "DEVICE_UNBLOCKED";
    pub const DEVICE_MARKED_CRITICAL: &str = "DEVICE_MARKED_CRITICAL";
    pub const ACL_DEVICE_CMD_WRITE: &str = "ACL_DEVICE_CMD_WRITE";
    pub const ACL_WILDCARD_SUBSCRIBE: &str = "ACL_WILDCARD_SUBSCRIBE";
    pub const ACL_SERIAL_MISMATCH: &str = "ACL_SERIAL_MISMATCH";
    pub const ACL_UNAPPROVED_PUBLISH: &str = "ACL_UNAPPROVED_PUBLISH";
}

#[cfg(test)]
mod model_tests;
