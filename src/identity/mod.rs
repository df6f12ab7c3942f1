//! # Device Identity Module
//!
//! Stable, one-way device identifiers and the clientId conventions shared by
//! the broker side and the device SDK.
//!
//! ## Why This Module Exists
//!
//! Devices never present their plaintext serial or MAC to the registry. All
//! lookups are keyed by SHA-256 digests, so a database dump leaks no hardware
//! identifiers. The composite digest of `serial|mac` is the registry's unique
//! key; the serial digest alone is used where only the topic path is known.
//!
//! The MQTT clientId carries a compressed form of the identity
//! (`IOT` + last 4 digits of the serial + first 6 hex chars of the MAC), so
//! the broker can classify a session before the device has registered.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// Prefix shared by every device serial in this installation.
pub const SERIAL_PREFIX: &str = "IOT-2025-";

/// Exact clientId of the single command controller.
pub const CONTROLLER_CLIENT_ID: &str = "controller-cmd";

/// ClientId prefix reserved for admin sessions.
pub const ADMIN_CLIENT_PREFIX: &str = "ADMIN_";

/// Hex SHA-256 of a single identifier.
pub fn hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(digest)
}

/// Hex SHA-256 of the `serial|mac` composite, the registry's unique key.
pub fn hash_composite(serial: &str, mac: &str) -> String {
    hash(&format!("{}|{}", serial, mac))
}

/// Checks the `XX:XX:XX:XX:XX:XX` shape (case insensitive, `:` or `-`).
pub fn is_valid_mac(mac: &str) -> bool {
    let bytes = mac.as_bytes();
    if bytes.len() != 17 {
        return false;
    }
    for (i, b) in bytes.iter().enumerate() {
        if i % 3 == 2 {
            if *b != b':' && *b != b'-' {
                return false;
            }
        } else if !b.is_ascii_hexdigit() {
            return false;
        }
    }
    true
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid clientId format, expected IOT{{serial tail}}{{mac prefix}}: {0}")]
    MalformedClientId(String),

    #[error("invalid MAC address format: {0}")]
    InvalidMac(String),

    #[error("invalid device type: {0}")]
    InvalidDeviceType(String),

    #[error("serial must not be empty")]
    EmptySerial,
}

/// Hardware classes known to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceType {
    TempSensor,
    SmartPlug,
    EnergySensor,
    SmartSwitch,
}

impl DeviceType {
    /// String form used in payloads and registry rows.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::TempSensor => "TEMP_SENSOR",
            DeviceType::SmartPlug => "SMART_PLUG",
            DeviceType::EnergySensor => "ENERGY_SENSOR",
            DeviceType::SmartSwitch => "SMART_SWITCH",
        }
    }

    pub fn parse(s: &str) -> Result<Self, IdentityError> {
        match s {
            "TEMP_SENSOR" => Ok(DeviceType::TempSensor),
            "SMART_PLUG" => Ok(DeviceType::SmartPlug),
            "ENERGY_SENSOR" => Ok(DeviceType::EnergySensor),
            "SMART_SWITCH" => Ok(DeviceType::SmartSwitch),
            other => Err(IdentityError::InvalidDeviceType(other.to_string())),
        }
    }

    /// Sensors report fire-and-forget, actuators need the ack.
    pub fn is_actuator(&self) -> bool {
        matches!(self, DeviceType::SmartPlug | DeviceType::SmartSwitch)
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated identity of one physical device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub serial: String,
    pub mac: String,
    pub device_type: DeviceType,
}

impl DeviceIdentity {
    pub fn new(serial: &str, mac: &str, device_type: DeviceType) -> Result<Self, IdentityError> {
        if serial.trim().is_empty() {
            return Err(IdentityError::EmptySerial);
        }
        if !is_valid_mac(mac) {
            return Err(IdentityError::InvalidMac(mac.to_string()));
        }
        Ok(Self {
            serial: serial.to_string(),
            mac: mac.to_string(),
            device_type,
        })
    }

    pub fn serial_hash(&self) -> String {
        hash(&self.serial)
    }

    pub fn mac_hash(&self) -> String {
        hash(&self.mac)
    }

    pub fn composite_hash(&self) -> String {
        hash_composite(&self.serial, &self.mac)
    }

    /// `IOT` + last 4 of the serial + first 6 hex chars of the MAC.
    pub fn client_id(&self) -> String {
        let tail = &self.serial[self.serial.len().saturating_sub(4)..];
        let mac_compact: String = self.mac.chars().filter(|c| c.is_ascii_hexdigit()).collect();
        format!("IOT{}{}", tail, &mac_compact[..6])
    }

    /// Same derivation with a suffix for auxiliary sessions.
    pub fn client_id_with_suffix(&self, suffix: &str) -> String {
        format!("{}{}", self.client_id(), suffix)
    }
}

/// Role a session claims through its clientId. The TLS layer has already
/// authenticated the peer certificate; this only classifies the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientClass {
    /// A device session carrying a parsed partial identity.
    Device(ParsedClientId),
    /// The single command controller (`controller-cmd`).
    Controller,
    /// An operator session (`ADMIN_` prefix).
    Admin,
    /// Authenticated at the TLS layer but without a recognized role.
    Unknown,
}

/// What a device clientId reveals before registration: the nominal serial and
/// the first three MAC octets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedClientId {
    pub client_id: String,
    pub serial: String,
    pub mac_prefix: String,
}

impl ParsedClientId {
    /// Placeholder MAC used until registration supplies the full address.
    pub fn placeholder_mac(&self) -> String {
        format!("{}:00:00:00", self.mac_prefix)
    }
}

/// Classifies a clientId. Device ids are checked strictly: 4-digit serial
/// tail, 6 hex chars of MAC prefix, anything after that is an opaque session
/// suffix.
pub fn classify_client(client_id: &str) -> ClientClass {
    if client_id == CONTROLLER_CLIENT_ID {
        return ClientClass::Controller;
    }
    if client_id.starts_with(ADMIN_CLIENT_PREFIX) {
        return ClientClass::Admin;
    }
    if client_id.starts_with("IOT") {
        match parse_client_id(client_id) {
            Ok(parsed) => return ClientClass::Device(parsed),
            Err(_) => return ClientClass::Unknown,
        }
    }
    ClientClass::Unknown
}

/// Parses a device clientId of the form `IOT{dddd}{hhhhhh}[suffix]`.
pub fn parse_client_id(client_id: &str) -> Result<ParsedClientId, IdentityError> {
    if !client_id.starts_with("IOT") || client_id.len() < 13 {
        return Err(IdentityError::MalformedClientId(client_id.to_string()));
    }
    let serial_tail = &client_id[3..7];
    let mac_compact = &client_id[7..13];
    if !serial_tail.bytes().all(|b| b.is_ascii_digit()) {
        return Err(IdentityError::MalformedClientId(client_id.to_string()));
    }
    if !mac_compact.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(IdentityError::MalformedClientId(client_id.to_string()));
    }
    let mac_prefix = format!(
        "{}:{}:{}",
        &mac_compact[0..2],
        &mac_compact[2..4],
        &mac_compact[4..6]
    );
    Ok(ParsedClientId {
        client_id: client_id.to_string(),
        serial: format!("{}{}", SERIAL_PREFIX, serial_tail),
        mac_prefix,
    })
}

#[cfg(test)]
mod identity_tests;
