//! # Telemetry Ingest Module
//!
//! ## Why This Module Exists
//! Telemetry is the one payload class the hub stores without trusting its
//! shape. Devices ship whatever JSON their firmware produces; the hub keeps
//! the raw bytes and extracts a few well-known fields when they happen to be
//! present. Parsing failures never lose data, they only leave the optional
//! columns empty.
//!
//! ## Guards
//! Payloads above 512 KiB and payloads that are not UTF-8 are dropped with a
//! warning, as are messages on malformed topics or for unknown devices. A
//! dropped message produces no row.

use chrono::{DateTime, Local, NaiveDateTime};
use tracing::{debug, warn};

use crate::identity;
use crate::registry::error::StoreError;
use crate::registry::store::RegistryStore;
use crate::registry::NewTelemetry;

/// Upper bound for a single telemetry payload.
pub const MAX_PAYLOAD_BYTES: usize = 512 * 1024;

#[derive(Clone)]
pub struct TelemetryIngest {
    store: RegistryStore,
}

impl TelemetryIngest {
    pub fn new(store: RegistryStore) -> Self {
        Self { store }
    }

    /// Validates, resolves and stores one telemetry message. Returns the row
    /// id, or `None` when the message was dropped.
    pub async fn ingest(&self, topic: &str, payload: &[u8]) -> Result<Option<i64>, StoreError> {
        if payload.is_empty() {
            warn!(topic, "skipping empty telemetry payload");
            return Ok(None);
        }
        if payload.len() > MAX_PAYLOAD_BYTES {
            warn!(
                topic,
                bytes = payload.len(),
                "skipping oversized telemetry payload"
            );
            return Ok(None);
        }
        let Ok(payload) = std::str::from_utf8(payload) else {
            warn!(topic, "skipping non-UTF-8 telemetry payload");
            return Ok(None);
        };

        let Some(serial) = telemetry_topic_serial(topic) else {
            debug!(topic, "topic is not a telemetry topic, ignoring");
            return Ok(None);
        };

        let serial_hash = identity::hash(serial);
        let Some(device) = self.store.find_by_serial_hash(&serial_hash).await? else {
            warn!(serial, "unknown device for telemetry, dropping");
            return Ok(None);
        };

        let fields = ParsedFields::from_payload(payload);

        let id = self
            .store
            .insert_telemetry(NewTelemetry {
                device_id: device.id,
                topic: topic.to_string(),
                ts: fields.ts,
                measurement: fields.measurement,
                metric_value: fields.value,
                payload_raw: payload.to_string(),
            })
            .await?;
        debug!(device_id = device.id, topic, "telemetry ingested");
        Ok(Some(id))
    }
}

#[derive(Debug, Default)]
struct ParsedFields {
    ts: Option<NaiveDateTime>,
    measurement: Option<String>,
    value: Option<f64>,
}

impl ParsedFields {
    /// Best-effort extraction; anything unparseable stays `None`.
    fn from_payload(payload: &str) -> Self {
        let Ok(json) = serde_json::from_str::<serde_json::Value>(payload) else {
            debug!("telemetry payload is not JSON, storing raw only");
            return Self::default();
        };

        let ts = json
            .get("timestamp")
            .and_then(|v| v.as_str())
            .and_then(parse_device_timestamp);
        let measurement = json
            .get("measurement")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let value = json.get("value").and_then(|v| v.as_f64());

        Self {
            ts,
            measurement,
            value,
        }
    }
}

/// Accepts an ISO local datetime or an RFC 3339 timestamp, normalized to
/// hub-local naive time.
pub(crate) fn parse_device_timestamp(s: &str) -> Option<NaiveDateTime> {
    if let Ok(ts) = s.parse::<NaiveDateTime>() {
        return Some(ts);
    }
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|ts| ts.with_timezone(&Local).naive_local())
}

/// Serial segment of `home/<any>/devices/<serial>/telemetry`.
fn telemetry_topic_serial(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    match parts.as_slice() {
        ["home", _controller, "devices", serial, "telemetry"] if !serial.is_empty() => {
            Some(serial)
        }
        _ => None,
    }
}
