//! Session and publish event processing.
//!
//! The engine delivers events in per-session order and must never wait on
//! the database. Connect and disconnect are handled inline on the event
//! task; published messages are routed onto a fixed pool of workers. Routing
//! is keyed by clientId, so messages of one device stay on one worker and
//! keep their order while different devices proceed in parallel.

use chrono::NaiveDateTime;
use serde::Deserialize;
use serde_json::json;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{SessionControl, SessionEvent};
use crate::auth::authenticator::{CloneVerdict, DeviceAuthenticator};
use crate::identity::{self, ClientClass, DeviceType, ParsedClientId};
use crate::registry::error::StoreError;
use crate::registry::{alerts, now, DeviceStatus, NewDevice};
use crate::telemetry::{parse_device_timestamp, TelemetryIngest};

const REGISTER_SUFFIX: &str = "/register";
const HEALTH_SUFFIX: &str = "/health";
const TELEMETRY_SUFFIX: &str = "/telemetry";

/// Placeholder type for rows created on CONNECT, before registration names
/// the real hardware class.
const PLACEHOLDER_DEVICE_TYPE: &str = "TEMP_SENSOR";

pub struct DeviceInterceptor {
    authenticator: DeviceAuthenticator,
    ingest: TelemetryIngest,
    sessions: Arc<dyn SessionControl>,
    drift_limit_secs: i64,
}

/// Running interceptor tasks. Dropping the engine's event sender shuts the
/// whole pipeline down; `join` waits for the drain.
pub struct InterceptorHandle {
    event_task: JoinHandle<()>,
    worker_tasks: Vec<JoinHandle<()>>,
}

impl InterceptorHandle {
    pub async fn join(self) {
        if let Err(e) = self.event_task.await {
            error!(error = %e, "interceptor event task failed");
        }
        for task in self.worker_tasks {
            if let Err(e) = task.await {
                error!(error = %e, "interceptor worker failed");
            }
        }
    }
}

struct PublishJob {
    client_id: String,
    topic: String,
    payload: Vec<u8>,
}

impl DeviceInterceptor {
    pub fn new(
        authenticator: DeviceAuthenticator,
        ingest: TelemetryIngest,
        sessions: Arc<dyn SessionControl>,
        drift_limit_secs: u64,
    ) -> Self {
        Self {
            authenticator,
            ingest,
            sessions,
            drift_limit_secs: drift_limit_secs as i64,
        }
    }

    /// Starts the event loop plus `pool_size` publish workers.
    pub fn spawn(
        self,
        mut events: mpsc::Receiver<SessionEvent>,
        pool_size: usize,
        queue_capacity: usize,
    ) -> InterceptorHandle {
        let interceptor = Arc::new(self);
        let pool_size = pool_size.max(1);

        let mut worker_senders = Vec::with_capacity(pool_size);
        let mut worker_tasks = Vec::with_capacity(pool_size);
        for worker_id in 0..pool_size {
            let (tx, mut rx) = mpsc::channel::<PublishJob>(queue_capacity.max(1));
            let worker = Arc::clone(&interceptor);
            worker_senders.push(tx);
            worker_tasks.push(tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    worker.handle_publish(job).await;
                }
                debug!(worker_id, "publish worker drained");
            }));
        }

        let event_task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    SessionEvent::Connected {
                        client_id,
                        peer_addr,
                    } => interceptor.on_connect(&client_id, &peer_addr).await,
                    SessionEvent::Disconnected { client_id } => {
                        interceptor.on_disconnect(&client_id).await
                    }
                    SessionEvent::Published {
                        client_id,
                        topic,
                        payload,
                    } => {
                        let slot = worker_index(&client_id, worker_senders.len());
                        let job = PublishJob {
                            client_id,
                            topic,
                            payload,
                        };
                        if worker_senders[slot].send(job).await.is_err() {
                            error!(slot, "publish worker queue closed, dropping message");
                        }
                    }
                }
            }
            info!("broker event stream closed, stopping interceptor");
        });

        InterceptorHandle {
            event_task,
            worker_tasks,
        }
    }

    // =========================================================================
    // CONNECT / DISCONNECT
    // =========================================================================

    async fn on_connect(&self, client_id: &str, peer_addr: &str) {
        info!(client_id, peer_addr, "connection attempt");

        match identity::classify_client(client_id) {
            ClientClass::Device(parsed) => {
                if let Err(e) = self.connect_device(&parsed, client_id, peer_addr).await {
                    error!(client_id, error = %e, "error processing device connection");
                    self.alert(
                        alerts::CONNECTION_ERROR,
                        client_id,
                        json!({ "error": e.to_string(), "client_id": client_id }),
                    )
                    .await;
                }
            }
            ClientClass::Controller | ClientClass::Admin => {
                debug!(client_id, "operator-side session connected");
            }
            ClientClass::Unknown if client_id.starts_with("IOT") => {
                warn!(client_id, "device clientId does not parse");
                self.alert(
                    alerts::MALFORMED_CLIENT_ID,
                    client_id,
                    json!({ "client_id": client_id, "peer_addr": peer_addr }),
                )
                .await;
            }
            ClientClass::Unknown => {
                debug!(client_id, "unclassified session connected, no role granted");
            }
        }
    }

    async fn connect_device(
        &self,
        parsed: &ParsedClientId,
        client_id: &str,
        peer_addr: &str,
    ) -> Result<(), StoreError> {
        let store = self.authenticator.store();
        let serial_hash = identity::hash(&parsed.serial);

        let device = match store.find_by_serial_hash(&serial_hash).await? {
            Some(device) => device,
            None => {
                // First contact: keep the connection invariant intact by
                // creating the row now. Registration re-keys it with the
                // full MAC.
                info!(serial = %parsed.serial, "unregistered device, creating placeholder row");
                let placeholder = parsed.placeholder_mac();
                store
                    .upsert_device_if_absent(NewDevice {
                        device_type: PLACEHOLDER_DEVICE_TYPE.to_string(),
                        serial_hash: serial_hash.clone(),
                        mac_hash: identity::hash(&placeholder),
                        composite_hash: identity::hash_composite(&parsed.serial, &placeholder),
                        status: DeviceStatus::Pending,
                        is_critical: false,
                    })
                    .await?
            }
        };

        if device.status == DeviceStatus::Blocked {
            warn!(serial = %parsed.serial, "blocked device connected, ACL will starve it");
            return Ok(());
        }

        if let Some(old_connection) = store.find_active_by_device_id(device.id).await? {
            let verdict = self
                .authenticator
                .handle_duplicate(&device, &old_connection, peer_addr)
                .await?;
            match verdict {
                CloneVerdict::AcceptNew => {
                    store
                        .create_connection(device.id, peer_addr, client_id)
                        .await?;
                }
                CloneVerdict::RejectNew => {
                    self.sessions.disconnect(client_id).await;
                }
            }
            return Ok(());
        }

        store
            .create_connection(device.id, peer_addr, client_id)
            .await?;
        info!(serial = %parsed.serial, peer_addr, "device connection registered");
        Ok(())
    }

    async fn on_disconnect(&self, client_id: &str) {
        info!(client_id, "disconnection");

        let ClientClass::Device(parsed) = identity::classify_client(client_id) else {
            debug!(client_id, "non-device disconnect, nothing to close");
            return;
        };

        let store = self.authenticator.store();
        let result: Result<(), StoreError> = async {
            let serial_hash = identity::hash(&parsed.serial);
            let Some(device) = store.find_by_serial_hash(&serial_hash).await? else {
                info!(serial = %parsed.serial, "disconnect for unknown device");
                return Ok(());
            };
            match store.find_active_by_device_id(device.id).await? {
                Some(connection) => {
                    store.close_connection(connection.id).await?;
                    info!(serial = %parsed.serial, "device connection closed");
                }
                None => info!(serial = %parsed.serial, "disconnect without active connection row"),
            }
            Ok(())
        }
        .await;

        if let Err(e) = result {
            error!(client_id, error = %e, "error processing disconnection");
        }
    }

    // =========================================================================
    // PUBLISH
    // =========================================================================

    async fn handle_publish(&self, job: PublishJob) {
        let topic = job.topic.as_str();
        if !topic.starts_with("home/") {
            debug!(topic, "publish outside the hub namespace, ignoring");
            return;
        }

        if topic.ends_with(REGISTER_SUFFIX) {
            self.process_registration(&job.payload).await;
        } else if topic.ends_with(HEALTH_SUFFIX) {
            self.process_health(topic, &job.payload).await;
        } else if topic.ends_with(TELEMETRY_SUFFIX) {
            if let Err(e) = self.ingest.ingest(topic, &job.payload).await {
                error!(topic, error = %e, "telemetry ingest failed");
            }
        } else {
            debug!(topic, client_id = %job.client_id, "publish on unhandled topic tail");
        }
    }

    async fn process_registration(&self, payload: &[u8]) {
        let registration = match parse_registration(payload) {
            Ok(registration) => registration,
            Err(reason) => {
                warn!(reason, "registration rejected");
                self.alert(
                    alerts::REGISTRATION_ERROR,
                    "unknown",
                    json!({ "error": reason }),
                )
                .await;
                return;
            }
        };

        if let Err(e) = self.register_device(&registration).await {
            error!(error = %e, "error processing registration");
            self.alert(
                alerts::REGISTRATION_ERROR,
                &identity::hash(&registration.serial),
                json!({ "error": e.to_string() }),
            )
            .await;
        }
    }

    async fn register_device(&self, registration: &Registration) -> Result<(), StoreError> {
        let store = self.authenticator.store();
        let serial_hash = identity::hash(&registration.serial);
        let mac_hash = identity::hash(&registration.mac);
        let composite_hash = identity::hash_composite(&registration.serial, &registration.mac);

        if store.find_by_composite_hash(&composite_hash).await?.is_some() {
            info!(serial = %registration.serial, "device already registered, keeping status");
            return Ok(());
        }

        let registration_details = json!({
            "device_type": registration.device_type.as_str(),
            "firmware_version": registration.firmware_version.clone(),
            "hardware_version": registration.hardware_version.clone(),
        });

        if let Some(existing) = store.find_by_serial_hash(&serial_hash).await? {
            let placeholder = placeholder_from_mac(&registration.mac);
            if existing.mac_hash == identity::hash(&placeholder) {
                // The row this device created on CONNECT; registration
                // confirms the full MAC.
                store
                    .update_identity(
                        existing.id,
                        registration.device_type.as_str(),
                        &mac_hash,
                        &composite_hash,
                    )
                    .await?;
                self.alert(alerts::DEVICE_REGISTRATION, &serial_hash, registration_details)
                    .await;
                info!(serial = %registration.serial, "placeholder row re-keyed with registered MAC");
                return Ok(());
            }

            if existing.status == DeviceStatus::Approved {
                // Pre-seeded approved unit re-registering with fresh MAC.
                store
                    .upsert_device_if_absent(NewDevice {
                        device_type: registration.device_type.as_str().to_string(),
                        serial_hash,
                        mac_hash,
                        composite_hash,
                        status: DeviceStatus::Approved,
                        is_critical: false,
                    })
                    .await?;
                self.alert(
                    alerts::DEVICE_REGISTRATION,
                    &identity::hash(&registration.serial),
                    registration_details,
                )
                .await;
                info!(serial = %registration.serial, "device auto-approved from pre-seeded row");
                return Ok(());
            }

            // Same serial, different full MAC: the session that created the
            // row is not the unit that registered.
            warn!(serial = %registration.serial, "registration MAC does not match the connecting session");
            self.alert(
                alerts::MAC_MISMATCH,
                &serial_hash,
                json!({
                    "registered_mac_hash": existing.mac_hash.clone(),
                    "received_mac_hash": mac_hash.clone(),
                }),
            )
            .await;
            store.close_all_for_device(existing.id).await?;
        }

        store
            .upsert_device_if_absent(NewDevice {
                device_type: registration.device_type.as_str().to_string(),
                serial_hash: identity::hash(&registration.serial),
                mac_hash,
                composite_hash,
                status: DeviceStatus::Pending,
                is_critical: false,
            })
            .await?;
        self.alert(
            alerts::DEVICE_REGISTRATION,
            &identity::hash(&registration.serial),
            registration_details,
        )
        .await;
        info!(serial = %registration.serial, device_type = %registration.device_type, "new device registered");
        Ok(())
    }

    async fn process_health(&self, topic: &str, payload: &[u8]) {
        let serial = topic.split('/').nth(3).unwrap_or("unknown").to_string();
        let serial_hash = identity::hash(&serial);

        let health = match parse_health(payload) {
            Ok(health) => health,
            Err(reason) => {
                warn!(serial, reason, "health check rejected");
                self.alert(
                    alerts::HEALTH_CHECK_ERROR,
                    &serial_hash,
                    json!({ "error": reason }),
                )
                .await;
                return;
            }
        };

        if !identity::is_valid_mac(&health.mac) {
            warn!(serial, "invalid MAC format in health check");
            self.alert(
                alerts::INVALID_MAC_FORMAT,
                &serial_hash,
                json!({ "reason": "invalid MAC format" }),
            )
            .await;
            return;
        }

        let result = self.apply_health(&serial, &serial_hash, &health).await;
        if let Err(e) = result {
            error!(serial, error = %e, "error processing health check");
            self.alert(
                alerts::HEALTH_CHECK_ERROR,
                &serial_hash,
                json!({ "error": e.to_string() }),
            )
            .await;
        }
    }

    async fn apply_health(
        &self,
        serial: &str,
        serial_hash: &str,
        health: &Health,
    ) -> Result<(), StoreError> {
        let store = self.authenticator.store();
        let composite = identity::hash_composite(serial, &health.mac);
        let claimed_mac_hash = identity::hash(&health.mac);

        let device = match store.find_by_composite_hash(&composite).await? {
            Some(device) => device,
            None => match store.find_by_serial_hash(serial_hash).await? {
                Some(registered) => {
                    // Known serial, wrong MAC: someone is impersonating it.
                    warn!(serial, "MAC mismatch in health check");
                    self.alert(
                        alerts::MAC_MISMATCH,
                        serial_hash,
                        json!({
                            "registered_mac_hash": registered.mac_hash,
                            "received_mac_hash": claimed_mac_hash,
                        }),
                    )
                    .await;
                    return Ok(());
                }
                None => {
                    warn!(serial, "health check from unknown device");
                    self.alert(
                        alerts::DEVICE_NOT_FOUND,
                        serial_hash,
                        json!({ "reason": "no device for health check" }),
                    )
                    .await;
                    return Ok(());
                }
            },
        };

        self.check_clock_drift(serial, serial_hash, &health.timestamp)
            .await;

        if device.status == DeviceStatus::Blocked {
            warn!(serial, "health check rejected from blocked device");
            self.alert(
                alerts::HEALTH_CHECK_REJECTED_BLOCKED,
                serial_hash,
                json!({ "status": "BLOCKED", "reason": "device is blocked" }),
            )
            .await;
            return Ok(());
        }

        if store.find_active_by_device_id(device.id).await?.is_none() {
            warn!(serial, "health check without active connection");
            self.alert(
                alerts::HEALTH_CHECK_REJECTED_NO_CONNECTION,
                serial_hash,
                json!({ "reason": "no active MQTT connection" }),
            )
            .await;
            return Ok(());
        }

        if device.status == DeviceStatus::Approved {
            store.update_last_health_check(device.id).await?;
        } else {
            debug!(serial, status = %device.status, "health from non-approved device, timestamp not advanced");
        }

        debug!(
            serial,
            battery = ?health.battery_level,
            uptime = ?health.uptime,
            "health check processed"
        );
        Ok(())
    }

    async fn check_clock_drift(&self, serial: &str, serial_hash: &str, timestamp: &str) {
        let Some(device_time) = parse_device_timestamp(timestamp) else {
            warn!(serial, timestamp, "invalid timestamp in health check");
            self.alert(
                alerts::INVALID_TIMESTAMP,
                serial_hash,
                json!({ "timestamp": timestamp, "reason": "invalid timestamp format" }),
            )
            .await;
            return;
        };

        let server_time: NaiveDateTime = now();
        let drift_secs = (server_time - device_time).num_seconds().abs();
        if drift_secs > self.drift_limit_secs {
            warn!(serial, drift_secs, "time drift detected");
            self.alert(
                alerts::TIME_DRIFT,
                serial_hash,
                json!({
                    "device_time": timestamp,
                    "server_time": server_time.to_string(),
                    "drift_minutes": drift_secs / 60,
                }),
            )
            .await;
        }
    }

    async fn alert(&self, alert_type: &str, subject: &str, details: serde_json::Value) {
        if let Err(e) = self
            .authenticator
            .store()
            .insert_alert(alert_type, subject, details)
            .await
        {
            error!(alert_type, error = %e, "failed to record alert");
        }
    }
}

fn worker_index(client_id: &str, pool_size: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    client_id.hash(&mut hasher);
    (hasher.finish() % pool_size as u64) as usize
}

/// Placeholder a CONNECT would have produced for this MAC.
fn placeholder_from_mac(mac: &str) -> String {
    let prefix: String = mac
        .chars()
        .take(8)
        .map(|c| if c == '-' { ':' } else { c })
        .collect();
    format!("{prefix}:00:00:00")
}

#[derive(Debug)]
struct Registration {
    serial: String,
    mac: String,
    device_type: DeviceType,
    firmware_version: String,
    hardware_version: String,
}

#[derive(Debug, Deserialize)]
struct RegistrationPayload {
    serial: String,
    mac: String,
    device_type: String,
    firmware_version: Option<String>,
    hardware_version: Option<String>,
}

fn parse_registration(payload: &[u8]) -> Result<Registration, String> {
    let text = std::str::from_utf8(payload).map_err(|_| "payload is not UTF-8".to_string())?;
    let raw: RegistrationPayload =
        serde_json::from_str(text).map_err(|e| format!("invalid registration JSON: {e}"))?;

    if raw.serial.trim().is_empty() {
        return Err("serial number is required".to_string());
    }
    if !identity::is_valid_mac(&raw.mac) {
        return Err(format!("invalid MAC address format: {}", raw.mac));
    }
    let device_type =
        DeviceType::parse(&raw.device_type).map_err(|e| e.to_string())?;

    Ok(Registration {
        serial: raw.serial,
        mac: raw.mac,
        device_type,
        firmware_version: raw.firmware_version.unwrap_or_else(|| "unknown".to_string()),
        hardware_version: raw.hardware_version.unwrap_or_else(|| "unknown".to_string()),
    })
}

#[derive(Debug)]
struct Health {
    mac: String,
    timestamp: String,
    battery_level: Option<i64>,
    uptime: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct HealthPayload {
    mac: String,
    timestamp: String,
    battery_level: Option<i64>,
    uptime: Option<i64>,
}

fn parse_health(payload: &[u8]) -> Result<Health, String> {
    let text = std::str::from_utf8(payload).map_err(|_| "payload is not UTF-8".to_string())?;
    let raw: HealthPayload =
        serde_json::from_str(text).map_err(|e| format!("invalid health JSON: {e}"))?;
    Ok(Health {
        mac: raw.mac,
        timestamp: raw.timestamp,
        battery_level: raw.battery_level,
        uptime: raw.uptime,
    })
}
