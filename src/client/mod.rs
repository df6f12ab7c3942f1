//! # Device Client SDK
//!
//! ## Why This Module Exists
//! This is the device side of the hub's contract: a TLS MQTT client that
//! authenticates with its own certificate, announces itself on `/register`,
//! reports on `/health` at a fixed cadence, streams measurements on
//! `/telemetry` and listens on its own `/cmd` topic. Firmware links this
//! module and provides nothing but its identity, key material and a command
//! callback.
//!
//! ## Connection Behavior
//! The rumqttc event loop reconnects on its own; the driver task keeps
//! polling through errors with a short backoff. Every successful CONNACK
//! re-publishes the registration, which the hub treats as idempotent. A
//! last-will message on `/offline` lets the hub see unclean exits.

use chrono::Local;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::identity::{DeviceIdentity, CONTROLLER_CLIENT_ID};

const DEFAULT_PORT: u16 = 8884;
const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;
const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 60;
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("device identity is required")]
    MissingIdentity,

    #[error("key material paths are required")]
    MissingKeyMaterial,

    #[error("mqtt request failed: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
}

/// Topic set of one device under one controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTopics {
    pub register: String,
    pub health: String,
    pub telemetry: String,
    pub cmd: String,
    pub offline: String,
}

impl DeviceTopics {
    pub fn new(controller_id: &str, serial: &str) -> Self {
        let base = format!("home/{controller_id}/devices/{serial}");
        Self {
            register: format!("{base}/register"),
            health: format!("{base}/health"),
            telemetry: format!("{base}/telemetry"),
            cmd: format!("{base}/cmd"),
            offline: format!("{base}/offline"),
        }
    }
}

/// One health sample as the device sees itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthReading {
    pub battery_level: Option<i64>,
    pub uptime_secs: u64,
}

type CommandHandler = Arc<dyn Fn(String, Vec<u8>) + Send + Sync>;
type HealthSource = Arc<dyn Fn() -> HealthReading + Send + Sync>;

pub struct SecureDeviceClientBuilder {
    host: String,
    port: u16,
    controller_id: String,
    identity: Option<DeviceIdentity>,
    client_id_suffix: Option<String>,
    cert_path: Option<PathBuf>,
    key_path: Option<PathBuf>,
    ca_path: Option<PathBuf>,
    clean_session: bool,
    keep_alive_secs: u64,
    health_interval_secs: u64,
    command_handler: Option<CommandHandler>,
    health_source: Option<HealthSource>,
}

impl SecureDeviceClientBuilder {
    pub fn new() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            controller_id: "controller-01".to_string(),
            identity: None,
            client_id_suffix: None,
            cert_path: None,
            key_path: None,
            ca_path: None,
            clean_session: true,
            keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
            health_interval_secs: DEFAULT_HEALTH_INTERVAL_SECS,
            command_handler: None,
            health_source: None,
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn controller_id(mut self, controller_id: impl Into<String>) -> Self {
        self.controller_id = controller_id.into();
        self
    }

    pub fn identity(mut self, identity: DeviceIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Distinguishes auxiliary sessions of the same unit.
    pub fn client_id_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.client_id_suffix = Some(suffix.into());
        self
    }

    pub fn key_material(
        mut self,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
        ca_path: impl Into<PathBuf>,
    ) -> Self {
        self.cert_path = Some(cert_path.into());
        self.key_path = Some(key_path.into());
        self.ca_path = Some(ca_path.into());
        self
    }

    pub fn clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    pub fn keep_alive_secs(mut self, secs: u64) -> Self {
        self.keep_alive_secs = secs;
        self
    }

    pub fn health_interval_secs(mut self, secs: u64) -> Self {
        self.health_interval_secs = secs;
        self
    }

    /// Callback for controller commands, registered before the connection
    /// opens so no command can slip past.
    pub fn on_command(mut self, handler: impl Fn(String, Vec<u8>) + Send + Sync + 'static) -> Self {
        self.command_handler = Some(Arc::new(handler));
        self
    }

    /// Source for battery/uptime readings; defaults to process uptime and no
    /// battery value.
    pub fn health_source(
        mut self,
        source: impl Fn() -> HealthReading + Send + Sync + 'static,
    ) -> Self {
        self.health_source = Some(Arc::new(source));
        self
    }

    /// Opens the connection and starts the event-loop driver task.
    pub async fn connect(self) -> Result<SecureDeviceClient, ClientError> {
        let identity = self.identity.ok_or(ClientError::MissingIdentity)?;
        let (Some(cert_path), Some(key_path), Some(ca_path)) =
            (self.cert_path, self.key_path, self.ca_path)
        else {
            return Err(ClientError::MissingKeyMaterial);
        };

        let client_id = match &self.client_id_suffix {
            Some(suffix) => identity.client_id_with_suffix(suffix),
            None => identity.client_id(),
        };
        let topics = DeviceTopics::new(&self.controller_id, &identity.serial);

        let ca = read_pem(&ca_path)?;
        let cert = read_pem(&cert_path)?;
        let key = read_pem(&key_path)?;

        let mut options = MqttOptions::new(client_id.clone(), self.host.clone(), self.port);
        options
            .set_keep_alive(Duration::from_secs(self.keep_alive_secs))
            .set_clean_session(self.clean_session)
            .set_transport(Transport::Tls(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth: Some((cert, key)),
            }))
            .set_last_will(LastWill::new(
                topics.offline.as_str(),
                will_payload(&identity.serial),
                QoS::AtLeastOnce,
                false,
            ));

        info!(client_id, host = %self.host, port = self.port, "connecting device client");
        let (client, mut eventloop) = AsyncClient::new(options, 10);

        let driver = {
            let client = client.clone();
            let identity = identity.clone();
            let topics = topics.clone();
            let handler = self.command_handler.clone();
            tokio::spawn(async move {
                loop {
                    match eventloop.poll().await {
                        Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                            if ack.code == rumqttc::ConnectReturnCode::Success {
                                info!(serial = %identity.serial, "connected, announcing registration");
                                if let Err(e) = send_registration(&client, &identity, &topics).await
                                {
                                    error!(error = %e, "registration publish failed");
                                }
                                if handler.is_some() {
                                    if let Err(e) = client
                                        .subscribe(topics.cmd.as_str(), QoS::ExactlyOnce)
                                        .await
                                    {
                                        error!(error = %e, "command subscribe failed");
                                    }
                                }
                            } else {
                                warn!(code = ?ack.code, "broker refused connection");
                            }
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            if publish.topic == topics.cmd {
                                if let Some(handler) = &handler {
                                    handler(publish.topic.clone(), publish.payload.to_vec());
                                }
                            } else {
                                debug!(topic = %publish.topic, "unexpected inbound publish");
                            }
                        }
                        Ok(Event::Incoming(Packet::Disconnect)) => {
                            info!("driver stopping after disconnect");
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = %e, "connection error, retrying");
                            tokio::time::sleep(RECONNECT_BACKOFF).await;
                        }
                    }
                }
            })
        };

        Ok(SecureDeviceClient {
            client,
            identity,
            topics,
            health_interval: Duration::from_secs(self.health_interval_secs),
            health_source: self
                .health_source
                .unwrap_or_else(|| default_health_source()),
            driver,
            health_task: None,
        })
    }
}

impl Default for SecureDeviceClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SecureDeviceClient {
    client: AsyncClient,
    identity: DeviceIdentity,
    topics: DeviceTopics,
    health_interval: Duration,
    health_source: HealthSource,
    driver: JoinHandle<()>,
    health_task: Option<JoinHandle<()>>,
}

impl SecureDeviceClient {
    pub fn builder() -> SecureDeviceClientBuilder {
        SecureDeviceClientBuilder::new()
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn topics(&self) -> &DeviceTopics {
        &self.topics
    }

    /// Sensors report fire-and-forget, actuators at least once.
    pub async fn publish_telemetry(&self, payload: &[u8]) -> Result<(), ClientError> {
        let qos = telemetry_qos(&self.identity);
        self.client
            .publish(self.topics.telemetry.as_str(), qos, false, payload.to_vec())
            .await?;
        debug!(topic = %self.topics.telemetry, "telemetry published");
        Ok(())
    }

    /// Starts the periodic health reporter. Repeated calls keep the first
    /// loop.
    pub fn start_health_loop(&mut self) {
        if self.health_task.is_some() {
            warn!("health loop already running");
            return;
        }
        let client = self.client.clone();
        let identity = self.identity.clone();
        let topic = self.topics.health.clone();
        let source = Arc::clone(&self.health_source);
        let interval = self.health_interval;

        self.health_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let payload = health_payload(&identity, source());
                if let Err(e) = client
                    .publish(topic.as_str(), QoS::AtLeastOnce, false, payload)
                    .await
                {
                    error!(error = %e, "health publish failed");
                }
            }
        }));
        info!(interval_secs = interval.as_secs(), "health loop started");
    }

    /// Stops the health loop and disconnects cleanly.
    pub async fn close(mut self) {
        if let Some(task) = self.health_task.take() {
            task.abort();
        }
        if let Err(e) = self.client.disconnect().await {
            warn!(error = %e, "disconnect failed");
        }
        self.driver.abort();
        info!(serial = %self.identity.serial, "device client closed");
    }
}

/// Publishes a command to one device. The hub's controller session is the
/// only client allowed to do this; delivery is exactly-once.
pub async fn publish_command(
    client: &AsyncClient,
    controller_id: &str,
    serial: &str,
    payload: &[u8],
) -> Result<(), ClientError> {
    let topics = DeviceTopics::new(controller_id, serial);
    client
        .publish(topics.cmd.as_str(), QoS::ExactlyOnce, false, payload.to_vec())
        .await?;
    Ok(())
}

/// Options for the controller-side command session (`controller-cmd`).
pub fn controller_options(host: &str, port: u16, ca: Vec<u8>, client_auth: (Vec<u8>, Vec<u8>)) -> MqttOptions {
    let mut options = MqttOptions::new(CONTROLLER_CLIENT_ID, host, port);
    options
        .set_keep_alive(Duration::from_secs(DEFAULT_KEEP_ALIVE_SECS))
        .set_transport(Transport::Tls(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth: Some(client_auth),
        }));
    options
}

pub(crate) fn telemetry_qos(identity: &DeviceIdentity) -> QoS {
    if identity.device_type.is_actuator() {
        QoS::AtLeastOnce
    } else {
        QoS::AtMostOnce
    }
}

pub(crate) fn will_payload(serial: &str) -> String {
    json!({ "serial": serial, "reason": "connection_lost" }).to_string()
}

pub(crate) fn health_payload(identity: &DeviceIdentity, reading: HealthReading) -> String {
    let mut payload = json!({
        "serial": identity.serial.clone(),
        "mac": identity.mac.clone(),
        "timestamp": Local::now().naive_local().format("%Y-%m-%dT%H:%M:%S").to_string(),
        "uptime": reading.uptime_secs,
    });
    if let Some(battery) = reading.battery_level {
        payload["battery_level"] = json!(battery);
    }
    payload.to_string()
}

async fn send_registration(
    client: &AsyncClient,
    identity: &DeviceIdentity,
    topics: &DeviceTopics,
) -> Result<(), rumqttc::ClientError> {
    let payload = json!({
        "serial": identity.serial.clone(),
        "mac": identity.mac.clone(),
        "device_type": identity.device_type.as_str(),
    })
    .to_string();
    client
        .publish(topics.register.as_str(), QoS::AtLeastOnce, false, payload)
        .await
}

fn default_health_source() -> HealthSource {
    let started = Instant::now();
    Arc::new(move || HealthReading {
        battery_level: None,
        uptime_secs: started.elapsed().as_secs(),
    })
}

fn read_pem(path: &Path) -> Result<Vec<u8>, ClientError> {
    std::fs::read(path).map_err(|source| ClientError::Io {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod client_tests;
