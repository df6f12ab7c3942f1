//! Per-topic admission policy.
//!
//! Called by the broker engine for every subscribe and publish attempt.
//! Rules are evaluated top down, first match wins, and the default is deny.
//! Denials that indicate probing record a security alert with a stable tag.

use tracing::{debug, error, warn};

use crate::identity::{self, ClientClass};
use crate::registry::store::RegistryStore;
use crate::registry::{alerts, DeviceStatus};

const REGISTER_SUFFIX: &str = "/register";
const HEALTH_SUFFIX: &str = "/health";
const TELEMETRY_SUFFIX: &str = "/telemetry";
const CMD_SUFFIX: &str = "/cmd";

#[derive(Clone)]
pub struct TopicAcl {
    store: RegistryStore,
    controller_id: String,
}

impl TopicAcl {
    pub fn new(store: RegistryStore, controller_id: impl Into<String>) -> Self {
        Self {
            store,
            controller_id: controller_id.into(),
        }
    }

    fn device_topic_prefix(&self) -> String {
        format!("home/{}/devices/", self.controller_id)
    }

    /// May `client` publish to `topic`?
    pub async fn can_write(
        &self,
        topic: Option<&str>,
        _user: Option<&str>,
        client: Option<&str>,
    ) -> bool {
        let (Some(topic), Some(client)) = (topic, client) else {
            return false;
        };

        match identity::classify_client(client) {
            ClientClass::Controller | ClientClass::Admin => true,
            ClientClass::Device(parsed) => {
                self.device_can_write(topic, client, &parsed.serial).await
            }
            ClientClass::Unknown => false,
        }
    }

    /// May `client` subscribe to `topic`?
    pub async fn can_read(
        &self,
        topic: Option<&str>,
        _user: Option<&str>,
        client: Option<&str>,
    ) -> bool {
        let (Some(topic), Some(client)) = (topic, client) else {
            return false;
        };

        let class = identity::classify_client(client);

        // Multi-level wildcards expose the whole topic space; operators only.
        if topic.contains('#') {
            if matches!(class, ClientClass::Admin) {
                return true;
            }
            warn!(client, topic, "wildcard subscribe denied");
            self.record_denial(alerts::ACL_WILDCARD_SUBSCRIBE, client, topic, None)
                .await;
            return false;
        }

        match class {
            ClientClass::Controller | ClientClass::Admin => true,
            ClientClass::Device(parsed) => self.device_can_read(topic, client, &parsed.serial).await,
            ClientClass::Unknown => false,
        }
    }

    async fn device_can_write(&self, topic: &str, client: &str, _client_serial: &str) -> bool {
        if topic.ends_with(CMD_SUFFIX) {
            warn!(client, topic, "device attempted to write to a command topic");
            self.record_denial(alerts::ACL_DEVICE_CMD_WRITE, client, topic, None)
                .await;
            return false;
        }

        let prefix = self.device_topic_prefix();
        if !topic.starts_with(&prefix)
            || !(topic.ends_with(TELEMETRY_SUFFIX)
                || topic.ends_with(REGISTER_SUFFIX)
                || topic.ends_with(HEALTH_SUFFIX))
        {
            debug!(client, topic, "device publish outside its namespace denied");
            return false;
        }

        let Some(topic_serial) = topic_serial(topic) else {
            return false;
        };

        // Registration must be possible before a row exists.
        if topic.ends_with(REGISTER_SUFFIX) {
            return self.serial_tail_matches(client, topic_serial, topic).await;
        }

        let serial_hash = identity::hash(topic_serial);
        let device = match self.store.find_by_serial_hash(&serial_hash).await {
            Ok(Some(device)) => device,
            Ok(None) => {
                warn!(client, topic, "publish for unregistered device denied");
                self.record_denial(
                    alerts::ACL_UNAPPROVED_PUBLISH,
                    client,
                    topic,
                    Some(&serial_hash),
                )
                .await;
                return false;
            }
            Err(e) => {
                error!(client, topic, error = %e, "device lookup failed during publish check");
                return false;
            }
        };

        if device.status != DeviceStatus::Approved {
            warn!(client, topic, status = %device.status, "non-approved device publish denied");
            self.record_denial(
                alerts::ACL_UNAPPROVED_PUBLISH,
                client,
                topic,
                Some(&serial_hash),
            )
            .await;
            return false;
        }

        self.serial_tail_matches(client, topic_serial, topic).await
    }

    async fn device_can_read(&self, topic: &str, client: &str, _client_serial: &str) -> bool {
        let prefix = self.device_topic_prefix();
        if !topic.starts_with(&prefix) || !topic.ends_with(CMD_SUFFIX) {
            debug!(client, topic, "device subscribe outside its command topic denied");
            return false;
        }
        let Some(topic_serial) = topic_serial(topic) else {
            return false;
        };
        if !self.serial_tail_matches(client, topic_serial, topic).await {
            return false;
        }

        let serial_hash = identity::hash(topic_serial);
        match self.store.find_by_serial_hash(&serial_hash).await {
            Ok(Some(device)) => device.status == DeviceStatus::Approved,
            Ok(None) => false,
            Err(e) => {
                error!(client, topic, error = %e, "device lookup failed during subscribe check");
                false
            }
        }
    }

    /// Best-effort check that the 4-digit tail encoded in the clientId matches
    /// the serial in the topic. Ids too short to carry a tail are skipped.
    async fn serial_tail_matches(&self, client: &str, topic_serial: &str, topic: &str) -> bool {
        let (Some(client_tail), Some(serial_tail)) = (
            client.get(3..7),
            topic_serial
                .len()
                .checked_sub(4)
                .and_then(|start| topic_serial.get(start..)),
        ) else {
            return true;
        };
        if client_tail == serial_tail {
            return true;
        }
        warn!(client, topic, "clientId serial tail does not match topic serial");
        self.record_denial(alerts::ACL_SERIAL_MISMATCH, client, topic, None)
            .await;
        false
    }

    async fn record_denial(
        &self,
        alert_type: &str,
        client: &str,
        topic: &str,
        serial_hash: Option<&str>,
    ) {
        let subject = serial_hash.unwrap_or(client);
        let details = serde_json::json!({ "client": client, "topic": topic });
        if let Err(e) = self.store.insert_alert(alert_type, subject, details).await {
            error!(alert_type, error = %e, "failed to record ACL alert");
        }
    }
}

/// Serial segment of `home/<controllerId>/devices/<serial>/<leaf>`.
fn topic_serial(topic: &str) -> Option<&str> {
    let mut parts = topic.split('/');
    let (home, _controller, devices, serial) =
        (parts.next()?, parts.next()?, parts.next()?, parts.next()?);
    if home != "home" || devices != "devices" || serial.is_empty() {
        return None;
    }
    Some(serial)
}
