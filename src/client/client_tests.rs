//! Tests for device client topics, payloads and QoS mapping.

use super::*;
use crate::identity::{DeviceIdentity, DeviceType};

fn identity(device_type: DeviceType) -> DeviceIdentity {
    DeviceIdentity::new("IOT-2025-0001", "AA:BB:CC:DD:EE:FF", device_type).unwrap()
}

#[test]
fn topic_set_matches_the_hub_namespace() {
    let topics = DeviceTopics::new("controller-01", "IOT-2025-0001");
    assert_eq!(
        topics.register,
        "home/controller-01/devices/IOT-2025-0001/register"
    );
    assert_eq!(
        topics.health,
        "home/controller-01/devices/IOT-2025-0001/health"
    );
    assert_eq!(
        topics.telemetry,
        "home/controller-01/devices/IOT-2025-0001/telemetry"
    );
    assert_eq!(topics.cmd, "home/controller-01/devices/IOT-2025-0001/cmd");
    assert_eq!(
        topics.offline,
        "home/controller-01/devices/IOT-2025-0001/offline"
    );
}

#[test]
fn telemetry_qos_by_device_class() {
    assert_eq!(telemetry_qos(&identity(DeviceType::TempSensor)), QoS::AtMostOnce);
    assert_eq!(telemetry_qos(&identity(DeviceType::EnergySensor)), QoS::AtMostOnce);
    assert_eq!(telemetry_qos(&identity(DeviceType::SmartPlug)), QoS::AtLeastOnce);
    assert_eq!(telemetry_qos(&identity(DeviceType::SmartSwitch)), QoS::AtLeastOnce);
}

#[test]
fn will_payload_names_serial_and_reason() {
    let payload: serde_json::Value =
        serde_json::from_str(&will_payload("IOT-2025-0001")).unwrap();
    assert_eq!(payload["serial"], "IOT-2025-0001");
    assert_eq!(payload["reason"], "connection_lost");
}

#[test]
fn health_payload_shape() {
    let reading = HealthReading {
        battery_level: Some(87),
        uptime_secs: 12345,
    };
    let payload: serde_json::Value =
        serde_json::from_str(&health_payload(&identity(DeviceType::TempSensor), reading)).unwrap();

    assert_eq!(payload["serial"], "IOT-2025-0001");
    assert_eq!(payload["mac"], "AA:BB:CC:DD:EE:FF");
    assert_eq!(payload["battery_level"], 87);
    assert_eq!(payload["uptime"], 12345);
    // ISO local datetime, parseable by the hub side.
    let ts = payload["timestamp"].as_str().unwrap();
    assert!(ts.parse::<chrono::NaiveDateTime>().is_ok());
}

#[test]
fn health_payload_omits_unknown_battery() {
    let reading = HealthReading {
        battery_level: None,
        uptime_secs: 1,
    };
    let payload: serde_json::Value =
        serde_json::from_str(&health_payload(&identity(DeviceType::TempSensor), reading)).unwrap();
    assert!(payload.get("battery_level").is_none());
}

#[tokio::test]
async fn builder_requires_identity_and_key_material() {
    let err = SecureDeviceClientBuilder::new().connect().await;
    assert!(matches!(err, Err(ClientError::MissingIdentity)));

    let err = SecureDeviceClientBuilder::new()
        .identity(identity(DeviceType::TempSensor))
        .connect()
        .await;
    assert!(matches!(err, Err(ClientError::MissingKeyMaterial)));
}

#[tokio::test]
async fn builder_surfaces_unreadable_key_material() {
    let err = SecureDeviceClientBuilder::new()
        .identity(identity(DeviceType::TempSensor))
        .key_material(
            "/nonexistent/cert.pem",
            "/nonexistent/key.pem",
            "/nonexistent/ca.pem",
        )
        .connect()
        .await;
    assert!(matches!(err, Err(ClientError::Io { .. })));
}
