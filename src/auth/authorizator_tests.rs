//! Tests for the topic ACL rules.

use super::authorizator::TopicAcl;
use crate::identity;
use crate::registry::store::RegistryStore;
use crate::registry::{alerts, DeviceStatus, NewDevice};

const SERIAL: &str = "IOT-2025-0001";
const MAC: &str = "AA:BB:CC:DD:EE:FF";
const CLIENT: &str = "IOT0001AABBCC";

fn topic(leaf: &str) -> String {
    format!("home/controller-01/devices/{SERIAL}/{leaf}")
}

async fn setup(status: DeviceStatus) -> (TopicAcl, RegistryStore) {
    let store = RegistryStore::open_in_memory().await.unwrap();
    store
        .upsert_device_if_absent(NewDevice {
            device_type: "TEMP_SENSOR".to_string(),
            serial_hash: identity::hash(SERIAL),
            mac_hash: identity::hash(MAC),
            composite_hash: identity::hash_composite(SERIAL, MAC),
            status,
            is_critical: false,
        })
        .await
        .unwrap();
    (TopicAcl::new(store.clone(), "controller-01"), store)
}

#[tokio::test]
async fn null_inputs_deny() {
    let (acl, _store) = setup(DeviceStatus::Approved).await;
    assert!(!acl.can_write(None, None, Some(CLIENT)).await);
    assert!(!acl.can_write(Some(&topic("telemetry")), None, None).await);
    assert!(!acl.can_read(None, None, Some(CLIENT)).await);
    assert!(!acl.can_read(Some(&topic("cmd")), None, None).await);
}

#[tokio::test]
async fn controller_and_admin_have_full_access() {
    let (acl, _store) = setup(DeviceStatus::Approved).await;
    for client in ["controller-cmd", "ADMIN_console"] {
        assert!(acl.can_write(Some(&topic("cmd")), None, Some(client)).await);
        assert!(acl
            .can_read(Some(&topic("telemetry")), None, Some(client))
            .await);
    }
}

#[tokio::test]
async fn wildcard_subscribe_admins_only() {
    let (acl, store) = setup(DeviceStatus::Approved).await;

    assert!(acl.can_read(Some("#"), None, Some("ADMIN_console")).await);
    assert!(!acl.can_read(Some("#"), None, Some(CLIENT)).await);
    assert!(!acl.can_read(Some("#"), None, Some("controller-cmd")).await);
    assert!(!acl.can_read(Some("home/#"), None, Some(CLIENT)).await);

    let events = store
        .find_alerts_by_type(alerts::ACL_WILDCARD_SUBSCRIBE)
        .await
        .unwrap();
    assert_eq!(events.len(), 3);
}

#[tokio::test]
async fn approved_device_may_publish_its_own_topics() {
    let (acl, _store) = setup(DeviceStatus::Approved).await;
    for leaf in ["telemetry", "register", "health"] {
        assert!(
            acl.can_write(Some(&topic(leaf)), None, Some(CLIENT)).await,
            "expected write to {leaf} to be allowed"
        );
    }
}

#[tokio::test]
async fn device_cmd_write_always_denied() {
    let (acl, store) = setup(DeviceStatus::Approved).await;
    assert!(!acl.can_write(Some(&topic("cmd")), None, Some(CLIENT)).await);

    let events = store
        .find_alerts_by_type(alerts::ACL_DEVICE_CMD_WRITE)
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn unapproved_device_cannot_publish() {
    for status in [DeviceStatus::Pending, DeviceStatus::Blocked, DeviceStatus::Rejected] {
        let (acl, store) = setup(status).await;
        assert!(
            !acl.can_write(Some(&topic("telemetry")), None, Some(CLIENT))
                .await,
            "status {status} must not publish"
        );
        let events = store
            .find_alerts_by_type(alerts::ACL_UNAPPROVED_PUBLISH)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }
}

#[tokio::test]
async fn register_is_allowed_before_the_device_exists() {
    let store = RegistryStore::open_in_memory().await.unwrap();
    let acl = TopicAcl::new(store, "controller-01");
    assert!(acl.can_write(Some(&topic("register")), None, Some(CLIENT)).await);
    assert!(!acl
        .can_write(Some(&topic("telemetry")), None, Some(CLIENT))
        .await);
}

#[tokio::test]
async fn serial_tail_mismatch_denies() {
    let (acl, store) = setup(DeviceStatus::Approved).await;
    // A second approved device; the first client tries to use its topic.
    store
        .upsert_device_if_absent(NewDevice {
            device_type: "TEMP_SENSOR".to_string(),
            serial_hash: identity::hash("IOT-2025-0002"),
            mac_hash: identity::hash("11:22:33:44:55:66"),
            composite_hash: identity::hash_composite("IOT-2025-0002", "11:22:33:44:55:66"),
            status: DeviceStatus::Approved,
            is_critical: false,
        })
        .await
        .unwrap();

    let foreign = "home/controller-01/devices/IOT-2025-0002/telemetry";
    assert!(!acl.can_write(Some(foreign), None, Some(CLIENT)).await);

    let events = store
        .find_alerts_by_type(alerts::ACL_SERIAL_MISMATCH)
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn publish_for_unregistered_device_denied() {
    let (acl, store) = setup(DeviceStatus::Approved).await;
    let foreign = "home/controller-01/devices/IOT-2025-0003/telemetry";
    assert!(!acl.can_write(Some(foreign), None, Some("IOT0003112233")).await);

    let events = store
        .find_alerts_by_type(alerts::ACL_UNAPPROVED_PUBLISH)
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn device_publish_outside_namespace_denied() {
    let (acl, _store) = setup(DeviceStatus::Approved).await;
    assert!(!acl
        .can_write(Some("factory/other/devices/IOT-2025-0001/telemetry"), None, Some(CLIENT))
        .await);
    assert!(
        !acl.can_write(
            Some("home/controller-02/devices/IOT-2025-0001/telemetry"),
            None,
            Some(CLIENT)
        )
        .await
    );
    assert!(!acl
        .can_write(Some(&topic("firmware")), None, Some(CLIENT))
        .await);
}

#[tokio::test]
async fn device_subscribe_rules() {
    let (acl, _store) = setup(DeviceStatus::Approved).await;

    assert!(acl.can_read(Some(&topic("cmd")), None, Some(CLIENT)).await);
    assert!(!acl
        .can_read(Some(&topic("telemetry")), None, Some(CLIENT))
        .await);
    assert!(
        !acl.can_read(
            Some("home/controller-01/devices/IOT-2025-0002/cmd"),
            None,
            Some(CLIENT)
        )
        .await
    );

    let (acl, _store) = setup(DeviceStatus::Pending).await;
    assert!(!acl.can_read(Some(&topic("cmd")), None, Some(CLIENT)).await);
}

#[tokio::test]
async fn unknown_clients_are_denied() {
    let (acl, _store) = setup(DeviceStatus::Approved).await;
    assert!(!acl
        .can_write(Some(&topic("telemetry")), None, Some("random-visitor"))
        .await);
    assert!(!acl
        .can_read(Some(&topic("cmd")), None, Some("random-visitor"))
        .await);
    // Malformed device id falls back to the unknown class.
    assert!(!acl
        .can_write(Some(&topic("telemetry")), None, Some("IOT01"))
        .await);
}
