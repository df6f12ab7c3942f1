//! Tests for device validation and the clone policy table.

use super::authenticator::{CloneVerdict, DeviceAuthenticator, ValidationOutcome};
use crate::identity;
use crate::registry::store::RegistryStore;
use crate::registry::{alerts, Device, DeviceStatus, NewDevice};

const SERIAL: &str = "IOT-2025-0001";
const MAC: &str = "AA:BB:CC:DD:EE:FF";

async fn setup(status: DeviceStatus, critical: bool) -> (DeviceAuthenticator, RegistryStore, Device) {
    let store = RegistryStore::open_in_memory().await.unwrap();
    let device = store
        .upsert_device_if_absent(NewDevice {
            device_type: "TEMP_SENSOR".to_string(),
            serial_hash: identity::hash(SERIAL),
            mac_hash: identity::hash(MAC),
            composite_hash: identity::hash_composite(SERIAL, MAC),
            status,
            is_critical: critical,
        })
        .await
        .unwrap();
    (DeviceAuthenticator::new(store.clone()), store, device)
}

#[tokio::test]
async fn validation_outcomes() {
    let (auth, store, device) = setup(DeviceStatus::Pending, false).await;

    assert_eq!(
        auth.validate_device(SERIAL, MAC).await.unwrap(),
        ValidationOutcome::Pending
    );

    store
        .update_status(device.id, DeviceStatus::Approved, "alice")
        .await
        .unwrap();
    assert_eq!(
        auth.validate_device(SERIAL, MAC).await.unwrap(),
        ValidationOutcome::Valid
    );

    store
        .update_status(device.id, DeviceStatus::Blocked, "SYSTEM")
        .await
        .unwrap();
    assert_eq!(
        auth.validate_device(SERIAL, MAC).await.unwrap(),
        ValidationOutcome::Blocked
    );

    store
        .update_status(device.id, DeviceStatus::Rejected, "alice")
        .await
        .unwrap();
    assert_eq!(
        auth.validate_device(SERIAL, MAC).await.unwrap(),
        ValidationOutcome::InvalidStatus(DeviceStatus::Rejected)
    );

    assert_eq!(
        auth.validate_device("IOT-2025-9999", MAC).await.unwrap(),
        ValidationOutcome::NotFound
    );
}

#[tokio::test]
async fn duplicate_lookup() {
    let (auth, store, device) = setup(DeviceStatus::Approved, false).await;
    assert!(auth
        .check_duplicate_connection(device.id)
        .await
        .unwrap()
        .is_none());

    store
        .create_connection(device.id, "10.0.0.7", "IOT0001AABBCC")
        .await
        .unwrap();
    assert!(auth
        .check_duplicate_connection(device.id)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn same_address_is_a_reconnection() {
    let (auth, store, device) = setup(DeviceStatus::Approved, false).await;
    let old = store
        .create_connection(device.id, "10.0.0.7", "IOT0001AABBCC")
        .await
        .unwrap();

    let verdict = auth
        .handle_duplicate(&device, &old, "10.0.0.7")
        .await
        .unwrap();
    assert_eq!(verdict, CloneVerdict::AcceptNew);

    // Old session closed, status untouched.
    assert!(store
        .find_active_by_device_id(device.id)
        .await
        .unwrap()
        .is_none());
    assert_eq!(
        store.find_by_id(device.id).await.unwrap().unwrap().status,
        DeviceStatus::Approved
    );

    let events = store
        .find_alerts_by_type(alerts::DEVICE_RECONNECTION)
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    let details: serde_json::Value =
        serde_json::from_str(events[0].details.as_deref().unwrap()).unwrap();
    assert_eq!(details["action_taken"], "CLOSED_OLD_ALLOWED_NEW");
    assert_eq!(details["old_addr"], "10.0.0.7");
    assert_eq!(details["new_addr"], "10.0.0.7");
}

#[tokio::test]
async fn critical_device_keeps_incumbent() {
    let (auth, store, device) = setup(DeviceStatus::Approved, true).await;
    let old = store
        .create_connection(device.id, "10.0.0.7", "IOT0001AABBCC")
        .await
        .unwrap();

    let verdict = auth
        .handle_duplicate(&device, &old, "10.0.0.66")
        .await
        .unwrap();
    assert_eq!(verdict, CloneVerdict::RejectNew);

    // Incumbent stays, status unchanged.
    let active = store
        .find_active_by_device_id(device.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(active.id, old.id);
    assert_eq!(
        store.find_by_id(device.id).await.unwrap().unwrap().status,
        DeviceStatus::Approved
    );

    let events = store
        .find_alerts_by_type(alerts::CRITICAL_DEVICE_CLONE_ATTEMPT)
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    let details: serde_json::Value =
        serde_json::from_str(events[0].details.as_deref().unwrap()).unwrap();
    assert_eq!(details["action_taken"], "REJECTED_NEW_KEPT_OLD");
    assert_eq!(details["critical"], true);
}

#[tokio::test]
async fn non_critical_clone_blocks_device() {
    let (auth, store, device) = setup(DeviceStatus::Approved, false).await;
    let old = store
        .create_connection(device.id, "10.0.0.7", "IOT0001AABBCC")
        .await
        .unwrap();

    let verdict = auth
        .handle_duplicate(&device, &old, "10.0.0.66")
        .await
        .unwrap();
    assert_eq!(verdict, CloneVerdict::RejectNew);

    assert!(store
        .find_active_by_device_id(device.id)
        .await
        .unwrap()
        .is_none());
    assert_eq!(
        store.find_by_id(device.id).await.unwrap().unwrap().status,
        DeviceStatus::Blocked
    );

    let events = store
        .find_alerts_by_type(alerts::DEVICE_CLONE_DETECTED)
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    let details: serde_json::Value =
        serde_json::from_str(events[0].details.as_deref().unwrap()).unwrap();
    assert_eq!(details["action_taken"], "BLOCKED_DEVICE_DISCONNECTED_BOTH");
    assert_eq!(details["old_addr"], "10.0.0.7");
    assert_eq!(details["new_addr"], "10.0.0.66");
}
