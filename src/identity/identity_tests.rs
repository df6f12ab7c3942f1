//! Tests for identity hashing and clientId parsing.

use super::*;

#[test]
fn hash_is_stable_and_hex() {
    let a = hash("IOT-2025-0001");
    let b = hash("IOT-2025-0001");
    assert_eq!(a, b);
    assert_eq!(a.len(), 64);
    assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn composite_matches_manual_concatenation() {
    let serial = "IOT-2025-0001";
    let mac = "AA:BB:CC:DD:EE:FF";
    assert_eq!(
        hash_composite(serial, mac),
        hash(&format!("{}|{}", serial, mac))
    );
}

#[test]
fn known_sha256_vector() {
    // SHA-256("abc")
    assert_eq!(
        hash("abc"),
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
}

#[test]
fn mac_validation_accepts_both_separators() {
    assert!(is_valid_mac("AA:BB:CC:DD:EE:FF"));
    assert!(is_valid_mac("aa-bb-cc-dd-ee-ff"));
    assert!(!is_valid_mac("AA:BB:CC:DD:EE"));
    assert!(!is_valid_mac("AA:BB:CC:DD:EE:GG"));
    assert!(!is_valid_mac("AABBCCDDEEFF"));
    assert!(!is_valid_mac(""));
}

#[test]
fn client_id_derivation() {
    let identity =
        DeviceIdentity::new("IOT-2025-0001", "AA:BB:CC:DD:EE:FF", DeviceType::TempSensor).unwrap();
    assert_eq!(identity.client_id(), "IOT0001AABBCC");
    assert_eq!(identity.client_id_with_suffix("-aux"), "IOT0001AABBCC-aux");
}

#[test]
fn parse_client_id_roundtrip() {
    let parsed = parse_client_id("IOT0001AABBCC").unwrap();
    assert_eq!(parsed.serial, "IOT-2025-0001");
    assert_eq!(parsed.mac_prefix, "AA:BB:CC");
    assert_eq!(parsed.placeholder_mac(), "AA:BB:CC:00:00:00");
}

#[test]
fn parse_client_id_allows_suffix() {
    let parsed = parse_client_id("IOT0001AABBCC-backup").unwrap();
    assert_eq!(parsed.serial, "IOT-2025-0001");
}

#[test]
fn parse_client_id_rejects_short_and_malformed() {
    assert!(parse_client_id("IOT0001").is_err());
    assert!(parse_client_id("IOTabcdAABBCC").is_err());
    assert!(parse_client_id("IOT0001AABBCZ").is_err());
    assert!(parse_client_id("controller-cmd").is_err());
}

#[test]
fn classification() {
    assert_eq!(classify_client("controller-cmd"), ClientClass::Controller);
    assert_eq!(classify_client("ADMIN_console"), ClientClass::Admin);
    assert!(matches!(
        classify_client("IOT0001AABBCC"),
        ClientClass::Device(_)
    ));
    assert_eq!(classify_client("random-visitor"), ClientClass::Unknown);
    // Malformed device id: connect is possible, but no device role.
    assert_eq!(classify_client("IOT01"), ClientClass::Unknown);
}

#[test]
fn device_type_strings() {
    for (s, t) in [
        ("TEMP_SENSOR", DeviceType::TempSensor),
        ("SMART_PLUG", DeviceType::SmartPlug),
        ("ENERGY_SENSOR", DeviceType::EnergySensor),
        ("SMART_SWITCH", DeviceType::SmartSwitch),
    ] {
        assert_eq!(DeviceType::parse(s).unwrap(), t);
        assert_eq!(t.as_str(), s);
    }
    assert!(DeviceType::parse("TOASTER").is_err());
    assert!(DeviceType::SmartPlug.is_actuator());
    assert!(!DeviceType::TempSensor.is_actuator());
}

#[test]
fn identity_rejects_bad_input() {
    assert!(DeviceIdentity::new("", "AA:BB:CC:DD:EE:FF", DeviceType::TempSensor).is_err());
    assert!(DeviceIdentity::new("IOT-2025-0001", "nope", DeviceType::TempSensor).is_err());
}
