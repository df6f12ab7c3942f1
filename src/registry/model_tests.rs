//! Tests for the approval state machine.

use super::DeviceStatus::*;

#[test]
fn allowed_edges() {
    assert!(Pending.can_transition_to(Approved));
    assert!(Pending.can_transition_to(Rejected));
    assert!(Pending.can_transition_to(Blocked));
    assert!(Approved.can_transition_to(Rejected));
    assert!(Approved.can_transition_to(Blocked));
    assert!(Blocked.can_transition_to(Approved));
}

#[test]
fn forbidden_edges() {
    assert!(!Rejected.can_transition_to(Approved));
    assert!(!Rejected.can_transition_to(Pending));
    assert!(!Rejected.can_transition_to(Blocked));
    assert!(!Blocked.can_transition_to(Rejected));
    assert!(!Blocked.can_transition_to(Pending));
    assert!(!Approved.can_transition_to(Pending));
    assert!(!Pending.can_transition_to(Pending));
}

#[test]
fn status_strings() {
    assert_eq!(Pending.as_str(), "PENDING");
    assert_eq!(Approved.as_str(), "APPROVED");
    assert_eq!(Rejected.as_str(), "REJECTED");
    assert_eq!(Blocked.as_str(), "BLOCKED");
}
