//! # Authentication & Authorization Module
//!
//! ## Why This Module Exists
//! The TLS layer only proves that a peer holds a certificate from the trust
//! store. Everything above that lives here: classifying sessions by clientId,
//! resolving devices in the registry, deciding what a duplicate connection
//! means, and gating every subscribe and publish against the topic ACL.
//!
//! Two collaborators, both driven by the broker events:
//! - [`authenticator::DeviceAuthenticator`] answers "who is this device and
//!   may it be here at all", including the clone-detection policy
//! - [`authorizator::TopicAcl`] answers "may this session touch this topic",
//!   evaluated per subscribe and per publish, default deny

pub mod authenticator;
pub mod authorizator;

#[cfg(test)]
mod authenticator_tests;
#[cfg(test)]
mod authorizator_tests;
