//! Security core of an embedded smart-home MQTT hub.
//!
//! Devices authenticate with client certificates, register themselves in a
//! durable registry, and are policed on every connect, subscribe and publish:
//! topic ACLs, clone detection, health monitoring and telemetry capture all
//! live here. The MQTT wire protocol itself sits behind the engine seam in
//! [`broker`]; the hub supplies the TLS context, the policies and the
//! interception logic.

pub mod auth;
pub mod broker;
pub mod client;
pub mod config;
pub mod identity;
pub mod monitor;
pub mod registry;
pub mod telemetry;
pub mod tls;
