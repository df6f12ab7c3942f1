//! # Broker Module
//!
//! ## Why This Module Exists
//! The MQTT wire protocol lives in an embedded engine; the security decisions
//! live here. This module defines the seam between the two and everything the
//! hub builds on top of it:
//!
//! ```text
//! broker/
//! ├── interceptor.rs - session/publish event processing and worker pool
//! ├── lifecycle.rs   - owned broker service with idempotent start/stop
//! └── rotation.rs    - key-material rotation and file-watch scheduler
//! ```
//!
//! ## The Engine Seam
//! An engine implementation delivers [`SessionEvent`]s in per-session order,
//! consults the topic ACL for every subscribe and publish, and exposes
//! [`SessionControl`] so the interceptor can drop a session it refuses. The
//! hub never reaches into the engine beyond these traits, which is also what
//! makes the interceptor testable with a scripted engine.

pub mod interceptor;
pub mod lifecycle;
pub mod loopback;
pub mod rotation;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::auth::authorizator::TopicAcl;
use crate::registry::error::StoreError;
use crate::tls::{TlsContext, TlsError};

/// One observable event of a broker session, delivered in per-session order.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected {
        client_id: String,
        peer_addr: String,
    },
    Disconnected {
        client_id: String,
    },
    Published {
        client_id: String,
        topic: String,
        payload: Vec<u8>,
    },
}

/// Handle for terminating a live session from outside the engine.
#[async_trait]
pub trait SessionControl: Send + Sync {
    async fn disconnect(&self, client_id: &str);
}

/// Everything an engine needs from the hub to serve connections.
pub struct EngineContext {
    pub tls_port: u16,
    pub tls: TlsContext,
    pub acl: Arc<TopicAcl>,
    pub events: mpsc::Sender<SessionEvent>,
}

/// The embedded MQTT engine. Implementations accept TLS connections on the
/// configured port (client certificates required, no plaintext listener),
/// enforce the ACL, and feed session events into the hub.
#[async_trait]
pub trait MqttEngine: Send + Sync {
    async fn start(&mut self, ctx: EngineContext) -> Result<(), BrokerError>;
    async fn stop(&mut self) -> Result<(), BrokerError>;
    fn session_control(&self) -> Arc<dyn SessionControl>;
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("engine failed to start: {0}")]
    EngineStart(String),

    #[error("engine failed to stop: {0}")]
    EngineStop(String),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
pub(crate) mod testing;

#[cfg(test)]
mod rotation_tests;
