//! In-process engine for development builds and end-to-end tests.
//!
//! Production deployments attach an embedded MQTT engine at the
//! [`MqttEngine`](super::MqttEngine) seam; this one accepts sessions from
//! in-process callers instead of a socket. It enforces the same contract:
//! publish and subscribe consult the ACL before anything is delivered, and
//! events reach the interceptor in per-session order. Session kills issued
//! through [`SessionControl`](super::SessionControl) drop the session
//! silently, without a disconnect event, matching how an engine drops a
//! connection it refused.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{BrokerError, EngineContext, MqttEngine, SessionControl, SessionEvent};

#[derive(Default)]
struct Shared {
    ctx: Mutex<Option<EngineContext>>,
    killed: Mutex<Vec<String>>,
}

pub struct LoopbackEngine {
    shared: Arc<Shared>,
}

/// Caller-side handle: one per in-process "socket".
#[derive(Clone)]
pub struct LoopbackHandle {
    shared: Arc<Shared>,
}

impl LoopbackEngine {
    pub fn new() -> (Self, LoopbackHandle) {
        let shared = Arc::new(Shared::default());
        (
            Self {
                shared: Arc::clone(&shared),
            },
            LoopbackHandle { shared },
        )
    }
}

#[async_trait]
impl MqttEngine for LoopbackEngine {
    async fn start(&mut self, ctx: EngineContext) -> Result<(), BrokerError> {
        info!(tls_port = ctx.tls_port, "loopback engine started");
        *self.shared.ctx.lock().await = Some(ctx);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), BrokerError> {
        *self.shared.ctx.lock().await = None;
        self.shared.killed.lock().await.clear();
        info!("loopback engine stopped");
        Ok(())
    }

    fn session_control(&self) -> Arc<dyn SessionControl> {
        Arc::new(LoopbackSessions {
            shared: Arc::clone(&self.shared),
        })
    }
}

struct LoopbackSessions {
    shared: Arc<Shared>,
}

#[async_trait]
impl SessionControl for LoopbackSessions {
    async fn disconnect(&self, client_id: &str) {
        debug!(client_id, "session dropped by the hub");
        self.shared.killed.lock().await.push(client_id.to_string());
    }
}

impl LoopbackHandle {
    /// Opens a session. The TLS handshake is assumed to have happened on the
    /// caller's side of the seam.
    pub async fn connect(&self, client_id: &str, peer_addr: &str) -> bool {
        let guard = self.shared.ctx.lock().await;
        let Some(ctx) = guard.as_ref() else {
            warn!(client_id, "engine not started");
            return false;
        };
        ctx.events
            .send(SessionEvent::Connected {
                client_id: client_id.to_string(),
                peer_addr: peer_addr.to_string(),
            })
            .await
            .is_ok()
    }

    pub async fn disconnect(&self, client_id: &str) {
        let guard = self.shared.ctx.lock().await;
        if let Some(ctx) = guard.as_ref() {
            let _ = ctx
                .events
                .send(SessionEvent::Disconnected {
                    client_id: client_id.to_string(),
                })
                .await;
        }
    }

    /// Publishes through the ACL; `false` means the engine refused admission
    /// and nothing was delivered.
    pub async fn publish(&self, client_id: &str, topic: &str, payload: &[u8]) -> bool {
        let guard = self.shared.ctx.lock().await;
        let Some(ctx) = guard.as_ref() else {
            return false;
        };
        if !ctx.acl.can_write(Some(topic), None, Some(client_id)).await {
            debug!(client_id, topic, "publish refused by ACL");
            return false;
        }
        ctx.events
            .send(SessionEvent::Published {
                client_id: client_id.to_string(),
                topic: topic.to_string(),
                payload: payload.to_vec(),
            })
            .await
            .is_ok()
    }

    /// Subscribe admission; the loopback delivers no messages, the decision
    /// is the part under test.
    pub async fn subscribe(&self, client_id: &str, topic: &str) -> bool {
        let guard = self.shared.ctx.lock().await;
        let Some(ctx) = guard.as_ref() else {
            return false;
        };
        ctx.acl.can_read(Some(topic), None, Some(client_id)).await
    }

    /// Sessions the hub asked the engine to drop.
    pub async fn killed_sessions(&self) -> Vec<String> {
        self.shared.killed.lock().await.clone()
    }
}
