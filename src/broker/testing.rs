//! Test doubles for the engine seam.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use super::{BrokerError, EngineContext, MqttEngine, SessionControl, SessionEvent};
use crate::config::{HubConfig, TlsConfig};

/// Records which sessions the interceptor asked to drop.
#[derive(Default)]
pub(crate) struct RecordingSessions {
    pub disconnected: Mutex<Vec<String>>,
}

#[async_trait]
impl SessionControl for RecordingSessions {
    async fn disconnect(&self, client_id: &str) {
        self.disconnected.lock().await.push(client_id.to_string());
    }
}

/// Shared view into a [`FakeEngine`] for driving it from a test.
#[derive(Default)]
pub(crate) struct FakeEngineState {
    pub started: AtomicBool,
    pub start_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
    pub events: Mutex<Option<mpsc::Sender<SessionEvent>>>,
    pub sessions: Arc<RecordingSessions>,
    pub fail_start: AtomicBool,
}

pub(crate) struct FakeEngine {
    pub state: Arc<FakeEngineState>,
}

impl FakeEngine {
    pub fn new() -> (Self, Arc<FakeEngineState>) {
        let state = Arc::new(FakeEngineState::default());
        (
            Self {
                state: Arc::clone(&state),
            },
            state,
        )
    }
}

#[async_trait]
impl MqttEngine for FakeEngine {
    async fn start(&mut self, ctx: EngineContext) -> Result<(), BrokerError> {
        self.state.start_calls.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_start.load(Ordering::SeqCst) {
            return Err(BrokerError::EngineStart("scripted failure".to_string()));
        }
        *self.state.events.lock().await = Some(ctx.events);
        self.state.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), BrokerError> {
        self.state.stop_calls.fetch_add(1, Ordering::SeqCst);
        // Dropping the sender ends the interceptor's event stream.
        *self.state.events.lock().await = None;
        self.state.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn session_control(&self) -> Arc<dyn SessionControl> {
        Arc::clone(&self.state.sessions) as Arc<dyn SessionControl>
    }
}

/// Hub config pointing at freshly generated TLS material in a tempdir.
pub(crate) fn test_hub_config() -> (HubConfig, tempfile::TempDir) {
    use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};

    let mut ca_params = CertificateParams::default();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "homeguard test CA");
    let ca_key = KeyPair::generate().unwrap();
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();
    let issuer = rcgen::Issuer::from_params(&ca_params, &ca_key);

    let mut server_params = CertificateParams::default();
    server_params
        .distinguished_name
        .push(DnType::CommonName, "homeguard hub");
    let server_key = KeyPair::generate().unwrap();
    let server_cert = server_params.signed_by(&server_key, &issuer).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("server-cert.pem");
    let key_path = dir.path().join("server-key.pem");
    let ca_path = dir.path().join("ca.pem");
    std::fs::write(&cert_path, server_cert.pem()).unwrap();
    std::fs::write(&key_path, server_key.serialize_pem()).unwrap();
    std::fs::write(&ca_path, ca_cert.pem()).unwrap();

    let mut config = HubConfig::default();
    config.tls = TlsConfig {
        cert_path,
        key_path,
        ca_path,
    };
    (config, dir)
}
