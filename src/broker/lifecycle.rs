//! Broker service lifecycle.
//!
//! One owned instance per hub process; `start` and `stop` are idempotent and
//! `start` after `stop` re-wires every component. The engine only ever
//! listens with TLS and required client certificates; there is no plaintext
//! listener to misconfigure.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use super::interceptor::{DeviceInterceptor, InterceptorHandle};
use super::{BrokerError, EngineContext, MqttEngine};
use crate::auth::authenticator::DeviceAuthenticator;
use crate::auth::authorizator::TopicAcl;
use crate::config::HubConfig;
use crate::monitor::HealthMonitor;
use crate::registry::store::RegistryStore;
use crate::telemetry::TelemetryIngest;
use crate::tls::TlsContext;

/// Event queue depth between the engine and the interceptor.
const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Grace period for background tasks on stop.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct BrokerService {
    config: HubConfig,
    store: RegistryStore,
    engine: Box<dyn MqttEngine>,
    running: Option<Running>,
}

struct Running {
    interceptor: InterceptorHandle,
    monitor_shutdown: watch::Sender<bool>,
    monitor_task: tokio::task::JoinHandle<()>,
}

impl BrokerService {
    pub fn new(config: HubConfig, store: RegistryStore, engine: Box<dyn MqttEngine>) -> Self {
        Self {
            config,
            store,
            engine,
            running: None,
        }
    }

    pub fn is_started(&self) -> bool {
        self.running.is_some()
    }

    /// Builds the TLS context, wires ACL, interceptor and monitor, and starts
    /// the engine. Calling it on a started service is a no-op. Any failure
    /// leaves the service stopped.
    pub async fn start(&mut self) -> Result<(), BrokerError> {
        if self.running.is_some() {
            info!("broker already started");
            return Ok(());
        }

        info!(
            tls_port = self.config.broker.tls_port,
            "starting broker, client authentication required, plaintext listener disabled"
        );

        let tls = TlsContext::load(&self.config.tls)?;
        let acl = Arc::new(TopicAcl::new(
            self.store.clone(),
            self.config.broker.controller_id.clone(),
        ));
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        self.engine
            .start(EngineContext {
                tls_port: self.config.broker.tls_port,
                tls,
                acl,
                events: events_tx,
            })
            .await?;

        let authenticator = DeviceAuthenticator::new(self.store.clone());
        let ingest = TelemetryIngest::new(self.store.clone());
        let interceptor = DeviceInterceptor::new(
            authenticator,
            ingest,
            self.engine.session_control(),
            self.config.broker.health_time_drift_secs,
        )
        .spawn(
            events_rx,
            self.config.broker.worker_pool_size,
            self.config.broker.worker_queue_capacity,
        );

        let (monitor_shutdown, monitor_shutdown_rx) = watch::channel(false);
        let monitor_task = HealthMonitor::spawn(
            self.store.clone(),
            self.config.monitor.clone(),
            monitor_shutdown_rx,
        );

        self.running = Some(Running {
            interceptor,
            monitor_shutdown,
            monitor_task,
        });
        info!("broker started");
        Ok(())
    }

    /// Stops the engine and drains the background tasks. Symmetric to
    /// `start`; calling it on a stopped service is a no-op.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        info!("stopping broker");
        if let Err(e) = self.engine.stop().await {
            error!(error = %e, "error while stopping engine");
        }

        // The engine dropped its event sender; the interceptor drains the
        // queues and ends on its own.
        if tokio::time::timeout(SHUTDOWN_GRACE, running.interceptor.join())
            .await
            .is_err()
        {
            warn!("interceptor did not drain in time");
        }

        let _ = running.monitor_shutdown.send(true);
        let mut monitor_task = running.monitor_task;
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut monitor_task)
            .await
            .is_err()
        {
            warn!("health monitor did not stop in time, aborting");
            monitor_task.abort();
        }

        info!("broker stopped");
    }

    /// Stop followed by start with the same configuration; the engine
    /// re-reads key material from disk.
    pub async fn restart(&mut self) -> Result<(), BrokerError> {
        self.stop().await;
        self.start().await
    }
}
