use color_eyre::{eyre::eyre, Result};
use homeguard::broker::lifecycle::BrokerService;
use homeguard::broker::loopback::LoopbackEngine;
use homeguard::broker::rotation::CertRotationService;
use homeguard::config::{BootstrapConfig, HubConfig};
use homeguard::identity::{self, DeviceType};
use homeguard::registry::store::RegistryStore;
use homeguard::registry::{DeviceStatus, NewDevice};
use std::path::Path;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "homeguard.toml".to_string());
    let config = HubConfig::load(Path::new(&config_path))?;

    info!("Initializing registry store");
    let store = RegistryStore::open(&config.database.path)
        .await
        .map_err(|e| eyre!("Failed to open registry store: {}", e))?;
    seed_bootstrap_devices(&store, &config.bootstrap).await?;

    // Production deployments attach the embedded MQTT engine at this seam;
    // the loopback engine serves in-process sessions.
    let (engine, _local_sessions) = LoopbackEngine::new();
    let mut broker = BrokerService::new(config.clone(), store.clone(), Box::new(engine));
    broker
        .start()
        .await
        .map_err(|e| eyre!("Failed to start broker: {}", e))?;

    // Kanäle für Rotation und Shutdown
    let (restart_tx, mut restart_rx) = mpsc::channel(4);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let rotation = CertRotationService::new(
        config.rotation.clone(),
        config.tls.watched_files(),
        restart_tx,
    )
    .spawn(shutdown_rx);

    loop {
        tokio::select! {
            Some(reason) = restart_rx.recv() => {
                info!(?reason, "restart requested");
                if let Err(e) = broker.restart().await {
                    error!(error = %e, "broker restart failed");
                }
            }
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("shutdown signal received");
                break;
            }
        }
    }

    let _ = shutdown_tx.send(true);
    broker.stop().await;
    let _ = rotation.await;
    info!("hub stopped");
    Ok(())
}

async fn seed_bootstrap_devices(store: &RegistryStore, bootstrap: &BootstrapConfig) -> Result<()> {
    for demo in &bootstrap.demo_devices {
        let device_type = DeviceType::parse(&demo.device_type)
            .map_err(|e| eyre!("Invalid bootstrap device: {}", e))?;
        if !identity::is_valid_mac(&demo.mac) {
            return Err(eyre!("Invalid bootstrap MAC for {}", demo.serial));
        }
        let seeded = store
            .seed_device(NewDevice {
                device_type: device_type.as_str().to_string(),
                serial_hash: identity::hash(&demo.serial),
                mac_hash: identity::hash(&demo.mac),
                composite_hash: identity::hash_composite(&demo.serial, &demo.mac),
                status: DeviceStatus::Approved,
                is_critical: demo.critical,
            })
            .await
            .map_err(|e| eyre!("Failed to seed device {}: {}", demo.serial, e))?;
        if seeded.is_some() {
            info!(serial = %demo.serial, "bootstrap device seeded");
        }
    }
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
