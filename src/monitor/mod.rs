//! Periodic offline detection.
//!
//! A device that holds no active connection and has been silent past the
//! threshold is flagged with a `DEVICE_OFFLINE` alert and its stale
//! connection rows are closed. Devices with a live session are left alone;
//! their next health check is allowed to be in flight.

use chrono::Duration as ChronoDuration;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::MonitorConfig;
use crate::registry::error::StoreError;
use crate::registry::store::RegistryStore;
use crate::registry::{alerts, now, Device};

pub struct HealthMonitor;

impl HealthMonitor {
    /// Starts the scan timer. The task stops promptly when `shutdown` flips
    /// to `true` or its sender goes away.
    pub fn spawn(
        store: RegistryStore,
        config: MonitorConfig,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        info!(
            interval_secs = config.health_check_interval_secs,
            threshold_secs = config.offline_threshold_secs,
            "health monitor started"
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.interval());
            // The immediate first tick would alert before devices had any
            // chance to report.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = run_scan(&store, config.offline_threshold_secs).await {
                            error!(error = %e, "health scan failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("health monitor stopped");
        })
    }
}

/// One full scan over the registry.
pub async fn run_scan(store: &RegistryStore, offline_threshold_secs: u64) -> Result<(), StoreError> {
    debug!("performing health scan");
    let devices = store.find_all().await?;
    let threshold = ChronoDuration::seconds(offline_threshold_secs as i64);

    for device in devices {
        if let Err(e) = check_device(store, &device, threshold).await {
            error!(device_id = device.id, error = %e, "health scan failed for device");
        }
    }
    Ok(())
}

async fn check_device(
    store: &RegistryStore,
    device: &Device,
    threshold: ChronoDuration,
) -> Result<(), StoreError> {
    if store.find_active_by_device_id(device.id).await?.is_some() {
        // Connected devices may simply have their next health in flight.
        return Ok(());
    }

    match device.last_health_check {
        None => {
            offline_alert(store, device, "no health check received since registration").await?;
        }
        Some(last) => {
            let silence = now() - last;
            if silence > threshold {
                let reason = format!("no health check for {} minutes", silence.num_minutes());
                offline_alert(store, device, &reason).await?;
                store.close_all_for_device(device.id).await?;
            }
        }
    }
    Ok(())
}

async fn offline_alert(
    store: &RegistryStore,
    device: &Device,
    reason: &str,
) -> Result<(), StoreError> {
    warn!(device_id = device.id, reason, "device offline");
    store
        .insert_alert(
            alerts::DEVICE_OFFLINE,
            &device.serial_hash,
            json!({
                "device_id": device.id,
                "reason": reason,
                "last_health_check": device.last_health_check.map(|ts| ts.to_string()),
            }),
        )
        .await
}
