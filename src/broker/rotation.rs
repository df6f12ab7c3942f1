//! Key-material rotation scheduling.
//!
//! Two triggers share one task: a randomized long-range timer and a five
//! minute poll over the mtimes of the watched material files. Either one
//! asks the lifecycle supervisor for a broker restart; the engine re-reads
//! the material from disk on start.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::RotationConfig;

/// Why the supervisor is being asked to restart the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    ScheduledRotation,
    MaterialChanged,
}

pub struct CertRotationService {
    config: RotationConfig,
    watched: Vec<PathBuf>,
    restart_tx: mpsc::Sender<RestartReason>,
}

impl CertRotationService {
    pub fn new(
        config: RotationConfig,
        watched: Vec<PathBuf>,
        restart_tx: mpsc::Sender<RestartReason>,
    ) -> Self {
        Self {
            config,
            watched,
            restart_tx,
        }
    }

    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut mtimes = snapshot_mtimes(&self.watched);

            let delay = self.next_delay();
            info!(hours = delay.as_secs() / 3600, "next cert rotation scheduled");
            let mut rotation_sleep = Box::pin(tokio::time::sleep(delay));

            let mut poll = tokio::time::interval(Duration::from_secs(self.config.file_poll_secs));
            poll.tick().await;

            loop {
                tokio::select! {
                    _ = &mut rotation_sleep => {
                        info!("cert rotation timer fired");
                        self.request_restart(RestartReason::ScheduledRotation).await;
                        let delay = self.next_delay();
                        info!(hours = delay.as_secs() / 3600, "next cert rotation scheduled");
                        rotation_sleep = Box::pin(tokio::time::sleep(delay));
                    }
                    _ = poll.tick() => {
                        if refresh_mtimes(&self.watched, &mut mtimes) {
                            info!("key material changed on disk, reloading broker");
                            self.request_restart(RestartReason::MaterialChanged).await;
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("cert rotation service stopped");
        })
    }

    fn next_delay(&self) -> Duration {
        let secs = draw_rotation_delay_secs(
            self.config.min_interval_secs,
            self.config.max_interval_secs,
            rand::random::<i64>(),
        );
        Duration::from_secs(secs)
    }

    async fn request_restart(&self, reason: RestartReason) {
        if let Err(e) = self.restart_tx.send(reason).await {
            error!(error = %e, "lifecycle supervisor is gone, cannot restart broker");
        }
    }
}

/// Uniform draw from `[min, max]` using the absolute value of a random
/// 64-bit integer. Equal bounds produce zero jitter.
pub fn draw_rotation_delay_secs(min_secs: u64, max_secs: u64, random: i64) -> u64 {
    let (min, max) = if min_secs <= max_secs {
        (min_secs, max_secs)
    } else {
        (max_secs, min_secs)
    };
    let span = max - min;
    if span == 0 {
        return min;
    }
    min + random.unsigned_abs() % (span + 1)
}

pub(crate) fn snapshot_mtimes(paths: &[PathBuf]) -> HashMap<PathBuf, SystemTime> {
    let mut mtimes = HashMap::new();
    for path in paths {
        match std::fs::metadata(path).and_then(|m| m.modified()) {
            Ok(mtime) => {
                mtimes.insert(path.clone(), mtime);
            }
            Err(e) => warn!(path = %path.display(), error = %e, "cannot stat watched file"),
        }
    }
    mtimes
}

/// Updates the snapshot in place; true when any watched file changed.
pub(crate) fn refresh_mtimes(paths: &[PathBuf], mtimes: &mut HashMap<PathBuf, SystemTime>) -> bool {
    let mut changed = false;
    for path in paths {
        let Ok(mtime) = std::fs::metadata(path).and_then(|m| m.modified()) else {
            continue;
        };
        match mtimes.get(path) {
            Some(previous) if *previous == mtime => {}
            _ => {
                changed = true;
                mtimes.insert(path.clone(), mtime);
            }
        }
    }
    changed
}
