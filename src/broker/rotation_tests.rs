//! Tests for rotation jitter and the file watcher.

use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};

use super::rotation::{
    draw_rotation_delay_secs, refresh_mtimes, snapshot_mtimes, CertRotationService, RestartReason,
};
use crate::config::RotationConfig;

#[test]
fn jitter_draw_stays_inside_bounds() {
    for random in [0i64, 1, -1, 42, i64::MAX, i64::MIN, -987654321] {
        let delay = draw_rotation_delay_secs(100, 200, random);
        assert!((100..=200).contains(&delay), "delay {delay} out of bounds");
    }
}

#[test]
fn equal_bounds_yield_exactly_that_value() {
    for random in [0i64, 7, -7, i64::MAX, i64::MIN] {
        assert_eq!(draw_rotation_delay_secs(300, 300, random), 300);
    }
}

#[test]
fn swapped_bounds_are_reordered() {
    let delay = draw_rotation_delay_secs(200, 100, 12345);
    assert!((100..=200).contains(&delay));
}

#[test]
fn draw_is_min_plus_abs_modulo() {
    // span + 1 = 101, so the draw is min + |random| % 101.
    assert_eq!(draw_rotation_delay_secs(100, 200, 205), 100 + 205 % 101);
    assert_eq!(draw_rotation_delay_secs(100, 200, -205), 100 + 205 % 101);
}

#[test]
fn mtime_refresh_detects_changes() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("server-cert.pem");
    std::fs::write(&file, "material v1").unwrap();
    let watched = vec![file.clone()];

    let mut mtimes = snapshot_mtimes(&watched);
    assert!(!refresh_mtimes(&watched, &mut mtimes));

    let handle = std::fs::File::options().write(true).open(&file).unwrap();
    handle
        .set_modified(SystemTime::now() + Duration::from_secs(5))
        .unwrap();

    assert!(refresh_mtimes(&watched, &mut mtimes));
    // Change is absorbed into the snapshot.
    assert!(!refresh_mtimes(&watched, &mut mtimes));
}

#[test]
fn missing_files_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let watched = vec![dir.path().join("not-there.pem")];
    let mut mtimes = snapshot_mtimes(&watched);
    assert!(mtimes.is_empty());
    assert!(!refresh_mtimes(&watched, &mut mtimes));
}

#[test]
fn file_appearing_later_counts_as_change() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("ca.pem");
    let watched = vec![file.clone()];
    let mut mtimes = snapshot_mtimes(&watched);

    std::fs::write(&file, "late material").unwrap();
    assert!(refresh_mtimes(&watched, &mut mtimes));
}

#[tokio::test(start_paused = true)]
async fn scheduled_rotation_requests_restart() {
    let config = RotationConfig {
        min_interval_secs: 60,
        max_interval_secs: 60,
        file_poll_secs: 3600,
    };
    let (restart_tx, mut restart_rx) = mpsc::channel(4);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let service = CertRotationService::new(config, Vec::new(), restart_tx);
    let task = service.spawn(shutdown_rx);

    let reason = restart_rx.recv().await.expect("rotation should fire");
    assert_eq!(reason, RestartReason::ScheduledRotation);

    shutdown_tx.send(true).unwrap();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_the_service_without_firing() {
    let config = RotationConfig {
        min_interval_secs: 86_400,
        max_interval_secs: 86_400,
        file_poll_secs: 86_400,
    };
    let (restart_tx, mut restart_rx) = mpsc::channel(4);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let task = CertRotationService::new(config, Vec::new(), restart_tx).spawn(shutdown_rx);
    shutdown_tx.send(true).unwrap();
    task.await.unwrap();

    assert!(restart_rx.try_recv().is_err());
}
