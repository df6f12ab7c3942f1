use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Top-level hub configuration, loaded from TOML with full defaults so the
/// hub starts even without a config file.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(default)]
pub struct HubConfig {
    pub broker: BrokerConfig,
    pub tls: TlsConfig,
    pub database: DatabaseConfig,
    pub monitor: MonitorConfig,
    pub rotation: RotationConfig,
    pub bootstrap: BootstrapConfig,
}

/// Devices seeded as approved at startup, for demo installations.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(default)]
pub struct BootstrapConfig {
    pub demo_devices: Vec<DemoDevice>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct DemoDevice {
    pub serial: String,
    pub mac: String,
    pub device_type: String,
    #[serde(default)]
    pub critical: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct BrokerConfig {
    /// TLS listener port. There is no plaintext listener.
    pub tls_port: u16,
    /// Controller id used in every device topic path.
    pub controller_id: String,
    /// Number of workers handling published messages.
    pub worker_pool_size: usize,
    /// Queue capacity per worker.
    pub worker_queue_capacity: usize,
    /// Accepted skew between device and hub clocks in health payloads.
    pub health_time_drift_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            tls_port: 8884,
            controller_id: "controller-01".to_string(),
            worker_pool_size: 10,
            worker_queue_capacity: 64,
            health_time_drift_secs: 5 * 60,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct TlsConfig {
    /// Server certificate chain, PEM.
    pub cert_path: PathBuf,
    /// Server private key, PEM (PKCS#8, RSA or SEC1).
    pub key_path: PathBuf,
    /// Trust anchors for client certificates, PEM bundle.
    pub ca_path: PathBuf,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_path: PathBuf::from("certs/server-cert.pem"),
            key_path: PathBuf::from("certs/server-key.pem"),
            ca_path: PathBuf::from("certs/ca.pem"),
        }
    }
}

impl TlsConfig {
    /// The key material files the rotation service watches.
    pub fn watched_files(&self) -> Vec<PathBuf> {
        vec![
            self.cert_path.clone(),
            self.key_path.clone(),
            self.ca_path.clone(),
        ]
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/homeguard.db"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct MonitorConfig {
    /// Period of the offline scan.
    pub health_check_interval_secs: u64,
    /// Silence after which a device without an active connection counts as
    /// offline.
    pub offline_threshold_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 2 * 60,
            offline_threshold_secs: 3 * 60,
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct RotationConfig {
    /// Lower bound of the randomized rotation window.
    pub min_interval_secs: u64,
    /// Upper bound of the randomized rotation window.
    pub max_interval_secs: u64,
    /// Period of the key-material mtime poll.
    pub file_poll_secs: u64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: 7 * 24 * 60 * 60,
            max_interval_secs: 30 * 24 * 60 * 60,
            file_poll_secs: 5 * 60,
        }
    }
}

impl HubConfig {
    /// Loads the hub configuration, falling back to defaults when the file is
    /// missing. A present but unparseable file is an error; silently running
    /// with defaults would mask an operator mistake.
    pub fn load(path: &Path) -> color_eyre::Result<Self> {
        if !path.exists() {
            warn!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: HubConfig = toml::from_str(&content)?;
        info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = HubConfig::default();
        assert_eq!(config.broker.tls_port, 8884);
        assert_eq!(config.broker.controller_id, "controller-01");
        assert_eq!(config.broker.worker_pool_size, 10);
        assert_eq!(config.broker.health_time_drift_secs, 300);
        assert_eq!(config.monitor.health_check_interval_secs, 120);
        assert_eq!(config.monitor.offline_threshold_secs, 180);
        assert_eq!(config.rotation.min_interval_secs, 604_800);
        assert_eq!(config.rotation.max_interval_secs, 2_592_000);
        assert_eq!(config.rotation.file_poll_secs, 300);
    }

    #[test]
    fn partial_toml_keeps_defaults_for_the_rest() {
        let config: HubConfig = toml::from_str(
            r#"
            [broker]
            controller_id = "controller-02"
            "#,
        )
        .unwrap();
        assert_eq!(config.broker.controller_id, "controller-02");
        assert_eq!(config.broker.tls_port, 8884);
        assert_eq!(config.monitor.offline_threshold_secs, 180);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = HubConfig::load(Path::new("/nonexistent/homeguard.toml")).unwrap();
        assert_eq!(config.broker.tls_port, 8884);
    }
}
