//! SQLite-backed registry store.
//!
//! Every operation acquires a short-lived connection from the pool; no
//! transaction spans more than one operation. Status transitions run inside
//! a transaction that re-reads the row before writing, so two concurrent
//! admin actions on the same device are applied strictly one after the
//! other.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::error::StoreError;
use super::{
    now, AuditLog, ClientBinding, Device, DeviceConnection, DeviceStatus, NewDevice,
    NewTelemetry, SecurityAlert, TelemetryRecord,
};

#[derive(Clone)]
pub struct RegistryStore {
    pool: Pool<Sqlite>,
}

impl RegistryStore {
    /// Opens (or creates) the registry database at `path` and applies the
    /// schema migrations.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Connection(e.to_string()))?;
        }

        let options =
            SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))
                .map_err(|e| StoreError::Connection(e.to_string()))?
                .journal_mode(SqliteJournalMode::Wal)
                .foreign_keys(true)
                .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        info!(path = %path.display(), "registry database opened");

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// In-memory registry for tests. A single connection keeps all queries on
    /// the same database.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::Connection(e.to_string()))?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        debug!("registry migrations complete");
        Ok(())
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    // =========================================================================
    // Device operations
    // =========================================================================

    /// Inserts a device unless one with the same composite hash exists, in
    /// which case the existing row is returned untouched.
    pub async fn upsert_device_if_absent(&self, new: NewDevice) -> Result<Device, StoreError> {
        if let Some(existing) = self.find_by_composite_hash(&new.composite_hash).await? {
            return Ok(existing);
        }
        match self.insert_device(&new).await {
            Ok(device) => Ok(device),
            // Lost the insert race: somebody else registered the same unit.
            Err(e) if e.is_unique_violation() => self
                .find_by_composite_hash(&new.composite_hash)
                .await?
                .ok_or(e),
            Err(e) => Err(e),
        }
    }

    async fn insert_device(&self, new: &NewDevice) -> Result<Device, StoreError> {
        let result = sqlx::query(
            "INSERT INTO devices (device_type, serial_hash, mac_hash, composite_hash, status, is_critical, registered_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&new.device_type)
        .bind(&new.serial_hash)
        .bind(&new.mac_hash)
        .bind(&new.composite_hash)
        .bind(new.status)
        .bind(new.is_critical)
        .bind(now())
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        info!(device_id = id, "device inserted");
        self.find_by_id(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("device {id}")))
    }

    /// Bootstrap seeding: inserts a demo device, swallowing the duplicate
    /// case so repeated startups stay idempotent.
    pub async fn seed_device(&self, new: NewDevice) -> Result<Option<Device>, StoreError> {
        match self.insert_device(&new).await {
            Ok(device) => Ok(Some(device)),
            Err(e) if e.is_unique_violation() => {
                debug!(composite = %new.composite_hash, "seed device already present");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn find_by_id(&self, device_id: i64) -> Result<Option<Device>, StoreError> {
        let device = sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE id = ?")
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(device)
    }

    pub async fn find_by_serial_hash(
        &self,
        serial_hash: &str,
    ) -> Result<Option<Device>, StoreError> {
        let device = sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE serial_hash = ?")
            .bind(serial_hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(device)
    }

    pub async fn find_by_composite_hash(
        &self,
        composite_hash: &str,
    ) -> Result<Option<Device>, StoreError> {
        let device = sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE composite_hash = ?")
            .bind(composite_hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(device)
    }

    pub async fn find_by_status(&self, status: DeviceStatus) -> Result<Vec<Device>, StoreError> {
        let devices = sqlx::query_as::<_, Device>(
            "SELECT * FROM devices WHERE status = ? ORDER BY registered_at DESC",
        )
        .bind(status)
        .fetch_all(&self.pool)
        .await?;
        Ok(devices)
    }

    pub async fn find_all(&self) -> Result<Vec<Device>, StoreError> {
        let devices =
            sqlx::query_as::<_, Device>("SELECT * FROM devices ORDER BY registered_at DESC")
                .fetch_all(&self.pool)
                .await?;
        Ok(devices)
    }

    /// Sets a new status together with the acting identity. The row is
    /// re-read inside the transaction, so the write happens against the
    /// current state, never a stale one.
    pub async fn update_status(
        &self,
        device_id: i64,
        status: DeviceStatus,
        actor: &str,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let current: Option<(DeviceStatus,)> =
            sqlx::query_as("SELECT status FROM devices WHERE id = ?")
                .bind(device_id)
                .fetch_optional(&mut *tx)
                .await?;

        let Some((current,)) = current else {
            tx.rollback().await?;
            warn!(device_id, "no device found for status update");
            return Ok(false);
        };
        debug!(device_id, from = %current, to = %status, "updating device status");

        sqlx::query(
            "UPDATE devices SET status = ?, approved_at = ?, approved_by = ? WHERE id = ?",
        )
        .bind(status)
        .bind(now())
        .bind(actor)
        .bind(device_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(device_id, status = %status, actor, "device status updated");
        Ok(true)
    }

    /// Re-keys a placeholder row once registration has confirmed the full
    /// MAC. Status and criticality are left untouched.
    pub async fn update_identity(
        &self,
        device_id: i64,
        device_type: &str,
        mac_hash: &str,
        composite_hash: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE devices SET device_type = ?, mac_hash = ?, composite_hash = ? WHERE id = ?",
        )
        .bind(device_type)
        .bind(mac_hash)
        .bind(composite_hash)
        .bind(device_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            warn!(device_id, "no device found for identity update");
        } else {
            info!(device_id, "device identity re-keyed");
        }
        Ok(())
    }

    pub async fn mark_critical(&self, device_id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE devices SET is_critical = 1 WHERE id = ?")
            .bind(device_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            warn!(device_id, "no device found to mark critical");
            return Ok(false);
        }
        info!(device_id, "device marked critical");
        Ok(true)
    }

    /// Wallclock write; safe to repeat.
    pub async fn update_last_health_check(&self, device_id: i64) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE devices SET last_health_check = ? WHERE id = ?")
            .bind(now())
            .bind(device_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            warn!(device_id, "no device found for health check update");
        } else {
            debug!(device_id, "last health check updated");
        }
        Ok(())
    }

    // =========================================================================
    // Connection operations
    // =========================================================================

    pub async fn create_connection(
        &self,
        device_id: i64,
        ip_address: &str,
        client_info: &str,
    ) -> Result<DeviceConnection, StoreError> {
        let result = sqlx::query(
            "INSERT INTO device_connections (device_id, connected_at, ip_address, client_info) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(device_id)
        .bind(now())
        .bind(ip_address)
        .bind(client_info)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        info!(connection_id = id, device_id, "connection created");
        sqlx::query_as::<_, DeviceConnection>("SELECT * FROM device_connections WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("connection {id}")))
    }

    pub async fn close_connection(&self, connection_id: i64) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE device_connections SET disconnected_at = ? WHERE id = ?")
                .bind(now())
                .bind(connection_id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            warn!(connection_id, "no connection found to close");
        } else {
            info!(connection_id, "connection closed");
        }
        Ok(())
    }

    pub async fn close_all_for_device(&self, device_id: i64) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE device_connections SET disconnected_at = ? \
             WHERE device_id = ? AND disconnected_at IS NULL",
        )
        .bind(now())
        .bind(device_id)
        .execute(&self.pool)
        .await?;
        info!(
            device_id,
            closed = result.rows_affected(),
            "closed connections for device"
        );
        Ok(result.rows_affected())
    }

    pub async fn find_active_by_device_id(
        &self,
        device_id: i64,
    ) -> Result<Option<DeviceConnection>, StoreError> {
        let connection = sqlx::query_as::<_, DeviceConnection>(
            "SELECT * FROM device_connections \
             WHERE device_id = ? AND disconnected_at IS NULL \
             ORDER BY connected_at DESC LIMIT 1",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(connection)
    }

    pub async fn find_active_connections(&self) -> Result<Vec<DeviceConnection>, StoreError> {
        let connections = sqlx::query_as::<_, DeviceConnection>(
            "SELECT * FROM device_connections \
             WHERE disconnected_at IS NULL ORDER BY connected_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(connections)
    }

    pub async fn find_all_by_device_id(
        &self,
        device_id: i64,
    ) -> Result<Vec<DeviceConnection>, StoreError> {
        let connections = sqlx::query_as::<_, DeviceConnection>(
            "SELECT * FROM device_connections WHERE device_id = ? ORDER BY connected_at DESC",
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(connections)
    }

    // =========================================================================
    // Alert operations
    // =========================================================================

    pub async fn insert_alert(
        &self,
        alert_type: &str,
        device_serial_hash: &str,
        details: serde_json::Value,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO security_alerts (alert_type, device_serial_hash, details, created_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(alert_type)
        .bind(device_serial_hash)
        .bind(details.to_string())
        .bind(now())
        .execute(&self.pool)
        .await?;
        debug!(alert_type, "security alert recorded");
        Ok(())
    }

    pub async fn find_alerts_by_type(
        &self,
        alert_type: &str,
    ) -> Result<Vec<SecurityAlert>, StoreError> {
        let alerts = sqlx::query_as::<_, SecurityAlert>(
            "SELECT * FROM security_alerts WHERE alert_type = ? ORDER BY created_at DESC",
        )
        .bind(alert_type)
        .fetch_all(&self.pool)
        .await?;
        Ok(alerts)
    }

    pub async fn find_alerts_by_serial_hash(
        &self,
        serial_hash: &str,
    ) -> Result<Vec<SecurityAlert>, StoreError> {
        let alerts = sqlx::query_as::<_, SecurityAlert>(
            "SELECT * FROM security_alerts WHERE device_serial_hash = ? ORDER BY created_at DESC",
        )
        .bind(serial_hash)
        .fetch_all(&self.pool)
        .await?;
        Ok(alerts)
    }

    pub async fn find_all_alerts(&self) -> Result<Vec<SecurityAlert>, StoreError> {
        let alerts = sqlx::query_as::<_, SecurityAlert>(
            "SELECT * FROM security_alerts ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(alerts)
    }

    // =========================================================================
    // Telemetry operations
    // =========================================================================

    pub async fn insert_telemetry(&self, record: NewTelemetry) -> Result<i64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO telemetry (device_id, received_at, topic, ts, measurement, metric_value, payload_raw) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.device_id)
        .bind(now())
        .bind(&record.topic)
        .bind(record.ts)
        .bind(&record.measurement)
        .bind(record.metric_value)
        .bind(&record.payload_raw)
        .execute(&self.pool)
        .await?;
        debug!(device_id = record.device_id, topic = %record.topic, "telemetry stored");
        Ok(result.last_insert_rowid())
    }

    pub async fn find_telemetry_for_device(
        &self,
        device_id: i64,
    ) -> Result<Vec<TelemetryRecord>, StoreError> {
        let records = sqlx::query_as::<_, TelemetryRecord>(
            "SELECT * FROM telemetry WHERE device_id = ? ORDER BY received_at DESC",
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn count_telemetry(&self) -> Result<i64, StoreError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM telemetry")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    // =========================================================================
    // Client bindings and audit log
    // =========================================================================

    pub async fn insert_client_binding(
        &self,
        uuid: &str,
        fingerprint: &str,
        role: &str,
    ) -> Result<ClientBinding, StoreError> {
        let result = sqlx::query(
            "INSERT INTO client_bindings (uuid, fingerprint, role, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(uuid)
        .bind(fingerprint)
        .bind(role)
        .bind(now())
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        info!(uuid, role, "client binding created");
        sqlx::query_as::<_, ClientBinding>("SELECT * FROM client_bindings WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("client binding {id}")))
    }

    pub async fn find_binding_by_uuid(
        &self,
        uuid: &str,
    ) -> Result<Option<ClientBinding>, StoreError> {
        let binding =
            sqlx::query_as::<_, ClientBinding>("SELECT * FROM client_bindings WHERE uuid = ?")
                .bind(uuid)
                .fetch_optional(&self.pool)
                .await?;
        Ok(binding)
    }

    pub async fn touch_binding_last_seen(&self, uuid: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE client_bindings SET last_seen_at = ? WHERE uuid = ?")
            .bind(now())
            .bind(uuid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn insert_audit_log(
        &self,
        event_type: &str,
        subject: &str,
        details: serde_json::Value,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO audit_logs (event_type, subject, details, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(event_type)
        .bind(subject)
        .bind(details.to_string())
        .bind(now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn find_audit_logs(&self) -> Result<Vec<AuditLog>, StoreError> {
        let logs =
            sqlx::query_as::<_, AuditLog>("SELECT * FROM audit_logs ORDER BY created_at DESC")
                .fetch_all(&self.pool)
                .await?;
        Ok(logs)
    }
}
