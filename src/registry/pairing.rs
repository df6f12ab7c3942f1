//! Transient pairing codes for binding operator clients.
//!
//! Codes live only in process memory: short uppercase tokens with a five
//! minute lifetime, consumable exactly once. Completing a pairing writes the
//! client binding row and an audit entry; the code is gone either way.

use chrono::{Duration, Local, NaiveDateTime};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use super::error::StoreError;
use super::store::RegistryStore;
use super::ClientBinding;

const CODE_TTL_MINUTES: i64 = 5;
const CODE_LEN: usize = 8;

#[derive(Clone)]
pub struct PairingService {
    store: RegistryStore,
    codes: Arc<Mutex<HashMap<String, NaiveDateTime>>>,
}

impl PairingService {
    pub fn new(store: RegistryStore) -> Self {
        Self {
            store,
            codes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Issues a fresh code valid for five minutes and records who asked.
    pub async fn issue(&self, admin: &str) -> Result<String, StoreError> {
        let code: String = Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(CODE_LEN)
            .collect::<String>()
            .to_uppercase();
        let expires = Local::now().naive_local() + Duration::minutes(CODE_TTL_MINUTES);

        self.codes.lock().await.insert(code.clone(), expires);
        self.store
            .insert_audit_log(
                "PAIRING_CODE_ISSUED",
                admin,
                serde_json::json!({ "code": code.clone() }),
            )
            .await?;
        info!(admin, "pairing code issued");
        Ok(code)
    }

    /// Completes a pairing. The code is removed whether or not the binding
    /// insert succeeds; a failed attempt must not leave a reusable code.
    pub async fn complete(
        &self,
        code: &str,
        uuid: &str,
        fingerprint: &str,
        role: &str,
    ) -> Result<Option<ClientBinding>, StoreError> {
        let valid = {
            let mut codes = self.codes.lock().await;
            match codes.remove(code) {
                Some(expires) => expires >= Local::now().naive_local(),
                None => false,
            }
        };
        if !valid {
            warn!(uuid, "pairing code invalid or expired");
            return Ok(None);
        }

        let binding = self
            .store
            .insert_client_binding(uuid, fingerprint, role)
            .await?;
        self.store
            .insert_audit_log(
                "CLIENT_PAIRED",
                uuid,
                serde_json::json!({ "fingerprint": fingerprint, "role": role }),
            )
            .await?;
        info!(uuid, role, "client paired");
        Ok(Some(binding))
    }

    /// Drops expired codes. Called opportunistically; issuing and consuming
    /// also behave correctly without it.
    pub async fn sweep(&self) {
        let now = Local::now().naive_local();
        self.codes.lock().await.retain(|_, expires| *expires >= now);
    }

    #[cfg(test)]
    pub(crate) async fn force_expire(&self, code: &str) {
        if let Some(expires) = self.codes.lock().await.get_mut(code) {
            *expires = Local::now().naive_local() - Duration::minutes(1);
        }
    }
}
