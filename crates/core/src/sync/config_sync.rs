//! Fast-path sync for critical configuration.
//!
//! Mirrors `system_configs` and `ai_provider_configs` with the external
//! peer every 30 seconds regardless of the broader mode policy, seeds them
//! from the environment at startup, and publishes applied changes on a
//! channel that the auth and AI-provider layers subscribe to.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::now_millis;
use crate::crypto::PayloadCipher;
use crate::errors::Result;
use crate::policy::{SyncDirection, SyncStrategy};
use crate::store::{DataType, LocalHandle, Record, RecordBatch, SharedPeers, StoreKind};
use crate::sync::worker::{run_sync_pass, PassContext, StatusBoard, WorkerStatus};

/// The types this service owns when an external peer exists.
pub const CONFIG_SYNC_TYPES: [DataType; 2] =
    [DataType::SystemConfigs, DataType::AiProviderConfigs];

/// Critical cadence, independent of the mode policy table.
pub const CONFIG_SYNC_INTERVAL: Duration = Duration::from_secs(30);

const CONFIG_SYNC_BATCH: usize = 20;

/// Environment-provided settings mirrored into the stores. The record id
/// is the key; the environment variable is its uppercase form.
pub const RECOGNIZED_CONFIG_KEYS: [&str; 15] = [
    "database_url",
    "admin_username",
    "admin_password",
    "admin_email",
    "r2_access_key_id",
    "r2_secret_access_key",
    "r2_endpoint",
    "r2_bucket_name",
    "jwt_secret",
    "ai_provider_api_keys",
    "ai_provider_base_urls",
    "captcha_site_key",
    "captcha_secret_key",
    "max_upload_mb",
    "login_captcha_enabled",
];

/// Keys whose values are sealed before leaving the local process.
pub const SENSITIVE_CONFIG_KEYS: [&str; 7] = [
    "database_url",
    "admin_password",
    "r2_access_key_id",
    "r2_secret_access_key",
    "jwt_secret",
    "ai_provider_api_keys",
    "captcha_secret_key",
];

fn data_type_for_key(key: &str) -> DataType {
    if key.starts_with("ai_provider_") {
        DataType::AiProviderConfigs
    } else {
        DataType::SystemConfigs
    }
}

/// One applied configuration change, broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigUpdate {
    pub data_type: DataType,
    pub key: String,
}

/// Bidirectional mirror of critical configuration with the external peer.
pub struct ConfigSyncService {
    local: LocalHandle,
    peers: Arc<SharedPeers>,
    statuses: Arc<StatusBoard>,
    remote_ops: Arc<Semaphore>,
    cipher: Option<Arc<PayloadCipher>>,
    enabled: bool,
    updates_tx: broadcast::Sender<ConfigUpdate>,
}

impl ConfigSyncService {
    pub fn new(
        local: LocalHandle,
        peers: Arc<SharedPeers>,
        statuses: Arc<StatusBoard>,
        remote_ops: Arc<Semaphore>,
        cipher: Option<Arc<PayloadCipher>>,
        enabled: bool,
    ) -> Self {
        let (updates_tx, _) = broadcast::channel(64);
        Self {
            local,
            peers,
            statuses,
            remote_ops,
            cipher,
            enabled,
            updates_tx,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Subscribe to applied configuration changes.
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigUpdate> {
        self.updates_tx.subscribe()
    }

    /// Mirror recognized environment settings into the local store so a
    /// new replica inherits them on startup. Values already present with
    /// the same content are left untouched; changed ones land in one
    /// atomic batch.
    pub async fn seed_from_env(&self, vars: &HashMap<String, String>) -> Result<usize> {
        let mut batch = RecordBatch::default();
        for key in RECOGNIZED_CONFIG_KEYS {
            let env_name = key.to_ascii_uppercase();
            let Some(value) = vars.get(&env_name).map(|v| v.trim()).filter(|v| !v.is_empty())
            else {
                continue;
            };

            let data_type = data_type_for_key(key);
            let sensitive = SENSITIVE_CONFIG_KEYS.contains(&key);
            let payload = json!({
                "key": key,
                "value": value,
                "sensitive": sensitive,
            })
            .to_string();

            let existing = self.local.adapter.get(data_type, key).await?;
            if let Some(existing) = &existing {
                if !existing.deleted && existing.payload == payload {
                    continue;
                }
            }

            let mut record = Record::new(data_type, key, payload, now_millis(), StoreKind::Local);
            record.version = existing.map(|r| r.version + 1).unwrap_or(1);
            batch.puts.push(record);
        }

        if batch.is_empty() {
            return Ok(0);
        }
        let seeded = batch.puts.len();
        self.local.adapter.apply_batch(batch).await?;
        info!("Seeded {seeded} configuration entries from the environment");
        Ok(seeded)
    }

    /// One bidirectional mirror pass for both config types. A no-op when
    /// no external peer is attached.
    pub async fn run_once(&self) -> Result<()> {
        let Some(external) = self.peers.external() else {
            return Ok(());
        };
        let cancel = CancellationToken::new();

        for data_type in CONFIG_SYNC_TYPES {
            for direction in [SyncDirection::LocalToExternal, SyncDirection::ExternalToLocal] {
                let (source, destination) = match direction {
                    SyncDirection::LocalToExternal => {
                        (self.local.adapter.clone(), external.clone())
                    }
                    SyncDirection::ExternalToLocal => {
                        (external.clone(), self.local.adapter.clone())
                    }
                };

                let outcome = run_sync_pass(PassContext {
                    data_type,
                    direction,
                    strategy: SyncStrategy::FullDuplex,
                    batch_size: CONFIG_SYNC_BATCH,
                    sensitive: true,
                    source: &source,
                    destination: &destination,
                    cursors: &self.local.cursors,
                    remote_ops: &self.remote_ops,
                    cipher: self.cipher.as_ref(),
                    hot_filter: None,
                    cancel: &cancel,
                })
                .await;

                match outcome {
                    Ok(pass) => {
                        if direction == SyncDirection::ExternalToLocal {
                            for key in &pass.applied_ids {
                                let _ = self.updates_tx.send(ConfigUpdate {
                                    data_type,
                                    key: key.clone(),
                                });
                            }
                        }
                        self.statuses.update(WorkerStatus {
                            data_type,
                            direction: Some(direction),
                            enabled: true,
                            strategy: SyncStrategy::FullDuplex,
                            last_run_ms: Some(now_millis()),
                            last_result: Some(pass.summary),
                            cursor_watermark_ms: self
                                .local
                                .cursors
                                .load_cursor(data_type, direction)
                                .await
                                .map(|c| c.watermark_ms)
                                .unwrap_or(0),
                            degraded: false,
                            consecutive_failures: 0,
                        });
                    }
                    Err(e) => {
                        warn!(
                            "Config sync {}/{} failed: {e}",
                            data_type,
                            direction.as_str()
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Resident 30 second loop; idle while no external peer is attached.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            if !service.enabled {
                debug!("Config sync disabled");
                return;
            }
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(CONFIG_SYNC_INTERVAL) => {
                        if let Err(e) = service.run_once().await {
                            warn!("Config sync cycle failed: {e}");
                        }
                    }
                }
            }
            debug!("Config sync service stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreAdapter};

    fn service_with(
        external_attached: bool,
    ) -> (Arc<ConfigSyncService>, Arc<MemoryStore>, Arc<MemoryStore>) {
        let local = Arc::new(MemoryStore::new(StoreKind::Local));
        let external = Arc::new(MemoryStore::new(StoreKind::External));
        let peers = Arc::new(SharedPeers::new());
        if external_attached {
            peers.set_external(Some(external.clone()));
        }
        let service = Arc::new(ConfigSyncService::new(
            LocalHandle::new(local.clone()),
            peers,
            Arc::new(StatusBoard::new()),
            Arc::new(Semaphore::new(4)),
            None,
            true,
        ));
        (service, local, external)
    }

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn seeding_writes_recognized_keys_only() {
        let (service, local, _) = service_with(false);
        let seeded = service
            .seed_from_env(&env(&[
                ("JWT_SECRET", "abc"),
                ("MAX_UPLOAD_MB", "50"),
                ("AI_PROVIDER_API_KEYS", "{\"openai\":\"sk-x\"}"),
                ("UNRELATED_VAR", "ignored"),
            ]))
            .await
            .unwrap();
        assert_eq!(seeded, 3);

        let jwt = local
            .get(DataType::SystemConfigs, "jwt_secret")
            .await
            .unwrap()
            .unwrap();
        assert!(jwt.payload.contains("\"sensitive\":true"));

        let ai = local
            .get(DataType::AiProviderConfigs, "ai_provider_api_keys")
            .await
            .unwrap();
        assert!(ai.is_some());
    }

    #[tokio::test]
    async fn seeding_is_idempotent() {
        let (service, _, _) = service_with(false);
        let vars = env(&[("ADMIN_USERNAME", "admin")]);
        assert_eq!(service.seed_from_env(&vars).await.unwrap(), 1);
        assert_eq!(service.seed_from_env(&vars).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn run_once_mirrors_both_ways_and_broadcasts_pulls() {
        let (service, local, external) = service_with(true);
        let mut updates = service.subscribe();

        service
            .seed_from_env(&env(&[("ADMIN_USERNAME", "admin")]))
            .await
            .unwrap();
        external
            .put(&Record::new(
                DataType::SystemConfigs,
                "max_upload_mb",
                "{\"key\":\"max_upload_mb\",\"value\":\"100\",\"sensitive\":false}",
                now_millis() + 1,
                StoreKind::External,
            ))
            .await
            .unwrap();

        service.run_once().await.unwrap();

        assert!(external
            .get(DataType::SystemConfigs, "admin_username")
            .await
            .unwrap()
            .is_some());
        assert!(local
            .get(DataType::SystemConfigs, "max_upload_mb")
            .await
            .unwrap()
            .is_some());

        let update = updates.try_recv().unwrap();
        assert_eq!(update.key, "max_upload_mb");
        assert_eq!(update.data_type, DataType::SystemConfigs);
    }

    #[tokio::test]
    async fn run_once_is_a_noop_without_external_peer() {
        let (service, _, external) = service_with(false);
        service
            .seed_from_env(&env(&[("ADMIN_USERNAME", "admin")]))
            .await
            .unwrap();
        service.run_once().await.unwrap();
        assert!(external
            .get(DataType::SystemConfigs, "admin_username")
            .await
            .unwrap()
            .is_none());
    }
}
