//! Validated, reversible transitions between deployment modes.
//!
//! A transition validates the target configuration, probes the stores it
//! introduces, fences the sync engine, snapshots the local store, swaps
//! the active configuration and adapters, reseeds critical types, and
//! verifies their health. Failure after the switch rolls everything back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::clock::{new_record_id, now_millis};
use crate::errors::{CoreError, Result};
use crate::mode::{DeploymentMode, ModeDetector};
use crate::policy::CRITICAL_TYPES;
use crate::settings::{R2Settings, RuntimeConfig};
use crate::snapshot::SnapshotEngine;
use crate::store::{ObjectStore, SharedPeers, StoreAdapter};
use crate::sync::{ConfigSyncService, SyncEngine, DRAIN_DEADLINE};

/// How long the post-switch verification waits for critical types.
pub const VERIFY_WINDOW: Duration = Duration::from_secs(120);

const VERIFY_POLL: Duration = Duration::from_secs(5);

/// Terminal state of a transition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionStatus {
    Succeeded,
    RolledBack,
    Failed,
}

impl TransitionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionStatus::Succeeded => "succeeded",
            TransitionStatus::RolledBack => "rolled_back",
            TransitionStatus::Failed => "failed",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "succeeded" => Some(TransitionStatus::Succeeded),
            "rolled_back" => Some(TransitionStatus::RolledBack),
            "failed" => Some(TransitionStatus::Failed),
            _ => None,
        }
    }
}

/// Immutable log entry of one transition attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionRecord {
    pub id: String,
    pub from_mode: DeploymentMode,
    pub to_mode: DeploymentMode,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub status: TransitionStatus,
    pub reason: String,
    pub actor: String,
    pub error: Option<String>,
    pub snapshot_id: Option<String>,
}

/// Append-only persistence of transition records.
#[async_trait]
pub trait TransitionLog: Send + Sync {
    async fn append(&self, record: &TransitionRecord) -> Result<()>;

    /// Newest first, at most `limit` records.
    async fn list(&self, limit: usize) -> Result<Vec<TransitionRecord>>;
}

/// Builds adapters for stores a transition introduces. Implemented by the
/// composition root over the concrete store crates.
#[async_trait]
pub trait AdapterFactory: Send + Sync {
    async fn connect_external(&self, database_url: &str) -> Result<Arc<dyn StoreAdapter>>;

    async fn connect_object(&self, settings: &R2Settings) -> Result<Arc<dyn ObjectStore>>;
}

/// Result of a dry-run validation of a target mode and configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub ok: bool,
    pub missing_fields: Vec<String>,
    pub unreachable_peers: Vec<String>,
}

/// Orchestrates mode transitions; at most one is in flight.
pub struct TransitionManager {
    config: Arc<RwLock<RuntimeConfig>>,
    peers: Arc<SharedPeers>,
    detector: Arc<ModeDetector>,
    engine: Arc<SyncEngine>,
    config_sync: Arc<ConfigSyncService>,
    snapshots: Arc<SnapshotEngine>,
    log: Arc<dyn TransitionLog>,
    factory: Arc<dyn AdapterFactory>,
    in_flight: tokio::sync::Mutex<()>,
    switching: AtomicBool,
}

impl TransitionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<RwLock<RuntimeConfig>>,
        peers: Arc<SharedPeers>,
        detector: Arc<ModeDetector>,
        engine: Arc<SyncEngine>,
        config_sync: Arc<ConfigSyncService>,
        snapshots: Arc<SnapshotEngine>,
        log: Arc<dyn TransitionLog>,
        factory: Arc<dyn AdapterFactory>,
    ) -> Self {
        Self {
            config,
            peers,
            detector,
            engine,
            config_sync,
            snapshots,
            log,
            factory,
            in_flight: tokio::sync::Mutex::new(()),
            switching: AtomicBool::new(false),
        }
    }

    /// True while a transition is executing.
    pub fn in_progress(&self) -> bool {
        self.switching.load(Ordering::SeqCst)
    }

    /// Dry-run check of a target mode: configuration completeness plus
    /// reachability of the stores it requires.
    pub async fn validate(
        &self,
        target: DeploymentMode,
        config: &RuntimeConfig,
    ) -> ValidationReport {
        let missing_fields = config.missing_fields_for_mode(target);
        let mut unreachable_peers = Vec::new();

        if missing_fields.is_empty() {
            if target.includes_external() {
                if let Some(url) = &config.database_url {
                    match self.factory.connect_external(url).await {
                        Ok(adapter) => {
                            if adapter.ping().await.is_err() {
                                unreachable_peers.push("external".to_string());
                            }
                        }
                        Err(_) => unreachable_peers.push("external".to_string()),
                    }
                }
            }
            if target.includes_r2() {
                if let Some(r2) = &config.r2 {
                    match self.factory.connect_object(r2).await {
                        Ok(objects) => {
                            if objects.ping().await.is_err() {
                                unreachable_peers.push("object".to_string());
                            }
                        }
                        Err(_) => unreachable_peers.push("object".to_string()),
                    }
                }
            }
        }

        ValidationReport {
            ok: missing_fields.is_empty() && unreachable_peers.is_empty(),
            missing_fields,
            unreachable_peers,
        }
    }

    /// Execute a transition to `target` under `new_config`.
    ///
    /// Failures before the snapshot step leave no trace in the log; any
    /// failure after the switch rolls back to the previous configuration
    /// and records `rolled_back`.
    pub async fn transition(
        &self,
        target: DeploymentMode,
        new_config: RuntimeConfig,
        reason: &str,
        actor: &str,
    ) -> Result<TransitionRecord> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            return Err(CoreError::TransitionBusy);
        };
        self.switching.store(true, Ordering::SeqCst);
        let result = self
            .run_transition(target, new_config, reason, actor)
            .await;
        self.switching.store(false, Ordering::SeqCst);
        result
    }

    async fn run_transition(
        &self,
        target: DeploymentMode,
        new_config: RuntimeConfig,
        reason: &str,
        actor: &str,
    ) -> Result<TransitionRecord> {
        let from_mode = self.detector.current();
        let started_at = now_millis();

        if target == from_mode {
            info!("Already in mode {target}, transition is a no-op");
            return Ok(TransitionRecord {
                id: new_record_id(),
                from_mode,
                to_mode: target,
                started_at,
                finished_at: Some(started_at),
                status: TransitionStatus::Succeeded,
                reason: reason.to_string(),
                actor: actor.to_string(),
                error: None,
                snapshot_id: None,
            });
        }

        // 1. Validate the configuration against the target mode.
        new_config.validate_for_mode(target)?;

        // 2. Probe every store the target requires before touching state.
        let new_external = if target.includes_external() {
            let url = new_config.database_url.as_deref().unwrap_or_default();
            let adapter = self
                .factory
                .connect_external(url)
                .await
                .map_err(|e| CoreError::PeerUnreachable(e.to_string()))?;
            adapter
                .ping()
                .await
                .map_err(|e| CoreError::PeerUnreachable(format!("external: {e}")))?;
            Some(adapter)
        } else {
            None
        };
        let new_object = if target.includes_r2() {
            let r2 = new_config.r2.as_ref().expect("validated above");
            let objects = self
                .factory
                .connect_object(r2)
                .await
                .map_err(|e| CoreError::PeerUnreachable(e.to_string()))?;
            objects
                .ping()
                .await
                .map_err(|e| CoreError::PeerUnreachable(format!("object: {e}")))?;
            Some(objects)
        } else {
            None
        };

        if !from_mode.adjacent_modes().contains(&target) {
            // Two storage layers change at once; executed as one chained
            // switch and recorded as a single transition.
            info!("Transition {from_mode} -> {target} crosses two layers");
        }
        info!("Transition {from_mode} -> {target} starting ({reason})");

        // 3. Fence: no new sync ticks, drain in-flight workers. Local
        // writers keep going.
        self.engine.pause_and_drain(DRAIN_DEADLINE).await;

        let old_config = self.config.read().unwrap().clone();
        let old_external = self.peers.external();
        let old_object = self.peers.object();

        // 4. Pre-transition snapshot wherever an object store is at hand.
        let snapshot_id = {
            let snapshot_target = new_object.clone().or_else(|| old_object.clone());
            if let Some(objects) = snapshot_target {
                let bucket = new_config
                    .r2
                    .as_ref()
                    .or(old_config.r2.as_ref())
                    .map(|r2| r2.bucket.clone())
                    .unwrap_or_default();
                match self.snapshots.create_backup_using(objects, &bucket).await {
                    Ok(manifest) => Some(manifest.backup_id().to_string()),
                    Err(e) => {
                        warn!("Pre-transition snapshot failed: {e}");
                        self.engine.resume(from_mode).await;
                        return self
                            .record_rollback(from_mode, target, started_at, reason, actor, None, e)
                            .await;
                    }
                }
            } else {
                None
            }
        };

        // 5. Switch: swap configuration and adapters, publish the mode.
        *self.config.write().unwrap() = new_config.clone();
        self.peers.set_external(new_external);
        self.peers.set_object(new_object);
        self.detector.apply_config(&new_config);
        self.detector.publish(target);
        self.snapshots.apply_config(&new_config);

        // 6. Reconcile: resume workers and reseed the new peer with every
        // critical type from a reset cursor.
        self.engine.resume(target).await;
        let reconcile = async {
            self.engine.reseed_critical().await?;
            if target.includes_external() {
                self.config_sync.run_once().await?;
            }
            Ok::<(), CoreError>(())
        }
        .await;

        // 7. Verify: critical types must report healthy in the window.
        let verified = match reconcile {
            Ok(()) => self.verify_critical(target).await,
            Err(e) => Err(e),
        };

        match verified {
            Ok(()) => {
                let record = TransitionRecord {
                    id: new_record_id(),
                    from_mode,
                    to_mode: target,
                    started_at,
                    finished_at: Some(now_millis()),
                    status: TransitionStatus::Succeeded,
                    reason: reason.to_string(),
                    actor: actor.to_string(),
                    error: None,
                    snapshot_id,
                };
                self.log.append(&record).await?;
                info!("Transition {from_mode} -> {target} succeeded");
                Ok(record)
            }
            Err(e) => {
                // 8. Roll back: previous configuration and adapters.
                error!("Transition {from_mode} -> {target} failed after switch: {e}");
                *self.config.write().unwrap() = old_config.clone();
                self.peers.set_external(old_external);
                self.peers.set_object(old_object);
                self.detector.apply_config(&old_config);
                self.detector.publish(from_mode);
                self.snapshots.apply_config(&old_config);
                self.engine.resume(from_mode).await;
                self.record_rollback(
                    from_mode,
                    target,
                    started_at,
                    reason,
                    actor,
                    snapshot_id,
                    e,
                )
                .await
            }
        }
    }

    async fn record_rollback(
        &self,
        from_mode: DeploymentMode,
        to_mode: DeploymentMode,
        started_at: i64,
        reason: &str,
        actor: &str,
        snapshot_id: Option<String>,
        cause: CoreError,
    ) -> Result<TransitionRecord> {
        let record = TransitionRecord {
            id: new_record_id(),
            from_mode,
            to_mode,
            started_at,
            finished_at: Some(now_millis()),
            status: TransitionStatus::RolledBack,
            reason: reason.to_string(),
            actor: actor.to_string(),
            error: Some(cause.to_string()),
            snapshot_id,
        };
        if let Err(log_err) = self.log.append(&record).await {
            error!("Could not record rolled-back transition: {log_err}");
        }
        Err(cause)
    }

    async fn verify_critical(&self, target: DeploymentMode) -> Result<()> {
        if target == DeploymentMode::LocalOnly {
            // No peers to verify against.
            return Ok(());
        }
        let board = self.engine.status_board();
        let deadline = Instant::now() + VERIFY_WINDOW;
        loop {
            let healthy = CRITICAL_TYPES.iter().all(|&t| board.is_healthy(t));
            if healthy {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(CoreError::internal(
                    "critical types did not become healthy within the verification window",
                ));
            }
            tokio::time::sleep(VERIFY_POLL).await;
        }
    }
}
