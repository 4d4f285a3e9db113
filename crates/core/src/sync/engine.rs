//! Worker orchestration: spawning, fencing, triggering, and the
//! username-uniqueness gate.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use log::{info, warn};
use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::clock::now_millis;
use crate::crypto::PayloadCipher;
use crate::errors::{CoreError, Result};
use crate::mode::DeploymentMode;
use crate::policy::{PolicyRegistry, SyncDirection, SyncStrategy, CRITICAL_TYPES};
use crate::store::{DataType, LocalHandle, Record, SharedPeers, StoreAdapter, StoreKind};
use crate::sync::config_sync::CONFIG_SYNC_TYPES;
use crate::sync::worker::{
    spawn_worker, CycleSummary, StatusBoard, WorkerHandle, WorkerParams, WorkerStatus,
    REMOTE_OP_TIMEOUT,
};

/// Default cap on concurrent passes touching a remote store; one permit per
/// recognized data type.
pub const DEFAULT_REMOTE_OP_PERMITS: usize = DataType::ALL.len();

/// Bound on draining in-flight workers during a fence or reconfiguration.
pub const DRAIN_DEADLINE: Duration = Duration::from_secs(60);

/// How long a manual trigger waits for its cycle to complete.
const TRIGGER_TIMEOUT: Duration = Duration::from_secs(30);

/// Tombstones of disabled types are still purged after this long.
const IDLE_TOMBSTONE_RETENTION_SECS: u64 = 86_400;

/// Spawns one worker per enabled `(type, direction)` flow and routes
/// control operations to them.
pub struct SyncEngine {
    local: LocalHandle,
    peers: Arc<SharedPeers>,
    registry: Arc<PolicyRegistry>,
    statuses: Arc<StatusBoard>,
    remote_ops: Arc<Semaphore>,
    cipher: Option<Arc<PayloadCipher>>,
    hot_projects: Arc<RwLock<HashSet<String>>>,
    workers: tokio::sync::Mutex<Vec<WorkerHandle>>,
    /// When true, `system_configs`/`ai_provider_configs` flows against an
    /// external peer belong to the config sync service.
    config_sync_active: bool,
    mode: Mutex<DeploymentMode>,
    paused: AtomicBool,
    /// Serializes reconfiguration and fencing; mode-change notifications
    /// and transitions may race otherwise.
    lifecycle: tokio::sync::Mutex<()>,
}

impl SyncEngine {
    pub fn new(
        local: LocalHandle,
        peers: Arc<SharedPeers>,
        registry: Arc<PolicyRegistry>,
        statuses: Arc<StatusBoard>,
        cipher: Option<Arc<PayloadCipher>>,
        config_sync_active: bool,
        remote_op_permits: usize,
    ) -> Self {
        Self {
            local,
            peers,
            registry,
            statuses,
            remote_ops: Arc::new(Semaphore::new(remote_op_permits.max(1))),
            cipher,
            hot_projects: Arc::new(RwLock::new(HashSet::new())),
            workers: tokio::sync::Mutex::new(Vec::new()),
            config_sync_active,
            mode: Mutex::new(DeploymentMode::LocalOnly),
            paused: AtomicBool::new(false),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// The semaphore protecting the remote connection pools; shared with
    /// the config sync service.
    pub fn remote_ops(&self) -> Arc<Semaphore> {
        Arc::clone(&self.remote_ops)
    }

    pub fn status_board(&self) -> Arc<StatusBoard> {
        Arc::clone(&self.statuses)
    }

    pub fn statuses(&self) -> Vec<WorkerStatus> {
        self.statuses.snapshot()
    }

    pub fn current_mode(&self) -> DeploymentMode {
        *self.mode.lock().unwrap()
    }

    /// Replace the hot project set used by `on_demand` workers.
    pub fn set_hot_projects(&self, ids: HashSet<String>) {
        *self.hot_projects.write().unwrap() = ids;
    }

    fn select_peer(
        &self,
        mode: DeploymentMode,
        strategy: SyncStrategy,
    ) -> Option<Arc<dyn StoreAdapter>> {
        match strategy {
            SyncStrategy::BackupOnly => self.peers.object_records().or_else(|| {
                if mode.includes_external() {
                    self.peers.external()
                } else {
                    None
                }
            }),
            _ => {
                if mode.includes_external() {
                    self.peers.external()
                } else if mode.includes_r2() {
                    self.peers.object_records()
                } else {
                    None
                }
            }
        }
    }

    /// Tear down the current workers and spawn the set the mode calls for.
    pub async fn reconfigure(&self, mode: DeploymentMode) {
        let _guard = self.lifecycle.lock().await;
        self.stop_workers(DRAIN_DEADLINE).await;
        *self.mode.lock().unwrap() = mode;
        if self.paused.load(Ordering::SeqCst) {
            // Fenced for a transition; the resume path respawns.
            return;
        }

        let table = self.registry.effective(mode);
        let config_types_elsewhere = self.config_sync_active && mode.includes_external();

        let mut rows = Vec::new();
        let mut workers = Vec::new();

        for (data_type, policy) in table {
            if !policy.enabled {
                rows.push(WorkerStatus::disabled(data_type, policy.strategy));
                continue;
            }
            let Some(peer) = self.select_peer(mode, policy.strategy) else {
                rows.push(WorkerStatus::disabled(data_type, policy.strategy));
                continue;
            };

            for direction in &policy.directions {
                rows.push(WorkerStatus::idle(data_type, *direction, policy.strategy));
                if config_types_elsewhere && CONFIG_SYNC_TYPES.contains(&data_type) {
                    // The fast path owns these flows; it overwrites the
                    // idle rows as it runs.
                    continue;
                }
                let (source, destination) = match direction {
                    SyncDirection::LocalToExternal => (self.local.adapter.clone(), peer.clone()),
                    SyncDirection::ExternalToLocal => (peer.clone(), self.local.adapter.clone()),
                };
                workers.push(spawn_worker(WorkerParams {
                    data_type,
                    direction: *direction,
                    policy: policy.clone(),
                    source,
                    destination,
                    cursors: self.local.cursors.clone(),
                    remote_ops: Arc::clone(&self.remote_ops),
                    statuses: Arc::clone(&self.statuses),
                    cipher: self.cipher.clone(),
                    hot_projects: Arc::clone(&self.hot_projects),
                }));
            }
        }

        info!("Sync engine configured for mode {mode}: {} workers", workers.len());
        self.statuses.reset(rows);
        *self.workers.lock().await = workers;
    }

    async fn stop_workers(&self, deadline: Duration) {
        let handles: Vec<WorkerHandle> = {
            let mut workers = self.workers.lock().await;
            workers.drain(..).collect()
        };
        if handles.is_empty() {
            return;
        }
        for handle in &handles {
            handle.cancel.cancel();
        }
        let started = Instant::now();
        for handle in handles {
            let remaining = deadline.saturating_sub(started.elapsed());
            let mut join = handle.join;
            match tokio::time::timeout(remaining, &mut join).await {
                Ok(_) => {}
                Err(_) => {
                    // A worker that cannot drain is force-killed; its
                    // cursor stays behind so nothing is lost.
                    warn!(
                        "Sync worker {}/{} did not drain in time, aborting",
                        handle.data_type,
                        handle.direction.as_str()
                    );
                    join.abort();
                }
            }
        }
    }

    /// Fence: stop accepting ticks and drain current workers. Local
    /// writers are unaffected.
    pub async fn pause_and_drain(&self, deadline: Duration) {
        let _guard = self.lifecycle.lock().await;
        self.paused.store(true, Ordering::SeqCst);
        self.stop_workers(deadline).await;
    }

    /// Lift the fence and rebuild workers for the given mode.
    pub async fn resume(&self, mode: DeploymentMode) {
        self.paused.store(false, Ordering::SeqCst);
        self.reconfigure(mode).await;
    }

    /// Run all or one type's workers out of band, awaiting their cycles.
    pub async fn trigger(
        &self,
        data_type: Option<DataType>,
    ) -> Result<Vec<(DataType, SyncDirection, CycleSummary)>> {
        let targets: Vec<_> = {
            let workers = self.workers.lock().await;
            workers
                .iter()
                .filter(|h| data_type.map(|t| h.data_type == t).unwrap_or(true))
                .map(|h| (h.data_type, h.direction, h.trigger_tx.clone()))
                .collect()
        };

        let mut results = Vec::new();
        for (data_type, direction, trigger_tx) in targets {
            let (ack_tx, ack_rx) = oneshot::channel();
            if trigger_tx.send(ack_tx).await.is_err() {
                continue;
            }
            match tokio::time::timeout(TRIGGER_TIMEOUT, ack_rx).await {
                Ok(Ok(Ok(summary))) => results.push((data_type, direction, summary)),
                Ok(Ok(Err(e))) => {
                    warn!(
                        "Triggered cycle {}/{} failed: {e}",
                        data_type,
                        direction.as_str()
                    );
                }
                _ => {}
            }
        }
        Ok(results)
    }

    /// Reset critical-type cursors and run their workers once, seeding a
    /// freshly attached peer.
    pub async fn reseed_critical(&self) -> Result<()> {
        for data_type in CRITICAL_TYPES {
            self.local.cursors.reset_cursors_for(data_type).await?;
        }
        for data_type in CRITICAL_TYPES {
            self.trigger(Some(data_type)).await?;
        }
        Ok(())
    }

    /// Create a `users` record, enforcing global username uniqueness.
    ///
    /// Usernames compare case-insensitively, so the id is normalized to
    /// lowercase before both the check and the insert. When an external
    /// peer is attached it must confirm the name is free; an unreachable
    /// peer fails the creation rather than risking a conflict.
    pub async fn create_user(&self, username: &str, payload: String) -> Result<Record> {
        let id = username.trim().to_ascii_lowercase();
        if id.is_empty() {
            return Err(CoreError::store("username must not be empty"));
        }

        if let Some(existing) = self.local.adapter.get(DataType::Users, &id).await? {
            if !existing.deleted {
                return Err(CoreError::UsernameConflict(id));
            }
        }

        if let Some(external) = self.peers.external() {
            match tokio::time::timeout(REMOTE_OP_TIMEOUT, external.get(DataType::Users, &id)).await
            {
                Ok(Ok(Some(existing))) if !existing.deleted => {
                    return Err(CoreError::UsernameConflict(id));
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(CoreError::UniquenessUnverifiable(e.to_string())),
                Err(_) => {
                    return Err(CoreError::UniquenessUnverifiable(
                        "external store did not answer in time".to_string(),
                    ));
                }
            }
        }

        let record = Record::new(DataType::Users, id, payload, now_millis(), StoreKind::Local);
        self.local.adapter.put(&record).await?;
        Ok(record)
    }

    /// Purge tombstones older than twice each type's sync interval, which
    /// keeps them at least one full interval beyond propagation.
    pub async fn purge_tombstones_once(&self) -> Result<u64> {
        let mode = self.current_mode();
        let table = self.registry.effective(mode);
        let now = now_millis();
        let mut purged = 0;
        for (data_type, policy) in table {
            let retention_secs = if policy.enabled {
                policy.interval_seconds.saturating_mul(2)
            } else {
                IDLE_TOMBSTONE_RETENTION_SECS
            };
            let cutoff = now - (retention_secs as i64) * 1000;
            purged += self.local.store.purge_tombstones(data_type, cutoff).await?;
        }
        Ok(purged)
    }

    /// Hourly tombstone janitor.
    pub fn spawn_janitor(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(3600)) => {
                        match engine.purge_tombstones_once().await {
                            Ok(0) => {}
                            Ok(n) => info!("Purged {n} expired tombstones"),
                            Err(e) => warn!("Tombstone purge failed: {e}"),
                        }
                    }
                }
            }
        })
    }
}
