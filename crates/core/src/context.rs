//! Composition root wiring every core component together.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use log::{info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::crypto::PayloadCipher;
use crate::deployment::DeploymentService;
use crate::errors::Result;
use crate::mode::ModeDetector;
use crate::policy::PolicyRegistry;
use crate::settings::RuntimeConfig;
use crate::snapshot::SnapshotEngine;
use crate::store::{LocalHandle, LocalStore, SharedPeers, WriteBarrier};
use crate::sync::{ConfigSyncService, SyncEngine, DEFAULT_REMOTE_OP_PERMITS};
use crate::transition::{AdapterFactory, TransitionLog, TransitionManager};

/// Owns every long-running task of the sync core and hands out the
/// control service.
pub struct CoreContext {
    pub config: Arc<RwLock<RuntimeConfig>>,
    pub peers: Arc<SharedPeers>,
    pub local: LocalHandle,
    pub detector: Arc<ModeDetector>,
    pub engine: Arc<SyncEngine>,
    pub config_sync: Arc<ConfigSyncService>,
    pub snapshots: Arc<SnapshotEngine>,
    pub transitions: Arc<TransitionManager>,
    pub deployment: Arc<DeploymentService>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CoreContext {
    /// Build the core from its injected pieces and run initial detection.
    ///
    /// `env_vars` feeds config seeding; pass `std::env::vars().collect()`
    /// in production.
    pub async fn initialize<S: LocalStore + 'static>(
        config: RuntimeConfig,
        local_store: Arc<S>,
        barrier: WriteBarrier,
        factory: Arc<dyn AdapterFactory>,
        transition_log: Arc<dyn TransitionLog>,
        env_vars: HashMap<String, String>,
    ) -> Result<Arc<Self>> {
        let local = LocalHandle::new(local_store);
        let peers = Arc::new(SharedPeers::new());

        // Attach configured peers; a failed connection leaves the slot
        // empty and detection reports the layer unreachable.
        if let Some(url) = &config.database_url {
            match factory.connect_external(url).await {
                Ok(adapter) => peers.set_external(Some(adapter)),
                Err(e) => warn!("External store connection failed at startup: {e}"),
            }
        }
        if let Some(r2) = &config.r2 {
            match factory.connect_object(r2).await {
                Ok(objects) => peers.set_object(Some(objects)),
                Err(e) => warn!("Object store connection failed at startup: {e}"),
            }
        }

        let cipher = PayloadCipher::from_env().map(Arc::new);
        if cipher.is_none() {
            info!("DATA_ENCRYPTION_KEY unset; sensitive payloads leave unsealed");
        }

        let detector = Arc::new(ModeDetector::new(&config, Arc::clone(&peers)));
        let registry = Arc::new(PolicyRegistry::new(&config));
        let config_sync_active = config.config_sync_enabled;

        let engine = Arc::new(SyncEngine::new(
            local.clone(),
            Arc::clone(&peers),
            registry,
            Arc::new(crate::sync::StatusBoard::new()),
            cipher.clone(),
            config_sync_active,
            DEFAULT_REMOTE_OP_PERMITS,
        ));

        let config_sync = Arc::new(ConfigSyncService::new(
            local.clone(),
            Arc::clone(&peers),
            engine.status_board(),
            engine.remote_ops(),
            cipher,
            config_sync_active,
        ));
        config_sync.seed_from_env(&env_vars).await?;

        let snapshots = Arc::new(SnapshotEngine::new(
            &config,
            Arc::clone(&peers),
            barrier,
            Arc::clone(&detector),
            local.cursors.clone(),
        ));

        let shared_config = Arc::new(RwLock::new(config));
        let transitions = Arc::new(TransitionManager::new(
            Arc::clone(&shared_config),
            Arc::clone(&peers),
            Arc::clone(&detector),
            Arc::clone(&engine),
            Arc::clone(&config_sync),
            Arc::clone(&snapshots),
            Arc::clone(&transition_log),
            factory,
        ));

        let deployment = Arc::new(DeploymentService::new(
            Arc::clone(&shared_config),
            Arc::clone(&detector),
            Arc::clone(&engine),
            Arc::clone(&config_sync),
            Arc::clone(&snapshots),
            Arc::clone(&transitions),
            transition_log,
        ));

        detector.detect_once().await;

        Ok(Arc::new(Self {
            config: shared_config,
            peers,
            local,
            detector,
            engine,
            config_sync,
            snapshots,
            transitions,
            deployment,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Spawn the resident tasks: detection, sync workers, config sync,
    /// snapshot schedule, tombstone janitor, and the mode supervisor.
    pub async fn start(self: &Arc<Self>) {
        self.engine.reconfigure(self.detector.current()).await;

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(self.detector.spawn(self.cancel.child_token()));
        tasks.push(self.config_sync.spawn(self.cancel.child_token()));
        tasks.push(self.snapshots.spawn_schedule(self.cancel.child_token()));
        tasks.push(self.engine.spawn_janitor(self.cancel.child_token()));
        tasks.push(self.spawn_mode_supervisor(self.cancel.child_token()));
        info!("Sync core started in mode {}", self.detector.current());
    }

    /// Reconfigures the engine whenever the published mode changes, so a
    /// mode observed on the channel is in force before the next tick.
    fn spawn_mode_supervisor(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let context = Arc::clone(self);
        tokio::spawn(async move {
            let mut rx = context.detector.subscribe();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let mode = *rx.borrow_and_update();
                        if mode != context.engine.current_mode() {
                            context.engine.reconfigure(mode).await;
                        }
                    }
                }
            }
        })
    }

    /// Watch that turns `true` when a restore requires a process restart.
    pub fn restart_requested(&self) -> watch::Receiver<bool> {
        self.snapshots.restart_requested()
    }

    /// Cancel every resident task and drain the workers.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.engine
            .pause_and_drain(crate::sync::DRAIN_DEADLINE)
            .await;
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
        info!("Sync core stopped");
    }
}
