//! Inward-facing control surface over the sync core.
//!
//! Transport-agnostic: the HTTP facade in the server app maps these
//! operations onto routes, a CLI could do the same.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::clock::now_millis;
use crate::errors::Result;
use crate::mode::{DeploymentMode, ModeDetector};
use crate::policy::SyncDirection;
use crate::settings::RuntimeConfig;
use crate::snapshot::{SnapshotEngine, SnapshotManifest};
use crate::store::DataType;
use crate::sync::{ConfigSyncService, CycleSummary, SyncEngine, CONFIG_SYNC_TYPES};
use crate::transition::{
    TransitionLog, TransitionManager, TransitionRecord, ValidationReport,
};

/// Answer of `get_mode`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeReport {
    pub current: DeploymentMode,
    pub detected: DeploymentMode,
    pub switch_in_progress: bool,
    pub last_check_ms: i64,
}

/// Per-type aggregation of worker status rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeStatusReport {
    pub data_type: DataType,
    pub enabled: bool,
    pub last_run_ms: Option<i64>,
    pub last_result: Option<CycleSummary>,
    pub cursor_age_ms: Option<i64>,
    pub degraded: bool,
    pub healthy: bool,
}

/// Result rows of a manual trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerReport {
    pub data_type: DataType,
    pub direction: SyncDirection,
    pub summary: CycleSummary,
}

/// The control API (C9) bundling every observable and operation.
pub struct DeploymentService {
    config: Arc<RwLock<RuntimeConfig>>,
    detector: Arc<ModeDetector>,
    engine: Arc<SyncEngine>,
    config_sync: Arc<ConfigSyncService>,
    snapshots: Arc<SnapshotEngine>,
    transitions: Arc<TransitionManager>,
    log: Arc<dyn TransitionLog>,
}

impl DeploymentService {
    pub fn new(
        config: Arc<RwLock<RuntimeConfig>>,
        detector: Arc<ModeDetector>,
        engine: Arc<SyncEngine>,
        config_sync: Arc<ConfigSyncService>,
        snapshots: Arc<SnapshotEngine>,
        transitions: Arc<TransitionManager>,
        log: Arc<dyn TransitionLog>,
    ) -> Self {
        Self {
            config,
            detector,
            engine,
            config_sync,
            snapshots,
            transitions,
            log,
        }
    }

    pub fn get_mode(&self) -> ModeReport {
        ModeReport {
            current: self.detector.current(),
            detected: self.detector.detected(),
            switch_in_progress: self.transitions.in_progress(),
            last_check_ms: self.detector.last_check_ms(),
        }
    }

    /// Per-type sync status, one row per recognized type.
    pub fn get_status(&self) -> Vec<TypeStatusReport> {
        let now = now_millis();
        let mut by_type: BTreeMap<DataType, TypeStatusReport> = DataType::ALL
            .iter()
            .map(|&data_type| {
                (
                    data_type,
                    TypeStatusReport {
                        data_type,
                        enabled: false,
                        last_run_ms: None,
                        last_result: None,
                        cursor_age_ms: None,
                        degraded: false,
                        healthy: false,
                    },
                )
            })
            .collect();

        for row in self.engine.statuses() {
            let report = by_type.get_mut(&row.data_type).expect("known type");
            report.enabled |= row.enabled;
            report.degraded |= row.degraded;
            if row.last_run_ms > report.last_run_ms {
                report.last_run_ms = row.last_run_ms;
                report.last_result = row.last_result.clone();
            }
            if row.enabled && row.cursor_watermark_ms > 0 {
                let age = now - row.cursor_watermark_ms;
                report.cursor_age_ms = Some(match report.cursor_age_ms {
                    Some(existing) => existing.max(age),
                    None => age,
                });
            }
        }

        let board = self.engine.status_board();
        for report in by_type.values_mut() {
            report.healthy = report.enabled && board.is_healthy(report.data_type);
        }
        by_type.into_values().collect()
    }

    /// Dry-run a mode switch.
    pub async fn validate(
        &self,
        target: DeploymentMode,
        config: &RuntimeConfig,
    ) -> ValidationReport {
        self.transitions.validate(target, config).await
    }

    /// Run all workers, or one type's workers, out of band.
    pub async fn trigger_sync(&self, data_type: Option<DataType>) -> Result<Vec<TriggerReport>> {
        let reports: Vec<TriggerReport> = self
            .engine
            .trigger(data_type)
            .await?
            .into_iter()
            .map(|(data_type, direction, summary)| TriggerReport {
                data_type,
                direction,
                summary,
            })
            .collect();

        // The fast path owns the config types when an external peer is
        // attached; include it for a full or config-type trigger.
        let config_type_requested =
            data_type.map(|t| CONFIG_SYNC_TYPES.contains(&t)).unwrap_or(true);
        if config_type_requested && self.config_sync.is_enabled() {
            self.config_sync.run_once().await?;
        }
        Ok(reports)
    }

    /// Switch deployment mode; delegates to the transition manager.
    pub async fn switch_mode(
        &self,
        target: DeploymentMode,
        config: RuntimeConfig,
        reason: &str,
        actor: &str,
    ) -> Result<TransitionRecord> {
        self.transitions.transition(target, config, reason, actor).await
    }

    pub async fn list_backups(&self) -> Result<Vec<SnapshotManifest>> {
        self.snapshots.list_backups().await
    }

    pub async fn create_backup(&self) -> Result<SnapshotManifest> {
        self.snapshots.create_backup().await
    }

    pub async fn restore(&self, backup_id: &str) -> Result<SnapshotManifest> {
        self.snapshots.restore(backup_id).await
    }

    pub async fn get_history(&self, limit: usize) -> Result<Vec<TransitionRecord>> {
        self.log.list(limit).await
    }

    /// Uniqueness-checked user creation; see the sync engine.
    pub async fn create_user(&self, username: &str, payload: String) -> Result<crate::Record> {
        self.engine.create_user(username, payload).await
    }

    /// Replace the hot project set consumed by `on_demand` workers.
    pub fn set_hot_projects(&self, ids: HashSet<String>) {
        self.engine.set_hot_projects(ids);
    }

    /// The active runtime configuration (post-transition swaps included).
    pub fn current_config(&self) -> RuntimeConfig {
        self.config.read().unwrap().clone()
    }
}
