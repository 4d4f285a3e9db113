//! Per-data-type sync policy registry.
//!
//! The base table is the ground truth; the active deployment mode overlays
//! it. Policies never change at runtime except through a mode change.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::mode::DeploymentMode;
use crate::settings::RuntimeConfig;
use crate::store::DataType;

/// Direction of one sync flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    LocalToExternal,
    ExternalToLocal,
}

impl SyncDirection {
    pub const BOTH: [SyncDirection; 2] =
        [SyncDirection::LocalToExternal, SyncDirection::ExternalToLocal];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDirection::LocalToExternal => "local_to_external",
            SyncDirection::ExternalToLocal => "external_to_local",
        }
    }

    pub fn parse(name: &str) -> Option<SyncDirection> {
        match name {
            "local_to_external" => Some(SyncDirection::LocalToExternal),
            "external_to_local" => Some(SyncDirection::ExternalToLocal),
            _ => None,
        }
    }
}

/// How a worker reconciles source against destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    /// Incremental bidirectional reconciliation with conflict resolution.
    FullDuplex,
    /// Destination always accepts source; used for template distribution.
    MasterSlave,
    /// Source pushed into the append-only object log, no conflict check.
    BackupOnly,
    /// Interval is a ceiling; runs are scoped by the hot project set.
    OnDemand,
    /// Never leaves the local store.
    LocalOnly,
}

/// Sync policy of one data type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPolicy {
    pub enabled: bool,
    pub directions: Vec<SyncDirection>,
    pub interval_seconds: u64,
    pub batch_size: usize,
    pub strategy: SyncStrategy,
    pub sensitive: bool,
    /// Run one immediate cycle when the worker starts.
    pub startup_sync: bool,
}

impl SyncPolicy {
    fn disabled() -> Self {
        Self {
            enabled: false,
            directions: Vec::new(),
            interval_seconds: 0,
            batch_size: 0,
            strategy: SyncStrategy::LocalOnly,
            sensitive: false,
            startup_sync: false,
        }
    }
}

/// Types that stay `full_duplex` in every mode with an external peer.
pub const CRITICAL_TYPES: [DataType; 3] = [
    DataType::Users,
    DataType::SystemConfigs,
    DataType::AiProviderConfigs,
];

/// True for members of [`CRITICAL_TYPES`].
pub fn is_critical(data_type: DataType) -> bool {
    CRITICAL_TYPES.contains(&data_type)
}

fn base_policy(data_type: DataType) -> SyncPolicy {
    let duplex = |interval, batch, sensitive, startup| SyncPolicy {
        enabled: true,
        directions: SyncDirection::BOTH.to_vec(),
        interval_seconds: interval,
        batch_size: batch,
        strategy: SyncStrategy::FullDuplex,
        sensitive,
        startup_sync: startup,
    };

    match data_type {
        DataType::Users => duplex(60, 50, true, true),
        DataType::SystemConfigs => duplex(30, 20, true, true),
        DataType::AiProviderConfigs => duplex(30, 20, true, true),
        DataType::Projects => duplex(300, 20, false, true),
        DataType::TodoData => duplex(300, 30, false, true),
        DataType::SlideData => SyncPolicy {
            enabled: true,
            directions: vec![SyncDirection::LocalToExternal],
            interval_seconds: 1800,
            batch_size: 10,
            strategy: SyncStrategy::OnDemand,
            sensitive: false,
            startup_sync: false,
        },
        DataType::PptTemplates => SyncPolicy {
            strategy: SyncStrategy::MasterSlave,
            batch_size: 15,
            startup_sync: false,
            ..duplex(1800, 15, false, false)
        },
        DataType::GlobalTemplates => SyncPolicy {
            strategy: SyncStrategy::MasterSlave,
            batch_size: 10,
            startup_sync: false,
            ..duplex(3600, 10, false, false)
        },
        DataType::ProjectVersions => SyncPolicy {
            enabled: true,
            directions: vec![SyncDirection::LocalToExternal],
            interval_seconds: 3600,
            batch_size: 5,
            strategy: SyncStrategy::BackupOnly,
            sensitive: false,
            startup_sync: false,
        },
        DataType::UserSessions => SyncPolicy::disabled(),
    }
}

/// Holds the policy table and applies mode overlays and environment gates.
pub struct PolicyRegistry {
    data_sync_enabled: bool,
    default_interval_secs: Option<u64>,
    allowed_directions: Option<Vec<SyncDirection>>,
}

impl PolicyRegistry {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            data_sync_enabled: config.data_sync_enabled,
            default_interval_secs: config.default_sync_interval_secs,
            allowed_directions: config.sync_directions.clone(),
        }
    }

    /// The effective policy table under the given mode.
    pub fn effective(&self, mode: DeploymentMode) -> BTreeMap<DataType, SyncPolicy> {
        DataType::ALL
            .iter()
            .map(|&data_type| (data_type, self.policy_for(mode, data_type)))
            .collect()
    }

    /// The effective policy of one data type under the given mode.
    pub fn policy_for(&self, mode: DeploymentMode, data_type: DataType) -> SyncPolicy {
        let mut policy = base_policy(data_type);

        if policy.enabled && policy.interval_seconds == 0 {
            if let Some(fallback) = self.default_interval_secs {
                policy.interval_seconds = fallback;
            }
        }

        apply_mode_overlay(&mut policy, mode, data_type);

        if !self.data_sync_enabled {
            policy = SyncPolicy::disabled();
        }
        if let Some(allowed) = &self.allowed_directions {
            policy.directions.retain(|d| allowed.contains(d));
            if policy.directions.is_empty() {
                policy.enabled = false;
            }
        }
        policy
    }

    /// The longest interval among currently enabled policies, used as the
    /// tombstone retention window.
    pub fn longest_interval_seconds(&self, mode: DeploymentMode) -> u64 {
        self.effective(mode)
            .values()
            .filter(|p| p.enabled)
            .map(|p| p.interval_seconds)
            .max()
            .unwrap_or(0)
    }
}

fn apply_mode_overlay(policy: &mut SyncPolicy, mode: DeploymentMode, data_type: DataType) {
    match mode {
        DeploymentMode::LocalOnly => {
            *policy = SyncPolicy::disabled();
        }
        DeploymentMode::LocalExternal => match data_type {
            DataType::SlideData | DataType::PptTemplates => policy.interval_seconds = 900,
            DataType::GlobalTemplates => policy.interval_seconds = 1800,
            _ => {}
        },
        DeploymentMode::LocalR2 => {
            if !policy.enabled {
                return;
            }
            if is_critical(data_type) {
                // Critical data keeps the duplex flow against the object
                // store, at a cost-conscious cadence.
                policy.interval_seconds = 3600;
                policy.startup_sync = true;
            } else {
                policy.directions = vec![SyncDirection::LocalToExternal];
                policy.strategy = SyncStrategy::BackupOnly;
                policy.startup_sync = false;
                policy.interval_seconds = match data_type {
                    DataType::Projects | DataType::TodoData => 7200,
                    _ => 14_400,
                };
            }
        }
        DeploymentMode::LocalExternalR2 => {
            if !policy.enabled {
                return;
            }
            match data_type {
                t if is_critical(t) => policy.interval_seconds = 600,
                DataType::Projects | DataType::TodoData => {
                    policy.strategy = SyncStrategy::FullDuplex;
                    policy.directions = SyncDirection::BOTH.to_vec();
                    policy.interval_seconds = 900;
                    policy.startup_sync = true;
                }
                DataType::SlideData => {
                    policy.strategy = SyncStrategy::BackupOnly;
                    policy.directions = vec![SyncDirection::LocalToExternal];
                    policy.interval_seconds = 14_400;
                }
                DataType::PptTemplates | DataType::GlobalTemplates => {
                    policy.strategy = SyncStrategy::BackupOnly;
                    policy.directions = vec![SyncDirection::LocalToExternal];
                    policy.interval_seconds = 10_800;
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> PolicyRegistry {
        PolicyRegistry::new(&RuntimeConfig::default())
    }

    #[test]
    fn local_only_disables_everything() {
        let table = registry().effective(DeploymentMode::LocalOnly);
        assert!(table.values().all(|p| !p.enabled));
    }

    #[test]
    fn critical_types_stay_duplex_in_every_peered_mode() {
        for mode in [
            DeploymentMode::LocalExternal,
            DeploymentMode::LocalR2,
            DeploymentMode::LocalExternalR2,
        ] {
            for data_type in CRITICAL_TYPES {
                let policy = registry().policy_for(mode, data_type);
                assert_eq!(policy.strategy, SyncStrategy::FullDuplex, "{mode:?}/{data_type}");
                assert_eq!(policy.directions, SyncDirection::BOTH.to_vec());
                assert!(policy.startup_sync);
            }
        }
    }

    #[test]
    fn user_sessions_never_sync() {
        for mode in [
            DeploymentMode::LocalOnly,
            DeploymentMode::LocalExternal,
            DeploymentMode::LocalR2,
            DeploymentMode::LocalExternalR2,
        ] {
            let policy = registry().policy_for(mode, DataType::UserSessions);
            assert!(!policy.enabled);
            assert_eq!(policy.strategy, SyncStrategy::LocalOnly);
        }
    }

    #[test]
    fn local_r2_downgrades_non_critical_to_backup_only() {
        let policy = registry().policy_for(DeploymentMode::LocalR2, DataType::Projects);
        assert_eq!(policy.strategy, SyncStrategy::BackupOnly);
        assert_eq!(policy.directions, vec![SyncDirection::LocalToExternal]);
        assert_eq!(policy.interval_seconds, 7200);
    }

    #[test]
    fn three_tier_mode_tightens_critical_and_offloads_bulk() {
        let registry = registry();
        assert_eq!(
            registry
                .policy_for(DeploymentMode::LocalExternalR2, DataType::Users)
                .interval_seconds,
            600
        );
        let slides = registry.policy_for(DeploymentMode::LocalExternalR2, DataType::SlideData);
        assert_eq!(slides.strategy, SyncStrategy::BackupOnly);
        assert_eq!(slides.interval_seconds, 14_400);
    }

    #[test]
    fn master_switch_disables_all_sync() {
        let config = RuntimeConfig {
            data_sync_enabled: false,
            ..RuntimeConfig::default()
        };
        let registry = PolicyRegistry::new(&config);
        let table = registry.effective(DeploymentMode::LocalExternal);
        assert!(table.values().all(|p| !p.enabled));
    }

    #[test]
    fn direction_restriction_drops_flows() {
        let config = RuntimeConfig {
            sync_directions: Some(vec![SyncDirection::LocalToExternal]),
            ..RuntimeConfig::default()
        };
        let registry = PolicyRegistry::new(&config);
        let policy = registry.policy_for(DeploymentMode::LocalExternal, DataType::Users);
        assert_eq!(policy.directions, vec![SyncDirection::LocalToExternal]);
    }

    #[test]
    fn retention_window_tracks_longest_enabled_interval() {
        let registry = registry();
        assert_eq!(registry.longest_interval_seconds(DeploymentMode::LocalExternal), 3600);
        assert_eq!(registry.longest_interval_seconds(DeploymentMode::LocalOnly), 0);
    }
}
