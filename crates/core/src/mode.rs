//! Deployment mode model and runtime detection.
//!
//! The detector is the single place that answers "is the external database
//! configured and alive"; every other component subscribes to its channel
//! instead of probing on its own.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::now_millis;
use crate::settings::RuntimeConfig;
use crate::store::SharedPeers;

/// Cadence of detection cycles.
pub const DETECTION_INTERVAL: Duration = Duration::from_secs(30);

/// Consecutive failed pings before a configured store counts as absent.
const MISSES_BEFORE_FLIP: u8 = 2;

/// The four supported deployment topologies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentMode {
    LocalOnly,
    LocalExternal,
    LocalR2,
    LocalExternalR2,
}

impl DeploymentMode {
    pub fn from_parts(has_external: bool, has_r2: bool) -> Self {
        match (has_external, has_r2) {
            (false, false) => DeploymentMode::LocalOnly,
            (true, false) => DeploymentMode::LocalExternal,
            (false, true) => DeploymentMode::LocalR2,
            (true, true) => DeploymentMode::LocalExternalR2,
        }
    }

    pub fn includes_external(&self) -> bool {
        matches!(self, DeploymentMode::LocalExternal | DeploymentMode::LocalExternalR2)
    }

    pub fn includes_r2(&self) -> bool {
        matches!(self, DeploymentMode::LocalR2 | DeploymentMode::LocalExternalR2)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentMode::LocalOnly => "local_only",
            DeploymentMode::LocalExternal => "local_external",
            DeploymentMode::LocalR2 => "local_r2",
            DeploymentMode::LocalExternalR2 => "local_external_r2",
        }
    }

    /// Modes reachable from this one in a single transition. Only one
    /// storage layer may change at a time.
    pub fn adjacent_modes(&self) -> [DeploymentMode; 2] {
        match self {
            DeploymentMode::LocalOnly => [DeploymentMode::LocalExternal, DeploymentMode::LocalR2],
            DeploymentMode::LocalExternal => {
                [DeploymentMode::LocalOnly, DeploymentMode::LocalExternalR2]
            }
            DeploymentMode::LocalR2 => {
                [DeploymentMode::LocalOnly, DeploymentMode::LocalExternalR2]
            }
            DeploymentMode::LocalExternalR2 => {
                [DeploymentMode::LocalExternal, DeploymentMode::LocalR2]
            }
        }
    }
}

impl std::fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentMode {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "local_only" => Ok(DeploymentMode::LocalOnly),
            "local_external" => Ok(DeploymentMode::LocalExternal),
            "local_r2" => Ok(DeploymentMode::LocalR2),
            "local_external_r2" => Ok(DeploymentMode::LocalExternalR2),
            other => Err(format!("unknown deployment mode '{other}'")),
        }
    }
}

/// Per-peer reachability state with flap damping.
struct PeerProbe {
    configured: AtomicBool,
    present: AtomicBool,
    misses: AtomicU8,
}

impl PeerProbe {
    fn new(configured: bool) -> Self {
        Self {
            configured: AtomicBool::new(configured),
            // Optimistic until two consecutive probes fail.
            present: AtomicBool::new(configured),
            misses: AtomicU8::new(0),
        }
    }

    fn reconfigure(&self, configured: bool) {
        self.configured.store(configured, Ordering::SeqCst);
        self.present.store(configured, Ordering::SeqCst);
        self.misses.store(0, Ordering::SeqCst);
    }

    fn observe(&self, reachable: bool) -> bool {
        if !self.configured.load(Ordering::SeqCst) {
            self.present.store(false, Ordering::SeqCst);
            return false;
        }
        if reachable {
            self.misses.store(0, Ordering::SeqCst);
            self.present.store(true, Ordering::SeqCst);
            return true;
        }
        let misses = self.misses.fetch_add(1, Ordering::SeqCst) + 1;
        if misses >= MISSES_BEFORE_FLIP {
            self.present.store(false, Ordering::SeqCst);
        }
        self.present.load(Ordering::SeqCst)
    }
}

/// Computes the active deployment mode at startup and on a 30 second
/// cadence, publishing it through a latest-value channel.
pub struct ModeDetector {
    peers: Arc<SharedPeers>,
    pinned: Mutex<Option<DeploymentMode>>,
    external: PeerProbe,
    object: PeerProbe,
    tx: watch::Sender<DeploymentMode>,
    detected: Mutex<DeploymentMode>,
    last_check_ms: AtomicI64,
    /// Detection cycles to skip after an explicit publish.
    suppressed_cycles: AtomicU8,
}

impl ModeDetector {
    pub fn new(config: &RuntimeConfig, peers: Arc<SharedPeers>) -> Self {
        let initial = config.pinned_mode.unwrap_or_else(|| config.configured_mode());
        let (tx, _) = watch::channel(initial);
        Self {
            peers,
            pinned: Mutex::new(config.pinned_mode),
            external: PeerProbe::new(config.has_external_db()),
            object: PeerProbe::new(config.has_r2()),
            tx,
            detected: Mutex::new(initial),
            last_check_ms: AtomicI64::new(0),
            suppressed_cycles: AtomicU8::new(0),
        }
    }

    /// The currently published mode.
    pub fn current(&self) -> DeploymentMode {
        *self.tx.borrow()
    }

    /// The mode the last detection cycle computed (may differ from the
    /// published mode right after an explicit publish).
    pub fn detected(&self) -> DeploymentMode {
        *self.detected.lock().unwrap()
    }

    /// Subscribe to the mode channel; receivers see the latest value and
    /// every change.
    pub fn subscribe(&self) -> watch::Receiver<DeploymentMode> {
        self.tx.subscribe()
    }

    /// Millis timestamp of the last completed detection cycle, 0 if none.
    pub fn last_check_ms(&self) -> i64 {
        self.last_check_ms.load(Ordering::SeqCst)
    }

    /// Reset probe state after a configuration swap.
    pub fn apply_config(&self, config: &RuntimeConfig) {
        *self.pinned.lock().unwrap() = config.pinned_mode;
        self.external.reconfigure(config.has_external_db());
        self.object.reconfigure(config.has_r2());
    }

    /// Publish a mode directly, bypassing detection heuristics for one
    /// cycle. Used by the transition manager after a switch.
    pub fn publish(&self, mode: DeploymentMode) {
        self.suppressed_cycles.store(1, Ordering::SeqCst);
        self.tx.send_if_modified(|current| {
            if *current == mode {
                false
            } else {
                info!("Deployment mode published: {mode}");
                *current = mode;
                true
            }
        });
    }

    /// Run one detection cycle and publish the result unless suppressed.
    pub async fn detect_once(&self) -> DeploymentMode {
        let pinned = *self.pinned.lock().unwrap();
        let mode = if let Some(pinned) = pinned {
            pinned
        } else {
            let external_ok = match self.peers.external() {
                Some(adapter) => adapter.ping().await.is_ok(),
                None => false,
            };
            let object_ok = match self.peers.object() {
                Some(objects) => objects.ping().await.is_ok(),
                None => false,
            };
            DeploymentMode::from_parts(
                self.external.observe(external_ok),
                self.object.observe(object_ok),
            )
        };

        self.last_check_ms.store(now_millis(), Ordering::SeqCst);
        *self.detected.lock().unwrap() = mode;

        if self.suppressed_cycles.swap(0, Ordering::SeqCst) > 0 {
            debug!("Mode detection suppressed for this cycle, keeping {}", self.current());
            return self.current();
        }

        self.tx.send_if_modified(|current| {
            if *current == mode {
                false
            } else {
                warn!("Deployment mode change detected: {current} -> {mode}");
                *current = mode;
                true
            }
        });
        mode
    }

    /// Spawn the periodic detection loop.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let detector = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(DETECTION_INTERVAL) => {
                        detector.detect_once().await;
                    }
                }
            }
            debug!("Mode detector stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryObjectStore, MemoryStore, StoreKind};

    fn full_config() -> RuntimeConfig {
        RuntimeConfig {
            database_url: Some("postgresql://u:p@db/flowslide".into()),
            r2: Some(crate::settings::R2Settings {
                access_key_id: "k".into(),
                secret_access_key: "s".into(),
                endpoint: "https://r2.example".into(),
                bucket: "b".into(),
            }),
            ..RuntimeConfig::default()
        }
    }

    fn wired_detector(config: &RuntimeConfig) -> (Arc<ModeDetector>, Arc<MemoryStore>, Arc<MemoryObjectStore>) {
        let peers = Arc::new(SharedPeers::new());
        let external = Arc::new(MemoryStore::new(StoreKind::External));
        let objects = Arc::new(MemoryObjectStore::new());
        if config.has_external_db() {
            peers.set_external(Some(external.clone()));
        }
        if config.has_r2() {
            peers.set_object(Some(objects.clone()));
        }
        (Arc::new(ModeDetector::new(config, peers)), external, objects)
    }

    #[test]
    fn decision_table() {
        assert_eq!(DeploymentMode::from_parts(false, false), DeploymentMode::LocalOnly);
        assert_eq!(DeploymentMode::from_parts(true, false), DeploymentMode::LocalExternal);
        assert_eq!(DeploymentMode::from_parts(false, true), DeploymentMode::LocalR2);
        assert_eq!(DeploymentMode::from_parts(true, true), DeploymentMode::LocalExternalR2);
    }

    #[tokio::test]
    async fn detects_full_topology() {
        let (detector, _, _) = wired_detector(&full_config());
        assert_eq!(detector.detect_once().await, DeploymentMode::LocalExternalR2);
    }

    #[tokio::test]
    async fn single_missed_ping_does_not_flip_the_mode() {
        let (detector, external, _) = wired_detector(&full_config());
        assert_eq!(detector.detect_once().await, DeploymentMode::LocalExternalR2);

        external.set_reachable(false);
        assert_eq!(detector.detect_once().await, DeploymentMode::LocalExternalR2);
        // Second consecutive miss drops the layer.
        assert_eq!(detector.detect_once().await, DeploymentMode::LocalR2);

        external.set_reachable(true);
        assert_eq!(detector.detect_once().await, DeploymentMode::LocalExternalR2);
    }

    #[tokio::test]
    async fn pinned_mode_disables_detection() {
        let config = RuntimeConfig {
            pinned_mode: Some(DeploymentMode::LocalOnly),
            ..full_config()
        };
        let (detector, external, _) = wired_detector(&config);
        external.set_reachable(false);
        assert_eq!(detector.detect_once().await, DeploymentMode::LocalOnly);
        assert_eq!(detector.current(), DeploymentMode::LocalOnly);
    }

    #[tokio::test]
    async fn publish_suppresses_one_detection_cycle() {
        let (detector, _, _) = wired_detector(&RuntimeConfig::default());
        detector.publish(DeploymentMode::LocalExternal);
        assert_eq!(detector.current(), DeploymentMode::LocalExternal);

        // The next cycle keeps the published mode even though detection
        // sees no peers; the one after reverts.
        assert_eq!(detector.detect_once().await, DeploymentMode::LocalExternal);
        assert_eq!(detector.detect_once().await, DeploymentMode::LocalOnly);
    }

    #[tokio::test]
    async fn subscribers_observe_changes() {
        let (detector, external, _) = wired_detector(&full_config());
        let mut rx = detector.subscribe();
        detector.detect_once().await;
        assert_eq!(*rx.borrow_and_update(), DeploymentMode::LocalExternalR2);

        external.set_reachable(false);
        detector.detect_once().await;
        detector.detect_once().await;
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), DeploymentMode::LocalR2);
    }
}
