//! Shared fixtures for engine and transition tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use flowslide_core::errors::{CoreError, Result};
use flowslide_core::policy::PolicyRegistry;
use flowslide_core::settings::{R2Settings, RuntimeConfig};
use flowslide_core::store::{
    LocalHandle, MemoryObjectStore, MemoryStore, ObjectStore, SharedPeers, StoreAdapter, StoreKind,
};
use flowslide_core::sync::{StatusBoard, SyncEngine, DEFAULT_REMOTE_OP_PERMITS};
use flowslide_core::transition::{AdapterFactory, TransitionLog, TransitionRecord};

/// Factory handing out shared in-memory peers, with switchable failure of
/// the external connection step.
pub struct TestFactory {
    pub external: Arc<MemoryStore>,
    pub objects: Arc<MemoryObjectStore>,
    pub fail_external_connect: AtomicBool,
}

impl TestFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            external: Arc::new(MemoryStore::new(StoreKind::External)),
            objects: Arc::new(MemoryObjectStore::new()),
            fail_external_connect: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl AdapterFactory for TestFactory {
    async fn connect_external(&self, _database_url: &str) -> Result<Arc<dyn StoreAdapter>> {
        if self.fail_external_connect.load(Ordering::SeqCst) {
            return Err(CoreError::PeerUnreachable("dns lookup failed".to_string()));
        }
        Ok(self.external.clone())
    }

    async fn connect_object(&self, _settings: &R2Settings) -> Result<Arc<dyn ObjectStore>> {
        Ok(self.objects.clone())
    }
}

/// In-memory transition history.
#[derive(Default)]
pub struct MemoryTransitionLog {
    records: Mutex<Vec<TransitionRecord>>,
}

impl MemoryTransitionLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl TransitionLog for MemoryTransitionLog {
    async fn append(&self, record: &TransitionRecord) -> Result<()> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<TransitionRecord>> {
        let mut records = self.records.lock().unwrap().clone();
        records.sort_by_key(|r| std::cmp::Reverse(r.started_at));
        records.truncate(limit);
        Ok(records)
    }
}

/// An engine wired to in-memory stores, external peer attached.
pub struct EngineFixture {
    pub engine: Arc<SyncEngine>,
    pub local: Arc<MemoryStore>,
    pub external: Arc<MemoryStore>,
    pub peers: Arc<SharedPeers>,
}

pub fn engine_fixture(config: &RuntimeConfig, attach_external: bool) -> EngineFixture {
    let local = Arc::new(MemoryStore::new(StoreKind::Local));
    let external = Arc::new(MemoryStore::new(StoreKind::External));
    let peers = Arc::new(SharedPeers::new());
    if attach_external {
        peers.set_external(Some(external.clone()));
    }
    let engine = Arc::new(SyncEngine::new(
        LocalHandle::new(local.clone()),
        Arc::clone(&peers),
        Arc::new(PolicyRegistry::new(config)),
        Arc::new(StatusBoard::new()),
        None,
        false,
        DEFAULT_REMOTE_OP_PERMITS,
    ));
    EngineFixture {
        engine,
        local,
        external,
        peers,
    }
}

/// A config whose fields support every mode.
pub fn full_config(db_path: &std::path::Path) -> RuntimeConfig {
    RuntimeConfig {
        database_url: Some("postgresql://sync:pw@db.internal:5432/flowslide".to_string()),
        r2: Some(R2Settings {
            access_key_id: "key".to_string(),
            secret_access_key: "secret".to_string(),
            endpoint: "https://account.r2.cloudflarestorage.com".to_string(),
            bucket: "flowslide-backups".to_string(),
        }),
        local_db_path: db_path.to_path_buf(),
        ..RuntimeConfig::default()
    }
}
