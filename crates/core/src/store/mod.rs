//! Record model and store adapter contracts.
//!
//! Three adapters implement [`StoreAdapter`]: the local embedded store, the
//! external relational peer, and the append-only object log layered over an
//! [`ObjectStore`]. The sync engine only ever talks to these traits.

mod memory;
mod object_log;

pub use memory::{MemoryObjectStore, MemoryStore};
pub use object_log::ObjectRecordStore;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::policy::SyncDirection;

/// Data types participating in sync. The set is closed; policies are keyed
/// by it and the stores partition records by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Users,
    Projects,
    TodoData,
    SlideData,
    PptTemplates,
    GlobalTemplates,
    ProjectVersions,
    UserSessions,
    SystemConfigs,
    AiProviderConfigs,
}

impl DataType {
    /// All recognized data types.
    pub const ALL: [DataType; 10] = [
        DataType::Users,
        DataType::Projects,
        DataType::TodoData,
        DataType::SlideData,
        DataType::PptTemplates,
        DataType::GlobalTemplates,
        DataType::ProjectVersions,
        DataType::UserSessions,
        DataType::SystemConfigs,
        DataType::AiProviderConfigs,
    ];

    /// Stable wire/storage name of the type.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Users => "users",
            DataType::Projects => "projects",
            DataType::TodoData => "todo_data",
            DataType::SlideData => "slide_data",
            DataType::PptTemplates => "ppt_templates",
            DataType::GlobalTemplates => "global_templates",
            DataType::ProjectVersions => "project_versions",
            DataType::UserSessions => "user_sessions",
            DataType::SystemConfigs => "system_configs",
            DataType::AiProviderConfigs => "ai_provider_configs",
        }
    }

    /// Inverse of [`as_str`].
    ///
    /// [`as_str`]: DataType::as_str
    pub fn parse(name: &str) -> Option<DataType> {
        DataType::ALL.iter().copied().find(|t| t.as_str() == name)
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which store produced a record version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Local,
    External,
    Object,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Local => "local",
            StoreKind::External => "external",
            StoreKind::Object => "object",
        }
    }

    pub fn parse(name: &str) -> Option<StoreKind> {
        match name {
            "local" => Some(StoreKind::Local),
            "external" => Some(StoreKind::External),
            "object" => Some(StoreKind::Object),
            _ => None,
        }
    }
}

/// The generic unit of sync.
///
/// The payload is opaque to the core; adapters serialize it. A deleted
/// record is a tombstone retained until every active sync direction on the
/// type has had a chance to propagate it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub data_type: DataType,
    pub id: String,
    pub payload: String,
    pub updated_at: i64,
    pub deleted: bool,
    pub origin: StoreKind,
    pub version: i64,
}

impl Record {
    /// A new live record originating from the given store.
    pub fn new(
        data_type: DataType,
        id: impl Into<String>,
        payload: impl Into<String>,
        updated_at: i64,
        origin: StoreKind,
    ) -> Self {
        Self {
            data_type,
            id: id.into(),
            payload: payload.into(),
            updated_at,
            deleted: false,
            origin,
            version: 1,
        }
    }

    /// The tombstone form of this record, stamped at `at`.
    pub fn tombstone(&self, at: i64) -> Self {
        Self {
            payload: String::new(),
            updated_at: at,
            deleted: true,
            version: self.version + 1,
            ..self.clone()
        }
    }
}

/// Outcome of applying a single record on a destination store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PutOutcome {
    /// The destination now holds this version.
    Applied,
    /// The destination already held a newer version; nothing changed.
    Superseded,
}

/// Watermark of one sync direction for one data type.
///
/// `applied_ids` holds the ids already applied at exactly `watermark_ms` so
/// a retried batch does not re-apply them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCursor {
    pub watermark_ms: i64,
    pub applied_ids: BTreeSet<String>,
}

impl SyncCursor {
    /// Advance past a successfully applied record.
    pub fn advance(&mut self, record: &Record) {
        if record.updated_at > self.watermark_ms {
            self.watermark_ms = record.updated_at;
            self.applied_ids.clear();
        }
        if record.updated_at == self.watermark_ms {
            self.applied_ids.insert(record.id.clone());
        }
    }

    /// True when the record was already applied under this cursor.
    pub fn already_applied(&self, record: &Record) -> bool {
        record.updated_at < self.watermark_ms
            || (record.updated_at == self.watermark_ms && self.applied_ids.contains(&record.id))
    }
}

/// Atomic multi-record change set. Adapters apply the whole batch or none
/// of it.
#[derive(Debug, Clone, Default)]
pub struct RecordBatch {
    pub puts: Vec<Record>,
    pub deletes: Vec<(DataType, String, i64)>,
}

impl RecordBatch {
    pub fn is_empty(&self) -> bool {
        self.puts.is_empty() && self.deletes.is_empty()
    }
}

/// Uniform CRUD plus change-feed surface over one store tier.
///
/// Operations are idempotent on identical inputs. `put` of a record whose
/// `updated_at` is older than the stored copy leaves the copy intact and
/// returns [`PutOutcome::Superseded`].
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// Which tier this adapter fronts.
    fn kind(&self) -> StoreKind;

    async fn get(&self, data_type: DataType, id: &str) -> Result<Option<Record>>;

    async fn put(&self, record: &Record) -> Result<PutOutcome>;

    async fn delete(&self, data_type: DataType, id: &str, at: i64) -> Result<PutOutcome>;

    /// Records with `updated_at >= since_ms`, ordered by `(updated_at, id)`,
    /// at most `limit` of them. Tombstones are included.
    async fn list_since(
        &self,
        data_type: DataType,
        since_ms: i64,
        limit: usize,
    ) -> Result<Vec<Record>>;

    /// Count of live (non-tombstone) records of a type.
    async fn count_live(&self, data_type: DataType) -> Result<u64>;

    /// Cheap reachability probe.
    async fn ping(&self) -> Result<()>;

    /// Apply a batch atomically. Outcomes are returned in put-then-delete
    /// order.
    async fn apply_batch(&self, batch: RecordBatch) -> Result<Vec<PutOutcome>>;
}

/// Persistence of sync cursors, owned by the local store.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load_cursor(
        &self,
        data_type: DataType,
        direction: SyncDirection,
    ) -> Result<SyncCursor>;

    async fn save_cursor(
        &self,
        data_type: DataType,
        direction: SyncDirection,
        cursor: &SyncCursor,
    ) -> Result<()>;

    /// Drop every cursor so the next cycle reconciles from scratch.
    async fn reset_cursors(&self) -> Result<()>;

    /// Drop the cursors of one data type (both directions).
    async fn reset_cursors_for(&self, data_type: DataType) -> Result<()>;
}

/// The local embedded store: full adapter surface plus cursor persistence
/// and tombstone garbage collection.
#[async_trait]
pub trait LocalStore: StoreAdapter + CursorStore {
    /// Physically purge tombstones of a type older than its retention
    /// window. The window must cover the longest active sync interval of
    /// the type so deletions propagate before collection.
    async fn purge_tombstones(&self, data_type: DataType, older_than_ms: i64) -> Result<u64>;
}

/// Split views of one concrete local store, avoiding trait-object
/// upcasting at the call sites that only need part of the surface.
#[derive(Clone)]
pub struct LocalHandle {
    pub adapter: Arc<dyn StoreAdapter>,
    pub cursors: Arc<dyn CursorStore>,
    pub store: Arc<dyn LocalStore>,
}

impl LocalHandle {
    pub fn new<S: LocalStore + 'static>(store: Arc<S>) -> Self {
        Self {
            adapter: store.clone(),
            cursors: store.clone(),
            store,
        }
    }
}

/// S3-compatible object store operations used by the snapshot engine and
/// the append-only record log.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(&self, key: &str, bytes: Vec<u8>) -> Result<()>;

    async fn get_object(&self, key: &str) -> Result<Vec<u8>>;

    /// Keys under a prefix, lexicographically ordered.
    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>>;

    async fn delete_object(&self, key: &str) -> Result<()>;

    async fn ping(&self) -> Result<()>;
}

/// Advisory barrier between local writers and the snapshot engine.
///
/// Writers hold the read side for the duration of a write; the snapshot
/// engine takes the write side while streaming the store file.
pub type WriteBarrier = Arc<tokio::sync::RwLock<()>>;

/// Fresh barrier with no holders.
pub fn new_write_barrier() -> WriteBarrier {
    Arc::new(tokio::sync::RwLock::new(()))
}

/// The peer adapters currently attached to the process.
///
/// Mode transitions swap entries atomically; every component reads through
/// this registry instead of holding its own adapter copies.
#[derive(Default)]
pub struct SharedPeers {
    external: std::sync::RwLock<Option<Arc<dyn StoreAdapter>>>,
    object: std::sync::RwLock<Option<Arc<dyn ObjectStore>>>,
    object_records: std::sync::RwLock<Option<Arc<dyn StoreAdapter>>>,
}

impl SharedPeers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn external(&self) -> Option<Arc<dyn StoreAdapter>> {
        self.external.read().unwrap().clone()
    }

    pub fn object(&self) -> Option<Arc<dyn ObjectStore>> {
        self.object.read().unwrap().clone()
    }

    /// Record-level view of the object store, when one is attached.
    pub fn object_records(&self) -> Option<Arc<dyn StoreAdapter>> {
        self.object_records.read().unwrap().clone()
    }

    pub fn set_external(&self, adapter: Option<Arc<dyn StoreAdapter>>) {
        *self.external.write().unwrap() = adapter;
    }

    pub fn set_object(&self, objects: Option<Arc<dyn ObjectStore>>) {
        let records: Option<Arc<dyn StoreAdapter>> = objects
            .clone()
            .map(|o| Arc::new(ObjectRecordStore::new(o)) as Arc<dyn StoreAdapter>);
        *self.object.write().unwrap() = objects;
        *self.object_records.write().unwrap() = records;
    }
}
