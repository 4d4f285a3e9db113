//! In-memory store implementations used by engine and transition tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::errors::{CoreError, Result};
use crate::policy::SyncDirection;

use super::{
    CursorStore, DataType, LocalStore, ObjectStore, PutOutcome, Record, RecordBatch, StoreAdapter,
    StoreKind, SyncCursor,
};

/// An in-memory [`StoreAdapter`] + [`LocalStore`] with switchable failure
/// injection. Pings fail while `set_reachable(false)` is in effect; all
/// operations fail with a retryable error while `set_failing(true)` is.
pub struct MemoryStore {
    kind: StoreKind,
    records: Mutex<HashMap<(DataType, String), Record>>,
    cursors: Mutex<HashMap<(DataType, SyncDirection), SyncCursor>>,
    reachable: AtomicBool,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new(kind: StoreKind) -> Self {
        Self {
            kind,
            records: Mutex::new(HashMap::new()),
            cursors: Mutex::new(HashMap::new()),
            reachable: AtomicBool::new(true),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Snapshot of every record, for test assertions.
    pub fn dump(&self) -> Vec<Record> {
        let records = self.records.lock().unwrap();
        let mut all: Vec<Record> = records.values().cloned().collect();
        all.sort_by(|a, b| (a.data_type, &a.id).cmp(&(b.data_type, &b.id)));
        all
    }

    fn check_available(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CoreError::retryable("memory store failure injected"));
        }
        Ok(())
    }

    fn put_locked(
        records: &mut HashMap<(DataType, String), Record>,
        record: &Record,
    ) -> PutOutcome {
        let key = (record.data_type, record.id.clone());
        match records.get(&key) {
            Some(existing) if existing.updated_at > record.updated_at => PutOutcome::Superseded,
            _ => {
                records.insert(key, record.clone());
                PutOutcome::Applied
            }
        }
    }
}

#[async_trait]
impl StoreAdapter for MemoryStore {
    fn kind(&self) -> StoreKind {
        self.kind
    }

    async fn get(&self, data_type: DataType, id: &str) -> Result<Option<Record>> {
        self.check_available()?;
        let records = self.records.lock().unwrap();
        Ok(records.get(&(data_type, id.to_string())).cloned())
    }

    async fn put(&self, record: &Record) -> Result<PutOutcome> {
        self.check_available()?;
        let mut records = self.records.lock().unwrap();
        Ok(Self::put_locked(&mut records, record))
    }

    async fn delete(&self, data_type: DataType, id: &str, at: i64) -> Result<PutOutcome> {
        self.check_available()?;
        let mut records = self.records.lock().unwrap();
        let key = (data_type, id.to_string());
        let tombstone = match records.get(&key) {
            Some(existing) => {
                if existing.updated_at > at {
                    return Ok(PutOutcome::Superseded);
                }
                existing.tombstone(at)
            }
            None => Record {
                data_type,
                id: id.to_string(),
                payload: String::new(),
                updated_at: at,
                deleted: true,
                origin: self.kind,
                version: 1,
            },
        };
        records.insert(key, tombstone);
        Ok(PutOutcome::Applied)
    }

    async fn list_since(
        &self,
        data_type: DataType,
        since_ms: i64,
        limit: usize,
    ) -> Result<Vec<Record>> {
        self.check_available()?;
        let records = self.records.lock().unwrap();
        let mut matching: Vec<Record> = records
            .values()
            .filter(|r| r.data_type == data_type && r.updated_at >= since_ms)
            .cloned()
            .collect();
        matching.sort_by(|a, b| (a.updated_at, &a.id).cmp(&(b.updated_at, &b.id)));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn count_live(&self, data_type: DataType) -> Result<u64> {
        self.check_available()?;
        let records = self.records.lock().unwrap();
        Ok(records
            .values()
            .filter(|r| r.data_type == data_type && !r.deleted)
            .count() as u64)
    }

    async fn ping(&self) -> Result<()> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(CoreError::PeerUnreachable(format!(
                "{} memory store marked unreachable",
                self.kind.as_str()
            )));
        }
        self.check_available()
    }

    async fn apply_batch(&self, batch: RecordBatch) -> Result<Vec<PutOutcome>> {
        self.check_available()?;
        let mut records = self.records.lock().unwrap();
        let mut outcomes = Vec::with_capacity(batch.puts.len() + batch.deletes.len());
        for record in &batch.puts {
            outcomes.push(Self::put_locked(&mut records, record));
        }
        for (data_type, id, at) in &batch.deletes {
            let key = (*data_type, id.clone());
            let outcome = match records.get(&key) {
                Some(existing) if existing.updated_at > *at => PutOutcome::Superseded,
                Some(existing) => {
                    let tombstone = existing.tombstone(*at);
                    records.insert(key, tombstone);
                    PutOutcome::Applied
                }
                None => {
                    records.insert(
                        key,
                        Record {
                            data_type: *data_type,
                            id: id.clone(),
                            payload: String::new(),
                            updated_at: *at,
                            deleted: true,
                            origin: self.kind,
                            version: 1,
                        },
                    );
                    PutOutcome::Applied
                }
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}

#[async_trait]
impl CursorStore for MemoryStore {
    async fn load_cursor(
        &self,
        data_type: DataType,
        direction: SyncDirection,
    ) -> Result<SyncCursor> {
        let cursors = self.cursors.lock().unwrap();
        Ok(cursors.get(&(data_type, direction)).cloned().unwrap_or_default())
    }

    async fn save_cursor(
        &self,
        data_type: DataType,
        direction: SyncDirection,
        cursor: &SyncCursor,
    ) -> Result<()> {
        let mut cursors = self.cursors.lock().unwrap();
        cursors.insert((data_type, direction), cursor.clone());
        Ok(())
    }

    async fn reset_cursors(&self) -> Result<()> {
        self.cursors.lock().unwrap().clear();
        Ok(())
    }

    async fn reset_cursors_for(&self, data_type: DataType) -> Result<()> {
        self.cursors
            .lock()
            .unwrap()
            .retain(|(t, _), _| *t != data_type);
        Ok(())
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn purge_tombstones(&self, data_type: DataType, older_than_ms: i64) -> Result<u64> {
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|(t, _), r| {
            *t != data_type || !(r.deleted && r.updated_at < older_than_ms)
        });
        Ok((before - records.len()) as u64)
    }
}

/// In-memory [`ObjectStore`] for snapshot and object-log tests.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    reachable: AtomicBool,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            reachable: AtomicBool::new(true),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_reachable(&self) -> Result<()> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(CoreError::PeerUnreachable(
                "memory object store marked unreachable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_object(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.check_reachable()?;
        self.objects.lock().unwrap().insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        self.check_reachable()?;
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| CoreError::store(format!("object '{key}' not found")))
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>> {
        self.check_reachable()?;
        Ok(self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.check_reachable()?;
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.check_reachable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stale_put_is_superseded() {
        let store = MemoryStore::new(StoreKind::Local);
        let newer = Record::new(DataType::Users, "alice", "{\"v\":2}", 200, StoreKind::Local);
        let stale = Record::new(DataType::Users, "alice", "{\"v\":1}", 100, StoreKind::Local);

        assert_eq!(store.put(&newer).await.unwrap(), PutOutcome::Applied);
        assert_eq!(store.put(&stale).await.unwrap(), PutOutcome::Superseded);
        let stored = store.get(DataType::Users, "alice").await.unwrap().unwrap();
        assert_eq!(stored.payload, "{\"v\":2}");
    }

    #[tokio::test]
    async fn list_since_orders_by_timestamp_then_id() {
        let store = MemoryStore::new(StoreKind::Local);
        for (id, at) in [("b", 100), ("a", 100), ("c", 50)] {
            store
                .put(&Record::new(DataType::Projects, id, "{}", at, StoreKind::Local))
                .await
                .unwrap();
        }
        let listed = store.list_since(DataType::Projects, 0, 10).await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["c", "a", "b"]);
    }

    #[tokio::test]
    async fn purge_respects_retention_window() {
        let store = MemoryStore::new(StoreKind::Local);
        let record = Record::new(DataType::Users, "old", "{}", 10, StoreKind::Local);
        store.put(&record).await.unwrap();
        store.delete(DataType::Users, "old", 20).await.unwrap();

        assert_eq!(store.purge_tombstones(DataType::Users, 20).await.unwrap(), 0);
        assert_eq!(store.purge_tombstones(DataType::Users, 21).await.unwrap(), 1);
        assert!(store.get(DataType::Users, "old").await.unwrap().is_none());
    }
}
