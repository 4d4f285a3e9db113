//! Append-only record log layered over an object store.
//!
//! Used when the object store stands in as a sync peer (`backup_only`
//! strategies and the R2-only topology). Every version of a record is a
//! separate immutable object keyed `sync/<type>/<yyyymmdd>/<id>/<version>.blob`;
//! reads resolve the highest version.

use std::sync::Arc;

use async_trait::async_trait;

use crate::clock::date_partition;
use crate::errors::{CoreError, Result};
use crate::store::{
    DataType, ObjectStore, PutOutcome, Record, RecordBatch, StoreAdapter, StoreKind,
};

const LOG_ROOT: &str = "sync";

/// One parsed log key.
struct LogKey {
    id: String,
    version: i64,
    key: String,
}

/// [`StoreAdapter`] view of an [`ObjectStore`].
pub struct ObjectRecordStore {
    objects: Arc<dyn ObjectStore>,
}

impl ObjectRecordStore {
    pub fn new(objects: Arc<dyn ObjectStore>) -> Self {
        Self { objects }
    }

    fn type_prefix(data_type: DataType) -> String {
        format!("{LOG_ROOT}/{}/", data_type.as_str())
    }

    fn record_key(record: &Record) -> String {
        format!(
            "{LOG_ROOT}/{}/{}/{}/{}.blob",
            record.data_type.as_str(),
            date_partition(record.updated_at),
            encode_id(&record.id),
            record.version,
        )
    }

    fn parse_key(key: &str) -> Option<LogKey> {
        let mut parts = key.split('/');
        let (_root, _data_type, _date) = (parts.next()?, parts.next()?, parts.next()?);
        let id = decode_id(parts.next()?);
        let leaf = parts.next()?;
        if parts.next().is_some() {
            return None;
        }
        let version: i64 = leaf.strip_suffix(".blob")?.parse().ok()?;
        Some(LogKey {
            id,
            version,
            key: key.to_string(),
        })
    }

    /// Key of the highest version logged for `(data_type, id)`, if any.
    async fn latest_key(&self, data_type: DataType, id: &str) -> Result<Option<String>> {
        let keys = self.objects.list_objects(&Self::type_prefix(data_type)).await?;
        Ok(keys
            .iter()
            .filter_map(|k| Self::parse_key(k))
            .filter(|parsed| parsed.id == id)
            .max_by_key(|parsed| parsed.version)
            .map(|parsed| parsed.key))
    }

    async fn fetch_record(&self, key: &str) -> Result<Record> {
        let bytes = self.objects.get_object(key).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| CoreError::store(format!("malformed log object '{key}': {e}")))
    }

    /// Latest version of every record of a type.
    async fn latest_records(&self, data_type: DataType) -> Result<Vec<Record>> {
        let keys = self.objects.list_objects(&Self::type_prefix(data_type)).await?;
        let mut latest: std::collections::HashMap<String, LogKey> = std::collections::HashMap::new();
        for parsed in keys.iter().filter_map(|k| Self::parse_key(k)) {
            match latest.get(&parsed.id) {
                Some(existing) if existing.version >= parsed.version => {}
                _ => {
                    latest.insert(parsed.id.clone(), parsed);
                }
            }
        }
        let mut records = Vec::with_capacity(latest.len());
        for parsed in latest.values() {
            records.push(self.fetch_record(&parsed.key).await?);
        }
        Ok(records)
    }
}

#[async_trait]
impl StoreAdapter for ObjectRecordStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Object
    }

    async fn get(&self, data_type: DataType, id: &str) -> Result<Option<Record>> {
        match self.latest_key(data_type, id).await? {
            Some(key) => Ok(Some(self.fetch_record(&key).await?)),
            None => Ok(None),
        }
    }

    async fn put(&self, record: &Record) -> Result<PutOutcome> {
        // Append-only: every version lands under its own key, so a stale
        // writer cannot clobber a newer one. Reads resolve the winner.
        let bytes = serde_json::to_vec(record)?;
        self.objects.put_object(&Self::record_key(record), bytes).await?;
        Ok(PutOutcome::Applied)
    }

    async fn delete(&self, data_type: DataType, id: &str, at: i64) -> Result<PutOutcome> {
        let tombstone = match self.get(data_type, id).await? {
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
                origin: StoreKind::Object,
                version: 1,
            },
        };
        self.put(&tombstone).await
    }

    async fn list_since(
        &self,
        data_type: DataType,
        since_ms: i64,
        limit: usize,
    ) -> Result<Vec<Record>> {
        let mut records: Vec<Record> = self
            .latest_records(data_type)
            .await?
            .into_iter()
            .filter(|r| r.updated_at >= since_ms)
            .collect();
        records.sort_by(|a, b| (a.updated_at, &a.id).cmp(&(b.updated_at, &b.id)));
        records.truncate(limit);
        Ok(records)
    }

    async fn count_live(&self, data_type: DataType) -> Result<u64> {
        Ok(self
            .latest_records(data_type)
            .await?
            .iter()
            .filter(|r| !r.deleted)
            .count() as u64)
    }

    async fn ping(&self) -> Result<()> {
        self.objects.ping().await
    }

    async fn apply_batch(&self, batch: RecordBatch) -> Result<Vec<PutOutcome>> {
        // The log is append-only, so sequential application is safe to
        // retry; a partially applied batch never loses data.
        let mut outcomes = Vec::with_capacity(batch.puts.len() + batch.deletes.len());
        for record in &batch.puts {
            outcomes.push(self.put(record).await?);
        }
        for (data_type, id, at) in &batch.deletes {
            outcomes.push(self.delete(*data_type, id, *at).await?);
        }
        Ok(outcomes)
    }
}

fn encode_id(id: &str) -> String {
    id.replace('%', "%25").replace('/', "%2F")
}

fn decode_id(encoded: &str) -> String {
    encoded.replace("%2F", "/").replace("%25", "%")
}
