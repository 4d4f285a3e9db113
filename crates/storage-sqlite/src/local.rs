//! The local record store: adapter surface, change feed, cursors, and
//! tombstone garbage collection.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use log::debug;

use flowslide_core::clock::{format_millis, now_millis};
use flowslide_core::errors::Result as CoreResult;
use flowslide_core::policy::SyncDirection;
use flowslide_core::store::{
    CursorStore, DataType, LocalStore, PutOutcome, Record, RecordBatch, StoreAdapter, StoreKind,
    SyncCursor, WriteBarrier,
};

use crate::db::{create_pool, get_connection, SqlitePool, WriteHandle};
use crate::errors::{Result, StorageError};
use crate::schema::{records, sync_cursors, SCHEMA_DDL};

#[derive(Queryable, Identifiable, Insertable, AsChangeset, Selectable, Debug, Clone)]
#[diesel(primary_key(data_type, id))]
#[diesel(table_name = crate::schema::records)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct RecordDB {
    pub data_type: String,
    pub id: String,
    pub payload: String,
    pub updated_at: i64,
    pub deleted: i32,
    pub origin: String,
    pub version: i64,
}

impl From<&Record> for RecordDB {
    fn from(record: &Record) -> Self {
        Self {
            data_type: record.data_type.as_str().to_string(),
            id: record.id.clone(),
            payload: record.payload.clone(),
            updated_at: record.updated_at,
            deleted: record.deleted as i32,
            origin: record.origin.as_str().to_string(),
            version: record.version,
        }
    }
}

impl TryFrom<RecordDB> for Record {
    type Error = StorageError;

    fn try_from(row: RecordDB) -> Result<Record> {
        let data_type = DataType::parse(&row.data_type)
            .ok_or_else(|| StorageError::CorruptRow(format!("data_type '{}'", row.data_type)))?;
        let origin = StoreKind::parse(&row.origin)
            .ok_or_else(|| StorageError::CorruptRow(format!("origin '{}'", row.origin)))?;
        Ok(Record {
            data_type,
            id: row.id,
            payload: row.payload,
            updated_at: row.updated_at,
            deleted: row.deleted != 0,
            origin,
            version: row.version,
        })
    }
}

#[derive(Queryable, Identifiable, Insertable, AsChangeset, Selectable, Debug, Clone)]
#[diesel(primary_key(data_type, direction))]
#[diesel(table_name = crate::schema::sync_cursors)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SyncCursorDB {
    pub data_type: String,
    pub direction: String,
    pub watermark_ms: i64,
    pub applied_ids: String,
    pub updated_at: String,
}

/// The embedded single-file store.
pub struct LocalRecordStore {
    pool: Arc<SqlitePool>,
    writer: WriteHandle,
}

impl LocalRecordStore {
    /// Open (creating if needed) the store file and ensure the schema.
    pub fn open(path: &Path, barrier: WriteBarrier) -> Result<Self> {
        let pool = create_pool(path)?;
        let writer = WriteHandle::open(path, barrier)?;
        let mut conn = get_connection(&pool)?;
        diesel::connection::SimpleConnection::batch_execute(&mut *conn, SCHEMA_DDL)?;
        debug!("Local store opened at {}", path.display());
        Ok(Self { pool, writer })
    }

    /// Read pool, shared with sibling repositories over the same file.
    pub fn pool(&self) -> Arc<SqlitePool> {
        Arc::clone(&self.pool)
    }

    /// The serialized writer handle; all writers to the store file go
    /// through the same connection.
    pub fn writer(&self) -> WriteHandle {
        self.writer.clone()
    }

    fn upsert(conn: &mut SqliteConnection, record: &Record) -> Result<PutOutcome> {
        let existing: Option<RecordDB> = records::table
            .find((record.data_type.as_str(), record.id.as_str()))
            .first(conn)
            .optional()?;
        if let Some(existing) = existing {
            if existing.updated_at > record.updated_at {
                return Ok(PutOutcome::Superseded);
            }
        }
        let row = RecordDB::from(record);
        diesel::insert_into(records::table)
            .values(&row)
            .on_conflict((records::data_type, records::id))
            .do_update()
            .set(&row)
            .execute(conn)?;
        Ok(PutOutcome::Applied)
    }

    fn tombstone(
        conn: &mut SqliteConnection,
        data_type: DataType,
        id: &str,
        at: i64,
    ) -> Result<PutOutcome> {
        let existing: Option<RecordDB> = records::table
            .find((data_type.as_str(), id))
            .first(conn)
            .optional()?;
        let row = match existing {
            Some(existing) => {
                if existing.updated_at > at {
                    return Ok(PutOutcome::Superseded);
                }
                RecordDB {
                    payload: String::new(),
                    updated_at: at,
                    deleted: 1,
                    version: existing.version + 1,
                    ..existing
                }
            }
            None => RecordDB {
                data_type: data_type.as_str().to_string(),
                id: id.to_string(),
                payload: String::new(),
                updated_at: at,
                deleted: 1,
                origin: StoreKind::Local.as_str().to_string(),
                version: 1,
            },
        };
        diesel::insert_into(records::table)
            .values(&row)
            .on_conflict((records::data_type, records::id))
            .do_update()
            .set(&row)
            .execute(conn)?;
        Ok(PutOutcome::Applied)
    }
}

#[async_trait]
impl StoreAdapter for LocalRecordStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Local
    }

    async fn get(&self, data_type: DataType, id: &str) -> CoreResult<Option<Record>> {
        let mut conn = get_connection(&self.pool)?;
        let row: Option<RecordDB> = records::table
            .find((data_type.as_str(), id))
            .first(&mut conn)
            .optional()
            .map_err(StorageError::from)?;
        Ok(row.map(Record::try_from).transpose()?)
    }

    async fn put(&self, record: &Record) -> CoreResult<PutOutcome> {
        let record = record.clone();
        Ok(self
            .writer
            .exec(move |conn| Self::upsert(conn, &record))
            .await?)
    }

    async fn delete(&self, data_type: DataType, id: &str, at: i64) -> CoreResult<PutOutcome> {
        let id = id.to_string();
        Ok(self
            .writer
            .exec(move |conn| Self::tombstone(conn, data_type, &id, at))
            .await?)
    }

    async fn list_since(
        &self,
        data_type: DataType,
        since_ms: i64,
        limit: usize,
    ) -> CoreResult<Vec<Record>> {
        let mut conn = get_connection(&self.pool)?;
        let rows: Vec<RecordDB> = records::table
            .filter(records::data_type.eq(data_type.as_str()))
            .filter(records::updated_at.ge(since_ms))
            .order((records::updated_at.asc(), records::id.asc()))
            .limit(limit as i64)
            .load(&mut conn)
            .map_err(StorageError::from)?;
        Ok(rows
            .into_iter()
            .map(Record::try_from)
            .collect::<Result<Vec<_>>>()?)
    }

    async fn count_live(&self, data_type: DataType) -> CoreResult<u64> {
        let mut conn = get_connection(&self.pool)?;
        let count: i64 = records::table
            .filter(records::data_type.eq(data_type.as_str()))
            .filter(records::deleted.eq(0))
            .count()
            .get_result(&mut conn)
            .map_err(StorageError::from)?;
        Ok(count as u64)
    }

    async fn ping(&self) -> CoreResult<()> {
        let mut conn = get_connection(&self.pool)?;
        diesel::sql_query("SELECT 1")
            .execute(&mut conn)
            .map_err(StorageError::from)?;
        Ok(())
    }

    async fn apply_batch(&self, batch: RecordBatch) -> CoreResult<Vec<PutOutcome>> {
        Ok(self
            .writer
            .exec(move |conn| {
                conn.transaction(|conn| {
                    let mut outcomes = Vec::with_capacity(batch.puts.len() + batch.deletes.len());
                    for record in &batch.puts {
                        outcomes.push(Self::upsert(conn, record)?);
                    }
                    for (data_type, id, at) in &batch.deletes {
                        outcomes.push(Self::tombstone(conn, *data_type, id, *at)?);
                    }
                    Ok::<_, StorageError>(outcomes)
                })
            })
            .await?)
    }
}

#[async_trait]
impl CursorStore for LocalRecordStore {
    async fn load_cursor(
        &self,
        data_type: DataType,
        direction: SyncDirection,
    ) -> CoreResult<SyncCursor> {
        let mut conn = get_connection(&self.pool)?;
        let row: Option<SyncCursorDB> = sync_cursors::table
            .find((data_type.as_str(), direction.as_str()))
            .first(&mut conn)
            .optional()
            .map_err(StorageError::from)?;
        let Some(row) = row else {
            return Ok(SyncCursor::default());
        };
        let applied_ids: BTreeSet<String> = serde_json::from_str(&row.applied_ids)
            .map_err(|e| StorageError::CorruptRow(format!("applied_ids: {e}")))?;
        Ok(SyncCursor {
            watermark_ms: row.watermark_ms,
            applied_ids,
        })
    }

    async fn save_cursor(
        &self,
        data_type: DataType,
        direction: SyncDirection,
        cursor: &SyncCursor,
    ) -> CoreResult<()> {
        let row = SyncCursorDB {
            data_type: data_type.as_str().to_string(),
            direction: direction.as_str().to_string(),
            watermark_ms: cursor.watermark_ms,
            applied_ids: serde_json::to_string(&cursor.applied_ids)
                .map_err(|e| StorageError::CorruptRow(e.to_string()))?,
            updated_at: format_millis(now_millis()),
        };
        self.writer
            .exec(move |conn| {
                diesel::insert_into(sync_cursors::table)
                    .values(&row)
                    .on_conflict((sync_cursors::data_type, sync_cursors::direction))
                    .do_update()
                    .set(&row)
                    .execute(conn)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn reset_cursors(&self) -> CoreResult<()> {
        self.writer
            .exec(|conn| {
                diesel::delete(sync_cursors::table).execute(conn)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn reset_cursors_for(&self, data_type: DataType) -> CoreResult<()> {
        self.writer
            .exec(move |conn| {
                diesel::delete(
                    sync_cursors::table
                        .filter(sync_cursors::data_type.eq(data_type.as_str())),
                )
                .execute(conn)?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl LocalStore for LocalRecordStore {
    async fn purge_tombstones(&self, data_type: DataType, older_than_ms: i64) -> CoreResult<u64> {
        let purged = self
            .writer
            .exec(move |conn| {
                let purged = diesel::delete(
                    records::table
                        .filter(records::data_type.eq(data_type.as_str()))
                        .filter(records::deleted.eq(1))
                        .filter(records::updated_at.lt(older_than_ms)),
                )
                .execute(conn)?;
                Ok(purged as u64)
            })
            .await?;
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowslide_core::store::new_write_barrier;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, LocalRecordStore) {
        let dir = TempDir::new().unwrap();
        let store =
            LocalRecordStore::open(&dir.path().join("flowslide.db"), new_write_barrier()).unwrap();
        (dir, store)
    }

    fn record(id: &str, payload: &str, at: i64) -> Record {
        Record::new(DataType::Users, id, payload, at, StoreKind::Local)
    }

    #[tokio::test]
    async fn put_get_round_trip() {
        let (_dir, store) = open_store();
        let alice = record("alice", "{\"email\":\"a@example.com\"}", 1000);
        assert_eq!(store.put(&alice).await.unwrap(), PutOutcome::Applied);
        let back = store.get(DataType::Users, "alice").await.unwrap().unwrap();
        assert_eq!(back, alice);
        assert!(store.get(DataType::Users, "bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_put_leaves_stored_copy_intact() {
        let (_dir, store) = open_store();
        store.put(&record("alice", "{\"v\":2}", 200)).await.unwrap();
        assert_eq!(
            store.put(&record("alice", "{\"v\":1}", 100)).await.unwrap(),
            PutOutcome::Superseded
        );
        let back = store.get(DataType::Users, "alice").await.unwrap().unwrap();
        assert_eq!(back.payload, "{\"v\":2}");
    }

    #[tokio::test]
    async fn change_feed_orders_and_limits() {
        let (_dir, store) = open_store();
        for (id, at) in [("c", 300), ("a", 100), ("b", 200)] {
            store.put(&record(id, "{}", at)).await.unwrap();
        }
        let listed = store.list_since(DataType::Users, 150, 10).await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["b", "c"]);

        let limited = store.list_since(DataType::Users, 0, 2).await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn tombstones_count_and_purge() {
        let (_dir, store) = open_store();
        store.put(&record("alice", "{}", 100)).await.unwrap();
        store.put(&record("bob", "{}", 100)).await.unwrap();
        store.delete(DataType::Users, "alice", 200).await.unwrap();

        assert_eq!(store.count_live(DataType::Users).await.unwrap(), 1);
        // The tombstone is still in the change feed.
        let feed = store.list_since(DataType::Users, 150, 10).await.unwrap();
        assert_eq!(feed.len(), 1);
        assert!(feed[0].deleted);
        assert_eq!(feed[0].version, 2);

        assert_eq!(
            store.purge_tombstones(DataType::Users, 201).await.unwrap(),
            1
        );
        assert!(store.get(DataType::Users, "alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cursor_round_trip_and_reset() {
        let (_dir, store) = open_store();
        let mut cursor = SyncCursor::default();
        cursor.advance(&record("alice", "{}", 500));
        store
            .save_cursor(DataType::Users, SyncDirection::LocalToExternal, &cursor)
            .await
            .unwrap();

        let loaded = store
            .load_cursor(DataType::Users, SyncDirection::LocalToExternal)
            .await
            .unwrap();
        assert_eq!(loaded, cursor);

        store.reset_cursors_for(DataType::Users).await.unwrap();
        let fresh = store
            .load_cursor(DataType::Users, SyncDirection::LocalToExternal)
            .await
            .unwrap();
        assert_eq!(fresh, SyncCursor::default());
    }

    #[tokio::test]
    async fn batch_applies_atomically() {
        let (_dir, store) = open_store();
        store.put(&record("old", "{}", 100)).await.unwrap();
        let outcomes = store
            .apply_batch(RecordBatch {
                puts: vec![record("x", "{}", 300), record("y", "{}", 300)],
                deletes: vec![(DataType::Users, "old".to_string(), 400)],
            })
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 3);
        assert_eq!(store.count_live(DataType::Users).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn reopen_preserves_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("flowslide.db");
        {
            let store = LocalRecordStore::open(&path, new_write_barrier()).unwrap();
            store.put(&record("alice", "{}", 100)).await.unwrap();
        }
        let store = LocalRecordStore::open(&path, new_write_barrier()).unwrap();
        assert!(store.get(DataType::Users, "alice").await.unwrap().is_some());
    }
}
