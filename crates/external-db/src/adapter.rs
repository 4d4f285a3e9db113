//! The Postgres peer adapter.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use diesel::connection::SimpleConnection;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use log::debug;

use flowslide_core::errors::Result as CoreResult;
use flowslide_core::store::{
    DataType, PutOutcome, Record, RecordBatch, StoreAdapter, StoreKind,
};

use crate::errors::{ExternalDbError, Result};
use crate::schema::records;

pub type PgPool = Pool<ConnectionManager<PgConnection>>;

const POOL_SIZE: u32 = 8;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Queryable, Identifiable, Insertable, AsChangeset, Selectable, Debug, Clone)]
#[diesel(primary_key(data_type, id))]
#[diesel(table_name = crate::schema::records)]
#[diesel(check_for_backend(diesel::pg::Pg))]
struct RecordDB {
    data_type: String,
    id: String,
    payload: String,
    updated_at: i64,
    deleted: i32,
    origin: String,
    version: i64,
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
    type Error = ExternalDbError;

    fn try_from(row: RecordDB) -> Result<Record> {
        let data_type = DataType::parse(&row.data_type)
            .ok_or_else(|| ExternalDbError::CorruptRow(format!("data_type '{}'", row.data_type)))?;
        let origin = StoreKind::parse(&row.origin)
            .ok_or_else(|| ExternalDbError::CorruptRow(format!("origin '{}'", row.origin)))?;
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

/// Pooled adapter over the external relational store.
pub struct ExternalStore {
    pool: Arc<PgPool>,
}

impl ExternalStore {
    /// Connect, ensure the replica schema, and return the adapter.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let manager = ConnectionManager::<PgConnection>::new(database_url);
        let pool = Pool::builder()
            .max_size(POOL_SIZE)
            .connection_timeout(CONNECT_TIMEOUT)
            .build(manager)
            .map_err(|e| ExternalDbError::Connection(e.to_string()))?;
        let store = Self {
            pool: Arc::new(pool),
        };
        store
            .run(|conn| {
                conn.batch_execute(crate::schema::SCHEMA_DDL)?;
                Ok(())
            })
            .await?;
        debug!("External store connected");
        Ok(store)
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut PgConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = Arc::clone(&self.pool);
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await
        .map_err(|e| ExternalDbError::Task(format!("blocking task panicked: {e}")))?
    }

    fn upsert(conn: &mut PgConnection, record: &Record) -> Result<PutOutcome> {
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
        conn: &mut PgConnection,
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
                origin: StoreKind::External.as_str().to_string(),
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
impl StoreAdapter for ExternalStore {
    fn kind(&self) -> StoreKind {
        StoreKind::External
    }

    async fn get(&self, data_type: DataType, id: &str) -> CoreResult<Option<Record>> {
        let id = id.to_string();
        let row = self
            .run(move |conn| {
                Ok(records::table
                    .find((data_type.as_str(), id.as_str()))
                    .first::<RecordDB>(conn)
                    .optional()?)
            })
            .await?;
        Ok(row.map(Record::try_from).transpose()?)
    }

    async fn put(&self, record: &Record) -> CoreResult<PutOutcome> {
        let record = record.clone();
        Ok(self.run(move |conn| Self::upsert(conn, &record)).await?)
    }

    async fn delete(&self, data_type: DataType, id: &str, at: i64) -> CoreResult<PutOutcome> {
        let id = id.to_string();
        Ok(self
            .run(move |conn| Self::tombstone(conn, data_type, &id, at))
            .await?)
    }

    async fn list_since(
        &self,
        data_type: DataType,
        since_ms: i64,
        limit: usize,
    ) -> CoreResult<Vec<Record>> {
        let rows = self
            .run(move |conn| {
                Ok(records::table
                    .filter(records::data_type.eq(data_type.as_str()))
                    .filter(records::updated_at.ge(since_ms))
                    .order((records::updated_at.asc(), records::id.asc()))
                    .limit(limit as i64)
                    .load::<RecordDB>(conn)?)
            })
            .await?;
        Ok(rows
            .into_iter()
            .map(Record::try_from)
            .collect::<Result<Vec<_>>>()?)
    }

    async fn count_live(&self, data_type: DataType) -> CoreResult<u64> {
        let count = self
            .run(move |conn| {
                Ok(records::table
                    .filter(records::data_type.eq(data_type.as_str()))
                    .filter(records::deleted.eq(0))
                    .count()
                    .get_result::<i64>(conn)?)
            })
            .await?;
        Ok(count as u64)
    }

    async fn ping(&self) -> CoreResult<()> {
        self.run(|conn| {
            diesel::sql_query("SELECT 1").execute(conn)?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn apply_batch(&self, batch: RecordBatch) -> CoreResult<Vec<PutOutcome>> {
        Ok(self
            .run(move |conn| {
                conn.transaction(|conn| {
                    let mut outcomes = Vec::with_capacity(batch.puts.len() + batch.deletes.len());
                    for record in &batch.puts {
                        outcomes.push(Self::upsert(conn, record)?);
                    }
                    for (data_type, id, at) in &batch.deletes {
                        outcomes.push(Self::tombstone(conn, *data_type, id, *at)?);
                    }
                    Ok(outcomes)
                })
            })
            .await?)
    }
}
