//! Persistence of the transition history.

use std::sync::Arc;

use async_trait::async_trait;
use diesel::prelude::*;

use flowslide_core::errors::Result as CoreResult;
use flowslide_core::mode::DeploymentMode;
use flowslide_core::transition::{TransitionLog, TransitionRecord, TransitionStatus};

use crate::db::{get_connection, SqlitePool, WriteHandle};
use crate::errors::{Result, StorageError};
use crate::schema::transition_log;

#[derive(Queryable, Identifiable, Insertable, Selectable, Debug, Clone)]
#[diesel(table_name = crate::schema::transition_log)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct TransitionRecordDB {
    pub id: String,
    pub from_mode: String,
    pub to_mode: String,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub status: String,
    pub reason: String,
    pub actor: String,
    pub error: Option<String>,
    pub snapshot_id: Option<String>,
}

impl From<&TransitionRecord> for TransitionRecordDB {
    fn from(record: &TransitionRecord) -> Self {
        Self {
            id: record.id.clone(),
            from_mode: record.from_mode.as_str().to_string(),
            to_mode: record.to_mode.as_str().to_string(),
            started_at: record.started_at,
            finished_at: record.finished_at,
            status: record.status.as_str().to_string(),
            reason: record.reason.clone(),
            actor: record.actor.clone(),
            error: record.error.clone(),
            snapshot_id: record.snapshot_id.clone(),
        }
    }
}

impl TryFrom<TransitionRecordDB> for TransitionRecord {
    type Error = StorageError;

    fn try_from(row: TransitionRecordDB) -> Result<TransitionRecord> {
        let parse_mode = |raw: &str| {
            raw.parse::<DeploymentMode>()
                .map_err(StorageError::CorruptRow)
        };
        Ok(TransitionRecord {
            from_mode: parse_mode(&row.from_mode)?,
            to_mode: parse_mode(&row.to_mode)?,
            status: TransitionStatus::parse(&row.status)
                .ok_or_else(|| StorageError::CorruptRow(format!("status '{}'", row.status)))?,
            id: row.id,
            started_at: row.started_at,
            finished_at: row.finished_at,
            reason: row.reason,
            actor: row.actor,
            error: row.error,
            snapshot_id: row.snapshot_id,
        })
    }
}

/// Append-only transition history in the local store file.
pub struct TransitionLogStore {
    pool: Arc<SqlitePool>,
    writer: WriteHandle,
}

impl TransitionLogStore {
    pub fn new(pool: Arc<SqlitePool>, writer: WriteHandle) -> Self {
        Self { pool, writer }
    }
}

#[async_trait]
impl TransitionLog for TransitionLogStore {
    async fn append(&self, record: &TransitionRecord) -> CoreResult<()> {
        let row = TransitionRecordDB::from(record);
        self.writer
            .exec(move |conn| {
                diesel::insert_into(transition_log::table)
                    .values(&row)
                    .execute(conn)?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn list(&self, limit: usize) -> CoreResult<Vec<TransitionRecord>> {
        let mut conn = get_connection(&self.pool)?;
        let rows: Vec<TransitionRecordDB> = transition_log::table
            .order(transition_log::started_at.desc())
            .limit(limit as i64)
            .load(&mut conn)
            .map_err(StorageError::from)?;
        Ok(rows
            .into_iter()
            .map(TransitionRecord::try_from)
            .collect::<Result<Vec<_>>>()?)
    }
}
