//! Pool construction and the serialized writer handle.

use std::path::Path;
use std::sync::{Arc, Mutex};

use diesel::connection::SimpleConnection;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use diesel::Connection;
use flowslide_core::store::WriteBarrier;

use crate::errors::{Result, StorageError};

pub type SqlitePool = Pool<ConnectionManager<SqliteConnection>>;
pub type SqlitePooledConnection = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Applies the pragmas every connection needs: WAL for durable commits
/// with concurrent readers, and a busy timeout instead of immediate
/// `database is locked` failures.
#[derive(Debug)]
struct ConnectionPragmas;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionPragmas {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> std::result::Result<(), diesel::r2d2::Error> {
        conn.batch_execute(
            "PRAGMA journal_mode = WAL; \
             PRAGMA synchronous = NORMAL; \
             PRAGMA foreign_keys = ON; \
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Read pool over the local store file.
pub fn create_pool(path: &Path) -> Result<Arc<SqlitePool>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let manager = ConnectionManager::<SqliteConnection>::new(path.to_string_lossy().as_ref());
    let pool = Pool::builder()
        .max_size(8)
        .connection_customizer(Box::new(ConnectionPragmas))
        .build(manager)?;
    Ok(Arc::new(pool))
}

pub fn get_connection(pool: &SqlitePool) -> Result<SqlitePooledConnection> {
    Ok(pool.get()?)
}

/// Serializes writes through one dedicated connection.
///
/// Every write takes the read side of the snapshot barrier, so the
/// snapshot engine can quiesce the file by taking the write side.
#[derive(Clone)]
pub struct WriteHandle {
    conn: Arc<Mutex<SqliteConnection>>,
    barrier: WriteBarrier,
}

impl WriteHandle {
    pub fn open(path: &Path, barrier: WriteBarrier) -> Result<Self> {
        let mut conn = SqliteConnection::establish(path.to_string_lossy().as_ref())
            .map_err(|e| StorageError::Writer(e.to_string()))?;
        conn.batch_execute(
            "PRAGMA journal_mode = WAL; \
             PRAGMA synchronous = NORMAL; \
             PRAGMA foreign_keys = ON; \
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            barrier,
        })
    }

    /// Run a write closure on the writer connection off the async runtime.
    pub async fn exec<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let _writing = self.barrier.read().await;
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| StorageError::Writer("writer connection poisoned".to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StorageError::Writer(format!("writer task panicked: {e}")))?
    }
}
