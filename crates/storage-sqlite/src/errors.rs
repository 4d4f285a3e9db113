//! Storage error type and its mapping into the core taxonomy.

use flowslide_core::CoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Diesel(#[from] diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("database file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt row: {0}")]
    CorruptRow(String),

    #[error("writer task error: {0}")]
    Writer(String),
}

impl From<StorageError> for CoreError {
    fn from(err: StorageError) -> Self {
        match err {
            // Pool exhaustion and I/O are transient for an embedded store.
            StorageError::Pool(e) => CoreError::retryable(e.to_string()),
            StorageError::Io(e) => CoreError::retryable(e.to_string()),
            StorageError::Diesel(diesel::result::Error::DatabaseError(_, ref info))
                if info.message().contains("locked") || info.message().contains("busy") =>
            {
                CoreError::retryable(info.message().to_string())
            }
            other => CoreError::store(other.to_string()),
        }
    }
}
