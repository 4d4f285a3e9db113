//! External store error classification.

use flowslide_core::CoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ExternalDbError>;

#[derive(Debug, Error)]
pub enum ExternalDbError {
    #[error("database error: {0}")]
    Diesel(#[from] diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("corrupt row: {0}")]
    CorruptRow(String),

    #[error("worker task error: {0}")]
    Task(String),
}

impl ExternalDbError {
    /// Transient failures the sync engine should retry with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            ExternalDbError::Pool(_) | ExternalDbError::Connection(_) => true,
            ExternalDbError::Diesel(diesel::result::Error::DatabaseError(
                diesel::result::DatabaseErrorKind::ClosedConnection,
                _,
            )) => true,
            ExternalDbError::Diesel(diesel::result::Error::BrokenTransactionManager) => true,
            _ => false,
        }
    }
}

impl From<ExternalDbError> for CoreError {
    fn from(err: ExternalDbError) -> Self {
        if err.is_transient() {
            CoreError::retryable(err.to_string())
        } else {
            CoreError::store(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_failures_are_transient() {
        assert!(ExternalDbError::Connection("reset by peer".into()).is_transient());
        assert!(!ExternalDbError::CorruptRow("origin".into()).is_transient());
    }

    #[test]
    fn transient_errors_map_to_retryable() {
        let core: CoreError = ExternalDbError::Connection("timeout".into()).into();
        assert!(core.is_retryable());
        let core: CoreError = ExternalDbError::CorruptRow("bad".into()).into();
        assert!(!core.is_retryable());
    }
}
