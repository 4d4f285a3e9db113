//! Error types shared across the sync core.

use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors surfaced by the sync core.
///
/// `Retryable` is the only kind sync workers retry internally; everything
/// else propagates to the caller that issued the operation.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Transient network or database failure, safe to retry with backoff.
    #[error("retryable: {0}")]
    Retryable(String),

    /// Configuration rejected at a boundary; lists the offending fields.
    #[error("invalid configuration, missing or invalid fields: {}", missing.join(", "))]
    InvalidConfig { missing: Vec<String> },

    /// A store the operation depends on did not answer its ping.
    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    /// A live user with this id already exists on the external store.
    #[error("username '{0}' already exists")]
    UsernameConflict(String),

    /// The external store could not be consulted for the uniqueness check.
    #[error("username uniqueness unverifiable: {0}")]
    UniquenessUnverifiable(String),

    /// Another mode transition is already in flight.
    #[error("a mode transition is already in progress")]
    TransitionBusy,

    /// Snapshot content hash did not match its manifest on restore.
    #[error("snapshot '{0}' failed content verification")]
    CorruptSnapshot(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Store adapter failure that is not transient.
    #[error("store error: {0}")]
    Store(String),

    /// Filesystem failure during snapshot or restore.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected failure; the owning task logs it and restarts with backoff.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Create a retryable error from any displayable cause.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable(message.into())
    }

    /// Create a non-transient store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Create an invalid-config error from the missing field names.
    pub fn invalid_config<I, S>(missing: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::InvalidConfig {
            missing: missing.into_iter().map(Into::into).collect(),
        }
    }

    /// True when the operation may be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_config_lists_fields() {
        let err = CoreError::invalid_config(["database_url", "r2_bucket_name"]);
        let rendered = err.to_string();
        assert!(rendered.contains("database_url"));
        assert!(rendered.contains("r2_bucket_name"));
    }

    #[test]
    fn only_retryable_is_retryable() {
        assert!(CoreError::retryable("timeout").is_retryable());
        assert!(!CoreError::TransitionBusy.is_retryable());
        assert!(!CoreError::store("constraint").is_retryable());
    }
}
