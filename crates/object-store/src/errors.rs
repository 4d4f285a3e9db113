//! Object store error classification.

use flowslide_core::CoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ObjectStoreError>;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object '{0}' not found")]
    NotFound(String),

    #[error("bucket unreachable: {0}")]
    Unreachable(String),

    #[error("request failed: {0}")]
    Request(String),
}

impl From<ObjectStoreError> for CoreError {
    fn from(err: ObjectStoreError) -> Self {
        match err {
            ObjectStoreError::NotFound(key) => CoreError::store(format!("object '{key}' not found")),
            ObjectStoreError::Unreachable(msg) => CoreError::PeerUnreachable(msg),
            // S3 request failures are overwhelmingly transient (throttling,
            // resets); retry with backoff.
            ObjectStoreError::Request(msg) => CoreError::retryable(msg),
        }
    }
}
