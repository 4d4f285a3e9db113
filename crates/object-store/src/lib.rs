//! R2 (S3-compatible) object store adapter.

pub mod errors;
pub mod r2;
pub mod rate_limit;

pub use errors::ObjectStoreError;
pub use r2::R2Store;
pub use rate_limit::TokenBucket;
