//! External relational peer over Postgres.
//!
//! Connections are pooled, every statement is parameterized through
//! diesel, and transient disconnects surface as retryable failures so the
//! sync engine backs off instead of dropping records.

pub mod adapter;
pub mod errors;
pub mod schema;

pub use adapter::ExternalStore;
pub use errors::ExternalDbError;
