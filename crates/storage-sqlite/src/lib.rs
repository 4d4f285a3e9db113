//! SQLite implementation of the local embedded store.
//!
//! One file holds every record plus the `sync_cursors` and
//! `transition_log` tables. Writes serialize through a dedicated writer
//! connection that honors the snapshot engine's advisory barrier.

pub mod db;
pub mod errors;
pub mod local;
pub mod schema;
pub mod transition_log;

pub use db::{create_pool, get_connection, SqlitePool, WriteHandle};
pub use errors::StorageError;
pub use local::LocalRecordStore;
pub use transition_log::TransitionLogStore;
