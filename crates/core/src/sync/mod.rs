//! Sync engine: conflict resolution, per-type workers, and the fast-path
//! config sync service.

mod config_sync;
mod conflict;
mod engine;
mod worker;

pub use config_sync::*;
pub use conflict::*;
pub use engine::*;
pub use worker::*;
