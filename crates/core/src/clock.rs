//! Monotonic wall-clock source and record id generation.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{TimeZone, Utc};
use uuid::Uuid;

static LAST_MILLIS: AtomicI64 = AtomicI64::new(0);

/// Current wall-clock time in milliseconds since the epoch.
///
/// Never goes backward within a process: if the system clock steps back the
/// previous reading is returned until real time catches up again.
pub fn now_millis() -> i64 {
    let wall = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    LAST_MILLIS.fetch_max(wall, Ordering::SeqCst).max(wall)
}

/// Generate an id for a record that has no stable business key.
pub fn new_record_id() -> String {
    Uuid::new_v4().to_string()
}

/// Deterministic string form of a millisecond timestamp (RFC 3339, UTC).
pub fn format_millis(millis: i64) -> String {
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| millis.to_string())
}

/// Compact `yyyymmdd_HHMMSS` stamp used for backup prefixes.
pub fn backup_stamp(millis: i64) -> String {
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(|dt| dt.format("%Y%m%d_%H%M%S").to_string())
        .unwrap_or_else(|| millis.to_string())
}

/// `yyyymmdd` date partition used by the append-only object log.
pub fn date_partition(millis: i64) -> String {
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(|dt| dt.format("%Y%m%d").to_string())
        .unwrap_or_else(|| millis.to_string())
}
