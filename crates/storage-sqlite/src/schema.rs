//! Table definitions of the local store file.

diesel::table! {
    records (data_type, id) {
        data_type -> Text,
        id -> Text,
        payload -> Text,
        updated_at -> BigInt,
        deleted -> Integer,
        origin -> Text,
        version -> BigInt,
    }
}

diesel::table! {
    sync_cursors (data_type, direction) {
        data_type -> Text,
        direction -> Text,
        watermark_ms -> BigInt,
        applied_ids -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    transition_log (id) {
        id -> Text,
        from_mode -> Text,
        to_mode -> Text,
        started_at -> BigInt,
        finished_at -> Nullable<BigInt>,
        status -> Text,
        reason -> Text,
        actor -> Text,
        error -> Nullable<Text>,
        snapshot_id -> Nullable<Text>,
    }
}

diesel::allow_tables_to_appear_in_same_query!(records, sync_cursors, transition_log);

/// DDL applied at open time; idempotent.
pub const SCHEMA_DDL: &str = "\
CREATE TABLE IF NOT EXISTS records (
    data_type TEXT NOT NULL,
    id TEXT NOT NULL,
    payload TEXT NOT NULL,
    updated_at BIGINT NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0,
    origin TEXT NOT NULL,
    version BIGINT NOT NULL DEFAULT 1,
    PRIMARY KEY (data_type, id)
);
CREATE INDEX IF NOT EXISTS idx_records_feed ON records (data_type, updated_at);
CREATE TABLE IF NOT EXISTS sync_cursors (
    data_type TEXT NOT NULL,
    direction TEXT NOT NULL,
    watermark_ms BIGINT NOT NULL DEFAULT 0,
    applied_ids TEXT NOT NULL DEFAULT '[]',
    updated_at TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (data_type, direction)
);
CREATE TABLE IF NOT EXISTS transition_log (
    id TEXT PRIMARY KEY NOT NULL,
    from_mode TEXT NOT NULL,
    to_mode TEXT NOT NULL,
    started_at BIGINT NOT NULL,
    finished_at BIGINT,
    status TEXT NOT NULL,
    reason TEXT NOT NULL,
    actor TEXT NOT NULL,
    error TEXT,
    snapshot_id TEXT
);
";
