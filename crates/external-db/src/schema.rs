//! Replica table definition on the external peer.

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

/// Idempotent DDL applied when the adapter connects.
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
";
