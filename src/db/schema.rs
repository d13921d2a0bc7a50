//! Versioned schema for the local store.
//!
//! Each migration runs at most once per database, in version order, inside
//! the upgrade transaction. `PRAGMA user_version` records the last applied
//! version.

pub struct Migration {
  pub version: u32,
  pub description: &'static str,
  pub sql: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
  Migration {
    version: 1,
    description: "records and sync queue",
    sql: r#"
CREATE TABLE IF NOT EXISTS records (
    local_id TEXT PRIMARY KEY,
    collection TEXT NOT NULL,
    server_id TEXT,
    fields TEXT NOT NULL,
    synced INTEGER NOT NULL DEFAULT 0,
    deleted INTEGER NOT NULL DEFAULT 0,
    version INTEGER NOT NULL DEFAULT 1,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_records_collection ON records(collection);
CREATE UNIQUE INDEX IF NOT EXISTS idx_records_server_id
    ON records(collection, server_id) WHERE server_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS queue_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    collection TEXT NOT NULL,
    target_local_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending',
    last_error TEXT,
    next_attempt_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_queue_order ON queue_entries(timestamp, id);
CREATE INDEX IF NOT EXISTS idx_queue_target ON queue_entries(target_local_id);
"#,
  },
  Migration {
    version: 2,
    description: "proxy response cache",
    sql: r#"
CREATE TABLE IF NOT EXISTS cache_entries (
    key_hash TEXT NOT NULL,
    generation TEXT NOT NULL,
    request_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    content_type TEXT,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (generation, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_cache_cached_at ON cache_entries(cached_at);
"#,
  },
  Migration {
    version: 3,
    description: "profile",
    sql: r#"
CREATE TABLE IF NOT EXISTS profile (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#,
  },
];

/// Version a fully migrated database reports.
pub fn current_version() -> u32 {
  MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}
