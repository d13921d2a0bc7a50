//! Per-account key/value state (the `profile` collection).

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};

use super::LocalStore;

/// Cache generation the proxy last activated
pub const ACTIVE_GENERATION: &str = "proxy.active_generation";
/// RFC 3339 time of the last drain that emptied the queue
pub const LAST_DRAIN_AT: &str = "sync.last_drain_at";

impl LocalStore {
  pub fn profile_get(&self, key: &str) -> Result<Option<String>> {
    self.database().with_conn(|conn| {
      conn
        .query_row(
          "SELECT value FROM profile WHERE key = ?",
          params![key],
          |row| row.get(0),
        )
        .optional()
        .map_err(|e| eyre!("Failed to read profile key {}: {}", key, e))
    })
  }

  pub fn profile_set(&self, key: &str, value: &str) -> Result<()> {
    self.database().transaction(|tx| {
      tx.execute(
        "INSERT OR REPLACE INTO profile (key, value, updated_at) VALUES (?, ?, ?)",
        params![key, value, Utc::now().to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to write profile key {}: {}", key, e))?;
      Ok(())
    })
  }
}
