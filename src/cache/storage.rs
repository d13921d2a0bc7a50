//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};

use super::traits::{HttpResponse, RequestKey};
use crate::db::Database;

/// A single cached response.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: HttpResponse,
  /// When the response was cached
  pub cached_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// Every entry belongs to a cache generation; lookups only ever see the
/// generation they ask for.
pub trait CacheStorage: Send + Sync {
  /// Get the cached response for a request.
  fn get(&self, generation: &str, key: &RequestKey) -> Result<Option<CachedResponse>>;

  /// Store (or replace) the response for a request.
  fn put(&self, generation: &str, key: &RequestKey, response: &HttpResponse) -> Result<()>;

  /// Delete every entry not in `generation`.
  fn purge_other_generations(&self, generation: &str) -> Result<usize>;

  /// Delete entries cached before `cutoff`.
  fn evict_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize>;

  /// Delete everything.
  fn clear(&self) -> Result<usize>;
}

impl<T: CacheStorage + ?Sized> CacheStorage for Box<T> {
  fn get(&self, generation: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    (**self).get(generation, key)
  }

  fn put(&self, generation: &str, key: &RequestKey, response: &HttpResponse) -> Result<()> {
    (**self).put(generation, key, response)
  }

  fn purge_other_generations(&self, generation: &str) -> Result<usize> {
    (**self).purge_other_generations(generation)
  }

  fn evict_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
    (**self).evict_older_than(cutoff)
  }

  fn clear(&self) -> Result<usize> {
    (**self).clear()
  }
}

/// Storage implementation that doesn't cache anything.
/// Used when the local store is unavailable - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn get(&self, _generation: &str, _key: &RequestKey) -> Result<Option<CachedResponse>> {
    Ok(None) // Always miss
  }

  fn put(&self, _generation: &str, _key: &RequestKey, _response: &HttpResponse) -> Result<()> {
    Ok(()) // Discard
  }

  fn purge_other_generations(&self, _generation: &str) -> Result<usize> {
    Ok(0)
  }

  fn evict_older_than(&self, _cutoff: DateTime<Utc>) -> Result<usize> {
    Ok(0)
  }

  fn clear(&self) -> Result<usize> {
    Ok(0)
  }
}

/// SQLite-based cache storage, sharing the local store's database.
pub struct SqliteStorage {
  db: Database,
}

impl SqliteStorage {
  pub fn new(db: Database) -> Self {
    Self { db }
  }

  /// Number of entries in a generation.
  pub fn len(&self, generation: &str) -> Result<usize> {
    self.db.with_conn(|conn| {
      conn
        .query_row(
          "SELECT COUNT(*) FROM cache_entries WHERE generation = ?",
          params![generation],
          |row| row.get::<_, i64>(0),
        )
        .map(|n| n as usize)
        .map_err(|e| eyre!("Failed to count cache entries: {}", e))
    })
  }
}

impl CacheStorage for SqliteStorage {
  fn get(&self, generation: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let result: Option<(u16, Option<String>, Vec<u8>, String)> = self.db.with_conn(|conn| {
      conn
        .query_row(
          "SELECT status, content_type, body, cached_at FROM cache_entries
           WHERE generation = ? AND key_hash = ?",
          params![generation, key.cache_hash()],
          |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()
        .map_err(|e| eyre!("Failed to query cache: {}", e))
    })?;

    match result {
      Some((status, content_type, body, cached_at_str)) => {
        let cached_at = parse_datetime(&cached_at_str)?;
        Ok(Some(CachedResponse {
          response: HttpResponse {
            status,
            content_type,
            body,
          },
          cached_at,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, generation: &str, key: &RequestKey, response: &HttpResponse) -> Result<()> {
    self.db.transaction(|tx| {
      tx.execute(
        "INSERT OR REPLACE INTO cache_entries
           (key_hash, generation, request_key, status, content_type, body, cached_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
          key.cache_hash(),
          generation,
          key.to_string(),
          response.status,
          response.content_type,
          response.body,
          format_datetime(Utc::now()),
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;
      Ok(())
    })
  }

  fn purge_other_generations(&self, generation: &str) -> Result<usize> {
    self.db.transaction(|tx| {
      tx.execute(
        "DELETE FROM cache_entries WHERE generation != ?",
        params![generation],
      )
      .map_err(|e| eyre!("Failed to purge old cache generations: {}", e))
    })
  }

  fn evict_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
    self.db.transaction(|tx| {
      tx.execute(
        "DELETE FROM cache_entries WHERE cached_at < ?",
        params![format_datetime(cutoff)],
      )
      .map_err(|e| eyre!("Failed to evict cache entries: {}", e))
    })
  }

  fn clear(&self) -> Result<usize> {
    self.db.transaction(|tx| {
      tx.execute("DELETE FROM cache_entries", [])
        .map_err(|e| eyre!("Failed to clear cache: {}", e))
    })
  }
}

/// Fixed-width RFC 3339 so stored timestamps compare correctly as text.
fn format_datetime(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
