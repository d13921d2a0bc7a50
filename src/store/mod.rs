//! Transactional local store for domain records.

mod profile;
mod record;

pub use profile::{ACTIVE_GENERATION, LAST_DRAIN_AT};
pub use record::{new_local_id, Applied, Mutation, Record};

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Report, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use tracing::{debug, warn};

use crate::db::Database;
use crate::error::SyncError;
use crate::queue::{self, MutationKind, NewEntry};

const RECORD_COLUMNS: &str =
  "local_id, collection, server_id, fields, synced, deleted, version, updated_at";

/// Record persistence over the shared database.
#[derive(Clone)]
pub struct LocalStore {
  db: Database,
}

impl LocalStore {
  pub fn new(db: Database) -> Self {
    Self { db }
  }

  pub fn database(&self) -> &Database {
    &self.db
  }

  /// Upsert by `local_id`, generating one if empty. A record without a
  /// server id is always stored as unsynced.
  pub fn put(&self, record: Record) -> Result<Record> {
    self.db.transaction(|tx| put_in(tx, record, Utc::now()))
  }

  /// Get a record by local id, including tombstones.
  pub fn get(&self, local_id: &str) -> Result<Option<Record>> {
    self.db.with_conn(|conn| get_in(conn, local_id))
  }

  pub fn get_by_server_id(&self, collection: &str, server_id: &str) -> Result<Option<Record>> {
    self.db.with_conn(|conn| {
      let sql = format!(
        "SELECT {} FROM records WHERE collection = ? AND server_id = ?",
        RECORD_COLUMNS
      );
      conn
        .query_row(&sql, params![collection, server_id], read_row)
        .optional()
        .map_err(|e| eyre!("Failed to query record: {}", e))?
        .map(RawRecord::into_record)
        .transpose()
    })
  }

  /// All live records of a collection, oldest write first. Tombstones are
  /// hidden.
  pub fn get_all(&self, collection: &str) -> Result<Vec<Record>> {
    self.db.with_conn(|conn| {
      let sql = format!(
        "SELECT {} FROM records WHERE collection = ? AND deleted = 0
         ORDER BY updated_at, local_id",
        RECORD_COLUMNS
      );
      let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

      let raws: Vec<RawRecord> = stmt
        .query_map(params![collection], read_row)
        .map_err(|e| eyre!("Failed to query records: {}", e))?
        .collect::<rusqlite::Result<_>>()
        .map_err(|e| eyre!("Failed to read record: {}", e))?;

      raws.into_iter().map(RawRecord::into_record).collect()
    })
  }

  /// Remove a record row. Returns whether it existed.
  pub fn delete(&self, local_id: &str) -> Result<bool> {
    self.db.transaction(|tx| delete_in(tx, local_id))
  }

  /// Apply a page mutation: the record change and its queue entry commit
  /// together or not at all.
  pub fn apply(&self, mutation: Mutation) -> Result<Applied> {
    self.db.transaction(|tx| apply_in(tx, mutation, Utc::now()))
  }

  /// Record the id the remote assigned. A record keeps its first server id.
  pub fn attach_server_id(&self, local_id: &str, server_id: &str) -> Result<()> {
    self
      .db
      .transaction(|tx| attach_server_id_in(tx, local_id, server_id))
  }

  /// Mark a record synced if the remote knows it and nothing is queued for
  /// it. Returns whether the record changed.
  pub fn mark_synced(&self, local_id: &str) -> Result<bool> {
    self.db.transaction(|tx| settle_in(tx, local_id))
  }

  /// Number of records not yet confirmed by the remote.
  pub fn pending_count(&self) -> Result<usize> {
    self.db.with_conn(|conn| {
      conn
        .query_row("SELECT COUNT(*) FROM records WHERE synced = 0", [], |row| {
          row.get::<_, i64>(0)
        })
        .map(|n| n as usize)
        .map_err(|e| eyre!("Failed to count pending records: {}", e))
    })
  }
}

fn apply_in(conn: &Connection, mutation: Mutation, now: DateTime<Utc>) -> Result<Applied> {
  match mutation {
    Mutation::Save {
      collection,
      local_id,
      fields,
    } => {
      let existing = match &local_id {
        Some(id) => get_in(conn, id)?,
        None => None,
      };

      let (kind, mut record) = match existing {
        Some(existing) if existing.deleted => {
          return Err(Report::new(SyncError::NotFound(format!(
            "record {} was deleted",
            existing.local_id
          ))));
        }
        Some(existing) => {
          if existing.collection != collection {
            return Err(eyre!(
              "record {} belongs to {}, not {}",
              existing.local_id,
              existing.collection,
              collection
            ));
          }
          // A record stored with `put` has no create queued yet.
          let kind = if existing.server_id.is_none()
            && !queue::has_create_in(conn, &existing.local_id)?
          {
            MutationKind::Create
          } else {
            MutationKind::Update
          };
          (kind, existing)
        }
        None => {
          let record = Record::new(collection, Value::Null)
            .with_local_id(local_id.unwrap_or_else(new_local_id));
          (MutationKind::Create, record)
        }
      };

      record.fields = fields;
      record.synced = false;
      record.version += 1;
      record.updated_at = now;
      upsert_row(conn, &record)?;

      let queue_id = queue::enqueue_in(
        conn,
        &NewEntry {
          kind,
          collection: record.collection.clone(),
          target_local_id: record.local_id.clone(),
          payload: record.fields.clone(),
        },
        now,
      )?;

      debug!(local_id = %record.local_id, kind = kind.as_str(), queue_id, "mutation applied");
      Ok(Applied {
        record,
        queue_id: Some(queue_id),
      })
    }
    Mutation::Remove { local_id } => {
      let mut record = match get_in(conn, &local_id)? {
        Some(record) if !record.deleted => record,
        _ => {
          return Err(Report::new(SyncError::NotFound(format!(
            "record {}",
            local_id
          ))))
        }
      };

      if record.server_id.is_none() && queue::count_for_target_in(conn, &local_id)? == 0 {
        // Nothing about this record ever left the device.
        delete_in(conn, &local_id)?;
        record.deleted = true;
        return Ok(Applied {
          record,
          queue_id: None,
        });
      }

      record.deleted = true;
      record.synced = false;
      record.version += 1;
      record.updated_at = now;
      upsert_row(conn, &record)?;

      let queue_id = queue::enqueue_in(
        conn,
        &NewEntry {
          kind: MutationKind::Delete,
          collection: record.collection.clone(),
          target_local_id: record.local_id.clone(),
          payload: Value::Null,
        },
        now,
      )?;

      debug!(local_id = %record.local_id, queue_id, "record tombstoned");
      Ok(Applied {
        record,
        queue_id: Some(queue_id),
      })
    }
  }
}

pub(crate) fn put_in(conn: &Connection, mut record: Record, now: DateTime<Utc>) -> Result<Record> {
  if record.local_id.is_empty() {
    record.local_id = new_local_id();
  }

  let existing = get_in(conn, &record.local_id)?;
  if let Some(existing) = &existing {
    if existing.collection != record.collection {
      return Err(eyre!(
        "record {} belongs to {}, not {}",
        existing.local_id,
        existing.collection,
        record.collection
      ));
    }
    match (&existing.server_id, &record.server_id) {
      (Some(current), Some(incoming)) if current != incoming => {
        return Err(eyre!(
          "record {} already has server id {}",
          record.local_id,
          current
        ));
      }
      (Some(current), None) => record.server_id = Some(current.clone()),
      _ => {}
    }
  }

  if record.server_id.is_none() {
    record.synced = false;
  }
  record.version = existing.map(|r| r.version + 1).unwrap_or(1);
  record.updated_at = now;

  upsert_row(conn, &record)?;
  Ok(record)
}

pub(crate) fn get_in(conn: &Connection, local_id: &str) -> Result<Option<Record>> {
  let sql = format!("SELECT {} FROM records WHERE local_id = ?", RECORD_COLUMNS);
  conn
    .query_row(&sql, params![local_id], read_row)
    .optional()
    .map_err(|e| eyre!("Failed to query record {}: {}", local_id, e))?
    .map(RawRecord::into_record)
    .transpose()
}

pub(crate) fn delete_in(conn: &Connection, local_id: &str) -> Result<bool> {
  let changed = conn
    .execute("DELETE FROM records WHERE local_id = ?", params![local_id])
    .map_err(|e| eyre!("Failed to delete record {}: {}", local_id, e))?;
  Ok(changed > 0)
}

/// Attach the server-assigned id. An existing id is never replaced.
pub(crate) fn attach_server_id_in(
  conn: &Connection,
  local_id: &str,
  server_id: &str,
) -> Result<()> {
  let current: Option<Option<String>> = conn
    .query_row(
      "SELECT server_id FROM records WHERE local_id = ?",
      params![local_id],
      |row| row.get(0),
    )
    .optional()
    .map_err(|e| eyre!("Failed to query record {}: {}", local_id, e))?;

  match current {
    None => Err(eyre!("record {} vanished before server id arrived", local_id)),
    Some(Some(existing)) => {
      if existing != server_id {
        warn!(
          local_id,
          existing = %existing,
          incoming = server_id,
          "ignoring second server id for record"
        );
      }
      Ok(())
    }
    Some(None) => {
      conn
        .execute(
          "UPDATE records SET server_id = ? WHERE local_id = ?",
          params![server_id, local_id],
        )
        .map_err(|e| eyre!("Failed to attach server id to {}: {}", local_id, e))?;
      Ok(())
    }
  }
}

/// Mark a record synced once it has a server id and nothing left queued.
pub(crate) fn settle_in(conn: &Connection, local_id: &str) -> Result<bool> {
  let changed = conn
    .execute(
      "UPDATE records SET synced = 1
       WHERE local_id = ?1 AND server_id IS NOT NULL AND deleted = 0
         AND NOT EXISTS (SELECT 1 FROM queue_entries WHERE target_local_id = ?1)",
      params![local_id],
    )
    .map_err(|e| eyre!("Failed to settle record {}: {}", local_id, e))?;
  Ok(changed > 0)
}

fn upsert_row(conn: &Connection, record: &Record) -> Result<()> {
  let fields = serde_json::to_string(&record.fields)
    .map_err(|e| eyre!("Failed to serialize record fields: {}", e))?;

  conn
    .execute(
      "INSERT INTO records
         (local_id, collection, server_id, fields, synced, deleted, version, updated_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?)
       ON CONFLICT(local_id) DO UPDATE SET
         server_id = excluded.server_id,
         fields = excluded.fields,
         synced = excluded.synced,
         deleted = excluded.deleted,
         version = excluded.version,
         updated_at = excluded.updated_at",
      params![
        record.local_id,
        record.collection,
        record.server_id,
        fields,
        record.synced,
        record.deleted,
        record.version as i64,
        record.updated_at.to_rfc3339_opts(SecondsFormat::Millis, true),
      ],
    )
    .map_err(|e| eyre!("Failed to store record {}: {}", record.local_id, e))?;

  Ok(())
}

struct RawRecord {
  local_id: String,
  collection: String,
  server_id: Option<String>,
  fields: String,
  synced: bool,
  deleted: bool,
  version: i64,
  updated_at: String,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
  Ok(RawRecord {
    local_id: row.get(0)?,
    collection: row.get(1)?,
    server_id: row.get(2)?,
    fields: row.get(3)?,
    synced: row.get(4)?,
    deleted: row.get(5)?,
    version: row.get(6)?,
    updated_at: row.get(7)?,
  })
}

impl RawRecord {
  fn into_record(self) -> Result<Record> {
    let fields = serde_json::from_str(&self.fields)
      .map_err(|e| eyre!("Corrupt fields for record {}: {}", self.local_id, e))?;
    let updated_at = DateTime::parse_from_rfc3339(&self.updated_at)
      .map_err(|e| eyre!("Corrupt timestamp for record {}: {}", self.local_id, e))?
      .with_timezone(&Utc);

    Ok(Record {
      local_id: self.local_id,
      collection: self.collection,
      server_id: self.server_id,
      fields,
      synced: self.synced,
      version: self.version as u64,
      updated_at,
      deleted: self.deleted,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::queue::SyncQueue;
  use serde_json::json;

  fn store() -> LocalStore {
    LocalStore::new(Database::open_in_memory().unwrap())
  }

  fn save(collection: &str, local_id: Option<&str>, fields: Value) -> Mutation {
    Mutation::Save {
      collection: collection.to_string(),
      local_id: local_id.map(String::from),
      fields,
    }
  }

  #[test]
  fn test_put_generates_local_id_and_marks_unsynced() {
    let store = store();
    let mut record = Record::new("coins", json!({"country": "France"}));
    record.synced = true;

    let stored = store.put(record).unwrap();
    assert!(!stored.local_id.is_empty());
    assert!(!stored.synced);
    assert_eq!(stored.version, 1);

    let again = store.put(stored.clone()).unwrap();
    assert_eq!(again.local_id, stored.local_id);
    assert_eq!(again.version, 2);
    assert_eq!(store.get_all("coins").unwrap().len(), 1);
  }

  #[test]
  fn test_put_keeps_server_id_once_assigned() {
    let store = store();
    let mut record = Record::new("coins", json!({})).with_local_id("L1");
    record.server_id = Some("7".into());
    record.synced = true;
    store.put(record).unwrap();

    let mut edit = store.get("L1").unwrap().unwrap();
    edit.server_id = None;
    let stored = store.put(edit).unwrap();
    assert_eq!(stored.server_id.as_deref(), Some("7"));

    let mut conflicting = stored.clone();
    conflicting.server_id = Some("8".into());
    assert!(store.put(conflicting).is_err());
    assert_eq!(
      store.get_by_server_id("coins", "7").unwrap().unwrap().local_id,
      "L1"
    );
  }

  #[test]
  fn test_get_all_is_scoped_to_collection() {
    let store = store();
    store.put(Record::new("coins", json!({"n": 1}))).unwrap();
    store.put(Record::new("coins", json!({"n": 2}))).unwrap();
    store.put(Record::new("wishlist", json!({"n": 3}))).unwrap();

    assert_eq!(store.get_all("coins").unwrap().len(), 2);
    assert_eq!(store.get_all("wishlist").unwrap().len(), 1);
    assert!(store.get_all("profile").unwrap().is_empty());
  }

  #[test]
  fn test_apply_writes_record_and_entry_together() {
    let store = store();
    let queue = SyncQueue::new(store.database().clone(), Default::default());

    let created = store
      .apply(save("coins", Some("L1"), json!({"name": "A"})))
      .unwrap();
    assert!(created.queue_id.is_some());
    assert!(!created.record.synced);

    let updated = store
      .apply(save("coins", Some("L1"), json!({"name": "B"})))
      .unwrap();
    assert_eq!(updated.record.version, 2);

    let entries = queue.peek_ordered().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].kind, MutationKind::Create);
    assert_eq!(entries[1].kind, MutationKind::Update);
    assert_eq!(entries[1].payload, json!({"name": "B"}));
    assert_eq!(store.pending_count().unwrap(), 1);
  }

  #[test]
  fn test_first_save_of_put_record_queues_create() {
    let store = store();
    let queue = SyncQueue::new(store.database().clone(), Default::default());
    store
      .put(Record::new("coins", json!({"name": "A"})).with_local_id("L1"))
      .unwrap();

    store
      .apply(save("coins", Some("L1"), json!({"name": "B"})))
      .unwrap();
    store
      .apply(save("coins", Some("L1"), json!({"name": "C"})))
      .unwrap();

    let kinds: Vec<_> = queue.peek_ordered().unwrap().iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![MutationKind::Create, MutationKind::Update]);
  }

  #[test]
  fn test_remove_tombstones_queued_record() {
    let store = store();
    store
      .apply(save("coins", Some("L1"), json!({"name": "A"})))
      .unwrap();

    let removed = store
      .apply(Mutation::Remove {
        local_id: "L1".into(),
      })
      .unwrap();
    assert!(removed.queue_id.is_some());

    let tombstone = store.get("L1").unwrap().unwrap();
    assert!(tombstone.deleted);
    assert!(store.get_all("coins").unwrap().is_empty());

    let err = store
      .apply(save("coins", Some("L1"), json!({"name": "C"})))
      .unwrap_err();
    assert!(matches!(
      err.downcast::<SyncError>(),
      Ok(SyncError::NotFound(_))
    ));
  }

  #[test]
  fn test_remove_of_local_only_record_deletes_immediately() {
    let store = store();
    let record = store.put(Record::new("coins", json!({}))).unwrap();

    let removed = store
      .apply(Mutation::Remove {
        local_id: record.local_id.clone(),
      })
      .unwrap();
    assert!(removed.queue_id.is_none());
    assert!(store.get(&record.local_id).unwrap().is_none());
  }

  #[test]
  fn test_remove_unknown_record_is_not_found() {
    let store = store();
    let err = store
      .apply(Mutation::Remove {
        local_id: "missing".into(),
      })
      .unwrap_err();
    assert!(matches!(
      err.downcast::<SyncError>(),
      Ok(SyncError::NotFound(_))
    ));
  }

  #[test]
  fn test_settle_requires_empty_chain() {
    let store = store();
    store
      .apply(save("coins", Some("L1"), json!({"name": "A"})))
      .unwrap();

    store
      .database()
      .transaction(|tx| {
        attach_server_id_in(tx, "L1", "42")?;
        assert!(!settle_in(tx, "L1")?);
        tx.execute("DELETE FROM queue_entries", [])
          .map_err(|e| eyre!("{}", e))?;
        assert!(settle_in(tx, "L1")?);
        Ok(())
      })
      .unwrap();

    let record = store.get("L1").unwrap().unwrap();
    assert!(record.synced);
    assert_eq!(record.server_id.as_deref(), Some("42"));
  }
}
