//! Durable, ordered log of mutations the remote has not confirmed yet.
//!
//! Entries are replayed by `timestamp`, then by insertion id. Timestamps are
//! clamped to never run backwards, so a later mutation of a record can never
//! sort ahead of an earlier one even if the wall clock jumps.

mod entry;

pub use entry::{
  DiscardOutcome, EntryStatus, FailOutcome, MutationKind, NewEntry, QueueEntry,
};

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Report, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::db::Database;
use crate::error::SyncError;
use crate::store;

const ENTRY_COLUMNS: &str = "id, kind, collection, target_local_id, payload, timestamp, \
   attempts, status, last_error, next_attempt_at";

/// Retry budget and backoff for transient failures.
#[derive(Debug, Clone)]
pub struct QueuePolicy {
  pub max_attempts: u32,
  pub backoff_base: Duration,
  pub backoff_cap: Duration,
}

impl Default for QueuePolicy {
  fn default() -> Self {
    Self::from_config(&SyncConfig::default())
  }
}

impl QueuePolicy {
  pub fn from_config(config: &SyncConfig) -> Self {
    Self {
      max_attempts: config.max_attempts,
      backoff_base: Duration::from_millis(config.backoff_base_ms),
      backoff_cap: Duration::from_millis(config.backoff_cap_ms),
    }
  }

  /// Delay before the next try after `attempts` failures: base * 2^(n-1),
  /// capped.
  pub fn backoff(&self, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(31);
    self
      .backoff_base
      .checked_mul(1u32 << exponent)
      .unwrap_or(self.backoff_cap)
      .min(self.backoff_cap)
  }
}

#[derive(Clone)]
pub struct SyncQueue {
  db: Database,
  policy: QueuePolicy,
}

impl SyncQueue {
  pub fn new(db: Database, policy: QueuePolicy) -> Self {
    Self { db, policy }
  }

  pub fn policy(&self) -> &QueuePolicy {
    &self.policy
  }

  pub fn enqueue(&self, entry: NewEntry) -> Result<i64> {
    self.db.transaction(|tx| enqueue_in(tx, &entry, Utc::now()))
  }

  /// Pending entries in replay order.
  pub fn peek_ordered(&self) -> Result<Vec<QueueEntry>> {
    self.select("status = ?", params![EntryStatus::Pending.as_str()])
  }

  /// Every queued entry in replay order, whatever its status.
  pub fn entries(&self) -> Result<Vec<QueueEntry>> {
    self.select("1 = 1", params![])
  }

  /// Per-record chains ready to replay at `now`.
  ///
  /// A chain is every pending entry for one target, in replay order. It is
  /// only returned when its head is pending and due: a chain whose head is
  /// failed, in flight or backing off stays put, and nothing behind that
  /// head may overtake it. Chains come back ordered by their head.
  pub fn peek_due(&self, now: DateTime<Utc>) -> Result<Vec<Vec<QueueEntry>>> {
    let mut chains: Vec<Vec<QueueEntry>> = Vec::new();
    let mut blocked: Vec<String> = Vec::new();

    for entry in self.entries()? {
      if blocked.contains(&entry.target_local_id) {
        continue;
      }
      if let Some(chain) = chains
        .iter_mut()
        .find(|c| c[0].target_local_id == entry.target_local_id)
      {
        if entry.status == EntryStatus::Pending {
          chain.push(entry);
        }
        continue;
      }
      if entry.status == EntryStatus::Pending && entry.is_due(now) {
        chains.push(vec![entry]);
      } else {
        blocked.push(entry.target_local_id);
      }
    }

    Ok(chains)
  }

  pub fn get(&self, id: i64) -> Result<Option<QueueEntry>> {
    self.db.with_conn(|conn| get_in(conn, id))
  }

  /// Entries waiting on the user.
  pub fn failed(&self) -> Result<Vec<QueueEntry>> {
    self.select("status = ?", params![EntryStatus::Failed.as_str()])
  }

  pub fn len(&self) -> Result<usize> {
    self.db.with_conn(|conn| {
      conn
        .query_row("SELECT COUNT(*) FROM queue_entries", [], |row| {
          row.get::<_, i64>(0)
        })
        .map(|n| n as usize)
        .map_err(|e| eyre!("Failed to count queue entries: {}", e))
    })
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  pub fn mark_in_flight(&self, id: i64) -> Result<()> {
    self.db.transaction(|tx| {
      let changed = tx
        .execute(
          "UPDATE queue_entries SET status = ? WHERE id = ? AND status = ?",
          params![
            EntryStatus::InFlight.as_str(),
            id,
            EntryStatus::Pending.as_str()
          ],
        )
        .map_err(|e| eyre!("Failed to mark entry {} in flight: {}", id, e))?;
      if changed == 0 {
        return Err(eyre!("queue entry {} is not pending", id));
      }
      Ok(())
    })
  }

  /// Drop a confirmed entry.
  pub fn complete(&self, id: i64) -> Result<()> {
    self.db.transaction(|tx| {
      if !complete_in(tx, id)? {
        return Err(Report::new(SyncError::NotFound(format!("queue entry {}", id))));
      }
      Ok(())
    })
  }

  /// Record a transient failure and reschedule with backoff. Once the
  /// attempt budget is spent the entry turns `Failed`.
  pub fn fail(&self, id: i64, error: &str) -> Result<FailOutcome> {
    let now = Utc::now();
    self.db.transaction(|tx| {
      let entry = get_in(tx, id)?
        .ok_or_else(|| Report::new(SyncError::NotFound(format!("queue entry {}", id))))?;
      let attempts = entry.attempts + 1;

      if attempts >= self.policy.max_attempts {
        set_status_in(tx, id, EntryStatus::Failed, attempts, error, now)?;
        warn!(id, attempts, error, "queue entry exhausted its retries");
        return Ok(FailOutcome::Exhausted { attempts });
      }

      let delay = chrono::Duration::from_std(self.policy.backoff(attempts))
        .map_err(|e| eyre!("Backoff out of range: {}", e))?;
      let next_attempt_at = now + delay;
      set_status_in(tx, id, EntryStatus::Pending, attempts, error, next_attempt_at)?;
      debug!(id, attempts, %next_attempt_at, "queue entry rescheduled");

      Ok(FailOutcome::Rescheduled {
        attempts,
        next_attempt_at,
      })
    })
  }

  /// Put an in-flight entry back in line without spending an attempt.
  /// Returns false when the entry was not in flight.
  pub fn release(&self, id: i64, error: &str) -> Result<bool> {
    self.db.with_conn(|conn| {
      let changed = conn
        .execute(
          "UPDATE queue_entries SET status = ?, last_error = ? WHERE id = ? AND status = ?",
          params![
            EntryStatus::Pending.as_str(),
            error,
            id,
            EntryStatus::InFlight.as_str()
          ],
        )
        .map_err(|e| eyre!("Failed to release entry {}: {}", id, e))?;
      Ok(changed > 0)
    })
  }

  /// Freeze an entry the remote refused. It stays until retried or
  /// discarded.
  pub fn reject(&self, id: i64, error: &str) -> Result<()> {
    let now = Utc::now();
    self.db.transaction(|tx| {
      let entry = get_in(tx, id)?
        .ok_or_else(|| Report::new(SyncError::NotFound(format!("queue entry {}", id))))?;
      set_status_in(tx, id, EntryStatus::Failed, entry.attempts + 1, error, now)?;
      warn!(id, error, "queue entry rejected by remote");
      Ok(())
    })
  }

  /// Put a failed entry back in line with a fresh attempt budget.
  pub fn retry(&self, id: i64) -> Result<()> {
    self.db.transaction(|tx| {
      let changed = tx
        .execute(
          "UPDATE queue_entries SET status = ?, attempts = 0, next_attempt_at = ?
           WHERE id = ? AND status = ?",
          params![
            EntryStatus::Pending.as_str(),
            Utc::now().timestamp_millis(),
            id,
            EntryStatus::Failed.as_str()
          ],
        )
        .map_err(|e| eyre!("Failed to retry entry {}: {}", id, e))?;
      if changed == 0 {
        return Err(Report::new(SyncError::NotFound(format!(
          "failed queue entry {}",
          id
        ))));
      }
      info!(id, "failed entry queued for retry");
      Ok(())
    })
  }

  /// Give up on a failed entry.
  ///
  /// Discarding a create whose record never reached the remote drops the
  /// whole chain for that record along with the record itself. Discarding a
  /// delete restores the tombstoned record.
  pub fn discard(&self, id: i64) -> Result<DiscardOutcome> {
    self.db.transaction(|tx| {
      let entry = match get_in(tx, id)? {
        Some(entry) if entry.status == EntryStatus::Failed => entry,
        _ => {
          return Err(Report::new(SyncError::NotFound(format!(
            "failed queue entry {}",
            id
          ))))
        }
      };
      let record = store::get_in(tx, &entry.target_local_id)?;
      let never_synced = record.as_ref().map_or(true, |r| r.server_id.is_none());

      let outcome = if entry.kind == MutationKind::Create && never_synced {
        let entries_removed = drop_chain_in(tx, &entry.target_local_id)?;
        let record_removed = store::delete_in(tx, &entry.target_local_id)?;
        DiscardOutcome {
          entries_removed,
          record_removed,
        }
      } else {
        complete_in(tx, id)?;
        if entry.kind == MutationKind::Delete {
          tx.execute(
            "UPDATE records SET deleted = 0 WHERE local_id = ?",
            params![entry.target_local_id],
          )
          .map_err(|e| eyre!("Failed to restore record: {}", e))?;
        }
        store::settle_in(tx, &entry.target_local_id)?;
        DiscardOutcome {
          entries_removed: 1,
          record_removed: false,
        }
      };

      info!(
        id,
        target = %entry.target_local_id,
        entries_removed = outcome.entries_removed,
        record_removed = outcome.record_removed,
        "failed entry discarded"
      );
      Ok(outcome)
    })
  }

  /// Return entries left in flight by a crashed drain to the pending state.
  /// They will be replayed once more; completed entries are already gone.
  pub fn recover_in_flight(&self) -> Result<usize> {
    self.db.transaction(|tx| {
      let recovered = tx
        .execute(
          "UPDATE queue_entries SET status = ? WHERE status = ?",
          params![EntryStatus::Pending.as_str(), EntryStatus::InFlight.as_str()],
        )
        .map_err(|e| eyre!("Failed to recover in-flight entries: {}", e))?;
      if recovered > 0 {
        info!(recovered, "recovered in-flight queue entries");
      }
      Ok(recovered)
    })
  }

  fn select(&self, filter: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<QueueEntry>> {
    self.db.with_conn(|conn| {
      let sql = format!(
        "SELECT {} FROM queue_entries WHERE {} ORDER BY timestamp, id",
        ENTRY_COLUMNS, filter
      );
      let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| eyre!("Failed to prepare queue query: {}", e))?;

      let raws: Vec<RawEntry> = stmt
        .query_map(params, read_row)
        .map_err(|e| eyre!("Failed to query queue: {}", e))?
        .collect::<rusqlite::Result<_>>()
        .map_err(|e| eyre!("Failed to read queue entry: {}", e))?;

      raws.into_iter().map(RawEntry::into_entry).collect()
    })
  }
}

/// Append an entry inside the caller's transaction.
pub(crate) fn enqueue_in(conn: &Connection, entry: &NewEntry, now: DateTime<Utc>) -> Result<i64> {
  let latest: Option<i64> = conn
    .query_row("SELECT MAX(timestamp) FROM queue_entries", [], |row| {
      row.get(0)
    })
    .map_err(|e| eyre!("Failed to read queue head: {}", e))?;
  let timestamp = latest.map_or(now.timestamp_millis(), |t| t.max(now.timestamp_millis()));

  let payload = serde_json::to_string(&entry.payload)
    .map_err(|e| eyre!("Failed to serialize payload: {}", e))?;

  conn
    .execute(
      "INSERT INTO queue_entries
         (kind, collection, target_local_id, payload, timestamp, attempts, status, next_attempt_at)
       VALUES (?, ?, ?, ?, ?, 0, ?, ?)",
      params![
        entry.kind.as_str(),
        entry.collection,
        entry.target_local_id,
        payload,
        timestamp,
        EntryStatus::Pending.as_str(),
        timestamp,
      ],
    )
    .map_err(|e| eyre!("Failed to enqueue {}: {}", entry.kind, e))?;

  Ok(conn.last_insert_rowid())
}

pub(crate) fn complete_in(conn: &Connection, id: i64) -> Result<bool> {
  let changed = conn
    .execute("DELETE FROM queue_entries WHERE id = ?", params![id])
    .map_err(|e| eyre!("Failed to complete entry {}: {}", id, e))?;
  Ok(changed > 0)
}

pub(crate) fn count_for_target_in(conn: &Connection, local_id: &str) -> Result<usize> {
  conn
    .query_row(
      "SELECT COUNT(*) FROM queue_entries WHERE target_local_id = ?",
      params![local_id],
      |row| row.get::<_, i64>(0),
    )
    .map(|n| n as usize)
    .map_err(|e| eyre!("Failed to count entries for {}: {}", local_id, e))
}

/// Whether a create for the record is still queued, in any status.
pub(crate) fn has_create_in(conn: &Connection, local_id: &str) -> Result<bool> {
  conn
    .query_row(
      "SELECT EXISTS(SELECT 1 FROM queue_entries WHERE target_local_id = ? AND kind = ?)",
      params![local_id, MutationKind::Create.as_str()],
      |row| row.get::<_, bool>(0),
    )
    .map_err(|e| eyre!("Failed to look up create for {}: {}", local_id, e))
}

/// Delete every entry queued for a record.
pub(crate) fn drop_chain_in(conn: &Connection, local_id: &str) -> Result<usize> {
  conn
    .execute(
      "DELETE FROM queue_entries WHERE target_local_id = ?",
      params![local_id],
    )
    .map_err(|e| eyre!("Failed to drop chain for {}: {}", local_id, e))
}

fn get_in(conn: &Connection, id: i64) -> Result<Option<QueueEntry>> {
  let sql = format!("SELECT {} FROM queue_entries WHERE id = ?", ENTRY_COLUMNS);
  conn
    .query_row(&sql, params![id], read_row)
    .optional()
    .map_err(|e| eyre!("Failed to query entry {}: {}", id, e))?
    .map(RawEntry::into_entry)
    .transpose()
}

fn set_status_in(
  conn: &Connection,
  id: i64,
  status: EntryStatus,
  attempts: u32,
  error: &str,
  next_attempt_at: DateTime<Utc>,
) -> Result<()> {
  conn
    .execute(
      "UPDATE queue_entries SET status = ?, attempts = ?, last_error = ?, next_attempt_at = ?
       WHERE id = ?",
      params![
        status.as_str(),
        attempts,
        error,
        next_attempt_at.timestamp_millis(),
        id
      ],
    )
    .map_err(|e| eyre!("Failed to update entry {}: {}", id, e))?;
  Ok(())
}

struct RawEntry {
  id: i64,
  kind: String,
  collection: String,
  target_local_id: String,
  payload: String,
  timestamp: i64,
  attempts: u32,
  status: String,
  last_error: Option<String>,
  next_attempt_at: i64,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawEntry> {
  Ok(RawEntry {
    id: row.get(0)?,
    kind: row.get(1)?,
    collection: row.get(2)?,
    target_local_id: row.get(3)?,
    payload: row.get(4)?,
    timestamp: row.get(5)?,
    attempts: row.get(6)?,
    status: row.get(7)?,
    last_error: row.get(8)?,
    next_attempt_at: row.get(9)?,
  })
}

impl RawEntry {
  fn into_entry(self) -> Result<QueueEntry> {
    let millis = |ms: i64| {
      DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| eyre!("Corrupt timestamp {} on entry {}", ms, self.id))
    };

    Ok(QueueEntry {
      id: self.id,
      kind: self.kind.parse().map_err(|e: String| eyre!(e))?,
      collection: self.collection,
      target_local_id: self.target_local_id,
      payload: serde_json::from_str(&self.payload)
        .map_err(|e| eyre!("Corrupt payload on entry {}: {}", self.id, e))?,
      timestamp: millis(self.timestamp)?,
      attempts: self.attempts,
      status: self.status.parse().map_err(|e: String| eyre!(e))?,
      last_error: self.last_error,
      next_attempt_at: millis(self.next_attempt_at)?,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::{LocalStore, Mutation};
  use serde_json::json;

  fn setup() -> (LocalStore, SyncQueue) {
    let db = Database::open_in_memory().unwrap();
    let policy = QueuePolicy {
      max_attempts: 3,
      backoff_base: Duration::from_millis(100),
      backoff_cap: Duration::from_millis(250),
    };
    (LocalStore::new(db.clone()), SyncQueue::new(db, policy))
  }

  fn entry(kind: MutationKind, target: &str) -> NewEntry {
    NewEntry {
      kind,
      collection: "coins".into(),
      target_local_id: target.into(),
      payload: json!({"target": target}),
    }
  }

  #[test]
  fn test_backoff_doubles_up_to_cap() {
    let policy = QueuePolicy {
      max_attempts: 6,
      backoff_base: Duration::from_secs(1),
      backoff_cap: Duration::from_secs(10),
    };
    assert_eq!(policy.backoff(1), Duration::from_secs(1));
    assert_eq!(policy.backoff(2), Duration::from_secs(2));
    assert_eq!(policy.backoff(3), Duration::from_secs(4));
    assert_eq!(policy.backoff(5), Duration::from_secs(10));
    assert_eq!(policy.backoff(40), Duration::from_secs(10));
  }

  #[test]
  fn test_peek_ordered_follows_insertion_within_same_millisecond() {
    let (_, queue) = setup();
    let a = queue.enqueue(entry(MutationKind::Create, "A")).unwrap();
    let b = queue.enqueue(entry(MutationKind::Create, "B")).unwrap();
    let c = queue.enqueue(entry(MutationKind::Update, "A")).unwrap();

    let ids: Vec<i64> = queue.peek_ordered().unwrap().iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![a, b, c]);
  }

  #[test]
  fn test_timestamps_never_run_backwards() {
    let (store, queue) = setup();
    let now = Utc::now();
    let later = now + chrono::Duration::minutes(5);

    store
      .database()
      .transaction(|tx| {
        enqueue_in(tx, &entry(MutationKind::Create, "A"), later)?;
        enqueue_in(tx, &entry(MutationKind::Update, "A"), now)?;
        Ok(())
      })
      .unwrap();

    let entries = queue.peek_ordered().unwrap();
    assert_eq!(entries[0].kind, MutationKind::Create);
    assert_eq!(entries[1].kind, MutationKind::Update);
    assert!(entries[1].timestamp >= entries[0].timestamp);
  }

  #[test]
  fn test_fail_reschedules_then_exhausts() {
    let (_, queue) = setup();
    let id = queue.enqueue(entry(MutationKind::Create, "A")).unwrap();
    queue.mark_in_flight(id).unwrap();

    match queue.fail(id, "connection reset").unwrap() {
      FailOutcome::Rescheduled {
        attempts,
        next_attempt_at,
      } => {
        assert_eq!(attempts, 1);
        assert!(next_attempt_at > Utc::now());
      }
      other => panic!("unexpected {:?}", other),
    }
    let pending = queue.get(id).unwrap().unwrap();
    assert_eq!(pending.status, EntryStatus::Pending);
    assert_eq!(pending.last_error.as_deref(), Some("connection reset"));

    queue.fail(id, "again").unwrap();
    assert_eq!(
      queue.fail(id, "and again").unwrap(),
      FailOutcome::Exhausted { attempts: 3 }
    );

    let failed = queue.failed().unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, id);
  }

  #[test]
  fn test_peek_due_groups_chains_and_respects_blocked_heads() {
    let (_, queue) = setup();
    let a1 = queue.enqueue(entry(MutationKind::Create, "A")).unwrap();
    let b1 = queue.enqueue(entry(MutationKind::Create, "B")).unwrap();
    let a2 = queue.enqueue(entry(MutationKind::Update, "A")).unwrap();
    let c1 = queue.enqueue(entry(MutationKind::Create, "C")).unwrap();
    let c2 = queue.enqueue(entry(MutationKind::Delete, "C")).unwrap();

    // B is backing off, C's create was rejected
    queue.fail(b1, "timeout").unwrap();
    queue.reject(c1, "bad").unwrap();

    let chains = queue.peek_due(Utc::now()).unwrap();
    assert_eq!(chains.len(), 1);
    let ids: Vec<i64> = chains[0].iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![a1, a2]);

    // once B's backoff elapses it comes back; C stays blocked
    let later = Utc::now() + chrono::Duration::seconds(5);
    let chains = queue.peek_due(later).unwrap();
    assert_eq!(chains.len(), 2);
    assert!(chains.iter().all(|c| c.iter().all(|e| e.id != c2)));

    let pending: Vec<i64> = queue.peek_ordered().unwrap().iter().map(|e| e.id).collect();
    assert_eq!(pending, vec![a1, b1, a2, c2]);
    assert_eq!(queue.entries().unwrap().len(), 5);
  }

  #[test]
  fn test_mark_in_flight_requires_pending() {
    let (_, queue) = setup();
    let id = queue.enqueue(entry(MutationKind::Create, "A")).unwrap();
    queue.mark_in_flight(id).unwrap();
    assert!(queue.mark_in_flight(id).is_err());
  }

  #[test]
  fn test_release_returns_entry_without_spending_an_attempt() {
    let (_, queue) = setup();
    let id = queue.enqueue(entry(MutationKind::Create, "A")).unwrap();
    assert!(!queue.release(id, "not sent").unwrap());

    queue.mark_in_flight(id).unwrap();
    assert!(queue.release(id, "Token has expired!").unwrap());

    let released = queue.get(id).unwrap().unwrap();
    assert_eq!(released.status, EntryStatus::Pending);
    assert_eq!(released.attempts, 0);
    assert_eq!(released.last_error.as_deref(), Some("Token has expired!"));
    assert_eq!(queue.peek_due(Utc::now()).unwrap().len(), 1);
  }

  #[test]
  fn test_complete_removes_entry() {
    let (_, queue) = setup();
    let id = queue.enqueue(entry(MutationKind::Create, "A")).unwrap();
    queue.complete(id).unwrap();
    assert!(queue.is_empty().unwrap());
    assert!(queue.complete(id).is_err());
  }

  #[test]
  fn test_reject_then_retry() {
    let (_, queue) = setup();
    let id = queue.enqueue(entry(MutationKind::Update, "A")).unwrap();
    queue.reject(id, "Country and Denomination are required").unwrap();
    assert_eq!(queue.get(id).unwrap().unwrap().status, EntryStatus::Failed);

    queue.retry(id).unwrap();
    let entry = queue.get(id).unwrap().unwrap();
    assert_eq!(entry.status, EntryStatus::Pending);
    assert_eq!(entry.attempts, 0);

    assert!(queue.retry(id).is_err());
  }

  #[test]
  fn test_discard_failed_create_drops_chain_and_record() {
    let (store, queue) = setup();
    let created = store
      .apply(Mutation::Save {
        collection: "coins".into(),
        local_id: Some("L1".into()),
        fields: json!({"name": "A"}),
      })
      .unwrap();
    store
      .apply(Mutation::Save {
        collection: "coins".into(),
        local_id: Some("L1".into()),
        fields: json!({"name": "B"}),
      })
      .unwrap();

    let create_id = created.queue_id.unwrap();
    queue.reject(create_id, "bad").unwrap();

    let outcome = queue.discard(create_id).unwrap();
    assert_eq!(outcome.entries_removed, 2);
    assert!(outcome.record_removed);
    assert!(queue.is_empty().unwrap());
    assert!(store.get("L1").unwrap().is_none());
  }

  #[test]
  fn test_discard_failed_delete_restores_record() {
    let (store, queue) = setup();
    let mut record = crate::store::Record::new("coins", json!({"name": "A"})).with_local_id("L1");
    record.server_id = Some("5".into());
    record.synced = true;
    store.put(record).unwrap();

    let removed = store
      .apply(Mutation::Remove {
        local_id: "L1".into(),
      })
      .unwrap();
    let id = removed.queue_id.unwrap();
    queue.reject(id, "forbidden").unwrap();

    assert!(queue.discard(id).unwrap().entries_removed == 1);
    let restored = store.get("L1").unwrap().unwrap();
    assert!(!restored.deleted);
    assert!(restored.synced);
  }

  #[test]
  fn test_discard_requires_failed_entry() {
    let (_, queue) = setup();
    let id = queue.enqueue(entry(MutationKind::Create, "A")).unwrap();
    let err = queue.discard(id).unwrap_err();
    assert!(matches!(
      err.downcast::<SyncError>(),
      Ok(SyncError::NotFound(_))
    ));
  }

  #[test]
  fn test_recover_in_flight_after_crash() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hoard.db");

    let (first, second) = {
      let db = Database::open(&path, Duration::from_secs(1)).unwrap();
      let queue = SyncQueue::new(db, QueuePolicy::default());
      let first = queue.enqueue(entry(MutationKind::Create, "A")).unwrap();
      let second = queue.enqueue(entry(MutationKind::Create, "B")).unwrap();
      queue.mark_in_flight(first).unwrap();
      queue.complete(first).unwrap();
      queue.mark_in_flight(second).unwrap();
      (first, second)
      // process "dies" here with `second` in flight
    };

    let db = Database::open(&path, Duration::from_secs(1)).unwrap();
    let queue = SyncQueue::new(db, QueuePolicy::default());
    assert_eq!(queue.recover_in_flight().unwrap(), 1);

    let entries = queue.peek_ordered().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, second);
    assert_eq!(entries[0].status, EntryStatus::Pending);
    assert!(queue.get(first).unwrap().is_none());
  }
}
