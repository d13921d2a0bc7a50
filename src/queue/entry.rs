//! Queue entry types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
  Create,
  Update,
  Delete,
}

impl MutationKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      MutationKind::Create => "create",
      MutationKind::Update => "update",
      MutationKind::Delete => "delete",
    }
  }
}

impl FromStr for MutationKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "create" => Ok(MutationKind::Create),
      "update" => Ok(MutationKind::Update),
      "delete" => Ok(MutationKind::Delete),
      other => Err(format!("unknown mutation kind '{}'", other)),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
  Pending,
  InFlight,
  /// Needs the user: retry or discard
  Failed,
}

impl EntryStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      EntryStatus::Pending => "pending",
      EntryStatus::InFlight => "in_flight",
      EntryStatus::Failed => "failed",
    }
  }
}

impl FromStr for EntryStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "pending" => Ok(EntryStatus::Pending),
      "in_flight" => Ok(EntryStatus::InFlight),
      "failed" => Ok(EntryStatus::Failed),
      other => Err(format!("unknown entry status '{}'", other)),
    }
  }
}

/// A mutation waiting for the remote to confirm it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueEntry {
  pub id: i64,
  pub kind: MutationKind,
  pub collection: String,
  pub target_local_id: String,
  pub payload: Value,
  pub timestamp: DateTime<Utc>,
  pub attempts: u32,
  pub status: EntryStatus,
  pub last_error: Option<String>,
  pub next_attempt_at: DateTime<Utc>,
}

impl QueueEntry {
  pub fn is_due(&self, now: DateTime<Utc>) -> bool {
    self.next_attempt_at <= now
  }

  /// One-line description for listing failed entries.
  pub fn summary(&self) -> String {
    let mut payload = self.payload.to_string();
    if payload.len() > 60 {
      let mut cut = 57;
      while !payload.is_char_boundary(cut) {
        cut -= 1;
      }
      payload.truncate(cut);
      payload.push_str("...");
    }
    format!(
      "{} {}/{} {}",
      self.kind, self.collection, self.target_local_id, payload
    )
  }
}

impl fmt::Display for MutationKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// What a page appends to the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEntry {
  pub kind: MutationKind,
  pub collection: String,
  pub target_local_id: String,
  pub payload: Value,
}

/// Result of a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
  Rescheduled {
    attempts: u32,
    next_attempt_at: DateTime<Utc>,
  },
  /// Attempt budget spent; the entry is now `Failed`
  Exhausted { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiscardOutcome {
  pub entries_removed: usize,
  pub record_removed: bool,
}
