//! Record types held by the local store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A domain entity (collection item, wishlist entry) with two-phase identity.
///
/// `local_id` is the identity for the record's whole life. `server_id` is an
/// alias the remote assigns once; it is never reassigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
  pub local_id: String,
  pub collection: String,
  pub server_id: Option<String>,
  /// Domain attributes, opaque to this crate
  pub fields: Value,
  pub synced: bool,
  pub version: u64,
  pub updated_at: DateTime<Utc>,
  /// Deleted locally, waiting for the remote to confirm
  #[serde(default)]
  pub deleted: bool,
}

impl Record {
  /// A record that has not been stored yet. `put` assigns the local id.
  pub fn new(collection: impl Into<String>, fields: Value) -> Self {
    Self {
      local_id: String::new(),
      collection: collection.into(),
      server_id: None,
      fields,
      synced: false,
      version: 0,
      updated_at: Utc::now(),
      deleted: false,
    }
  }

  pub fn with_local_id(mut self, local_id: impl Into<String>) -> Self {
    self.local_id = local_id.into();
    self
  }

  pub fn is_pending(&self) -> bool {
    !self.synced
  }
}

/// Generate a collision-resistant local id.
pub fn new_local_id() -> String {
  uuid::Uuid::new_v4().to_string()
}

/// A page-originated change. Applying one writes the record and its queue
/// entry in the same transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
  /// Create (no local id, or an unknown one) or update a record
  Save {
    collection: String,
    local_id: Option<String>,
    fields: Value,
  },
  Remove { local_id: String },
}

/// Outcome of applying a mutation.
#[derive(Debug, Clone)]
pub struct Applied {
  pub record: Record,
  /// None when nothing had to reach the remote
  pub queue_id: Option<i64>,
}
