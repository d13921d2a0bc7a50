//! Page-side entry point.
//!
//! Every write goes through the local store and lands in the sync queue in
//! the same transaction, online or not. When the client believes it is
//! online it nudges the background worker so the write goes out right away.
//! If the store could not be opened the client runs network-only and says
//! so through `capabilities()`.
//!
//! All operations here return `SyncError`; nothing from SQLite or HTTP
//! leaks out raw.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::connectivity::Connectivity;
use crate::error::{SyncError, SyncResult};
use crate::message::ProxyMessage;
use crate::queue::{DiscardOutcome, QueueEntry, SyncQueue};
use crate::remote::RemoteApi;
use crate::store::{new_local_id, LocalStore, Mutation, Record, LAST_DRAIN_AT};
use crate::sync::{DrainReport, Reconciler};
use crate::worker::MessageSender;

/// What the client can promise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capabilities {
  /// Writes survive restarts and connectivity loss
  pub offline_durability: bool,
  /// Why durability is off
  #[serde(skip_serializing_if = "Option::is_none")]
  pub storage_error: Option<String>,
}

struct Durable<R: RemoteApi> {
  store: LocalStore,
  queue: SyncQueue,
  reconciler: Arc<Reconciler<R>>,
}

enum Mode<R: RemoteApi> {
  Durable(Durable<R>),
  NetworkOnly { reason: String },
}

pub struct OfflineClient<R: RemoteApi> {
  mode: Mode<R>,
  remote: Arc<R>,
  connectivity: Connectivity,
  signals: Option<MessageSender>,
}

impl<R: RemoteApi> OfflineClient<R> {
  pub fn durable(
    store: LocalStore,
    queue: SyncQueue,
    reconciler: Arc<Reconciler<R>>,
    remote: Arc<R>,
    connectivity: Connectivity,
  ) -> Self {
    Self {
      mode: Mode::Durable(Durable {
        store,
        queue,
        reconciler,
      }),
      remote,
      connectivity,
      signals: None,
    }
  }

  /// A client with no local store. Writes go straight to the remote and
  /// fail when it cannot be reached.
  pub fn network_only(
    remote: Arc<R>,
    connectivity: Connectivity,
    reason: impl Into<String>,
  ) -> Self {
    Self {
      mode: Mode::NetworkOnly {
        reason: reason.into(),
      },
      remote,
      connectivity,
      signals: None,
    }
  }

  /// Post messages to this background worker.
  pub fn with_signals(mut self, signals: MessageSender) -> Self {
    self.signals = Some(signals);
    self
  }

  pub fn capabilities(&self) -> Capabilities {
    match &self.mode {
      Mode::Durable(_) => Capabilities {
        offline_durability: true,
        storage_error: None,
      },
      Mode::NetworkOnly { reason } => Capabilities {
        offline_durability: false,
        storage_error: Some(reason.clone()),
      },
    }
  }

  fn local(&self) -> SyncResult<&Durable<R>> {
    match &self.mode {
      Mode::Durable(local) => Ok(local),
      Mode::NetworkOnly { reason } => Err(SyncError::StorageUnavailable {
        reason: reason.clone(),
      }),
    }
  }

  /// Post a message to the background worker, if there is one.
  pub fn signal(&self, msg: ProxyMessage) {
    if let Some(signals) = &self.signals {
      if signals.send(msg).is_err() {
        warn!("background worker is gone, message dropped");
      }
    }
  }

  fn nudge(&self) {
    if self.connectivity.is_online() {
      self.signal(ProxyMessage::SyncNow);
    }
  }

  /// Create or update a record. A record with an empty or unknown
  /// `local_id` is created.
  pub async fn save(&self, record: Record) -> SyncResult<Record> {
    match &self.mode {
      Mode::Durable(local) => {
        let local_id = Some(record.local_id).filter(|id| !id.is_empty());
        let applied = local
          .store
          .apply(Mutation::Save {
            collection: record.collection,
            local_id,
            fields: record.fields,
          })
          .map_err(SyncError::from_report)?;
        debug!(local_id = %applied.record.local_id, "record saved");
        self.nudge();
        Ok(applied.record)
      }
      Mode::NetworkOnly { .. } => self.save_remote(record).await,
    }
  }

  async fn save_remote(&self, mut record: Record) -> SyncResult<Record> {
    self.require_online()?;
    if record.local_id.is_empty() {
      record.local_id = new_local_id();
    }

    match &record.server_id {
      Some(server_id) => {
        self
          .remote
          .update(&record.collection, server_id, &record.local_id, &record.fields)
          .await?;
      }
      None => {
        let server_id = self
          .remote
          .create(&record.collection, &record.local_id, &record.fields)
          .await?;
        record.server_id = Some(server_id);
      }
    }

    record.synced = true;
    record.version += 1;
    record.updated_at = chrono::Utc::now();
    Ok(record)
  }

  /// Delete a record.
  pub async fn remove(&self, record: &Record) -> SyncResult<()> {
    match &self.mode {
      Mode::Durable(local) => {
        local
          .store
          .apply(Mutation::Remove {
            local_id: record.local_id.clone(),
          })
          .map_err(SyncError::from_report)?;
        self.nudge();
        Ok(())
      }
      Mode::NetworkOnly { .. } => {
        self.require_online()?;
        let server_id = record
          .server_id
          .as_deref()
          .ok_or_else(|| SyncError::NotFound(format!("record {}", record.local_id)))?;
        self
          .remote
          .delete(&record.collection, server_id, &record.local_id)
          .await?;
        Ok(())
      }
    }
  }

  fn require_online(&self) -> SyncResult<()> {
    if self.connectivity.is_online() {
      Ok(())
    } else {
      Err(SyncError::TransientNetworkFailure(
        "offline and no local storage".to_string(),
      ))
    }
  }

  pub fn get(&self, local_id: &str) -> SyncResult<Option<Record>> {
    let record = self
      .local()?
      .store
      .get(local_id)
      .map_err(SyncError::from_report)?;
    Ok(record.filter(|r| !r.deleted))
  }

  pub fn list(&self, collection: &str) -> SyncResult<Vec<Record>> {
    self
      .local()?
      .store
      .get_all(collection)
      .map_err(SyncError::from_report)
  }

  pub fn pending_count(&self) -> SyncResult<usize> {
    self
      .local()?
      .store
      .pending_count()
      .map_err(SyncError::from_report)
  }

  /// Everything still queued, in replay order.
  pub fn queue_entries(&self) -> SyncResult<Vec<QueueEntry>> {
    self
      .local()?
      .queue
      .entries()
      .map_err(SyncError::from_report)
  }

  /// Entries the user has to retry or discard.
  pub fn failed_entries(&self) -> SyncResult<Vec<QueueEntry>> {
    self
      .local()?
      .queue
      .failed()
      .map_err(SyncError::from_report)
  }

  pub fn retry(&self, id: i64) -> SyncResult<()> {
    self
      .local()?
      .queue
      .retry(id)
      .map_err(SyncError::from_report)?;
    self.nudge();
    Ok(())
  }

  pub fn discard(&self, id: i64) -> SyncResult<DiscardOutcome> {
    self
      .local()?
      .queue
      .discard(id)
      .map_err(SyncError::from_report)
  }

  /// Drain the queue now and wait for the result. `None` when another
  /// pass was already running.
  pub async fn sync_now(&self) -> SyncResult<Option<DrainReport>> {
    self
      .local()?
      .reconciler
      .drain()
      .await
      .map_err(SyncError::from_report)
  }

  /// When a drain last left the queue empty.
  pub fn last_drain_at(&self) -> SyncResult<Option<String>> {
    self
      .local()?
      .store
      .profile_get(LAST_DRAIN_AT)
      .map_err(SyncError::from_report)
  }

  pub fn is_online(&self) -> bool {
    self.connectivity.is_online()
  }
}
