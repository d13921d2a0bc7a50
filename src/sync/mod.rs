//! Reconciler: replays the sync queue against the remote API.
//!
//! A drain pass groups due entries into per-record chains and runs chains
//! concurrently, up to `worker_limit` at once. Inside a chain entries go out
//! one at a time in queue order, so a record's create always lands before
//! its updates and delete.
//!
//! Outcomes per entry:
//! - Success: the record change and the queue removal commit together
//! - Transient failure: backoff, and the whole pass stops
//! - Permanent rejection: the entry is frozen as failed; other records go on
//! - Refused credentials: the pass stops and every entry stays pending
//! - Ordering deferral: the chain waits for the next pass

mod plan;

use chrono::{SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Report, Result};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::connectivity::Connectivity;
use crate::error::{SyncError, SyncResult};
use crate::queue::{self, FailOutcome, MutationKind, QueueEntry, SyncQueue};
use crate::remote::RemoteApi;
use crate::store::{self, LocalStore, LAST_DRAIN_AT};
use plan::Step;

#[derive(Debug, Clone)]
pub struct ReconcilerOptions {
  pub worker_limit: usize,
  pub request_timeout: Duration,
}

impl ReconcilerOptions {
  pub fn from_config(config: &SyncConfig) -> Self {
    Self {
      worker_limit: config.worker_limit.max(1),
      request_timeout: Duration::from_secs(config.request_timeout_secs),
    }
  }
}

impl Default for ReconcilerOptions {
  fn default() -> Self {
    Self::from_config(&SyncConfig::default())
  }
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
  /// Entries the remote confirmed (coalesced updates included)
  pub completed: usize,
  /// Entries settled without a network call
  pub skipped_locally: usize,
  /// Entries left for a later pass
  pub deferred: usize,
  /// Entries that turned `Failed` during this pass
  pub failed: usize,
  /// The pass ended early on a transient failure
  pub stopped_transient: bool,
  /// The pass ended early because the remote refused the credentials
  pub auth_required: bool,
}

impl DrainReport {
  fn merge(&mut self, other: DrainReport) {
    self.completed += other.completed;
    self.skipped_locally += other.skipped_locally;
    self.deferred += other.deferred;
    self.failed += other.failed;
    self.stopped_transient |= other.stopped_transient;
    self.auth_required |= other.auth_required;
  }
}

impl fmt::Display for DrainReport {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{} completed, {} settled locally, {} deferred, {} failed",
      self.completed, self.skipped_locally, self.deferred, self.failed
    )?;
    if self.auth_required {
      write!(f, " (credentials refused)")?;
    } else if self.stopped_transient {
      write!(f, " (stopped early)")?;
    }
    Ok(())
  }
}

/// Resets the drain flag however the pass ends, including cancellation.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

pub struct Reconciler<R: RemoteApi> {
  store: LocalStore,
  queue: SyncQueue,
  remote: Arc<R>,
  connectivity: Connectivity,
  options: ReconcilerOptions,
  draining: AtomicBool,
}

impl<R: RemoteApi> Reconciler<R> {
  pub fn new(
    store: LocalStore,
    queue: SyncQueue,
    remote: Arc<R>,
    connectivity: Connectivity,
    options: ReconcilerOptions,
  ) -> Self {
    Self {
      store,
      queue,
      remote,
      connectivity,
      options,
      draining: AtomicBool::new(false),
    }
  }

  pub fn is_draining(&self) -> bool {
    self.draining.load(Ordering::SeqCst)
  }

  /// Run one pass over the queue.
  ///
  /// Returns `None` without doing anything when a pass is already running.
  /// Errors only for local storage failures; remote failures are recorded
  /// on their queue entries.
  pub async fn drain(&self) -> Result<Option<DrainReport>> {
    if self
      .draining
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      debug!("drain already running");
      return Ok(None);
    }
    let _guard = DrainGuard(&self.draining);

    if !self.connectivity.is_online() {
      debug!("offline, skipping drain");
      return Ok(Some(DrainReport::default()));
    }

    let chains = self.queue.peek_due(Utc::now())?;
    if chains.is_empty() {
      return Ok(Some(DrainReport::default()));
    }
    debug!(chains = chains.len(), "drain started");

    let stop = AtomicBool::new(false);
    let outcomes: Vec<Result<DrainReport>> = stream::iter(chains)
      .map(|chain| self.run_chain(chain, &stop))
      .buffer_unordered(self.options.worker_limit)
      .collect()
      .await;

    let mut report = DrainReport::default();
    for outcome in outcomes {
      report.merge(outcome?);
    }

    if self.queue.is_empty()? {
      let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
      self.store.profile_set(LAST_DRAIN_AT, &now)?;
    }

    info!(
      completed = report.completed,
      skipped_locally = report.skipped_locally,
      deferred = report.deferred,
      failed = report.failed,
      stopped_transient = report.stopped_transient,
      auth_required = report.auth_required,
      "drain finished"
    );
    Ok(Some(report))
  }

  /// Replay one record's entries in order.
  async fn run_chain(&self, chain: Vec<QueueEntry>, stop: &AtomicBool) -> Result<DrainReport> {
    let mut report = DrainReport::default();
    let target = chain[0].target_local_id.clone();

    let record = self.store.get(&target)?;
    let known_remotely = record.as_ref().map_or(false, |r| r.server_id.is_some());
    if plan::deletes_target(&chain) && !known_remotely {
      report.skipped_locally = self.discard_unsent(&target)?;
      return Ok(report);
    }

    let steps = plan::coalesce(chain);
    let mut remaining: usize = steps.iter().map(Step::len).sum();

    for step in steps {
      if stop.load(Ordering::SeqCst) {
        report.deferred += remaining;
        break;
      }
      if !self.connectivity.is_online() {
        debug!(target = %target, "connectivity lost mid-drain");
        stop.store(true, Ordering::SeqCst);
        report.stopped_transient = true;
        report.deferred += remaining;
        break;
      }

      let id = step.entry.id;
      remaining -= step.len();
      match self.replay(&step).await {
        Ok(()) => report.completed += step.len(),
        Err(SyncError::OrderingDeferral { local_id }) => {
          debug!(id, local_id = %local_id, "waiting on unresolved create");
          report.deferred += step.len() + remaining;
          break;
        }
        Err(err @ SyncError::TransientNetworkFailure(_)) => {
          stop.store(true, Ordering::SeqCst);
          report.stopped_transient = true;
          match self.queue.fail(id, &err.to_string())? {
            FailOutcome::Exhausted { .. } => report.failed += 1,
            FailOutcome::Rescheduled { attempts, .. } => {
              debug!(id, attempts, error = %err, "entry rescheduled");
              report.deferred += 1;
            }
          }
          report.deferred += step.superseded.len() + remaining;
          break;
        }
        Err(SyncError::Unauthorized(message)) => {
          warn!(id, message = %message, "remote refused credentials, pausing drain");
          stop.store(true, Ordering::SeqCst);
          report.auth_required = true;
          self.queue.release(id, &message)?;
          report.deferred += step.len() + remaining;
          break;
        }
        Err(SyncError::PermanentRejection { status, message }) => {
          self.queue.reject(id, &format!("{}: {}", status, message))?;
          report.failed += 1;
          report.deferred += step.superseded.len() + remaining;
          break;
        }
        Err(other) => {
          // Anything else is local; a sent request is replayed next pass
          // under the same idempotency key.
          if let Err(e) = self.queue.release(id, &other.to_string()) {
            warn!(id, error = %e, "could not return entry to the queue");
          }
          return Err(Report::new(other));
        }
      }
    }

    Ok(report)
  }

  /// Drop a chain whose record the remote never learned about, together
  /// with the record. Returns the number of entries dropped.
  fn discard_unsent(&self, local_id: &str) -> Result<usize> {
    let dropped = self.store.database().transaction(|tx| {
      let dropped = queue::drop_chain_in(tx, local_id)?;
      store::delete_in(tx, local_id)?;
      Ok(dropped)
    })?;
    debug!(local_id, dropped, "record deleted before it reached the remote");
    Ok(dropped)
  }

  /// Send one step and commit its result locally.
  async fn replay(&self, step: &Step) -> SyncResult<()> {
    let entry = &step.entry;
    let record = self
      .store
      .get(&entry.target_local_id)
      .map_err(SyncError::from_report)?;
    let server_id = record.as_ref().and_then(|r| r.server_id.clone());

    match entry.kind {
      MutationKind::Create => {
        if let Some(server_id) = server_id {
          // Already created by an earlier pass.
          return self.commit(step, Some(&server_id), false);
        }
        self.queue.mark_in_flight(entry.id).map_err(SyncError::from_report)?;
        let server_id = self
          .bounded(self.remote.create(&entry.collection, &entry.target_local_id, &entry.payload))
          .await?;
        self.commit(step, Some(&server_id), false)
      }
      MutationKind::Update => {
        let server_id = server_id.ok_or_else(|| SyncError::OrderingDeferral {
          local_id: entry.target_local_id.clone(),
        })?;
        self.queue.mark_in_flight(entry.id).map_err(SyncError::from_report)?;
        self
          .bounded(self.remote.update(
            &entry.collection,
            &server_id,
            &entry.target_local_id,
            &entry.payload,
          ))
          .await?;
        self.commit(step, None, false)
      }
      MutationKind::Delete => {
        let server_id = server_id.ok_or_else(|| SyncError::OrderingDeferral {
          local_id: entry.target_local_id.clone(),
        })?;
        self.queue.mark_in_flight(entry.id).map_err(SyncError::from_report)?;
        self
          .bounded(self.remote.delete(&entry.collection, &server_id, &entry.target_local_id))
          .await?;
        self.commit(step, None, true)
      }
    }
  }

  /// Bound a remote call by the request timeout. Timing out is transient.
  async fn bounded<T, F>(&self, call: F) -> SyncResult<T>
  where
    F: std::future::Future<Output = std::result::Result<T, crate::remote::RemoteError>>,
  {
    match tokio::time::timeout(self.options.request_timeout, call).await {
      Ok(result) => result.map_err(SyncError::from),
      Err(_) => Err(SyncError::TransientNetworkFailure(format!(
        "timed out after {:?}",
        self.options.request_timeout
      ))),
    }
  }

  /// Record a confirmed step: remove its entries and update the record in
  /// one transaction.
  fn commit(&self, step: &Step, server_id: Option<&str>, remove_record: bool) -> SyncResult<()> {
    let local_id = step.entry.target_local_id.as_str();
    self
      .store
      .database()
      .transaction(|tx| {
        if let Some(server_id) = server_id {
          store::attach_server_id_in(tx, local_id, server_id)?;
        }
        if !queue::complete_in(tx, step.entry.id)? {
          return Err(eyre!("queue entry {} vanished mid-drain", step.entry.id));
        }
        for id in &step.superseded {
          queue::complete_in(tx, *id)?;
        }
        if remove_record {
          store::delete_in(tx, local_id)?;
        } else {
          store::settle_in(tx, local_id)?;
        }
        Ok(())
      })
      .map_err(|e| {
        warn!(local_id, error = %e, "failed to record confirmed mutation");
        SyncError::from_report(e)
      })?;

    debug!(
      id = step.entry.id,
      local_id,
      kind = step.entry.kind.as_str(),
      coalesced = step.superseded.len(),
      "mutation confirmed"
    );
    Ok(())
  }
}
