//! Background task: owns the proxy lifecycle and triggers drains.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::cache::CacheStorage;
use crate::connectivity::Connectivity;
use crate::message::ProxyMessage;
use crate::proxy::{Fetcher, NetworkProxy};
use crate::remote::RemoteApi;
use crate::sync::Reconciler;

/// Handle pages use to post messages to the worker.
pub type MessageSender = mpsc::UnboundedSender<ProxyMessage>;

/// Runs independently of any page. Drains are triggered by `SYNC_NOW`, by a
/// connectivity transition to online and by a periodic tick; the reconciler
/// itself makes overlapping triggers a no-op.
pub struct BackgroundWorker<S, F, R>
where
  S: CacheStorage + 'static,
  F: Fetcher + 'static,
  R: RemoteApi + 'static,
{
  proxy: Arc<NetworkProxy<S, F>>,
  /// None in network-only mode: there is no queue to drain
  reconciler: Option<Arc<Reconciler<R>>>,
  connectivity: Connectivity,
  tick: Duration,
  rx: mpsc::UnboundedReceiver<ProxyMessage>,
  drains: JoinSet<()>,
}

impl<S, F, R> BackgroundWorker<S, F, R>
where
  S: CacheStorage + 'static,
  F: Fetcher + 'static,
  R: RemoteApi + 'static,
{
  pub fn new(
    proxy: Arc<NetworkProxy<S, F>>,
    reconciler: Option<Arc<Reconciler<R>>>,
    connectivity: Connectivity,
    tick: Duration,
  ) -> (Self, MessageSender) {
    let (tx, rx) = mpsc::unbounded_channel();
    let worker = Self {
      proxy,
      reconciler,
      connectivity,
      tick,
      rx,
      drains: JoinSet::new(),
    };
    (worker, tx)
  }

  /// Process messages until every sender is gone, then wait for the drain
  /// in progress to finish.
  pub async fn run(mut self) {
    let mut ticker = tokio::time::interval_at(Instant::now() + self.tick, self.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut online = self.connectivity.subscribe();
    info!(tick_secs = self.tick.as_secs(), "background worker started");

    loop {
      tokio::select! {
        msg = self.rx.recv() => match msg {
          Some(msg) => self.handle(msg),
          None => break,
        },
        _ = ticker.tick() => self.spawn_drain("tick"),
        changed = online.changed() => {
          if changed.is_err() {
            break;
          }
          if *online.borrow_and_update() {
            self.spawn_drain("reconnected");
          }
        }
        Some(_) = self.drains.join_next(), if !self.drains.is_empty() => {}
      }
    }

    while self.drains.join_next().await.is_some() {}
    info!("background worker stopped");
  }

  fn handle(&mut self, msg: ProxyMessage) {
    debug!(?msg, "message received");
    match msg {
      ProxyMessage::SkipActivation => {
        self.proxy.activate();
      }
      ProxyMessage::SyncNow => self.spawn_drain("requested"),
      ProxyMessage::Connectivity { online } => {
        // a transition to online comes back round through the watch
        self.connectivity.set_online(online);
      }
      ProxyMessage::ClearCache => {
        self.proxy.clear_cache();
      }
    }
  }

  fn spawn_drain(&mut self, trigger: &'static str) {
    let Some(reconciler) = &self.reconciler else {
      return;
    };
    if reconciler.is_draining() {
      debug!(trigger, "drain already running");
      return;
    }
    let reconciler = Arc::clone(reconciler);
    self.drains.spawn(async move {
      match reconciler.drain().await {
        Ok(Some(report)) => debug!(trigger, %report, "drain pass done"),
        Ok(None) => debug!(trigger, "drain already running"),
        Err(e) => error!(trigger, error = %e, "drain failed"),
      }
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheLayer, SqliteStorage};
  use crate::config::ProxyConfig;
  use crate::db::Database;
  use crate::proxy::{ProxyState, RouteTable};
  use crate::queue::{QueuePolicy, SyncQueue};
  use crate::store::{LocalStore, Mutation};
  use crate::sync::ReconcilerOptions;
  use crate::testing::{FakeFetcher, FakeRemote};
  use serde_json::json;

  struct Harness {
    store: LocalStore,
    queue: SyncQueue,
    remote: Arc<FakeRemote>,
    proxy: Arc<NetworkProxy<SqliteStorage, FakeFetcher>>,
    connectivity: Connectivity,
    tx: MessageSender,
    handle: tokio::task::JoinHandle<()>,
  }

  fn start(generation: &str, db: Database) -> Harness {
    let store = LocalStore::new(db.clone());
    let queue = SyncQueue::new(db.clone(), QueuePolicy::default());
    let remote = Arc::new(FakeRemote::default());
    let connectivity = Connectivity::new(true);
    let proxy = Arc::new(
      NetworkProxy::new(
        CacheLayer::new(SqliteStorage::new(db), generation),
        FakeFetcher::default(),
        RouteTable::from_config(&ProxyConfig::default(), None),
        connectivity.clone(),
      )
      .with_profile(store.clone()),
    );
    proxy.install();
    let reconciler = Arc::new(Reconciler::new(
      store.clone(),
      queue.clone(),
      Arc::clone(&remote),
      connectivity.clone(),
      ReconcilerOptions::default(),
    ));
    let (worker, tx) = BackgroundWorker::new(
      Arc::clone(&proxy),
      Some(reconciler),
      connectivity.clone(),
      Duration::from_secs(3600),
    );
    let handle = tokio::spawn(worker.run());
    Harness {
      store,
      queue,
      remote,
      proxy,
      connectivity,
      tx,
      handle,
    }
  }

  async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..200 {
      if done() {
        return;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
  }

  #[tokio::test]
  async fn test_reconnect_triggers_drain() {
    let h = start("v1", Database::open_in_memory().unwrap());
    h.tx.send(ProxyMessage::Connectivity { online: false }).unwrap();
    wait_until(|| !h.connectivity.is_online()).await;

    h.store
      .apply(Mutation::Save {
        collection: "coins".into(),
        local_id: Some("L1".into()),
        fields: json!({"name": "A"}),
      })
      .unwrap();
    h.tx.send(ProxyMessage::SyncNow).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.remote.calls().is_empty());

    h.tx.send(ProxyMessage::Connectivity { online: true }).unwrap();
    wait_until(|| h.queue.is_empty().unwrap()).await;
    assert!(h.store.get("L1").unwrap().unwrap().synced);

    drop(h.tx);
    h.handle.await.unwrap();
  }

  #[tokio::test]
  async fn test_skip_activation_message_activates_waiting_generation() {
    let db = Database::open_in_memory().unwrap();
    let old = start("v1", db.clone());
    drop(old.tx);
    old.handle.await.unwrap();

    let new = start("v2", db);
    assert_eq!(new.proxy.state(), ProxyState::Waiting);
    new.tx.send(ProxyMessage::SkipActivation).unwrap();
    wait_until(|| new.proxy.state() == ProxyState::Active).await;

    new.tx.send(ProxyMessage::ClearCache).unwrap();
    drop(new.tx);
    new.handle.await.unwrap();
  }
}
