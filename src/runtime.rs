//! Wiring: opens the store, installs the proxy and starts the background
//! worker.

use color_eyre::Result;
use reqwest::Url;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::{CacheLayer, CacheStorage, NoopStorage, SqliteStorage};
use crate::client::OfflineClient;
use crate::config::Config;
use crate::connectivity::Connectivity;
use crate::db::Database;
use crate::message::ProxyMessage;
use crate::proxy::{HttpFetcher, NetworkProxy, ProxyRequest, ProxyResponse, RouteTable};
use crate::queue::{QueuePolicy, SyncQueue};
use crate::remote::HttpRemote;
use crate::store::LocalStore;
use crate::sync::{Reconciler, ReconcilerOptions};
use crate::worker::{BackgroundWorker, MessageSender};

pub type Proxy = NetworkProxy<Box<dyn CacheStorage>, HttpFetcher>;

/// A running client: page-side handle plus the background worker.
pub struct Runtime {
  client: OfflineClient<HttpRemote>,
  proxy: Arc<Proxy>,
  signals: MessageSender,
  worker: JoinHandle<()>,
}

impl Runtime {
  /// Start everything. Must be called inside a tokio runtime.
  ///
  /// A store that fails to open is not fatal: the client comes up in
  /// network-only mode with an inert cache.
  pub fn start(config: &Config) -> Result<Self> {
    let token = Config::get_api_token();
    if token.is_none() {
      warn!("HOARD_API_TOKEN not set, requests go out unauthenticated");
    }
    let timeout = Duration::from_secs(config.sync.request_timeout_secs);
    let connectivity = Connectivity::new(true);
    let remote = Arc::new(HttpRemote::new(&config.remote, token.clone(), timeout)?);
    let origin = match Url::parse(config.proxy_origin()) {
      Ok(url) => Some(url),
      Err(e) => {
        warn!(
          origin = config.proxy_origin(),
          error = %e,
          "invalid proxy origin, intercepting every origin"
        );
        None
      }
    };
    let mut fetcher = HttpFetcher::new(timeout)?;
    if let (Some(origin), Some(token)) = (&origin, token) {
      fetcher = fetcher.with_token(origin, token);
    }
    let routes = RouteTable::from_config(&config.proxy, origin);

    let (client, storage, store, reconciler) = match open_local(config) {
      Ok((store, queue)) => {
        let reconciler = Arc::new(Reconciler::new(
          store.clone(),
          queue.clone(),
          Arc::clone(&remote),
          connectivity.clone(),
          ReconcilerOptions::from_config(&config.sync),
        ));
        let client = OfflineClient::durable(
          store.clone(),
          queue,
          Arc::clone(&reconciler),
          Arc::clone(&remote),
          connectivity.clone(),
        );
        let storage: Box<dyn CacheStorage> =
          Box::new(SqliteStorage::new(store.database().clone()));
        (client, storage, Some(store), Some(reconciler))
      }
      Err(e) => {
        warn!(error = %e, "offline storage unavailable, running network-only");
        let client =
          OfflineClient::network_only(Arc::clone(&remote), connectivity.clone(), e.to_string());
        let storage: Box<dyn CacheStorage> = Box::new(NoopStorage);
        (client, storage, None, None)
      }
    };

    let cache = CacheLayer::new(storage, config.proxy.generation.clone())
      .with_max_age(config.proxy.max_age());
    let mut proxy = NetworkProxy::new(cache, fetcher, routes, connectivity.clone())
      .with_skip_waiting(config.proxy.skip_waiting);
    if let Some(store) = store {
      proxy = proxy.with_profile(store);
    }
    let proxy = Arc::new(proxy);
    proxy.install();

    let (worker, signals) = BackgroundWorker::new(
      Arc::clone(&proxy),
      reconciler,
      connectivity,
      Duration::from_secs(config.sync.tick_secs.max(1)),
    );
    let worker = tokio::spawn(worker.run());
    let client = client.with_signals(signals.clone());

    Ok(Self {
      client,
      proxy,
      signals,
      worker,
    })
  }

  pub fn client(&self) -> &OfflineClient<HttpRemote> {
    &self.client
  }

  pub fn proxy(&self) -> &Proxy {
    &self.proxy
  }

  /// Post a page signal to the background worker.
  pub fn signal(&self, msg: ProxyMessage) {
    if self.signals.send(msg).is_err() {
      warn!("background worker is gone, message dropped");
    }
  }

  /// Send a request through the proxy.
  pub async fn fetch(&self, request: ProxyRequest) -> ProxyResponse {
    self.proxy.handle(&request).await
  }

  /// Close the message channel and wait for the worker to finish its
  /// current drain.
  pub async fn shutdown(self) {
    let Self {
      client,
      signals,
      worker,
      ..
    } = self;
    drop(client);
    drop(signals);
    if let Err(e) = worker.await {
      warn!(error = %e, "background worker ended abnormally");
    }
    info!("runtime stopped");
  }
}

/// Open the store and queue, and return anything a crashed drain left in
/// flight to the queue.
fn open_local(config: &Config) -> Result<(LocalStore, SyncQueue)> {
  let path = match &config.store.path {
    Some(path) => path.clone(),
    None => Database::default_path()?,
  };
  let db = Database::open(&path, config.store.busy_timeout())?;
  let queue = SyncQueue::new(db.clone(), QueuePolicy::from_config(&config.sync));
  queue.recover_in_flight()?;
  info!(path = %path.display(), "local store open");
  Ok((LocalStore::new(db), queue))
}
