//! Background interception layer for outgoing requests.
//!
//! The proxy answers every request it is handed, online or not:
//! - Cache-first for static assets, with a fixed placeholder when nothing
//!   is cached
//! - Network-first for API reads and page loads, with a structured offline
//!   marker when nothing is cached
//! - Passthrough for writes and foreign origins
//!
//! It is versioned by a cache generation. A newly installed generation
//! waits until it is activated; activation deletes every other generation's
//! entries before clients are claimed.

mod fetcher;
mod routes;

pub use fetcher::{FetchError, Fetcher, HttpFetcher, ProxyRequest};
pub use routes::{RouteTable, Strategy};

use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache::{CacheLayer, CacheSource, CacheStorage, HttpResponse, RequestKey};
use crate::connectivity::Connectivity;
use crate::store::{LocalStore, ACTIVE_GENERATION};

/// Body of the cache-first placeholder.
pub const OFFLINE_PLACEHOLDER: &str = "Offline: this resource is not available yet.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
  /// Installed behind an older active generation. Requests go straight to
  /// the network.
  Waiting,
  Active,
}

/// What the proxy handed back, and where it came from.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
  pub response: HttpResponse,
  pub source: CacheSource,
  pub strategy: Strategy,
}

pub struct NetworkProxy<S: CacheStorage, F: Fetcher> {
  cache: CacheLayer<S>,
  fetcher: Arc<F>,
  routes: RouteTable,
  connectivity: Connectivity,
  profile: Option<LocalStore>,
  skip_waiting: bool,
  active: AtomicBool,
  claims: watch::Sender<Option<String>>,
}

impl<S: CacheStorage, F: Fetcher> NetworkProxy<S, F> {
  pub fn new(
    cache: CacheLayer<S>,
    fetcher: F,
    routes: RouteTable,
    connectivity: Connectivity,
  ) -> Self {
    let (claims, _) = watch::channel(None);
    Self {
      cache,
      fetcher: Arc::new(fetcher),
      routes,
      connectivity,
      profile: None,
      skip_waiting: false,
      active: AtomicBool::new(false),
      claims,
    }
  }

  /// Remember the active generation across restarts.
  pub fn with_profile(mut self, store: LocalStore) -> Self {
    self.profile = Some(store);
    self
  }

  /// Activate a new generation on install instead of waiting.
  pub fn with_skip_waiting(mut self, skip_waiting: bool) -> Self {
    self.skip_waiting = skip_waiting;
    self
  }

  pub fn generation(&self) -> &str {
    self.cache.generation()
  }

  pub fn state(&self) -> ProxyState {
    if self.active.load(Ordering::SeqCst) {
      ProxyState::Active
    } else {
      ProxyState::Waiting
    }
  }

  /// Generation clients are currently claimed by. Pages watch this to
  /// learn about activations.
  pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
    self.claims.subscribe()
  }

  fn previous_generation(&self) -> Option<String> {
    let store = self.profile.as_ref()?;
    match store.profile_get(ACTIVE_GENERATION) {
      Ok(generation) => generation,
      Err(e) => {
        warn!(error = %e, "could not read active generation");
        None
      }
    }
  }

  /// Install this generation. It activates at once when no other generation
  /// is active (or waiting is skipped), otherwise it waits for
  /// `activate`.
  pub fn install(&self) -> ProxyState {
    let previous = self.previous_generation();
    info!(
      generation = self.generation(),
      previous = previous.as_deref().unwrap_or("none"),
      "proxy installed"
    );

    match previous {
      Some(previous) if previous != self.generation() && !self.skip_waiting => {
        info!(generation = self.generation(), "waiting for activation");
        ProxyState::Waiting
      }
      _ => {
        self.activate();
        ProxyState::Active
      }
    }
  }

  /// Take over: drop every other generation's entries, then claim clients.
  /// Returns the number of cache entries removed.
  pub fn activate(&self) -> usize {
    let removed = match self.cache.sweep() {
      Ok(removed) => removed,
      Err(e) => {
        warn!(error = %e, "cache sweep failed during activation");
        0
      }
    };

    if let Some(store) = &self.profile {
      if let Err(e) = store.profile_set(ACTIVE_GENERATION, self.generation()) {
        warn!(error = %e, "could not record active generation");
      }
    }

    self.active.store(true, Ordering::SeqCst);
    self.claims.send_replace(Some(self.generation().to_string()));
    info!(generation = self.generation(), removed, "proxy active, clients claimed");
    removed
  }

  /// Drop every cached response.
  pub fn clear_cache(&self) -> usize {
    match self.cache.clear() {
      Ok(removed) => {
        info!(removed, "cache cleared");
        removed
      }
      Err(e) => {
        warn!(error = %e, "failed to clear cache");
        0
      }
    }
  }

  /// Age out old entries on demand.
  pub fn sweep(&self) -> usize {
    self.cache.sweep().unwrap_or_else(|e| {
      warn!(error = %e, "cache sweep failed");
      0
    })
  }

  async fn fetch(&self, request: &ProxyRequest) -> Result<HttpResponse, FetchError> {
    if !self.connectivity.is_online() {
      return Err(FetchError::Offline);
    }
    self.fetcher.fetch(request).await
  }

  /// Answer a request. This never fails: when neither the network nor the
  /// cache can help, a well-formed offline response comes back instead.
  pub async fn handle(&self, request: &ProxyRequest) -> ProxyResponse {
    let strategy = match self.state() {
      ProxyState::Active => self.routes.classify(request),
      ProxyState::Waiting => Strategy::Passthrough,
    };
    let key = RequestKey::new(request.method.as_str(), request.url.as_str());
    debug!(key = %key, ?strategy, "intercepted request");

    let (response, source) = match strategy {
      Strategy::CacheFirst => match self.cache.cache_first(&key, || self.fetch(request)).await {
        Ok(result) => (result.data, result.source),
        Err(e) => {
          debug!(key = %key, error = %e, "nothing cached, serving placeholder");
          (placeholder(), CacheSource::Placeholder)
        }
      },
      Strategy::NetworkFirst => {
        match self.cache.network_first(&key, || self.fetch(request)).await {
          Ok(result) => (result.data, result.source),
          Err(e) => (offline_marker(request, &e), CacheSource::Placeholder),
        }
      }
      Strategy::Passthrough => match self.fetch(request).await {
        Ok(response) => (response, CacheSource::Network),
        Err(e) => (offline_marker(request, &e), CacheSource::Placeholder),
      },
    };

    ProxyResponse {
      response,
      source,
      strategy,
    }
  }
}

fn placeholder() -> HttpResponse {
  HttpResponse::new(503, Some("text/plain; charset=utf-8"), OFFLINE_PLACEHOLDER)
}

fn offline_marker(request: &ProxyRequest, error: &FetchError) -> HttpResponse {
  HttpResponse::json(
    503,
    &json!({
      "offline": true,
      "error": error.to_string(),
      "url": request.url.as_str(),
    }),
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::db::Database;
  use crate::testing::FakeFetcher;
  use reqwest::Url;
  use std::time::Duration;

  struct Harness {
    proxy: NetworkProxy<SqliteStorage, FakeFetcher>,
    store: LocalStore,
    connectivity: Connectivity,
    db: Database,
  }

  fn harness_with(db: Database, generation: &str, fetcher: FakeFetcher) -> Harness {
    let connectivity = Connectivity::new(true);
    let store = LocalStore::new(db.clone());
    let routes = RouteTable::from_config(
      &crate::config::ProxyConfig::default(),
      Some(Url::parse("https://coins.example.com").unwrap()),
    );
    let proxy = NetworkProxy::new(
      CacheLayer::new(SqliteStorage::new(db.clone()), generation),
      fetcher,
      routes,
      connectivity.clone(),
    )
    .with_profile(store.clone());
    Harness {
      proxy,
      store,
      connectivity,
      db,
    }
  }

  fn harness() -> Harness {
    let h = harness_with(
      Database::open_in_memory().unwrap(),
      "v1",
      FakeFetcher::default(),
    );
    assert_eq!(h.proxy.install(), ProxyState::Active);
    h
  }

  fn get(path: &str) -> ProxyRequest {
    ProxyRequest::get(Url::parse(&format!("https://coins.example.com{}", path)).unwrap())
  }

  fn calls(h: &Harness) -> usize {
    h.proxy.fetcher.calls.load(Ordering::SeqCst)
  }

  #[tokio::test]
  async fn test_cache_first_offline_serves_cached_bytes_without_network() {
    let h = harness();
    let first = h.proxy.handle(&get("/static/app.js")).await;
    assert_eq!(first.source, CacheSource::Network);
    assert_eq!(calls(&h), 1);

    h.connectivity.set_online(false);
    h.proxy.fetcher.down.store(true, Ordering::SeqCst);
    let again = h.proxy.handle(&get("/static/app.js")).await;
    assert_eq!(again.source, CacheSource::Cache);
    assert_eq!(again.response.body, first.response.body);
    assert_eq!(calls(&h), 1);
  }

  #[tokio::test]
  async fn test_cache_first_miss_offline_gets_placeholder() {
    let h = harness();
    h.connectivity.set_online(false);
    let result = h.proxy.handle(&get("/static/never.css")).await;
    assert_eq!(result.strategy, Strategy::CacheFirst);
    assert_eq!(result.source, CacheSource::Placeholder);
    assert_eq!(result.response.status, 503);
    assert_eq!(result.response.body, OFFLINE_PLACEHOLDER.as_bytes().to_vec());
    assert_eq!(calls(&h), 0);
  }

  #[tokio::test]
  async fn test_network_first_offline_prefers_cached_payload() {
    let h = harness();
    let live = h.proxy.handle(&get("/api/coins")).await;
    assert_eq!(live.source, CacheSource::Network);

    h.proxy.fetcher.down.store(true, Ordering::SeqCst);
    let cached = h.proxy.handle(&get("/api/coins")).await;
    assert_eq!(cached.source, CacheSource::Offline);
    assert_eq!(cached.response.status, 200);
    assert_eq!(cached.response.body, live.response.body);
    assert!(cached.response.json_body().is_none());

    let never = h.proxy.handle(&get("/api/wishlist")).await;
    assert_eq!(never.response.status, 503);
    let marker = never.response.json_body().unwrap();
    assert_eq!(marker["offline"], true);
    assert_eq!(marker["url"], "https://coins.example.com/api/wishlist");
    assert_eq!(marker["error"], "request failed: connection reset");
  }

  #[tokio::test]
  async fn test_writes_pass_through_uncached() {
    let h = harness();
    let post = ProxyRequest::new("POST", get("/api/coins").url).with_json(&json!({"name": "A"}));
    let live = h.proxy.handle(&post).await;
    assert_eq!(live.strategy, Strategy::Passthrough);
    assert_eq!(live.source, CacheSource::Network);
    assert_eq!(h.proxy.cache.storage().len("v1").unwrap(), 0);

    h.connectivity.set_online(false);
    let offline = h.proxy.handle(&post).await;
    assert_eq!(offline.response.status, 503);
    assert_eq!(offline.response.json_body().unwrap()["offline"], true);
  }

  #[tokio::test]
  async fn test_new_generation_waits_then_activation_purges_old() {
    let old = harness();
    old.proxy.handle(&get("/static/app.js")).await;
    assert_eq!(old.proxy.cache.storage().len("v1").unwrap(), 1);

    let new = harness_with(old.db.clone(), "v2", FakeFetcher::default());
    assert_eq!(new.proxy.install(), ProxyState::Waiting);
    let mut claims = new.proxy.subscribe();
    assert_eq!(*claims.borrow(), None);

    // waiting: straight to the network, nothing cached under v2
    let waiting = new.proxy.handle(&get("/static/app.js")).await;
    assert_eq!(waiting.strategy, Strategy::Passthrough);
    assert_eq!(new.proxy.cache.storage().len("v2").unwrap(), 0);

    assert_eq!(new.proxy.activate(), 1);
    assert_eq!(new.proxy.state(), ProxyState::Active);
    assert_eq!(new.proxy.cache.storage().len("v1").unwrap(), 0);
    assert!(claims.has_changed().unwrap());
    assert_eq!(claims.borrow_and_update().as_deref(), Some("v2"));
    assert_eq!(
      new.store.profile_get(ACTIVE_GENERATION).unwrap().as_deref(),
      Some("v2")
    );
  }

  #[tokio::test]
  async fn test_skip_waiting_activates_on_install() {
    let old = harness();
    let new = harness_with(old.db.clone(), "v2", FakeFetcher::default());
    let new = Harness {
      proxy: new.proxy.with_skip_waiting(true),
      ..new
    };
    assert_eq!(new.proxy.install(), ProxyState::Active);
  }

  #[tokio::test]
  async fn test_cancelled_cache_first_request_leaves_no_trace() {
    let h = harness_with(
      Database::open_in_memory().unwrap(),
      "v1",
      FakeFetcher {
        hang: true,
        ..Default::default()
      },
    );
    h.proxy.install();

    let request = get("/static/app.js");
    let dropped = tokio::time::timeout(Duration::from_millis(50), h.proxy.handle(&request)).await;
    assert!(dropped.is_err());
    assert_eq!(h.proxy.cache.storage().len("v1").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_cancelled_network_first_read_keeps_committed_copy() {
    let h = harness_with(
      Database::open_in_memory().unwrap(),
      "v1",
      FakeFetcher {
        delay: Some(Duration::from_millis(200)),
        ..Default::default()
      },
    );
    h.proxy.install();
    let request = get("/api/coins");
    let first = h.proxy.handle(&request).await;
    assert_eq!(first.source, CacheSource::Network);

    // dropped while the refresh is still on the wire
    let dropped = tokio::time::timeout(Duration::from_millis(50), h.proxy.handle(&request)).await;
    assert!(dropped.is_err());
    assert_eq!(calls(&h), 2);
    assert_eq!(h.proxy.cache.storage().len("v1").unwrap(), 1);

    // a refresh that got its response is written before the caller sees it
    drop(h.proxy.handle(&request).await);

    h.connectivity.set_online(false);
    let cached = h.proxy.handle(&request).await;
    assert_eq!(cached.source, CacheSource::Offline);
    assert_eq!(cached.response.body, b"/api/coins v3".to_vec());
    assert_eq!(calls(&h), 3);
  }

  #[tokio::test]
  async fn test_clear_cache() {
    let h = harness();
    h.proxy.handle(&get("/static/a.js")).await;
    h.proxy.handle(&get("/api/coins")).await;
    assert_eq!(h.proxy.clear_cache(), 2);
  }
}
