//! Cache layer that orchestrates caching strategies with network fetching.

use chrono::{DateTime, Duration, Utc};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use super::storage::{CacheStorage, CachedResponse};
use super::traits::{CacheResult, HttpResponse, RequestKey};

/// Cache layer that manages caching logic and network fetching.
///
/// Storage failures are logged and treated as misses: the cache only ever
/// improves availability, it is never needed for a correct answer.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  generation: String,
  /// Entries older than this are refetched when possible
  max_age: Option<Duration>,
}

impl<S: CacheStorage> CacheLayer<S> {
  /// Create a new cache layer for one cache generation.
  pub fn new(storage: S, generation: impl Into<String>) -> Self {
    Self {
      storage: Arc::new(storage),
      generation: generation.into(),
      max_age: None,
    }
  }

  pub fn with_max_age(mut self, max_age: Option<Duration>) -> Self {
    self.max_age = max_age;
    self
  }

  pub fn generation(&self) -> &str {
    &self.generation
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  fn is_expired(&self, cached_at: DateTime<Utc>) -> bool {
    self
      .max_age
      .map_or(false, |max_age| Utc::now() - cached_at > max_age)
  }

  fn lookup(&self, key: &RequestKey) -> Option<CachedResponse> {
    match self.storage.get(&self.generation, key) {
      Ok(hit) => hit,
      Err(e) => {
        warn!(key = %key, error = %e, "cache lookup failed, treating as miss");
        None
      }
    }
  }

  fn store(&self, key: &RequestKey, response: &HttpResponse) {
    if let Err(e) = self.storage.put(&self.generation, key, response) {
      warn!(key = %key, error = %e, "failed to store cache entry");
    }
  }

  /// Cache-first strategy for static, read-mostly assets.
  ///
  /// 1. Fresh cache hit - return it, no network
  /// 2. Otherwise fetch; store successful responses
  /// 3. On network failure, return an expired entry if there is one
  ///
  /// Returns the fetch error only when the network failed and nothing usable
  /// was cached. Nothing is written unless a fetch completes, so dropping the
  /// future early leaves the cache untouched.
  pub async fn cache_first<F, Fut, E>(
    &self,
    key: &RequestKey,
    fetcher: F,
  ) -> Result<CacheResult<HttpResponse>, E>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<HttpResponse, E>>,
    E: Display,
  {
    let cached = self.lookup(key);
    if let Some(hit) = &cached {
      if !self.is_expired(hit.cached_at) {
        debug!(key = %key, "cache hit");
        return Ok(CacheResult::from_cache(hit.response.clone(), hit.cached_at));
      }
    }

    match fetcher().await {
      Ok(response) => {
        if response.is_success() {
          self.store(key, &response);
        }
        Ok(CacheResult::from_network(response))
      }
      Err(e) => match cached {
        Some(stale) => {
          debug!(key = %key, error = %e, "network failed, serving expired entry");
          Ok(CacheResult::offline(stale.response, stale.cached_at))
        }
        None => Err(e),
      },
    }
  }

  /// Network-first strategy for API calls and the page shell.
  ///
  /// 1. Fetch; on success refresh the cache and return the live response
  /// 2. On network failure (or a 5xx) return the last cached copy
  ///
  /// The cache refresh is committed before this returns, so a caller that
  /// goes away afterwards does not undo it.
  pub async fn network_first<F, Fut, E>(
    &self,
    key: &RequestKey,
    fetcher: F,
  ) -> Result<CacheResult<HttpResponse>, E>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<HttpResponse, E>>,
    E: Display,
  {
    match fetcher().await {
      Ok(response) if response.is_server_error() => match self.lookup(key) {
        Some(cached) => {
          debug!(key = %key, status = response.status, "server error, serving cached copy");
          Ok(CacheResult::offline(cached.response, cached.cached_at))
        }
        None => Ok(CacheResult::from_network(response)),
      },
      Ok(response) => {
        if response.is_success() {
          self.store(key, &response);
        }
        Ok(CacheResult::from_network(response))
      }
      Err(e) => match self.lookup(key) {
        Some(cached) => {
          debug!(key = %key, error = %e, "network failed, serving cached copy");
          Ok(CacheResult::offline(cached.response, cached.cached_at))
        }
        None => Err(e),
      },
    }
  }

  /// Drop entries from every other generation, then age out old entries.
  pub fn sweep(&self) -> color_eyre::Result<usize> {
    let mut removed = self.storage.purge_other_generations(&self.generation)?;
    if let Some(max_age) = self.max_age {
      removed += self.storage.evict_older_than(Utc::now() - max_age)?;
    }
    Ok(removed)
  }

  pub fn clear(&self) -> color_eyre::Result<usize> {
    self.storage.clear()
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      generation: self.generation.clone(),
      max_age: self.max_age,
    }
  }
}
