//! In-memory stand-ins for the network, shared by unit tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::cache::HttpResponse;
use crate::proxy::{FetchError, Fetcher, ProxyRequest};
use crate::remote::{RemoteApi, RemoteError};

/// Remote API that keeps records in memory and honours idempotency keys.
#[derive(Default)]
pub struct FakeRemote {
  pub records: Mutex<BTreeMap<String, Value>>,
  pub by_key: Mutex<HashMap<String, String>>,
  pub calls: Mutex<Vec<String>>,
  pub next_id: AtomicU64,
  /// Every call fails transiently while set
  pub transient: AtomicBool,
  /// Every call is answered 401 while set
  pub unauthorized: AtomicBool,
  /// Local ids whose calls are rejected with a 400
  pub reject: Mutex<HashSet<String>>,
  pub delay: Option<Duration>,
}

impl FakeRemote {
  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }

  pub fn record(&self, server_id: &str) -> Option<Value> {
    self.records.lock().unwrap().get(server_id).cloned()
  }

  async fn enter(&self, call: String, local_id: &str) -> Result<(), RemoteError> {
    self.calls.lock().unwrap().push(call);
    if let Some(delay) = self.delay {
      tokio::time::sleep(delay).await;
    }
    if self.unauthorized.load(Ordering::SeqCst) {
      return Err(RemoteError::Unauthorized("Token has expired!".into()));
    }
    if self.transient.load(Ordering::SeqCst) {
      return Err(RemoteError::Transient("503 Service Unavailable".into()));
    }
    if self.reject.lock().unwrap().contains(local_id) {
      return Err(RemoteError::Rejected {
        status: 400,
        message: "Country and Denomination are required".into(),
      });
    }
    Ok(())
  }
}

#[async_trait]
impl RemoteApi for FakeRemote {
  async fn create(
    &self,
    collection: &str,
    local_id: &str,
    payload: &Value,
  ) -> Result<String, RemoteError> {
    self
      .enter(format!("POST {} {}", collection, local_id), local_id)
      .await?;
    let mut by_key = self.by_key.lock().unwrap();
    if let Some(existing) = by_key.get(local_id) {
      return Ok(existing.clone());
    }
    let id = (self.next_id.fetch_add(1, Ordering::SeqCst) + 1).to_string();
    by_key.insert(local_id.to_string(), id.clone());
    self.records.lock().unwrap().insert(id.clone(), payload.clone());
    Ok(id)
  }

  async fn update(
    &self,
    collection: &str,
    server_id: &str,
    local_id: &str,
    payload: &Value,
  ) -> Result<(), RemoteError> {
    self
      .enter(format!("PUT {} {}", collection, server_id), local_id)
      .await?;
    self
      .records
      .lock()
      .unwrap()
      .insert(server_id.to_string(), payload.clone());
    Ok(())
  }

  async fn delete(
    &self,
    collection: &str,
    server_id: &str,
    local_id: &str,
  ) -> Result<(), RemoteError> {
    self
      .enter(format!("DELETE {} {}", collection, server_id), local_id)
      .await?;
    self.records.lock().unwrap().remove(server_id);
    Ok(())
  }
}

/// Serves `<path> v<n>` bodies and counts every call that reaches it.
#[derive(Default)]
pub struct FakeFetcher {
  pub calls: AtomicUsize,
  pub down: AtomicBool,
  /// Never answer
  pub hang: bool,
  /// Wait this long before answering
  pub delay: Option<Duration>,
}

#[async_trait]
impl Fetcher for FakeFetcher {
  async fn fetch(&self, request: &ProxyRequest) -> Result<HttpResponse, FetchError> {
    let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
    if let Some(delay) = self.delay {
      tokio::time::sleep(delay).await;
    }
    if self.hang {
      futures::future::pending::<()>().await;
    }
    if self.down.load(Ordering::SeqCst) {
      return Err(FetchError::Network("connection reset".into()));
    }
    Ok(HttpResponse::new(
      200,
      Some("text/plain"),
      format!("{} v{}", request.url.path(), n),
    ))
  }
}
