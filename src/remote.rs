//! Client for the remote domain API the queue drains into.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{StatusCode, Url};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::RemoteConfig;
use crate::error::SyncError;

/// How a remote call failed, as far as the reconciler cares.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
  /// Worth retrying: connection trouble, timeout, 5xx, 408 or 429
  #[error("{0}")]
  Transient(String),
  /// Missing or expired credentials; retrying needs a new token
  #[error("unauthorized: {0}")]
  Unauthorized(String),
  /// The remote refused the request and will keep refusing it
  #[error("remote returned {status}: {message}")]
  Rejected { status: u16, message: String },
}

impl From<RemoteError> for SyncError {
  fn from(err: RemoteError) -> Self {
    match err {
      RemoteError::Transient(message) => SyncError::TransientNetworkFailure(message),
      RemoteError::Unauthorized(message) => SyncError::Unauthorized(message),
      RemoteError::Rejected { status, message } => {
        SyncError::PermanentRejection { status, message }
      }
    }
  }
}

/// The remote authority for domain records.
///
/// Every call carries the record's `local_id` as its idempotency key, so a
/// request replayed after a crash cannot create a second server record.
#[async_trait]
pub trait RemoteApi: Send + Sync {
  /// Create a record and return the id the remote assigned.
  async fn create(
    &self,
    collection: &str,
    local_id: &str,
    payload: &Value,
  ) -> std::result::Result<String, RemoteError>;

  async fn update(
    &self,
    collection: &str,
    server_id: &str,
    local_id: &str,
    payload: &Value,
  ) -> std::result::Result<(), RemoteError>;

  /// Delete a record. A record the remote no longer has counts as deleted.
  async fn delete(
    &self,
    collection: &str,
    server_id: &str,
    local_id: &str,
  ) -> std::result::Result<(), RemoteError>;
}

/// `RemoteApi` over HTTP: `POST {path}`, `PUT {path}/{id}`, `DELETE {path}/{id}`.
#[derive(Clone)]
pub struct HttpRemote {
  http: reqwest::Client,
  base_url: Url,
  token: Option<String>,
  config: RemoteConfig,
}

impl HttpRemote {
  pub fn new(config: &RemoteConfig, token: Option<String>, timeout: Duration) -> Result<Self> {
    let base_url = Url::parse(&config.base_url)
      .map_err(|e| eyre!("Invalid remote base URL {}: {}", config.base_url, e))?;
    let http = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self {
      http,
      base_url,
      token,
      config: config.clone(),
    })
  }

  fn url(
    &self,
    collection: &str,
    server_id: Option<&str>,
  ) -> std::result::Result<Url, RemoteError> {
    let mut path = self.config.collection_path(collection);
    if let Some(id) = server_id {
      path = format!("{}/{}", path.trim_end_matches('/'), id);
    }
    self
      .base_url
      .join(&path)
      .map_err(|e| RemoteError::Rejected {
        status: 0,
        message: format!("invalid API path {}: {}", path, e),
      })
  }

  async fn send(
    &self,
    req: reqwest::RequestBuilder,
    local_id: &str,
  ) -> std::result::Result<(StatusCode, String), RemoteError> {
    let mut req = req.header("Idempotency-Key", local_id);
    if let Some(token) = &self.token {
      req = req.bearer_auth(token);
    }

    let response = req
      .send()
      .await
      .map_err(|e| RemoteError::Transient(e.to_string()))?;
    let status = response.status();
    let body = response
      .text()
      .await
      .map_err(|e| RemoteError::Transient(format!("failed to read response body: {}", e)))?;
    debug!(status = status.as_u16(), local_id, "remote responded");
    Ok((status, body))
  }
}

#[async_trait]
impl RemoteApi for HttpRemote {
  async fn create(
    &self,
    collection: &str,
    local_id: &str,
    payload: &Value,
  ) -> std::result::Result<String, RemoteError> {
    let url = self.url(collection, None)?;
    let (status, body) = self.send(self.http.post(url).json(payload), local_id).await?;
    if !status.is_success() {
      return Err(classify(status, &body));
    }

    let value: Value = serde_json::from_str(&body)
      .map_err(|e| RemoteError::Transient(format!("unreadable create response: {}", e)))?;
    match value.get("id") {
      Some(Value::Number(n)) => Ok(n.to_string()),
      Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
      _ => Err(RemoteError::Transient(
        "create response carried no id".to_string(),
      )),
    }
  }

  async fn update(
    &self,
    collection: &str,
    server_id: &str,
    local_id: &str,
    payload: &Value,
  ) -> std::result::Result<(), RemoteError> {
    let url = self.url(collection, Some(server_id))?;
    let (status, body) = self.send(self.http.put(url).json(payload), local_id).await?;
    if !status.is_success() {
      return Err(classify(status, &body));
    }
    Ok(())
  }

  async fn delete(
    &self,
    collection: &str,
    server_id: &str,
    local_id: &str,
  ) -> std::result::Result<(), RemoteError> {
    let url = self.url(collection, Some(server_id))?;
    let (status, body) = self.send(self.http.delete(url), local_id).await?;
    if status.is_success() || status == StatusCode::NOT_FOUND {
      return Ok(());
    }
    Err(classify(status, &body))
  }
}

/// Map a non-success status to transient, unauthorized or permanent.
fn classify(status: StatusCode, body: &str) -> RemoteError {
  let message = serde_json::from_str::<Value>(body)
    .ok()
    .and_then(|v| v.get("message").and_then(Value::as_str).map(String::from))
    .unwrap_or_else(|| body.trim().to_string());

  if status == StatusCode::UNAUTHORIZED {
    return RemoteError::Unauthorized(message);
  }
  if status.is_server_error()
    || status == StatusCode::REQUEST_TIMEOUT
    || status == StatusCode::TOO_MANY_REQUESTS
  {
    RemoteError::Transient(format!("{}: {}", status, message))
  } else {
    RemoteError::Rejected {
      status: status.as_u16(),
      message,
    }
  }
}
