//! Outgoing requests as the proxy sees them, and the network behind it.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{Method, Url};
use url::Origin;
use std::time::Duration;
use thiserror::Error;

use crate::cache::HttpResponse;

/// An intercepted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
  pub method: String,
  pub url: Url,
  pub body: Option<Vec<u8>>,
  pub content_type: Option<String>,
  /// Top-level page load (the application shell)
  pub navigate: bool,
}

impl ProxyRequest {
  pub fn new(method: impl Into<String>, url: Url) -> Self {
    Self {
      method: method.into().to_uppercase(),
      url,
      body: None,
      content_type: None,
      navigate: false,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new("GET", url)
  }

  pub fn navigate(url: Url) -> Self {
    Self {
      navigate: true,
      ..Self::get(url)
    }
  }

  pub fn with_json(mut self, body: &serde_json::Value) -> Self {
    self.body = Some(body.to_string().into_bytes());
    self.content_type = Some("application/json".to_string());
    self
  }

  pub fn is_get(&self) -> bool {
    self.method == "GET"
  }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
  #[error("network unavailable")]
  Offline,
  #[error("request timed out")]
  Timeout,
  #[error("request failed: {0}")]
  Network(String),
}

/// Something that can put a request on the wire.
#[async_trait]
pub trait Fetcher: Send + Sync {
  async fn fetch(&self, request: &ProxyRequest) -> std::result::Result<HttpResponse, FetchError>;
}

/// `Fetcher` backed by reqwest.
///
/// Requests go out as the page built them. The API token is added only for
/// the origin it belongs to.
#[derive(Clone)]
pub struct HttpFetcher {
  http: reqwest::Client,
  credentials: Option<(Origin, String)>,
}

impl HttpFetcher {
  pub fn new(timeout: Duration) -> Result<Self> {
    let http = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;
    Ok(Self {
      http,
      credentials: None,
    })
  }

  /// Authenticate requests to `origin` with `token`.
  pub fn with_token(mut self, origin: &Url, token: impl Into<String>) -> Self {
    self.credentials = Some((origin.origin(), token.into()));
    self
  }

  fn token_for(&self, url: &Url) -> Option<&str> {
    match &self.credentials {
      Some((origin, token)) if origin.is_tuple() && *origin == url.origin() => {
        Some(token.as_str())
      }
      _ => None,
    }
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &ProxyRequest) -> std::result::Result<HttpResponse, FetchError> {
    let method = Method::from_bytes(request.method.as_bytes())
      .map_err(|e| FetchError::Network(format!("invalid method {}: {}", request.method, e)))?;

    let mut req = self.http.request(method, request.url.clone());
    if let Some(token) = self.token_for(&request.url) {
      req = req.bearer_auth(token);
    }
    if let Some(content_type) = &request.content_type {
      req = req.header(reqwest::header::CONTENT_TYPE, content_type);
    }
    if let Some(body) = &request.body {
      req = req.body(body.clone());
    }

    let response = req.send().await.map_err(map_reqwest_error)?;
    let status = response.status().as_u16();
    let content_type = response
      .headers()
      .get(reqwest::header::CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .map(String::from);
    let body = response.bytes().await.map_err(map_reqwest_error)?;

    Ok(HttpResponse {
      status,
      content_type,
      body: body.to_vec(),
    })
  }
}

fn map_reqwest_error(err: reqwest::Error) -> FetchError {
  if err.is_timeout() {
    FetchError::Timeout
  } else if err.is_connect() {
    FetchError::Offline
  } else {
    FetchError::Network(err.to_string())
  }
}
