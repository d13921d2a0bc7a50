//! Request classification.

use reqwest::Url;

use super::fetcher::ProxyRequest;
use crate::config::ProxyConfig;

/// How the proxy answers a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// Static assets: serve the cached copy without touching the network
  CacheFirst,
  /// API reads and page loads: live when possible, cached copy otherwise
  NetworkFirst,
  /// Never cached: writes and foreign origins
  Passthrough,
}

const STATIC_EXTENSIONS: &[&str] = &[
  "js", "mjs", "css", "png", "jpg", "jpeg", "gif", "svg", "webp", "ico", "woff", "woff2",
  "ttf", "json", "webmanifest",
];

#[derive(Debug, Clone)]
pub struct RouteTable {
  origin: Option<Url>,
  cache_first: Vec<String>,
  network_first: Vec<String>,
}

impl RouteTable {
  pub fn new(origin: Option<Url>, cache_first: Vec<String>, network_first: Vec<String>) -> Self {
    Self {
      origin,
      cache_first,
      network_first,
    }
  }

  pub fn from_config(config: &ProxyConfig, origin: Option<Url>) -> Self {
    Self::new(
      origin,
      config.cache_first_prefixes.clone(),
      config.network_first_prefixes.clone(),
    )
  }

  pub fn classify(&self, request: &ProxyRequest) -> Strategy {
    if !request.is_get() {
      return Strategy::Passthrough;
    }
    if let Some(origin) = &self.origin {
      if origin.origin() != request.url.origin() {
        return Strategy::Passthrough;
      }
    }
    if request.navigate {
      return Strategy::NetworkFirst;
    }

    let path = request.url.path();
    if self.network_first.iter().any(|p| path.starts_with(p.as_str())) {
      return Strategy::NetworkFirst;
    }
    if self.cache_first.iter().any(|p| path.starts_with(p.as_str())) || has_static_extension(path) {
      return Strategy::CacheFirst;
    }
    Strategy::NetworkFirst
  }
}

fn has_static_extension(path: &str) -> bool {
  path
    .rsplit('/')
    .next()
    .and_then(|name| name.rsplit_once('.'))
    .map_or(false, |(_, ext)| {
      STATIC_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str())
    })
}
