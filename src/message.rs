//! Page-to-background signals.

use serde::{Deserialize, Serialize};

/// A message a page posts to the background worker.
///
/// On the wire: `{"type": "SYNC_NOW"}`, `{"type": "CONNECTIVITY", "online": false}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyMessage {
  /// Activate a waiting cache generation now
  SkipActivation,
  /// Drain the sync queue
  SyncNow,
  /// The page observed a connectivity change
  Connectivity { online: bool },
  ClearCache,
}
