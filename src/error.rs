//! Page-visible error taxonomy.
//!
//! Store and queue internals report `color_eyre` errors with context. Every
//! operation a page can call converts those into one of these kinds before
//! returning, so no raw SQLite or HTTP error leaks into page-visible state.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
  /// The local store could not be opened or written. The client keeps
  /// working in network-only mode.
  #[error("offline storage unavailable: {reason}")]
  StorageUnavailable { reason: String },

  /// Network failure, timeout or 5xx. Retried with backoff.
  #[error("transient network failure: {0}")]
  TransientNetworkFailure(String),

  /// The remote refused the mutation (4xx). The entry is frozen as failed.
  #[error("rejected by remote ({status}): {message}")]
  PermanentRejection { status: u16, message: String },

  /// The remote refused the credentials (401). Draining pauses and entries
  /// stay pending until the token is replaced.
  #[error("remote refused credentials: {0}")]
  Unauthorized(String),

  /// An update or delete is waiting on an unresolved create for the same
  /// record.
  #[error("waiting on unresolved create for {local_id}")]
  OrderingDeferral { local_id: String },

  #[error("not found: {0}")]
  NotFound(String),

  #[error("configuration error: {0}")]
  Config(String),
}

impl SyncError {
  pub fn storage(err: impl std::fmt::Display) -> Self {
    SyncError::StorageUnavailable {
      reason: err.to_string(),
    }
  }

  /// Convert an internal error at a page-visible boundary. Typed errors
  /// raised inside the store come back as-is; anything else is a storage
  /// failure.
  pub fn from_report(report: color_eyre::Report) -> Self {
    match report.downcast::<SyncError>() {
      Ok(err) => err,
      Err(report) => SyncError::storage(report),
    }
  }

  /// Whether the reconciler should back off and stop the current pass.
  pub fn is_transient(&self) -> bool {
    matches!(self, SyncError::TransientNetworkFailure(_))
  }
}

/// Result type for page-visible operations.
pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_storage_helper_keeps_message() {
    let err = SyncError::storage("disk full");
    assert_eq!(err.to_string(), "offline storage unavailable: disk full");
  }

  #[test]
  fn test_from_report_keeps_typed_errors() {
    let typed = color_eyre::Report::new(SyncError::NotFound("queue entry 7".into()));
    assert_eq!(
      SyncError::from_report(typed),
      SyncError::NotFound("queue entry 7".into())
    );

    let raw = color_eyre::eyre::eyre!("database is locked");
    assert_eq!(
      SyncError::from_report(raw),
      SyncError::storage("database is locked")
    );
  }

  #[test]
  fn test_only_network_failures_are_transient() {
    assert!(SyncError::TransientNetworkFailure("timeout".into()).is_transient());
    assert!(!SyncError::PermanentRejection {
      status: 400,
      message: "bad".into()
    }
    .is_transient());
    assert!(!SyncError::Unauthorized("Token has expired!".into()).is_transient());
    assert!(!SyncError::OrderingDeferral {
      local_id: "L1".into()
    }
    .is_transient());
  }
}
