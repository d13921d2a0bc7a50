//! Shared online/offline flag.

use tokio::sync::watch;
use tracing::info;

/// What the host believes about the network. Pages and the background
/// worker share one instance; transitions are broadcast to subscribers.
#[derive(Clone)]
pub struct Connectivity {
  tx: watch::Sender<bool>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(online);
    Self { tx }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Update the flag. Returns true when this was a transition.
  pub fn set_online(&self, online: bool) -> bool {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        return false;
      }
      *current = online;
      true
    });
    if changed {
      info!(online, "connectivity changed");
    }
    changed
  }

  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

impl Default for Connectivity {
  fn default() -> Self {
    Self::new(true)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_transitions_are_broadcast_once() {
    let connectivity = Connectivity::new(true);
    let mut rx = connectivity.subscribe();

    assert!(!connectivity.set_online(true));
    assert!(connectivity.set_online(false));
    assert!(!connectivity.is_online());

    rx.changed().await.unwrap();
    assert!(!*rx.borrow_and_update());
    assert!(!rx.has_changed().unwrap());
  }
}
