//! Turning a record's queued entries into remote calls.

use crate::queue::{MutationKind, QueueEntry};

/// One remote call, plus the entries it makes redundant.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Step {
  pub entry: QueueEntry,
  /// Earlier updates whose payload `entry` overwrites
  pub superseded: Vec<i64>,
}

impl Step {
  /// Queue entries this step settles.
  pub fn len(&self) -> usize {
    1 + self.superseded.len()
  }
}

/// Collapse runs of consecutive updates into their last one.
pub(crate) fn coalesce(chain: Vec<QueueEntry>) -> Vec<Step> {
  let mut steps: Vec<Step> = Vec::with_capacity(chain.len());
  for entry in chain {
    if let Some(last) = steps.last_mut() {
      if last.entry.kind == MutationKind::Update && entry.kind == MutationKind::Update {
        let replaced = std::mem::replace(&mut last.entry, entry);
        last.superseded.push(replaced.id);
        continue;
      }
    }
    steps.push(Step {
      entry,
      superseded: Vec::new(),
    });
  }
  steps
}

/// Whether the chain ends the record's life.
pub(crate) fn deletes_target(chain: &[QueueEntry]) -> bool {
  chain.iter().any(|e| e.kind == MutationKind::Delete)
}
