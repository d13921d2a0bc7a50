//! hoard: an offline-tolerant data layer.
//!
//! Records are written to a local SQLite store and an outbox queue in one
//! transaction; a background reconciler replays the queue against the
//! remote API once connectivity returns. A caching proxy answers outgoing
//! requests from a generation-versioned response cache when the network
//! cannot.

pub mod cache;
pub mod client;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod error;
pub mod logging;
pub mod message;
pub mod proxy;
pub mod queue;
pub mod remote;
pub mod runtime;
pub mod store;
pub mod sync;
pub mod worker;

#[cfg(test)]
mod testing;

pub use client::{Capabilities, OfflineClient};
pub use config::Config;
pub use error::{SyncError, SyncResult};
pub use message::ProxyMessage;
pub use runtime::Runtime;
