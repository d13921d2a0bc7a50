//! Generation-scoped response cache backing the network proxy.
//!
//! This module provides the read-path cache that:
//! - Stores responses keyed by method + absolute URL
//! - Scopes every entry to a cache generation, so activating a new generation
//!   invalidates everything older in one step
//! - Implements the cache-first and network-first strategies
//! - Never holds anything the write path depends on

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::{CacheStorage, CachedResponse, NoopStorage, SqliteStorage};
pub use traits::{CacheResult, CacheSource, HttpResponse, RequestKey};
