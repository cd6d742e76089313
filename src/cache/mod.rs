//! Generic caching layer for list resources.
//!
//! This module provides an API-agnostic caching mechanism that:
//! - Persists `{data, timestamp}` entries in a key-value store
//! - Treats entries older than the TTL as absent
//! - Never serves stale data when a fetch fails
//! - Guards against in-flight fetches resurrecting invalidated entries

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::{KeyValueStore, MemoryStorage, SharedStore, SqliteStorage};
pub use traits::{CacheEntry, CacheResult, CacheSource, QueryKey};
