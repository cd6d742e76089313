//! Core traits and types for the caching system.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Anything that names a cache slot.
pub trait QueryKey {
  /// Key under which the entry is persisted (e.g. `folders_cache`).
  fn storage_key(&self) -> String;

  /// Human readable description for logs.
  fn description(&self) -> String {
    self.storage_key()
  }
}

impl QueryKey for str {
  fn storage_key(&self) -> String {
    self.to_string()
  }
}

impl QueryKey for String {
  fn storage_key(&self) -> String {
    self.clone()
  }
}

/// A cached value together with the moment it was stored.
///
/// Serialized as `{"data": ..., "timestamp": <ms since epoch>}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<T> {
  pub data: T,
  pub timestamp: i64,
}

impl<T> CacheEntry<T> {
  pub fn new(data: T, stored_at: DateTime<Utc>) -> Self {
    Self {
      data,
      timestamp: stored_at.timestamp_millis(),
    }
  }

  pub fn stored_at(&self) -> DateTime<Utc> {
    Utc
      .timestamp_millis_opt(self.timestamp)
      .single()
      .unwrap_or(DateTime::<Utc>::MIN_UTC)
  }

  /// An entry is valid iff `now - timestamp < ttl`.
  pub fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
    now.timestamp_millis() - self.timestamp < ttl.num_milliseconds()
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  pub data: T,
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  Network,
  Cache,
}
