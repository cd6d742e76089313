//! Cache layer that orchestrates caching logic with network fetching.

use chrono::{Duration, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use super::storage::SharedStore;
use super::traits::{CacheEntry, CacheResult, QueryKey};
use crate::error::{Result, SyncError};
use crate::sync::ConnectivityState;

/// Read-through cache with TTL expiry, persisted in a key-value store.
///
/// Every key carries a generation counter. `invalidate` bumps it, and a fetch
/// that started under an older generation does not write its result back.
#[derive(Clone)]
pub struct CacheLayer {
  storage: SharedStore,
  /// Entries older than this are treated as absent
  ttl: Duration,
  generations: Arc<Mutex<HashMap<String, u64>>>,
  connectivity: Option<ConnectivityState>,
}

impl CacheLayer {
  pub fn new(storage: SharedStore) -> Self {
    Self {
      storage,
      ttl: Duration::minutes(5),
      generations: Arc::new(Mutex::new(HashMap::new())),
      connectivity: None,
    }
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl = ttl;
    self
  }

  /// Fail misses fast while the prober reports the host unreachable.
  pub fn with_connectivity(mut self, connectivity: ConnectivityState) -> Self {
    self.connectivity = Some(connectivity);
    self
  }

  pub fn ttl(&self) -> Duration {
    self.ttl
  }

  /// Fetch with cache-first strategy.
  ///
  /// 1. Fresh entry present: return it, `fetcher` is not called
  /// 2. Host known unreachable: fail with a network error
  /// 3. Otherwise fetch, store the result, return it
  ///
  /// A failed fetch leaves the cache untouched and propagates the error.
  pub async fn get_or_fetch<T, K, F, Fut>(&self, key: &K, fetcher: F) -> Result<CacheResult<T>>
  where
    T: Serialize + DeserializeOwned,
    K: QueryKey + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    let storage_key = key.storage_key();

    if let Some(entry) = self.read_entry::<T>(&storage_key)? {
      if entry.is_fresh(Utc::now(), self.ttl) {
        debug!(key = %storage_key, "cache hit");
        let cached_at = entry.stored_at();
        return Ok(CacheResult::from_cache(entry.data, cached_at));
      }
      debug!(key = %storage_key, "cache entry expired");
    }

    if let Some(connectivity) = &self.connectivity {
      if !connectivity.is_reachable() {
        warn!(key = %storage_key, "skipping fetch for {}: host unreachable", key.description());
        return Err(SyncError::offline());
      }
    }

    let generation = self.generation(&storage_key)?;
    let data = fetcher().await?;
    let raw = serde_json::to_string(&CacheEntry::new(&data, Utc::now()))?;

    // Compare and write under one lock so a concurrent invalidate cannot
    // slip between them.
    {
      let generations = self.lock_generations()?;
      if generations.get(&storage_key).copied().unwrap_or(0) == generation {
        self.storage.set(&storage_key, &raw)?;
      } else {
        debug!(key = %storage_key, "invalidated during fetch, not caching result");
      }
    }

    Ok(CacheResult::from_network(data))
  }

  /// Drop the entry for `key` immediately.
  pub fn invalidate<K: QueryKey + ?Sized>(&self, key: &K) -> Result<()> {
    let storage_key = key.storage_key();
    {
      let mut generations = self.lock_generations()?;
      *generations.entry(storage_key.clone()).or_insert(0) += 1;
      self.storage.remove(&storage_key)?;
    }
    debug!(key = %storage_key, "cache invalidated");
    Ok(())
  }

  fn generation(&self, storage_key: &str) -> Result<u64> {
    let generations = self.lock_generations()?;
    Ok(generations.get(storage_key).copied().unwrap_or(0))
  }

  fn lock_generations(&self) -> Result<MutexGuard<'_, HashMap<String, u64>>> {
    self
      .generations
      .lock()
      .map_err(|e| SyncError::Storage(format!("Lock poisoned: {}", e)))
  }

  /// Unreadable entries are dropped and treated as a miss.
  fn read_entry<T: DeserializeOwned>(&self, storage_key: &str) -> Result<Option<CacheEntry<T>>> {
    let raw = match self.storage.get(storage_key)? {
      Some(raw) => raw,
      None => return Ok(None),
    };

    match serde_json::from_str::<CacheEntry<T>>(&raw) {
      Ok(entry) => Ok(Some(entry)),
      Err(e) => {
        warn!(key = %storage_key, "discarding unreadable cache entry: {}", e);
        self.storage.remove(storage_key)?;
        Ok(None)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, KeyValueStore, MemoryStorage};
  use std::sync::atomic::{AtomicUsize, Ordering};
  use tokio::sync::oneshot;

  fn layer() -> (CacheLayer, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new());
    (CacheLayer::new(storage.clone()), storage)
  }

  async fn counted_fetch(layer: &CacheLayer, key: &str, calls: &AtomicUsize) -> Result<Vec<u32>> {
    let result = layer
      .get_or_fetch(key, move || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![1, 2, 3])
      })
      .await?;
    Ok(result.data)
  }

  #[tokio::test]
  async fn test_second_call_within_ttl_uses_cache() {
    let (layer, _) = layer();
    let calls = AtomicUsize::new(0);

    assert_eq!(counted_fetch(&layer, "folders_cache", &calls).await.unwrap(), vec![1, 2, 3]);
    assert_eq!(counted_fetch(&layer, "folders_cache", &calls).await.unwrap(), vec![1, 2, 3]);

    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_expired_entry_is_refetched() {
    let (layer, storage) = layer();
    let old = CacheEntry::new(vec![9u32], Utc::now() - Duration::minutes(6));
    storage
      .set("folders_cache", &serde_json::to_string(&old).unwrap())
      .unwrap();

    let calls = AtomicUsize::new(0);
    let data = counted_fetch(&layer, "folders_cache", &calls).await.unwrap();

    assert_eq!(data, vec![1, 2, 3]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_invalidate_forces_fetch() {
    let (layer, _) = layer();
    let calls = AtomicUsize::new(0);

    counted_fetch(&layer, "folder_notes_4", &calls).await.unwrap();
    layer.invalidate("folder_notes_4").unwrap();
    counted_fetch(&layer, "folder_notes_4", &calls).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_failed_fetch_leaves_cache_untouched() {
    let (layer, storage) = layer();

    let result = layer
      .get_or_fetch("folders_cache", || async {
        Err::<Vec<u32>, _>(SyncError::Network("refused".into()))
      })
      .await;

    assert!(matches!(result, Err(SyncError::Network(_))));
    assert_eq!(storage.get("folders_cache").unwrap(), None);
  }

  #[tokio::test]
  async fn test_entries_are_persisted_as_data_and_timestamp() {
    let (layer, storage) = layer();
    let calls = AtomicUsize::new(0);
    counted_fetch(&layer, "folders_cache", &calls).await.unwrap();

    let raw = storage.get("folders_cache").unwrap().unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(value["data"], serde_json::json!([1, 2, 3]));
    assert!(value["timestamp"].is_i64());
  }

  #[tokio::test]
  async fn test_corrupt_entry_is_treated_as_miss() {
    let (layer, storage) = layer();
    storage.set("folders_cache", "not json").unwrap();

    let calls = AtomicUsize::new(0);
    counted_fetch(&layer, "folders_cache", &calls).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_invalidation_during_fetch_discards_write() {
    let (layer, storage) = layer();
    let (release_tx, release_rx) = oneshot::channel::<()>();

    let fetching = {
      let layer = layer.clone();
      tokio::spawn(async move {
        layer
          .get_or_fetch("folders_cache", || async move {
            let _ = release_rx.await;
            Ok(vec![1u32])
          })
          .await
      })
    };

    tokio::task::yield_now().await;
    layer.invalidate("folders_cache").unwrap();
    release_tx.send(()).unwrap();

    let result = fetching.await.unwrap().unwrap();
    assert_eq!(result.data, vec![1]);
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(storage.get("folders_cache").unwrap(), None);
  }

  /// Store whose writes take a while, widening the window between the
  /// generation check and the write.
  struct SlowWrites {
    inner: MemoryStorage,
    delay: std::time::Duration,
  }

  impl KeyValueStore for SlowWrites {
    fn get(&self, key: &str) -> Result<Option<String>> {
      self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
      std::thread::sleep(self.delay);
      self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> Result<()> {
      self.inner.remove(key)
    }
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn test_invalidate_during_slow_write_is_not_undone() {
    let storage = Arc::new(SlowWrites {
      inner: MemoryStorage::new(),
      delay: std::time::Duration::from_millis(200),
    });
    let layer = CacheLayer::new(storage);

    let writing = {
      let layer = layer.clone();
      tokio::spawn(async move {
        layer
          .get_or_fetch("folders_cache", || async { Ok(vec![1u32]) })
          .await
      })
    };

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    layer.invalidate("folders_cache").unwrap();
    writing.await.unwrap().unwrap();

    let calls = AtomicUsize::new(0);
    counted_fetch(&layer, "folders_cache", &calls).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_unreachable_host_fails_fast_on_miss() {
    let (layer, storage) = layer();
    let connectivity = ConnectivityState::new();
    connectivity.record(false);
    let layer = layer.with_connectivity(connectivity);

    let calls = AtomicUsize::new(0);
    let result = counted_fetch(&layer, "folder_notes_1", &calls).await;

    assert!(matches!(result, Err(SyncError::Network(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // A fresh entry is still served while offline
    let entry = CacheEntry::new(vec![7u32], Utc::now());
    storage
      .set("folder_notes_1", &serde_json::to_string(&entry).unwrap())
      .unwrap();
    assert_eq!(counted_fetch(&layer, "folder_notes_1", &calls).await.unwrap(), vec![7]);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }
}
