//! Cache layer that orchestrates persistent caching with network fetching.

use chrono::{Duration, Utc};
use color_eyre::Result;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use super::storage::CacheStorage;
use super::traits::{CacheResult, Cacheable, QueryKey};

/// Cache layer that manages caching logic and network fetching.
///
/// This layer sits between the remote client and the network,
/// providing transparent caching with offline support.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  /// How long before cached data is considered stale
  stale_time: Duration,
}

impl<S: CacheStorage> CacheLayer<S> {
  /// Create a new cache layer with the given storage backend.
  pub fn new(storage: S) -> Self {
    Self {
      storage: Arc::new(storage),
      stale_time: Duration::minutes(5),
    }
  }

  /// Set the stale time for cached data.
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  /// Check if cached data is stale based on cached_at timestamp.
  fn is_stale(&self, cached_at: chrono::DateTime<Utc>) -> bool {
    Utc::now() - cached_at > self.stale_time
  }

  /// Fetch a list with cache-first strategy.
  ///
  /// 1. Check cache - if fresh, return immediately
  /// 2. If stale/missing, fetch from network
  /// 3. On network failure, return stale cache (offline mode)
  /// 4. Update cache with new data
  pub async fn fetch_list<K, T, F, Fut>(&self, key: &K, fetcher: F) -> Result<CacheResult<Vec<T>>>
  where
    K: QueryKey + ?Sized,
    T: Cacheable,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<T>>>,
  {
    let hash = key.cache_hash();

    if let Some(cached) = self.storage.get_query_result::<T>(&hash)? {
      if !self.is_stale(cached.cached_at) {
        debug!(query = %key.description(), "serving fresh cache");
        return Ok(CacheResult::from_cache(cached.entities, cached.cached_at));
      }
    }

    self.refresh_list(key, fetcher).await
  }

  /// Fetch a list network-first.
  ///
  /// Used after a confirmed mutation, where the persisted copy is known to
  /// be behind the server. Falls back to whatever is cached when the network
  /// fails; errors only when there is nothing to fall back to.
  pub async fn refresh_list<K, T, F, Fut>(
    &self,
    key: &K,
    fetcher: F,
  ) -> Result<CacheResult<Vec<T>>>
  where
    K: QueryKey + ?Sized,
    T: Cacheable,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<T>>>,
  {
    let hash = key.cache_hash();

    match fetcher().await {
      Ok(data) => {
        self
          .storage
          .store_query_result(&hash, &key.description(), &data)?;
        Ok(CacheResult::from_network(data))
      }
      Err(err) => match self.storage.get_query_result::<T>(&hash)? {
        Some(cached) => {
          warn!(query = %key.description(), error = %err, "network failed, serving cached data");
          Ok(CacheResult::offline(cached.entities, cached.cached_at))
        }
        None => Err(err),
      },
    }
  }

  /// Drop the persisted result for a query.
  pub fn invalidate<K: QueryKey + ?Sized>(&self, key: &K) -> Result<()> {
    self.storage.invalidate_query(&key.cache_hash())
  }

  /// Drop every persisted result.
  pub fn clear(&self) -> Result<()> {
    self.storage.clear()
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      stale_time: self.stale_time,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::SqliteStorage;
  use crate::cache::CacheSource;
  use color_eyre::eyre::eyre;
  use serde::{Deserialize, Serialize};
  use std::sync::atomic::{AtomicU32, Ordering};

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Item(u64);

  impl Cacheable for Item {
    fn cache_key(&self) -> String {
      self.0.to_string()
    }

    fn updated_at(&self) -> Option<&str> {
      None
    }

    fn entity_type() -> &'static str {
      "item"
    }
  }

  #[tokio::test]
  async fn test_fresh_cache_skips_network() {
    let layer = CacheLayer::new(SqliteStorage::open_in_memory().unwrap());
    let counter = AtomicU32::new(0);
    let calls = &counter;

    let first = layer
      .fetch_list("items", || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok::<_, color_eyre::Report>(vec![Item(1)])
      })
      .await
      .unwrap();
    assert_eq!(first.source, CacheSource::Network);

    let second = layer
      .fetch_list("items", || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok::<_, color_eyre::Report>(vec![Item(2)])
      })
      .await
      .unwrap();
    assert_eq!(second.source, CacheSource::CacheFresh);
    assert_eq!(second.data, vec![Item(1)]);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_refresh_goes_to_network_even_when_fresh() {
    let layer = CacheLayer::new(SqliteStorage::open_in_memory().unwrap());
    layer
      .fetch_list("items", || async { Ok::<_, color_eyre::Report>(vec![Item(1)]) })
      .await
      .unwrap();

    let refreshed = layer
      .refresh_list("items", || async { Ok::<_, color_eyre::Report>(vec![Item(1), Item(2)]) })
      .await
      .unwrap();
    assert_eq!(refreshed.source, CacheSource::Network);
    assert_eq!(refreshed.data.len(), 2);
  }

  #[tokio::test]
  async fn test_offline_fallback() {
    let layer = CacheLayer::new(SqliteStorage::open_in_memory().unwrap());
    layer
      .fetch_list("items", || async { Ok::<_, color_eyre::Report>(vec![Item(7)]) })
      .await
      .unwrap();

    let result = layer
      .refresh_list("items", || async { Err::<Vec<Item>, _>(eyre!("connection refused")) })
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data, vec![Item(7)]);
  }

  #[tokio::test]
  async fn test_network_error_without_cache_propagates() {
    let layer = CacheLayer::new(SqliteStorage::open_in_memory().unwrap());
    let result = layer
      .fetch_list("items", || async { Err::<Vec<Item>, _>(eyre!("boom")) })
      .await;
    assert!(result.is_err());
  }
}
