//! Cached CMMS client that wraps ApiClient with transparent caching.

use chrono::Duration;
use color_eyre::{Report, Result};
use tracing::warn;

use crate::cache::{CacheLayer, CacheResult, SqliteStorage};
use crate::config::Config;
use crate::mutation::{RemoteExecutor, RemoteFuture};

use super::cache::ApiQueryKey;
use super::client::ApiClient;
use super::error::RemoteError;
use super::operation::RemoteOperation;
use super::types::{Part, WorkOrder};

/// CMMS client with transparent caching support.
///
/// Reads go through the persistent query cache with offline fallback.
/// Writes go straight to the server and drop the persisted copy of the
/// collection they touch.
#[derive(Clone)]
pub struct CachedApiClient {
  inner: ApiClient,
  cache: CacheLayer<SqliteStorage>,
}

impl CachedApiClient {
  /// Create a new cached client.
  pub fn new(config: &Config) -> Result<Self> {
    let inner = ApiClient::new(config)?;
    let storage = if config.cache.persist {
      SqliteStorage::open(&config.cache_path()?)?
    } else {
      SqliteStorage::open_in_memory()?
    };
    let cache = CacheLayer::new(storage)
      .with_stale_time(Duration::seconds(config.cache.stale_secs as i64));

    Ok(Self { inner, cache })
  }

  /// All work orders, cache-first.
  pub async fn work_orders(&self) -> Result<CacheResult<Vec<WorkOrder>>> {
    self
      .cache
      .fetch_list(&ApiQueryKey::AllWorkOrders, || {
        let inner = self.inner.clone();
        async move { inner.list_work_orders().await.map_err(Report::from) }
      })
      .await
  }

  /// All work orders, network-first.
  pub async fn refresh_work_orders(&self) -> Result<CacheResult<Vec<WorkOrder>>> {
    self
      .cache
      .refresh_list(&ApiQueryKey::AllWorkOrders, || {
        let inner = self.inner.clone();
        async move { inner.list_work_orders().await.map_err(Report::from) }
      })
      .await
  }

  /// Parts inventory, cache-first.
  pub async fn parts(&self) -> Result<CacheResult<Vec<Part>>> {
    self
      .cache
      .fetch_list(&ApiQueryKey::Parts, || {
        let inner = self.inner.clone();
        async move { inner.list_parts().await.map_err(Report::from) }
      })
      .await
  }

  /// Parts inventory, network-first.
  pub async fn refresh_parts(&self) -> Result<CacheResult<Vec<Part>>> {
    self
      .cache
      .refresh_list(&ApiQueryKey::Parts, || {
        let inner = self.inner.clone();
        async move { inner.list_parts().await.map_err(Report::from) }
      })
      .await
  }

  /// Forget everything persisted (logout).
  pub fn clear(&self) -> Result<()> {
    self.cache.clear()
  }
}

impl RemoteExecutor for CachedApiClient {
  type Operation = RemoteOperation;

  fn execute(&self, operation: RemoteOperation) -> RemoteFuture {
    let inner = self.inner.clone();
    let cache = self.cache.clone();

    Box::pin(async move {
      inner.execute(&operation).await?;

      let query = operation.affected_query();
      if let Err(e) = cache.invalidate(&query) {
        warn!(error = %e, ?query, "failed to invalidate persisted query");
      }
      Ok::<(), RemoteError>(())
    })
  }
}
