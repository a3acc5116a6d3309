//! In-memory query store: the single authoritative value per cache key.
//!
//! Every key owns a `watch` channel whose current value is the visible
//! cache entry. Writes replace the whole entry, so subscribers only ever
//! observe complete values. Values are shared as `Arc<V>` and never mutated
//! in place.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::debug;

/// Name of a cached collection, e.g. `"all-work-orders"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
  pub fn new(key: impl AsRef<str>) -> Self {
    Self(Arc::from(key.as_ref()))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl From<&str> for CacheKey {
  fn from(key: &str) -> Self {
    Self::new(key)
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// The visible value for a key plus bookkeeping.
#[derive(Debug)]
pub struct CacheEntry<V> {
  pub value: Arc<V>,
  /// When this value was last written
  pub updated_at: DateTime<Utc>,
  /// Set on confirm; cleared by the next authoritative write
  pub invalidated: bool,
  /// Store-wide monotonically increasing write counter
  pub version: u64,
}

impl<V> Clone for CacheEntry<V> {
  fn clone(&self) -> Self {
    Self {
      value: Arc::clone(&self.value),
      updated_at: self.updated_at,
      invalidated: self.invalidated,
      version: self.version,
    }
  }
}

/// A boxed future that loads a fresh value for a key
pub type FetchFuture<V> = Pin<Box<dyn Future<Output = Result<V>> + Send>>;

/// A factory function that creates futures for fetching data
type FetcherFn<V> = Arc<dyn Fn() -> FetchFuture<V> + Send + Sync>;

struct Slot<V> {
  tx: watch::Sender<Option<CacheEntry<V>>>,
  fetcher: Option<FetcherFn<V>>,
}

impl<V> Slot<V> {
  fn new() -> Self {
    let (tx, _rx) = watch::channel(None);
    Self { tx, fetcher: None }
  }
}

struct StoreInner<V> {
  slots: Mutex<HashMap<CacheKey, Slot<V>>>,
  next_version: AtomicU64,
}

/// Process-wide keyed cache of collection snapshots.
///
/// Created once at start-up and torn down with [`QueryStore::clear`] on
/// logout. Cloning yields another handle to the same store.
pub struct QueryStore<V> {
  inner: Arc<StoreInner<V>>,
}

impl<V> Clone for QueryStore<V> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<V: Send + Sync + 'static> Default for QueryStore<V> {
  fn default() -> Self {
    Self::new()
  }
}

impl<V: Send + Sync + 'static> QueryStore<V> {
  pub fn new() -> Self {
    Self {
      inner: Arc::new(StoreInner {
        slots: Mutex::new(HashMap::new()),
        next_version: AtomicU64::new(1),
      }),
    }
  }

  fn slots(&self) -> MutexGuard<'_, HashMap<CacheKey, Slot<V>>> {
    // Critical sections never panic while holding the lock, so a poisoned
    // map is still consistent.
    self
      .inner
      .slots
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  fn bump_version(&self) -> u64 {
    self.inner.next_version.fetch_add(1, Ordering::SeqCst)
  }

  /// Install the fetcher used to load authoritative data for `key`.
  pub fn register<F, Fut>(&self, key: &CacheKey, fetcher: F)
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V>> + Send + 'static,
  {
    let fetcher: FetcherFn<V> = Arc::new(move || Box::pin(fetcher()));
    self
      .slots()
      .entry(key.clone())
      .or_insert_with(Slot::new)
      .fetcher = Some(fetcher);
  }

  /// Whether a fetcher is registered for `key`.
  pub fn has_fetcher(&self, key: &CacheKey) -> bool {
    self
      .slots()
      .get(key)
      .is_some_and(|slot| slot.fetcher.is_some())
  }

  /// Current value for `key`, if any.
  pub fn get(&self, key: &CacheKey) -> Option<Arc<V>> {
    self.entry(key).map(|entry| entry.value)
  }

  /// Current entry for `key`, if any.
  pub fn entry(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
    self
      .slots()
      .get(key)
      .and_then(|slot| slot.tx.borrow().clone())
  }

  /// Subscribe to changes of `key`. Works before the key has a value.
  pub fn subscribe(&self, key: &CacheKey) -> watch::Receiver<Option<CacheEntry<V>>> {
    self
      .slots()
      .entry(key.clone())
      .or_insert_with(Slot::new)
      .tx
      .subscribe()
  }

  /// Write an authoritative value. Clears the invalidated flag.
  pub fn set(&self, key: &CacheKey, value: V) -> u64 {
    self.write(key, Arc::new(value))
  }

  /// Write an authoritative value only if the entry has not changed since
  /// `expected_version` was observed (`None` meaning "had no value").
  pub fn set_if_version(&self, key: &CacheKey, value: V, expected_version: Option<u64>) -> bool {
    let mut slots = self.slots();
    let slot = slots.entry(key.clone()).or_insert_with(Slot::new);
    let current = slot.tx.borrow().as_ref().map(|entry| entry.version);
    if current != expected_version {
      debug!(key = %key, ?current, ?expected_version, "discarding superseded write");
      return false;
    }
    let version = self.bump_version();
    slot.tx.send_replace(Some(CacheEntry {
      value: Arc::new(value),
      updated_at: Utc::now(),
      invalidated: false,
      version,
    }));
    true
  }

  /// Atomically swap the value for `mutator(&current)`.
  ///
  /// Returns the replaced entry, or `None` without calling the mutator when
  /// the key has no value. The mutator runs under the store lock and must
  /// not call back into the store.
  pub fn replace_with<F>(&self, key: &CacheKey, mutator: F) -> Option<CacheEntry<V>>
  where
    F: FnOnce(&V) -> V,
  {
    let mut slots = self.slots();
    let slot = slots.get_mut(key)?;
    let previous = slot.tx.borrow().clone()?;
    let next = mutator(&previous.value);
    let version = self.bump_version();
    slot.tx.send_replace(Some(CacheEntry {
      value: Arc::new(next),
      updated_at: Utc::now(),
      invalidated: previous.invalidated,
      version,
    }));
    debug!(key = %key, version, "applied local patch");
    Some(previous)
  }

  /// Put a previously captured entry back. Keeps the current invalidated
  /// flag so an owed refetch is not forgotten.
  pub fn restore(&self, key: &CacheKey, snapshot: CacheEntry<V>) -> u64 {
    let mut slots = self.slots();
    let slot = slots.entry(key.clone()).or_insert_with(Slot::new);
    let invalidated = slot
      .tx
      .borrow()
      .as_ref()
      .is_some_and(|entry| entry.invalidated);
    let version = self.bump_version();
    slot.tx.send_replace(Some(CacheEntry {
      value: snapshot.value,
      updated_at: snapshot.updated_at,
      invalidated,
      version,
    }));
    debug!(key = %key, version, "restored snapshot");
    version
  }

  fn write(&self, key: &CacheKey, value: Arc<V>) -> u64 {
    let version = self.bump_version();
    self
      .slots()
      .entry(key.clone())
      .or_insert_with(Slot::new)
      .tx
      .send_replace(Some(CacheEntry {
        value,
        updated_at: Utc::now(),
        invalidated: false,
        version,
      }));
    debug!(key = %key, version, "cache write");
    version
  }

  /// Mark the entry for `key` stale. Returns false when there is no value.
  pub fn invalidate(&self, key: &CacheKey) -> bool {
    let slots = self.slots();
    let Some(slot) = slots.get(key) else {
      return false;
    };
    let mut had_value = false;
    slot.tx.send_if_modified(|entry| match entry {
      Some(entry) => {
        had_value = true;
        !std::mem::replace(&mut entry.invalidated, true)
      }
      None => false,
    });
    had_value
  }

  /// Run the registered fetcher for `key` without writing the result.
  pub async fn load(&self, key: &CacheKey) -> Result<V> {
    let fetcher = self
      .slots()
      .get(key)
      .and_then(|slot| slot.fetcher.clone())
      .ok_or_else(|| eyre!("No fetcher registered for cache key '{}'", key))?;
    fetcher().await
  }

  /// Fetch authoritative data for `key` and store it.
  pub async fn fetch(&self, key: &CacheKey) -> Result<Arc<V>> {
    let value = self.load(key).await?;
    self.set(key, value);
    self
      .get(key)
      .ok_or_else(|| eyre!("Cache key '{}' was cleared during fetch", key))
  }

  /// Drop every value (logout). Fetchers and subscriptions survive.
  pub fn clear(&self) {
    for slot in self.slots().values() {
      slot.tx.send_replace(None);
    }
    debug!("query store cleared");
  }
}
