//! Caching for collection snapshots.
//!
//! Two layers live here:
//! - [`QueryStore`]: the in-memory, per-key visible value that optimistic
//!   mutations patch and roll back
//! - [`CacheLayer`] over [`SqliteStorage`]: persisted server-confirmed
//!   collections, used for cache-first reads and offline fallback

mod layer;
mod storage;
mod store;
mod traits;

pub use layer::CacheLayer;
pub use storage::{CacheStorage, CachedQueryResult, SqliteStorage};
pub use store::{CacheEntry, CacheKey, FetchFuture, QueryStore};
pub use traits::{CacheResult, CacheSource, Cacheable, QueryKey};
