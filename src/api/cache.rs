//! Caching implementations for CMMS types.

use sha2::{Digest, Sha256};

use crate::cache::{CacheKey, Cacheable, QueryKey};

use super::types::{Part, WorkOrder};

// ============================================================================
// Cacheable implementations
// ============================================================================

impl Cacheable for WorkOrder {
  fn cache_key(&self) -> String {
    self.id.to_string()
  }

  fn updated_at(&self) -> Option<&str> {
    Some(&self.updated_at)
  }

  fn entity_type() -> &'static str {
    "work_order"
  }
}

impl Cacheable for Part {
  fn cache_key(&self) -> String {
    self.id.to_string()
  }

  fn updated_at(&self) -> Option<&str> {
    Some(&self.updated_at)
  }

  fn entity_type() -> &'static str {
    "part"
  }
}

// ============================================================================
// Query key types
// ============================================================================

/// Collections fetched from the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiQueryKey {
  /// Every work order visible to the user
  AllWorkOrders,
  /// Parts inventory
  Parts,
}

impl ApiQueryKey {
  /// Key of the in-memory collection this query feeds.
  pub fn store_key(&self) -> CacheKey {
    match self {
      Self::AllWorkOrders => CacheKey::from("all-work-orders"),
      Self::Parts => CacheKey::from("parts"),
    }
  }
}

impl QueryKey for ApiQueryKey {
  fn cache_hash(&self) -> String {
    let input = match self {
      Self::AllWorkOrders => "work_orders:all",
      Self::Parts => "parts:all",
    };

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }

  fn description(&self) -> String {
    match self {
      Self::AllWorkOrders => "all work orders".to_string(),
      Self::Parts => "parts inventory".to_string(),
    }
  }
}
