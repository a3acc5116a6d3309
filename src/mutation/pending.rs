use chrono::{DateTime, Utc};
use std::fmt;
use tracing::trace;

use crate::cache::{CacheEntry, CacheKey};

/// Identifier of one optimistic mutation, unique per reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MutationId(pub(crate) u64);

impl fmt::Display for MutationId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "m-{}", self.0)
  }
}

/// Lifecycle of a pending mutation.
///
/// `Created` and `InFlight` are observable while the mutation is
/// outstanding; the terminal states only ever appear in logs because the
/// record is dropped as soon as it resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
  Created,
  InFlight,
  Confirmed,
  RolledBack,
}

/// Opaque handle to the snapshot needed to undo one optimistic patch.
///
/// Resolving a context twice is a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackContext {
  id: MutationId,
  key: CacheKey,
}

impl RollbackContext {
  pub(crate) fn new(id: MutationId, key: CacheKey) -> Self {
    Self { id, key }
  }

  pub fn id(&self) -> MutationId {
    self.id
  }

  pub fn key(&self) -> &CacheKey {
    &self.key
  }
}

/// Bookkeeping for one outstanding mutation.
pub(crate) struct PendingMutation<V> {
  pub id: MutationId,
  pub key: CacheKey,
  /// Entry as it was before the patch; `None` when there was nothing to
  /// patch. Never modified after capture.
  snapshot: Option<CacheEntry<V>>,
  pub state: MutationState,
  pub created_at: DateTime<Utc>,
}

impl<V> PendingMutation<V> {
  pub fn new(id: MutationId, key: CacheKey, snapshot: Option<CacheEntry<V>>) -> Self {
    Self {
      id,
      key,
      snapshot,
      state: MutationState::Created,
      created_at: Utc::now(),
    }
  }

  pub fn set_state(&mut self, state: MutationState) {
    trace!(mutation = %self.id, from = ?self.state, to = ?state, "mutation state");
    self.state = state;
  }

  /// Move to a terminal state, handing back the snapshot exactly once.
  pub fn resolve(mut self, terminal: MutationState) -> Option<CacheEntry<V>> {
    self.set_state(terminal);
    trace!(
      mutation = %self.id,
      elapsed_ms = (Utc::now() - self.created_at).num_milliseconds(),
      "mutation resolved"
    );
    self.snapshot.take()
  }
}
