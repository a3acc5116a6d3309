//! Optimistic mutation reconciler.
//!
//! Each mutation runs the fixed sequence apply → submit → (confirm | rollback):
//!
//! ```ignore
//! let context = reconciler.apply_optimistic(&key, |orders| start(orders, 7));
//! match reconciler.submit_remote(&context, operation).await {
//!     MutationOutcome::Confirmed { .. } => {}
//!     MutationOutcome::Failed { error, .. } => show_error(error),
//! }
//! ```
//!
//! `mutate` wraps the whole cycle and applies the configured same-key policy.

use color_eyre::Result;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::executor::RemoteExecutor;
use super::pending::{MutationId, MutationState, PendingMutation, RollbackContext};
use crate::api::RemoteError;
use crate::cache::{CacheEntry, CacheKey, QueryStore};

/// How overlapping mutations on one cache key are handled.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SameKeyPolicy {
  /// One mutation per key at a time; later ones wait their turn (FIFO)
  /// before their optimistic patch is applied
  #[default]
  Serialize,
  /// No coordination; the later-resolving response decides what is shown
  LastWriteWins,
}

/// Result of one mutation, for the caller to present.
#[derive(Debug)]
pub enum MutationOutcome {
  Confirmed {
    id: MutationId,
  },
  Failed {
    id: MutationId,
    error: RemoteError,
    /// Whether the optimistic patch was reverted from the snapshot
    rolled_back: bool,
  },
}

impl MutationOutcome {
  pub fn id(&self) -> MutationId {
    match self {
      MutationOutcome::Confirmed { id } | MutationOutcome::Failed { id, .. } => *id,
    }
  }

  pub fn is_confirmed(&self) -> bool {
    matches!(self, MutationOutcome::Confirmed { .. })
  }

  pub fn error(&self) -> Option<&RemoteError> {
    match self {
      MutationOutcome::Failed { error, .. } => Some(error),
      MutationOutcome::Confirmed { .. } => None,
    }
  }
}

struct Inner<V, E> {
  store: QueryStore<V>,
  remote: E,
  policy: SameKeyPolicy,
  pending: Mutex<BTreeMap<MutationId, PendingMutation<V>>>,
  key_locks: Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>>,
  next_id: AtomicU64,
}

/// Applies speculative edits to a [`QueryStore`] and reconciles them with
/// the outcome of the matching remote call.
pub struct Reconciler<V, E> {
  inner: Arc<Inner<V, E>>,
}

impl<V, E> Clone for Reconciler<V, E> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<V, E> Reconciler<V, E>
where
  V: Send + Sync + 'static,
  E: RemoteExecutor,
{
  pub fn new(store: QueryStore<V>, remote: E, policy: SameKeyPolicy) -> Self {
    Self {
      inner: Arc::new(Inner {
        store,
        remote,
        policy,
        pending: Mutex::new(BTreeMap::new()),
        key_locks: Mutex::new(HashMap::new()),
        next_id: AtomicU64::new(1),
      }),
    }
  }

  pub fn store(&self) -> &QueryStore<V> {
    &self.inner.store
  }

  pub fn policy(&self) -> SameKeyPolicy {
    self.inner.policy
  }

  /// Current visible value for rendering.
  pub fn read(&self, key: &CacheKey) -> Option<Arc<V>> {
    self.inner.store.get(key)
  }

  pub fn subscribe(&self, key: &CacheKey) -> watch::Receiver<Option<CacheEntry<V>>> {
    self.inner.store.subscribe(key)
  }

  /// Number of outstanding (unresolved) mutations on `key`.
  pub fn pending_count(&self, key: &CacheKey) -> usize {
    self.pending().values().filter(|m| &m.key == key).count()
  }

  /// State of an outstanding mutation; `None` once it has resolved.
  pub fn state(&self, context: &RollbackContext) -> Option<MutationState> {
    self.pending().get(&context.id()).map(|m| m.state)
  }

  fn pending(&self) -> MutexGuard<'_, BTreeMap<MutationId, PendingMutation<V>>> {
    self
      .inner
      .pending
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// Patch the visible value of `key` right away and remember how to undo it.
  ///
  /// When the key has no value yet nothing is patched, but a context is
  /// still issued so the rest of the cycle runs the same way.
  pub fn apply_optimistic<F>(&self, key: &CacheKey, mutator: F) -> RollbackContext
  where
    F: FnOnce(&V) -> V,
  {
    let id = MutationId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
    let snapshot = self.inner.store.replace_with(key, mutator);
    if snapshot.is_none() {
      debug!(mutation = %id, key = %key, "no cached value to patch");
    }

    self
      .pending()
      .insert(id, PendingMutation::new(id, key.clone(), snapshot));
    RollbackContext::new(id, key.clone())
  }

  /// Perform the remote call for an applied mutation and settle it.
  ///
  /// Success confirms the key; failure rolls back `context`. The error is
  /// returned in the outcome, never retried.
  pub async fn submit_remote(
    &self,
    context: &RollbackContext,
    operation: E::Operation,
  ) -> MutationOutcome {
    let id = context.id();
    let key = context.key();

    if let Some(mutation) = self.pending().get_mut(&id) {
      mutation.set_state(MutationState::InFlight);
    }
    debug!(mutation = %id, key = %key, %operation, "submitting");

    let mut guard = SettleOnDrop {
      reconciler: self,
      context,
      armed: true,
    };
    let result = self.inner.remote.execute(operation).await;
    guard.armed = false;

    match result {
      Ok(()) => {
        if !self.confirm(key) {
          // Our context was already discarded by another confirm on this
          // key; the server still changed, so converge anyway.
          self.invalidate_and_refetch(key);
        }
        info!(mutation = %id, key = %key, "mutation confirmed");
        MutationOutcome::Confirmed { id }
      }
      Err(error) => {
        let rolled_back = match self.resolve_rollback(key, context) {
          Some(restored) => restored,
          None => {
            // Context gone: the patch may still be visible until the server
            // copy replaces it.
            self.invalidate_and_refetch(key);
            false
          }
        };
        warn!(mutation = %id, key = %key, %error, rolled_back, "mutation failed");
        MutationOutcome::Failed {
          id,
          error,
          rolled_back,
        }
      }
    }
  }

  /// Discard every outstanding rollback context for `key` and refresh it
  /// from the server.
  ///
  /// Returns false without touching anything when no context is
  /// outstanding, so confirming twice is harmless.
  pub fn confirm(&self, key: &CacheKey) -> bool {
    let discarded = {
      let mut pending = self.pending();
      let ids: Vec<MutationId> = pending
        .values()
        .filter(|m| &m.key == key)
        .map(|m| m.id)
        .collect();
      for id in &ids {
        if let Some(mutation) = pending.remove(id) {
          drop(mutation.resolve(MutationState::Confirmed));
        }
      }
      ids.len()
    };

    if discarded == 0 {
      debug!(key = %key, "confirm: nothing outstanding");
      return false;
    }

    debug!(key = %key, discarded, "confirmed");
    self.invalidate_and_refetch(key);
    true
  }

  /// Restore the snapshot captured for `context`.
  ///
  /// Returns false when the context was already resolved (or belongs to a
  /// different key); the cache is left alone in that case.
  pub fn rollback(&self, key: &CacheKey, context: &RollbackContext) -> bool {
    self.resolve_rollback(key, context).is_some()
  }

  /// `None` if the context was not outstanding, otherwise whether a
  /// snapshot was written back.
  fn resolve_rollback(&self, key: &CacheKey, context: &RollbackContext) -> Option<bool> {
    if context.key() != key {
      warn!(mutation = %context.id(), key = %key, owner = %context.key(), "rollback for wrong key ignored");
      return None;
    }

    let (mutation, superseded, others_pending) = {
      let mut pending = self.pending();
      let mutation = pending.remove(&context.id())?;
      let others_pending = pending.values().any(|m| &m.key == key);
      let superseded = pending
        .values()
        .any(|m| &m.key == key && m.id > context.id());
      (mutation, superseded, others_pending)
    };

    if superseded {
      warn!(
        mutation = %context.id(),
        key = %key,
        "rolling back beneath a newer optimistic mutation; its patch is overwritten"
      );
    }

    let restored = match mutation.resolve(MutationState::RolledBack) {
      Some(snapshot) => {
        self.inner.store.restore(key, snapshot);
        true
      }
      None => false,
    };

    // Snapshots taken by the other outstanding mutations may contain this
    // patch. Mark the key stale so the last one to settle reloads it.
    if others_pending {
      self.inner.store.invalidate(key);
    }

    if self
      .inner
      .store
      .entry(key)
      .is_some_and(|entry| entry.invalidated)
    {
      self.schedule_refetch(key);
    }

    Some(restored)
  }

  /// Run the full apply → submit → settle cycle under the same-key policy.
  pub async fn mutate<F>(
    &self,
    key: &CacheKey,
    mutator: F,
    operation: E::Operation,
  ) -> MutationOutcome
  where
    F: FnOnce(&V) -> V + Send,
  {
    let _turn = match self.inner.policy {
      SameKeyPolicy::Serialize => Some(self.key_lock(key).lock_owned().await),
      SameKeyPolicy::LastWriteWins => None,
    };

    let context = self.apply_optimistic(key, mutator);
    self.submit_remote(&context, operation).await
  }

  fn key_lock(&self, key: &CacheKey) -> Arc<tokio::sync::Mutex<()>> {
    let mut locks = self
      .inner
      .key_locks
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner());
    Arc::clone(locks.entry(key.clone()).or_default())
  }

  /// Write server data obtained elsewhere (e.g. an initial cache-first
  /// load). Dropped while mutations on the key are outstanding.
  pub fn publish(&self, key: &CacheKey, value: V) -> bool {
    if self.pending_count(key) > 0 {
      debug!(key = %key, "publish dropped: mutations outstanding");
      return false;
    }
    self.inner.store.set(key, value);
    true
  }

  /// Drop every cached value (logout). Outstanding mutations still settle.
  pub fn clear(&self) {
    self.inner.store.clear();
  }

  /// Load authoritative data for `key` and publish it.
  ///
  /// The result is dropped (returns `Ok(false)`) when mutations on the key
  /// are still outstanding or the visible value changed while loading;
  /// whoever made that change refetches again.
  pub async fn refetch(&self, key: &CacheKey) -> Result<bool> {
    let seen = self.inner.store.entry(key).map(|entry| entry.version);
    let value = self.inner.store.load(key).await?;

    if self.pending_count(key) > 0 {
      debug!(key = %key, "refetch result dropped: mutations outstanding");
      return Ok(false);
    }

    let written = self.inner.store.set_if_version(key, value, seen);
    if written {
      debug!(key = %key, "refetched");
    }
    Ok(written)
  }

  fn invalidate_and_refetch(&self, key: &CacheKey) {
    self.inner.store.invalidate(key);
    self.schedule_refetch(key);
  }

  fn schedule_refetch(&self, key: &CacheKey) {
    if !self.inner.store.has_fetcher(key) {
      debug!(key = %key, "no fetcher registered; entry stays invalidated");
      return;
    }
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
      debug!(key = %key, "no runtime; entry stays invalidated until refetched");
      return;
    };

    let this = self.clone();
    let key = key.clone();
    runtime.spawn(async move {
      if let Err(e) = this.refetch(&key).await {
        warn!(key = %key, error = %e, "refetch failed; keeping current value");
      }
    });
  }
}

/// Rolls back a mutation whose `submit_remote` future was dropped before
/// the remote call returned.
///
/// The server may or may not have applied the call, so the key is reloaded
/// after the snapshot goes back.
struct SettleOnDrop<'a, V, E>
where
  V: Send + Sync + 'static,
  E: RemoteExecutor,
{
  reconciler: &'a Reconciler<V, E>,
  context: &'a RollbackContext,
  armed: bool,
}

impl<V, E> Drop for SettleOnDrop<'_, V, E>
where
  V: Send + Sync + 'static,
  E: RemoteExecutor,
{
  fn drop(&mut self) {
    if !self.armed {
      return;
    }
    let key = self.context.key();
    if self.reconciler.resolve_rollback(key, self.context).is_some() {
      warn!(mutation = %self.context.id(), key = %key, "mutation abandoned before the server answered; rolled back");
      self.reconciler.invalidate_and_refetch(key);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::mutation::executor::RemoteFuture;
  use std::fmt;
  use std::sync::atomic::AtomicUsize;
  use std::time::Duration;
  use tokio::sync::oneshot;

  #[derive(Debug, Clone, PartialEq)]
  struct Rec {
    id: u64,
    status: &'static str,
  }

  type Records = Vec<Rec>;

  enum Reply {
    Ok,
    Fail,
    Wait(oneshot::Receiver<bool>),
  }

  struct TestOp {
    name: &'static str,
    reply: Reply,
  }

  impl TestOp {
    fn ok(name: &'static str) -> Self {
      Self {
        name,
        reply: Reply::Ok,
      }
    }

    fn fail(name: &'static str) -> Self {
      Self {
        name,
        reply: Reply::Fail,
      }
    }

    /// Resolves when the returned sender fires (true = success)
    fn gated(name: &'static str) -> (Self, oneshot::Sender<bool>) {
      let (tx, rx) = oneshot::channel();
      (
        Self {
          name,
          reply: Reply::Wait(rx),
        },
        tx,
      )
    }
  }

  impl fmt::Display for TestOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(self.name)
    }
  }

  #[derive(Default)]
  struct TestRemote {
    calls: Arc<AtomicUsize>,
  }

  impl RemoteExecutor for TestRemote {
    type Operation = TestOp;

    fn execute(&self, operation: TestOp) -> RemoteFuture {
      self.calls.fetch_add(1, Ordering::SeqCst);
      Box::pin(async move {
        let ok = match operation.reply {
          Reply::Ok => true,
          Reply::Fail => false,
          Reply::Wait(rx) => rx.await.unwrap_or(false),
        };
        if ok {
          Ok(())
        } else {
          Err(RemoteError::Status {
            status: 500,
            body: operation.name.to_string(),
          })
        }
      })
    }
  }

  fn pending_order() -> Records {
    vec![Rec {
      id: 1,
      status: "PENDING",
    }]
  }

  fn set_status(id: u64, status: &'static str) -> impl FnOnce(&Records) -> Records + Send {
    move |records| {
      records
        .iter()
        .map(|r| {
          if r.id == id {
            Rec { id: r.id, status }
          } else {
            r.clone()
          }
        })
        .collect()
    }
  }

  fn work_orders() -> CacheKey {
    CacheKey::from("work-orders")
  }

  fn setup(policy: SameKeyPolicy) -> Reconciler<Records, TestRemote> {
    let store = QueryStore::new();
    store.set(&work_orders(), pending_order());
    Reconciler::new(store, TestRemote::default(), policy)
  }

  /// Serve `server` as the authoritative copy of the work orders key.
  fn register_server(reconciler: &Reconciler<Records, TestRemote>) -> Arc<Mutex<Records>> {
    let server = Arc::new(Mutex::new(pending_order()));
    let shared = Arc::clone(&server);
    reconciler.store().register(&work_orders(), move || {
      let records = shared.lock().unwrap().clone();
      async move { Ok::<_, color_eyre::Report>(records) }
    });
    server
  }

  /// Wait until the entry is no longer invalidated (a refetch landed).
  async fn settled(reconciler: &Reconciler<Records, TestRemote>) -> Arc<Records> {
    let mut rx = reconciler.subscribe(&work_orders());
    tokio::time::timeout(Duration::from_secs(1), async {
      loop {
        if let Some(entry) = rx.borrow_and_update().as_ref() {
          if !entry.invalidated {
            return Arc::clone(&entry.value);
          }
        }
        rx.changed().await.unwrap();
      }
    })
    .await
    .expect("refetch did not land")
  }

  fn status_of(reconciler: &Reconciler<Records, TestRemote>) -> &'static str {
    reconciler.read(&work_orders()).unwrap()[0].status
  }

  #[tokio::test]
  async fn test_confirm_is_idempotent() {
    let reconciler = setup(SameKeyPolicy::Serialize);
    let key = work_orders();
    reconciler.apply_optimistic(&key, set_status(1, "IN_PROGRESS"));

    assert!(reconciler.confirm(&key));
    let after_first = reconciler.store().entry(&key).unwrap();
    assert!(after_first.invalidated);

    assert!(!reconciler.confirm(&key));
    let after_second = reconciler.store().entry(&key).unwrap();
    assert_eq!(after_second.version, after_first.version);
    assert_eq!(*after_second.value, *after_first.value);
  }

  #[tokio::test]
  async fn test_rollback_restores_exact_value() {
    let reconciler = setup(SameKeyPolicy::Serialize);
    let key = work_orders();
    let original = reconciler.read(&key).unwrap();

    let context = reconciler.apply_optimistic(&key, |_| Vec::new());
    assert!(reconciler.read(&key).unwrap().is_empty());

    assert!(reconciler.rollback(&key, &context));
    let restored = reconciler.read(&key).unwrap();
    assert!(Arc::ptr_eq(&original, &restored));
    assert_eq!(*restored, pending_order());

    // Snapshot is gone after use
    assert!(!reconciler.rollback(&key, &context));
    assert_eq!(reconciler.state(&context), None);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn test_readers_never_see_partial_values() {
    let store = QueryStore::new();
    let key = work_orders();
    let all = |status| {
      (0..500)
        .map(|id| Rec { id, status })
        .collect::<Records>()
    };
    store.set(&key, all("PENDING"));
    let reconciler = Reconciler::new(store, TestRemote::default(), SameKeyPolicy::Serialize);

    let reader = {
      let reconciler = reconciler.clone();
      let key = key.clone();
      tokio::spawn(async move {
        for _ in 0..2_000 {
          let value = reconciler.read(&key).unwrap();
          let first = value[0].status;
          assert!(value.iter().all(|r| r.status == first));
          assert_eq!(value.len(), 500);
          tokio::task::yield_now().await;
        }
      })
    };

    for round in 0..200 {
      let status = if round % 2 == 0 { "IN_PROGRESS" } else { "PENDING" };
      let context = reconciler.apply_optimistic(&key, |records| {
        records.iter().map(|r| Rec { id: r.id, status }).collect()
      });
      reconciler.confirm(context.key());
      tokio::task::yield_now().await;
    }

    reader.await.unwrap();
  }

  #[tokio::test]
  async fn test_success_path_shows_patch_then_server_copy() {
    let reconciler = setup(SameKeyPolicy::Serialize);
    let server = register_server(&reconciler);
    let key = work_orders();

    let context = reconciler.apply_optimistic(&key, set_status(1, "IN_PROGRESS"));
    assert_eq!(status_of(&reconciler), "IN_PROGRESS");
    assert_eq!(reconciler.state(&context), Some(MutationState::Created));

    *server.lock().unwrap() = vec![Rec {
      id: 1,
      status: "IN_PROGRESS",
    }];
    let outcome = reconciler.submit_remote(&context, TestOp::ok("start")).await;
    assert!(outcome.is_confirmed());
    assert_eq!(reconciler.pending_count(&key), 0);

    let refreshed = settled(&reconciler).await;
    assert_eq!(refreshed[0].status, "IN_PROGRESS");
  }

  #[tokio::test]
  async fn test_failure_path_reverts_and_discards_context() {
    let reconciler = setup(SameKeyPolicy::Serialize);
    let key = work_orders();

    let context = reconciler.apply_optimistic(&key, set_status(1, "IN_PROGRESS"));
    let outcome = reconciler.submit_remote(&context, TestOp::fail("start")).await;

    match outcome {
      MutationOutcome::Failed {
        rolled_back, error, ..
      } => {
        assert!(rolled_back);
        assert_eq!(error.status(), Some(500));
      }
      other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(*reconciler.read(&key).unwrap(), pending_order());
    assert!(!reconciler.rollback(&key, &context));
  }

  #[tokio::test]
  async fn test_keys_are_isolated() {
    let reconciler = setup(SameKeyPolicy::Serialize);
    let key = work_orders();
    let parts = CacheKey::from("parts");
    reconciler.store().set(
      &parts,
      vec![Rec {
        id: 1,
        status: "IN_STOCK",
      }],
    );
    let parts_before = reconciler.store().entry(&parts).unwrap();

    reconciler
      .mutate(&key, set_status(1, "ON_HOLD"), TestOp::fail("hold"))
      .await;
    reconciler
      .mutate(&key, set_status(1, "COMPLETED"), TestOp::ok("complete"))
      .await;

    let parts_after = reconciler.store().entry(&parts).unwrap();
    assert!(Arc::ptr_eq(&parts_before.value, &parts_after.value));
    assert_eq!(parts_before.version, parts_after.version);
    assert!(!parts_after.invalidated);
  }

  #[tokio::test]
  async fn test_missing_key_is_not_patched() {
    let reconciler: Reconciler<Records, TestRemote> =
      Reconciler::new(QueryStore::new(), TestRemote::default(), SameKeyPolicy::Serialize);
    let key = work_orders();

    let context = reconciler.apply_optimistic(&key, set_status(1, "IN_PROGRESS"));
    assert!(reconciler.read(&key).is_none());
    assert_eq!(reconciler.pending_count(&key), 1);

    let outcome = reconciler.submit_remote(&context, TestOp::fail("start")).await;
    assert!(matches!(
      outcome,
      MutationOutcome::Failed {
        rolled_back: false,
        ..
      }
    ));
    assert!(reconciler.read(&key).is_none());
    assert_eq!(reconciler.pending_count(&key), 0);
  }

  #[tokio::test]
  async fn test_state_is_in_flight_while_waiting() {
    let reconciler = setup(SameKeyPolicy::Serialize);
    let key = work_orders();
    let context = reconciler.apply_optimistic(&key, set_status(1, "IN_PROGRESS"));
    let (op, release) = TestOp::gated("start");

    let task = {
      let reconciler = reconciler.clone();
      let context = context.clone();
      tokio::spawn(async move { reconciler.submit_remote(&context, op).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(reconciler.state(&context), Some(MutationState::InFlight));

    release.send(true).unwrap();
    assert!(task.await.unwrap().is_confirmed());
    assert_eq!(reconciler.state(&context), None);
  }

  #[tokio::test]
  async fn test_serialize_policy_queues_same_key_mutations() {
    let reconciler = setup(SameKeyPolicy::Serialize);
    let key = work_orders();
    let (start, release_start) = TestOp::gated("start");
    let (complete, release_complete) = TestOp::gated("complete");

    let first = {
      let reconciler = reconciler.clone();
      let key = key.clone();
      tokio::spawn(async move {
        reconciler
          .mutate(&key, set_status(1, "IN_PROGRESS"), start)
          .await
      })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = {
      let reconciler = reconciler.clone();
      let key = key.clone();
      tokio::spawn(async move {
        reconciler
          .mutate(&key, set_status(1, "COMPLETED"), complete)
          .await
      })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Second mutation waits for the first before patching
    assert_eq!(reconciler.pending_count(&key), 1);
    assert_eq!(status_of(&reconciler), "IN_PROGRESS");

    release_start.send(false).unwrap();
    assert!(!first.await.unwrap().is_confirmed());
    tokio::time::sleep(Duration::from_millis(20)).await;

    // First rolled back cleanly, then the second applied on top of it
    assert_eq!(status_of(&reconciler), "COMPLETED");
    assert_eq!(reconciler.pending_count(&key), 1);

    release_complete.send(true).unwrap();
    assert!(second.await.unwrap().is_confirmed());
    assert_eq!(reconciler.pending_count(&key), 0);
  }

  #[tokio::test]
  async fn test_last_write_wins_converges_to_server() {
    let reconciler = setup(SameKeyPolicy::LastWriteWins);
    let server = register_server(&reconciler);
    let key = work_orders();
    let (start, release_start) = TestOp::gated("start");
    let (hold, release_hold) = TestOp::gated("hold");

    let first = {
      let reconciler = reconciler.clone();
      let key = key.clone();
      tokio::spawn(async move {
        reconciler
          .mutate(&key, set_status(1, "IN_PROGRESS"), start)
          .await
      })
    };
    let second = {
      let reconciler = reconciler.clone();
      let key = key.clone();
      tokio::spawn(async move { reconciler.mutate(&key, set_status(1, "ON_HOLD"), hold).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Both patches applied without waiting
    assert_eq!(reconciler.pending_count(&key), 2);

    *server.lock().unwrap() = vec![Rec {
      id: 1,
      status: "IN_PROGRESS",
    }];
    release_start.send(true).unwrap();
    assert!(first.await.unwrap().is_confirmed());
    // Confirm discarded every context on the key
    assert_eq!(reconciler.pending_count(&key), 0);

    release_hold.send(false).unwrap();
    let outcome = second.await.unwrap();
    assert!(matches!(
      outcome,
      MutationOutcome::Failed {
        rolled_back: false,
        ..
      }
    ));

    let value = settled(&reconciler).await;
    assert_eq!(value[0].status, "IN_PROGRESS");
  }

  #[tokio::test]
  async fn test_refetch_dropped_while_mutation_outstanding() {
    let reconciler = setup(SameKeyPolicy::Serialize);
    register_server(&reconciler);
    let key = work_orders();

    let context = reconciler.apply_optimistic(&key, set_status(1, "IN_PROGRESS"));
    assert!(!reconciler.refetch(&key).await.unwrap());
    assert_eq!(status_of(&reconciler), "IN_PROGRESS");

    reconciler.rollback(&key, &context);
    assert!(reconciler.refetch(&key).await.unwrap());
  }

  #[tokio::test]
  async fn test_rollback_with_foreign_key_is_ignored() {
    let reconciler = setup(SameKeyPolicy::Serialize);
    let key = work_orders();
    let context = reconciler.apply_optimistic(&key, set_status(1, "IN_PROGRESS"));

    assert!(!reconciler.rollback(&CacheKey::from("parts"), &context));
    assert_eq!(reconciler.state(&context), Some(MutationState::Created));
    assert_eq!(status_of(&reconciler), "IN_PROGRESS");
  }

  #[tokio::test]
  async fn test_remote_called_once_per_mutation() {
    let reconciler = setup(SameKeyPolicy::Serialize);
    let calls = Arc::clone(&reconciler.inner.remote.calls);

    reconciler
      .mutate(&work_orders(), set_status(1, "ON_HOLD"), TestOp::fail("hold"))
      .await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_overlapping_failures_converge_to_server() {
    let reconciler = setup(SameKeyPolicy::LastWriteWins);
    register_server(&reconciler);
    let key = work_orders();
    let (start, release_start) = TestOp::gated("start");
    let (complete, release_complete) = TestOp::gated("complete");

    let first = {
      let reconciler = reconciler.clone();
      let key = key.clone();
      tokio::spawn(async move {
        reconciler
          .mutate(&key, set_status(1, "IN_PROGRESS"), start)
          .await
      })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = {
      let reconciler = reconciler.clone();
      let key = key.clone();
      tokio::spawn(async move {
        reconciler
          .mutate(&key, set_status(1, "COMPLETED"), complete)
          .await
      })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(status_of(&reconciler), "COMPLETED");

    release_start.send(false).unwrap();
    assert!(!first.await.unwrap().is_confirmed());
    // The later mutation still has the failed patch in its snapshot
    assert!(reconciler.store().entry(&key).unwrap().invalidated);

    release_complete.send(false).unwrap();
    assert!(!second.await.unwrap().is_confirmed());
    assert_eq!(reconciler.pending_count(&key), 0);

    let value = settled(&reconciler).await;
    assert_eq!(value[0].status, "PENDING");
  }

  #[tokio::test]
  async fn test_dropped_mutation_is_rolled_back() {
    let reconciler = setup(SameKeyPolicy::Serialize);
    register_server(&reconciler);
    let key = work_orders();
    let (start, _release) = TestOp::gated("start");

    let result = tokio::time::timeout(
      Duration::from_millis(20),
      reconciler.mutate(&key, set_status(1, "IN_PROGRESS"), start),
    )
    .await;
    assert!(result.is_err());

    assert_eq!(reconciler.pending_count(&key), 0);
    assert_eq!(status_of(&reconciler), "PENDING");
    let value = settled(&reconciler).await;
    assert_eq!(value[0].status, "PENDING");

    // The key is free again for the next mutation
    let outcome = reconciler
      .mutate(&key, set_status(1, "ON_HOLD"), TestOp::fail("hold"))
      .await;
    assert!(!outcome.is_confirmed());
  }

  #[tokio::test]
  async fn test_publish_waits_for_outstanding_mutations() {
    let reconciler = setup(SameKeyPolicy::Serialize);
    let key = work_orders();
    let context = reconciler.apply_optimistic(&key, set_status(1, "IN_PROGRESS"));

    assert!(!reconciler.publish(&key, Vec::new()));
    assert_eq!(status_of(&reconciler), "IN_PROGRESS");

    reconciler.rollback(&key, &context);
    assert!(reconciler.publish(&key, Vec::new()));
    assert!(reconciler.read(&key).unwrap().is_empty());
  }
}
