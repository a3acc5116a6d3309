//! Technician dashboard: work orders and parts with optimistic edits.
//!
//! Every edit patches the in-memory collection first, then calls the
//! backend. The reconciler confirms (refetch) or rolls back the patch.

use chrono::Utc;
use color_eyre::{Report, Result};
use std::sync::Arc;
use tracing::{debug, info};

use crate::api::{
  ApiQueryKey, CachedApiClient, Checkout, Part, RemoteOperation, TimeEntry, WorkOrder,
  WorkOrderStatus,
};
use crate::cache::{CacheKey, CacheResult, CacheSource, FetchFuture, QueryStore};
use crate::mutation::{MutationOutcome, Reconciler, RemoteExecutor, SameKeyPolicy};

/// Where the dashboard reads its collections and sends its edits.
pub trait DashboardBackend: RemoteExecutor<Operation = RemoteOperation> + Clone {
  /// Work orders, cache-first
  fn cached_work_orders(&self) -> FetchFuture<CacheResult<Vec<WorkOrder>>>;

  /// Work orders straight from the server (used for refetches)
  fn fresh_work_orders(&self) -> FetchFuture<Vec<WorkOrder>>;

  fn cached_parts(&self) -> FetchFuture<CacheResult<Vec<Part>>>;

  fn fresh_parts(&self) -> FetchFuture<Vec<Part>>;

  /// Forget anything persisted between runs
  fn clear_cache(&self) -> Result<()>;
}

impl DashboardBackend for CachedApiClient {
  fn cached_work_orders(&self) -> FetchFuture<CacheResult<Vec<WorkOrder>>> {
    let client = self.clone();
    Box::pin(async move { client.work_orders().await })
  }

  fn fresh_work_orders(&self) -> FetchFuture<Vec<WorkOrder>> {
    let client = self.clone();
    Box::pin(async move { Ok::<_, Report>(client.refresh_work_orders().await?.data) })
  }

  fn cached_parts(&self) -> FetchFuture<CacheResult<Vec<Part>>> {
    let client = self.clone();
    Box::pin(async move { client.parts().await })
  }

  fn fresh_parts(&self) -> FetchFuture<Vec<Part>> {
    let client = self.clone();
    Box::pin(async move { Ok::<_, Report>(client.refresh_parts().await?.data) })
  }

  fn clear_cache(&self) -> Result<()> {
    self.clear()
  }
}

/// Where the initial collections came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadReport {
  pub work_orders: CacheSource,
  pub parts: CacheSource,
}

pub struct Dashboard<B = CachedApiClient> {
  backend: B,
  work_orders: Reconciler<Vec<WorkOrder>, B>,
  parts: Reconciler<Vec<Part>, B>,
}

impl<B: DashboardBackend> Dashboard<B> {
  pub fn new(backend: B, policy: SameKeyPolicy) -> Self {
    let work_order_store = QueryStore::new();
    let fetch_backend = backend.clone();
    work_order_store.register(&work_orders_key(), move || fetch_backend.fresh_work_orders());

    let part_store = QueryStore::new();
    let fetch_backend = backend.clone();
    part_store.register(&parts_key(), move || fetch_backend.fresh_parts());

    Self {
      work_orders: Reconciler::new(work_order_store, backend.clone(), policy),
      parts: Reconciler::new(part_store, backend.clone(), policy),
      backend,
    }
  }

  /// Fill both collections, cache-first.
  pub async fn load(&self) -> Result<LoadReport> {
    let (orders, parts) = futures::try_join!(
      self.backend.cached_work_orders(),
      self.backend.cached_parts()
    )?;

    self.work_orders.publish(&work_orders_key(), orders.data);
    self.parts.publish(&parts_key(), parts.data);
    debug!(
      work_orders = ?orders.source,
      parts = ?parts.source,
      "dashboard loaded"
    );

    Ok(LoadReport {
      work_orders: orders.source,
      parts: parts.source,
    })
  }

  /// Replace both collections with the server's copy.
  pub async fn refresh(&self) -> Result<()> {
    let (orders, parts) = (work_orders_key(), parts_key());
    futures::try_join!(
      self.work_orders.refetch(&orders),
      self.parts.refetch(&parts)
    )?;
    Ok(())
  }

  pub fn work_orders(&self) -> Arc<Vec<WorkOrder>> {
    self
      .work_orders
      .read(&work_orders_key())
      .unwrap_or_default()
  }

  pub fn work_order(&self, id: u64) -> Option<WorkOrder> {
    self.work_orders().iter().find(|order| order.id == id).cloned()
  }

  pub fn parts(&self) -> Arc<Vec<Part>> {
    self.parts.read(&parts_key()).unwrap_or_default()
  }

  pub fn part(&self, id: u64) -> Option<Part> {
    self.parts().iter().find(|part| part.id == id).cloned()
  }

  pub async fn set_status(&self, work_order_id: u64, status: WorkOrderStatus) -> MutationOutcome {
    let stamp = now();
    self
      .work_orders
      .mutate(
        &work_orders_key(),
        move |orders| with_status(orders, work_order_id, status, &stamp),
        RemoteOperation::UpdateStatus {
          work_order_id,
          status,
        },
      )
      .await
  }

  pub async fn start(&self, work_order_id: u64) -> MutationOutcome {
    self
      .set_status(work_order_id, WorkOrderStatus::InProgress)
      .await
  }

  pub async fn complete(&self, work_order_id: u64) -> MutationOutcome {
    self
      .set_status(work_order_id, WorkOrderStatus::Completed)
      .await
  }

  pub async fn log_time(&self, work_order_id: u64, entry: TimeEntry) -> MutationOutcome {
    let stamp = now();
    let minutes = entry.minutes;
    self
      .work_orders
      .mutate(
        &work_orders_key(),
        move |orders| with_time_logged(orders, work_order_id, minutes, &stamp),
        RemoteOperation::LogTime {
          work_order_id,
          entry,
        },
      )
      .await
  }

  /// Assign the work order to `technician_id`.
  pub async fn claim(&self, work_order_id: u64, technician_id: u64) -> MutationOutcome {
    let stamp = now();
    self
      .work_orders
      .mutate(
        &work_orders_key(),
        move |orders| with_assignee(orders, work_order_id, technician_id, &stamp),
        RemoteOperation::Assign {
          work_order_id,
          technician_id,
        },
      )
      .await
  }

  pub async fn checkout_part(&self, part_id: u64, checkout: Checkout) -> MutationOutcome {
    let stamp = now();
    let quantity = checkout.quantity;
    self
      .parts
      .mutate(
        &parts_key(),
        move |parts| with_checkout(parts, part_id, quantity, &stamp),
        RemoteOperation::CheckoutPart { part_id, checkout },
      )
      .await
  }

  /// Drop every in-memory and persisted collection.
  pub fn logout(&self) -> Result<()> {
    self.work_orders.clear();
    self.parts.clear();
    self.backend.clear_cache()?;
    info!("logged out; caches cleared");
    Ok(())
  }
}

fn work_orders_key() -> CacheKey {
  ApiQueryKey::AllWorkOrders.store_key()
}

fn parts_key() -> CacheKey {
  ApiQueryKey::Parts.store_key()
}

fn now() -> String {
  Utc::now().to_rfc3339()
}

// ============================================================================
// Optimistic patches
// ============================================================================

fn patch_work_order<F>(orders: &[WorkOrder], id: u64, stamp: &str, patch: F) -> Vec<WorkOrder>
where
  F: Fn(&mut WorkOrder),
{
  orders
    .iter()
    .map(|order| {
      let mut order = order.clone();
      if order.id == id {
        patch(&mut order);
        order.updated_at = stamp.to_string();
      }
      order
    })
    .collect()
}

pub fn with_status(
  orders: &[WorkOrder],
  id: u64,
  status: WorkOrderStatus,
  stamp: &str,
) -> Vec<WorkOrder> {
  patch_work_order(orders, id, stamp, |order| order.status = status)
}

pub fn with_time_logged(orders: &[WorkOrder], id: u64, minutes: u32, stamp: &str) -> Vec<WorkOrder> {
  patch_work_order(orders, id, stamp, |order| {
    order.time_spent_minutes = order.time_spent_minutes.saturating_add(minutes)
  })
}

/// The assignee's display name is unknown until the server answers.
pub fn with_assignee(
  orders: &[WorkOrder],
  id: u64,
  technician_id: u64,
  stamp: &str,
) -> Vec<WorkOrder> {
  patch_work_order(orders, id, stamp, |order| {
    if order.assigned_to != Some(technician_id) {
      order.assignee_name = None;
    }
    order.assigned_to = Some(technician_id);
  })
}

pub fn with_checkout(parts: &[Part], id: u64, quantity: u32, stamp: &str) -> Vec<Part> {
  parts
    .iter()
    .map(|part| {
      let mut part = part.clone();
      if part.id == id {
        part.quantity_on_hand = part.quantity_on_hand.saturating_sub(quantity);
        part.updated_at = stamp.to_string();
      }
      part
    })
    .collect()
}
