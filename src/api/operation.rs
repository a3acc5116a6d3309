//! Descriptions of state-changing calls against the backend.

use reqwest::Method;
use serde_json::Value;
use std::fmt;

use super::api_types::{AssignRequest, CheckoutRequest, StatusRequest, TimeEntryRequest};
use super::cache::ApiQueryKey;
use super::types::{Checkout, TimeEntry, WorkOrderStatus};

/// A remote side-effecting call: endpoint plus payload.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOperation {
  UpdateStatus {
    work_order_id: u64,
    status: WorkOrderStatus,
  },
  LogTime {
    work_order_id: u64,
    entry: TimeEntry,
  },
  Assign {
    work_order_id: u64,
    technician_id: u64,
  },
  CheckoutPart {
    part_id: u64,
    checkout: Checkout,
  },
}

impl RemoteOperation {
  pub fn method(&self) -> Method {
    match self {
      RemoteOperation::UpdateStatus { .. } => Method::PATCH,
      RemoteOperation::LogTime { .. }
      | RemoteOperation::Assign { .. }
      | RemoteOperation::CheckoutPart { .. } => Method::POST,
    }
  }

  /// Path relative to the API base url
  pub fn path(&self) -> String {
    match self {
      RemoteOperation::UpdateStatus { work_order_id, .. } => {
        format!("work-orders/{}/status", work_order_id)
      }
      RemoteOperation::LogTime { work_order_id, .. } => {
        format!("work-orders/{}/time-entries", work_order_id)
      }
      RemoteOperation::Assign { work_order_id, .. } => {
        format!("work-orders/{}/assign", work_order_id)
      }
      RemoteOperation::CheckoutPart { part_id, .. } => format!("parts/{}/checkout", part_id),
    }
  }

  pub fn body(&self) -> serde_json::Result<Value> {
    match self {
      RemoteOperation::UpdateStatus { status, .. } => {
        serde_json::to_value(StatusRequest { status: *status })
      }
      RemoteOperation::LogTime { entry, .. } => serde_json::to_value(TimeEntryRequest::from(entry)),
      RemoteOperation::Assign { technician_id, .. } => serde_json::to_value(AssignRequest {
        technician_id: *technician_id,
      }),
      RemoteOperation::CheckoutPart { checkout, .. } => {
        serde_json::to_value(CheckoutRequest::from(checkout))
      }
    }
  }

  /// The collection whose persisted copy this call makes stale.
  pub fn affected_query(&self) -> ApiQueryKey {
    match self {
      RemoteOperation::CheckoutPart { .. } => ApiQueryKey::Parts,
      _ => ApiQueryKey::AllWorkOrders,
    }
  }
}

impl fmt::Display for RemoteOperation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} /{}", self.method(), self.path())
  }
}
