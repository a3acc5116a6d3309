//! Serde types matching the CMMS REST API.
//!
//! These types are separate from domain types to allow clean deserialization
//! while keeping domain types focused on application needs.

use serde::{Deserialize, Serialize};

use super::types::{Checkout, Part, Priority, TimeEntry, WorkOrder, WorkOrderStatus};

// ============================================================================
// Common nested field types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiTechnician {
  pub id: u64,
  #[serde(default)]
  pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApiAsset {
  pub name: String,
}

// ============================================================================
// Work orders
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiWorkOrder {
  pub id: u64,
  #[serde(default)]
  pub title: String,
  pub status: WorkOrderStatus,
  pub priority: Option<Priority>,
  pub asset: Option<ApiAsset>,
  pub assigned_to: Option<ApiTechnician>,
  #[serde(default)]
  pub time_spent_minutes: u32,
  #[serde(default)]
  pub updated_at: String,
}

impl From<ApiWorkOrder> for WorkOrder {
  fn from(api: ApiWorkOrder) -> Self {
    let (assigned_to, assignee_name) = match api.assigned_to {
      Some(tech) => (Some(tech.id), tech.name),
      None => (None, None),
    };
    WorkOrder {
      id: api.id,
      title: api.title,
      status: api.status,
      priority: api.priority,
      asset: api.asset.map(|a| a.name),
      assigned_to,
      assignee_name,
      time_spent_minutes: api.time_spent_minutes,
      updated_at: api.updated_at,
    }
  }
}

// ============================================================================
// Parts
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiPart {
  pub id: u64,
  pub name: String,
  pub part_number: Option<String>,
  #[serde(default)]
  pub quantity: u32,
  #[serde(default)]
  pub updated_at: String,
}

impl From<ApiPart> for Part {
  fn from(api: ApiPart) -> Self {
    Part {
      id: api.id,
      name: api.name,
      part_number: api.part_number,
      quantity_on_hand: api.quantity,
      updated_at: api.updated_at,
    }
  }
}

// ============================================================================
// Request bodies
// ============================================================================

#[derive(Debug, Serialize)]
pub struct StatusRequest {
  pub status: WorkOrderStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeEntryRequest<'a> {
  pub minutes: u32,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub note: Option<&'a str>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub technician_id: Option<u64>,
}

impl<'a> From<&'a TimeEntry> for TimeEntryRequest<'a> {
  fn from(entry: &'a TimeEntry) -> Self {
    Self {
      minutes: entry.minutes,
      note: entry.note.as_deref(),
      technician_id: entry.technician_id,
    }
  }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignRequest {
  pub technician_id: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
  pub quantity: u32,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub work_order_id: Option<u64>,
}

impl From<&Checkout> for CheckoutRequest {
  fn from(checkout: &Checkout) -> Self {
    Self {
      quantity: checkout.quantity,
      work_order_id: checkout.work_order_id,
    }
  }
}
