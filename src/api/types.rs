use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Work order lifecycle status.
///
/// The client does not enforce transitions; the backend owns those rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkOrderStatus {
  Pending,
  InProgress,
  OnHold,
  Completed,
}

impl WorkOrderStatus {
  pub const ALL: [WorkOrderStatus; 4] = [
    WorkOrderStatus::Pending,
    WorkOrderStatus::InProgress,
    WorkOrderStatus::OnHold,
    WorkOrderStatus::Completed,
  ];

  /// Wire name, e.g. `IN_PROGRESS`
  pub fn as_str(&self) -> &'static str {
    match self {
      WorkOrderStatus::Pending => "PENDING",
      WorkOrderStatus::InProgress => "IN_PROGRESS",
      WorkOrderStatus::OnHold => "ON_HOLD",
      WorkOrderStatus::Completed => "COMPLETED",
    }
  }
}

impl fmt::Display for WorkOrderStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for WorkOrderStatus {
  type Err = String;

  /// Accepts wire names and their lowercase/kebab forms (`in-progress`).
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let normalized = s.trim().to_uppercase().replace('-', "_");
    WorkOrderStatus::ALL
      .into_iter()
      .find(|status| status.as_str() == normalized)
      .ok_or_else(|| format!("unknown work order status '{}'", s))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
  Low,
  Medium,
  High,
  Critical,
}

/// Work order as shown in lists and dashboards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkOrder {
  pub id: u64,
  pub title: String,
  pub status: WorkOrderStatus,
  pub priority: Option<Priority>,
  pub asset: Option<String>,
  pub assigned_to: Option<u64>,
  pub assignee_name: Option<String>,
  pub time_spent_minutes: u32,
  pub updated_at: String,
}

/// Inventory part
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
  pub id: u64,
  pub name: String,
  pub part_number: Option<String>,
  pub quantity_on_hand: u32,
  pub updated_at: String,
}

/// Time logged against a work order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeEntry {
  pub minutes: u32,
  pub note: Option<String>,
  pub technician_id: Option<u64>,
}

/// Parts taken out of inventory for a work order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkout {
  pub quantity: u32,
  pub work_order_id: Option<u64>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_status_parse_accepts_cli_forms() {
    assert_eq!(
      "in-progress".parse::<WorkOrderStatus>(),
      Ok(WorkOrderStatus::InProgress)
    );
    assert_eq!(
      "ON_HOLD".parse::<WorkOrderStatus>(),
      Ok(WorkOrderStatus::OnHold)
    );
    assert!("done".parse::<WorkOrderStatus>().is_err());
  }

  #[test]
  fn test_status_wire_format() {
    let json = serde_json::to_string(&WorkOrderStatus::InProgress).unwrap();
    assert_eq!(json, "\"IN_PROGRESS\"");
  }
}
