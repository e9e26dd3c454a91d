use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
  Pending,
  Processing,
  Completed,
  Failed,
}

impl TaskStatus {
  pub const ALL: [TaskStatus; 4] = [
    TaskStatus::Pending,
    TaskStatus::Processing,
    TaskStatus::Completed,
    TaskStatus::Failed,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      TaskStatus::Pending => "pending",
      TaskStatus::Processing => "processing",
      TaskStatus::Completed => "completed",
      TaskStatus::Failed => "failed",
    }
  }

  pub fn is_terminal(&self) -> bool {
    matches!(self, TaskStatus::Completed | TaskStatus::Failed)
  }
}

impl fmt::Display for TaskStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for TaskStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "pending" => Ok(TaskStatus::Pending),
      "processing" => Ok(TaskStatus::Processing),
      "completed" => Ok(TaskStatus::Completed),
      "failed" => Ok(TaskStatus::Failed),
      other => Err(format!("unknown task status '{}'", other)),
    }
  }
}

/// Task fee in whole cents, always within `MIN_CENTS..=MAX_CENTS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Price(u32);

impl Price {
  pub const MIN_CENTS: u32 = 500;
  pub const MAX_CENTS: u32 = 5000;

  pub fn random() -> Self {
    Self(rand::rng().random_range(Self::MIN_CENTS..=Self::MAX_CENTS))
  }

  pub fn from_cents(cents: u32) -> Option<Self> {
    (Self::MIN_CENTS..=Self::MAX_CENTS).contains(&cents).then_some(Self(cents))
  }

  pub fn cents(&self) -> u32 {
    self.0
  }

  pub fn as_decimal(&self) -> f64 {
    f64::from(self.0) / 100.0
  }
}

impl Serialize for Price {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(self.as_decimal())
  }
}

/// Target widths every task is rendered at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
  #[serde(rename = "1024")]
  W1024,
  #[serde(rename = "800")]
  W800,
}

impl Resolution {
  pub const ALL: [Resolution; 2] = [Resolution::W1024, Resolution::W800];

  pub fn width(&self) -> u32 {
    match self {
      Resolution::W1024 => 1024,
      Resolution::W800 => 800,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Resolution::W1024 => "1024",
      Resolution::W800 => "800",
    }
  }

  pub fn from_width(width: u32) -> Option<Self> {
    Self::ALL.into_iter().find(|r| r.width() == width)
  }
}

impl fmt::Display for Resolution {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct Task {
  pub id: Uuid,
  pub status: TaskStatus,
  pub price: Price,
  pub source_reference: String,
  pub derivative_ids: Vec<Uuid>,
  pub error_detail: Option<String>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl Task {
  pub fn new(source_reference: impl Into<String>) -> Self {
    let now = Utc::now();
    Self {
      id: Uuid::new_v4(),
      status: TaskStatus::Pending,
      price: Price::random(),
      source_reference: source_reference.into(),
      derivative_ids: Vec::new(),
      error_detail: None,
      created_at: now,
      updated_at: now,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Derivative {
  pub id: Uuid,
  pub task_id: Uuid,
  pub resolution: Resolution,
  pub width: u32,
  pub height: u32,
  pub content_hash: String,
  pub storage_path: String,
  pub created_at: DateTime<Utc>,
}

/// A task as reported to callers; derivatives only once it has completed.
#[derive(Debug, Clone)]
pub struct TaskView {
  pub task: Task,
  pub derivatives: Option<Vec<Derivative>>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn random_price_stays_in_range() {
    for _ in 0..1000 {
      let price = Price::random();
      assert!(price.as_decimal() >= 5.0 && price.as_decimal() <= 50.0);
    }
  }

  #[test]
  fn price_rejects_out_of_range_cents() {
    assert!(Price::from_cents(499).is_none());
    assert!(Price::from_cents(5001).is_none());
    assert_eq!(Price::from_cents(1234).map(|p| p.as_decimal()), Some(12.34));
  }

  #[test]
  fn status_round_trips_through_text() {
    for status in TaskStatus::ALL {
      assert_eq!(status.as_str().parse::<TaskStatus>(), Ok(status));
    }
    assert!("stuck".parse::<TaskStatus>().is_err());
  }

  #[test]
  fn new_task_starts_pending_without_derivatives() {
    let task = Task::new("input/cat.png");
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.derivative_ids.is_empty());
    assert!(task.error_detail.is_none());
  }
}
