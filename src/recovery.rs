//! Repairs tasks orphaned by a crash and optionally redrives the pending backlog.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::lifecycle::TaskEngine;
use crate::models::TaskStatus;

pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(300);
pub const DEFAULT_BATCH_LIMIT: usize = 10;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
  pub found: usize,
  pub succeeded: usize,
  pub failed: usize,
}

pub struct RecoverySweep {
  engine: Arc<TaskEngine>,
  stale_after: Duration,
  batch_limit: usize,
}

impl RecoverySweep {
  pub fn new(engine: Arc<TaskEngine>) -> Self {
    Self {
      engine,
      stale_after: DEFAULT_STALE_AFTER,
      batch_limit: DEFAULT_BATCH_LIMIT,
    }
  }

  pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
    self.stale_after = stale_after;
    self
  }

  pub fn with_batch_limit(mut self, batch_limit: usize) -> Self {
    self.batch_limit = batch_limit;
    self
  }

  /// Resets "processing" tasks not touched within the staleness threshold
  /// back to "pending". Only status and `updated_at` change.
  pub async fn recover_stuck(&self) -> Result<SweepReport> {
    let stale_after = chrono::Duration::from_std(self.stale_after).unwrap_or(chrono::Duration::MAX);
    let cutoff = Utc::now().checked_sub_signed(stale_after).unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
    let store = self.engine.store();
    let stuck = store.list_stale(TaskStatus::Processing, cutoff, self.batch_limit).await?;

    let mut report = SweepReport {
      found: stuck.len(),
      ..Default::default()
    };
    if stuck.is_empty() {
      return Ok(report);
    }
    info!("Found {} stuck tasks, resetting to pending", stuck.len());

    for task in stuck {
      match store.update_status(task.id, TaskStatus::Pending).await {
        Ok(()) => {
          info!("Reset task {} to pending (last update {})", task.id, task.updated_at);
          report.succeeded += 1;
        }
        Err(e) => {
          error!("Failed to reset stuck task {}: {}", task.id, e);
          report.failed += 1;
        }
      }
    }
    Ok(report)
  }

  /// Processes up to `batch_limit` pending tasks one at a time.
  pub async fn redrive_pending(&self) -> Result<SweepReport> {
    let pending = self
      .engine
      .store()
      .list_by_status(TaskStatus::Pending, self.batch_limit)
      .await?;

    let mut report = SweepReport {
      found: pending.len(),
      ..Default::default()
    };
    if pending.is_empty() {
      info!("No pending tasks found");
      return Ok(report);
    }
    info!("Found {} pending tasks, processing sequentially", pending.len());

    for task in pending {
      match self.engine.process_task(task.id).await {
        Ok(()) => report.succeeded += 1,
        Err(e) => {
          warn!("Redrive of task {} failed: {}", task.id, e);
          report.failed += 1;
        }
      }
    }
    info!(
      "Finished redriving {} pending tasks ({} completed, {} failed)",
      report.found, report.succeeded, report.failed
    );
    Ok(report)
  }

  /// Runs [`RecoverySweep::recover_stuck`] every `interval` until the handle is aborted.
  pub fn spawn_periodic(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      ticker.tick().await;
      loop {
        ticker.tick().await;
        if let Err(e) = self.recover_stuck().await {
          error!("Periodic recovery sweep failed: {}", e);
        }
      }
    })
  }
}
