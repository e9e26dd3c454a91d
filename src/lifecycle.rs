use std::sync::{Arc, LazyLock};
use std::time::Instant;

use regex::Regex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::consistency::ConsistencyCoordinator;
use crate::error::{Error, Result};
use crate::models::{Task, TaskStatus, TaskView};
use crate::store::TaskStore;

static CONTROL_CHARS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\x00-\x1f\x7f]").expect("valid regex"));

/// Drives tasks through pending -> processing -> completed | failed.
pub struct TaskEngine {
  store: Arc<dyn TaskStore>,
  coordinator: ConsistencyCoordinator,
}

impl TaskEngine {
  pub fn new(store: Arc<dyn TaskStore>, coordinator: ConsistencyCoordinator) -> Self {
    Self { store, coordinator }
  }

  pub fn store(&self) -> &Arc<dyn TaskStore> {
    &self.store
  }

  pub fn coordinator(&self) -> &ConsistencyCoordinator {
    &self.coordinator
  }

  pub async fn create_task(&self, source_reference: &str) -> Result<Task> {
    let source_reference = source_reference.trim();
    if source_reference.is_empty() {
      return Err(Error::InvalidInput("imagePath cannot be empty".into()));
    }
    if CONTROL_CHARS.is_match(source_reference) {
      return Err(Error::InvalidInput("imagePath contains control characters".into()));
    }

    let task = Task::new(source_reference);
    self.store.insert_task(&task).await?;
    info!("Task {} created for {} at {:.2}", task.id, task.source_reference, task.price.as_decimal());
    Ok(task)
  }

  pub async fn get_task(&self, task_id: Uuid) -> Result<Option<TaskView>> {
    let Some(task) = self.store.find_task(task_id).await? else {
      return Ok(None);
    };
    if task.status != TaskStatus::Completed {
      return Ok(Some(TaskView { task, derivatives: None }));
    }

    let mut derivatives = self.store.list_derivatives(task_id).await?;
    derivatives.retain(|d| task.derivative_ids.contains(&d.id));
    derivatives.sort_by_key(|d| task.derivative_ids.iter().position(|id| *id == d.id));
    Ok(Some(TaskView {
      task,
      derivatives: Some(derivatives),
    }))
  }

  /// Runs one processing attempt. The outcome is always written to the task
  /// record; the returned error is for callers that want to observe it. When
  /// an overlapping run of the same task completes first, this run's records
  /// are discarded and the call succeeds.
  pub async fn process_task(&self, task_id: Uuid) -> Result<()> {
    let started = Instant::now();
    info!("Starting processing for task {}", task_id);

    match self.run(task_id).await {
      Ok(()) => {
        info!("Task {} completed successfully in {}ms", task_id, started.elapsed().as_millis());
        Ok(())
      }
      Err(Error::Superseded(_)) => {
        warn!(
          "Task {} was completed by an overlapping run; discarded this run's output after {}ms",
          task_id,
          started.elapsed().as_millis()
        );
        Ok(())
      }
      Err(e) => {
        error!("Task {} failed after {}ms: {}", task_id, started.elapsed().as_millis(), e);
        if let Err(write_err) = self.store.mark_failed(task_id, &e.to_string()).await {
          error!("Could not record failure for task {}: {}", task_id, write_err);
        }
        Err(e)
      }
    }
  }

  async fn run(&self, task_id: Uuid) -> Result<()> {
    self.store.update_status(task_id, TaskStatus::Processing).await?;
    let task = self.store.find_task(task_id).await?.ok_or(Error::TaskNotFound(task_id))?;
    let derivatives = self.coordinator.complete(&task).await?;
    info!("Task {} produced {} derivatives", task_id, derivatives.len());
    Ok(())
  }

  /// Starts processing in the background. Failures only reach the log and
  /// the task record.
  pub fn dispatch(self: &Arc<Self>, task_id: Uuid) -> JoinHandle<()> {
    let engine = Arc::clone(self);
    tokio::spawn(async move {
      if let Err(e) = engine.process_task(task_id).await {
        error!("Background processing of task {} ended in failure: {}", task_id, e);
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::*;
  use crate::consistency::AtomicCapability;
  use crate::derivatives::DerivativeGenerator;
  use crate::fetch::SourceFetcher;
  use crate::store::MemoryStore;

  fn engine(store: Arc<MemoryStore>) -> TaskEngine {
    let root = std::env::temp_dir().join(format!("imgq-lifecycle-{}", Uuid::new_v4()));
    let generator = DerivativeGenerator::new(SourceFetcher::new(root.join("temp"), Duration::from_secs(1)), root.join("output"));
    let store: Arc<dyn TaskStore> = store;
    let coordinator = ConsistencyCoordinator::new(Arc::clone(&store), generator, Arc::new(AtomicCapability::new()));
    TaskEngine::new(store, coordinator)
  }

  #[tokio::test]
  async fn create_rejects_blank_and_control_characters() {
    let engine = engine(Arc::new(MemoryStore::new()));
    assert!(matches!(engine.create_task("   ").await, Err(Error::InvalidInput(_))));
    assert!(matches!(engine.create_task("cat\n.png").await, Err(Error::InvalidInput(_))));
  }

  #[tokio::test]
  async fn created_task_is_pending_with_a_valid_price() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine(Arc::clone(&store));
    let task = engine.create_task("  input/cat.png ").await.unwrap();

    assert_eq!(task.source_reference, "input/cat.png");
    let view = engine.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(view.task.status, TaskStatus::Pending);
    assert!(view.derivatives.is_none());
    assert!((5.0..=50.0).contains(&view.task.price.as_decimal()));
  }

  #[tokio::test]
  async fn unknown_task_fails_with_not_found() {
    let engine = engine(Arc::new(MemoryStore::new()));
    let missing = Uuid::new_v4();
    let err = engine.process_task(missing).await.unwrap_err();
    assert!(matches!(err, Error::TaskNotFound(id) if id == missing));
    assert!(engine.get_task(missing).await.unwrap().is_none());
  }
}
