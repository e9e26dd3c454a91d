use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{AtomicScope, DerivativeSink, StoreError, TaskStore};
use crate::models::{Derivative, Task, TaskStatus};

#[derive(Default)]
struct Tables {
  tasks: HashMap<Uuid, Task>,
  derivatives: Vec<Derivative>,
}

impl Tables {
  fn completable(&self, task_id: Uuid) -> Result<(), StoreError> {
    match self.tasks.get(&task_id) {
      None => Err(StoreError::MissingTask(task_id)),
      Some(task) if task.status == TaskStatus::Completed => Err(StoreError::Superseded(task_id)),
      Some(_) => Ok(()),
    }
  }

  fn complete(&mut self, task_id: Uuid, derivative_ids: &[Uuid]) -> Result<(), StoreError> {
    self.completable(task_id)?;
    self
      .derivatives
      .retain(|d| d.task_id != task_id || derivative_ids.contains(&d.id));
    if let Some(task) = self.tasks.get_mut(&task_id) {
      task.status = TaskStatus::Completed;
      task.derivative_ids = derivative_ids.to_vec();
      task.error_detail = None;
      task.updated_at = Utc::now();
    }
    Ok(())
  }

  fn sorted_matching(&self, limit: usize, keep: impl Fn(&Task) -> bool) -> Vec<Task> {
    let mut matching: Vec<Task> = self.tasks.values().filter(|t| keep(t)).cloned().collect();
    matching.sort_by_key(|t| (t.updated_at, t.created_at));
    matching.truncate(limit);
    matching
  }
}

/// In-process store. Non-transactional by default; [`MemoryStore::transactional`]
/// stages scope writes and applies them under a single lock on commit.
#[derive(Default)]
pub struct MemoryStore {
  tables: Mutex<Tables>,
  transactional: bool,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn transactional() -> Self {
    Self {
      tables: Mutex::default(),
      transactional: true,
    }
  }

  /// Overwrites a task's `updated_at`, for aging records in recovery scenarios.
  pub async fn set_updated_at(&self, task_id: Uuid, updated_at: DateTime<Utc>) {
    if let Some(task) = self.tables.lock().await.tasks.get_mut(&task_id) {
      task.updated_at = updated_at;
    }
  }

  pub async fn derivative_count(&self) -> usize {
    self.tables.lock().await.derivatives.len()
  }
}

#[async_trait]
impl TaskStore for MemoryStore {
  async fn insert_task(&self, task: &Task) -> Result<(), StoreError> {
    let mut tables = self.tables.lock().await;
    if tables.tasks.contains_key(&task.id) {
      return Err(StoreError::Backend(format!("task {} already exists", task.id)));
    }
    tables.tasks.insert(task.id, task.clone());
    Ok(())
  }

  async fn find_task(&self, task_id: Uuid) -> Result<Option<Task>, StoreError> {
    Ok(self.tables.lock().await.tasks.get(&task_id).cloned())
  }

  async fn update_status(&self, task_id: Uuid, status: TaskStatus) -> Result<(), StoreError> {
    if let Some(task) = self.tables.lock().await.tasks.get_mut(&task_id) {
      task.status = status;
      task.updated_at = Utc::now();
    }
    Ok(())
  }

  async fn mark_completed(&self, task_id: Uuid, derivative_ids: &[Uuid]) -> Result<(), StoreError> {
    self.tables.lock().await.complete(task_id, derivative_ids)
  }

  async fn mark_failed(&self, task_id: Uuid, error_detail: &str) -> Result<(), StoreError> {
    let mut tables = self.tables.lock().await;
    if let Some(task) = tables.tasks.get_mut(&task_id).filter(|t| t.status != TaskStatus::Completed) {
      task.status = TaskStatus::Failed;
      task.error_detail = Some(error_detail.to_string());
      task.updated_at = Utc::now();
    }
    Ok(())
  }

  async fn list_by_status(&self, status: TaskStatus, limit: usize) -> Result<Vec<Task>, StoreError> {
    Ok(self.tables.lock().await.sorted_matching(limit, |t| t.status == status))
  }

  async fn list_stale(
    &self,
    status: TaskStatus,
    updated_before: DateTime<Utc>,
    limit: usize,
  ) -> Result<Vec<Task>, StoreError> {
    Ok(
      self
        .tables
        .lock()
        .await
        .sorted_matching(limit, |t| t.status == status && t.updated_at < updated_before),
    )
  }

  async fn count_by_status(&self) -> Result<Vec<(TaskStatus, u64)>, StoreError> {
    let tables = self.tables.lock().await;
    Ok(
      TaskStatus::ALL
        .into_iter()
        .map(|status| {
          let count = tables.tasks.values().filter(|t| t.status == status).count() as u64;
          (status, count)
        })
        .collect(),
    )
  }

  async fn insert_derivative(&self, derivative: &Derivative) -> Result<(), StoreError> {
    self.tables.lock().await.derivatives.push(derivative.clone());
    Ok(())
  }

  async fn list_derivatives(&self, task_id: Uuid) -> Result<Vec<Derivative>, StoreError> {
    let tables = self.tables.lock().await;
    Ok(tables.derivatives.iter().filter(|d| d.task_id == task_id).cloned().collect())
  }

  async fn delete_derivatives(&self, derivative_ids: &[Uuid]) -> Result<u64, StoreError> {
    let mut tables = self.tables.lock().await;
    let before = tables.derivatives.len();
    tables.derivatives.retain(|d| !derivative_ids.contains(&d.id));
    Ok((before - tables.derivatives.len()) as u64)
  }

  async fn supports_atomic_commit(&self) -> Result<bool, StoreError> {
    Ok(self.transactional)
  }

  async fn begin(&self) -> Result<Box<dyn AtomicScope + '_>, StoreError> {
    if !self.transactional {
      return Err(StoreError::TransactionUnsupported(
        "in-memory store configured without transactions".into(),
      ));
    }
    Ok(Box::new(MemoryScope {
      store: self,
      staged: Vec::new(),
      completion: None,
    }))
  }
}

struct MemoryScope<'a> {
  store: &'a MemoryStore,
  staged: Vec<Derivative>,
  completion: Option<(Uuid, Vec<Uuid>)>,
}

#[async_trait]
impl DerivativeSink for MemoryScope<'_> {
  async fn persist(&mut self, derivative: &Derivative) -> Result<(), StoreError> {
    self.staged.push(derivative.clone());
    Ok(())
  }
}

#[async_trait]
impl AtomicScope for MemoryScope<'_> {
  async fn mark_completed(&mut self, task_id: Uuid, derivative_ids: &[Uuid]) -> Result<(), StoreError> {
    if !self.store.tables.lock().await.tasks.contains_key(&task_id) {
      return Err(StoreError::MissingTask(task_id));
    }
    self.completion = Some((task_id, derivative_ids.to_vec()));
    Ok(())
  }

  async fn commit(self: Box<Self>) -> Result<(), StoreError> {
    let MemoryScope {
      store,
      staged,
      completion,
    } = *self;
    let mut tables = store.tables.lock().await;
    if let Some((task_id, _)) = &completion {
      tables.completable(*task_id)?;
    }
    tables.derivatives.extend(staged);
    if let Some((task_id, derivative_ids)) = completion {
      tables.complete(task_id, &derivative_ids)?;
    }
    Ok(())
  }

  async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
    Ok(())
  }
}
