//! Task and derivative persistence.
//!
//! [`TaskStore`] is the only shared mutable state in the service. Backends
//! that can commit several records together hand out an [`AtomicScope`];
//! the rest answer [`TaskStore::begin`] with
//! [`StoreError::TransactionUnsupported`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{Derivative, Task, TaskStatus};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
  #[error("transaction unsupported: {0}")]
  TransactionUnsupported(String),

  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  #[error("task {0} does not exist")]
  MissingTask(Uuid),

  #[error("task {0} was already completed by another run")]
  Superseded(Uuid),

  #[error("corrupt record: {0}")]
  Corrupt(String),

  #[error("{0}")]
  Backend(String),
}

/// Destination for derivative records as they are produced.
#[async_trait]
pub trait DerivativeSink: Send {
  async fn persist(&mut self, derivative: &Derivative) -> Result<(), StoreError>;
}

/// Writes staged inside a multi-record transaction. Nothing is visible to
/// other readers until [`AtomicScope::commit`] succeeds.
#[async_trait]
pub trait AtomicScope: DerivativeSink {
  /// Same contract as [`TaskStore::mark_completed`], applied on commit.
  async fn mark_completed(&mut self, task_id: Uuid, derivative_ids: &[Uuid]) -> Result<(), StoreError>;

  async fn commit(self: Box<Self>) -> Result<(), StoreError>;

  async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait TaskStore: Send + Sync {
  async fn insert_task(&self, task: &Task) -> Result<(), StoreError>;

  async fn find_task(&self, task_id: Uuid) -> Result<Option<Task>, StoreError>;

  /// Sets `status` and bumps `updated_at`; every other field is untouched.
  async fn update_status(&self, task_id: Uuid, status: TaskStatus) -> Result<(), StoreError>;

  /// Moves the task to completed with the given derivatives, clears any error
  /// and deletes every other derivative record of the task, all in one write.
  ///
  /// Fails with [`StoreError::Superseded`] and changes nothing when the task is
  /// already completed, so of two overlapping runs only the first to finish wins.
  async fn mark_completed(&self, task_id: Uuid, derivative_ids: &[Uuid]) -> Result<(), StoreError>;

  /// Records a failure. A task that is already completed is left alone.
  async fn mark_failed(&self, task_id: Uuid, error_detail: &str) -> Result<(), StoreError>;

  /// Tasks in `status`, least recently updated first.
  async fn list_by_status(&self, status: TaskStatus, limit: usize) -> Result<Vec<Task>, StoreError>;

  /// Tasks in `status` whose `updated_at` is strictly before `updated_before`.
  async fn list_stale(
    &self,
    status: TaskStatus,
    updated_before: DateTime<Utc>,
    limit: usize,
  ) -> Result<Vec<Task>, StoreError>;

  async fn count_by_status(&self) -> Result<Vec<(TaskStatus, u64)>, StoreError>;

  async fn insert_derivative(&self, derivative: &Derivative) -> Result<(), StoreError>;

  async fn list_derivatives(&self, task_id: Uuid) -> Result<Vec<Derivative>, StoreError>;

  async fn delete_derivatives(&self, derivative_ids: &[Uuid]) -> Result<u64, StoreError>;

  /// Whether this backend can open a multi-record transaction at all.
  async fn supports_atomic_commit(&self) -> Result<bool, StoreError>;

  async fn begin(&self) -> Result<Box<dyn AtomicScope + '_>, StoreError>;
}

/// Sink that writes straight to the store and remembers what it wrote so the
/// records can be removed again if the surrounding run fails.
pub struct RecordingSink<'a> {
  store: &'a dyn TaskStore,
  created: Vec<Uuid>,
}

impl<'a> RecordingSink<'a> {
  pub fn new(store: &'a dyn TaskStore) -> Self {
    Self {
      store,
      created: Vec::new(),
    }
  }

  pub fn created(&self) -> &[Uuid] {
    &self.created
  }
}

#[async_trait]
impl DerivativeSink for RecordingSink<'_> {
  async fn persist(&mut self, derivative: &Derivative) -> Result<(), StoreError> {
    self.store.insert_derivative(derivative).await?;
    self.created.push(derivative.id);
    Ok(())
  }
}
