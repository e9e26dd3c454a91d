#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use image::{Rgb, RgbImage};
use uuid::Uuid;

use imgq::consistency::{AtomicCapability, ConsistencyCoordinator};
use imgq::derivatives::DerivativeGenerator;
use imgq::fetch::SourceFetcher;
use imgq::lifecycle::TaskEngine;
use imgq::models::{Derivative, Task, TaskStatus};
use imgq::store::{AtomicScope, DerivativeSink, MemoryStore, StoreError, TaskStore};

/// Wraps a [`MemoryStore`] and fails selected operations on demand.
///
/// `fail_completion` applies to both the plain and the scoped completion write.
pub struct FaultyStore {
  pub inner: MemoryStore,
  pub fail_completion: AtomicBool,
  pub fail_probe: AtomicBool,
  pub reject_begin: AtomicBool,
  pub reject_commit: AtomicBool,
  pub fail_insert_after: AtomicUsize,
  pub begin_calls: AtomicUsize,
  pub scope_persisted: AtomicUsize,
}

impl FaultyStore {
  pub fn wrap(inner: MemoryStore) -> Self {
    Self {
      inner,
      fail_completion: AtomicBool::new(false),
      fail_probe: AtomicBool::new(false),
      reject_begin: AtomicBool::new(false),
      reject_commit: AtomicBool::new(false),
      fail_insert_after: AtomicUsize::new(usize::MAX),
      begin_calls: AtomicUsize::new(0),
      scope_persisted: AtomicUsize::new(0),
    }
  }

  fn completion_fault(&self) -> Result<(), StoreError> {
    if self.fail_completion.load(Ordering::SeqCst) {
      return Err(StoreError::Backend("injected completion failure".into()));
    }
    Ok(())
  }
}

#[async_trait]
impl TaskStore for FaultyStore {
  async fn insert_task(&self, task: &Task) -> Result<(), StoreError> {
    self.inner.insert_task(task).await
  }

  async fn find_task(&self, task_id: Uuid) -> Result<Option<Task>, StoreError> {
    self.inner.find_task(task_id).await
  }

  async fn update_status(&self, task_id: Uuid, status: TaskStatus) -> Result<(), StoreError> {
    self.inner.update_status(task_id, status).await
  }

  async fn mark_completed(&self, task_id: Uuid, derivative_ids: &[Uuid]) -> Result<(), StoreError> {
    self.completion_fault()?;
    self.inner.mark_completed(task_id, derivative_ids).await
  }

  async fn mark_failed(&self, task_id: Uuid, error_detail: &str) -> Result<(), StoreError> {
    self.inner.mark_failed(task_id, error_detail).await
  }

  async fn list_by_status(&self, status: TaskStatus, limit: usize) -> Result<Vec<Task>, StoreError> {
    self.inner.list_by_status(status, limit).await
  }

  async fn list_stale(
    &self,
    status: TaskStatus,
    updated_before: DateTime<Utc>,
    limit: usize,
  ) -> Result<Vec<Task>, StoreError> {
    self.inner.list_stale(status, updated_before, limit).await
  }

  async fn count_by_status(&self) -> Result<Vec<(TaskStatus, u64)>, StoreError> {
    self.inner.count_by_status().await
  }

  async fn insert_derivative(&self, derivative: &Derivative) -> Result<(), StoreError> {
    let remaining = self.fail_insert_after.load(Ordering::SeqCst);
    if remaining == 0 {
      return Err(StoreError::Backend("injected derivative insert failure".into()));
    }
    if remaining != usize::MAX {
      self.fail_insert_after.store(remaining - 1, Ordering::SeqCst);
    }
    self.inner.insert_derivative(derivative).await
  }

  async fn list_derivatives(&self, task_id: Uuid) -> Result<Vec<Derivative>, StoreError> {
    self.inner.list_derivatives(task_id).await
  }

  async fn delete_derivatives(&self, derivative_ids: &[Uuid]) -> Result<u64, StoreError> {
    self.inner.delete_derivatives(derivative_ids).await
  }

  async fn supports_atomic_commit(&self) -> Result<bool, StoreError> {
    if self.fail_probe.load(Ordering::SeqCst) {
      return Err(StoreError::Backend("injected probe failure".into()));
    }
    if self.reject_begin.load(Ordering::SeqCst) {
      // Claims support but refuses at runtime, like a standalone deployment.
      return Ok(true);
    }
    self.inner.supports_atomic_commit().await
  }

  async fn begin(&self) -> Result<Box<dyn AtomicScope + '_>, StoreError> {
    self.begin_calls.fetch_add(1, Ordering::SeqCst);
    if self.reject_begin.load(Ordering::SeqCst) {
      return Err(StoreError::TransactionUnsupported("not a replica set".into()));
    }
    let inner = self.inner.begin().await?;
    Ok(Box::new(FaultyScope { inner, faults: self }))
  }
}

pub struct FaultyScope<'a> {
  inner: Box<dyn AtomicScope + 'a>,
  faults: &'a FaultyStore,
}

#[async_trait]
impl DerivativeSink for FaultyScope<'_> {
  async fn persist(&mut self, derivative: &Derivative) -> Result<(), StoreError> {
    self.inner.persist(derivative).await?;
    self.faults.scope_persisted.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }
}

#[async_trait]
impl AtomicScope for FaultyScope<'_> {
  async fn mark_completed(&mut self, task_id: Uuid, derivative_ids: &[Uuid]) -> Result<(), StoreError> {
    self.faults.completion_fault()?;
    self.inner.mark_completed(task_id, derivative_ids).await
  }

  async fn commit(self: Box<Self>) -> Result<(), StoreError> {
    let FaultyScope { inner, faults } = *self;
    if faults.reject_commit.load(Ordering::SeqCst) {
      inner.rollback().await?;
      return Err(StoreError::TransactionUnsupported("commit refused by a standalone server".into()));
    }
    inner.commit().await
  }

  async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
    self.inner.rollback().await
  }
}

pub struct Harness {
  pub root: PathBuf,
  pub store: Arc<dyn TaskStore>,
  pub engine: Arc<TaskEngine>,
}

impl Harness {
  pub fn new(store: Arc<dyn TaskStore>) -> Self {
    Self::with_capability(store, AtomicCapability::new())
  }

  pub fn with_capability(store: Arc<dyn TaskStore>, capability: AtomicCapability) -> Self {
    Self::build(store, capability, Duration::from_secs(5))
  }

  pub fn with_download_timeout(store: Arc<dyn TaskStore>, timeout: Duration) -> Self {
    Self::build(store, AtomicCapability::new(), timeout)
  }

  fn build(store: Arc<dyn TaskStore>, capability: AtomicCapability, download_timeout: Duration) -> Self {
    let root = std::env::temp_dir().join(format!("imgq-it-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&root).expect("create scratch dir");
    let fetcher = SourceFetcher::new(root.join("temp"), download_timeout);
    let generator = DerivativeGenerator::new(fetcher, root.join("output"));
    let coordinator = ConsistencyCoordinator::new(Arc::clone(&store), generator, Arc::new(capability));
    let engine = Arc::new(TaskEngine::new(Arc::clone(&store), coordinator));
    Self { root, store, engine }
  }

  pub fn fixture(&self, name: &str, width: u32, height: u32) -> PathBuf {
    write_fixture(&self.root.join("input"), name, width, height)
  }

  /// Number of files left in the download scratch directory.
  pub fn temp_files(&self) -> usize {
    std::fs::read_dir(self.root.join("temp")).map(|entries| entries.count()).unwrap_or(0)
  }

  pub fn path_str(path: &Path) -> &str {
    path.to_str().expect("utf-8 path")
  }
}

impl Drop for Harness {
  fn drop(&mut self) {
    let _ = std::fs::remove_dir_all(&self.root);
  }
}

pub fn write_fixture(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
  std::fs::create_dir_all(dir).expect("create fixture dir");
  let path = dir.join(name);
  RgbImage::from_fn(width, height, |x, y| Rgb([(x % 251) as u8, (y % 241) as u8, ((x + y) % 239) as u8]))
    .save(&path)
    .expect("write fixture image");
  path
}
