//! Keeps a task's completion and its derivative records in agreement.
//!
//! Variant files are rendered first. When the store can commit several records
//! at once, the derivative records and the completion update then go through
//! one [`AtomicScope`]. Otherwise they are written one after the other and the
//! derivative records are deleted again if anything after them fails.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::derivatives::DerivativeGenerator;
use crate::error::{Error, Result};
use crate::models::{Derivative, Task};
use crate::store::{AtomicScope, DerivativeSink, RecordingSink, StoreError, TaskStore};

const UNKNOWN: u8 = 0;
const SUPPORTED: u8 = 1;
const UNSUPPORTED: u8 = 2;

/// Memoized answer to "can this store commit atomically?".
///
/// Probed at most once until invalidated. Concurrent writers race harmlessly:
/// the last store wins, and a stale "supported" is corrected by the first
/// runtime rejection.
#[derive(Debug, Default)]
pub struct AtomicCapability {
  state: AtomicU8,
}

impl AtomicCapability {
  pub fn new() -> Self {
    Self::default()
  }

  /// Pre-seeded answer; the store is never probed.
  pub fn fixed(supported: bool) -> Self {
    let capability = Self::new();
    capability.record(supported);
    capability
  }

  pub fn cached(&self) -> Option<bool> {
    match self.state.load(Ordering::Acquire) {
      SUPPORTED => Some(true),
      UNSUPPORTED => Some(false),
      _ => None,
    }
  }

  pub async fn supported(&self, store: &dyn TaskStore) -> bool {
    if let Some(known) = self.cached() {
      return known;
    }
    let supported = match store.supports_atomic_commit().await {
      Ok(supported) => supported,
      Err(e) => {
        warn!("Could not determine atomic commit support, assuming none: {}", e);
        false
      }
    };
    info!("Store atomic commit support: {}", supported);
    self.record(supported);
    supported
  }

  /// Marks atomic commit unavailable for the rest of the process lifetime.
  pub fn invalidate(&self) {
    self.record(false);
  }

  /// Forgets the cached answer so the next call probes again.
  pub fn reset(&self) {
    self.state.store(UNKNOWN, Ordering::Release);
  }

  fn record(&self, supported: bool) {
    let state = if supported { SUPPORTED } else { UNSUPPORTED };
    self.state.store(state, Ordering::Release);
  }
}

pub struct ConsistencyCoordinator {
  store: Arc<dyn TaskStore>,
  generator: DerivativeGenerator,
  capability: Arc<AtomicCapability>,
}

impl ConsistencyCoordinator {
  pub fn new(store: Arc<dyn TaskStore>, generator: DerivativeGenerator, capability: Arc<AtomicCapability>) -> Self {
    Self {
      store,
      generator,
      capability,
    }
  }

  pub fn capability(&self) -> &AtomicCapability {
    &self.capability
  }

  /// Generates the task's derivatives and marks it completed with them,
  /// so that either both are visible or neither is.
  ///
  /// Files are rendered before any store write, so a transaction is only held
  /// for the record writes themselves.
  pub async fn complete(&self, task: &Task) -> Result<Vec<Derivative>> {
    let derivatives = self.generator.generate(task.id, &task.source_reference).await?;

    if self.capability.supported(self.store.as_ref()).await {
      match self.commit_atomically(task, &derivatives).await {
        Err(Error::TransactionUnsupported(reason)) => {
          warn!(
            "Task {}: atomic commit rejected ({}), falling back to sequential writes",
            task.id, reason
          );
          self.capability.invalidate();
        }
        outcome => return outcome.map(|()| derivatives),
      }
    }
    self.commit_sequentially(task, &derivatives).await?;
    Ok(derivatives)
  }

  async fn commit_atomically(&self, task: &Task, derivatives: &[Derivative]) -> Result<()> {
    info!("Task {}: using atomic commit", task.id);
    let mut scope = self.store.begin().await?;

    match stage(scope.as_mut(), task.id, derivatives).await {
      Ok(()) => Ok(scope.commit().await?),
      Err(e) => {
        if let Err(rollback_err) = scope.rollback().await {
          error!("Task {}: rollback failed: {}", task.id, rollback_err);
        }
        Err(e.into())
      }
    }
  }

  async fn commit_sequentially(&self, task: &Task, derivatives: &[Derivative]) -> Result<()> {
    info!("Task {}: using sequential writes", task.id);
    let mut sink = RecordingSink::new(self.store.as_ref());
    let mut outcome = persist_all(&mut sink, derivatives).await;
    if outcome.is_ok() {
      outcome = self.store.mark_completed(task.id, &ids_of(derivatives)).await;
    }

    if let Err(e) = &outcome {
      self.compensate(task, sink.created(), e).await;
    }
    Ok(outcome?)
  }

  /// Removes derivative records written before a failure. Errors here are
  /// logged; the caller sees the failure that triggered compensation.
  async fn compensate(&self, task: &Task, created: &[Uuid], cause: &StoreError) {
    if created.is_empty() {
      return;
    }
    warn!(
      "Task {}: removing {} orphaned derivatives after failure: {}",
      task.id,
      created.len(),
      cause
    );
    match self.store.delete_derivatives(created).await {
      Ok(removed) => info!("Task {}: compensation removed {} derivatives", task.id, removed),
      Err(e) => error!("Task {}: compensation failed: {}", task.id, e),
    }
  }
}

fn ids_of(derivatives: &[Derivative]) -> Vec<Uuid> {
  derivatives.iter().map(|d| d.id).collect()
}

async fn persist_all<S>(sink: &mut S, derivatives: &[Derivative]) -> std::result::Result<(), StoreError>
where
  S: DerivativeSink + ?Sized,
{
  for derivative in derivatives {
    sink.persist(derivative).await?;
  }
  Ok(())
}

async fn stage(
  scope: &mut dyn AtomicScope,
  task_id: Uuid,
  derivatives: &[Derivative],
) -> std::result::Result<(), StoreError> {
  persist_all(&mut *scope, derivatives).await?;
  scope.mark_completed(task_id, &ids_of(derivatives)).await
}
