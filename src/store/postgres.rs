use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;
use uuid::Uuid;

use super::{AtomicScope, DerivativeSink, StoreError, TaskStore};
use crate::models::{Derivative, Price, Resolution, Task, TaskStatus};

const TASK_COLUMNS: &str =
  "id, status, price_cents, source_reference, derivative_ids, error_detail, created_at, updated_at";
const DERIVATIVE_COLUMNS: &str =
  "id, task_id, resolution, width, height, content_hash, storage_path, created_at";

#[derive(sqlx::FromRow)]
struct TaskRow {
  id: Uuid,
  status: String,
  price_cents: i32,
  source_reference: String,
  derivative_ids: Vec<Uuid>,
  error_detail: Option<String>,
  created_at: DateTime<Utc>,
  updated_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for Task {
  type Error = StoreError;

  fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
    let status = row.status.parse().map_err(StoreError::Corrupt)?;
    let price = u32::try_from(row.price_cents)
      .ok()
      .and_then(Price::from_cents)
      .ok_or_else(|| StoreError::Corrupt(format!("task {} has price_cents {}", row.id, row.price_cents)))?;
    Ok(Task {
      id: row.id,
      status,
      price,
      source_reference: row.source_reference,
      derivative_ids: row.derivative_ids,
      error_detail: row.error_detail,
      created_at: row.created_at,
      updated_at: row.updated_at,
    })
  }
}

#[derive(sqlx::FromRow)]
struct DerivativeRow {
  id: Uuid,
  task_id: Uuid,
  resolution: i32,
  width: i32,
  height: i32,
  content_hash: String,
  storage_path: String,
  created_at: DateTime<Utc>,
}

impl TryFrom<DerivativeRow> for Derivative {
  type Error = StoreError;

  fn try_from(row: DerivativeRow) -> Result<Self, Self::Error> {
    let corrupt = |what: &str| StoreError::Corrupt(format!("derivative {} has invalid {}", row.id, what));
    let resolution = u32::try_from(row.resolution)
      .ok()
      .and_then(Resolution::from_width)
      .ok_or_else(|| corrupt("resolution"))?;
    let width = u32::try_from(row.width).map_err(|_| corrupt("width"))?;
    let height = u32::try_from(row.height).map_err(|_| corrupt("height"))?;
    Ok(Derivative {
      id: row.id,
      task_id: row.task_id,
      resolution,
      width,
      height,
      content_hash: row.content_hash,
      storage_path: row.storage_path,
      created_at: row.created_at,
    })
  }
}

/// Maps errors that mean "this deployment cannot run the transaction" onto
/// [`StoreError::TransactionUnsupported`].
fn classify(err: sqlx::Error) -> StoreError {
  if let sqlx::Error::Database(db_err) = &err {
    if matches!(db_err.code().as_deref(), Some("0A000") | Some("25P01")) {
      return StoreError::TransactionUnsupported(db_err.message().to_string());
    }
  }
  StoreError::Database(err)
}

fn limit_param(limit: usize) -> i64 {
  i64::try_from(limit).unwrap_or(i64::MAX)
}

#[derive(Debug, Clone)]
pub struct PgStore {
  pool: PgPool,
}

impl PgStore {
  pub fn new(pool: PgPool) -> Self {
    Self { pool }
  }

  pub fn pool(&self) -> &PgPool {
    &self.pool
  }
}

async fn insert_derivative_with<'e, E>(executor: E, derivative: &Derivative) -> Result<(), sqlx::Error>
where
  E: sqlx::Executor<'e, Database = Postgres>,
{
  sqlx::query(
    "INSERT INTO derivatives (id, task_id, resolution, width, height, content_hash, storage_path, created_at)
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
  )
  .bind(derivative.id)
  .bind(derivative.task_id)
  .bind(derivative.resolution.width() as i32)
  .bind(derivative.width as i32)
  .bind(derivative.height as i32)
  .bind(&derivative.content_hash)
  .bind(&derivative.storage_path)
  .bind(derivative.created_at)
  .execute(executor)
  .await?;
  Ok(())
}

/// Completion, pruning of unreferenced derivatives and the "already completed"
/// guard in a single statement, so it is atomic even outside a transaction.
async fn complete_with<'e, E>(executor: E, task_id: Uuid, derivative_ids: &[Uuid]) -> Result<(), StoreError>
where
  E: sqlx::Executor<'e, Database = Postgres>,
{
  let (completed, known): (bool, bool) = sqlx::query_as(
    "WITH done AS (
       UPDATE tasks SET status = 'completed', derivative_ids = $1, error_detail = NULL, updated_at = NOW()
       WHERE id = $2 AND status <> 'completed'
       RETURNING id
     ), pruned AS (
       DELETE FROM derivatives WHERE task_id IN (SELECT id FROM done) AND id <> ALL($1)
     )
     SELECT EXISTS (SELECT 1 FROM done), EXISTS (SELECT 1 FROM tasks WHERE id = $2)",
  )
  .bind(derivative_ids)
  .bind(task_id)
  .fetch_one(executor)
  .await
  .map_err(classify)?;
  match (completed, known) {
    (true, _) => Ok(()),
    (false, true) => Err(StoreError::Superseded(task_id)),
    (false, false) => Err(StoreError::MissingTask(task_id)),
  }
}

#[async_trait]
impl TaskStore for PgStore {
  async fn insert_task(&self, task: &Task) -> Result<(), StoreError> {
    sqlx::query(
      "INSERT INTO tasks (id, status, price_cents, source_reference, derivative_ids, error_detail, created_at, updated_at)
       VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(task.id)
    .bind(task.status.as_str())
    .bind(task.price.cents() as i32)
    .bind(&task.source_reference)
    .bind(&task.derivative_ids)
    .bind(&task.error_detail)
    .bind(task.created_at)
    .bind(task.updated_at)
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  async fn find_task(&self, task_id: Uuid) -> Result<Option<Task>, StoreError> {
    let row: Option<TaskRow> = sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
      .bind(task_id)
      .fetch_optional(&self.pool)
      .await?;
    row.map(Task::try_from).transpose()
  }

  async fn update_status(&self, task_id: Uuid, status: TaskStatus) -> Result<(), StoreError> {
    sqlx::query("UPDATE tasks SET status = $1, updated_at = NOW() WHERE id = $2")
      .bind(status.as_str())
      .bind(task_id)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn mark_completed(&self, task_id: Uuid, derivative_ids: &[Uuid]) -> Result<(), StoreError> {
    complete_with(&self.pool, task_id, derivative_ids).await
  }

  async fn mark_failed(&self, task_id: Uuid, error_detail: &str) -> Result<(), StoreError> {
    sqlx::query("UPDATE tasks SET status = 'failed', error_detail = $1, updated_at = NOW()
       WHERE id = $2 AND status <> 'completed'")
      .bind(error_detail)
      .bind(task_id)
      .execute(&self.pool)
      .await?;
    Ok(())
  }

  async fn list_by_status(&self, status: TaskStatus, limit: usize) -> Result<Vec<Task>, StoreError> {
    let rows: Vec<TaskRow> = sqlx::query_as(&format!(
      "SELECT {TASK_COLUMNS} FROM tasks WHERE status = $1 ORDER BY updated_at, created_at LIMIT $2"
    ))
    .bind(status.as_str())
    .bind(limit_param(limit))
    .fetch_all(&self.pool)
    .await?;
    rows.into_iter().map(Task::try_from).collect()
  }

  async fn list_stale(
    &self,
    status: TaskStatus,
    updated_before: DateTime<Utc>,
    limit: usize,
  ) -> Result<Vec<Task>, StoreError> {
    let rows: Vec<TaskRow> = sqlx::query_as(&format!(
      "SELECT {TASK_COLUMNS} FROM tasks WHERE status = $1 AND updated_at < $2 ORDER BY updated_at LIMIT $3"
    ))
    .bind(status.as_str())
    .bind(updated_before)
    .bind(limit_param(limit))
    .fetch_all(&self.pool)
    .await?;
    rows.into_iter().map(Task::try_from).collect()
  }

  async fn count_by_status(&self) -> Result<Vec<(TaskStatus, u64)>, StoreError> {
    let rows: Vec<(String, i64)> = sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status")
      .fetch_all(&self.pool)
      .await?;
    let mut counts: Vec<(TaskStatus, u64)> = TaskStatus::ALL.into_iter().map(|s| (s, 0)).collect();
    for (status, count) in rows {
      let status: TaskStatus = status.parse().map_err(StoreError::Corrupt)?;
      if let Some(entry) = counts.iter_mut().find(|(s, _)| *s == status) {
        entry.1 = count.max(0) as u64;
      }
    }
    Ok(counts)
  }

  async fn insert_derivative(&self, derivative: &Derivative) -> Result<(), StoreError> {
    insert_derivative_with(&self.pool, derivative).await?;
    Ok(())
  }

  async fn list_derivatives(&self, task_id: Uuid) -> Result<Vec<Derivative>, StoreError> {
    let rows: Vec<DerivativeRow> = sqlx::query_as(&format!(
      "SELECT {DERIVATIVE_COLUMNS} FROM derivatives WHERE task_id = $1 ORDER BY created_at"
    ))
    .bind(task_id)
    .fetch_all(&self.pool)
    .await?;
    rows.into_iter().map(Derivative::try_from).collect()
  }

  async fn delete_derivatives(&self, derivative_ids: &[Uuid]) -> Result<u64, StoreError> {
    let result = sqlx::query("DELETE FROM derivatives WHERE id = ANY($1)")
      .bind(derivative_ids)
      .execute(&self.pool)
      .await?;
    Ok(result.rows_affected())
  }

  /// A `BEGIN`/`ROLLBACK` round-trip. Deployments that accept it but refuse
  /// the real transaction later are caught by [`classify`] on the SQLSTATE.
  async fn supports_atomic_commit(&self) -> Result<bool, StoreError> {
    let tx = match self.pool.begin().await.map_err(classify) {
      Ok(tx) => tx,
      Err(StoreError::TransactionUnsupported(reason)) => {
        debug!("Postgres refused BEGIN: {}", reason);
        return Ok(false);
      }
      Err(e) => return Err(e),
    };
    tx.rollback().await.map_err(classify)?;
    Ok(true)
  }

  async fn begin(&self) -> Result<Box<dyn AtomicScope + '_>, StoreError> {
    let tx = self.pool.begin().await.map_err(classify)?;
    Ok(Box::new(PgScope { tx }))
  }
}

struct PgScope {
  tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl DerivativeSink for PgScope {
  async fn persist(&mut self, derivative: &Derivative) -> Result<(), StoreError> {
    insert_derivative_with(&mut *self.tx, derivative).await.map_err(classify)
  }
}

#[async_trait]
impl AtomicScope for PgScope {
  async fn mark_completed(&mut self, task_id: Uuid, derivative_ids: &[Uuid]) -> Result<(), StoreError> {
    complete_with(&mut *self.tx, task_id, derivative_ids).await
  }

  async fn commit(self: Box<Self>) -> Result<(), StoreError> {
    let PgScope { tx } = *self;
    tx.commit().await.map_err(classify)
  }

  async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
    let PgScope { tx } = *self;
    tx.rollback().await.map_err(classify)
  }
}
