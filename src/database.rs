use sqlx::migrate::Migrator;
use sqlx::{Pool, Postgres};
use tokio_retry::Retry;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{info, warn};

use crate::store::StoreError;

static MIGRATOR: Migrator = sqlx::migrate!();

static MAX_RETRIES: usize = 5;
// Doubling from 100ms.
static RETRY_FACTOR: u64 = 50;

pub async fn setup_database(database_url: &str) -> Result<Pool<Postgres>, StoreError> {
  let pool = Retry::spawn(ExponentialBackoff::from_millis(2).factor(RETRY_FACTOR).take(MAX_RETRIES), move || async move {
    Pool::<Postgres>::connect(database_url).await.inspect_err(|e| {
      warn!("Database connection attempt failed: {}", e);
    })
  })
    .await?;

  MIGRATOR.run(&pool)
    .await
    .map_err(|e| StoreError::Backend(format!("failed to run database migrations: {}", e)))?;
  info!("Database migrations complete");
  Ok(pool)
}
