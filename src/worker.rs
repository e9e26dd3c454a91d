//! One-shot recovery: resets stuck tasks, then processes the pending backlog
//! one task at a time.

use anyhow::{Context, Result};
use tracing::info;
use imgq::{bootstrap, config::Config};

#[tokio::main]
async fn main() -> Result<()> {
  bootstrap::init_tracing();
  let config = Config::from_env().context("Failed to load configuration")?;
  config.require_database_url("the recovery worker")?;
  let (_engine, sweep) = bootstrap::assemble(&config).await?;

  let recovered = sweep.recover_stuck().await.context("Failed to recover stuck tasks")?;
  info!("Reset {} of {} stuck tasks to pending", recovered.succeeded, recovered.found);

  let redriven = sweep.redrive_pending().await.context("Failed to redrive pending tasks")?;
  info!(
    "Redrove {} pending tasks: {} completed, {} failed",
    redriven.found, redriven.succeeded, redriven.failed
  );
  Ok(())
}
