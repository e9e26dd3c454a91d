use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::consistency::{AtomicCapability, ConsistencyCoordinator};
use crate::database::setup_database;
use crate::derivatives::DerivativeGenerator;
use crate::fetch::SourceFetcher;
use crate::lifecycle::TaskEngine;
use crate::recovery::RecoverySweep;
use crate::store::{MemoryStore, PgStore, TaskStore};

pub fn init_tracing() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();
}

pub async fn connect_store(config: &Config) -> Result<Arc<dyn TaskStore>> {
  match &config.database_url {
    Some(url) => {
      let pool = setup_database(url).await.context("Failed to set up database")?;
      Ok(Arc::new(PgStore::new(pool)))
    }
    None => {
      warn!("DATABASE_URL not set, using a non-durable in-memory store");
      Ok(Arc::new(MemoryStore::new()))
    }
  }
}

pub fn build_engine(config: &Config, store: Arc<dyn TaskStore>) -> Arc<TaskEngine> {
  let fetcher = SourceFetcher::new(&config.temp_dir, config.download_timeout);
  let generator = DerivativeGenerator::new(fetcher, &config.output_dir);
  let coordinator = ConsistencyCoordinator::new(Arc::clone(&store), generator, Arc::new(AtomicCapability::new()));
  Arc::new(TaskEngine::new(store, coordinator))
}

pub fn build_sweep(config: &Config, engine: Arc<TaskEngine>) -> RecoverySweep {
  RecoverySweep::new(engine)
    .with_stale_after(config.stale_after)
    .with_batch_limit(config.recovery_batch_limit)
}

/// Connects the store and assembles the engine and its recovery sweep.
pub async fn assemble(config: &Config) -> Result<(Arc<TaskEngine>, Arc<RecoverySweep>)> {
  let store = connect_store(config).await?;
  let engine = build_engine(config, store);
  let sweep = Arc::new(build_sweep(config, Arc::clone(&engine)));
  info!(
    "Engine ready (output: {}, stale after {}s)",
    config.output_dir.display(),
    config.stale_after.as_secs()
  );
  Ok((engine, sweep))
}
