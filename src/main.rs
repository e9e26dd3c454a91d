use anyhow::{Context, Result};
use tracing::{error, info};
use imgq::{bootstrap, config::Config, routes::routes};

#[tokio::main]
async fn main() -> Result<()> {
  bootstrap::init_tracing();
  let config = Config::from_env().context("Failed to load configuration")?;
  let (engine, sweep) = bootstrap::assemble(&config).await?;

  match sweep.recover_stuck().await {
    Ok(report) => info!("Startup recovery reset {} of {} stuck tasks", report.succeeded, report.found),
    Err(e) => error!("Startup recovery failed: {}", e),
  }

  if config.redrive_on_boot {
    let sweep = sweep.clone();
    tokio::spawn(async move {
      if let Err(e) = sweep.redrive_pending().await {
        error!("Redrive of pending tasks failed: {}", e);
      }
    });
  }

  if let Some(interval) = config.recovery_interval {
    info!("Running recovery sweep every {}s", interval.as_secs());
    sweep.clone().spawn_periodic(interval);
  }

  info!("Listening on port {}", config.server_port);
  warp::serve(routes(engine))
    .run(([0, 0, 0, 0], config.server_port))
    .await;
  Ok(())
}
