//! Worker host: serves the configured queues until Ctrl-C.

use tracing_subscriber::EnvFilter;

mod handlers;
mod init;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = init::ServerConfig::from_env()?;
    let scheduler = init::start_worker(config).await?;

    tracing::info!(worker_id = scheduler.worker_id(), "Worker running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    let reclaimed = scheduler.shutdown().await?;
    tracing::info!(reclaimed, "Worker shut down");
    Ok(())
}
