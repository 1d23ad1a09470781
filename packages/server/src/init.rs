//! Environment configuration and worker start-up.

use std::time::Duration;

use actors::{Scheduler, SchedulerHandle};
use db::{DbConfig, SurrealJobStore};
use queue_core::WorkerConfig;

use crate::handlers::{Echo, Fail, Sleep, demo_registry};

pub const ENV_WORKER_ID: &str = "JOBQUEUE_WORKER_ID";
pub const ENV_POLL_INTERVAL_MS: &str = "JOBQUEUE_POLL_INTERVAL_MS";
pub const ENV_QUEUES: &str = "JOBQUEUE_QUEUES";
pub const ENV_DB: &str = "JOBQUEUE_DB";
pub const ENV_DEMO: &str = "JOBQUEUE_DEMO";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be a number of milliseconds, got {value:?}")]
    InvalidInterval { var: &'static str, value: String },
    #[error("Invalid queue entry {0:?}; expected name=workers")]
    InvalidQueue(String),
}

/// Everything the worker host reads from the environment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub worker: WorkerConfig,
    pub db: DbConfig,
    /// Submit a few demo jobs after start-up.
    pub demo: bool,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut worker = match lookup(ENV_WORKER_ID) {
            Some(id) if !id.trim().is_empty() => WorkerConfig::new(id.trim()),
            _ => WorkerConfig::default(),
        };

        if let Some(value) = lookup(ENV_POLL_INTERVAL_MS) {
            let millis: u64 = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidInterval {
                    var: ENV_POLL_INTERVAL_MS,
                    value: value.clone(),
                })?;
            worker = worker.with_polling_interval(Duration::from_millis(millis));
        }

        if let Some(value) = lookup(ENV_QUEUES) {
            for (name, workers) in parse_queues(&value)? {
                worker = worker.with_queue(name, workers);
            }
        }

        let db = match lookup(ENV_DB) {
            Some(endpoint) if !endpoint.trim().is_empty() => DbConfig::endpoint(endpoint.trim()),
            _ => DbConfig::memory(),
        };

        let demo = lookup(ENV_DEMO).is_some_and(|v| matches!(v.trim(), "1" | "true" | "yes"));

        Ok(Self { worker, db, demo })
    }
}

/// Parse `name=workers,name=workers`. A bare name gets one worker.
pub fn parse_queues(value: &str) -> Result<Vec<(String, usize)>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((name, workers)) => {
                let name = name.trim();
                let workers = workers
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| ConfigError::InvalidQueue(entry.to_string()))?;
                if name.is_empty() {
                    return Err(ConfigError::InvalidQueue(entry.to_string()));
                }
                Ok((name.to_string(), workers))
            }
            None => Ok((entry.to_string(), 1)),
        })
        .collect()
}

/// Connect the store and start the scheduler with the demo handlers.
pub async fn start_worker(
    config: ServerConfig,
) -> Result<SchedulerHandle<SurrealJobStore>, Box<dyn std::error::Error>> {
    tracing::info!("Initializing job queue worker...");

    let store = db::init(config.db).await?;
    let scheduler = Scheduler::new(config.worker, store, demo_registry())
        .start()
        .await?;

    if config.demo {
        let queue = scheduler.queue();
        let echo = queue
            .submit(&Echo {
                message: "hello".to_string(),
            })
            .await?;
        let sleep = queue.submit(&Sleep { seconds: 3 }).await?;
        let fail = queue.submit(&Fail { fail: true }).await?;
        tracing::info!(%echo, %sleep, %fail, "Submitted demo jobs");
    }

    tracing::info!("Job queue worker initialized");
    Ok(scheduler)
}
