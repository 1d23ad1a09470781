//! Queue and worker-process configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Queue used when a submission does not name one.
pub const DEFAULT_QUEUE: &str = "default";

/// Configuration for one queue served by this process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Number of concurrent worker slots for this queue.
    pub workers: usize,
}

impl QueueConfig {
    pub fn new(workers: usize) -> Self {
        Self { workers }
    }

    /// Worker count with the at-least-one floor applied.
    pub fn effective_workers(&self) -> usize {
        self.workers.max(1)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { workers: 1 }
    }
}

/// Configuration for a worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Identity stamped on every job this process claims.
    pub worker_id: String,
    /// Admission controller tick interval (milliseconds).
    pub polling_interval_ms: u64,
    /// Delay before the first admission tick (milliseconds).
    pub warmup_delay_ms: u64,
    /// Stop-request sweeper tick interval (milliseconds).
    pub stop_polling_interval_ms: u64,
    /// How often `restart` re-reads a job while waiting for it to settle (milliseconds).
    pub restart_poll_interval_ms: u64,
    /// Upper bound on how long `restart` waits for a terminal state (seconds).
    pub restart_timeout_secs: u64,
    /// How long a cancelled handler may keep running before it is abandoned (milliseconds).
    pub cancel_grace_period_ms: u64,
    /// Queues served by this process.
    pub queues: BTreeMap<String, QueueConfig>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Ulid::new()),
            polling_interval_ms: 1000,
            warmup_delay_ms: 2000,
            stop_polling_interval_ms: 100,
            restart_poll_interval_ms: 100,
            restart_timeout_secs: 60,
            cancel_grace_period_ms: 30_000,
            queues: BTreeMap::new(),
        }
    }
}

impl WorkerConfig {
    /// Create a config with the given process identity.
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }

    /// Serve a queue with the given number of worker slots.
    pub fn with_queue(mut self, name: impl Into<String>, workers: usize) -> Self {
        self.queues.insert(name.into(), QueueConfig::new(workers));
        self
    }

    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_warmup_delay(mut self, delay: Duration) -> Self {
        self.warmup_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_stop_polling_interval(mut self, interval: Duration) -> Self {
        self.stop_polling_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_restart_timeout(mut self, timeout: Duration) -> Self {
        self.restart_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_cancel_grace_period(mut self, grace: Duration) -> Self {
        self.cancel_grace_period_ms = grace.as_millis() as u64;
        self
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms.max(1))
    }

    pub fn warmup_delay(&self) -> Duration {
        Duration::from_millis(self.warmup_delay_ms)
    }

    pub fn stop_polling_interval(&self) -> Duration {
        Duration::from_millis(self.stop_polling_interval_ms.max(1))
    }

    pub fn restart_poll_interval(&self) -> Duration {
        Duration::from_millis(self.restart_poll_interval_ms.max(1))
    }

    pub fn restart_timeout(&self) -> Duration {
        Duration::from_secs(self.restart_timeout_secs)
    }

    pub fn cancel_grace_period(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_period_ms)
    }

    /// Queues with their effective worker counts; the default queue when none are configured.
    pub fn queue_workers(&self) -> Vec<(String, usize)> {
        if self.queues.is_empty() {
            return vec![(DEFAULT_QUEUE.to_string(), QueueConfig::default().effective_workers())];
        }
        self.queues
            .iter()
            .map(|(name, queue)| (name.clone(), queue.effective_workers()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_count_is_at_least_one() {
        let config = WorkerConfig::new("w").with_queue("mail", 0).with_queue("default", 4);
        let queues = config.queue_workers();
        assert_eq!(
            queues,
            vec![("default".to_string(), 4), ("mail".to_string(), 1)]
        );
    }

    #[test]
    fn empty_config_serves_default_queue() {
        let config = WorkerConfig::new("w");
        assert_eq!(config.queue_workers(), vec![(DEFAULT_QUEUE.to_string(), 1)]);
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: WorkerConfig = serde_json::from_str(
            r#"{ "worker_id": "host-a", "queues": { "default": { "workers": 3 } } }"#,
        )
        .unwrap();
        assert_eq!(config.worker_id, "host-a");
        assert_eq!(config.polling_interval(), Duration::from_millis(1000));
        assert_eq!(config.stop_polling_interval(), Duration::from_millis(100));
        assert_eq!(config.cancel_grace_period(), Duration::from_secs(30));
        assert_eq!(config.queues["default"].workers, 3);
    }
}
