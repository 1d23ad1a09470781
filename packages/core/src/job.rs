//! Job domain types and the job state machine.

use std::error::Error as StdError;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unique identifier for a job, using ULID for chronological sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Ulid);

impl JobId {
    /// Create a new unique job ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a job ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current status of a job in its lifecycle.
///
/// ```text
/// Pending ──claim──► Processing ──► Completed | Failed | Stopped
///    ▲                   │                    │
///    └──── restart / reclaim ◄────────────────┘
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job is waiting to be claimed.
    #[default]
    Pending,
    /// Job is claimed by a worker and running.
    Processing,
    /// Handler returned normally.
    Completed,
    /// Handler failed, the payload could not be resolved, or the worker shut down mid-job.
    Failed,
    /// Job was cancelled on request.
    Stopped,
}

impl JobStatus {
    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Stopped
        )
    }

    /// Get a simple status string, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Stopped => "stopped",
        }
    }

    /// Whether a job may move from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Pending, JobStatus::Processing) => true,
            (JobStatus::Processing, next) if next.is_terminal() => true,
            (from, JobStatus::Pending) => *from != JobStatus::Pending,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted description of a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// The error's display text.
    pub message: String,
    /// Debug rendering, source chain and (when enabled) a backtrace.
    pub stacktrace: String,
}

impl ErrorInfo {
    pub fn new(message: impl Into<String>, stacktrace: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stacktrace: stacktrace.into(),
        }
    }

    /// Build failure info from an error and its `source()` chain.
    ///
    /// A backtrace is appended only when `RUST_BACKTRACE` enables capture.
    pub fn from_error(err: &(dyn StdError + 'static)) -> Self {
        let mut stacktrace = format!("{:?}", err);

        let mut source = err.source();
        if source.is_some() {
            stacktrace.push_str("\n\nCaused by:");
        }
        let mut depth = 0;
        while let Some(cause) = source {
            let _ = write!(stacktrace, "\n    {}: {}", depth, cause);
            depth += 1;
            source = cause.source();
        }

        let backtrace = std::backtrace::Backtrace::capture();
        if backtrace.status() == std::backtrace::BacktraceStatus::Captured {
            let _ = write!(stacktrace, "\n\nStack backtrace:\n{}", backtrace);
        }

        Self {
            message: err.to_string(),
            stacktrace,
        }
    }
}

/// Error returned when a state-machine transition is not allowed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Job {job_id} cannot move from {from} to {to}")]
pub struct TransitionError {
    pub job_id: JobId,
    pub from: JobStatus,
    pub to: JobStatus,
}

/// A job is the unit of work and its status record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier, immutable after creation.
    pub id: JobId,
    /// Queue this job is scheduled on.
    pub queue: String,
    /// Current status.
    pub status: JobStatus,
    /// Serialized request body.
    pub payload: String,
    /// Tag used to resolve the handler.
    pub payload_type: String,
    /// Claim owner, set only while `Processing`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    /// Serialized progress or result value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_stacktrace: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when a stop was requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new pending job.
    pub fn new(
        queue: impl Into<String>,
        payload_type: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            queue: queue.into(),
            status: JobStatus::Pending,
            payload: payload.into(),
            payload_type: payload_type.into(),
            worker_id: None,
            data: None,
            exception_message: None,
            exception_stacktrace: None,
            created_at: now,
            updated_at: now,
            stopped_at: None,
        }
    }

    /// Decode `data` into a caller type. `Ok(None)` when no data was written.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        self.data
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
    }

    /// Whether a stop has been requested while the job is running.
    pub fn is_stop_requested(&self) -> bool {
        self.status == JobStatus::Processing && self.stopped_at.is_some()
    }

    fn transition(&mut self, to: JobStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError {
                job_id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Pending → Processing, stamping the claim owner.
    pub fn claim(&mut self, worker_id: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(JobStatus::Processing)?;
        self.worker_id = Some(worker_id.into());
        Ok(())
    }

    /// Processing → Completed, overwriting data with the result.
    pub fn complete(&mut self, data: Option<String>) -> Result<(), TransitionError> {
        self.transition(JobStatus::Completed)?;
        self.worker_id = None;
        self.data = data;
        Ok(())
    }

    /// Processing → Failed.
    pub fn fail(&mut self, error: ErrorInfo) -> Result<(), TransitionError> {
        self.transition(JobStatus::Failed)?;
        self.worker_id = None;
        self.exception_message = Some(error.message);
        self.exception_stacktrace = Some(error.stacktrace);
        Ok(())
    }

    /// Processing → Stopped.
    pub fn stop(&mut self) -> Result<(), TransitionError> {
        self.transition(JobStatus::Stopped)?;
        self.worker_id = None;
        self.stopped_at.get_or_insert(self.updated_at);
        Ok(())
    }

    /// Back to Pending, clearing claim, result and failure fields.
    pub fn reset(&mut self) -> Result<(), TransitionError> {
        if self.status != JobStatus::Pending {
            self.transition(JobStatus::Pending)?;
        }
        self.worker_id = None;
        self.data = None;
        self.exception_message = None;
        self.exception_stacktrace = None;
        self.stopped_at = None;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record a stop request on a running job. Returns false if not running.
    pub fn request_stop(&mut self) -> bool {
        if self.status != JobStatus::Processing {
            return false;
        }
        let now = Utc::now();
        self.stopped_at.get_or_insert(now);
        self.updated_at = now;
        true
    }

    /// Overwrite progress data.
    pub fn set_data(&mut self, data: Option<String>) {
        self.data = data;
        self.updated_at = Utc::now();
    }
}
