//! Submission and control API.

use std::sync::Arc;
use std::time::Duration;

use queue_core::{DEFAULT_QUEUE, Job, JobId, JobStatus, JobStore, StoreError};
use serde::Serialize;

use crate::cancellation::CancellationRegistry;
use crate::handler::JobPayload;

/// Errors returned by [`JobQueue`] operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Job {job_id} did not settle within {timeout:?}")]
    RestartTimeout { job_id: JobId, timeout: Duration },
    #[error("Job {0} disappeared while restarting")]
    Vanished(JobId),
}

/// Client-facing handle for submitting and controlling jobs.
pub struct JobQueue<S> {
    store: Arc<S>,
    cancellations: Arc<CancellationRegistry>,
    restart_poll_interval: Duration,
    restart_timeout: Duration,
}

impl<S> Clone for JobQueue<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            cancellations: self.cancellations.clone(),
            restart_poll_interval: self.restart_poll_interval,
            restart_timeout: self.restart_timeout,
        }
    }
}

impl<S: JobStore> JobQueue<S> {
    pub fn new(
        store: Arc<S>,
        cancellations: Arc<CancellationRegistry>,
        restart_poll_interval: Duration,
        restart_timeout: Duration,
    ) -> Self {
        Self {
            store,
            cancellations,
            restart_poll_interval,
            restart_timeout,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Submit to the default queue.
    pub async fn submit<P: JobPayload>(&self, payload: &P) -> Result<JobId, QueueError> {
        self.submit_to(DEFAULT_QUEUE, payload).await
    }

    /// Submit to a named queue.
    pub async fn submit_to<P: JobPayload>(
        &self,
        queue: &str,
        payload: &P,
    ) -> Result<JobId, QueueError> {
        let body = serde_json::to_string(payload)?;
        let job_id = self.store.insert(queue, P::PAYLOAD_TYPE, body).await?;
        tracing::debug!(%job_id, queue, payload_type = P::PAYLOAD_TYPE, "Submitted job");
        Ok(job_id)
    }

    /// Request cancellation of a running job.
    ///
    /// The request is recorded in the store for whichever process owns the
    /// job, and signalled locally right away. False if the job is not
    /// processing.
    pub async fn stop(&self, job_id: JobId) -> Result<bool, QueueError> {
        let requested = self.store.request_stop(job_id).await?;
        if requested {
            self.cancellations.request_cancel(job_id);
            tracing::info!(%job_id, "Stop requested");
        }
        Ok(requested)
    }

    /// Cancel the job if running, wait for it to settle, then reset it to pending.
    ///
    /// False if the job does not exist.
    pub async fn restart(&self, job_id: JobId) -> Result<bool, QueueError> {
        let Some(job) = self.store.get_by_id(job_id).await? else {
            return Ok(false);
        };

        match job.status {
            JobStatus::Pending => return Ok(true),
            JobStatus::Processing => {
                self.stop(job_id).await?;
                if !self.wait_until_settled(job_id).await? {
                    return Ok(true);
                }
            }
            _ => {}
        }

        let reset = self.store.mark_pending(job_id).await?;
        if reset {
            tracing::info!(%job_id, "Job restarted");
        }
        Ok(reset)
    }

    /// Poll until the job leaves `Processing`.
    ///
    /// Returns false when it went straight back to pending (reclaimed), so
    /// there is nothing left to reset.
    async fn wait_until_settled(&self, job_id: JobId) -> Result<bool, QueueError> {
        let poll = async {
            loop {
                match self.store.get_by_id(job_id).await? {
                    None => return Err(QueueError::Vanished(job_id)),
                    Some(job) if job.status.is_terminal() => return Ok(true),
                    Some(job) if job.status == JobStatus::Pending => return Ok(false),
                    Some(_) => tokio::time::sleep(self.restart_poll_interval).await,
                }
            }
        };

        tokio::time::timeout(self.restart_timeout, poll)
            .await
            .map_err(|_| QueueError::RestartTimeout {
                job_id,
                timeout: self.restart_timeout,
            })?
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.store.get_by_id(job_id).await?)
    }

    /// Overwrite a job's data. False when the job does not exist.
    pub async fn set_job_data<T: Serialize + ?Sized>(
        &self,
        job_id: JobId,
        value: &T,
    ) -> Result<bool, QueueError> {
        let data = serde_json::to_string(value)?;
        Ok(self.store.set_data(job_id, Some(data)).await?)
    }
}
